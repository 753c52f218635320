//! Per-client embedded Lua VM.
//!
//! A scripted device type names a Lua file; every client of that type gets
//! its own VM. Loading the file defines the device's actions as top-level
//! functions. Functions whose names start with `_` stay private (they can
//! still be run internally, like `_login`); the rest become the client's
//! exported actions, callable over HTTP.
//!
//! The I/O primitives mirror the action DSL and suspend through the same
//! yield channel, so a script reads as straight-line code:
//!
//! ```lua
//! function _login()
//!     expect("login: ")  send(CONFIG.user .. "\n")
//!     expect("pass: ")   send(CONFIG.pass .. "\n")
//!     expect("> ")
//! end
//!
//! function detail()
//!     send("status\n")
//!     need(4)
//!     return "OK", 200, "text/plain"
//! end
//! ```

use crate::action::{self, CommError};
use crate::conn::Shared;
use crate::coro::CoroCtx;
use droverconf::duration_value_ms;
use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Value as LuaValue};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// What running an action produced, in the shape the HTTP layer consumes.
///
/// `nret == 0` means the action returned no values; the HTTP layer then
/// reports 200 with an empty body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionResult {
    pub text: String,
    pub content_type: String,
    pub status: u16,
    pub error: bool,
    pub nret: usize,
}

impl ActionResult {
    /// The effective HTTP status: explicit value, else 500 on error,
    /// else 200.
    pub fn http_status(&self) -> u16 {
        if self.status != 0 {
            self.status
        } else if self.error {
            500
        } else {
            200
        }
    }

    pub(crate) fn from_error(message: String) -> Self {
        Self {
            text: message,
            status: 500,
            error: true,
            ..Default::default()
        }
    }
}

/// One client's Lua VM plus the set of actions its script exports.
pub(crate) struct ScriptVm {
    lua: Lua,
    exports: HashSet<String>,
}

impl ScriptVm {
    /// Load a script file and enumerate its exported actions. `config` is
    /// the client's raw device config, bound as the global `CONFIG`.
    pub fn load(
        path: &Path,
        sh: Arc<Shared>,
        ctx: CoroCtx,
        config: &Value,
    ) -> Result<Self, String> {
        let source = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let chunk_name = path.display().to_string();
        Self::load_source(&source, &chunk_name, sh, ctx, config)
    }

    fn load_source(
        source: &str,
        chunk_name: &str,
        sh: Arc<Shared>,
        ctx: CoroCtx,
        config: &Value,
    ) -> Result<Self, String> {
        let lua = Lua::new();
        register_primitives(&lua, Arc::clone(&sh), ctx).map_err(|e| e.to_string())?;

        // snapshot the globals so only script-defined functions export
        let baseline = global_function_names(&lua).map_err(|e| e.to_string())?;

        lua.load(source)
            .set_name(chunk_name)
            .exec()
            .map_err(|e| e.to_string())?;

        let mut exports = HashSet::new();
        for name in global_function_names(&lua).map_err(|e| e.to_string())? {
            if !baseline.contains(&name) && !name.starts_with('_') {
                debug!(client = %sh.name, action = %name, "script action");
                exports.insert(name);
            }
        }

        let cfg = lua.to_value(config).map_err(|e| e.to_string())?;
        lua.globals()
            .set("CONFIG", cfg)
            .map_err(|e| e.to_string())?;

        Ok(Self { lua, exports })
    }

    pub fn exports(&self) -> &HashSet<String> {
        &self.exports
    }

    /// Whether `name` is callable at all, exported or not.
    pub fn has_function(&self, name: &str) -> bool {
        self.lua.globals().get::<Function>(name).is_ok()
    }

    /// Build the job future for calling `name(params?)`. Script errors do
    /// not abort the job future; they fold into an error result.
    pub fn call(
        &self,
        name: &str,
        params: Option<&Value>,
    ) -> Result<Pin<Box<dyn Future<Output = ActionResult> + Send>>, String> {
        let func: Function = self
            .lua
            .globals()
            .get(name)
            .map_err(|_| format!("not a function: {name}"))?;
        let args = params
            .map(|p| self.lua.to_value(p))
            .transpose()
            .map_err(|e| e.to_string())?;

        Ok(Box::pin(async move {
            let called = match args {
                Some(a) => func.call_async::<MultiValue>(a).await,
                None => func.call_async::<MultiValue>(()).await,
            };
            match called {
                Ok(mv) => import_result(mv),
                Err(e) => ActionResult::from_error(e.to_string()),
            }
        }))
    }
}

fn global_function_names(lua: &Lua) -> mlua::Result<HashSet<String>> {
    let mut out = HashSet::new();
    for pair in lua.globals().pairs::<LuaValue, LuaValue>() {
        let (k, v) = pair?;
        if let (LuaValue::String(name), LuaValue::Function(_)) = (k, v) {
            out.insert(String::from_utf8_lossy(&name.as_bytes()).into_owned());
        }
    }
    Ok(out)
}

fn comm_err(e: CommError) -> mlua::Error {
    mlua::Error::RuntimeError(e.to_string())
}

/// Register the device-facing primitives as globals. Blocking ones are
/// async and suspend through the client's yield channel; from the script
/// author's view they are synchronous.
fn register_primitives(lua: &Lua, sh: Arc<Shared>, ctx: CoroCtx) -> mlua::Result<()> {
    let globals = lua.globals();

    let s = Arc::clone(&sh);
    let c = ctx.clone();
    globals.set(
        "expect",
        lua.create_async_function(move |_, text: mlua::String| {
            let s = Arc::clone(&s);
            let c = c.clone();
            let want = text.as_bytes().to_vec();
            async move {
                action::expect_bytes(&s, &c, &want)
                    .await
                    .map(|n| n as i64)
                    .map_err(comm_err)
            }
        })?,
    )?;

    let s = Arc::clone(&sh);
    globals.set(
        "match",
        lua.create_function(move |_, pattern: String| {
            let re = action::compile_anchored(&pattern)
                .map_err(mlua::Error::RuntimeError)?;
            action::match_buffer(&s, &re, &pattern)
                .map(|n| n as i64)
                .map_err(comm_err)
        })?,
    )?;

    let s = Arc::clone(&sh);
    let c = ctx.clone();
    globals.set(
        "skip",
        lua.create_async_function(move |_, count: u64| {
            let s = Arc::clone(&s);
            let c = c.clone();
            async move {
                action::skip_bytes(&s, &c, count)
                    .await
                    .map(|n| n as i64)
                    .map_err(comm_err)
            }
        })?,
    )?;

    let s = Arc::clone(&sh);
    globals.set(
        "skipall",
        lua.create_function(move |_, ()| Ok(s.skip_all() as i64))?,
    )?;

    let c = ctx.clone();
    globals.set(
        "wait",
        lua.create_async_function(move |_, arg: LuaValue| {
            let c = c.clone();
            async move {
                let ms = match &arg {
                    LuaValue::Integer(n) if *n >= 0 => *n as u64,
                    LuaValue::Number(n) if *n >= 0.0 => *n as u64,
                    LuaValue::String(s) => {
                        let text = String::from_utf8_lossy(&s.as_bytes()).into_owned();
                        duration_value_ms(&Value::String(text))
                            .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?
                    }
                    _ => {
                        return Err(mlua::Error::RuntimeError(
                            "wait() takes milliseconds or a duration string".into(),
                        ))
                    }
                };
                c.sleep(ms).await;
                Ok(())
            }
        })?,
    )?;

    let s = Arc::clone(&sh);
    let c = ctx.clone();
    globals.set(
        "need",
        lua.create_async_function(move |_, count: u64| {
            let s = Arc::clone(&s);
            let c = c.clone();
            async move {
                action::need_bytes(&s, &c, count).await.map_err(comm_err)?;
                Ok(())
            }
        })?,
    )?;

    let s = Arc::clone(&sh);
    let c = ctx.clone();
    globals.set(
        "send",
        lua.create_async_function(move |_, text: mlua::String| {
            let s = Arc::clone(&s);
            let c = c.clone();
            let data = text.as_bytes().to_vec();
            async move {
                action::send_bytes(&s, &c, &data)
                    .await
                    .map(|n| n as i64)
                    .map_err(comm_err)
            }
        })?,
    )?;

    let s = Arc::clone(&sh);
    globals.set(
        "getStateName",
        lua.create_function(move |_, ()| Ok(s.state().name()))?,
    )?;

    let s = Arc::clone(&sh);
    globals.set(
        "availableInput",
        lua.create_function(move |_, ()| Ok(s.avail_input() as i64))?,
    )?;

    let s = Arc::clone(&sh);
    globals.set(
        "log",
        lua.create_function(move |_, msg: String| {
            tracing::info!(target: "drover::script", client = %s.name, "{}", msg);
            Ok(())
        })?,
    )?;

    Ok(())
}

/// Fold a script's return values into an [`ActionResult`].
///
/// Up to three values are accepted in any order: one string body, one
/// integer status, one further string content type. A bare integer is
/// just a status. The following are all fine:
///
/// ```lua
/// return 404
/// return text, 200
/// return text, 200, "application/json"
/// return text, "text/html", 201
/// ```
fn import_result(mv: MultiValue) -> ActionResult {
    let mut res = ActionResult {
        nret: mv.len(),
        ..Default::default()
    };
    let vals: Vec<LuaValue> = mv.into_iter().collect();

    match vals.first() {
        Some(LuaValue::String(s)) => {
            res.text = String::from_utf8_lossy(&s.as_bytes()).into_owned();
        }
        Some(LuaValue::Integer(n)) => res.status = clamp_status(*n),
        Some(LuaValue::Number(n)) => res.status = clamp_status(*n as i64),
        _ => {}
    }

    for v in vals.iter().skip(1).take(2) {
        match v {
            LuaValue::Integer(n) if res.status == 0 => res.status = clamp_status(*n),
            LuaValue::Number(n) if res.status == 0 => res.status = clamp_status(*n as i64),
            LuaValue::String(s) if res.content_type.is_empty() => {
                res.content_type = String::from_utf8_lossy(&s.as_bytes()).into_owned();
            }
            _ => {}
        }
    }

    res
}

fn clamp_status(n: i64) -> u16 {
    n.clamp(0, u16::MAX as i64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{Coro, Step};
    use serde_json::json;

    fn vm_with(source: &str) -> (ScriptVm, Arc<Shared>, CoroCtx) {
        let sh = Arc::new(Shared::new("test".into(), 10));
        let ctx = CoroCtx::new();
        let vm = ScriptVm::load_source(
            source,
            "test.lua",
            Arc::clone(&sh),
            ctx.clone(),
            &json!({"host": "10.0.0.5", "port": 23, "user": "admin"}),
        )
        .unwrap();
        (vm, sh, ctx)
    }

    fn run(vm: &ScriptVm, ctx: &CoroCtx, name: &str) -> ActionResult {
        let fut = vm.call(name, None).unwrap();
        let mut co = Coro::spawn(ctx, fut);
        for _ in 0..100 {
            if let Step::Done(res) = co.resume(0) {
                return res;
            }
        }
        panic!("action {name} did not finish");
    }

    #[test]
    fn test_exports_skip_underscore_and_builtins() {
        let (vm, _, _) = vm_with(
            r#"
            function _login() end
            function detail() return "d" end
            function reboot() return 200 end
            helper = 42
            "#,
        );
        let mut names: Vec<_> = vm.exports().iter().cloned().collect();
        names.sort();
        assert_eq!(names, ["detail", "reboot"]);
        // _login is callable even though it is not exported
        assert!(vm.has_function("_login"));
        assert!(!vm.has_function("no_such"));
    }

    #[test]
    fn test_result_no_values_defaults_to_200() {
        let (vm, _, ctx) = vm_with("function ping() end");
        let res = run(&vm, &ctx, "ping");
        assert_eq!(res.nret, 0);
        assert!(!res.error);
        assert_eq!(res.http_status(), 200);
        assert!(res.text.is_empty());
    }

    #[test]
    fn test_result_bare_status() {
        let (vm, _, ctx) = vm_with("function gone() return 404 end");
        let res = run(&vm, &ctx, "gone");
        assert_eq!(res.status, 404);
        assert!(res.text.is_empty());
    }

    #[test]
    fn test_result_text_and_status() {
        let (vm, _, ctx) = vm_with(r#"function f() return "body", 201 end"#);
        let res = run(&vm, &ctx, "f");
        assert_eq!(res.text, "body");
        assert_eq!(res.status, 201);
    }

    #[test]
    fn test_result_any_order_content_type() {
        let (vm, _, ctx) = vm_with(
            r#"
            function a() return "x", 200, "application/json" end
            function b() return "y", "text/html", 201 end
            "#,
        );
        let res = run(&vm, &ctx, "a");
        assert_eq!((res.status, res.content_type.as_str()), (200, "application/json"));
        let res = run(&vm, &ctx, "b");
        assert_eq!((res.status, res.content_type.as_str()), (201, "text/html"));
    }

    #[test]
    fn test_script_error_is_500() {
        let (vm, _, ctx) = vm_with(r#"function boom() error("kaput") end"#);
        let res = run(&vm, &ctx, "boom");
        assert!(res.error);
        assert_eq!(res.http_status(), 500);
        assert!(res.text.contains("kaput"));
    }

    #[test]
    fn test_config_global_is_bound() {
        let (vm, _, ctx) = vm_with(r#"function who() return CONFIG.user .. "@" .. CONFIG.host end"#);
        let res = run(&vm, &ctx, "who");
        assert_eq!(res.text, "admin@10.0.0.5");
    }

    #[test]
    fn test_buffer_primitives() {
        let (vm, sh, ctx) = vm_with(
            r#"
            function peek()
                local n = availableInput()
                local dropped = skipall()
                return tostring(n) .. "/" .. tostring(dropped), 200
            end
            "#,
        );
        sh.push_input(b"12345");
        let res = run(&vm, &ctx, "peek");
        assert_eq!(res.text, "5/5");
        assert_eq!(sh.avail_input(), 0);
    }

    #[test]
    fn test_wait_primitive_suspends_with_duration() {
        let (vm, _, ctx) = vm_with(r#"function nap() wait("30ms") return 200 end"#);
        let fut = vm.call("nap", None).unwrap();
        let mut co = Coro::spawn(&ctx, fut);
        match co.resume(0) {
            Step::Yielded(ms) => assert_eq!(ms, 30),
            Step::Done(_) => panic!("expected suspension"),
        }
        match co.resume(0) {
            Step::Done(res) => assert_eq!(res.status, 200),
            Step::Yielded(_) => panic!("expected completion"),
        }
    }

    #[test]
    fn test_match_primitive_fails_as_error() {
        let (vm, sh, ctx) = vm_with(
            r#"
            function probe()
                match("^OK")
                return 200
            end
            "#,
        );
        sh.push_input(b"NO");
        let res = run(&vm, &ctx, "probe");
        assert!(res.error);
        assert_eq!(res.http_status(), 500);
    }

    #[test]
    fn test_state_name_primitive() {
        let (vm, _, ctx) = vm_with(r#"function st() return getStateName() end"#);
        let res = run(&vm, &ctx, "st");
        assert_eq!(res.text, "DISCONNECTED");
    }

    #[test]
    fn test_params_reach_the_script() {
        let (vm, _, ctx) = vm_with(r#"function echo(p) return p.key end"#);
        let fut = vm.call("echo", Some(&json!({"key": "val"}))).unwrap();
        let mut co = Coro::spawn(&ctx, fut);
        match co.resume(0) {
            Step::Done(res) => assert_eq!(res.text, "val"),
            Step::Yielded(_) => panic!("expected completion"),
        }
    }
}
