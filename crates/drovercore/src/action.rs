//! The scripted action DSL.
//!
//! An action is an ordered list of commands, each an opcode plus one
//! typed parameter, written in config as `[["send","status\n"],
//! ["expect","OK\r\n"]]`. Parsing happens once at startup (including
//! regex compilation); execution runs as a job future over the client's
//! shared connection, suspending through the yield channel whenever input
//! is short or the socket pushes back.
//!
//! The same primitive operations back the Lua-facing functions in
//! [`crate::script`], so a device type can mix both styles freely.

use crate::conn::{LinkError, Shared};
use crate::coro::CoroCtx;
use droverconf::duration_value_ms;
use regex::bytes::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Fail,
    Expect,
    Match,
    Skip,
    SkipAll,
    Wait,
    Need,
    Send,
}

#[derive(Clone, Copy)]
enum ParamKind {
    None,
    Str,
    Uint,
    DurationMs,
    Regex,
}

// Table order is load-bearing: configs name opcodes by these strings and
// the order matches the device-type format this replaces.
const DEFS: &[(&str, Opcode, ParamKind)] = &[
    ("fail", Opcode::Fail, ParamKind::None),
    ("expect", Opcode::Expect, ParamKind::Str),
    ("match", Opcode::Match, ParamKind::Regex),
    ("skip", Opcode::Skip, ParamKind::Uint),
    ("skipall", Opcode::SkipAll, ParamKind::None),
    ("wait", Opcode::Wait, ParamKind::DurationMs),
    ("need", Opcode::Need, ParamKind::Uint),
    ("send", Opcode::Send, ParamKind::Str),
];

impl Opcode {
    pub fn name(self) -> &'static str {
        DEFS.iter()
            .find(|(_, op, _)| *op == self)
            .map(|(name, _, _)| *name)
            .unwrap_or("?")
    }
}

/// A configuration error inside one action definition.
#[derive(Debug, Error)]
#[error("action {action}[{index}]: {message}")]
pub struct ParseError {
    pub action: String,
    pub index: usize,
    pub message: String,
}

/// One parsed command. Immutable after parsing.
#[derive(Debug, Clone)]
pub struct Command {
    op: Opcode,
    text: String,
    num: u64,
    regex: Option<Regex>,
}

/// A named, parsed command sequence. Immutable after parsing.
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    commands: Vec<Command>,
}

/// Compile a pattern anchored to the start of the input window.
///
/// Matching runs on raw bytes with Unicode off: `.` is any byte except
/// `\n`. Backreferences and lookaround are not supported and fail here,
/// at load time.
pub(crate) fn compile_anchored(pattern: &str) -> Result<Regex, String> {
    RegexBuilder::new(&format!("^(?:{pattern})"))
        .unicode(false)
        .build()
        .map_err(|e| e.to_string())
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse the JSON array form. Any malformed command aborts the whole
    /// action (and with it, startup).
    pub fn parse(name: &str, v: &Value) -> Result<Self, ParseError> {
        let err = |index: usize, message: String| ParseError {
            action: name.to_string(),
            index,
            message,
        };

        let items = v
            .as_array()
            .ok_or_else(|| err(0, "expected an array of commands".into()))?;

        let mut commands = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let parts = item
                .as_array()
                .ok_or_else(|| err(index, "expected [opcode, param?]".into()))?;
            let opname = parts
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| err(index, "missing opcode".into()))?;
            let &(_, op, kind) = DEFS
                .iter()
                .find(|(n, _, _)| *n == opname)
                .ok_or_else(|| err(index, format!("unknown command: {opname}")))?;

            let mut cmd = Command {
                op,
                text: String::new(),
                num: 0,
                regex: None,
            };
            let param = parts.get(1);
            match kind {
                ParamKind::None => {}
                ParamKind::Str => {
                    cmd.text = param
                        .and_then(Value::as_str)
                        .ok_or_else(|| err(index, format!("{opname} needs a string")))?
                        .to_string();
                }
                ParamKind::Uint => {
                    cmd.num = param
                        .and_then(Value::as_u64)
                        .ok_or_else(|| err(index, format!("{opname} needs an unsigned count")))?;
                }
                ParamKind::DurationMs => {
                    let raw = param
                        .ok_or_else(|| err(index, format!("{opname} needs a duration")))?;
                    cmd.num = duration_value_ms(raw)
                        .map_err(|e| err(index, e.to_string()))?;
                }
                ParamKind::Regex => {
                    let pat = param
                        .and_then(Value::as_str)
                        .ok_or_else(|| err(index, format!("{opname} needs a pattern")))?;
                    cmd.text = pat.to_string();
                    cmd.regex = Some(
                        compile_anchored(pat)
                            .map_err(|e| err(index, format!("regex compile error: {e}")))?,
                    );
                }
            }
            commands.push(cmd);
        }

        Ok(Self {
            name: name.to_string(),
            commands,
        })
    }

    /// Parse a config `actions` object into a name -> action map.
    pub fn parse_map(v: &Value) -> Result<HashMap<String, Arc<Action>>, ParseError> {
        let items = v.as_object().ok_or_else(|| ParseError {
            action: String::new(),
            index: 0,
            message: "actions must be an object".into(),
        })?;
        let mut out = HashMap::with_capacity(items.len());
        for (name, def) in items {
            out.insert(name.clone(), Arc::new(Action::parse(name, def)?));
        }
        Ok(out)
    }

    /// Run against `sh`, suspending through `ctx`. Success is the total
    /// number of bytes produced or consumed; the first failing command
    /// aborts the action.
    pub(crate) async fn run(&self, sh: &Shared, ctx: &CoroCtx) -> Result<usize, ActionFailure> {
        let mut total = 0usize;
        for (index, cmd) in self.commands.iter().enumerate() {
            let res = match cmd.op {
                Opcode::Fail => Err(CommError::Fail),
                Opcode::Expect => expect_bytes(sh, ctx, cmd.text.as_bytes()).await,
                Opcode::Match => match &cmd.regex {
                    Some(re) => match_buffer(sh, re, &cmd.text),
                    None => Err(CommError::Fail),
                },
                Opcode::Skip => skip_bytes(sh, ctx, cmd.num).await,
                Opcode::SkipAll => Ok(sh.skip_all()),
                Opcode::Wait => {
                    ctx.sleep(cmd.num).await;
                    Ok(0)
                }
                Opcode::Need => need_bytes(sh, ctx, cmd.num).await,
                Opcode::Send => send_bytes(sh, ctx, cmd.text.as_bytes()).await,
            };
            match res {
                Ok(n) => total += n,
                Err(e) => {
                    warn!(
                        client = %sh.name,
                        action = %self.name,
                        opcode = cmd.op.name(),
                        index,
                        error = %e,
                        "action failed"
                    );
                    return Err(ActionFailure {
                        action: self.name.clone(),
                        opcode: cmd.op.name(),
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }
        debug!(client = %sh.name, action = %self.name, bytes = total, "action done");
        Ok(total)
    }
}

/// Runtime failure of an action, naming the command that broke.
#[derive(Debug, Error)]
#[error("action {action} failed at {opcode}[{index}]: {message}")]
pub struct ActionFailure {
    pub action: String,
    pub opcode: &'static str,
    pub index: usize,
    pub message: String,
}

/// Failure of a single primitive step.
#[derive(Debug, Error)]
pub(crate) enum CommError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("expected {wanted:?}, got {got:?}")]
    Mismatch { wanted: String, got: String },
    #[error("no match for {pattern:?} against {got:?}")]
    NoMatch { pattern: String, got: String },
    #[error("explicit failure")]
    Fail,
}

/// Consume exactly the bytes of `want` from input, waiting for more as
/// needed. Any divergence is a mismatch.
pub(crate) async fn expect_bytes(
    sh: &Shared,
    ctx: &CoroCtx,
    want: &[u8],
) -> Result<usize, CommError> {
    let mut buf = [0u8; 256];
    let mut done = 0;
    while done < want.len() {
        let limit = (want.len() - done).min(buf.len());
        let n = sh.read_input(&mut buf[..limit])?;
        if n == 0 {
            ctx.sleep(sh.io_yield_ms).await;
            continue;
        }
        if buf[..n] != want[done..done + n] {
            return Err(CommError::Mismatch {
                wanted: String::from_utf8_lossy(want).into_owned(),
                got: String::from_utf8_lossy(&buf[..n]).into_owned(),
            });
        }
        done += n;
    }
    Ok(done)
}

/// Try `re` once against the buffered bytes; never waits for more input.
pub(crate) fn match_buffer(sh: &Shared, re: &Regex, pattern: &str) -> Result<usize, CommError> {
    sh.match_input(re).ok_or_else(|| CommError::NoMatch {
        pattern: pattern.to_string(),
        got: sh.preview_input(),
    })
}

/// Discard exactly `count` bytes of input, waiting as needed.
pub(crate) async fn skip_bytes(sh: &Shared, ctx: &CoroCtx, count: u64) -> Result<usize, CommError> {
    let mut remain = count as usize;
    let done = remain;
    while remain > 0 {
        let avail = sh.avail_input();
        if avail > 0 {
            remain -= sh.advance_input(avail.min(remain));
        } else {
            ctx.sleep(sh.io_yield_ms).await;
        }
    }
    Ok(done)
}

/// Wait until at least `count` bytes are buffered.
pub(crate) async fn need_bytes(sh: &Shared, ctx: &CoroCtx, count: u64) -> Result<usize, CommError> {
    while (sh.avail_input() as u64) < count {
        ctx.sleep(sh.io_yield_ms).await;
    }
    Ok(0)
}

/// Write all of `data`, yielding on short writes until the socket drains
/// it or errors.
pub(crate) async fn send_bytes(sh: &Shared, ctx: &CoroCtx, data: &[u8]) -> Result<usize, CommError> {
    let mut rest = data;
    while !rest.is_empty() {
        let sent = sh.send_some(rest)?;
        if sent == rest.len() {
            break;
        }
        rest = &rest[sent..];
        ctx.sleep(sh.io_yield_ms).await;
    }
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{Coro, Step};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn shared() -> Arc<Shared> {
        Arc::new(Shared::new("test".into(), 10))
    }

    /// Drive a job future, bounding the number of suspensions.
    fn drive<T: 'static>(mut co: Coro<T>, max_steps: usize) -> Option<T> {
        for _ in 0..max_steps {
            match co.resume(0) {
                Step::Done(v) => return Some(v),
                Step::Yielded(_) => {}
            }
        }
        None
    }

    #[test]
    fn test_parse_roundtrip() {
        let action = Action::parse(
            "login",
            &json!([
                ["expect", "login: "],
                ["send", "user\n"],
                ["wait", "1m30s"],
                ["skip", 4],
                ["need", 2],
                ["skipall"],
                ["match", "^OK\r\n"],
                ["fail"],
            ]),
        )
        .unwrap();
        assert_eq!(action.commands.len(), 8);
        assert_eq!(action.commands[2].num, 90_000);
        assert!(action.commands[6].regex.is_some());
    }

    #[test]
    fn test_parse_rejects_unknown_opcode() {
        let e = Action::parse("x", &json!([["frobnicate", 1]])).unwrap_err();
        assert!(e.to_string().contains("unknown command"));
    }

    #[test]
    fn test_parse_rejects_bad_regex() {
        let e = Action::parse("x", &json!([["match", "(unclosed"]])).unwrap_err();
        assert!(e.to_string().contains("regex compile error"));
    }

    #[test]
    fn test_parse_rejects_wrong_param_type() {
        assert!(Action::parse("x", &json!([["skip", "four"]])).is_err());
        assert!(Action::parse("x", &json!([["expect", 42]])).is_err());
        assert!(Action::parse("x", &json!([["wait", "2x"]])).is_err());
    }

    #[test]
    fn test_skipall_on_empty_buffer_is_noop() {
        let sh = shared();
        let ctx = CoroCtx::new();
        let action = Action::parse("drop", &json!([["skipall"]])).unwrap();
        let sh2 = Arc::clone(&sh);
        let co = Coro::spawn(&ctx, {
            let ctx = ctx.clone();
            async move { action.run(&sh2, &ctx).await }
        });
        let res = drive(co, 4).expect("must finish without waiting");
        assert_eq!(res.unwrap(), 0);
        assert_eq!(sh.avail_input(), 0);
    }

    #[test]
    fn test_match_consumes_and_skipall_drops_remainder() {
        let sh = shared();
        let ctx = CoroCtx::new();
        sh.push_input(b"OK=42\r\nextra");
        let action =
            Action::parse("probe", &json!([["match", "^OK=([0-9]+)\r\n"], ["skipall"]])).unwrap();
        let sh2 = Arc::clone(&sh);
        let co = Coro::spawn(&ctx, {
            let ctx = ctx.clone();
            async move { action.run(&sh2, &ctx).await }
        });
        // match eats 9 bytes, skipall the remaining 5
        let res = drive(co, 4).expect("must finish without waiting");
        assert_eq!(res.unwrap(), 14);
        assert_eq!(sh.avail_input(), 0);
    }

    #[test]
    fn test_match_does_not_wait_for_input() {
        let sh = shared();
        let ctx = CoroCtx::new();
        sh.push_input(b"BYE\n");
        let action = Action::parse("probe", &json!([["match", "^HI\n"]])).unwrap();
        let sh2 = Arc::clone(&sh);
        let co = Coro::spawn(&ctx, {
            let ctx = ctx.clone();
            async move { action.run(&sh2, &ctx).await }
        });
        let res = drive(co, 2).expect("match must fail immediately");
        let failure = res.unwrap_err();
        assert_eq!(failure.opcode, "match");
        assert_eq!(failure.index, 0);
    }

    #[test]
    fn test_match_is_anchored_at_start() {
        let sh = shared();
        let ctx = CoroCtx::new();
        // the pattern occurs later in the buffer, but not at the start
        sh.push_input(b"noise OK\r\n");
        let re = compile_anchored("OK").unwrap();
        assert!(match_buffer(&sh, &re, "OK").is_err());
        assert_eq!(sh.avail_input(), 10);
    }

    #[test]
    fn test_skip_waits_for_bytes() {
        let sh = shared();
        let ctx = CoroCtx::new();
        sh.push_input(b"ab");
        let action = Action::parse("eat", &json!([["skip", 4]])).unwrap();
        let sh2 = Arc::clone(&sh);
        let mut co = Coro::spawn(&ctx, {
            let ctx = ctx.clone();
            async move { action.run(&sh2, &ctx).await }
        });
        // two bytes short: the job must suspend asking for more
        assert!(matches!(co.resume(0), Step::Yielded(10)));
        sh.push_input(b"cd");
        match co.resume(0) {
            Step::Done(res) => assert_eq!(res.unwrap(), 4),
            Step::Yielded(_) => panic!("expected completion after bytes arrived"),
        }
        assert_eq!(sh.avail_input(), 0);
    }

    #[test]
    fn test_expect_fails_when_disconnected() {
        let sh = shared();
        let ctx = CoroCtx::new();
        let action = Action::parse("login", &json!([["expect", "hi"]])).unwrap();
        let sh2 = Arc::clone(&sh);
        let co = Coro::spawn(&ctx, {
            let ctx = ctx.clone();
            async move { action.run(&sh2, &ctx).await }
        });
        let res = drive(co, 2).expect("must fail fast with no socket");
        assert_eq!(res.unwrap_err().opcode, "expect");
    }

    #[test]
    fn test_fail_opcode() {
        let sh = shared();
        let ctx = CoroCtx::new();
        let action = Action::parse("nope", &json!([["fail"]])).unwrap();
        let sh2 = Arc::clone(&sh);
        let co = Coro::spawn(&ctx, {
            let ctx = ctx.clone();
            async move { action.run(&sh2, &ctx).await }
        });
        assert!(drive(co, 2).expect("immediate").is_err());
    }

    #[test]
    fn test_wait_requests_its_duration() {
        let sh = shared();
        let ctx = CoroCtx::new();
        let action = Action::parse("nap", &json!([["wait", "250ms"]])).unwrap();
        let sh2 = Arc::clone(&sh);
        let mut co = Coro::spawn(&ctx, {
            let ctx = ctx.clone();
            async move { action.run(&sh2, &ctx).await }
        });
        assert!(matches!(co.resume(0), Step::Yielded(250)));
        assert!(matches!(co.resume(0), Step::Done(Ok(0))));
    }
}
