//! End-to-end scenarios for scripted (Lua) device types.

use drovercore::{Engine, State};
use serde_json::json;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEVICE_SCRIPT: &str = r#"
function _login()
    expect("login: ")
    send(CONFIG.user .. "\n")
    expect("> ")
end

function detail()
    send("detail\n")
    need(3)
    local n = availableInput()
    skipall()
    return "got " .. tostring(n) .. " bytes from " .. CONFIG.host, 200, "text/plain"
end

function state()
    return getStateName()
end

function boom()
    error("device exploded")
end

function _secret()
    return 200
end
"#;

fn spawn_mock() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock");
    let port = listener.local_addr().expect("mock addr").port();
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut stream) = conn else { break };
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .ok();
            if stream.write_all(b"login: ").is_err() {
                continue;
            }
            let mut buf = vec![0u8; 6];
            if stream.read_exact(&mut buf).is_err() || buf != b"admin\n" {
                continue;
            }
            if stream.write_all(b"> ").is_err() {
                continue;
            }
            // answer detail requests until the peer goes away
            loop {
                let mut req = vec![0u8; 7];
                if stream.read_exact(&mut req).is_err() || req != b"detail\n" {
                    break;
                }
                if stream.write_all(b"abc").is_err() {
                    break;
                }
            }
        }
    });
    port
}

struct TestRig {
    engine: Arc<Engine>,
    reactor: Option<thread::JoinHandle<()>>,
    // keeps the script file alive for the engine's lifetime
    _script: tempfile::NamedTempFile,
}

fn start_rig() -> TestRig {
    let mut script = tempfile::NamedTempFile::new().expect("temp script");
    script
        .write_all(DEVICE_SCRIPT.as_bytes())
        .expect("write script");

    let port = spawn_mock();
    let tree = json!({
        "config": {"idle_wait_time": "50ms"},
        "devicetypes": {
            "scripted": {"script": script.path().to_str().expect("utf8 path")},
        },
        "devices": {
            "dev": {
                "host": "127.0.0.1",
                "port": port,
                "type": "scripted",
                "user": "admin",
            },
        },
    });

    let engine = Arc::new(Engine::from_tree(&tree).expect("config must parse"));
    let reactor = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let _ = engine.run_reactor();
        })
    };
    TestRig {
        engine,
        reactor: Some(reactor),
        _script: script,
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        self.engine.request_shutdown();
        if let Some(h) = self.reactor.take() {
            let _ = h.join();
        }
    }
}

fn wait_for_idle(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if engine.client_state("dev") == Some(State::Idle) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!(
        "client never reached IDLE, state = {:?}",
        engine.client_state("dev")
    );
}

#[test]
fn test_lua_login_reaches_idle() {
    let rig = start_rig();
    wait_for_idle(&rig.engine);
}

#[test]
fn test_lua_action_with_io_and_config() {
    let rig = start_rig();
    wait_for_idle(&rig.engine);

    let res = rig
        .engine
        .query("dev", "detail", None)
        .expect("query failed");
    assert!(!res.error);
    assert_eq!(res.http_status(), 200);
    assert_eq!(res.content_type, "text/plain");
    assert_eq!(res.text, "got 3 bytes from 127.0.0.1");
}

#[test]
fn test_lua_sees_inprocess_state() {
    let rig = start_rig();
    wait_for_idle(&rig.engine);

    let res = rig.engine.query("dev", "state", None).expect("query failed");
    assert_eq!(res.text, "INPROCESS");
}

#[test]
fn test_lua_error_maps_to_500() {
    let rig = start_rig();
    wait_for_idle(&rig.engine);

    let res = rig.engine.query("dev", "boom", None).expect("query failed");
    assert!(res.error);
    assert_eq!(res.http_status(), 500);
    assert!(res.text.contains("device exploded"), "text = {}", res.text);

    // a failed script moves the client to ERROR; it recovers on its own
    assert_eq!(rig.engine.client_state("dev"), Some(State::Error));
}

#[test]
fn test_lua_private_functions_are_hidden() {
    let rig = start_rig();
    wait_for_idle(&rig.engine);

    let err = rig.engine.query("dev", "_secret", None).unwrap_err();
    assert_eq!(err.http_status(), 404);
    let err = rig.engine.query("dev", "no_such_action", None).unwrap_err();
    assert_eq!(err.http_status(), 404);
}
