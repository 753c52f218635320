//! The engine: client registry plus the request bridge.
//!
//! Built once at startup from the merged config tree; immutable
//! afterwards except through each client's own operations. HTTP workers
//! enter only through [`Engine::query`] and [`Engine::status_rows`].

use crate::client::{Client, State};
use crate::device::{ClientConfig, DeviceTemplate};
use crate::error::{EngineError, QueryError};
use crate::script::ActionResult;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct Engine {
    clients: Vec<Arc<Client>>,
    by_name: HashMap<String, usize>,
    idle_wait_ms: u64,
    quit: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("clients", &self.clients.len())
            .field("idle_wait_ms", &self.idle_wait_ms)
            .finish()
    }
}

/// One row of the `/status` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub cstate: &'static str,
    #[serde(rename = "cstateTime")]
    pub cstate_time: u64,
    pub status: String,
    pub link: String,
}

impl Engine {
    /// Build every template and client from the merged config tree. Any
    /// configuration problem aborts with an error naming the culprit.
    pub fn from_tree(tree: &Value) -> Result<Self, EngineError> {
        let server = droverconf::ServerConfig::from_tree(tree)?;

        let mut templates: HashMap<String, Arc<DeviceTemplate>> = HashMap::new();
        if let Some(section) = tree.get("devicetypes") {
            let map = section.as_object().ok_or_else(|| EngineError::Template {
                device: "/devicetypes".into(),
                message: "expected an object".into(),
            })?;
            for (name, v) in map {
                templates.insert(name.clone(), Arc::new(DeviceTemplate::from_config(name, v)?));
            }
        }

        let mut clients = Vec::new();
        let mut by_name = HashMap::new();
        if let Some(section) = tree.get("devices") {
            let map = section.as_object().ok_or_else(|| EngineError::Device {
                device: "/devices".into(),
                message: "expected an object".into(),
            })?;
            for (name, v) in map {
                let cfg = ClientConfig::from_config(name, v)?;
                let dev = templates
                    .get(&cfg.type_name)
                    .cloned()
                    .ok_or_else(|| EngineError::Device {
                        device: name.clone(),
                        message: format!("unknown device type: {}", cfg.type_name),
                    })?;
                info!(
                    device = %name,
                    devicetype = %cfg.type_name,
                    host = %cfg.host,
                    port = cfg.port,
                    "new device"
                );
                by_name.insert(name.clone(), clients.len());
                clients.push(Arc::new(Client::new(cfg, dev)?));
            }
        }

        Ok(Self {
            clients,
            by_name,
            idle_wait_ms: server.idle_wait_time_ms,
            quit: AtomicBool::new(false),
        })
    }

    fn client(&self, name: &str) -> Option<&Arc<Client>> {
        self.by_name.get(name).map(|&i| &self.clients[i])
    }

    pub(crate) fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    pub fn idle_wait_ms(&self) -> u64 {
        self.idle_wait_ms
    }

    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Ask the reactor to exit at its next poll.
    pub fn request_shutdown(&self) {
        self.quit.store(true, Ordering::Release);
    }

    /// Run the reactor on the calling thread until shutdown.
    pub fn run_reactor(self: &Arc<Self>) -> io::Result<()> {
        crate::reactor::run(Arc::clone(self))
    }

    /// The state a client is in right now, if it exists.
    pub fn client_state(&self, name: &str) -> Option<State> {
        self.client(name).map(|c| c.state())
    }

    /// Run `action` on `client` and wait for its result. Blocking; call
    /// from a worker thread, never from the reactor.
    pub fn query(
        &self,
        client: &str,
        action: &str,
        params: Option<&Value>,
    ) -> Result<ActionResult, QueryError> {
        let c = self
            .client(client)
            .ok_or_else(|| QueryError::UnknownClient(client.to_string()))?;
        c.query(action, params)
    }

    /// Status rows for every client. Devices that are at least IDLE are
    /// asked for their `status` action; the rest report an empty status.
    pub fn status_rows(&self) -> Vec<ClientStatus> {
        self.clients
            .iter()
            .map(|c| {
                let status = if c.state() >= State::Idle {
                    c.query("status", None).map(|r| r.text).unwrap_or_default()
                } else {
                    String::new()
                };
                ClientStatus {
                    name: c.name().to_string(),
                    host: c.host().to_string(),
                    port: c.port(),
                    cstate: c.state().name(),
                    cstate_time: c.time_in_state_ms(),
                    status,
                    link: format!("/ctrl/{}/", c.name()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> Value {
        json!({
            "config": {"idle_wait_time": "50ms"},
            "devicetypes": {
                "echo": {
                    "heartbeat_time": "1s",
                    "actions": {
                        "_login": [["expect", "> "]],
                        "status": [["send", "st\n"], ["expect", "ok\n"]],
                    },
                },
            },
            "devices": {
                "dev1": {"host": "127.0.0.1", "port": 2323, "type": "echo"},
            },
        })
    }

    #[test]
    fn test_build_from_tree() {
        let engine = Engine::from_tree(&tree()).unwrap();
        assert_eq!(engine.idle_wait_ms(), 50);
        assert_eq!(engine.client_state("dev1"), Some(State::Disconnected));
        assert!(engine.client_state("nope").is_none());
    }

    #[test]
    fn test_unknown_device_type_aborts() {
        let mut t = tree();
        t["devices"]["dev2"] = json!({"host": "h", "type": "ghost"});
        let e = Engine::from_tree(&t).unwrap_err();
        assert!(e.to_string().contains("unknown device type"));
    }

    #[test]
    fn test_query_unknown_client_is_404() {
        let engine = Engine::from_tree(&tree()).unwrap();
        let e = engine.query("ghost", "status", None).unwrap_err();
        assert_eq!(e.http_status(), 404);
    }

    #[test]
    fn test_query_not_ready_is_503() {
        let engine = Engine::from_tree(&tree()).unwrap();
        // dev1 never connected; state is DISCONNECTED < IDLE
        let e = engine.query("dev1", "status", None).unwrap_err();
        assert_eq!(e.http_status(), 503);
    }

    #[test]
    fn test_status_rows_without_connection() {
        let engine = Engine::from_tree(&tree()).unwrap();
        let rows = engine.status_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cstate, "DISCONNECTED");
        assert_eq!(rows[0].status, "");
        assert_eq!(rows[0].link, "/ctrl/dev1/");
    }
}
