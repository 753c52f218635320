//! Device templates and per-device configuration.
//!
//! A template (`/devicetypes/<name>`) is shared by every device of that
//! type and is immutable after load: the heartbeat interval, the I/O
//! pacing interval, DSL actions, and an optional Lua script. A device
//! entry (`/devices/<name>`) binds a template to one host and keeps its
//! raw JSON so scripts can read arbitrary per-device keys.

use crate::action::Action;
use crate::error::EngineError;
use droverconf::duration_value_ms;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_IO_YIELD_MS: u64 = 10;
const DEFAULT_DEVICE_PORT: u16 = 23;

/// One device type. Immutable after load.
#[derive(Debug)]
pub struct DeviceTemplate {
    pub name: String,
    /// Milliseconds between heartbeats while idle; 0 disables.
    pub heartbeat_ms: u64,
    /// Sleep requested when an action waits on I/O.
    pub io_yield_ms: u64,
    pub script: Option<PathBuf>,
    pub actions: HashMap<String, Arc<Action>>,
}

impl DeviceTemplate {
    pub fn from_config(name: &str, v: &Value) -> Result<Self, EngineError> {
        let template_err = |message: String| EngineError::Template {
            device: name.to_string(),
            message,
        };

        let map = v
            .as_object()
            .ok_or_else(|| template_err("expected an object".into()))?;

        let heartbeat_ms = match map.get("heartbeat_time") {
            Some(d) => duration_value_ms(d).map_err(|e| template_err(e.to_string()))?,
            None => 0,
        };
        let io_yield_ms = match map.get("io_yield_time") {
            Some(d) => duration_value_ms(d).map_err(|e| template_err(e.to_string()))?,
            None => DEFAULT_IO_YIELD_MS,
        };
        let script = map
            .get("script")
            .map(|s| {
                s.as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| template_err("script must be a path string".into()))
            })
            .transpose()?;

        let actions = match map.get("actions") {
            Some(a) => Action::parse_map(a).map_err(|source| EngineError::Action {
                device: name.to_string(),
                source,
            })?,
            None => HashMap::new(),
        };

        Ok(Self {
            name: name.to_string(),
            heartbeat_ms,
            io_yield_ms,
            script,
            actions,
        })
    }
}

/// One device instance's identity, plus its raw config for scripts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub type_name: String,
    pub raw: Value,
}

impl ClientConfig {
    pub fn from_config(name: &str, v: &Value) -> Result<Self, EngineError> {
        let device_err = |message: String| EngineError::Device {
            device: name.to_string(),
            message,
        };

        let map = v
            .as_object()
            .ok_or_else(|| device_err("expected an object".into()))?;
        let host = map
            .get("host")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| device_err("missing host".into()))?
            .to_string();
        let port = match map.get("port") {
            Some(p) => {
                let n = p
                    .as_u64()
                    .filter(|&n| n > 0 && n <= u16::MAX as u64)
                    .ok_or_else(|| device_err("port out of range".into()))?;
                n as u16
            }
            None => DEFAULT_DEVICE_PORT,
        };
        let type_name = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| device_err("missing device type".into()))?
            .to_string();

        Ok(Self {
            name: name.to_string(),
            host,
            port,
            type_name,
            raw: v.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_template_defaults() {
        let t = DeviceTemplate::from_config("proj", &json!({})).unwrap();
        assert_eq!(t.heartbeat_ms, 0);
        assert_eq!(t.io_yield_ms, 10);
        assert!(t.script.is_none());
        assert!(t.actions.is_empty());
    }

    #[test]
    fn test_template_full() {
        let t = DeviceTemplate::from_config(
            "proj",
            &json!({
                "heartbeat_time": "5s",
                "io_yield_time": "20ms",
                "script": "devices/proj.lua",
                "actions": {
                    "_login": [["expect", "> "]],
                    "status": [["send", "status\n"], ["expect", "OK\r\n"]],
                },
            }),
        )
        .unwrap();
        assert_eq!(t.heartbeat_ms, 5_000);
        assert_eq!(t.io_yield_ms, 20);
        assert!(t.script.is_some());
        assert_eq!(t.actions.len(), 2);
    }

    #[test]
    fn test_template_bad_action_aborts() {
        let e = DeviceTemplate::from_config(
            "proj",
            &json!({"actions": {"x": [["match", "(bad"]]}}),
        )
        .unwrap_err();
        assert!(e.to_string().contains("regex"));
    }

    #[test]
    fn test_client_config_defaults_port() {
        let c = ClientConfig::from_config("a", &json!({"host": "10.1.1.1", "type": "proj"})).unwrap();
        assert_eq!(c.port, 23);
        assert_eq!(c.raw["host"], "10.1.1.1");
    }

    #[test]
    fn test_client_config_requires_host_and_type() {
        assert!(ClientConfig::from_config("a", &json!({"type": "t"})).is_err());
        assert!(ClientConfig::from_config("a", &json!({"host": "h"})).is_err());
        assert!(ClientConfig::from_config("a", &json!({"host": "h", "type": "t", "port": 0})).is_err());
    }
}
