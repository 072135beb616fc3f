use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;
use crate::types::DEFAULT_LISTEN_PORT;

pub const ENV_CONFIG_PATH: &str = "IPCLINK_CONFIG";
pub const ENV_LISTEN: &str = "IPCLINK_LISTEN";
pub const ENV_ICE_SERVERS: &str = "IPCLINK_ICE_SERVERS";

/// Configuração do processo: relay, peer transport e timeouts de dispositivo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(alias = "listenAddr")]
    pub listen_addr: String,
    #[serde(alias = "iceServers")]
    pub ice_servers: Vec<String>,
    #[serde(alias = "talkMaxRetransmits")]
    pub talk_max_retransmits: u16,
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    #[serde(alias = "stopTimeoutMs")]
    pub stop_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_LISTEN_PORT),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
            talk_max_retransmits: 16,
            connect_timeout_ms: 5_000,
            stop_timeout_ms: 2_000,
        }
    }
}

impl AppConfig {
    /// Carrega de um arquivo JSON; campos ausentes ficam com o default.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Resolves the effective configuration: optional file, then environment
    /// overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `IPCLINK_LISTEN` / `IPCLINK_ICE_SERVERS` style overrides.
    /// `lookup` is the environment in production and a map in tests.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup(ENV_LISTEN) {
            debug!("{} overrides listen address: {}", ENV_LISTEN, listen);
            self.listen_addr = listen;
        }
        if let Some(servers) = lookup(ENV_ICE_SERVERS) {
            self.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
            debug!("{} overrides ICE servers: {:?}", ENV_ICE_SERVERS, self.ice_servers);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "listen_addr is empty".into(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "connect_timeout_ms must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_deployment() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8957");
        assert_eq!(cfg.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(cfg.talk_max_retransmits, 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "listenAddr": "127.0.0.1:9000",
            "iceServers": ["stun:example.org:3478"],
            "talkMaxRetransmits": 4,
            "connectTimeoutMs": 1500
        }"#;

        let cfg: AppConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.ice_servers, vec!["stun:example.org:3478"]);
        assert_eq!(cfg.talk_max_retransmits, 4);
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(1500));
        // Untouched fields keep their defaults.
        assert_eq!(cfg.stop_timeout_ms, 2_000);
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{
            "listen_addr": "[::]:8957",
            "stop_timeout_ms": 250
        }"#;

        let cfg: AppConfig = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(cfg.listen_addr, "[::]:8957");
        assert_eq!(cfg.stop_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn serialized_config_has_only_served_settings() {
        let value = serde_json::to_value(AppConfig::default()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            [
                "connect_timeout_ms",
                "ice_servers",
                "listen_addr",
                "stop_timeout_ms",
                "talk_max_retransmits"
            ]
        );

        // Keys from older config files are ignored.
        let cfg: AppConfig = serde_json::from_str(r#"{"uiDir": "/srv/ui"}"#).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_LISTEN, "127.0.0.1:1234"),
            (ENV_ICE_SERVERS, "stun:a:1, stun:b:2 ,,"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.listen_addr, "127.0.0.1:1234");
        assert_eq!(cfg.ice_servers, vec!["stun:a:1", "stun:b:2"]);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cfg = AppConfig {
            listen_addr: "  ".into(),
            ..AppConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));

        let cfg = AppConfig {
            connect_timeout_ms: 0,
            ..AppConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = AppConfig::from_file("/nonexistent/ipclink.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
