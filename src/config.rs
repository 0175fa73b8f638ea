//! Konfiguration für Signaling, Call Engine und Quality Monitor
//!
//! Werte kommen aus Umgebungsvariablen (`SIGNALING_URL`, `CALL_*`) oder aus
//! einer beliebigen serde-Quelle. Fehlende Felder bekommen Defaults.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default Signaling-Server
pub const DEFAULT_SIGNALING_URL: &str = "wss://signaling.pulse.local";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Missing value for {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Basis-URL des Relays (http(s) wird zu ws(s))
    pub signaling_url: String,
    pub room_id: String,
    /// Eigene User-ID im Raum
    pub user_id: String,
    pub display_name: Option<String>,
    /// Max. Dauer für Verbindungsaufbau und Call-Negotiation
    pub connect_timeout_ms: u64,
    /// Wie lange ein eingehender Anruf klingelt
    pub ring_timeout_ms: u64,
    /// Abtastintervall des Quality Monitors
    pub quality_interval_ms: u64,
    /// Anzahl aufeinanderfolgender `Poor`-Samples bis zur Neuverhandlung
    pub poor_samples_before_reconnect: u32,
    pub keepalive_interval_ms: u64,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            room_id: "lobby".to_string(),
            user_id: uuid::Uuid::new_v4().to_string(),
            display_name: None,
            connect_timeout_ms: 30_000,
            ring_timeout_ms: 45_000,
            quality_interval_ms: 2_000,
            poor_samples_before_reconnect: 3,
            keepalive_interval_ms: 25_000,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Wie `from_env`, aber mit beliebiger Quelle (für Tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(room_id) = lookup("CALL_ROOM_ID") {
            config.room_id = room_id;
        }
        if let Some(user_id) = lookup("CALL_USER_ID") {
            config.user_id = user_id;
        }
        config.display_name = lookup("CALL_DISPLAY_NAME");

        config.connect_timeout_ms =
            parse_var(&lookup, "CALL_CONNECT_TIMEOUT_MS", config.connect_timeout_ms)?;
        config.ring_timeout_ms = parse_var(&lookup, "CALL_RING_TIMEOUT_MS", config.ring_timeout_ms)?;
        config.quality_interval_ms =
            parse_var(&lookup, "CALL_QUALITY_INTERVAL_MS", config.quality_interval_ms)?;
        config.keepalive_interval_ms =
            parse_var(&lookup, "CALL_KEEPALIVE_INTERVAL_MS", config.keepalive_interval_ms)?;
        config.poor_samples_before_reconnect = parse_var(
            &lookup,
            "CALL_POOR_SAMPLES",
            config.poor_samples_before_reconnect,
        )?;

        if let Some(servers) = lookup("CALL_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Prüft Pflichtfelder und Intervalle
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_id.trim().is_empty() {
            return Err(ConfigError::Missing("room_id"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::Missing("user_id"));
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("ring_timeout_ms", self.ring_timeout_ms),
            ("quality_interval_ms", self.quality_interval_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: value.to_string(),
                });
            }
        }
        if self.poor_samples_before_reconnect == 0 {
            return Err(ConfigError::InvalidValue {
                name: "poor_samples_before_reconnect",
                value: "0".to_string(),
            });
        }
        self.endpoint_url().map(|_| ())
    }

    /// `<signalingServerUrl>/room/<roomId>/user/<userId>`
    pub fn endpoint_url(&self) -> Result<String, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(&self.signaling_url).map_err(|e| invalid(&e.to_string()))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot switch to websocket scheme"))?;

        url.path_segments_mut()
            .map_err(|_| invalid("URL cannot be a base"))?
            .pop_if_empty()
            .extend(["room", self.room_id.as_str(), "user", self.user_id.as_str()]);

        Ok(url.to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Liest eine Variable im Zieltyp; fehlt sie, bleibt `current`
fn parse_var<T, F>(lookup: &F, name: &'static str, current: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_endpoint_url() {
        let config = CallConfig {
            signaling_url: "https://relay.example.com".to_string(),
            room_id: "room-42".to_string(),
            user_id: "alice".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint_url().unwrap(),
            "wss://relay.example.com/room/room-42/user/alice"
        );
    }

    #[test]
    fn test_endpoint_url_keeps_base_path_and_encodes() {
        let config = CallConfig {
            signaling_url: "ws://localhost:8080/signal/".to_string(),
            room_id: "team room".to_string(),
            user_id: "bob".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint_url().unwrap(),
            "ws://localhost:8080/signal/room/team%20room/user/bob"
        );
    }

    #[test]
    fn test_endpoint_url_rejects_other_schemes() {
        let config = CallConfig {
            signaling_url: "ftp://relay.example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.endpoint_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_from_lookup() {
        let config = CallConfig::from_lookup(lookup(&[
            ("SIGNALING_URL", "ws://127.0.0.1:9000"),
            ("CALL_ROOM_ID", "standup"),
            ("CALL_USER_ID", "carol"),
            ("CALL_POOR_SAMPLES", "5"),
            ("CALL_ICE_SERVERS", "stun:a:3478, turn:b:3478,"),
        ]))
        .unwrap();

        assert_eq!(config.room_id, "standup");
        assert_eq!(config.user_id, "carol");
        assert_eq!(config.poor_samples_before_reconnect, 5);
        assert_eq!(config.ice_servers, vec!["stun:a:3478", "turn:b:3478"]);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = CallConfig::from_lookup(lookup(&[("CALL_RING_TIMEOUT_MS", "soon")]));
        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                name: "CALL_RING_TIMEOUT_MS",
                value: "soon".to_string()
            })
        );

        let result = CallConfig::from_lookup(lookup(&[("CALL_QUALITY_INTERVAL_MS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_poor_samples_out_of_range() {
        let result = CallConfig::from_lookup(lookup(&[("CALL_POOR_SAMPLES", "4294967296")]));
        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                name: "CALL_POOR_SAMPLES",
                value: "4294967296".to_string()
            })
        );

        let result = CallConfig::from_lookup(lookup(&[("CALL_POOR_SAMPLES", "-1")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: CallConfig =
            serde_json::from_str(r#"{"room_id":"r","user_id":"u","ring_timeout_ms":1000}"#)
                .unwrap();
        assert_eq!(config.ring_timeout(), Duration::from_secs(1));
        assert_eq!(config.poor_samples_before_reconnect, 3);
        assert!(config.validate().is_ok());
    }
}
