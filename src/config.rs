//! Konfiguration
//!
//! Werte kommen aus Umgebungsvariablen oder einem JSON-Dokument. Alles,
//! was nicht gesetzt ist, fällt auf die Defaults zurück.

use crate::call_session::MediaKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default Signaling URL
pub const DEFAULT_SIGNALING_URL: &str = "https://call-signaling.example.com";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported signaling URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid config document: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Timeouts und Queue-Größe des Call Coordinators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Klingel-Timeout für Audio-Anrufe
    pub ring_timeout_audio_secs: u64,
    /// Klingel-Timeout für Video-Anrufe
    pub ring_timeout_video_secs: u64,
    /// Maximale Zeit von "angenommen" bis "verbunden"
    pub connecting_timeout_secs: u64,
    /// Maximale Wartezeit auf die Antwort von `initiate_call`
    pub request_timeout_secs: u64,
    pub queue_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_audio_secs: 30,
            ring_timeout_video_secs: 30,
            connecting_timeout_secs: 20,
            request_timeout_secs: 10,
            queue_capacity: 100,
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self, media_kind: MediaKind) -> Duration {
        match media_kind {
            MediaKind::Audio => Duration::from_secs(self.ring_timeout_audio_secs),
            MediaKind::Video => Duration::from_secs(self.ring_timeout_video_secs),
        }
    }

    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_secs(self.connecting_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub signaling_url: String,
    pub user_id: String,
    pub auth_token: String,
    /// Pfad der Historien-Datenbank (sonst App-Datenverzeichnis)
    pub history_path: Option<PathBuf>,
    pub call: CallConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            user_id: String::new(),
            auth_token: String::new(),
            history_path: None,
            call: CallConfig::default(),
        }
    }
}

impl AppConfig {
    /// Liest die Konfiguration aus der Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Ok(user_id) = std::env::var("CALL_USER_ID") {
            config.user_id = user_id;
        }
        if let Ok(token) = std::env::var("CALL_AUTH_TOKEN") {
            config.auth_token = token;
        }
        if let Ok(path) = std::env::var("CALL_HISTORY_PATH") {
            config.history_path = Some(PathBuf::from(path));
        }

        if let Some(secs) = env_secs("CALL_RING_TIMEOUT_SECS")? {
            config.call.ring_timeout_audio_secs = secs;
            config.call.ring_timeout_video_secs = secs;
        }
        if let Some(secs) = env_secs("CALL_RING_TIMEOUT_VIDEO_SECS")? {
            config.call.ring_timeout_video_secs = secs;
        }
        if let Some(secs) = env_secs("CALL_CONNECT_TIMEOUT_SECS")? {
            config.call.connecting_timeout_secs = secs;
        }
        if let Some(secs) = env_secs("CALL_REQUEST_TIMEOUT_SECS")? {
            config.call.request_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parst ein JSON-Dokument
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.signaling_url)?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        for (name, value) in [
            ("ring_timeout_audio_secs", self.call.ring_timeout_audio_secs),
            ("ring_timeout_video_secs", self.call.ring_timeout_video_secs),
            ("connecting_timeout_secs", self.call.connecting_timeout_secs),
            ("request_timeout_secs", self.call.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: value.to_string(),
                });
            }
        }

        if self.call.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: "queue_capacity",
                value: "0".to_string(),
            });
        }

        Ok(())
    }

    /// WebSocket-Endpunkt des Signaling-Servers
    pub fn websocket_url(&self) -> String {
        let base = self.signaling_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws", base)
    }
}

fn env_secs(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_observed_ring_timeout() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout(MediaKind::Audio), Duration::from_secs(30));
        assert_eq!(config.ring_timeout(MediaKind::Video), Duration::from_secs(30));
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = AppConfig::from_json(
            r#"{"signaling_url":"https://sig.test","call":{"ring_timeout_video_secs":45}}"#,
        )
        .unwrap();

        assert_eq!(config.signaling_url, "https://sig.test");
        assert_eq!(config.call.ring_timeout_video_secs, 45);
        assert_eq!(config.call.ring_timeout_audio_secs, 30);
        assert_eq!(config.call.queue_capacity, 100);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = AppConfig::from_json(r#"{"call":{"connecting_timeout_secs":0}}"#);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                name: "connecting_timeout_secs",
                ..
            })
        ));

        let result = AppConfig::from_json(r#"{"call":{"request_timeout_secs":0}}"#);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                name: "request_timeout_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let result = AppConfig::from_json(r#"{"signaling_url":"ftp://sig.test"}"#);
        assert!(matches!(result, Err(ConfigError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_websocket_url() {
        let config = AppConfig {
            signaling_url: "https://sig.test/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.websocket_url(), "wss://sig.test/ws");
    }
}
