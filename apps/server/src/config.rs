//! Server configuration.
//!
//! Wraps [`CoreConfig`] (business logic) with deployment concerns, layered
//! YAML file → environment variable → CLI flag, in increasing precedence
//! (`§10.3`). The environment variables recognised here are exactly the set
//! named in the external interfaces (`§6`).

use std::path::Path;

use agent_assist_core::config::IngestAuth;
use agent_assist_core::{AsrProvider, CoreConfig, PubsubAdapter, SilenceThresholds};
use anyhow::{Context, Result};
use serde::Deserialize;

/// Deployment configuration loaded from YAML, then overridden by environment
/// variables. CLI flags (see `main.rs`) are applied on top by the caller.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub core: CoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file (if given), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("REDIS_URL") {
            self.core.redis_url = Some(val);
        }
        if let Ok(val) = std::env::var("PUBSUB_ADAPTER") {
            match val.to_ascii_lowercase().as_str() {
                "streams" => self.core.pubsub_adapter = PubsubAdapter::Streams,
                "in_memory" | "inmemory" => self.core.pubsub_adapter = PubsubAdapter::InMemory,
                other => tracing::warn!(value = other, "ignoring unrecognised PUBSUB_ADAPTER"),
            }
        }
        if let Ok(val) = std::env::var("REDIS_CONSUMER_GROUP") {
            self.core.redis_consumer_group = val;
        }
        if let Ok(val) = std::env::var("ASR_PROVIDER") {
            match val.to_ascii_lowercase().as_str() {
                "websocket" => self.core.asr_provider = AsrProvider::Websocket,
                "mock" => self.core.asr_provider = AsrProvider::Mock,
                other => tracing::warn!(value = other, "ignoring unrecognised ASR_PROVIDER"),
            }
        }
        if let Ok(val) = std::env::var("VENDOR_API_KEY") {
            self.core.vendor_api_key = Some(val);
        }
        if let Ok(val) = std::env::var("BUFFER_WINDOW_MS") {
            if let Ok(ms) = val.parse() {
                self.core.buffer_window_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("IDLE_TEARDOWN_MS") {
            if let Ok(ms) = val.parse() {
                self.core.idle_teardown_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("SILENCE_ENERGY_THRESHOLD_8K") {
            if let Ok(energy) = val.parse() {
                self.core.silence_thresholds_8k = SilenceThresholds {
                    energy,
                    ..self.core.silence_thresholds_8k
                };
            }
        }
        if let Ok(val) = std::env::var("SILENCE_PEAK_THRESHOLD_8K") {
            if let Ok(peak) = val.parse() {
                self.core.silence_thresholds_8k = SilenceThresholds {
                    peak,
                    ..self.core.silence_thresholds_8k
                };
            }
        }
        if let Ok(val) = std::env::var("AMPLIFICATION_ENABLED") {
            self.core.amplification_enabled = matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("INGEST_PORT") {
            if let Ok(port) = val.parse() {
                self.core.ingest_port = port;
            }
        }
        self.apply_ingest_auth_env();
    }

    fn apply_ingest_auth_env(&mut self) {
        let mode = match std::env::var("INGEST_AUTH_MODE") {
            Ok(mode) => mode.to_ascii_lowercase(),
            Err(_) => return,
        };
        self.core.ingest_auth = match mode.as_str() {
            "none" => IngestAuth::None,
            "ip_allow_list" => {
                let allowed_ips = std::env::var("INGEST_ALLOWED_IPS")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                IngestAuth::IpAllowList { allowed_ips }
            }
            "basic" => IngestAuth::Basic {
                username: std::env::var("INGEST_BASIC_USERNAME").unwrap_or_default(),
                password: std::env::var("INGEST_BASIC_PASSWORD").unwrap_or_default(),
            },
            "bearer_jwt" => IngestAuth::BearerJwt {
                public_key_pem: std::env::var("INGEST_JWT_PUBLIC_KEY_PEM").unwrap_or_default(),
            },
            other => {
                tracing::warn!(value = other, "ignoring unrecognised INGEST_AUTH_MODE");
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_wraps_core_default() {
        let config = ServerConfig::default();
        assert_eq!(config.core.ingest_port, 8080);
    }
}
