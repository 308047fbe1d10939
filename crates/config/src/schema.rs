/// Config schema types (server, whatsapp session, reconnect policy).
use std::{collections::HashMap, path::PathBuf};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Validation failures. Any of these is fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config value: {0}")]
    Missing(&'static str),

    #[error("invalid country code {0:?}: expected 1-4 digits without a leading zero")]
    InvalidCountryCode(String),

    #[error("invalid reconnect policy: {0}")]
    InvalidReconnect(String),

    #[error("invalid server config: {0}")]
    InvalidServer(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagateConfig {
    pub server: ServerConfig,
    pub whatsapp: WhatsAppConfig,
    pub reconnect: ReconnectConfig,
}

impl WagateConfig {
    /// Check every section; called once before the gateway starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.whatsapp.validate()?;
        self.reconnect.validate()
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,

    /// Shared API token. When unset the API is unauthenticated.
    #[serde(serialize_with = "serialize_option_secret")]
    pub api_token: Option<Secret<String>>,

    /// Upper bound for multipart uploads and JSON bodies.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
            api_token: None,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Missing("server.bind"));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidServer(
                "max_upload_bytes must be greater than zero".into(),
            ));
        }
        if let Some(token) = &self.api_token
            && token.expose_secret().trim().is_empty()
        {
            return Err(ConfigError::InvalidServer("api_token is empty".into()));
        }
        Ok(())
    }
}

/// WhatsApp session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Where credentials and the pairing image live. Defaults to `~/.wagate/`.
    pub data_dir: Option<PathBuf>,

    /// Calling code used to normalize local phone numbers ("0812…" → "62812…").
    pub country_code: String,

    /// Appended to every outgoing text message after a blank line.
    pub message_footer: Option<String>,

    /// Also render the pairing code to the terminal when it is issued.
    pub print_qr_in_terminal: bool,

    pub bridge: BridgeConfig,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            country_code: "62".into(),
            message_footer: None,
            print_qr_in_terminal: false,
            bridge: BridgeConfig::default(),
        }
    }
}

impl WhatsAppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let code = &self.country_code;
        let well_formed = (1..=4).contains(&code.len())
            && code.chars().all(|c| c.is_ascii_digit())
            && !code.starts_with('0');
        if !well_formed {
            return Err(ConfigError::InvalidCountryCode(code.clone()));
        }
        if self.bridge.command.trim().is_empty() {
            return Err(ConfigError::Missing("whatsapp.bridge.command"));
        }
        Ok(())
    }

    /// Resolved data directory (falls back to the given default).
    pub fn data_dir_or(&self, default: PathBuf) -> PathBuf {
        self.data_dir.clone().unwrap_or(default)
    }
}

/// External session bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "wagate-bridge".into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Backoff applied between automatic reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// `None` retries forever (delays stay capped at `max_delay_ms`).
    pub max_attempts: Option<u32>,
    /// Randomize each delay within ±20%.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidReconnect(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::InvalidReconnect(
                "max_delay_ms is smaller than initial_delay_ms".into(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::InvalidReconnect(
                "max_attempts must be at least 1 (omit it to retry forever)".into(),
            ));
        }
        Ok(())
    }
}

fn serialize_option_secret<S: Serializer>(
    value: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> WagateConfig {
        WagateConfig::default()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_bad_country_code() {
        for code in ["", "0", "62a", "12345", "+62"] {
            let mut cfg = valid();
            cfg.whatsapp.country_code = code.into();
            assert!(
                matches!(cfg.validate(), Err(ConfigError::InvalidCountryCode(_))),
                "accepted {code:?}"
            );
        }
    }

    #[test]
    fn requires_bridge_command() {
        let mut cfg = valid();
        cfg.whatsapp.bridge.command = "  ".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing("whatsapp.bridge.command"))
        ));
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let mut cfg = valid();
        cfg.reconnect.multiplier = 0.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidReconnect(_))
        ));

        let mut cfg = valid();
        cfg.reconnect.max_delay_ms = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.reconnect.max_attempts = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_token() {
        let mut cfg = valid();
        cfg.server.api_token = Some(Secret::new(String::new()));
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidServer(_))));
    }

    #[test]
    fn token_round_trips_through_toml() {
        let mut cfg = valid();
        cfg.server.api_token = Some(Secret::new("abc".into()));
        let raw = toml::to_string_pretty(&cfg).unwrap();
        assert!(raw.contains("api_token = \"abc\""));
        let back: WagateConfig = toml::from_str(&raw).unwrap();
        assert_eq!(
            back.server.api_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("abc")
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: WagateConfig = toml::from_str(
            r#"
            [whatsapp]
            country_code = "44"

            [reconnect]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.whatsapp.country_code, "44");
        assert_eq!(cfg.reconnect.max_attempts, Some(5));
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.reconnect.initial_delay_ms, 1_000);
    }
}
