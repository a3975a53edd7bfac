//! Layered configuration.
//!
//! Sources, lowest to highest priority: built-in defaults, a TOML file, `CHATRELAY_*`
//! environment variables, then command line overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use chrono::format::{Item, StrftimeItems};
use encoding_rs::Encoding;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::relay::Language;

pub const DEFAULT_CONFIG_FILE: &str = "chatrelay.toml";
pub const ENV_PREFIX: &str = "CHATRELAY_";
pub const DEFAULT_PORT: u16 = 8082;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration")]
    Load(#[from] figment::Error),

    #[error("unknown charset {0:?}")]
    UnknownCharset(String),

    #[error("charset {0:?} cannot carry line-delimited text")]
    UnsupportedCharset(String),

    #[error("invalid chat datetime pattern {0:?}")]
    InvalidDatetimePattern(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Host the `connect` client dials.
    pub server_host: String,
    /// WHATWG label of the line encoding, e.g. `UTF-8` or `windows-1251`.
    pub charset: String,
    /// Selects the language of system notices.
    pub locale: String,
    /// strftime pattern the client uses to timestamp chat lines.
    pub chat_datetime_pattern: String,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            server_host: "127.0.0.1".to_string(),
            charset: "UTF-8".to_string(),
            locale: "ru-RU".to_string(),
            chat_datetime_pattern: "%H:%M:%S".to_string(),
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load from `config_file` (default `chatrelay.toml`), the environment and
    /// `cli_overrides`.
    pub fn load<T: Serialize>(
        config_file: Option<&Path>,
        cli_overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encoding()?;

        if StrftimeItems::new(&self.chat_datetime_pattern).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidDatetimePattern(
                self.chat_datetime_pattern.clone(),
            ));
        }

        Ok(())
    }

    /// Resolve the configured charset. Only encodings that keep `\n` a single byte are
    /// accepted, since lines are split on it before decoding.
    pub fn encoding(&self) -> Result<&'static Encoding, ConfigError> {
        let encoding = Encoding::for_label(self.charset.trim().as_bytes())
            .ok_or_else(|| ConfigError::UnknownCharset(self.charset.clone()))?;

        if !encoding.is_ascii_compatible() {
            return Err(ConfigError::UnsupportedCharset(self.charset.clone()));
        }

        Ok(encoding)
    }

    pub fn language(&self) -> Language {
        Language::from_locale(&self.locale)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}
