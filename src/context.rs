use std::sync::Arc;

use encoding_rs::Encoding;

use crate::config::{AppConfig, ConfigError};
use crate::relay::{IdAllocator, Language};

/// Shared instances handed to the registry and, through it, to every connection.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub ids: Arc<IdAllocator>,
    pub encoding: &'static Encoding,
    pub language: Language,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self, ConfigError> {
        let encoding = config.encoding()?;
        let language = config.language();

        Ok(Self {
            config: Arc::new(config),
            ids: Arc::new(IdAllocator::new()),
            encoding,
            language,
        })
    }
}
