//! Application state management
//!
//! The server holds one `Extractor`, so every request shares the same
//! capture context and progress channel.

use std::sync::Arc;
use std::time::Instant;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::pipeline::Extractor;

/// Shared application state
pub struct AppState {
    pub extractor: Arc<Extractor>,
    pub config: Arc<ServerConfig>,
    started: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let extractor = Extractor::new(config.extractor.clone())?;
        Ok(Self::with_extractor(config, extractor))
    }

    /// Build the state around a preconfigured extractor.
    pub fn with_extractor(config: ServerConfig, extractor: Extractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
            config: Arc::new(config),
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
