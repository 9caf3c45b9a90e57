use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use jobgen_core::{Config, GeneratorPool, JobCatalog, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    config_hash: String,
    catalog: Arc<dyn JobCatalog>,
    pool: Arc<GeneratorPool>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, catalog: Arc<dyn JobCatalog>, pool: Arc<GeneratorPool>) -> Self {
        Self {
            config_hash: config_hash(&config),
            config,
            catalog,
            pool,
            started_at: Utc::now(),
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    /// Short hash of the loaded configuration.
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn catalog(&self) -> &dyn JobCatalog {
        self.catalog.as_ref()
    }

    pub fn pool(&self) -> &GeneratorPool {
        &self.pool
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// First 16 hex digits of the SHA-256 of the serialized configuration.
pub fn config_hash(config: &Config) -> String {
    let config_json = serde_json::to_string(config).unwrap_or_default();
    let hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    hash[..16].to_string()
}
