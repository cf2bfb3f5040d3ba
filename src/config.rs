//! Engine configuration, loadable from JSON with every field defaulted.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{
    error::SyncError,
    registry::Outlet,
    runtime::handle::RuntimeConfig,
    sync::policy::RetryPolicy,
};

/// Where and how to reach the central store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            api_token: None,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Records per upload request.
    pub batch_size: usize,
    /// Interval between background ticks.
    pub tick_interval_ms: u64,
    /// Upper bound on a single transfer attempt.
    pub transfer_timeout_ms: u64,
    /// Outlet passes allowed to run at once.
    pub max_concurrent_outlets: usize,
    /// Compare-and-set retries for a contended status update.
    pub max_conflict_retries: u32,
    /// Reporter staleness window; 0 computes every summary on demand.
    pub reporter_cache_ttl_ms: u64,
    /// Re-queue failed records automatically once their last attempt is this
    /// old. Off when unset.
    pub auto_requeue_failed_after_ms: Option<u64>,
    /// Directory holding one database per outlet.
    pub data_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub runtime: RuntimeConfig,
    pub central: CentralConfig,
    /// Outlets provisioned at startup.
    pub outlets: Vec<Outlet>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            tick_interval_ms: 30_000,
            transfer_timeout_ms: 15_000,
            max_concurrent_outlets: 8,
            max_conflict_retries: 3,
            reporter_cache_ttl_ms: 2_000,
            auto_requeue_failed_after_ms: None,
            data_dir: None,
            retry: RetryPolicy::default(),
            runtime: RuntimeConfig::default(),
            central: CentralConfig::default(),
            outlets: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(text: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".to_string()));
        }
        if self.max_concurrent_outlets == 0 {
            return Err(SyncError::Config(
                "max_concurrent_outlets must be positive".to_string(),
            ));
        }
        if self.transfer_timeout_ms == 0 {
            return Err(SyncError::Config(
                "transfer_timeout_ms must be positive".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(SyncError::Config("tick_interval_ms must be positive".to_string()));
        }
        self.retry.validate().map_err(SyncError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = SyncConfig::from_json_str(
            r#"{
                "batch_size": 20,
                "retry": { "base_delay_ms": 1000 },
                "central": { "endpoint": "https://hq.example", "api_token": "t" },
                "outlets": [{ "id": "north", "name": "North", "location": "Quebec" }]
            }"#,
        )
        .expect("config");
        assert_eq!(cfg.batch_size, 20);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.retry.max_delay_ms, 600_000);
        assert_eq!(cfg.central.api_token.as_deref(), Some("t"));
        assert_eq!(cfg.central.connect_timeout_ms, 5_000);
        assert_eq!(cfg.outlets[0].id, "north");
        assert_eq!(cfg.max_concurrent_outlets, 8);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SyncConfig::from_json_str(r#"{"batch_size": 0}"#).is_err());
        assert!(SyncConfig::from_json_str(r#"{"retry": {"base_delay_ms": 10, "max_delay_ms": 5}}"#).is_err());
        assert!(SyncConfig::from_json_str("not json").is_err());
    }
}
