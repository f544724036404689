use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use transact_store::{InMemoryRepository, QuorumConfig, QuorumRepository, RepositoryContract};

use crate::error::{CoreError, CoreResult};
use crate::store::EventStore;

/// Configuration for the recovery worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Milliseconds between polls of the waiting list.
    pub poll_interval_ms: u64,
    /// Upper bound on transactions finalized per poll.
    pub max_per_poll: usize,
    /// Stop the worker on schema or configuration errors instead of
    /// skipping the offending transaction.
    pub stop_on_configuration_error: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_per_poll: 100,
            stop_on_configuration_error: true,
        }
    }
}

impl RecoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Saved transactions the channel holds before senders start failing.
    pub capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}

/// Which repository backend to build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Quorum,
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: Backend,
    pub quorum: QuorumConfig,
    pub recovery: RecoveryConfig,
    pub delivery: DeliveryConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.recovery.poll_interval_ms == 0 {
            return Err(CoreError::Config("recovery.poll_interval_ms must be positive".into()));
        }
        if self.recovery.max_per_poll == 0 {
            return Err(CoreError::Config("recovery.max_per_poll must be positive".into()));
        }
        if self.delivery.capacity == 0 {
            return Err(CoreError::Config("delivery.capacity must be positive".into()));
        }
        if self.backend == Backend::Quorum && self.quorum.replicas == 0 {
            return Err(CoreError::Config("quorum.replicas must be positive".into()));
        }
        Ok(())
    }

    pub fn build_repository(&self) -> CoreResult<Arc<dyn RepositoryContract>> {
        Ok(match self.backend {
            Backend::Memory => Arc::new(InMemoryRepository::new()),
            Backend::Quorum => Arc::new(QuorumRepository::new(self.quorum.clone())?),
        })
    }

    pub fn build_store(&self) -> CoreResult<EventStore> {
        Ok(EventStore::new(self.build_repository()?))
    }
}
