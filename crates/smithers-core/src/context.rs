//! Explicit run context threaded through the loop and its collaborators.

use crate::config::SmithersConfig;
use crate::store::StateStore;
use smithers_proto::Result;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Store, execution id, and configuration for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub store: StateStore,
    pub execution_id: String,
    pub config: Arc<SmithersConfig>,
}

impl RunContext {
    /// Wraps an existing store.
    pub fn new(store: StateStore, config: SmithersConfig) -> Self {
        Self {
            execution_id: store.execution_id(),
            store,
            config: Arc::new(config),
        }
    }

    /// Opens the store described by `config.store`.
    ///
    /// Without an execution id a fresh one is generated. With a persistent
    /// store and a known id, the existing journal is replayed.
    pub fn open(config: SmithersConfig, execution_id: Option<String>) -> Result<Self> {
        let execution_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let store = if config.store.persist {
            StateStore::open(&config.store.dir, execution_id.clone())?
        } else {
            StateStore::in_memory(execution_id.clone())
        };
        debug!(execution_id = %execution_id, persist = config.store.persist, "Run context opened");
        Ok(Self {
            store,
            execution_id,
            config: Arc::new(config),
        })
    }

    /// An in-memory context with default configuration.
    pub fn in_memory() -> Self {
        Self::new(
            StateStore::in_memory(Uuid::new_v4().to_string()),
            SmithersConfig::default(),
        )
    }
}
