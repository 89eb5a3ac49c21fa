//! Session and context multiplexing.
//!
//! A [`Session`] owns a pool of backend evaluation slots and hands out
//! [`Context`]s, the client-facing conversation handles. Pooled contexts only
//! hold a slot for the duration of one generation; between generations the
//! slot's resident tokens stay behind so the next binder can reuse whatever
//! prefix it shares.
//!
//! All pool mutation (bind, unbind, create, recycle, destroy) happens under a
//! single mutex, so a `Session` can be shared across threads.

mod binding;
mod context;
mod generation;
mod physical;
mod pool;

pub use binding::shared_prefix;
pub use context::{Context, ContextId, ContextKind};
pub use generation::Generation;
pub use physical::SlotSnapshot;
pub use pool::{PoolStats, SlotId};

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::driver::{Driver, ModelInfo};
use crate::error::{Error, Result};
use crate::telemetry;
use pool::Pool;

/// Configuration for a session's slot pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on live slots (pooled plus dedicated). `0` means unlimited.
    pub max_physical_contexts: usize,
    /// Number of shared slots to create eagerly when the session starts.
    pub preallocate: usize,
}

impl SessionConfig {
    /// Preallocation clamped to the slot cap.
    pub fn effective_preallocate(&self) -> usize {
        if self.max_physical_contexts > 0 {
            self.preallocate.min(self.max_physical_contexts)
        } else {
            self.preallocate
        }
    }
}

/// A driver plus the pool of evaluation slots shared by its contexts.
pub struct Session {
    driver: Arc<dyn Driver>,
    model_info: ModelInfo,
    config: SessionConfig,
    pool: Mutex<Pool>,
}

impl Session {
    /// Create a session with default configuration.
    pub fn new(driver: Arc<dyn Driver>) -> Result<Self> {
        Self::with_config(driver, SessionConfig::default())
    }

    /// Create a session, fetching and caching the driver's model info.
    pub fn with_config(driver: Arc<dyn Driver>, config: SessionConfig) -> Result<Self> {
        let model_info = driver.model_info()?;
        if model_info.max_context_length == 0 || model_info.vocab_size == 0 {
            return Err(Error::Invalid(format!(
                "driver reported unusable model: vocab_size={}, max_context_length={}",
                model_info.vocab_size, model_info.max_context_length
            )));
        }

        let session = Self {
            driver,
            model_info,
            config,
            pool: Mutex::new(Pool::default()),
        };
        session.preallocate(session.config.effective_preallocate())?;

        info!(
            vocab_size = model_info.vocab_size,
            max_context_length = model_info.max_context_length,
            max_physical_contexts = session.config.max_physical_contexts,
            "session created"
        );
        Ok(session)
    }

    /// Tear the session down, destroying every pooled slot.
    pub fn destroy(self) {
        drop(self);
    }

    pub fn model_info(&self) -> ModelInfo {
        self.model_info
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Create a context of the given kind.
    pub fn create_context(&self, kind: ContextKind) -> Result<Context<'_>> {
        Context::new(self, kind)
    }

    /// Counts of pooled and dedicated slots.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.lock().stats()
    }

    /// Snapshot of every pooled slot, in pool order.
    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.pool.lock().iter().map(|(slot, pc)| pc.snapshot(slot)).collect()
    }

    fn preallocate(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let mut pool = self.pool.lock();
        for _ in 0..count {
            self.create_shared_physical(&mut pool)?;
        }
        telemetry::record_pool(&pool.stats());
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("model_info", &self.model_info)
            .field("config", &self.config)
            .field("pool", &self.pool.lock().stats())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let (slots, dedicated) = self.pool.get_mut().drain();
        for pc in slots {
            if let Some(owner) = pc.owner {
                warn!(descriptor = pc.descriptor, owner = %owner, "destroying slot still bound at teardown");
            }
            self.destroy_physical(pc.descriptor);
        }
        for descriptor in dedicated {
            warn!(descriptor, "destroying direct slot whose context was never dropped");
            self.destroy_physical(descriptor);
        }
        telemetry::record_pool(&PoolStats::default());
    }
}
