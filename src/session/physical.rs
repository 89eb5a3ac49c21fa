//! Physical context lifecycle.
//!
//! A physical context is one driver slot plus the host-side mirror of the
//! tokens it holds. Creation never leaks a descriptor: if anything after the
//! driver call fails, the descriptor goes back to the driver first.
//! Destruction is best effort and never fails the caller.

use serde::Serialize;
use tracing::{debug, warn};

use super::context::ContextId;
use super::pool::{Pool, SlotId};
use super::Session;
use crate::driver::{Descriptor, TokenId};
use crate::error::{Error, Result};
use crate::memory::TokenWindow;
use crate::telemetry;

pub(crate) struct PhysicalContext {
    pub(crate) descriptor: Descriptor,
    pub(crate) resident: TokenWindow,
    pub(crate) filled_size: u32,
    pub(crate) owner: Option<ContextId>,
}

impl PhysicalContext {
    pub(crate) fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    pub(crate) fn snapshot(&self, slot: SlotId) -> SlotSnapshot {
        SlotSnapshot {
            slot,
            descriptor: self.descriptor,
            filled_size: self.filled_size,
            owner: self.owner,
            tokens: self.resident.prefix(self.filled_size as usize).to_vec(),
        }
    }
}

/// Copy of a pooled slot's observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot: SlotId,
    pub descriptor: Descriptor,
    pub filled_size: u32,
    pub owner: Option<ContextId>,
    /// Resident tokens `0..filled_size`.
    pub tokens: Vec<TokenId>,
}

impl Session {
    fn at_capacity(&self, pool: &Pool) -> bool {
        let max = self.config.max_physical_contexts;
        max > 0 && pool.live_slots() >= max
    }

    /// Ask the driver for a new slot.
    pub(crate) fn create_physical(&self) -> Result<Descriptor> {
        let descriptor = self.driver.create_context()?;
        if descriptor < 0 {
            return Err(Error::Invalid(format!(
                "driver returned negative descriptor {}",
                descriptor
            )));
        }
        Ok(descriptor)
    }

    /// Create a slot with a resident window and add it to the pool as free.
    ///
    /// Any failure is reported as `Oom`; the underlying cause is logged.
    pub(crate) fn create_shared_physical(&self, pool: &mut Pool) -> Result<SlotId> {
        if self.at_capacity(pool) {
            debug!(live = pool.live_slots(), "slot cap reached, not growing pool");
            return Err(Error::Oom);
        }

        let descriptor = self.create_physical().map_err(|e| {
            debug!(error = %e, "driver could not create slot");
            Error::Oom
        })?;

        let resident = match TokenWindow::try_new(self.model_info.max_context_length as usize) {
            Ok(window) => window,
            Err(e) => {
                debug!(descriptor, error = %e, "resident window allocation failed");
                self.destroy_physical(descriptor);
                return Err(Error::Oom);
            }
        };

        let slot = pool.insert(PhysicalContext {
            descriptor,
            resident,
            filled_size: 0,
            owner: None,
        });
        debug!(descriptor, slot = slot.index(), "pooled slot created");
        Ok(slot)
    }

    /// Release a slot back to the driver, logging driver-side failures.
    pub(crate) fn destroy_physical(&self, descriptor: Descriptor) {
        if let Err(e) = self.driver.destroy_context(descriptor) {
            warn!(descriptor, error = %e, "error while freeing slot");
        }
    }

    /// Create a slot for a direct context. It stays outside the pool.
    pub(crate) fn create_dedicated(&self) -> Result<Descriptor> {
        let mut pool = self.pool.lock();
        if self.at_capacity(&pool) {
            return Err(Error::Oom);
        }
        let descriptor = self.create_physical()?;
        pool.add_dedicated(descriptor);
        Ok(descriptor)
    }

    /// Move a direct context's slot into the pool, or destroy it if no
    /// resident window can be allocated.
    pub(crate) fn recycle_dedicated(&self, descriptor: Descriptor) {
        let mut pool = self.pool.lock();
        pool.remove_dedicated(descriptor);

        match TokenWindow::try_new(self.model_info.max_context_length as usize) {
            Ok(resident) => {
                let slot = pool.insert(PhysicalContext {
                    descriptor,
                    resident,
                    filled_size: 0,
                    owner: None,
                });
                debug!(descriptor, slot = slot.index(), "direct slot recycled into pool");
            }
            Err(e) => {
                debug!(descriptor, error = %e, "cannot recycle direct slot, destroying");
                self.destroy_physical(descriptor);
            }
        }
        telemetry::record_pool(&pool.stats());
    }
}
