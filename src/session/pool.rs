//! Arena of shareable evaluation slots.
//!
//! Slots are appended and never removed while the session lives, so a
//! [`SlotId`] stays valid for the session's lifetime.

use serde::Serialize;

use super::physical::PhysicalContext;
use crate::driver::Descriptor;

/// Index of a pooled slot within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pooled slots.
    pub total: usize,
    pub free: usize,
    pub bound: usize,
    /// Slots held by live direct contexts, outside the pool.
    pub dedicated: usize,
    /// Sum of `filled_size` over pooled slots.
    pub resident_tokens: u64,
}

#[derive(Default)]
pub(crate) struct Pool {
    slots: Vec<PhysicalContext>,
    /// Descriptors held by live direct contexts.
    dedicated: Vec<Descriptor>,
}

impl Pool {
    pub(crate) fn insert(&mut self, pc: PhysicalContext) -> SlotId {
        self.slots.push(pc);
        SlotId(self.slots.len() - 1)
    }

    pub(crate) fn get(&self, slot: SlotId) -> Option<&PhysicalContext> {
        self.slots.get(slot.0)
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Option<&mut PhysicalContext> {
        self.slots.get_mut(slot.0)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotId, &PhysicalContext)> {
        self.slots.iter().enumerate().map(|(i, pc)| (SlotId(i), pc))
    }

    /// Pooled plus dedicated slots, the figure the slot cap applies to.
    pub(crate) fn live_slots(&self) -> usize {
        self.slots.len() + self.dedicated.len()
    }

    pub(crate) fn add_dedicated(&mut self, descriptor: Descriptor) {
        self.dedicated.push(descriptor);
    }

    pub(crate) fn remove_dedicated(&mut self, descriptor: Descriptor) {
        self.dedicated.retain(|&d| d != descriptor);
    }

    /// Take every pooled slot and every still-registered dedicated descriptor.
    pub(crate) fn drain(&mut self) -> (Vec<PhysicalContext>, Vec<Descriptor>) {
        (std::mem::take(&mut self.slots), std::mem::take(&mut self.dedicated))
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let free = self.slots.iter().filter(|pc| pc.is_free()).count();
        PoolStats {
            total: self.slots.len(),
            free,
            bound: self.slots.len() - free,
            dedicated: self.dedicated.len(),
            resident_tokens: self.slots.iter().map(|pc| pc.filled_size as u64).sum(),
        }
    }
}
