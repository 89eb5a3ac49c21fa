//! Binding engine: matches a context's desired tokens against free slots.
//!
//! Two greedy policies share one scan over the pool:
//!
//! - **MinUpload** minimises tokens the driver must evaluate:
//!   `cost = desired_len - shared_prefix`. With no candidate a new slot is
//!   created and everything is uploaded.
//! - **MinDiscard** minimises resident tokens thrown away:
//!   `cost = filled_size - shared_prefix`. Unless a zero-cost candidate exists
//!   a new slot is tried first; the best candidate is the fallback when the
//!   pool cannot grow.
//!
//! Candidates must beat a running best that starts at `max_context_length`,
//! with strict `<`, so the first slot in pool order wins ties.
//!
//! Every function here runs with the pool locked. This module is the only
//! place a slot's `owner` or `filled_size` changes.

use tracing::debug;

use super::context::{ContextId, ContextKind};
use super::pool::{Pool, SlotId};
use super::Session;
use crate::driver::{Descriptor, TokenId};
use crate::error::{Error, Result};
use crate::memory::TokenWindow;
use crate::telemetry;

/// Length of the longest common prefix of `a[..len]` and `b[..len]`.
pub fn shared_prefix(a: &[TokenId], b: &[TokenId], len: usize) -> usize {
    a.iter()
        .zip(b)
        .take(len)
        .take_while(|(x, y)| x == y)
        .count()
}

/// Outcome of binding a context to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding {
    pub slot: SlotId,
    pub descriptor: Descriptor,
    /// First position the driver must evaluate.
    pub eval_offset: u32,
    /// Whether the slot was created for this bind.
    pub created: bool,
}

struct Candidate {
    slot: SlotId,
    cost: u32,
}

struct Selection {
    slot: SlotId,
    eval_offset: u32,
    created: bool,
}

/// Scan free slots in pool order and keep the cheapest strictly-better one.
fn scan_free<F>(pool: &Pool, desired: &[TokenId], initial: u32, cost: F) -> Option<Candidate>
where
    F: Fn(u32, u32) -> u32,
{
    let desired_len = desired.len() as u32;
    let mut best: Option<Candidate> = None;
    let mut best_cost = initial;

    for (slot, pc) in pool.iter() {
        if !pc.is_free() {
            continue;
        }
        let filled = pc.filled_size;
        let k = shared_prefix(desired, pc.resident.as_slice(), filled.min(desired_len) as usize) as u32;
        let c = cost(filled, k);
        if c < best_cost {
            best_cost = c;
            best = Some(Candidate { slot, cost: c });
        }
    }
    best
}

impl Session {
    fn select(&self, pool: &mut Pool, kind: ContextKind, desired: &[TokenId]) -> Result<Selection> {
        let desired_len = desired.len() as u32;
        let sentinel = self.model_info.max_context_length;

        match kind {
            ContextKind::MinUpload => {
                let best = scan_free(pool, desired, sentinel, |_, k| desired_len - k);
                let (slot, upload, created) = match best {
                    Some(c) => (c.slot, c.cost, false),
                    None => (self.create_shared_physical(pool)?, desired_len, true),
                };
                Ok(Selection {
                    slot,
                    eval_offset: desired_len - upload,
                    created,
                })
            }
            ContextKind::MinDiscard => {
                let best = scan_free(pool, desired, sentinel, |filled, k| filled - k);
                let (slot, discard, created) = match best {
                    Some(c) if c.cost == 0 => (c.slot, 0, false),
                    best => match self.create_shared_physical(pool) {
                        Ok(slot) => (slot, 0, true),
                        Err(e) => match best {
                            Some(c) => (c.slot, c.cost, false),
                            None => return Err(e),
                        },
                    },
                };
                let filled = pool
                    .get(slot)
                    .map(|pc| pc.filled_size)
                    .ok_or_else(|| Error::Invalid(format!("slot {} vanished", slot.index())))?;
                Ok(Selection {
                    slot,
                    eval_offset: filled - discard,
                    created,
                })
            }
            ContextKind::Direct => Err(Error::NotSupported(
                "direct contexts own a dedicated slot and are never bound".to_string(),
            )),
        }
    }

    /// Bind `owner` to the best slot for `desired[..desired_len]` and stage
    /// the tokens the driver must evaluate into the slot's resident window.
    ///
    /// On return the slot is owned, its resident window holds the full
    /// desired prefix, and `filled_size` is truncated to `eval_offset` until
    /// [`Session::commit_fill`] confirms the evaluation.
    pub(crate) fn bind_for_generation(
        &self,
        owner: ContextId,
        kind: ContextKind,
        desired: &TokenWindow,
        desired_len: usize,
    ) -> Result<Binding> {
        let mut pool = self.pool.lock();
        let selection = self.select(&mut pool, kind, desired.prefix(desired_len))?;

        let pc = pool
            .get_mut(selection.slot)
            .ok_or_else(|| Error::Invalid(format!("slot {} vanished", selection.slot.index())))?;
        pc.resident
            .copy_range_from(desired, selection.eval_offset as usize, desired_len)?;
        pc.filled_size = selection.eval_offset;
        pc.owner = Some(owner);
        let descriptor = pc.descriptor;

        let reused = selection.eval_offset as u64;
        debug!(
            context_id = %owner,
            policy = kind.as_str(),
            slot = selection.slot.index(),
            descriptor,
            created = selection.created,
            eval_offset = selection.eval_offset,
            desired_len,
            "context bound"
        );
        telemetry::record_bind(kind.as_str(), selection.created);
        telemetry::record_tokens(desired_len as u64 - reused, reused);
        telemetry::record_pool(&pool.stats());

        Ok(Binding {
            slot: selection.slot,
            descriptor,
            eval_offset: selection.eval_offset,
            created: selection.created,
        })
    }

    /// Stage tokens appended to an already-bound slot.
    ///
    /// `offset` may not exceed the slot's `filled_size`. Nothing changes when
    /// the check fails.
    pub(crate) fn stage_append(
        &self,
        owner: ContextId,
        slot: SlotId,
        tokens: &[TokenId],
        offset: u32,
    ) -> Result<Descriptor> {
        let mut pool = self.pool.lock();
        let pc = pool
            .get_mut(slot)
            .filter(|pc| pc.owner == Some(owner))
            .ok_or_else(|| Error::Invalid(format!("slot {} is not bound to {}", slot.index(), owner)))?;

        if offset > pc.filled_size {
            return Err(Error::Invalid(format!(
                "offset {} is past the {} filled tokens of slot {}",
                offset,
                pc.filled_size,
                slot.index()
            )));
        }
        pc.resident.write(offset as usize, tokens)?;
        pc.filled_size = offset;
        telemetry::record_tokens(tokens.len() as u64, 0);
        Ok(pc.descriptor)
    }

    /// Record that the driver now holds `filled` valid tokens for `slot`.
    pub(crate) fn commit_fill(&self, owner: ContextId, slot: SlotId, filled: u32) {
        let mut pool = self.pool.lock();
        if let Some(pc) = pool.get_mut(slot).filter(|pc| pc.owner == Some(owner)) {
            pc.filled_size = filled.min(self.model_info.max_context_length);
        }
    }

    /// Copy the slot's resident tokens back into `desired`, then unbind.
    /// Returns the number of tokens copied.
    pub(crate) fn end_binding(&self, owner: ContextId, slot: SlotId, desired: &mut TokenWindow) -> u32 {
        let mut pool = self.pool.lock();
        let Some(pc) = pool.get_mut(slot).filter(|pc| pc.owner == Some(owner)) else {
            return 0;
        };

        let filled = pc.filled_size;
        let copied = match desired.copy_range_from(&pc.resident, 0, filled as usize) {
            Ok(()) => filled,
            Err(e) => {
                debug!(context_id = %owner, error = %e, "could not copy resident window back");
                0
            }
        };
        pc.owner = None;
        debug!(context_id = %owner, slot = slot.index(), filled, "context unbound");
        telemetry::record_pool(&pool.stats());
        copied
    }

    /// Release `slot` without touching its resident state.
    pub(crate) fn unbind(&self, owner: ContextId, slot: SlotId) {
        let mut pool = self.pool.lock();
        if let Some(pc) = pool.get_mut(slot).filter(|pc| pc.owner == Some(owner)) {
            pc.owner = None;
            debug!(context_id = %owner, slot = slot.index(), "context unbound");
        }
        telemetry::record_pool(&pool.stats());
    }
}
