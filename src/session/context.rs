//! Client-facing contexts.
//!
//! A context is one conversation. Direct contexts own a slot for their whole
//! life; pooled contexts (MinUpload, MinDiscard) keep their own copy of the
//! conversation and borrow a slot from the session only while generating.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::pool::SlotId;
use super::Session;
use crate::driver::{Descriptor, TokenId};
use crate::error::{Error, Result};
use crate::memory::{GrowableBuffer, TokenWindow};
use crate::telemetry::{GenerateSpan, SpanExt};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// How a context maps onto evaluation slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// A dedicated slot, never shared while the context lives.
    Direct,
    /// Pooled; prefer the slot needing the fewest evaluated tokens.
    MinUpload,
    /// Pooled; prefer the slot discarding the fewest resident tokens.
    MinDiscard,
}

impl ContextKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::MinUpload => "min_upload",
            Self::MinDiscard => "min_discard",
        }
    }
}

enum Backing {
    Dedicated {
        descriptor: Descriptor,
    },
    Pooled {
        desired: TokenWindow,
        desired_len: u32,
        bound: Option<SlotId>,
    },
}

/// A conversation handle created from a [`Session`].
pub struct Context<'s> {
    session: &'s Session,
    id: ContextId,
    kind: ContextKind,
    generating: bool,
    logits: Vec<f32>,
    token_buf: GrowableBuffer<TokenId>,
    text_buf: GrowableBuffer<u8>,
    backing: Backing,
}

impl<'s> Context<'s> {
    pub(crate) fn new(session: &'s Session, kind: ContextKind) -> Result<Self> {
        let info = session.model_info();

        let mut logits = Vec::new();
        logits.try_reserve_exact(info.vocab_size as usize)?;
        logits.resize(info.vocab_size as usize, 0.0);

        let backing = match kind {
            ContextKind::Direct => Backing::Dedicated {
                descriptor: session.create_dedicated()?,
            },
            ContextKind::MinUpload | ContextKind::MinDiscard => Backing::Pooled {
                desired: TokenWindow::try_new(info.max_context_length as usize)?,
                desired_len: 0,
                bound: None,
            },
        };

        let id = ContextId::next();
        debug!(context_id = %id, kind = kind.as_str(), "context created");
        Ok(Self {
            session,
            id,
            kind,
            generating: false,
            logits,
            token_buf: GrowableBuffer::new(),
            text_buf: GrowableBuffer::new(),
            backing,
        })
    }

    /// Destroy the context. Direct slots are recycled into the pool.
    pub fn destroy(self) {
        drop(self);
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    /// The pooled slot currently bound, if any.
    pub fn bound_slot(&self) -> Option<SlotId> {
        match &self.backing {
            Backing::Pooled { bound, .. } => *bound,
            Backing::Dedicated { .. } => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound_slot().is_some()
    }

    /// The dedicated slot of a direct context.
    pub fn descriptor(&self) -> Option<Descriptor> {
        match &self.backing {
            Backing::Dedicated { descriptor } => Some(*descriptor),
            Backing::Pooled { .. } => None,
        }
    }

    /// The conversation as of the last bind or completed generation.
    /// Always empty for direct contexts.
    pub fn window(&self) -> &[TokenId] {
        match &self.backing {
            Backing::Pooled { desired, desired_len, .. } => desired.prefix(*desired_len as usize),
            Backing::Dedicated { .. } => &[],
        }
    }

    /// Logits produced by the last successful `generate_next`.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Tokenize `text`, growing the token buffer if the driver asks for more.
    pub fn tokenize(&mut self, text: &str) -> Result<&[TokenId]> {
        let driver = self.session.driver();
        let n = self.token_buf.fill_with(|out| driver.tokenize(text, out))?;
        Ok(&self.token_buf.as_slice()[..n])
    }

    /// Decode one token to raw bytes.
    pub fn decode_token(&mut self, token: TokenId) -> Result<&[u8]> {
        let driver = self.session.driver();
        let n = self.text_buf.fill_with(|out| driver.decode_token(token, out))?;
        Ok(&self.text_buf.as_slice()[..n])
    }

    /// Decode one token and require it to be valid UTF-8 on its own.
    pub fn decode_token_str(&mut self, token: TokenId) -> Result<&str> {
        let bytes = self.decode_token(token)?;
        std::str::from_utf8(bytes)
            .map_err(|e| Error::Invalid(format!("token {} is not valid UTF-8: {}", token, e)))
    }

    /// Start a generation. Fails if one is already running.
    pub fn begin_generate(&mut self) -> Result<()> {
        if self.generating {
            error!(context_id = %self.id, "context is already generating");
            return Err(Error::invalid(format!("{} is already generating", self.id)));
        }
        self.generating = true;
        Ok(())
    }

    /// Evaluate `tokens` at `offset` and return the resulting logits.
    ///
    /// For pooled contexts the first call binds a slot and evaluates only the
    /// part of the conversation the slot does not already hold. Later calls
    /// append directly to the bound slot and may not start past its filled
    /// length.
    pub fn generate_next(&mut self, tokens: &[TokenId], offset: u32) -> Result<&[f32]> {
        let span = GenerateSpan::new(self.id, self.kind, offset, tokens.len());
        let result = span.in_scope(|| self.evaluate(tokens, offset));
        span.record_result(&result);
        result?;
        Ok(&self.logits)
    }

    /// Finish the generation, saving the slot's tokens back into the
    /// conversation and releasing the slot to the pool.
    pub fn end_generate(&mut self) -> Result<()> {
        if !self.generating {
            error!(context_id = %self.id, "context is not generating");
            return Err(Error::invalid(format!("{} is not generating", self.id)));
        }

        if let Backing::Pooled { desired, desired_len, bound } = &mut self.backing {
            if let Some(slot) = bound.take() {
                *desired_len = self.session.end_binding(self.id, slot, desired);
            }
        }
        self.generating = false;
        Ok(())
    }

    fn evaluate(&mut self, tokens: &[TokenId], offset: u32) -> Result<()> {
        if !self.generating {
            error!(context_id = %self.id, "context is not generating");
            return Err(Error::invalid(format!("{} is not generating", self.id)));
        }

        let session = self.session;
        let max = session.model_info().max_context_length;
        let end = u32::try_from(tokens.len())
            .ok()
            .and_then(|n| offset.checked_add(n))
            .filter(|&end| end <= max)
            .ok_or_else(|| {
                error!(context_id = %self.id, offset, num_tokens = tokens.len(), "context will overflow");
                Error::invalid(format!(
                    "{} tokens at offset {} overflow the context of {}",
                    tokens.len(),
                    offset,
                    max
                ))
            })?;
        let driver = session.driver();

        match &mut self.backing {
            Backing::Dedicated { descriptor } => {
                driver.generate(*descriptor, tokens, offset, &mut self.logits)
            }
            Backing::Pooled { desired, desired_len, bound } => match *bound {
                None => {
                    // A failed bind must leave the saved conversation as it was.
                    let saved = desired.range(offset as usize, end as usize)?.to_vec();
                    desired.write(offset as usize, tokens)?;
                    let binding =
                        match session.bind_for_generation(self.id, self.kind, desired, end as usize) {
                            Ok(binding) => binding,
                            Err(e) => {
                                desired.write(offset as usize, &saved)?;
                                return Err(e);
                            }
                        };
                    *bound = Some(binding.slot);
                    *desired_len = end;

                    let eval = desired.range(binding.eval_offset as usize, end as usize)?;
                    driver.generate(binding.descriptor, eval, binding.eval_offset, &mut self.logits)?;
                    session.commit_fill(self.id, binding.slot, end);
                    Ok(())
                }
                Some(slot) => {
                    let descriptor = session.stage_append(self.id, slot, tokens, offset)?;
                    driver.generate(descriptor, tokens, offset, &mut self.logits)?;
                    session.commit_fill(self.id, slot, end);
                    Ok(())
                }
            },
        }
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        if self.generating {
            warn!(context_id = %self.id, "context destroyed while generating");
            if let Backing::Pooled { bound, .. } = &mut self.backing {
                if let Some(slot) = bound.take() {
                    self.session.unbind(self.id, slot);
                }
            }
            self.generating = false;
        }

        if let Backing::Dedicated { descriptor } = self.backing {
            self.session.recycle_dedicated(descriptor);
        }
        debug!(context_id = %self.id, "context destroyed");
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("generating", &self.generating)
            .field("bound_slot", &self.bound_slot())
            .finish()
    }
}
