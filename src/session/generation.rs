//! Scoped generation handle.

use tracing::warn;

use super::context::Context;
use crate::driver::TokenId;
use crate::error::Result;

/// A running generation. Ends itself on drop if [`Generation::end`] was not
/// called, releasing any bound slot back to the pool.
pub struct Generation<'c, 's> {
    ctx: &'c mut Context<'s>,
    ended: bool,
}

impl<'c, 's> Generation<'c, 's> {
    /// Evaluate `tokens` at `offset`; see [`Context::generate_next`].
    pub fn step(&mut self, tokens: &[TokenId], offset: u32) -> Result<&[f32]> {
        self.ctx.generate_next(tokens, offset)
    }

    pub fn context(&self) -> &Context<'s> {
        &*self.ctx
    }

    /// End the generation explicitly.
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.ctx.end_generate()
    }
}

impl Drop for Generation<'_, '_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if let Err(e) = self.ctx.end_generate() {
            warn!(context_id = %self.ctx.id(), error = %e, "failed to end generation on drop");
        }
    }
}

impl<'s> Context<'s> {
    /// Begin a generation scoped to the returned handle.
    pub fn generation(&mut self) -> Result<Generation<'_, 's>> {
        self.begin_generate()?;
        Ok(Generation { ctx: self, ended: false })
    }
}
