//! Driver capability interface.
//!
//! A driver is the backend that actually owns evaluation slots, tokenizes
//! text and evaluates tokens. The core never performs inference itself; it
//! only decides which slot to use and which token range must be sent.
//!
//! Drivers are shared as `Arc<dyn Driver>`. Every method takes `&self`, so
//! backends manage their own interior mutability.

mod mock;

pub use mock::{GenerateCall, MockDriver, MockDriverConfig, BYTE_TOKEN_BASE};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Token identifier as understood by the driver's vocabulary.
pub type TokenId = u32;

/// Driver-assigned handle of a backend evaluation slot. Live slots are `>= 0`.
pub type Descriptor = i32;

/// Immutable model description, fetched once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub bos_token: TokenId,
    pub eos_token: TokenId,
    pub nl_token: TokenId,
    pub vocab_size: u32,
    pub max_context_length: u32,
}

/// Backend capability set consumed by the session.
///
/// Buffer-filling methods (`tokenize`, `decode_token`) write into the
/// caller's slice and return the number of elements produced. When the slice
/// is too short they must fail with
/// [`Error::BufTooSmall`](crate::Error::BufTooSmall) carrying the exact
/// length required.
pub trait Driver: Send + Sync {
    /// Describe the loaded model.
    fn model_info(&self) -> Result<ModelInfo>;

    /// Allocate a new evaluation slot.
    fn create_context(&self) -> Result<Descriptor>;

    /// Release an evaluation slot.
    fn destroy_context(&self, descriptor: Descriptor) -> Result<()>;

    /// Tokenize `text` into `tokens_out`.
    fn tokenize(&self, text: &str, tokens_out: &mut [TokenId]) -> Result<usize>;

    /// Decode a single token into raw bytes.
    fn decode_token(&self, token: TokenId, text_out: &mut [u8]) -> Result<usize>;

    /// Evaluate `tokens` at position `offset` of the slot, writing
    /// `vocab_size` logits for the last evaluated position.
    fn generate(
        &self,
        descriptor: Descriptor,
        tokens: &[TokenId],
        offset: u32,
        logits_out: &mut [f32],
    ) -> Result<()>;
}
