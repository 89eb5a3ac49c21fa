//! Deterministic in-memory driver for testing and CPU-less environments.
//!
//! Tokenization is byte level: every UTF-8 byte maps to
//! `byte + BYTE_TOKEN_BASE`, ids below the base are special tokens. The
//! "model" predicts `last_token + 1`, emitted as a one-hot logits vector, so
//! callers can check which position was evaluated last.
//!
//! The driver mirrors each slot's token sequence so tests can verify that the
//! host-side resident windows agree with what the backend actually holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Descriptor, Driver, ModelInfo, TokenId};
use crate::error::{Error, Result};

/// First token id used for byte tokens. `0..BYTE_TOKEN_BASE` are specials.
pub const BYTE_TOKEN_BASE: TokenId = 3;

const UNK_TOKEN: TokenId = 0;

/// Configuration for [`MockDriver`].
#[derive(Debug, Clone)]
pub struct MockDriverConfig {
    pub model_info: ModelInfo,
    /// Maximum number of live slots; `0` means unlimited.
    pub max_contexts: usize,
}

impl Default for MockDriverConfig {
    fn default() -> Self {
        Self {
            model_info: ModelInfo {
                bos_token: 1,
                eos_token: 2,
                nl_token: b'\n' as TokenId + BYTE_TOKEN_BASE,
                vocab_size: 256 + BYTE_TOKEN_BASE,
                max_context_length: 64,
            },
            max_contexts: 0,
        }
    }
}

/// A recorded `generate` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateCall {
    pub descriptor: Descriptor,
    pub tokens: Vec<TokenId>,
    pub offset: u32,
}

#[derive(Default)]
struct MockState {
    next_descriptor: Descriptor,
    slots: HashMap<Descriptor, Vec<TokenId>>,
    created_total: usize,
    destroyed: Vec<Descriptor>,
    generate_calls: Vec<GenerateCall>,
    buffer_requests: Vec<usize>,
}

/// Mock driver backed by host memory.
pub struct MockDriver {
    config: MockDriverConfig,
    state: Mutex<MockState>,
    failing_creates: AtomicUsize,
    fail_destroy: AtomicBool,
    fail_generate: AtomicBool,
    fail_model_info: AtomicBool,
    undersized_buffers: AtomicBool,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(MockDriverConfig::default())
    }
}

impl MockDriver {
    pub fn new(config: MockDriverConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MockState::default()),
            failing_creates: AtomicUsize::new(0),
            fail_destroy: AtomicBool::new(false),
            fail_generate: AtomicBool::new(false),
            fail_model_info: AtomicBool::new(false),
            undersized_buffers: AtomicBool::new(false),
        }
    }

    /// Mock with the default vocabulary and the given context length.
    pub fn with_context_length(max_context_length: u32) -> Self {
        let mut config = MockDriverConfig::default();
        config.model_info.max_context_length = max_context_length;
        Self::new(config)
    }

    /// Byte-level tokenization used by this driver, for building expectations.
    pub fn encode(text: &str) -> Vec<TokenId> {
        text.bytes().map(|b| b as TokenId + BYTE_TOKEN_BASE).collect()
    }

    // -- failure injection ----------------------------------------------------

    /// Make the next `count` calls to `create_context` fail with `Io`.
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_generate(&self, fail: bool) {
        self.fail_generate.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_model_info(&self, fail: bool) {
        self.fail_model_info.store(fail, Ordering::SeqCst);
    }

    /// Report `BufTooSmall` with a size larger than any buffer offered.
    pub fn set_undersized_buffers(&self, enabled: bool) {
        self.undersized_buffers.store(enabled, Ordering::SeqCst);
    }

    // -- inspection -----------------------------------------------------------

    /// Count of live (un-destroyed) slots, useful for leak detection.
    pub fn live_contexts(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn created_total(&self) -> usize {
        self.state.lock().created_total
    }

    pub fn destroyed_contexts(&self) -> Vec<Descriptor> {
        self.state.lock().destroyed.clone()
    }

    /// Tokens the backend currently holds for `descriptor`.
    pub fn slot_tokens(&self, descriptor: Descriptor) -> Option<Vec<TokenId>> {
        self.state.lock().slots.get(&descriptor).cloned()
    }

    pub fn generate_calls(&self) -> Vec<GenerateCall> {
        self.state.lock().generate_calls.clone()
    }

    pub fn clear_generate_calls(&self) {
        self.state.lock().generate_calls.clear();
    }

    /// Buffer lengths offered to `tokenize` and `decode_token`, in call order.
    pub fn buffer_requests(&self) -> Vec<usize> {
        self.state.lock().buffer_requests.clone()
    }

    fn required_len(&self, offered: usize, produced: usize) -> usize {
        if self.undersized_buffers.load(Ordering::SeqCst) {
            offered.max(produced) + 1
        } else {
            produced
        }
    }

    fn decode_bytes(&self, token: TokenId) -> Vec<u8> {
        let info = &self.config.model_info;
        if token == info.bos_token {
            b"<s>".to_vec()
        } else if token == info.eos_token {
            b"</s>".to_vec()
        } else if token >= BYTE_TOKEN_BASE && token < BYTE_TOKEN_BASE + 256 {
            vec![(token - BYTE_TOKEN_BASE) as u8]
        } else {
            b"<unk>".to_vec()
        }
    }
}

impl Driver for MockDriver {
    fn model_info(&self) -> Result<ModelInfo> {
        if self.fail_model_info.load(Ordering::SeqCst) {
            return Err(Error::Io("model info unavailable".to_string()));
        }
        Ok(self.config.model_info)
    }

    fn create_context(&self) -> Result<Descriptor> {
        let pending = self.failing_creates.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_creates.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Io("slot allocation failed".to_string()));
        }

        let mut s = self.state.lock();
        if self.config.max_contexts > 0 && s.slots.len() >= self.config.max_contexts {
            return Err(Error::Oom);
        }
        let descriptor = s.next_descriptor;
        s.next_descriptor += 1;
        s.created_total += 1;
        s.slots.insert(descriptor, Vec::new());
        Ok(descriptor)
    }

    fn destroy_context(&self, descriptor: Descriptor) -> Result<()> {
        let mut s = self.state.lock();
        if s.slots.remove(&descriptor).is_none() {
            return Err(Error::Invalid(format!(
                "double-free or unknown descriptor {}",
                descriptor
            )));
        }
        s.destroyed.push(descriptor);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::Io(format!("destroy of {} reported failure", descriptor)));
        }
        Ok(())
    }

    fn tokenize(&self, text: &str, tokens_out: &mut [TokenId]) -> Result<usize> {
        self.state.lock().buffer_requests.push(tokens_out.len());
        let tokens = Self::encode(text);
        let required = self.required_len(tokens_out.len(), tokens.len());
        if tokens_out.len() < required {
            return Err(Error::BufTooSmall { required });
        }
        tokens_out[..tokens.len()].copy_from_slice(&tokens);
        Ok(tokens.len())
    }

    fn decode_token(&self, token: TokenId, text_out: &mut [u8]) -> Result<usize> {
        self.state.lock().buffer_requests.push(text_out.len());
        let bytes = self.decode_bytes(token);
        let required = self.required_len(text_out.len(), bytes.len());
        if text_out.len() < required {
            return Err(Error::BufTooSmall { required });
        }
        text_out[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate(
        &self,
        descriptor: Descriptor,
        tokens: &[TokenId],
        offset: u32,
        logits_out: &mut [f32],
    ) -> Result<()> {
        let info = &self.config.model_info;
        let mut s = self.state.lock();
        s.generate_calls.push(GenerateCall {
            descriptor,
            tokens: tokens.to_vec(),
            offset,
        });

        if logits_out.len() != info.vocab_size as usize {
            return Err(Error::Invalid(format!(
                "logits buffer holds {} entries, vocab is {}",
                logits_out.len(),
                info.vocab_size
            )));
        }
        let window = s
            .slots
            .get_mut(&descriptor)
            .ok_or_else(|| Error::Invalid(format!("unknown descriptor {}", descriptor)))?;

        let offset = offset as usize;
        if offset > window.len() {
            return Err(Error::Invalid(format!(
                "offset {} is past the {} evaluated tokens",
                offset,
                window.len()
            )));
        }
        if offset + tokens.len() > info.max_context_length as usize {
            return Err(Error::Invalid("context overflow".to_string()));
        }
        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(Error::Io("evaluation failed".to_string()));
        }

        window.truncate(offset);
        window.extend_from_slice(tokens);

        let last = window.last().copied().unwrap_or(info.bos_token);
        let predicted = if last >= info.vocab_size { UNK_TOKEN } else { (last + 1) % info.vocab_size };
        logits_out.fill(0.0);
        logits_out[predicted as usize] = 1.0;
        Ok(())
    }
}
