//! MUX-CORE
//!
//! Multiplexes many independent conversations onto a small pool of
//! expensive model evaluation slots. Each slot holds a resident token window
//! on the backend; a conversation borrows a slot only while generating, and
//! the session picks the slot whose resident tokens can be reused the most.
//!
//! # Components
//!
//! - **Driver**: the backend capability set (tokenize, decode, evaluate).
//! - **Session**: caches model info and owns the slot pool.
//! - **Context**: a conversation handle, either `Direct` (dedicated slot)
//!   or pooled with the `MinUpload` / `MinDiscard` binding policy.
//!
//! ```
//! use std::sync::Arc;
//! use mux_core::{ContextKind, MockDriver, Session};
//!
//! let session = Session::new(Arc::new(MockDriver::default())).unwrap();
//! let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
//! let prompt = ctx.tokenize("hi").unwrap().to_vec();
//!
//! let mut generation = ctx.generation().unwrap();
//! let logits = generation.step(&prompt, 0).unwrap();
//! assert_eq!(logits.len(), session.model_info().vocab_size as usize);
//! generation.end().unwrap();
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod memory;
pub mod session;
pub mod telemetry;

pub use driver::{Descriptor, Driver, MockDriver, MockDriverConfig, ModelInfo, TokenId};
pub use error::{Error, Result};
pub use session::{
    Context, ContextId, ContextKind, Generation, PoolStats, Session, SessionConfig, SlotId,
    SlotSnapshot,
};
