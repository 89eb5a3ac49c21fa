//! Span utilities for generation steps.

use tracing::{debug_span, Span};

use crate::session::{ContextId, ContextKind};

/// Extension trait for recording results into spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for per-step generation spans.
pub struct GenerateSpan;

impl GenerateSpan {
    /// Span for one `generate_next` call.
    ///
    /// `status` and `error.message` are filled in by
    /// [`SpanExt::record_result`].
    pub fn new(context_id: ContextId, kind: ContextKind, offset: u32, num_tokens: usize) -> Span {
        debug_span!(
            "generate_next",
            context_id = %context_id,
            kind = kind.as_str(),
            offset,
            num_tokens,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
