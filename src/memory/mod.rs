//! Memory management module for MUX-CORE.
//!
//! Provides the growable buffers used for driver outputs and the
//! fixed-capacity token windows mirrored by every evaluation slot.

mod buffer;
mod window;

pub use buffer::GrowableBuffer;
pub use window::TokenWindow;
