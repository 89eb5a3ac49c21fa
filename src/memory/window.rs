//! Fixed-capacity token windows.
//!
//! A window is sized once to the model's maximum context length and indexed
//! by explicit lengths kept by its owner. Writes are bounds-checked.

use crate::driver::TokenId;
use crate::error::{Error, Result};

/// Token array of fixed capacity, allocated fallibly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWindow {
    tokens: Box<[TokenId]>,
}

impl TokenWindow {
    /// Allocate a zeroed window, reporting `Oom` instead of aborting.
    pub fn try_new(capacity: usize) -> Result<Self> {
        let mut tokens = Vec::new();
        tokens.try_reserve_exact(capacity)?;
        tokens.resize(capacity, 0);
        Ok(Self { tokens: tokens.into_boxed_slice() })
    }

    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    pub fn as_slice(&self) -> &[TokenId] {
        &self.tokens
    }

    /// The first `len` tokens, clamped to capacity.
    pub fn prefix(&self, len: usize) -> &[TokenId] {
        &self.tokens[..len.min(self.tokens.len())]
    }

    /// Tokens in `start..end`.
    pub fn range(&self, start: usize, end: usize) -> Result<&[TokenId]> {
        self.tokens.get(start..end).ok_or_else(|| {
            Error::Invalid(format!("range {}..{} outside window of {}", start, end, self.capacity()))
        })
    }

    /// Overwrite `tokens.len()` positions starting at `offset`.
    pub fn write(&mut self, offset: usize, tokens: &[TokenId]) -> Result<()> {
        let capacity = self.capacity();
        let end = offset
            .checked_add(tokens.len())
            .filter(|&end| end <= capacity)
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "writing {} tokens at {} overflows window of {}",
                    tokens.len(),
                    offset,
                    capacity
                ))
            })?;
        self.tokens[offset..end].copy_from_slice(tokens);
        Ok(())
    }

    /// Copy `src[start..end]` into the same positions of this window.
    pub fn copy_range_from(&mut self, src: &TokenWindow, start: usize, end: usize) -> Result<()> {
        let tokens = src.range(start, end)?;
        self.write(start, tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_bounds_checked() {
        let mut w = TokenWindow::try_new(4).unwrap();
        w.write(1, &[7, 8, 9]).unwrap();
        assert_eq!(w.as_slice(), &[0, 7, 8, 9]);
        assert!(w.write(2, &[1, 2, 3]).is_err());
        assert!(w.write(usize::MAX, &[1]).is_err());
        assert_eq!(w.as_slice(), &[0, 7, 8, 9]);
    }

    #[test]
    fn copy_range_preserves_positions() {
        let mut src = TokenWindow::try_new(5).unwrap();
        src.write(0, &[1, 2, 3, 4, 5]).unwrap();
        let mut dst = TokenWindow::try_new(5).unwrap();
        dst.copy_range_from(&src, 2, 4).unwrap();
        assert_eq!(dst.as_slice(), &[0, 0, 3, 4, 0]);
    }

    #[test]
    fn prefix_clamps() {
        let w = TokenWindow::try_new(3).unwrap();
        assert_eq!(w.prefix(10).len(), 3);
    }
}
