//! Growable buffers for driver outputs of unknown length.
//!
//! Buffers only ever grow, and only to the exact size a driver asked for.
//! Allocation is fallible: exhaustion surfaces as `Error::Oom`.

use crate::error::{Error, Result};

/// Reusable, capacity-tracked buffer filled by driver calls.
#[derive(Debug, Clone, Default)]
pub struct GrowableBuffer<T> {
    data: Vec<T>,
}

impl<T: Copy + Default> GrowableBuffer<T> {
    /// Create an empty buffer. The first fill grows it on demand.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create a buffer with `capacity` usable elements.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut buffer = Self::new();
        buffer.grow_to(capacity)?;
        Ok(buffer)
    }

    /// Number of usable elements.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Grow to exactly `required` elements. Never shrinks.
    pub fn grow_to(&mut self, required: usize) -> Result<()> {
        let current = self.data.len();
        if required <= current {
            return Ok(());
        }
        self.data.try_reserve_exact(required - current)?;
        self.data.resize(required, T::default());
        Ok(())
    }

    /// Run `fill` against the buffer, regrowing once on `BufTooSmall`.
    ///
    /// A second `BufTooSmall` is returned to the caller unchanged. Returns
    /// the number of elements produced, which is checked against capacity.
    pub fn fill_with<F>(&mut self, mut fill: F) -> Result<usize>
    where
        F: FnMut(&mut [T]) -> Result<usize>,
    {
        let produced = match fill(&mut self.data) {
            Err(Error::BufTooSmall { required }) => {
                self.grow_to(required)?;
                fill(&mut self.data)?
            }
            other => other?,
        };

        if produced > self.data.len() {
            return Err(Error::Invalid(format!(
                "driver produced {} elements into a buffer of {}",
                produced,
                self.data.len()
            )));
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exactly_to_required() {
        let mut buf: GrowableBuffer<u32> = GrowableBuffer::new();
        let n = buf
            .fill_with(|out| {
                if out.len() < 12 {
                    return Err(Error::BufTooSmall { required: 12 });
                }
                out[..12].fill(7);
                Ok(12)
            })
            .unwrap();
        assert_eq!(n, 12);
        assert_eq!(buf.capacity(), 12);
        assert!(buf.as_slice().iter().all(|&t| t == 7));
    }

    #[test]
    fn never_shrinks() {
        let mut buf: GrowableBuffer<u8> = GrowableBuffer::with_capacity(32).unwrap();
        buf.grow_to(4).unwrap();
        assert_eq!(buf.capacity(), 32);
    }

    #[test]
    fn retries_only_once() {
        let mut buf: GrowableBuffer<u8> = GrowableBuffer::new();
        let mut calls = 0;
        let err = buf
            .fill_with(|out| {
                calls += 1;
                Err(Error::BufTooSmall { required: out.len() + 1 })
            })
            .unwrap_err();
        assert_eq!(calls, 2);
        assert_eq!(err, Error::BufTooSmall { required: 2 });
    }

    #[test]
    fn other_errors_pass_through_without_retry() {
        let mut buf: GrowableBuffer<u8> = GrowableBuffer::new();
        let mut calls = 0;
        let err = buf
            .fill_with(|_| {
                calls += 1;
                Err(Error::Io("closed".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn overreported_length_is_invalid() {
        let mut buf: GrowableBuffer<u8> = GrowableBuffer::with_capacity(2).unwrap();
        let err = buf.fill_with(|_| Ok(3)).unwrap_err();
        assert!(err.is_misuse());
    }
}
