//! Prefix-buffer writer.
//!
//! Emitting a length-prefixed frame without double-copying is a small
//! dance: the prefix value (the lengths) is only known after the payload
//! is written, but it must come first on the wire. The [`PrefixWriter`]
//! reserves the prefix bytes up front, lets the caller write the payload
//! behind them, then fills the prefix in and commits everything to the
//! sink in order.
//!
//! Guarantees:
//!
//! - Payload within the construction hint: one buffer holds prefix and
//!   payload, no further allocation.
//! - Payload beyond the hint: spills into pooled overflow segments which
//!   commit sequentially after the leading buffer, never copied into it.
//! - No payload written at all: the caller's prefix goes to the sink
//!   directly, untouched by any writer buffer.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::wire::WireError;

/// Destination for committed frame bytes.
///
/// `advance` is called once for the leading buffer and once per overflow
/// segment, in wire order.
pub trait ByteSink {
    /// Append a chunk to the sink.
    fn advance(&mut self, chunk: &[u8]);
}

impl ByteSink for Vec<u8> {
    fn advance(&mut self, chunk: &[u8]) {
        self.extend_from_slice(chunk);
    }
}

impl ByteSink for BytesMut {
    fn advance(&mut self, chunk: &[u8]) {
        self.extend_from_slice(chunk);
    }
}

/// Reusable overflow segments shared between prefix writers.
///
/// Segments released on completion are handed back here and reused by the
/// next writer that spills, so a connection's write path settles into a
/// steady state with no per-frame segment allocation.
#[derive(Debug, Default)]
pub struct SegmentPool {
    segments: Mutex<Vec<BytesMut>>,
}

impl SegmentPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, min_capacity: usize) -> BytesMut {
        let mut segments = match self.segments.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match segments.pop() {
            Some(mut seg) if seg.capacity() >= min_capacity => {
                seg.clear();
                seg
            }
            _ => BytesMut::with_capacity(min_capacity),
        }
    }

    fn release(&self, mut seg: BytesMut) {
        seg.clear();
        let mut segments = match self.segments.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if segments.len() < 16 {
            segments.push(seg);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        match self.segments.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Writer that reserves prefix bytes, accumulates a payload behind them,
/// and commits `prefix ++ payload` to a [`ByteSink`] in one pass.
#[derive(Debug)]
pub struct PrefixWriter {
    prefix_len: usize,
    hint: usize,
    /// Leading buffer: `prefix_len` reserved bytes followed by payload.
    first: BytesMut,
    /// Overflow segments, in write order.
    overflow: Vec<BytesMut>,
    /// Whether payload memory was ever requested.
    requested: bool,
    pool: Option<Arc<SegmentPool>>,
}

impl PrefixWriter {
    /// Create a writer reserving `prefix_len` bytes, sized for payloads up
    /// to `payload_hint` without further allocation.
    pub fn new(prefix_len: usize, payload_hint: usize) -> Self {
        let mut first = BytesMut::with_capacity(prefix_len + payload_hint);
        first.resize(prefix_len, 0);
        Self {
            prefix_len,
            hint: payload_hint.max(1),
            first,
            overflow: Vec::new(),
            requested: false,
            pool: None,
        }
    }

    /// Like [`PrefixWriter::new`], drawing overflow segments from `pool`.
    pub fn with_pool(prefix_len: usize, payload_hint: usize, pool: Arc<SegmentPool>) -> Self {
        let mut writer = Self::new(prefix_len, payload_hint);
        writer.pool = Some(pool);
        writer
    }

    /// Append payload bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.requested = true;
        let mut remaining = bytes;

        // Fill the leading buffer first (only while nothing has spilled:
        // segment order must match write order).
        if self.overflow.is_empty() {
            let room = self.first.capacity() - self.first.len();
            let take = room.min(remaining.len());
            if take > 0 {
                self.first.extend_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
            }
        }

        while !remaining.is_empty() {
            let has_room = self
                .overflow
                .last()
                .is_some_and(|seg| seg.capacity() > seg.len());
            if !has_room {
                let cap = self.hint.max(remaining.len());
                let seg = match &self.pool {
                    Some(pool) => pool.acquire(cap),
                    None => BytesMut::with_capacity(cap),
                };
                self.overflow.push(seg);
            }
            // A segment was just pushed if none had room.
            if let Some(seg) = self.overflow.last_mut() {
                let room = seg.capacity() - seg.len();
                let take = room.min(remaining.len());
                seg.extend_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
            }
        }
    }

    /// Payload bytes written so far.
    pub fn payload_len(&self) -> usize {
        (self.first.len() - self.prefix_len)
            + self.overflow.iter().map(BytesMut::len).sum::<usize>()
    }

    /// Fill in the prefix and commit `prefix ++ payload` to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::PrefixSizeMismatch`] when `prefix` is not
    /// exactly the reserved size.
    pub fn complete(mut self, prefix: &[u8], sink: &mut dyn ByteSink) -> Result<(), WireError> {
        if prefix.len() != self.prefix_len {
            return Err(WireError::PrefixSizeMismatch {
                reserved: self.prefix_len,
                provided: prefix.len(),
            });
        }

        if !self.requested {
            // Nothing was written: the caller's prefix goes out directly.
            sink.advance(prefix);
            return Ok(());
        }

        self.first[..self.prefix_len].copy_from_slice(prefix);
        sink.advance(&self.first);
        for seg in self.overflow.drain(..) {
            sink.advance(&seg);
            if let Some(pool) = &self.pool {
                pool.release(seg);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_prefix_only_commit_writes_caller_prefix_directly() {
        let writer = PrefixWriter::new(4, 16);
        let mut sink: Vec<u8> = Vec::new();
        writer
            .complete(&[0xAA, 0xBB, 0xCC, 0xDD], &mut sink)
            .expect("complete");
        assert_eq!(sink, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_payload_within_hint_single_buffer() {
        let mut writer = PrefixWriter::new(4, 16);
        writer.write(&[1; 10]);
        assert_eq!(writer.payload_len(), 10);
        assert!(writer.overflow.is_empty());

        let mut sink: Vec<u8> = Vec::new();
        writer.complete(&[0, 0, 0, 10], &mut sink).expect("complete");
        assert_eq!(&sink[..4], &[0, 0, 0, 10]);
        assert_eq!(&sink[4..], &[1; 10]);
    }

    #[test]
    fn test_overflow_payload() {
        // The scenario pinned by the runtime's framing path: prefix 4,
        // hint 16, 100 bytes of payload.
        let mut writer = PrefixWriter::new(4, 16);
        let payload: Vec<u8> = (0..100u8).collect();
        writer.write(&payload);
        assert_eq!(writer.payload_len(), 100);

        let mut sink: Vec<u8> = Vec::new();
        writer
            .complete(&[0x00, 0x00, 0x00, 0x64], &mut sink)
            .expect("complete");
        assert_eq!(sink.len(), 104);
        assert_eq!(&sink[..4], &[0x00, 0x00, 0x00, 0x64]);
        assert_eq!(&sink[4..], payload.as_slice());
    }

    #[test]
    fn test_many_small_writes_preserve_order() {
        let mut writer = PrefixWriter::new(2, 4);
        for i in 0..50u8 {
            writer.write(&[i]);
        }
        let mut sink: Vec<u8> = Vec::new();
        writer.complete(&[9, 9], &mut sink).expect("complete");
        assert_eq!(&sink[..2], &[9, 9]);
        let expected: Vec<u8> = (0..50).collect();
        assert_eq!(&sink[2..], expected.as_slice());
    }

    #[test]
    fn test_wrong_prefix_size_rejected() {
        let mut writer = PrefixWriter::new(4, 16);
        writer.write(&[1]);
        let mut sink: Vec<u8> = Vec::new();
        let result = writer.complete(&[1, 2, 3], &mut sink);
        assert!(matches!(
            result,
            Err(WireError::PrefixSizeMismatch {
                reserved: 4,
                provided: 3
            })
        ));
    }

    #[test]
    fn test_pool_reuses_segments() {
        let pool = Arc::new(SegmentPool::new());

        let mut writer = PrefixWriter::with_pool(4, 8, pool.clone());
        writer.write(&[7; 64]);
        let mut sink: Vec<u8> = Vec::new();
        writer.complete(&[0; 4], &mut sink).expect("complete");
        let pooled_after_first = pool.pooled();
        assert!(pooled_after_first > 0);

        // Second writer spills again; the pool should not keep growing.
        let mut writer = PrefixWriter::with_pool(4, 8, pool.clone());
        writer.write(&[8; 64]);
        let mut sink: Vec<u8> = Vec::new();
        writer.complete(&[0; 4], &mut sink).expect("complete");
        assert_eq!(&sink[4..], &[8; 64]);
        assert_eq!(pool.pooled(), pooled_after_first);
    }

    proptest! {
        /// For any payload P and prefix H of the configured size, the sink
        /// receives exactly H ++ P.
        #[test]
        fn prop_commit_is_prefix_then_payload(
            prefix in proptest::collection::vec(any::<u8>(), 8),
            chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..200), 0..8),
            hint in 1usize..64,
        ) {
            let mut writer = PrefixWriter::new(8, hint);
            let mut expected: Vec<u8> = prefix.clone();
            let mut wrote_any = false;
            for chunk in &chunks {
                wrote_any |= !chunk.is_empty();
                writer.write(chunk);
                expected.extend_from_slice(chunk);
            }
            prop_assert_eq!(writer.payload_len(), expected.len() - 8);
            let _ = wrote_any;

            let mut sink: Vec<u8> = Vec::new();
            writer.complete(&prefix, &mut sink).expect("complete");
            prop_assert_eq!(sink, expected);
        }
    }
}
