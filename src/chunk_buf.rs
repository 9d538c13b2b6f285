//! The per-peer receive buffer.
//!
//! Socket reads land here as reference counted [`Bytes`] chunks, so queueing
//! data is free of copies; the single copy in the receive path happens when
//! a decoded message's payload is lifted out via [`ChunkedBuffer::copy_to`].

use std::collections::VecDeque;

use bytes::Bytes;

/// A FIFO of byte chunks with reads that span chunk boundaries.
///
/// Logical offsets are relative to the current front of the buffer: offset 0
/// is the first unconsumed byte. [`ChunkedBuffer::discard`] advances the
/// front, dropping chunks once they are fully consumed.
#[derive(Debug, Default)]
pub(crate) struct ChunkedBuffer {
    chunks: VecDeque<Bytes>,
    /// How many bytes of the first chunk have already been consumed.
    consumed_in_first: usize,
    /// Total unconsumed bytes across all chunks.
    len: usize,
}

impl ChunkedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. O(1), no copy.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// The number of unconsumed bytes buffered.
    pub fn len(&self) -> usize {
        self.len
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the byte at the logical offset, if available.
    pub fn peek_byte(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        let (chunk, pos) = self.locate(offset);
        Some(self.chunks[chunk][pos])
    }

    /// Reads a big-endian u32 starting at the logical offset, if all four
    /// bytes are available.
    pub fn peek_u32_be(&self, offset: usize) -> Option<u32> {
        let mut buf = [0; 4];
        self.copy_to(&mut buf, 0, offset, 4)?;
        Some(u32::from_be_bytes(buf))
    }

    /// Copies `n` bytes starting at the logical offset into a fresh vector.
    pub fn peek_bytes(&self, offset: usize, n: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0; n];
        self.copy_to(&mut buf, 0, offset, n)?;
        Some(buf)
    }

    /// The single copy primitive: copies `n` bytes starting at logical
    /// offset `src_offset` into `dst` at `dst_offset`, crossing chunk
    /// boundaries as needed. Returns `None` (copying nothing) if the
    /// requested source range exceeds the buffered length.
    pub fn copy_to(
        &self,
        dst: &mut [u8],
        dst_offset: usize,
        src_offset: usize,
        n: usize,
    ) -> Option<()> {
        if src_offset + n > self.len || dst_offset + n > dst.len() {
            return None;
        }
        if n == 0 {
            return Some(());
        }

        let (mut chunk, mut pos) = self.locate(src_offset);
        let mut copied = 0;
        while copied < n {
            let src = &self.chunks[chunk][pos..];
            let take = src.len().min(n - copied);
            dst[dst_offset + copied..dst_offset + copied + take]
                .copy_from_slice(&src[..take]);
            copied += take;
            chunk += 1;
            pos = 0;
        }
        Some(())
    }

    /// Advances the front of the buffer by `n` bytes, dropping fully
    /// consumed chunks.
    ///
    /// # Panics
    ///
    /// Panics if more than the buffered length would be discarded; callers
    /// frame before they consume.
    pub fn discard(&mut self, n: usize) {
        assert!(n <= self.len, "discarding past the end of the buffer");
        self.len -= n;
        let mut left = n;
        while left > 0 {
            let first_remaining =
                self.chunks[0].len() - self.consumed_in_first;
            if left < first_remaining {
                self.consumed_in_first += left;
                break;
            }
            left -= first_remaining;
            self.chunks.pop_front();
            self.consumed_in_first = 0;
        }
    }

    /// Copies out the first `n` bytes and discards them.
    pub fn consume(&mut self, n: usize) -> Option<Vec<u8>> {
        let bytes = self.peek_bytes(0, n)?;
        self.discard(n);
        Some(bytes)
    }

    /// Maps a logical offset to (chunk index, position within chunk). The
    /// offset must be within the buffered length.
    fn locate(&self, offset: usize) -> (usize, usize) {
        debug_assert!(offset < self.len);
        let mut pos = self.consumed_in_first + offset;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if pos < chunk.len() {
                return (i, pos);
            }
            pos -= chunk.len();
        }
        unreachable!("offset within len but not within chunks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn filled(chunks: &[&[u8]]) -> ChunkedBuffer {
        let mut buf = ChunkedBuffer::new();
        for c in chunks {
            buf.push(Bytes::copy_from_slice(c));
        }
        buf
    }

    #[test]
    fn test_peeks_cross_chunk_boundaries() {
        let buf = filled(&[&[0, 1], &[2], &[3, 4, 5]]);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.peek_byte(0), Some(0));
        assert_eq!(buf.peek_byte(5), Some(5));
        assert_eq!(buf.peek_byte(6), None);
        // u32 spanning three chunks
        assert_eq!(buf.peek_u32_be(1), Some(u32::from_be_bytes([1, 2, 3, 4])));
        assert_eq!(buf.peek_u32_be(3), None);
        assert_eq!(buf.peek_bytes(2, 3), Some(vec![2, 3, 4]));
    }

    #[test]
    fn test_copy_to_equals_logical_concatenation() {
        // for a variety of chunkings and ranges, copy_to must return the
        // same bytes as slicing the flat concatenation
        let flat: Vec<u8> = (0u8..32).collect();
        let chunkings: &[&[usize]] = &[&[32], &[1, 31], &[7, 7, 7, 11], &[16, 16]];
        for sizes in chunkings {
            let mut buf = ChunkedBuffer::new();
            let mut at = 0;
            for &s in *sizes {
                buf.push(Bytes::copy_from_slice(&flat[at..at + s]));
                at += s;
            }
            for src_off in 0..flat.len() {
                for len in 0..=(flat.len() - src_off) {
                    let mut dst = vec![0xaa; len];
                    buf.copy_to(&mut dst, 0, src_off, len).unwrap();
                    assert_eq!(dst, &flat[src_off..src_off + len]);
                }
            }
            assert_eq!(buf.copy_to(&mut [0; 64], 0, 0, 33), None);
        }
    }

    #[test]
    fn test_discard_pops_consumed_chunks() {
        let mut buf = filled(&[&[0, 1, 2], &[3, 4], &[5]]);
        buf.discard(2);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.peek_byte(0), Some(2));
        // finishes the first chunk and eats into the second
        buf.discard(2);
        assert_eq!(buf.peek_byte(0), Some(4));
        buf.discard(2);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "discarding past the end")]
    fn test_discard_past_end_panics() {
        let mut buf = filled(&[&[0, 1]]);
        buf.discard(3);
    }

    #[test]
    fn test_consume_is_copy_then_discard() {
        let mut buf = filled(&[&[9, 8], &[7]]);
        assert_eq!(buf.consume(2), Some(vec![9, 8]));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.consume(2), None);
        assert_eq!(buf.consume(1), Some(vec![7]));
    }

    #[test]
    fn test_push_empty_chunk_is_noop() {
        let mut buf = ChunkedBuffer::new();
        buf.push(Bytes::new());
        assert!(buf.is_empty());
    }
}
