use std::collections::VecDeque;

use bytes::Bytes;

/// Queue of byte segments with a consumed prefix offset into the head segment.
///
/// Segments pushed by the transport are kept as-is; readers peek across
/// segment boundaries without copying. The only copy happens when a caller
/// explicitly asks for one (`peek_bytes` / `copy_out`).
#[derive(Debug, Default)]
pub struct ChunkedBuffer {
    segments: VecDeque<Bytes>,
    head_offset: usize,
    len: usize,
}

impl ChunkedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locate the segment containing `offset` and the position inside it.
    fn seek(&self, offset: usize) -> Option<(usize, usize)> {
        if offset >= self.len {
            return None;
        }
        let mut remaining = offset + self.head_offset;
        for (i, segment) in self.segments.iter().enumerate() {
            if remaining < segment.len() {
                return Some((i, remaining));
            }
            remaining -= segment.len();
        }
        None
    }

    pub fn peek_byte(&self, offset: usize) -> Option<u8> {
        let (seg, pos) = self.seek(offset)?;
        Some(self.segments[seg][pos])
    }

    /// Big-endian u32 at `offset`. Allocation free: when the four bytes lie
    /// in one segment they are read directly, otherwise byte by byte.
    pub fn peek_u32_be(&self, offset: usize) -> Option<u32> {
        if offset + 4 > self.len {
            return None;
        }
        let (seg, pos) = self.seek(offset)?;
        let segment = &self.segments[seg];
        if pos + 4 <= segment.len() {
            let raw: [u8; 4] = segment[pos..pos + 4].try_into().unwrap();
            return Some(u32::from_be_bytes(raw));
        }
        let mut raw = [0u8; 4];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = self.peek_byte(offset + i)?;
        }
        Some(u32::from_be_bytes(raw))
    }

    /// Owned copy of `len` bytes at `offset`. The only allocating reader.
    pub fn peek_bytes(&self, offset: usize, len: usize) -> Option<Bytes> {
        if offset + len > self.len {
            return None;
        }
        let mut out = Vec::with_capacity(len);
        let (mut seg, mut pos) = self.seek(offset)?;
        while out.len() < len {
            let segment = &self.segments[seg];
            let take = (segment.len() - pos).min(len - out.len());
            out.extend_from_slice(&segment[pos..pos + take]);
            seg += 1;
            pos = 0;
        }
        Some(out.into())
    }

    /// Single copy of `dst.len()` bytes at `offset` into a caller provided
    /// destination. Used by block assembly to move payload straight into the
    /// piece staging area.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> Option<()> {
        if offset + dst.len() > self.len {
            return None;
        }
        let mut copied = 0;
        let (mut seg, mut pos) = self.seek(offset)?;
        while copied < dst.len() {
            let segment = &self.segments[seg];
            let take = (segment.len() - pos).min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&segment[pos..pos + take]);
            copied += take;
            seg += 1;
            pos = 0;
        }
        Some(())
    }

    /// Advance the head cursor, dropping fully consumed segments.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.len);
        self.len -= n;
        let mut remaining = n + self.head_offset;
        while let Some(head) = self.segments.front() {
            if remaining < head.len() {
                break;
            }
            remaining -= head.len();
            self.segments.pop_front();
        }
        self.head_offset = remaining;
        debug_assert!(self.segments.front().map_or(remaining == 0, |h| remaining < h.len()));
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::ChunkedBuffer;

    fn buffer_of(parts: &[&[u8]]) -> ChunkedBuffer {
        let mut buf = ChunkedBuffer::new();
        for part in parts {
            buf.push(Bytes::copy_from_slice(part));
        }
        buf
    }

    #[test]
    fn peek_across_segments() {
        let buf = buffer_of(&[&[1, 2], &[3], &[4, 5, 6]]);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.peek_byte(0), Some(1));
        assert_eq!(buf.peek_byte(2), Some(3));
        assert_eq!(buf.peek_byte(5), Some(6));
        assert_eq!(buf.peek_byte(6), None);
        assert_eq!(buf.peek_u32_be(1), Some(u32::from_be_bytes([2, 3, 4, 5])));
        assert_eq!(buf.peek_u32_be(3), None);
    }

    #[test]
    fn peek_u32_single_segment_fast_path() {
        let buf = buffer_of(&[&[0, 0, 1, 0, 7]]);
        assert_eq!(buf.peek_u32_be(0), Some(256));
        assert_eq!(buf.peek_u32_be(1), Some(65543));
    }

    #[test]
    fn discard_drops_consumed_segments() {
        let mut buf = buffer_of(&[&[1, 2, 3], &[4, 5], &[6]]);
        buf.discard(4);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.peek_byte(0), Some(5));
        buf.discard(1);
        assert_eq!(buf.peek_byte(0), Some(6));
        buf.discard(1);
        assert!(buf.is_empty());
        assert_eq!(buf.peek_byte(0), None);
        // further discards are a no-op
        buf.discard(10);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn push_after_discard_keeps_length_consistent() {
        let mut buf = buffer_of(&[&[1, 2, 3, 4]]);
        buf.discard(2);
        buf.push(Bytes::copy_from_slice(&[5, 6]));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.peek_bytes(0, 4).unwrap().as_ref(), &[3, 4, 5, 6]);
    }

    #[test]
    fn copy_out_crosses_segments() {
        let buf = buffer_of(&[&[1], &[2, 3], &[4, 5, 6, 7]]);
        let mut dst = [0u8; 5];
        buf.copy_out(1, &mut dst).unwrap();
        assert_eq!(dst, [2, 3, 4, 5, 6]);
        let mut too_long = [0u8; 8];
        assert!(buf.copy_out(0, &mut too_long).is_none());
    }
}
