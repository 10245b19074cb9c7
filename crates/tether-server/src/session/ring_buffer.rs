//! Bounded chunk history for output replay on session reattach.
//!
//! Keeps PTY output as the original chunks, oldest first, so a reconnecting
//! client sees the same sequence of writes it would have seen live. Whole
//! chunks are evicted from the front once the byte total exceeds capacity.

use std::collections::VecDeque;

/// A byte-capped queue of output chunks.
#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<Vec<u8>>,
    capacity: usize,
    /// Bytes currently held across all chunks.
    size: usize,
}

impl RingBuffer {
    /// Create a new ring buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            capacity,
            size: 0,
        }
    }

    /// Append a chunk, dropping the oldest chunks until within capacity.
    ///
    /// A chunk larger than the whole capacity is cut down to its tail, starting
    /// on a UTF-8 character boundary, so the newest bytes are always retained.
    pub fn push(&mut self, mut chunk: Vec<u8>) {
        if chunk.is_empty() || self.capacity == 0 {
            return;
        }
        if chunk.len() > self.capacity {
            let mut start = chunk.len() - self.capacity;
            while start < chunk.len() && is_continuation(chunk[start]) {
                start += 1;
            }
            chunk.drain(..start);
            self.chunks.clear();
            self.size = 0;
        }

        self.size += chunk.len();
        self.chunks.push_back(chunk);

        while self.size > self.capacity {
            match self.chunks.pop_front() {
                Some(old) => self.size -= old.len(),
                None => break,
            }
        }
    }

    /// Iterate the retained chunks in emission order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(Vec::as_slice)
    }

    /// The last `max` retained bytes (fewer if less is buffered).
    pub fn tail(&self, max: usize) -> Vec<u8> {
        let want = max.min(self.size);
        let mut parts: Vec<&[u8]> = Vec::new();
        let mut taken = 0;
        for chunk in self.chunks.iter().rev() {
            if taken >= want {
                break;
            }
            let need = want - taken;
            if chunk.len() > need {
                parts.push(&chunk[chunk.len() - need..]);
                taken += need;
            } else {
                parts.push(chunk);
                taken += chunk.len();
            }
        }
        let mut out = Vec::with_capacity(taken);
        for part in parts.iter().rev() {
            out.extend_from_slice(part);
        }
        out
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Number of retained chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(rb: &RingBuffer) -> Vec<u8> {
        rb.chunks().flatten().copied().collect()
    }

    #[test]
    fn basic_push_read() {
        let mut rb = RingBuffer::new(10);
        rb.push(b"hel".to_vec());
        rb.push(b"lo".to_vec());
        assert_eq!(contents(&rb), b"hello");
        assert_eq!(rb.len(), 5);
        assert_eq!(rb.chunk_count(), 2);
    }

    #[test]
    fn evicts_oldest_whole_chunks() {
        let mut rb = RingBuffer::new(6);
        rb.push(b"abc".to_vec());
        rb.push(b"def".to_vec());
        rb.push(b"gh".to_vec());
        assert_eq!(contents(&rb), b"defgh");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn never_exceeds_capacity_and_keeps_newest() {
        let mut rb = RingBuffer::new(64);
        let mut last = Vec::new();
        for i in 0..500u32 {
            let chunk = format!("<{i}:{}>", "x".repeat((i % 13) as usize)).into_bytes();
            last = chunk.clone();
            rb.push(chunk);
            assert!(rb.len() <= 64);
        }
        assert!(contents(&rb).ends_with(&last));
    }

    #[test]
    fn oversized_chunk_keeps_tail() {
        let mut rb = RingBuffer::new(4);
        rb.push(b"ab".to_vec());
        rb.push(b"0123456789".to_vec());
        assert_eq!(contents(&rb), b"6789");
        assert_eq!(rb.chunk_count(), 1);
    }

    #[test]
    fn oversized_chunk_trims_on_char_boundary() {
        let mut rb = RingBuffer::new(4);
        // 8 bytes; keeping the last 4 would start inside the second "é".
        rb.push("aéééb".as_bytes().to_vec());
        let kept = contents(&rb);
        assert!(std::str::from_utf8(&kept).is_ok());
        assert_eq!(kept, "éb".as_bytes());
    }

    #[test]
    fn tail_spans_chunks() {
        let mut rb = RingBuffer::new(100);
        rb.push(b"hello ".to_vec());
        rb.push(b"wor".to_vec());
        rb.push(b"ld".to_vec());
        assert_eq!(rb.tail(8), b"lo world");
        assert_eq!(rb.tail(1000), b"hello world");
        assert_eq!(rb.tail(0), Vec::<u8>::new());
    }

    #[test]
    fn empty_buffer() {
        let rb = RingBuffer::new(10);
        assert_eq!(rb.len(), 0);
        assert_eq!(rb.chunks().count(), 0);
    }

    #[test]
    fn zero_capacity() {
        let mut rb = RingBuffer::new(0);
        rb.push(b"test".to_vec());
        assert_eq!(rb.len(), 0);
    }
}
