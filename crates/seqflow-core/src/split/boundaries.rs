//! Fixed-size chunk boundaries over a record stream.

use std::iter::FusedIterator;

/// One by-size chunk: records `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeChunk {
    pub index: usize,
    pub start: u64,
    pub count: u64,
}

impl SizeChunk {
    /// Chunk key used in file names, zero-padded so keys sort in order.
    pub fn key(&self) -> String {
        format!("{:04}", self.index)
    }
}

/// Single-pass iterator of chunk descriptors covering `total` records.
///
/// Every chunk holds `chunk_size` records except possibly the last. Zero
/// records yields no chunks. Not `Clone`: a consumed sequence cannot be
/// restarted.
#[derive(Debug)]
pub struct ChunkBoundaries {
    total: u64,
    chunk_size: u64,
    next_index: usize,
    next_start: u64,
}

impl ChunkBoundaries {
    /// A `chunk_size` of zero puts everything in one chunk.
    pub fn new(total: u64, chunk_size: u64) -> Self {
        let chunk_size = if chunk_size == 0 { total.max(1) } else { chunk_size };
        Self {
            total,
            chunk_size,
            next_index: 0,
            next_start: 0,
        }
    }
}

impl Iterator for ChunkBoundaries {
    type Item = SizeChunk;

    fn next(&mut self) -> Option<SizeChunk> {
        if self.next_start >= self.total {
            return None;
        }
        let count = self.chunk_size.min(self.total - self.next_start);
        let chunk = SizeChunk {
            index: self.next_index,
            start: self.next_start,
            count,
        };
        self.next_index += 1;
        self.next_start += count;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total.saturating_sub(self.next_start);
        let n = remaining.div_ceil(self.chunk_size) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkBoundaries {}

impl FusedIterator for ChunkBoundaries {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uneven_tail() {
        let chunks: Vec<SizeChunk> = ChunkBoundaries::new(10, 4).collect();
        assert_eq!(
            chunks,
            vec![
                SizeChunk { index: 0, start: 0, count: 4 },
                SizeChunk { index: 1, start: 4, count: 4 },
                SizeChunk { index: 2, start: 8, count: 2 },
            ]
        );
    }

    #[test]
    fn test_exact_multiple_and_len() {
        let boundaries = ChunkBoundaries::new(12, 4);
        assert_eq!(boundaries.len(), 3);
        assert_eq!(boundaries.map(|c| c.count).sum::<u64>(), 12);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert_eq!(ChunkBoundaries::new(0, 1000).count(), 0);
    }

    #[test]
    fn test_zero_chunk_size_is_one_chunk() {
        let chunks: Vec<SizeChunk> = ChunkBoundaries::new(7, 0).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].count, 7);
    }

    #[test]
    fn test_exhausted_stays_exhausted() {
        let mut boundaries = ChunkBoundaries::new(3, 5);
        assert!(boundaries.next().is_some());
        assert!(boundaries.next().is_none());
        assert!(boundaries.next().is_none());
    }

    #[test]
    fn test_keys_sort_in_order() {
        let keys: Vec<String> = ChunkBoundaries::new(25, 2).map(|c| c.key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys[0], "0000");
    }
}
