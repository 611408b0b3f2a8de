//! Chunk planning for parallel transfers.

/// Half-open byte range `[start, end)` assigned to one transfer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition `file_size` bytes into chunks for `workers` workers.
///
/// The chunk size is `ceil(file_size / workers)` but never below
/// `min_chunk`, so small files produce fewer chunks than workers and the
/// last chunk absorbs the remainder. The returned ranges are ordered,
/// contiguous and cover the file exactly.
pub fn plan_chunks(file_size: u64, workers: u64, min_chunk: u64) -> Vec<ChunkRange> {
    if file_size == 0 || workers == 0 {
        return Vec::new();
    }
    let chunk = file_size.div_ceil(workers).max(min_chunk.max(1));
    let count = file_size.div_ceil(chunk);
    (0..count)
        .map(|index| {
            let start = index * chunk;
            ChunkRange {
                index,
                start,
                end: (start + chunk).min(file_size),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use portage_proto::{CHUNK_THRESHOLD, TRANSFER_WORKERS};

    fn assert_exact_partition(size: u64, chunks: &[ChunkRange]) {
        let mut expected_start = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as u64);
            assert_eq!(c.start, expected_start);
            assert!(c.end > c.start, "empty chunk at index {i}");
            expected_start = c.end;
        }
        assert_eq!(expected_start, size);
    }

    #[test]
    fn empty_file_needs_no_chunks() {
        assert!(plan_chunks(0, TRANSFER_WORKERS, CHUNK_THRESHOLD).is_empty());
    }

    #[test]
    fn small_file_is_one_chunk() {
        let chunks = plan_chunks(CHUNK_THRESHOLD - 1, TRANSFER_WORKERS, CHUNK_THRESHOLD);
        assert_eq!(chunks.len(), 1);
        assert_exact_partition(CHUNK_THRESHOLD - 1, &chunks);
    }

    #[test]
    fn threshold_floor_caps_chunk_count_for_mid_sized_files() {
        // 10 MiB at an 8-way split would be 1.25 MiB chunks; the floor
        // forces 4 MiB chunks and therefore 3 of them.
        let size = 10 * 1024 * 1024;
        let chunks = plan_chunks(size, TRANSFER_WORKERS, CHUNK_THRESHOLD);
        assert_eq!(chunks.len(), 3);
        assert_exact_partition(size, &chunks);
    }

    #[test]
    fn large_file_uses_every_worker() {
        let size = 100 * 1024 * 1024 + 17;
        let chunks = plan_chunks(size, TRANSFER_WORKERS, CHUNK_THRESHOLD);
        assert_eq!(chunks.len() as u64, TRANSFER_WORKERS);
        assert_exact_partition(size, &chunks);
    }

    #[test]
    fn partition_is_exact_across_awkward_sizes() {
        for size in [
            1,
            2,
            CHUNK_THRESHOLD - 1,
            CHUNK_THRESHOLD,
            CHUNK_THRESHOLD + 1,
            8 * CHUNK_THRESHOLD,
            8 * CHUNK_THRESHOLD + 1,
            33_554_431,
        ] {
            for workers in [1, 3, TRANSFER_WORKERS] {
                let chunks = plan_chunks(size, workers, CHUNK_THRESHOLD);
                assert!(chunks.len() as u64 <= workers.max(1));
                assert_exact_partition(size, &chunks);
            }
        }
    }
}
