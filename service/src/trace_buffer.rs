//! Per-session logical buffers: a ring of copied chunk records.
use std::collections::VecDeque;

use ferrotrace_abi::{ChunkId, WriterId};

use crate::ProducerId;
use crate::stats::BufferStats;

/// One chunk copied out of a producer's shared memory, trimmed to its
/// used bytes.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub producer_id: ProducerId,
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub flags: u8,
    pub num_packets: u16,
    pub payload: Vec<u8>,
}

/// Ring buffer sized by the session's `BufferConfig`. Appends evict the
/// oldest chunks and bump `overwrite_count`; a read cursor makes repeated
/// `ReadBuffers` calls incremental.
pub struct TraceBuffer {
    capacity_bytes: usize,
    used_bytes: usize,
    chunks: VecDeque<(u64, ChunkRecord)>,
    next_seq: u64,
    read_cursor: u64,
    stats: BufferStats,
}

impl TraceBuffer {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            used_bytes: 0,
            chunks: VecDeque::new(),
            next_seq: 0,
            read_cursor: 0,
            stats: BufferStats::default(),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Copies one chunk in, evicting from the front until it fits. A chunk
    /// larger than the whole buffer is dropped after evicting everything,
    /// which still counts as an overwrite of what it displaced.
    pub fn append(&mut self, record: ChunkRecord) {
        let cost = record.payload.len();
        while self.used_bytes + cost > self.capacity_bytes {
            let Some((seq, evicted)) = self.chunks.pop_front() else {
                break;
            };
            self.used_bytes -= evicted.payload.len();
            self.stats.overwrite_count += 1;
            self.read_cursor = self.read_cursor.max(seq + 1);
        }
        if cost > self.capacity_bytes {
            log::warn!("chunk of {cost} bytes exceeds buffer capacity, dropped");
            return;
        }
        self.used_bytes += cost;
        self.stats.chunks_written += 1;
        self.stats.bytes_written += cost as u64;
        self.chunks.push_back((self.next_seq, record));
        self.next_seq += 1;
    }

    /// Returns every chunk not yet read, oldest first, and advances the
    /// cursor past them.
    pub fn take_unread(&mut self) -> Vec<ChunkRecord> {
        let cursor = self.read_cursor;
        self.read_cursor = self.next_seq;
        self.chunks
            .iter()
            .filter(|(seq, _)| *seq >= cursor)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn unread_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|(seq, _)| *seq >= self.read_cursor)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(writer_id: WriterId, chunk_id: ChunkId, len: usize) -> ChunkRecord {
        ChunkRecord {
            producer_id: 1,
            writer_id,
            chunk_id,
            flags: 0,
            num_packets: 1,
            payload: vec![chunk_id as u8; len],
        }
    }

    #[test]
    fn appends_and_reads_incrementally() {
        let mut buffer = TraceBuffer::new(4096);
        buffer.append(record(1, 0, 100));
        buffer.append(record(1, 1, 100));
        assert_eq!(buffer.take_unread().len(), 2);
        assert_eq!(buffer.take_unread().len(), 0);
        buffer.append(record(1, 2, 100));
        let unread = buffer.take_unread();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].chunk_id, 2);
    }

    #[test]
    fn ring_evicts_oldest_and_counts_overwrites() {
        let mut buffer = TraceBuffer::new(4096);
        for chunk_id in 0..10 {
            buffer.append(record(1, chunk_id, 1024));
        }
        assert_eq!(buffer.stats().overwrite_count, 6);
        let kept = buffer.take_unread();
        assert_eq!(kept.len(), 4, "latest 4 KiB worth survive");
        assert_eq!(
            kept.iter().map(|c| c.chunk_id).collect::<Vec<_>>(),
            vec![6, 7, 8, 9]
        );
    }

    #[test]
    fn eviction_moves_the_read_cursor_forward() {
        let mut buffer = TraceBuffer::new(2048);
        buffer.append(record(1, 0, 1024));
        buffer.append(record(1, 1, 1024));
        buffer.append(record(1, 2, 1024)); // evicts chunk 0
        let unread = buffer.take_unread();
        assert_eq!(
            unread.iter().map(|c| c.chunk_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn oversized_chunk_is_dropped() {
        let mut buffer = TraceBuffer::new(512);
        buffer.append(record(1, 0, 1024));
        assert_eq!(buffer.take_unread().len(), 0);
        assert_eq!(buffer.stats().chunks_written, 0);
    }
}
