//! The lock-free shared-memory transport between producers and the service.
//!
//! A region is a run of fixed-size pages. Each page carries two 32-bit
//! header words: a *layout word* holding the chunk partitioning and a 2-bit
//! state per chunk, and a *target-buffer word* naming the logical buffer
//! the producer wants the page's data routed into. All coordination is
//! acquire/release CAS on the layout word; payload bytes are published by
//! the state transition to `Complete` and consumed only after the reader
//! wins the transition to `BeingRead`.
//!
//! Producers and the service exchange `(page, chunk)` indices, never
//! addresses.

// crate-specific lint exceptions:
#![allow(unsafe_code)]

pub mod packets;
pub mod shared_memory;

pub use packets::{ChunkPacketIter, write_fragment};
pub use shared_memory::{
    BufferId, ChunkHandle, ChunkHeader, ChunkId, ChunkReadHandle, ChunkState, PageSnapshot,
    SharedMemoryAbi, WriterId, chunk_flags,
};

/// One `(page, chunk)` pair a producer asks the service to move into a
/// logical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkToMove {
    pub page: u32,
    pub chunk: u32,
}

/// Batch of completed chunks announced to the service. The target buffer of
/// each chunk is read from its page header, not trusted from the request.
#[derive(Debug, Clone, Default)]
pub struct CommitDataRequest {
    pub chunks_to_move: Vec<ChunkToMove>,
}
