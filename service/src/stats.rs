//! Counters the service maintains instead of propagating errors.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub chunks_committed: u64,
    /// Chunks whose target buffer was not owned by any live session.
    pub chunks_discarded: u64,
    /// Chunks whose header lied about packet counts or lengths; parsing
    /// was truncated at the chunk boundary.
    pub abi_violations: u64,
    /// Chunks read through the single-chunk path because their page was
    /// not yet complete.
    pub partial_page_reads: u64,
    /// Packets dropped by the stitcher: missing predecessor or evicted
    /// reorder window.
    pub packets_dropped_stitch: u64,
    pub flush_timeouts: u64,
    /// Producer ids that had not acked when the last flush timed out.
    pub last_flush_outstanding_producers: u64,
    /// CPU bitmask that had not acked when the last flush timed out.
    pub last_flush_outstanding_cpus: u64,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
}

/// Per-buffer statistics snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub chunks_written: u64,
    /// Chunks evicted to make room for newer ones.
    pub overwrite_count: u64,
    pub bytes_written: u64,
}
