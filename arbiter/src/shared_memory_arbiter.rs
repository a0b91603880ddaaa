//! Chunk allocation and commit batching for one producer.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrotrace_abi::shared_memory::MAX_CHUNKS_PER_PAGE;
use ferrotrace_abi::{
    BufferId, ChunkHandle, ChunkState, ChunkToMove, CommitDataRequest, SharedMemoryAbi, WriterId,
};
use ferrotrace_base::{TaskRunner, TaskRunnerExt};

use crate::errors::{Error, Result};
use crate::trace_writer::TraceWriter;

/// Where commit notifications go; implemented by the service's producer
/// endpoint. The callback fires exactly once, after the chunks have been
/// copied out.
pub trait CommitSink: Send + Sync {
    fn commit_data(&self, request: CommitDataRequest, callback: Box<dyn FnOnce() + Send>);
}

#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    /// Ceiling on how long a released chunk may sit in the commit queue
    /// before the service hears about it.
    pub batch_commit_interval: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            batch_commit_interval: Duration::from_millis(10),
        }
    }
}

struct WriterIdAllocator {
    next: WriterId,
    freed: Vec<WriterId>,
}

impl WriterIdAllocator {
    fn new() -> Self {
        // Id 0 is reserved as "no writer".
        Self {
            next: 1,
            freed: Vec::new(),
        }
    }

    fn acquire(&mut self) -> Result<WriterId> {
        if let Some(id) = self.freed.pop() {
            return Ok(id);
        }
        if self.next == WriterId::MAX {
            return Err(Error::NoFreeWriterIds);
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    fn release(&mut self, id: WriterId) {
        self.freed.push(id);
    }
}

struct ArbiterState {
    writer_ids: WriterIdAllocator,
    live_writers: usize,
    commit_queue: Vec<ChunkToMove>,
    commit_scheduled: bool,
    dropped_packets: u64,
}

pub(crate) struct ArbiterInner {
    abi: SharedMemoryAbi,
    sink: Arc<dyn CommitSink>,
    task_runner: Arc<dyn TaskRunner>,
    config: ArbiterConfig,
    state: Mutex<ArbiterState>,
}

/// Producer-side allocator of chunks and writer ids.
///
/// Cheap to clone; writers hold a clone each. Thread-safe: different
/// writers may allocate from different threads, a single writer is not
/// itself thread-safe.
#[derive(Clone)]
pub struct SharedMemoryArbiter {
    inner: Arc<ArbiterInner>,
}

impl SharedMemoryArbiter {
    pub fn new(
        abi: SharedMemoryAbi,
        sink: Arc<dyn CommitSink>,
        task_runner: Arc<dyn TaskRunner>,
        config: ArbiterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ArbiterInner {
                abi,
                sink,
                task_runner,
                config,
                state: Mutex::new(ArbiterState {
                    writer_ids: WriterIdAllocator::new(),
                    live_writers: 0,
                    commit_queue: Vec::new(),
                    commit_scheduled: false,
                    dropped_packets: 0,
                }),
            }),
        }
    }

    pub fn abi(&self) -> &SharedMemoryAbi {
        &self.inner.abi
    }

    /// Creates a writer pinned to `target_buffer`. Fails with
    /// [`Error::NoFreeWriterIds`] when the 16-bit pool is exhausted.
    pub fn create_trace_writer(&self, target_buffer: BufferId) -> Result<TraceWriter> {
        let writer_id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.writer_ids.acquire()?;
            state.live_writers += 1;
            id
        };
        Ok(TraceWriter::new(self.clone(), writer_id, target_buffer))
    }

    pub(crate) fn release_writer_id(&self, id: WriterId) {
        let mut state = self.inner.state.lock().unwrap();
        state.writer_ids.release(id);
        state.live_writers -= 1;
    }

    /// Allocates a chunk for `target_buffer`, preferring the writer's
    /// current page, then any partitioned page with a free chunk and the
    /// same target, then partitioning a fresh page.
    pub(crate) fn get_new_chunk(
        &self,
        target_buffer: BufferId,
        preferred_page: Option<u32>,
    ) -> Option<ChunkHandle> {
        let abi = &self.inner.abi;

        if let Some(page) = preferred_page
            && let Some(handle) = self.acquire_in_page(page, target_buffer)
        {
            return Some(handle);
        }

        for page in 0..abi.num_pages() {
            if let Some(handle) = self.acquire_in_page(page, target_buffer) {
                return Some(handle);
            }
        }

        // No partitioned page has room: partition a free one, sized to the
        // current writer concurrency so writers do not serialize on one
        // chunk per page.
        let num_chunks = {
            let state = self.inner.state.lock().unwrap();
            (state.live_writers as u32).clamp(1, MAX_CHUNKS_PER_PAGE)
        };
        for page in 0..abi.num_pages() {
            if let Some(handle) = abi.try_partition_page(page, num_chunks, target_buffer) {
                return Some(handle);
            }
        }
        None
    }

    fn acquire_in_page(&self, page: u32, target_buffer: BufferId) -> Option<ChunkHandle> {
        let abi = &self.inner.abi;
        let snapshot = abi.snapshot(page);
        if snapshot.num_chunks == 0 || snapshot.target_buffer != target_buffer {
            return None;
        }
        for chunk in 0..snapshot.num_chunks {
            if snapshot.states[chunk as usize] == ChunkState::Free
                && let Some(handle) = abi.try_acquire_chunk_for_writing(page, chunk)
            {
                return Some(handle);
            }
        }
        None
    }

    pub(crate) fn note_dropped_packet(&self) {
        self.inner.state.lock().unwrap().dropped_packets += 1;
    }

    /// Packets writers had to drop because the shared region was out of
    /// chunks.
    pub fn dropped_packets(&self) -> u64 {
        self.inner.state.lock().unwrap().dropped_packets
    }

    /// Queues a released chunk and schedules one delivery per batching
    /// interval.
    pub(crate) fn enqueue_commit(&self, chunk: ChunkToMove) {
        let schedule = {
            let mut state = self.inner.state.lock().unwrap();
            state.commit_queue.push(chunk);
            !std::mem::replace(&mut state.commit_scheduled, true)
        };
        if schedule {
            let weak: WeakArbiter = WeakArbiter(Arc::downgrade(&self.inner));
            let interval = self.inner.config.batch_commit_interval;
            self.inner.task_runner.post_delayed(interval, move || {
                if let Some(arbiter) = weak.upgrade() {
                    arbiter.flush_pending_commits(Box::new(|| {}));
                }
            });
        }
    }

    /// Delivers the commit queue now. `callback` fires once the service
    /// has copied the chunks out, or immediately if there was nothing to
    /// deliver.
    pub fn flush_pending_commits(&self, callback: Box<dyn FnOnce() + Send>) {
        let queue = {
            let mut state = self.inner.state.lock().unwrap();
            state.commit_scheduled = false;
            std::mem::take(&mut state.commit_queue)
        };
        if queue.is_empty() {
            callback();
            return;
        }
        self.inner.sink.commit_data(
            CommitDataRequest {
                chunks_to_move: queue,
            },
            callback,
        );
    }
}

struct WeakArbiter(std::sync::Weak<ArbiterInner>);

impl WeakArbiter {
    fn upgrade(&self) -> Option<SharedMemoryArbiter> {
        self.0.upgrade().map(|inner| SharedMemoryArbiter { inner })
    }
}
