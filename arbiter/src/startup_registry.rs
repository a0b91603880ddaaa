//! Deferred binding of startup writers to an arbiter.
use std::sync::{Arc, Mutex, Weak};

use ferrotrace_abi::BufferId;
use ferrotrace_base::{TaskRunner, TaskRunnerExt};

use crate::shared_memory_arbiter::SharedMemoryArbiter;
use crate::startup_trace_writer::{StartupTraceWriter, StartupWriterShared};

struct RegistryState {
    unbound: Vec<Arc<StartupWriterShared>>,
    arbiter: Option<SharedMemoryArbiter>,
    target_buffer: BufferId,
    task_runner: Option<Arc<dyn TaskRunner>>,
    on_all_bound: Option<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct RegistryInner {
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    /// Writers dropped before binding are silently discarded, buffered
    /// bytes included.
    pub(crate) fn on_writer_destroyed(&self, shared: &Arc<StartupWriterShared>) {
        let mut state = self.state.lock().unwrap();
        state.unbound.retain(|w| !Arc::ptr_eq(w, shared));
        Self::maybe_fire_all_bound(&mut state);
    }

    fn maybe_fire_all_bound(state: &mut RegistryState) {
        if state.arbiter.is_none() || !state.unbound.is_empty() {
            return;
        }
        if let (Some(callback), Some(runner)) = (state.on_all_bound.take(), &state.task_runner) {
            // Posted rather than invoked inline: the callback may drop the
            // registry, and we hold its lock.
            runner.post(callback);
        }
    }
}

/// Hands out unbound writers and retries binding them once an arbiter
/// exists, then reports completion exactly once.
pub struct StartupTraceWriterRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for StartupTraceWriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupTraceWriterRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    unbound: Vec::new(),
                    arbiter: None,
                    target_buffer: 0,
                    task_runner: None,
                    on_all_bound: None,
                }),
            }),
        }
    }

    /// Creates a writer that buffers to the heap until the registry is
    /// bound.
    pub fn create_unbound_trace_writer(&self) -> StartupTraceWriter {
        let shared = StartupWriterShared::new();
        let mut state = self.inner.state.lock().unwrap();
        debug_assert!(state.arbiter.is_none(), "only callable while unbound");
        state.unbound.push(shared.clone());
        StartupTraceWriter::new(shared, self.inner.clone())
    }

    /// Binds every outstanding writer to `arbiter`, retrying on
    /// `task_runner` while writers have writes in progress. `on_all_bound`
    /// fires once, after the set empties.
    pub fn bind_to_arbiter(
        &self,
        arbiter: SharedMemoryArbiter,
        target_buffer: BufferId,
        task_runner: Arc<dyn TaskRunner>,
        on_all_bound: Box<dyn FnOnce() + Send>,
    ) {
        {
            let mut state = self.inner.state.lock().unwrap();
            debug_assert!(state.arbiter.is_none());
            state.arbiter = Some(arbiter);
            state.target_buffer = target_buffer;
            state.task_runner = Some(task_runner);
            state.on_all_bound = Some(on_all_bound);
        }
        Self::try_bind_writers(&self.inner);
    }

    fn try_bind_writers(inner: &Arc<RegistryInner>) {
        let mut state = inner.state.lock().unwrap();
        let Some(arbiter) = state.arbiter.clone() else {
            return;
        };
        let target_buffer = state.target_buffer;
        state
            .unbound
            .retain(|writer| !writer.try_bind(&arbiter, target_buffer));

        if !state.unbound.is_empty() {
            // Some writer had a packet in flight; try again on the next
            // tick.
            if let Some(runner) = &state.task_runner {
                let weak: Weak<RegistryInner> = Arc::downgrade(inner);
                runner.post(move || {
                    if let Some(inner) = weak.upgrade() {
                        Self::try_bind_writers(&inner);
                    }
                });
            }
        }
        RegistryInner::maybe_fire_all_bound(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_arbiter::{ArbiterConfig, CommitSink};
    use ferrotrace_abi::{CommitDataRequest, SharedMemoryAbi};
    use ferrotrace_base::ThreadTaskRunner;
    use ferrotrace_proto::trace::trace_packet::Data;
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingSink(Mutex<usize>);
    impl CommitSink for CountingSink {
        fn commit_data(&self, request: CommitDataRequest, callback: Box<dyn FnOnce() + Send>) {
            *self.0.lock().unwrap() += request.chunks_to_move.len();
            callback();
        }
    }

    fn make_arbiter() -> (SharedMemoryArbiter, Arc<CountingSink>, Arc<ThreadTaskRunner>) {
        let abi = SharedMemoryAbi::create(4, ferrotrace_base::PAGE_SIZE);
        let sink = Arc::new(CountingSink(Mutex::new(0)));
        let runner = Arc::new(ThreadTaskRunner::new("registry-test"));
        (
            SharedMemoryArbiter::new(abi, sink.clone(), runner.clone(), ArbiterConfig::default()),
            sink,
            runner,
        )
    }

    #[test]
    fn buffered_packets_replay_on_bind() {
        let (arbiter, sink, runner) = make_arbiter();
        let registry = StartupTraceWriterRegistry::new();
        let mut writer = registry.create_unbound_trace_writer();

        for i in 0..3 {
            let mut packet = writer.new_trace_packet();
            packet.data = Some(Data::ForTesting(format!("early-{i}")));
        }
        assert!(!writer.is_bound());
        assert_eq!(writer.buffered_packets(), 3);

        let (tx, rx) = mpsc::channel();
        registry.bind_to_arbiter(
            arbiter,
            0,
            runner,
            Box::new(move || tx.send(()).unwrap()),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(writer.is_bound());
        assert_eq!(writer.buffered_packets(), 0);

        // The replayed chunk is committed when the bound writer goes away.
        drop(writer);
        assert!(*sink.0.lock().unwrap() >= 1);
    }

    #[test]
    fn bind_retries_while_write_in_progress() {
        let (arbiter, _sink, runner) = make_arbiter();
        let registry = StartupTraceWriterRegistry::new();
        let mut writer = registry.create_unbound_trace_writer();

        let handle = writer.new_trace_packet();
        let (tx, rx) = mpsc::channel();
        registry.bind_to_arbiter(
            arbiter,
            0,
            runner,
            Box::new(move || tx.send(()).unwrap()),
        );
        // Binding cannot complete while the packet handle is alive.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(handle);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(writer.is_bound());
    }

    #[test]
    fn dropped_unbound_writer_is_discarded() {
        let (arbiter, sink, runner) = make_arbiter();
        let registry = StartupTraceWriterRegistry::new();
        let mut writer = registry.create_unbound_trace_writer();
        {
            let mut packet = writer.new_trace_packet();
            packet.data = Some(Data::ForTesting("lost".into()));
        }
        drop(writer);

        let (tx, rx) = mpsc::channel();
        registry.bind_to_arbiter(
            arbiter,
            0,
            runner,
            Box::new(move || tx.send(()).unwrap()),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*sink.0.lock().unwrap(), 0, "buffered bytes are lost");
    }
}
