//! The tracing service and its session manager.
//!
//! All session state lives behind one mutex. Callbacks never run under
//! it: producer callbacks are posted on the owning producer's task
//! runner, consumer callbacks on the service's main runner. Endpoints
//! hold non-owning handles back to the service and degrade to no-ops once
//! it is gone.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;

use ferrotrace_abi::packets::ChunkPacketIter;
use ferrotrace_abi::{
    BufferId, ChunkReadHandle, CommitDataRequest, SharedMemoryAbi, WriterId,
};
use ferrotrace_base::{CpuSet, TaskRunner, TaskRunnerExt};
use ferrotrace_proto::config::{DataSourceConfig, TraceConfig, buffer_config};

use crate::endpoints::{Consumer, CpuFlushSource, DataSourceDescriptor, Producer};
use crate::errors::{Error, Result};
use crate::stats::ServiceStats;
use crate::stitcher::{PacketStitcher, StitcherCounters};
use crate::trace_buffer::{ChunkRecord, TraceBuffer};
use crate::{
    ConsumerId, DataSourceId, DataSourceInstanceId, FlushRequestId, ProducerId, TracingSessionId,
};

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TracingServiceConfig {
    pub flush_timeout: Duration,
    /// How long a stopping session waits for `NotifyDataSourceStopped`
    /// acks before declaring itself disabled anyway.
    pub data_source_stop_timeout: Duration,
    pub stitch_window: u16,
    /// Bound on the BufferID pool.
    pub max_buffers: usize,
    /// Packets per `OnTraceData` slice.
    pub read_batch_size: usize,
}

impl Default for TracingServiceConfig {
    fn default() -> Self {
        Self {
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            data_source_stop_timeout: Duration::from_secs(5),
            stitch_window: crate::stitcher::DEFAULT_STITCH_WINDOW,
            max_buffers: 256,
            read_batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Active,
    /// Stopping: waiting for data sources to ack.
    Flushing,
    Disabled,
}

struct ProducerConnection {
    name: String,
    producer: Arc<dyn Producer>,
    task_runner: Arc<dyn TaskRunner>,
    abi: SharedMemoryAbi,
    /// Advisory writer routing from RegisterTraceWriter.
    writer_targets: HashMap<WriterId, BufferId>,
}

struct ConsumerConnection {
    consumer: Arc<dyn Consumer>,
    session: Option<TracingSessionId>,
}

struct RegisteredDataSource {
    id: DataSourceId,
    name: String,
    producer_id: ProducerId,
}

struct DataSourceInstance {
    id: DataSourceInstanceId,
    producer_id: ProducerId,
    config: DataSourceConfig,
    stopped: bool,
}

struct TracingSession {
    consumer_id: ConsumerId,
    config: TraceConfig,
    state: SessionState,
    buffer_ids: Vec<BufferId>,
    instances: Vec<DataSourceInstance>,
    stitchers: HashMap<BufferId, PacketStitcher>,
}

struct PendingFlush {
    session_id: TracingSessionId,
    remaining_producers: HashSet<ProducerId>,
    remaining_cpus: CpuSet,
    callback: Option<Box<dyn FnOnce(bool) + Send>>,
}

#[derive(Default)]
struct BufferIdPool {
    next: BufferId,
    freed: Vec<BufferId>,
    live: usize,
}

impl BufferIdPool {
    fn acquire(&mut self, max_buffers: usize) -> Option<BufferId> {
        if self.live >= max_buffers {
            return None;
        }
        let id = match self.freed.pop() {
            Some(id) => id,
            None => {
                if self.next == BufferId::MAX {
                    return None;
                }
                // Id 0 stays unused; it doubles as "no target" in fresh
                // page headers.
                self.next += 1;
                self.next
            }
        };
        self.live += 1;
        Some(id)
    }

    fn release(&mut self, id: BufferId) {
        self.freed.push(id);
        self.live -= 1;
    }
}

struct ServiceState {
    last_producer_id: ProducerId,
    last_consumer_id: ConsumerId,
    last_data_source_id: DataSourceId,
    last_instance_id: DataSourceInstanceId,
    last_session_id: TracingSessionId,
    last_flush_id: FlushRequestId,
    producers: HashMap<ProducerId, ProducerConnection>,
    consumers: HashMap<ConsumerId, ConsumerConnection>,
    data_sources: Vec<RegisteredDataSource>,
    sessions: HashMap<TracingSessionId, TracingSession>,
    buffers: HashMap<BufferId, TraceBuffer>,
    buffer_ids: BufferIdPool,
    flushes: HashMap<FlushRequestId, PendingFlush>,
    cpu_flush_source: Option<Arc<dyn CpuFlushSource>>,
    stats: ServiceStats,
    /// Stitcher counters of sessions that no longer exist.
    retired_stitch: StitcherCounters,
}

pub(crate) struct ServiceInner {
    config: TracingServiceConfig,
    task_runner: Arc<dyn TaskRunner>,
    state: Mutex<ServiceState>,
}

/// Owner of every session, buffer and endpoint registry. Clones share the
/// same service.
#[derive(Clone)]
pub struct TracingService {
    inner: Arc<ServiceInner>,
}

impl TracingService {
    pub fn new(task_runner: Arc<dyn TaskRunner>, config: TracingServiceConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                task_runner,
                state: Mutex::new(ServiceState {
                    last_producer_id: 0,
                    last_consumer_id: 0,
                    last_data_source_id: 0,
                    last_instance_id: 0,
                    last_session_id: 0,
                    last_flush_id: 0,
                    producers: HashMap::new(),
                    consumers: HashMap::new(),
                    data_sources: Vec::new(),
                    sessions: HashMap::new(),
                    buffers: HashMap::new(),
                    buffer_ids: BufferIdPool::default(),
                    flushes: HashMap::new(),
                    cpu_flush_source: None,
                    stats: ServiceStats::default(),
                    retired_stitch: StitcherCounters::default(),
                }),
            }),
        }
    }

    /// Registers a producer and maps its shared memory region.
    pub fn connect_producer(
        &self,
        producer: Arc<dyn Producer>,
        name: &str,
        producer_task_runner: Arc<dyn TaskRunner>,
        shm_pages: u32,
        shm_page_size: usize,
    ) -> Arc<ProducerEndpoint> {
        let abi = SharedMemoryAbi::create(shm_pages, shm_page_size);
        let producer_id = {
            let mut state = self.inner.state.lock().unwrap();
            state.last_producer_id += 1;
            let id = state.last_producer_id;
            state.producers.insert(
                id,
                ProducerConnection {
                    name: name.to_owned(),
                    producer: producer.clone(),
                    task_runner: producer_task_runner.clone(),
                    abi: abi.clone(),
                    writer_targets: HashMap::new(),
                },
            );
            id
        };
        producer_task_runner.post(move || {
            producer.on_connect();
            producer.on_tracing_setup();
        });
        Arc::new(ProducerEndpoint {
            service: Arc::downgrade(&self.inner),
            producer_id,
            abi,
            task_runner: producer_task_runner,
        })
    }

    pub fn connect_consumer(&self, consumer: Arc<dyn Consumer>) -> Arc<ConsumerEndpoint> {
        let consumer_id = {
            let mut state = self.inner.state.lock().unwrap();
            state.last_consumer_id += 1;
            let id = state.last_consumer_id;
            state.consumers.insert(
                id,
                ConsumerConnection {
                    consumer: consumer.clone(),
                    session: None,
                },
            );
            id
        };
        self.inner.task_runner.post(move || consumer.on_connect());
        Arc::new(ConsumerEndpoint {
            service: Arc::downgrade(&self.inner),
            consumer_id,
        })
    }

    /// Wires the in-process ftrace controller in as a flush participant.
    pub fn set_cpu_flush_source(&self, source: Arc<dyn CpuFlushSource>) {
        self.inner.state.lock().unwrap().cpu_flush_source = Some(source);
    }

    pub fn stats(&self) -> ServiceStats {
        let state = self.inner.state.lock().unwrap();
        let mut stats = state.stats.clone();
        let mut stitch = state.retired_stitch;
        for session in state.sessions.values() {
            for stitcher in session.stitchers.values() {
                let c = stitcher.counters();
                stitch.packets_dropped += c.packets_dropped;
                stitch.abi_violations += c.abi_violations;
                stitch.chunks_out_of_order += c.chunks_out_of_order;
            }
        }
        stats.packets_dropped_stitch += stitch.packets_dropped;
        stats.abi_violations += stitch.abi_violations;
        stats
    }

    pub fn task_runner(&self) -> Arc<dyn TaskRunner> {
        self.inner.task_runner.clone()
    }
}

impl ServiceInner {
    fn validate_config(config: &TraceConfig) -> Result<()> {
        if config.buffers.is_empty() {
            return Err(Error::InvalidConfig("no buffers".into()));
        }
        for buffer in &config.buffers {
            if buffer.size_kb.unwrap_or(0) == 0 {
                return Err(Error::InvalidConfig("buffer with zero size".into()));
            }
            let policy = buffer.fill_policy.unwrap_or(0);
            if policy != buffer_config::FillPolicy::Unspecified as i32
                && policy != buffer_config::FillPolicy::RingBuffer as i32
            {
                return Err(Error::InvalidConfig("unsupported fill policy".into()));
            }
        }
        for ds in &config.data_sources {
            let Some(ds_config) = &ds.config else {
                return Err(Error::InvalidConfig("data source without config".into()));
            };
            if ds_config.name.as_deref().unwrap_or("").is_empty() {
                return Err(Error::InvalidConfig("data source without name".into()));
            }
            let target = ds_config.target_buffer.unwrap_or(0) as usize;
            if target >= config.buffers.len() {
                return Err(Error::InvalidConfig("target_buffer out of range".into()));
            }
        }
        Ok(())
    }

    fn enable_tracing(
        self: &Arc<Self>,
        consumer_id: ConsumerId,
        config: TraceConfig,
    ) -> Result<()> {
        Self::validate_config(&config)?;
        let deferred = config.deferred_start();
        let session_id;
        {
            let mut state = self.state.lock().unwrap();
            let consumer = state
                .consumers
                .get(&consumer_id)
                .ok_or(Error::SessionNotFound)?;
            if consumer.session.is_some() {
                return Err(Error::SessionAlreadyActive);
            }

            // Allocate the logical buffers from the bounded pool.
            let mut buffer_ids = Vec::with_capacity(config.buffers.len());
            for buffer_cfg in &config.buffers {
                match state.buffer_ids.acquire(self.config.max_buffers) {
                    Some(id) => {
                        let capacity = buffer_cfg.size_kb.unwrap_or(0) as usize * 1024;
                        state.buffers.insert(id, TraceBuffer::new(capacity));
                        buffer_ids.push(id);
                    }
                    None => {
                        for id in buffer_ids {
                            state.buffers.remove(&id);
                            state.buffer_ids.release(id);
                        }
                        return Err(Error::NoFreeBuffers);
                    }
                }
            }

            state.last_session_id += 1;
            session_id = state.last_session_id;
            let stitchers = buffer_ids
                .iter()
                .map(|id| (*id, PacketStitcher::new(self.config.stitch_window)))
                .collect();
            state.sessions.insert(
                session_id,
                TracingSession {
                    consumer_id,
                    config: config.clone(),
                    state: SessionState::Configured,
                    buffer_ids,
                    instances: Vec::new(),
                    stitchers,
                },
            );
            state.consumers.get_mut(&consumer_id).unwrap().session = Some(session_id);
            state.stats.sessions_created += 1;

            // Instantiate matching data sources on their producers.
            self.setup_session_data_sources(&mut state, session_id);
        }
        if !deferred {
            self.start_tracing(consumer_id)?;
        }
        Ok(())
    }

    /// Creates instances for every registered data source the session's
    /// config matches. Called at session creation and again when a
    /// producer registers a data source mid-session.
    fn setup_session_data_sources(
        self: &Arc<Self>,
        state: &mut ServiceState,
        session_id: TracingSessionId,
    ) {
        let session = match state.sessions.get(&session_id) {
            Some(s) => s,
            None => return,
        };
        let config = session.config.clone();
        let buffer_ids = session.buffer_ids.clone();

        struct NewInstance {
            producer_id: ProducerId,
            ds_config: DataSourceConfig,
        }
        let mut new_instances = Vec::new();
        for cfg_ds in &config.data_sources {
            let Some(ds_config) = &cfg_ds.config else {
                continue;
            };
            let name = ds_config.name.as_deref().unwrap_or("");
            for registered in &state.data_sources {
                if registered.name != name {
                    continue;
                }
                let Some(conn) = state.producers.get(&registered.producer_id) else {
                    continue;
                };
                if !cfg_ds.producer_name_filter.is_empty()
                    && !cfg_ds.producer_name_filter.iter().any(|f| *f == conn.name)
                {
                    continue;
                }
                let session = state.sessions.get(&session_id).unwrap();
                let already = session.instances.iter().any(|inst| {
                    inst.producer_id == registered.producer_id
                        && inst.config.name.as_deref().unwrap_or("") == name
                });
                if already {
                    continue;
                }
                // Rewrite the buffer index into the service-wide id.
                let mut instance_config = ds_config.clone();
                let index = ds_config.target_buffer.unwrap_or(0) as usize;
                instance_config.target_buffer = Some(u32::from(buffer_ids[index]));
                new_instances.push(NewInstance {
                    producer_id: registered.producer_id,
                    ds_config: instance_config,
                });
            }
        }

        let session_active = matches!(
            state.sessions.get(&session_id).unwrap().state,
            SessionState::Active
        );
        for new_instance in new_instances {
            state.last_instance_id += 1;
            let instance_id = state.last_instance_id;
            let conn = state.producers.get(&new_instance.producer_id).unwrap();
            let producer = conn.producer.clone();
            let ds_config = new_instance.ds_config.clone();
            conn.task_runner.post(move || {
                producer.setup_data_source(instance_id, ds_config.clone());
                if session_active {
                    producer.start_data_source(instance_id, ds_config);
                }
            });
            state
                .sessions
                .get_mut(&session_id)
                .unwrap()
                .instances
                .push(DataSourceInstance {
                    id: instance_id,
                    producer_id: new_instance.producer_id,
                    config: new_instance.ds_config,
                    stopped: false,
                });
        }
    }

    fn start_tracing(self: &Arc<Self>, consumer_id: ConsumerId) -> Result<()> {
        let mut to_start = Vec::new();
        let session_id;
        let duration_ms;
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            session_id = Self::session_of(state, consumer_id)?;
            let session = state.sessions.get_mut(&session_id).unwrap();
            if session.state != SessionState::Configured {
                return Err(Error::InvalidStateTransition("start"));
            }
            session.state = SessionState::Active;
            duration_ms = session.config.duration_ms();
            for instance in &session.instances {
                if let Some(conn) = state.producers.get(&instance.producer_id) {
                    to_start.push((
                        conn.producer.clone(),
                        conn.task_runner.clone(),
                        instance.id,
                        instance.config.clone(),
                    ));
                }
            }
        }
        for (producer, runner, instance_id, config) in to_start {
            runner.post(move || producer.start_data_source(instance_id, config));
        }
        if duration_ms > 0 {
            let weak = Arc::downgrade(self);
            self.task_runner
                .post_delayed(Duration::from_millis(u64::from(duration_ms)), move || {
                    if let Some(service) = weak.upgrade() {
                        service.disable_session(session_id);
                    }
                });
        }
        Ok(())
    }

    fn disable_tracing(self: &Arc<Self>, consumer_id: ConsumerId) -> Result<()> {
        let session_id = Self::session_of(&self.state.lock().unwrap(), consumer_id)?;
        self.disable_session(session_id);
        Ok(())
    }

    fn disable_session(self: &Arc<Self>, session_id: TracingSessionId) {
        let mut to_stop = Vec::new();
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return;
            };
            match session.state {
                SessionState::Flushing | SessionState::Disabled => return,
                SessionState::Configured => {
                    // Never started; nothing to wait for.
                    session.state = SessionState::Disabled;
                    let consumer_id = session.consumer_id;
                    self.post_tracing_disabled(&state, consumer_id);
                    return;
                }
                SessionState::Active => {}
            }
            session.state = SessionState::Flushing;
            for instance in &session.instances {
                if instance.stopped {
                    continue;
                }
                if let Some(conn) = state.producers.get(&instance.producer_id) {
                    to_stop.push((conn.producer.clone(), conn.task_runner.clone(), instance.id));
                }
            }
            if session.instances.iter().all(|i| i.stopped) {
                self.finalize_disable_locked(state, session_id);
                return;
            }
        }
        for (producer, runner, instance_id) in to_stop {
            runner.post(move || producer.stop_data_source(instance_id));
        }
        let weak = Arc::downgrade(self);
        self.task_runner
            .post_delayed(self.config.data_source_stop_timeout, move || {
                if let Some(service) = weak.upgrade() {
                    let mut state = service.state.lock().unwrap();
                    if state
                        .sessions
                        .get(&session_id)
                        .is_some_and(|s| s.state == SessionState::Flushing)
                    {
                        log::warn!("session {session_id}: data source stop timed out");
                        service.finalize_disable_locked(&mut state, session_id);
                    }
                }
            });
    }

    fn finalize_disable_locked(
        self: &Arc<Self>,
        state: &mut ServiceState,
        session_id: TracingSessionId,
    ) {
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return;
        };
        session.state = SessionState::Disabled;
        let consumer_id = session.consumer_id;
        self.post_tracing_disabled(state, consumer_id);
    }

    fn post_tracing_disabled(self: &Arc<Self>, state: &ServiceState, consumer_id: ConsumerId) {
        if let Some(conn) = state.consumers.get(&consumer_id) {
            let consumer = conn.consumer.clone();
            self.task_runner.post(move || consumer.on_tracing_disabled());
        }
    }

    fn notify_data_source_stopped(
        self: &Arc<Self>,
        producer_id: ProducerId,
        instance_id: DataSourceInstanceId,
    ) {
        let mut state = self.state.lock().unwrap();
        let mut finalize = None;
        for (session_id, session) in state.sessions.iter_mut() {
            for instance in session.instances.iter_mut() {
                if instance.id == instance_id && instance.producer_id == producer_id {
                    instance.stopped = true;
                }
            }
            if session.state == SessionState::Flushing
                && session.instances.iter().all(|i| i.stopped)
            {
                finalize = Some(*session_id);
            }
        }
        if let Some(session_id) = finalize {
            self.finalize_disable_locked(&mut state, session_id);
        }
    }

    fn flush(
        self: &Arc<Self>,
        consumer_id: ConsumerId,
        timeout: Duration,
        callback: Box<dyn FnOnce(bool) + Send>,
    ) {
        let flush_id;
        let mut to_flush = Vec::new();
        let cpu_source;
        {
            let mut state = self.state.lock().unwrap();
            let Ok(session_id) = Self::session_of(&state, consumer_id) else {
                callback(false);
                return;
            };
            state.last_flush_id += 1;
            flush_id = state.last_flush_id;

            let session = state.sessions.get(&session_id).unwrap();
            let mut per_producer: HashMap<ProducerId, Vec<DataSourceInstanceId>> = HashMap::new();
            for instance in &session.instances {
                per_producer
                    .entry(instance.producer_id)
                    .or_default()
                    .push(instance.id);
            }
            let remaining_producers: HashSet<ProducerId> = per_producer.keys().copied().collect();
            for (producer_id, instances) in per_producer {
                if let Some(conn) = state.producers.get(&producer_id) {
                    to_flush.push((conn.producer.clone(), conn.task_runner.clone(), instances));
                }
            }

            cpu_source = state.cpu_flush_source.clone();
            let mut remaining_cpus = CpuSet::new();
            if let Some(source) = &cpu_source {
                for cpu in 0..source.num_cpus() {
                    remaining_cpus.set(cpu);
                }
            }

            state.flushes.insert(
                flush_id,
                PendingFlush {
                    session_id,
                    remaining_producers,
                    remaining_cpus,
                    callback: Some(callback),
                },
            );
            // A session with nothing to ask completes immediately.
            self.maybe_complete_flush_locked(&mut state, flush_id);
        }

        for (producer, runner, instances) in to_flush {
            runner.post(move || producer.flush(flush_id, instances));
        }
        if let Some(source) = &cpu_source {
            let weak = Arc::downgrade(self);
            source.flush(
                flush_id,
                Arc::new(move |cpu| {
                    if let Some(service) = weak.upgrade() {
                        service.on_cpu_flush_ack(flush_id, cpu);
                    }
                }),
            );
        }

        let weak = Arc::downgrade(self);
        self.task_runner.post_delayed(timeout, move || {
            if let Some(service) = weak.upgrade() {
                service.on_flush_timeout(flush_id);
            }
        });
    }

    fn notify_flush_complete(self: &Arc<Self>, producer_id: ProducerId, flush_id: FlushRequestId) {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = state.flushes.get_mut(&flush_id) {
            pending.remaining_producers.remove(&producer_id);
        }
        self.maybe_complete_flush_locked(&mut state, flush_id);
    }

    fn on_cpu_flush_ack(self: &Arc<Self>, flush_id: FlushRequestId, cpu: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = state.flushes.get_mut(&flush_id) {
            pending.remaining_cpus.clear(cpu);
        }
        self.maybe_complete_flush_locked(&mut state, flush_id);
    }

    fn maybe_complete_flush_locked(
        self: &Arc<Self>,
        state: &mut ServiceState,
        flush_id: FlushRequestId,
    ) {
        let done = state.flushes.get(&flush_id).is_some_and(|pending| {
            pending.remaining_producers.is_empty() && pending.remaining_cpus.is_empty()
        });
        if done {
            let mut pending = state.flushes.remove(&flush_id).unwrap();
            if let Some(callback) = pending.callback.take() {
                self.task_runner.post(move || callback(true));
            }
        }
    }

    /// Expires the flush: surface the partial result and the outstanding
    /// ack sets, put the readers back to work, keep the session alive.
    fn on_flush_timeout(self: &Arc<Self>, flush_id: FlushRequestId) {
        let cpu_source;
        {
            let mut state = self.state.lock().unwrap();
            let Some(mut pending) = state.flushes.remove(&flush_id) else {
                return;
            };
            state.stats.flush_timeouts += 1;
            state.stats.last_flush_outstanding_producers =
                pending.remaining_producers.iter().fold(0u64, |mask, id| {
                    mask | (1u64 << (id % 64))
                });
            state.stats.last_flush_outstanding_cpus = pending.remaining_cpus.as_raw();
            cpu_source = state.cpu_flush_source.clone();
            if let Some(callback) = pending.callback.take() {
                self.task_runner.post(move || callback(false));
            }
            log::warn!(
                "flush {flush_id} timed out; outstanding cpus: {:#x}",
                pending.remaining_cpus.as_raw()
            );
        }
        if let Some(source) = cpu_source {
            source.reset_to_run();
        }
    }

    fn register_data_source(
        self: &Arc<Self>,
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
    ) -> DataSourceId {
        let mut state = self.state.lock().unwrap();
        state.last_data_source_id += 1;
        let id = state.last_data_source_id;
        state.data_sources.push(RegisteredDataSource {
            id,
            name: descriptor.name,
            producer_id,
        });
        // A session may already be waiting for this data source.
        let session_ids: Vec<TracingSessionId> = state.sessions.keys().copied().collect();
        for session_id in session_ids {
            self.setup_session_data_sources(&mut state, session_id);
        }
        id
    }

    fn unregister_data_source(self: &Arc<Self>, producer_id: ProducerId, id: DataSourceId) {
        let mut state = self.state.lock().unwrap();
        state
            .data_sources
            .retain(|ds| !(ds.id == id && ds.producer_id == producer_id));
    }

    fn commit_data(
        self: &Arc<Self>,
        producer_id: ProducerId,
        abi: &SharedMemoryAbi,
        request: CommitDataRequest,
    ) {
        for chunk in &request.chunks_to_move {
            if chunk.page >= abi.num_pages() {
                let mut state = self.state.lock().unwrap();
                state.stats.abi_violations += 1;
                continue;
            }
            let page_was_complete = abi.is_page_complete(chunk.page);
            let Some(handle) = abi.try_acquire_chunk_for_reading(chunk.page, chunk.chunk) else {
                // Double commit or a chunk never released; ignore.
                let mut state = self.state.lock().unwrap();
                state.stats.abi_violations += 1;
                continue;
            };
            let target = abi.target_buffer(chunk.page);
            self.copy_chunk_into_buffer(producer_id, target, &handle, !page_was_complete);
            handle.release_as_free();
        }
    }

    fn copy_chunk_into_buffer(
        self: &Arc<Self>,
        producer_id: ProducerId,
        target: BufferId,
        handle: &ChunkReadHandle,
        partial_page: bool,
    ) {
        let header = handle.header();
        let payload = handle.payload();

        // Never trust the header: walk the declared fragments and keep
        // only the bytes that are actually there.
        let mut iter = ChunkPacketIter::new(payload, header.num_packets);
        let mut used = 0usize;
        let mut valid_packets = 0u16;
        for fragment in iter.by_ref() {
            used = fragment.as_ptr() as usize - payload.as_ptr() as usize + fragment.len();
            valid_packets += 1;
        }
        let malformed = iter.malformed();

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if malformed {
            state.stats.abi_violations += 1;
        }
        if partial_page {
            state.stats.partial_page_reads += 1;
        }

        let session_ok = state.sessions.values().any(|session| {
            session.buffer_ids.contains(&target)
                && matches!(
                    session.state,
                    SessionState::Active | SessionState::Flushing
                )
        });
        let Some(buffer) = state.buffers.get_mut(&target) else {
            state.stats.chunks_discarded += 1;
            return;
        };
        if !session_ok {
            state.stats.chunks_discarded += 1;
            return;
        }
        buffer.append(ChunkRecord {
            producer_id,
            writer_id: header.writer_id,
            chunk_id: header.chunk_id,
            flags: header.flags,
            num_packets: valid_packets,
            payload: payload[..used].to_vec(),
        });
        state.stats.chunks_committed += 1;
    }

    fn read_buffers(self: &Arc<Self>, consumer_id: ConsumerId) {
        let consumer;
        let mut packets: Vec<Bytes> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Ok(session_id) = Self::session_of(&state, consumer_id) else {
                return;
            };
            consumer = state.consumers.get(&consumer_id).unwrap().consumer.clone();
            let session = state.sessions.get_mut(&session_id).unwrap();
            let buffer_ids = session.buffer_ids.clone();
            for buffer_id in buffer_ids {
                let Some(buffer) = state.buffers.get_mut(&buffer_id) else {
                    continue;
                };
                let chunks = buffer.take_unread();
                let session = state.sessions.get_mut(&session_id).unwrap();
                let stitcher = session.stitchers.get_mut(&buffer_id).unwrap();
                let mut out = Vec::new();
                for chunk in chunks {
                    stitcher.push_chunk(chunk, &mut out);
                }
                packets.extend(out.into_iter().map(Bytes::from));
            }
        }

        let batch_size = self.config.read_batch_size;
        let mut batches: Vec<Vec<Bytes>> =
            packets.chunks(batch_size).map(<[Bytes]>::to_vec).collect();
        if batches.is_empty() {
            batches.push(Vec::new());
        }
        let last = batches.len() - 1;
        for (i, batch) in batches.into_iter().enumerate() {
            let consumer = consumer.clone();
            let has_more = i != last;
            self.task_runner
                .post(move || consumer.on_trace_data(batch, has_more));
        }
    }

    fn free_buffers(self: &Arc<Self>, consumer_id: ConsumerId) {
        let mut state = self.state.lock().unwrap();
        let Ok(session_id) = Self::session_of(&state, consumer_id) else {
            return;
        };
        self.destroy_session_locked(&mut state, session_id);
    }

    fn destroy_session_locked(
        self: &Arc<Self>,
        state: &mut ServiceState,
        session_id: TracingSessionId,
    ) {
        let Some(session) = state.sessions.remove(&session_id) else {
            return;
        };
        for buffer_id in &session.buffer_ids {
            state.buffers.remove(buffer_id);
            state.buffer_ids.release(*buffer_id);
        }
        for stitcher in session.stitchers.values() {
            let c = stitcher.counters();
            state.retired_stitch.packets_dropped += c.packets_dropped;
            state.retired_stitch.abi_violations += c.abi_violations;
            state.retired_stitch.chunks_out_of_order += c.chunks_out_of_order;
        }
        // Stop anything still running.
        for instance in &session.instances {
            if instance.stopped {
                continue;
            }
            if let Some(conn) = state.producers.get(&instance.producer_id) {
                let producer = conn.producer.clone();
                let instance_id = instance.id;
                conn.task_runner
                    .post(move || producer.stop_data_source(instance_id));
            }
        }
        if let Some(conn) = state.consumers.get_mut(&session.consumer_id) {
            conn.session = None;
        }
        state
            .flushes
            .retain(|_, pending| pending.session_id != session_id);
        state.stats.sessions_destroyed += 1;
    }

    fn disconnect_consumer(self: &Arc<Self>, consumer_id: ConsumerId) {
        let mut state = self.state.lock().unwrap();
        if let Ok(session_id) = Self::session_of(&state, consumer_id) {
            self.destroy_session_locked(&mut state, session_id);
        }
        if let Some(conn) = state.consumers.remove(&consumer_id) {
            let consumer = conn.consumer;
            self.task_runner.post(move || consumer.on_disconnect());
        }
    }

    fn disconnect_producer(self: &Arc<Self>, producer_id: ProducerId) {
        // Scrape complete pages out of the shared region first, so chunks
        // the producer finished but never managed to commit survive.
        let abi = {
            let state = self.state.lock().unwrap();
            state.producers.get(&producer_id).map(|c| c.abi.clone())
        };
        if let Some(abi) = &abi {
            self.scrape_shared_memory(producer_id, abi);
        }

        let mut state = self.state.lock().unwrap();
        let Some(conn) = state.producers.remove(&producer_id) else {
            return;
        };
        state.data_sources.retain(|ds| ds.producer_id != producer_id);

        // Evict the stitcher state so a half-written packet from this
        // producer never blocks reassembly, and drop its instances. The
        // sessions themselves survive.
        let mut to_finalize = Vec::new();
        for (session_id, session) in state.sessions.iter_mut() {
            session.instances.retain(|i| i.producer_id != producer_id);
            for stitcher in session.stitchers.values_mut() {
                stitcher.evict_producer(producer_id);
            }
            if session.state == SessionState::Flushing
                && session.instances.iter().all(|i| i.stopped)
            {
                to_finalize.push(*session_id);
            }
        }
        for session_id in to_finalize {
            self.finalize_disable_locked(&mut state, session_id);
        }

        // Flushes must not wait for a dead producer.
        let flush_ids: Vec<FlushRequestId> = state.flushes.keys().copied().collect();
        for flush_id in flush_ids {
            if let Some(pending) = state.flushes.get_mut(&flush_id) {
                pending.remaining_producers.remove(&producer_id);
            }
            self.maybe_complete_flush_locked(&mut state, flush_id);
        }

        let producer = conn.producer;
        conn.task_runner.post(move || producer.on_disconnect());
    }

    /// Salvages chunks a disconnecting producer completed but never
    /// committed. Whole-page acquisition is the preferred path; pages with
    /// some chunks still free or in flight fall back to single complete
    /// chunks.
    fn scrape_shared_memory(self: &Arc<Self>, producer_id: ProducerId, abi: &SharedMemoryAbi) {
        use ferrotrace_abi::ChunkState;
        for page in 0..abi.num_pages() {
            if let Some(handles) = abi.try_acquire_all_chunks_for_reading(page) {
                let target = abi.target_buffer(page);
                for handle in &handles {
                    if handle.header().num_packets > 0 {
                        self.copy_chunk_into_buffer(producer_id, target, handle, false);
                    }
                }
                drop(handles);
                abi.release_all_chunks_as_free(page);
                continue;
            }
            let snapshot = abi.snapshot(page);
            for chunk in 0..snapshot.num_chunks {
                if snapshot.states[chunk as usize] != ChunkState::Complete {
                    continue;
                }
                if let Some(handle) = abi.try_acquire_chunk_for_reading(page, chunk) {
                    let target = abi.target_buffer(page);
                    if handle.header().num_packets > 0 {
                        self.copy_chunk_into_buffer(producer_id, target, &handle, true);
                    }
                    handle.release_as_free();
                }
            }
        }
    }

    fn register_trace_writer(
        self: &Arc<Self>,
        producer_id: ProducerId,
        writer_id: WriterId,
        target: BufferId,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.producers.get_mut(&producer_id) {
            conn.writer_targets.insert(writer_id, target);
        }
    }

    fn unregister_trace_writer(self: &Arc<Self>, producer_id: ProducerId, writer_id: WriterId) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.producers.get_mut(&producer_id) {
            conn.writer_targets.remove(&writer_id);
        }
    }

    fn session_of(state: &ServiceState, consumer_id: ConsumerId) -> Result<TracingSessionId> {
        state
            .consumers
            .get(&consumer_id)
            .and_then(|c| c.session)
            .ok_or(Error::SessionNotFound)
    }

    fn session_state(self: &Arc<Self>, consumer_id: ConsumerId) -> Option<SessionState> {
        let state = self.state.lock().unwrap();
        let session_id = Self::session_of(&state, consumer_id).ok()?;
        state.sessions.get(&session_id).map(|s| s.state)
    }

    fn session_buffer_stats(self: &Arc<Self>, consumer_id: ConsumerId) -> Vec<crate::stats::BufferStats> {
        let state = self.state.lock().unwrap();
        let Ok(session_id) = Self::session_of(&state, consumer_id) else {
            return Vec::new();
        };
        let Some(session) = state.sessions.get(&session_id) else {
            return Vec::new();
        };
        session
            .buffer_ids
            .iter()
            .filter_map(|id| state.buffers.get(id).map(TraceBuffer::stats))
            .collect()
    }
}

/// Producer-facing façade. Methods no-op once the service is gone.
pub struct ProducerEndpoint {
    service: Weak<ServiceInner>,
    producer_id: ProducerId,
    abi: SharedMemoryAbi,
    task_runner: Arc<dyn TaskRunner>,
}

impl ProducerEndpoint {
    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    /// The shared region this producer writes through.
    pub fn shared_memory(&self) -> SharedMemoryAbi {
        self.abi.clone()
    }

    pub fn register_data_source(&self, descriptor: DataSourceDescriptor) -> DataSourceId {
        match self.service.upgrade() {
            Some(service) => service.register_data_source(self.producer_id, descriptor),
            None => 0,
        }
    }

    pub fn unregister_data_source(&self, id: DataSourceId) {
        if let Some(service) = self.service.upgrade() {
            service.unregister_data_source(self.producer_id, id);
        }
    }

    pub fn register_trace_writer(&self, writer_id: WriterId, target_buffer: BufferId) {
        if let Some(service) = self.service.upgrade() {
            service.register_trace_writer(self.producer_id, writer_id, target_buffer);
        }
    }

    pub fn unregister_trace_writer(&self, writer_id: WriterId) {
        if let Some(service) = self.service.upgrade() {
            service.unregister_trace_writer(self.producer_id, writer_id);
        }
    }

    pub fn commit_data(&self, request: CommitDataRequest, callback: Box<dyn FnOnce() + Send>) {
        if let Some(service) = self.service.upgrade() {
            service.commit_data(self.producer_id, &self.abi, request);
        }
        // The ack always fires, exactly once, on the producer's runner.
        self.task_runner.post(callback);
    }

    pub fn notify_data_source_stopped(&self, instance_id: DataSourceInstanceId) {
        if let Some(service) = self.service.upgrade() {
            service.notify_data_source_stopped(self.producer_id, instance_id);
        }
    }

    pub fn notify_flush_complete(&self, flush_id: FlushRequestId) {
        if let Some(service) = self.service.upgrade() {
            service.notify_flush_complete(self.producer_id, flush_id);
        }
    }

    /// Severs the connection; instances die, sessions survive.
    pub fn disconnect(&self) {
        if let Some(service) = self.service.upgrade() {
            service.disconnect_producer(self.producer_id);
        }
    }
}

impl ferrotrace_arbiter::CommitSink for ProducerEndpoint {
    fn commit_data(&self, request: CommitDataRequest, callback: Box<dyn FnOnce() + Send>) {
        ProducerEndpoint::commit_data(self, request, callback);
    }
}

/// Consumer-facing façade.
pub struct ConsumerEndpoint {
    service: Weak<ServiceInner>,
    consumer_id: ConsumerId,
}

impl ConsumerEndpoint {
    pub fn enable_tracing(&self, config: TraceConfig) -> Result<()> {
        match self.service.upgrade() {
            Some(service) => service.enable_tracing(self.consumer_id, config),
            None => Err(Error::SessionNotFound),
        }
    }

    pub fn start_tracing(&self) -> Result<()> {
        match self.service.upgrade() {
            Some(service) => service.start_tracing(self.consumer_id),
            None => Err(Error::SessionNotFound),
        }
    }

    pub fn disable_tracing(&self) -> Result<()> {
        match self.service.upgrade() {
            Some(service) => service.disable_tracing(self.consumer_id),
            None => Err(Error::SessionNotFound),
        }
    }

    /// Checkpoint: the callback reports whether every producer and CPU
    /// acked before `timeout`.
    pub fn flush(&self, timeout: Duration, callback: Box<dyn FnOnce(bool) + Send>) {
        match self.service.upgrade() {
            Some(service) => service.flush(self.consumer_id, timeout, callback),
            None => callback(false),
        }
    }

    /// Drains unread data; results arrive via `Consumer::on_trace_data`.
    pub fn read_buffers(&self) {
        if let Some(service) = self.service.upgrade() {
            service.read_buffers(self.consumer_id);
        }
    }

    pub fn free_buffers(&self) {
        if let Some(service) = self.service.upgrade() {
            service.free_buffers(self.consumer_id);
        }
    }

    pub fn disconnect(&self) {
        if let Some(service) = self.service.upgrade() {
            service.disconnect_consumer(self.consumer_id);
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.service
            .upgrade()
            .and_then(|service| service.session_state(self.consumer_id))
    }

    /// Stats of the session's buffers, in config order.
    pub fn session_buffer_stats(&self) -> Vec<crate::stats::BufferStats> {
        self.service
            .upgrade()
            .map(|service| service.session_buffer_stats(self.consumer_id))
            .unwrap_or_default()
    }
}
