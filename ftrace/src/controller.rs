//! Orchestration of the ftrace engine: config muxing, reader lifecycle,
//! drain scheduling and flush handshakes.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ferrotrace_base::{TaskRunner, TaskRunnerExt};
use ferrotrace_proto::config::FtraceConfig;
use ferrotrace_service::FlushRequestId;

use crate::config_muxer::FtraceConfigMuxer;
use crate::cpu_reader::{CpuReader, CpuReaderConfig, CpuReaderObserver};
use crate::cpu_stats::{FtraceStats, parse_cpu_stats};
use crate::data_source::FtraceDataSource;
use crate::page_pool::{DEFAULT_POOL_PAGES, PagePool};
use crate::thread_sync::{Cmd, ThreadSync};
use crate::tracefs::Tracefs;
use crate::translation_table::{EventFilter, TranslationTable};
use ferrotrace_arbiter::TraceWriter;

const DEFAULT_DRAIN_PERIOD_MS: u32 = 100;
const MIN_DRAIN_PERIOD_MS: u32 = 1;
const MAX_DRAIN_PERIOD_MS: u32 = 1000 * 60;
const FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

fn clamp_drain_period_ms(drain_period_ms: u32) -> u32 {
    if drain_period_ms == 0 {
        return DEFAULT_DRAIN_PERIOD_MS;
    }
    if !(MIN_DRAIN_PERIOD_MS..=MAX_DRAIN_PERIOD_MS).contains(&drain_period_ms) {
        log::warn!(
            "drain_period_ms was {drain_period_ms}, should be between {MIN_DRAIN_PERIOD_MS} and {MAX_DRAIN_PERIOD_MS}"
        );
        return DEFAULT_DRAIN_PERIOD_MS;
    }
    drain_period_ms
}

#[derive(Debug, Clone)]
pub struct FtraceControllerConfig {
    pub reader: CpuReaderConfig,
    pub pool_pages: usize,
}

impl Default for FtraceControllerConfig {
    fn default() -> Self {
        Self {
            reader: CpuReaderConfig::default(),
            pool_pages: DEFAULT_POOL_PAGES,
        }
    }
}

struct PendingFlush {
    flush_id: FlushRequestId,
    on_cpu_ack: Arc<dyn Fn(usize) + Send + Sync>,
}

struct ControllerState {
    muxer: FtraceConfigMuxer,
    data_sources: HashMap<u64, Arc<FtraceDataSource>>,
    started: Vec<u64>,
    readers: Vec<Arc<CpuReader>>,
    generation: u64,
    cur_flush: Option<PendingFlush>,
    /// Per-config drain periods, by instance id.
    drain_periods: HashMap<u64, u32>,
}

struct ControllerInner {
    task_runner: Arc<dyn TaskRunner>,
    tracefs: Arc<Tracefs>,
    table: Arc<TranslationTable>,
    thread_sync: Arc<ThreadSync>,
    config: FtraceControllerConfig,
    state: Mutex<ControllerState>,
}

/// Muxes ftrace configs, owns the per-CPU readers, and schedules drains on
/// the main task runner.
#[derive(Clone)]
pub struct FtraceController {
    inner: Arc<ControllerInner>,
}

impl FtraceController {
    pub fn new(
        tracefs: Arc<Tracefs>,
        table: Arc<TranslationTable>,
        task_runner: Arc<dyn TaskRunner>,
        config: FtraceControllerConfig,
    ) -> Self {
        let muxer = FtraceConfigMuxer::new(tracefs.clone(), table.clone());
        Self {
            inner: Arc::new(ControllerInner {
                task_runner,
                tracefs,
                table,
                thread_sync: Arc::new(ThreadSync::new()),
                config,
                state: Mutex::new(ControllerState {
                    muxer,
                    data_sources: HashMap::new(),
                    started: Vec::new(),
                    readers: Vec::new(),
                    generation: 0,
                    cur_flush: None,
                    drain_periods: HashMap::new(),
                }),
            }),
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.inner.tracefs.num_cpus()
    }

    pub fn table(&self) -> Arc<TranslationTable> {
        self.inner.table.clone()
    }

    /// Sets up kernel state for a new instance and takes ownership of its
    /// trace writer. Does not start the capture.
    pub fn add_data_source(
        &self,
        instance_id: u64,
        request: &FtraceConfig,
        writer: TraceWriter,
    ) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(config_id) = state.muxer.setup_config(request) else {
            return false;
        };
        let granted = state.muxer.get_config(config_id).unwrap();
        let filter = EventFilter::new(
            &self.inner.table,
            granted.event_names.iter().map(String::as_str),
        );
        state.drain_periods.insert(
            instance_id,
            clamp_drain_period_ms(request.drain_period_ms.unwrap_or(0)),
        );
        state.data_sources.insert(
            instance_id,
            Arc::new(FtraceDataSource::new(
                instance_id,
                config_id,
                self.inner.table.clone(),
                filter,
                writer,
            )),
        );
        true
    }

    pub fn start_data_source(&self, instance_id: u64) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(data_source) = state.data_sources.get(&instance_id) else {
            return false;
        };
        let config_id = data_source.config_id();
        if !state.muxer.activate_config(config_id) {
            return false;
        }
        state.started.push(instance_id);
        if state.started.len() == 1 {
            self.start_readers_locked(&mut state);
        }
        true
    }

    pub fn remove_data_source(&self, instance_id: u64) {
        let stopped_readers;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.started.retain(|id| *id != instance_id);
            state.drain_periods.remove(&instance_id);
            let Some(data_source) = state.data_sources.remove(&instance_id) else {
                return;
            };
            state.muxer.remove_config(data_source.config_id());
            stopped_readers = if state.started.is_empty() {
                self.stop_readers_locked(&mut state)
            } else {
                Vec::new()
            };
        }
        // Joining the workers must happen outside the state lock: a worker
        // mid-callback may be waiting on it.
        drop(stopped_readers);
    }

    fn start_readers_locked(&self, state: &mut ControllerState) {
        debug_assert!(state.readers.is_empty());
        state.generation += 1;
        let generation = state.generation;
        self.inner.thread_sync.issue(Cmd::Run);
        {
            // Stale bits from the previous generation must not trigger
            // drains or satisfy a flush.
            let mut sync = self.inner.thread_sync.state.lock().unwrap();
            sync.cpus_to_drain = Default::default();
            sync.flush_acks = Default::default();
        }

        let page_size = ferrotrace_base::PAGE_SIZE;
        let observer: Arc<dyn CpuReaderObserver> = Arc::new(ControllerObserver {
            inner: Arc::downgrade(&self.inner),
        });
        for cpu in 0..self.inner.tracefs.num_cpus() {
            let fd = match self.inner.tracefs.open_raw_pipe(cpu) {
                Ok(fd) => fd,
                Err(e) => {
                    log::error!("cannot open raw pipe for cpu{cpu}: {e:#}");
                    continue;
                }
            };
            let pool = Arc::new(PagePool::new(self.inner.config.pool_pages, page_size));
            match CpuReader::new(
                cpu,
                generation,
                fd,
                page_size,
                pool,
                self.inner.thread_sync.clone(),
                self.inner.config.reader,
                observer.clone(),
            ) {
                Ok(reader) => state.readers.push(Arc::new(reader)),
                Err(e) => log::error!("cannot start reader for cpu{cpu}: {e}"),
            }
        }
    }

    /// Quits the workers and hands the readers back; the caller drops
    /// (and thereby joins) them after releasing the state lock. Each
    /// reader's teardown then runs in the required order: close kernel
    /// fd, signal, join, close staging pipe.
    fn stop_readers_locked(&self, state: &mut ControllerState) -> Vec<Arc<CpuReader>> {
        if state.readers.is_empty() {
            return Vec::new();
        }
        self.inner.thread_sync.issue(Cmd::Quit);
        for reader in &state.readers {
            reader.interrupt_worker_with_signal();
        }
        state.generation += 1;
        std::mem::take(&mut state.readers)
    }

    /// Minimum over the started configs, clamped.
    fn drain_period_ms(state: &ControllerState) -> u32 {
        let min = state
            .started
            .iter()
            .filter_map(|id| state.drain_periods.get(id))
            .min()
            .copied();
        clamp_drain_period_ms(min.unwrap_or(0))
    }

    /// Main-thread drain: pull pages from every CPU that signalled, parse
    /// them into each started data source, then unblock the readers.
    fn drain_cpus(inner: &Arc<ControllerInner>, generation: u64) {
        let (readers, data_sources, to_drain, acked_flush) = {
            let mut state = inner.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            let num_readers = state.readers.len();
            let (to_drain, flush_done) = {
                let mut sync = inner.thread_sync.state.lock().unwrap();
                let to_drain = sync.cpus_to_drain.take();
                let flush_done =
                    state.cur_flush.is_some() && sync.flush_acks.count() >= num_readers;
                if flush_done {
                    sync.flush_acks = Default::default();
                }
                (to_drain, flush_done)
            };
            let acked_flush = flush_done.then(|| state.cur_flush.take().unwrap());
            let data_sources: Vec<Arc<FtraceDataSource>> = state
                .started
                .iter()
                .filter_map(|id| state.data_sources.get(id).cloned())
                .collect();
            (state.readers.clone(), data_sources, to_drain, acked_flush)
        };

        for reader in &readers {
            if !to_drain.is_set(reader.cpu()) {
                continue;
            }
            reader.drain(|cpu, page| {
                for data_source in &data_sources {
                    data_source.write_page(cpu, page);
                }
            });
        }

        // Unblock the waiting readers, unless a flush or quit is pending.
        {
            let sync = inner.thread_sync.state.lock().unwrap();
            let cmd = sync.cmd;
            drop(sync);
            if cmd == Cmd::Run {
                inner.thread_sync.issue(Cmd::Run);
            }
        }

        if let Some(flush) = acked_flush {
            {
                let sync = inner.thread_sync.state.lock().unwrap();
                let cmd = sync.cmd;
                drop(sync);
                if cmd == Cmd::Flush {
                    inner.thread_sync.issue(Cmd::Run);
                }
            }
            // Commit the userspace side of every started data source, then
            // surface the per-CPU acks.
            for data_source in &data_sources {
                data_source.flush_writer();
            }
            for reader in &readers {
                (flush.on_cpu_ack)(reader.cpu());
            }
            log::debug!("ftrace flush {} complete", flush.flush_id);
        }
    }

    /// Publishes a flush to the workers. `on_cpu_ack` fires once per CPU
    /// after the drain that observes all worker acks.
    pub fn flush(&self, flush_id: FlushRequestId, on_cpu_ack: Arc<dyn Fn(usize) + Send + Sync>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state
                .cur_flush
                .as_ref()
                .is_some_and(|f| f.flush_id == flush_id)
            {
                return; // Already dealing with this request.
            }
            if state.readers.is_empty() {
                // Idle engine: nothing is buffered in any pipe.
                drop(state);
                for cpu in 0..self.num_cpus() {
                    on_cpu_ack(cpu);
                }
                return;
            }
            state.cur_flush = Some(PendingFlush {
                flush_id,
                on_cpu_ack,
            });
            {
                let mut sync = self.inner.thread_sync.state.lock().unwrap();
                sync.flush_acks = Default::default();
            }
            self.issue_cmd_locked(&state, Cmd::Flush);
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.task_runner.post_delayed(FLUSH_TIMEOUT, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            FtraceController { inner }.on_flush_timeout(flush_id);
        });
    }

    fn on_flush_timeout(&self, flush_id: FlushRequestId) {
        let mut state = self.inner.state.lock().unwrap();
        if !state
            .cur_flush
            .as_ref()
            .is_some_and(|f| f.flush_id == flush_id)
        {
            return;
        }
        let acks = self.inner.thread_sync.state.lock().unwrap().flush_acks.take();
        log::warn!(
            "ftrace flush {flush_id} timed out, acked cpu set: {:#x}",
            acks.as_raw()
        );
        state.cur_flush = None;
        self.reset_to_run_locked(&state);
    }

    /// Puts the workers back into the run state after a flush timeout.
    pub fn reset_to_run(&self) {
        let state = self.inner.state.lock().unwrap();
        self.reset_to_run_locked(&state);
    }

    fn reset_to_run_locked(&self, state: &ControllerState) {
        let cmd = self.inner.thread_sync.state.lock().unwrap().cmd;
        if cmd == Cmd::Flush {
            self.issue_cmd_locked(state, Cmd::Run);
        }
    }

    /// Publishes `cmd` and interrupts workers stuck in blocking page
    /// moves.
    fn issue_cmd_locked(&self, state: &ControllerState, cmd: Cmd) {
        self.inner.thread_sync.issue(cmd);
        for reader in &state.readers {
            reader.interrupt_worker_with_signal();
        }
    }

    /// Snapshot of the kernel's per-CPU ring-buffer counters.
    pub fn dump_ftrace_stats(&self) -> FtraceStats {
        let mut stats = FtraceStats::default();
        for cpu in 0..self.inner.tracefs.num_cpus() {
            match self.inner.tracefs.read_cpu_stats(cpu) {
                Ok(text) => match parse_cpu_stats(cpu as u32, &text) {
                    Ok(cpu_stats) => stats.cpu_stats.push(cpu_stats),
                    Err(e) => log::warn!("bad stats file for cpu{cpu}: {e:#}"),
                },
                Err(e) => log::debug!("no stats for cpu{cpu}: {e:#}"),
            }
        }
        stats
    }

    /// Commits the writers of the named instances so everything drained so
    /// far is visible; used by the producer-level flush.
    pub fn flush_writers(&self, instance_ids: &[u64]) {
        let data_sources: Vec<Arc<FtraceDataSource>> = {
            let state = self.inner.state.lock().unwrap();
            instance_ids
                .iter()
                .filter_map(|id| state.data_sources.get(id).cloned())
                .collect()
        };
        for data_source in data_sources {
            data_source.flush_writer();
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if !state.readers.is_empty() {
            self.thread_sync.issue(Cmd::Quit);
            for reader in &state.readers {
                reader.interrupt_worker_with_signal();
            }
            state.readers.clear();
        }
    }
}

/// Worker-side callbacks; they run on reader threads and only touch the
/// sync block and the task runner.
struct ControllerObserver {
    inner: Weak<ControllerInner>,
}

impl ControllerObserver {
    fn schedule_drain(&self, cpu: usize, generation: u64, flushing: bool) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (post_drain, delay_ms) = {
            let sync_cmd = {
                let mut sync = inner.thread_sync.state.lock().unwrap();
                if sync.cmd == Cmd::Quit {
                    return; // Data arrived too late.
                }
                let first = sync.cpus_to_drain.is_empty();
                sync.cpus_to_drain.set(cpu);
                (first, sync.cmd)
            };
            let (first, cmd) = sync_cmd;
            let delay_ms = if flushing || cmd == Cmd::Flush {
                // Drain aggressively to keep flush latency low.
                0
            } else {
                let state = inner.state.lock().unwrap();
                FtraceController::drain_period_ms(&state)
            };
            (first, delay_ms)
        };
        if !post_drain && !flushing {
            return;
        }
        let weak = self.inner.clone();
        inner.task_runner.post_delayed(
            Duration::from_millis(u64::from(delay_ms)),
            move || {
                if let Some(inner) = weak.upgrade() {
                    FtraceController::drain_cpus(&inner, generation);
                }
            },
        );
    }
}

impl CpuReaderObserver for ControllerObserver {
    fn on_cpu_read(&self, cpu: usize, generation: u64) {
        self.schedule_drain(cpu, generation, false);
    }

    fn on_cpu_flush(&self, cpu: usize, generation: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut sync = inner.thread_sync.state.lock().unwrap();
            sync.flush_acks.set(cpu);
        }
        self.schedule_drain(cpu, generation, true);
    }
}
