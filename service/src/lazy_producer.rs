//! Producers that gate expensive collection on shared configuration.
//!
//! The gate value is a tri-state string: "0" off, "1" armed by a session,
//! "2" pinned on by the operator (never touched). Releasing the gate is
//! debounced through a generation counter so that back-to-back sessions do
//! not thrash the underlying collector.
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use ferrotrace_base::{TaskRunner, TaskRunnerExt};
use ferrotrace_proto::config::DataSourceConfig;

use crate::endpoints::{DataSourceDescriptor, Producer, ProducerEndpoint};
use crate::service::TracingService;
use crate::{DataSourceInstanceId, FlushRequestId};

/// A shared configuration store the gate lives in: an Android system
/// property, a file, an env var.
pub trait ConfigGate: Send + Sync {
    fn get(&self) -> String;
    fn set(&self, value: &str) -> bool;
}

/// Gate backed by process memory, for tests and in-process collectors.
#[derive(Default)]
pub struct MemoryConfigGate {
    value: Mutex<String>,
}

impl ConfigGate for MemoryConfigGate {
    fn get(&self) -> String {
        self.value.lock().unwrap().clone()
    }

    fn set(&self, value: &str) -> bool {
        *self.value.lock().unwrap() = value.to_owned();
        true
    }
}

/// Gate backed by an environment variable.
pub struct EnvConfigGate {
    var: String,
}

impl EnvConfigGate {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl ConfigGate for EnvConfigGate {
    fn get(&self) -> String {
        std::env::var(&self.var).unwrap_or_default()
    }

    fn set(&self, value: &str) -> bool {
        unsafe { std::env::set_var(&self.var, value) };
        true
    }
}

struct LazyState {
    active_sessions: HashSet<DataSourceInstanceId>,
    generation: u64,
}

/// A producer whose only job is flipping a [`ConfigGate`] while at least
/// one session wants its data source.
pub struct LazyProducer {
    data_source_name: String,
    gate: Arc<dyn ConfigGate>,
    task_runner: Arc<dyn TaskRunner>,
    release_delay: Duration,
    state: Mutex<LazyState>,
    self_weak: Mutex<Weak<LazyProducer>>,
    endpoint: OnceLock<Arc<ProducerEndpoint>>,
}

impl LazyProducer {
    pub fn new(
        data_source_name: impl Into<String>,
        gate: Arc<dyn ConfigGate>,
        task_runner: Arc<dyn TaskRunner>,
        release_delay: Duration,
    ) -> Arc<Self> {
        let producer = Arc::new(Self {
            data_source_name: data_source_name.into(),
            gate,
            task_runner,
            release_delay,
            state: Mutex::new(LazyState {
                active_sessions: HashSet::new(),
                generation: 0,
            }),
            self_weak: Mutex::new(Weak::new()),
            endpoint: OnceLock::new(),
        });
        *producer.self_weak.lock().unwrap() = Arc::downgrade(&producer);
        producer
    }

    pub fn connect(self: &Arc<Self>, service: &TracingService) {
        let endpoint = service.connect_producer(
            self.clone(),
            "lazy_producer",
            self.task_runner.clone(),
            4,
            ferrotrace_base::PAGE_SIZE,
        );
        self.endpoint.set(endpoint).ok();
    }

    pub fn gate_value(&self) -> String {
        self.gate.get()
    }
}

impl Producer for LazyProducer {
    fn on_connect(&self) {
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.register_data_source(DataSourceDescriptor {
                name: self.data_source_name.clone(),
            });
        }
    }

    fn on_disconnect(&self) {}
    fn on_tracing_setup(&self) {}

    fn setup_data_source(&self, instance_id: DataSourceInstanceId, _config: DataSourceConfig) {
        let mut state = self.state.lock().unwrap();
        if state.active_sessions.is_empty() {
            // "2" means force-enabled externally; leave it alone.
            let prev = self.gate.get();
            if prev != "2" && !self.gate.set("1") {
                return;
            }
        }
        state.active_sessions.insert(instance_id);
        state.generation += 1;
    }

    fn start_data_source(&self, _instance_id: DataSourceInstanceId, _config: DataSourceConfig) {}

    fn stop_data_source(&self, instance_id: DataSourceInstanceId) {
        let mut state = self.state.lock().unwrap();
        if !state.active_sessions.remove(&instance_id) {
            return;
        }
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.notify_data_source_stopped(instance_id);
        }
        if !state.active_sessions.is_empty() {
            return;
        }
        // Debounce: only release if no session armed the gate again in
        // the meantime.
        let observed_generation = state.generation;
        drop(state);
        let weak = self.self_weak.lock().unwrap().clone();
        self.task_runner.post_delayed(self.release_delay, move || {
            let Some(producer) = weak.upgrade() else {
                return;
            };
            let state = producer.state.lock().unwrap();
            if state.generation == observed_generation && producer.gate.get() != "2" {
                producer.gate.set("0");
            }
        });
    }

    fn flush(&self, flush_id: FlushRequestId, _instances: Vec<DataSourceInstanceId>) {
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.notify_flush_complete(flush_id);
        }
    }
}

impl Drop for LazyProducer {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        if !state.active_sessions.is_empty() && self.gate.get() != "2" {
            self.gate.set("0");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrotrace_base::ThreadTaskRunner;

    fn producer(delay_ms: u64) -> (Arc<LazyProducer>, Arc<MemoryConfigGate>) {
        let gate = Arc::new(MemoryConfigGate::default());
        let runner = Arc::new(ThreadTaskRunner::new("lazy-test"));
        let producer = LazyProducer::new("android.heapprofd", gate.clone(), runner, Duration::from_millis(delay_ms));
        (producer, gate)
    }

    #[test]
    fn setup_arms_the_gate() {
        let (producer, gate) = producer(10);
        producer.setup_data_source(1, DataSourceConfig::default());
        assert_eq!(gate.get(), "1");
    }

    #[test]
    fn stop_releases_after_the_debounce_delay() {
        let (producer, gate) = producer(20);
        producer.setup_data_source(1, DataSourceConfig::default());
        producer.stop_data_source(1);
        assert_eq!(gate.get(), "1", "not released synchronously");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(gate.get(), "0");
    }

    #[test]
    fn rearming_within_the_delay_cancels_the_release() {
        let (producer, gate) = producer(50);
        producer.setup_data_source(1, DataSourceConfig::default());
        producer.stop_data_source(1);
        // A new session bumps the generation before the delay fires.
        producer.setup_data_source(2, DataSourceConfig::default());
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(gate.get(), "1", "release was debounced away");
    }

    #[test]
    fn pinned_on_gate_is_never_touched() {
        let (producer, gate) = producer(10);
        gate.set("2");
        producer.setup_data_source(1, DataSourceConfig::default());
        assert_eq!(gate.get(), "2");
        producer.stop_data_source(1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.get(), "2");
    }

    #[test]
    fn overlapping_sessions_keep_the_gate_armed() {
        let (producer, gate) = producer(10);
        producer.setup_data_source(1, DataSourceConfig::default());
        producer.setup_data_source(2, DataSourceConfig::default());
        producer.stop_data_source(1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.get(), "1", "second session still active");
        producer.stop_data_source(2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.get(), "0");
    }
}
