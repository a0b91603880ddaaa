//! In-process producer exposing the ftrace engine as the `linux.ftrace`
//! data source.
use std::sync::{Arc, OnceLock};

use ferrotrace_arbiter::{ArbiterConfig, SharedMemoryArbiter};
use ferrotrace_base::TaskRunner;
use ferrotrace_proto::config::DataSourceConfig;
use ferrotrace_service::{
    CpuFlushSource, DataSourceDescriptor, FlushRequestId, Producer, ProducerEndpoint,
    TracingService,
};

use crate::controller::FtraceController;

pub const DATA_SOURCE_NAME: &str = "linux.ftrace";

const SHM_PAGES: u32 = 32;

/// Bridges the service's per-CPU flush accounting onto the controller.
struct ControllerFlushSource {
    controller: FtraceController,
}

impl CpuFlushSource for ControllerFlushSource {
    fn num_cpus(&self) -> usize {
        self.controller.num_cpus()
    }

    fn flush(&self, flush_id: FlushRequestId, on_cpu_ack: Arc<dyn Fn(usize) + Send + Sync>) {
        self.controller.flush(flush_id, on_cpu_ack);
    }

    fn reset_to_run(&self) {
        self.controller.reset_to_run();
    }
}

/// Registers the ftrace data source with a service and translates
/// data-source lifecycle callbacks into controller operations.
pub struct FtraceProducer {
    controller: FtraceController,
    endpoint: OnceLock<Arc<ProducerEndpoint>>,
    arbiter: OnceLock<SharedMemoryArbiter>,
}

impl FtraceProducer {
    pub fn new(controller: FtraceController) -> Arc<Self> {
        Arc::new(Self {
            controller,
            endpoint: OnceLock::new(),
            arbiter: OnceLock::new(),
        })
    }

    /// Connects in process: maps shared memory, builds the arbiter and
    /// registers the data source. Also wires the controller in as the
    /// service's per-CPU flush participant.
    pub fn connect(
        self: &Arc<Self>,
        service: &TracingService,
        producer_task_runner: Arc<dyn TaskRunner>,
    ) {
        let endpoint = service.connect_producer(
            self.clone(),
            "ftrace",
            producer_task_runner.clone(),
            SHM_PAGES,
            ferrotrace_base::PAGE_SIZE,
        );
        let arbiter = SharedMemoryArbiter::new(
            endpoint.shared_memory(),
            endpoint.clone(),
            producer_task_runner,
            ArbiterConfig::default(),
        );
        self.arbiter.set(arbiter).ok();
        endpoint.register_data_source(DataSourceDescriptor {
            name: DATA_SOURCE_NAME.into(),
        });
        self.endpoint.set(endpoint).ok();

        service.set_cpu_flush_source(Arc::new(ControllerFlushSource {
            controller: self.controller.clone(),
        }));
    }

    pub fn controller(&self) -> &FtraceController {
        &self.controller
    }
}

impl Producer for FtraceProducer {
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}
    fn on_tracing_setup(&self) {}

    fn setup_data_source(&self, instance_id: u64, config: DataSourceConfig) {
        let Some(ftrace_config) = &config.ftrace_config else {
            log::warn!("instance {instance_id}: no ftrace config, ignoring");
            return;
        };
        let Some(arbiter) = self.arbiter.get() else {
            return;
        };
        let target = config.target_buffer.unwrap_or(0) as u16;
        let writer = match arbiter.create_trace_writer(target) {
            Ok(writer) => writer,
            Err(e) => {
                log::error!("instance {instance_id}: {e}");
                return;
            }
        };
        if !self.controller.add_data_source(instance_id, ftrace_config, writer) {
            log::error!("instance {instance_id}: ftrace setup failed");
        }
    }

    fn start_data_source(&self, instance_id: u64, _config: DataSourceConfig) {
        if !self.controller.start_data_source(instance_id) {
            log::error!("instance {instance_id}: ftrace start failed");
        }
    }

    fn stop_data_source(&self, instance_id: u64) {
        self.controller.remove_data_source(instance_id);
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.notify_data_source_stopped(instance_id);
        }
    }

    fn flush(&self, flush_id: u64, instances: Vec<u64>) {
        // The per-CPU handshake runs through the CpuFlushSource; the
        // producer-level ack covers the userspace writers.
        self.controller.flush_writers(&instances);
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.notify_flush_complete(flush_id);
        }
    }
}
