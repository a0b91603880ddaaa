//! Capability traits at the producer/consumer boundary.
//!
//! The service consumes `Producer` and `Consumer` as abstract interfaces
//! and never learns their concrete types. Callbacks into producer code are
//! posted on that producer's task runner; consumer callbacks on the
//! service's.
use std::sync::Arc;

use bytes::Bytes;

use crate::{DataSourceInstanceId, FlushRequestId};
use ferrotrace_proto::config::DataSourceConfig;

/// What a producer tells the service about one of its data sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceDescriptor {
    pub name: String,
}

/// Client-implemented producer callbacks (service → producer).
pub trait Producer: Send + Sync {
    fn on_connect(&self);
    fn on_disconnect(&self);
    /// Shared memory is mapped and the arbiter can be created.
    fn on_tracing_setup(&self);
    fn setup_data_source(&self, instance_id: DataSourceInstanceId, config: DataSourceConfig);
    fn start_data_source(&self, instance_id: DataSourceInstanceId, config: DataSourceConfig);
    fn stop_data_source(&self, instance_id: DataSourceInstanceId);
    fn flush(&self, flush_id: FlushRequestId, instances: Vec<DataSourceInstanceId>);
}

/// Client-implemented consumer callbacks (service → consumer).
pub trait Consumer: Send + Sync {
    fn on_connect(&self);
    fn on_disconnect(&self);
    fn on_tracing_disabled(&self);
    /// One slice of `ReadBuffers` output: encoded `TracePacket`s.
    fn on_trace_data(&self, packets: Vec<Bytes>, has_more: bool);
}

/// In-process bridge to the ftrace controller's per-CPU flush machinery.
///
/// A session flush waits for `num_cpus` acks from here on top of the
/// producer acks; on timeout the service asks the source to put its
/// readers back into the run state.
pub trait CpuFlushSource: Send + Sync {
    fn num_cpus(&self) -> usize;
    fn flush(&self, flush_id: FlushRequestId, on_cpu_ack: Arc<dyn Fn(usize) + Send + Sync>);
    fn reset_to_run(&self);
}

pub use crate::service::{ConsumerEndpoint, ProducerEndpoint};
