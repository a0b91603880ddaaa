//! Umbrella crate re-exporting the ferrotrace workspace.
//!
//! ferrotrace is a system-wide tracing core: many in-process producers
//! emit protobuf trace packets through a lock-free shared-memory
//! transport, a service routes committed chunks into per-session ring
//! buffers and streams assembled packets to consumers, and an ftrace
//! engine ingests Linux kernel ring-buffer pages through per-CPU reader
//! threads.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ferrotrace::base::{TaskRunner, ThreadTaskRunner};
//! use ferrotrace::service::{TracingService, TracingServiceConfig};
//!
//! let runner: Arc<dyn TaskRunner> = Arc::new(ThreadTaskRunner::new("main"));
//! let service = TracingService::new(runner, TracingServiceConfig::default());
//! ```

pub use ferrotrace_abi as abi;
pub use ferrotrace_arbiter as arbiter;
pub use ferrotrace_base as base;
pub use ferrotrace_ftrace as ftrace;
pub use ferrotrace_proto as proto;
pub use ferrotrace_service as service;

pub mod prelude {
    pub use ferrotrace_arbiter::{SharedMemoryArbiter, StartupTraceWriterRegistry, TraceWriter};
    pub use ferrotrace_base::{TaskRunner, TaskRunnerExt, ThreadTaskRunner};
    pub use ferrotrace_ftrace::{FtraceController, FtraceProducer, Tracefs};
    pub use ferrotrace_proto::{TraceConfig, TracePacket};
    pub use ferrotrace_service::{
        Consumer, ConsumerEndpoint, Producer, ProducerEndpoint, TracingService,
        TracingServiceConfig,
    };
}
