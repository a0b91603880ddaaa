//! The tracing service: registers producers, instantiates data sources,
//! owns per-session logical buffers, routes committed chunks into them,
//! stitches packets and streams them to consumers.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

pub mod consumer_session;
pub mod endpoints;
pub mod errors;
pub mod lazy_producer;
pub mod service;
pub mod stats;
pub mod stitcher;
pub mod trace_buffer;

pub use consumer_session::{ConsumerSessionApi, ConsumerState};
pub use endpoints::{
    Consumer, ConsumerEndpoint, CpuFlushSource, DataSourceDescriptor, Producer, ProducerEndpoint,
};
pub use errors::{Error, Result};
pub use lazy_producer::{ConfigGate, EnvConfigGate, LazyProducer, MemoryConfigGate};
pub use service::{SessionState, TracingService, TracingServiceConfig};
pub use stats::{BufferStats, ServiceStats};

/// Service-wide identifiers, all dense and monotonically assigned.
pub type ProducerId = u64;
pub type ConsumerId = u64;
pub type DataSourceId = u64;
pub type DataSourceInstanceId = u64;
pub type TracingSessionId = u64;
pub type FlushRequestId = u64;
