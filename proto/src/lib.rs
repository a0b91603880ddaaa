//! Protobuf message types shared by producers, the service and consumers.
//!
//! The messages are maintained by hand in prost's generated style rather
//! than produced by a protoc step at build time.

pub mod config;
pub mod ftrace;
pub mod trace;

pub use config::{BufferConfig, DataSourceConfig, FtraceConfig, TraceConfig};
pub use ftrace::{FtraceEvent, FtraceEventBundle, GenericFtraceEvent};
pub use trace::{Trace, TracePacket};
