//! Producer-side machinery over the shared-memory ABI: the arbiter vends
//! trace writers pinned to a target buffer, allocates chunks for them,
//! batches commit notifications to the service, and supports writers
//! created before any tracing session exists.

pub mod errors;
pub mod shared_memory_arbiter;
pub mod startup_registry;
pub mod startup_trace_writer;
pub mod trace_writer;

pub use errors::{Error, Result};
pub use shared_memory_arbiter::{ArbiterConfig, CommitSink, SharedMemoryArbiter};
pub use startup_registry::StartupTraceWriterRegistry;
pub use startup_trace_writer::StartupTraceWriter;
pub use trace_writer::{PacketHandle, TraceWriter};
