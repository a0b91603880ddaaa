//! Linux kernel ftrace ingestion: per-CPU readers pull ring-buffer pages
//! off `trace_pipe_raw` pipes, the page parser decodes them against a
//! translation table compiled from the kernel's `format` files, and the
//! controller re-emits the events as protobuf packets through a producer's
//! trace writers.

// crate-specific lint exceptions:
#![allow(unsafe_code, clippy::missing_errors_doc)]

pub mod config_muxer;
pub mod controller;
pub mod cpu_reader;
pub mod cpu_stats;
pub mod data_source;
pub mod format;
pub mod page_parser;
pub mod page_pool;
pub mod producer;
pub mod proto_writer;
pub mod test_utils;
pub mod thread_sync;
pub mod tracefs;
pub mod translation_table;

pub use config_muxer::{FtraceConfigId, FtraceConfigMuxer};
pub use controller::{FtraceController, FtraceControllerConfig};
pub use cpu_stats::{CpuStats, FtraceStats};
pub use data_source::FtraceDataSource;
pub use page_parser::{FtraceMetadata, parse_page};
pub use producer::FtraceProducer;
pub use tracefs::Tracefs;
pub use translation_table::{Event, EventFilter, Field, FieldKind, TranslationTable};
