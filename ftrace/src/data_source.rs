//! One ftrace data-source instance: its event filter, trace writer and
//! per-drain metadata.
use std::sync::{Arc, Mutex};

use ferrotrace_arbiter::TraceWriter;
use ferrotrace_proto::ftrace::bundle;
use ferrotrace_proto::trace::packet;

use crate::config_muxer::FtraceConfigId;
use crate::page_parser::{FtraceMetadata, parse_page};
use crate::proto_writer::MessageWriter;
use crate::translation_table::{EventFilter, TranslationTable};

pub struct FtraceDataSource {
    instance_id: u64,
    config_id: FtraceConfigId,
    table: Arc<TranslationTable>,
    filter: EventFilter,
    writer: Mutex<TraceWriter>,
    metadata: Mutex<FtraceMetadata>,
}

impl FtraceDataSource {
    pub fn new(
        instance_id: u64,
        config_id: FtraceConfigId,
        table: Arc<TranslationTable>,
        filter: EventFilter,
        writer: TraceWriter,
    ) -> Self {
        Self {
            instance_id,
            config_id,
            table,
            filter,
            writer: Mutex::new(writer),
            metadata: Mutex::new(FtraceMetadata::default()),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn config_id(&self) -> FtraceConfigId {
        self.config_id
    }

    /// Parses one raw page and emits it as a trace packet carrying an
    /// event bundle for `cpu`.
    pub fn write_page(&self, cpu: usize, page: &[u8]) {
        let mut metadata = self.metadata.lock().unwrap();
        let mut bundle_msg = MessageWriter::new();
        bundle_msg.append_varint(bundle::CPU, cpu as u64);
        let consumed = parse_page(page, &self.filter, &self.table, &mut bundle_msg, &mut metadata);
        if consumed == 0 {
            log::debug!("cpu{cpu}: page with unparsable header, skipped");
            return;
        }
        bundle_msg.append_varint(bundle::OVERWRITE_COUNT, u64::from(metadata.overwrite_count));

        let mut packet_msg = MessageWriter::new();
        packet_msg.append_message(packet::FTRACE_EVENTS, &bundle_msg);
        self.writer.lock().unwrap().write_packet_bytes(packet_msg.as_bytes());
    }

    /// Commits everything written so far.
    pub fn flush_writer(&self) {
        self.writer.lock().unwrap().flush();
    }

    /// Entities referenced since the last drain; clears the set.
    pub fn take_metadata(&self) -> FtraceMetadata {
        std::mem::take(&mut *self.metadata.lock().unwrap())
    }
}
