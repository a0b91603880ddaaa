//! Stateless decoder for one kernel ring-buffer page.
//!
//! Page layout (see the kernel's `ring_buffer.h` and the
//! `events/header_page` file):
//!
//! ```text
//! u64 timestamp
//! u32 overwrite_and_size   (low 16 bits: length, bits 24..31: overwrite)
//! ...padding up to the commit field width declared by header_page...
//! events: u32 header { type_or_length: 5 bits, time_delta: 27 bits }
//!         payload depending on type_or_length
//! ```
//!
//! Every read is bounds-checked; on any overrun the parser returns the
//! count of bytes successfully consumed and the caller must not retry the
//! page.
use std::collections::BTreeSet;

use crate::proto_writer::MessageWriter;
use crate::translation_table::{Event, EventFilter, Field, FieldKind, TranslationTable};
use ferrotrace_proto::ftrace::{bundle, event as event_proto, generic, generic_ftrace_event};

const TYPE_DATA_TYPE_LEN_MAX: u32 = 28;
const TYPE_PADDING: u32 = 29;
const TYPE_TIME_EXTEND: u32 = 30;
const TYPE_TIME_STAMP: u32 = 31;

/// Entities referenced by the events of one drain; downstream resolvers
/// (process and inode scanners) subscribe to these.
#[derive(Debug, Default)]
pub struct FtraceMetadata {
    pub pids: BTreeSet<i32>,
    pub inodes: BTreeSet<u64>,
    pub devices: BTreeSet<u64>,
    pub overwrite_count: u32,
}

impl FtraceMetadata {
    pub fn clear(&mut self) {
        self.pids.clear();
        self.inodes.clear();
        self.devices.clear();
        self.overwrite_count = 0;
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.data.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn skip(&mut self, n: usize, limit: usize) -> Option<()> {
        let next = self.pos.checked_add(n)?;
        (next <= limit).then(|| self.pos = next)
    }
}

/// Decodes one page into `bundle`, appending one `FtraceEvent` message per
/// enabled data record. Returns the number of bytes consumed.
pub fn parse_page(
    page: &[u8],
    filter: &EventFilter,
    table: &TranslationTable,
    bundle_out: &mut MessageWriter,
    metadata: &mut FtraceMetadata,
) -> usize {
    let mut cur = Cursor { data: page, pos: 0 };

    let Some(mut timestamp) = cur.read_u64() else {
        return 0;
    };
    let Some(overwrite_and_size) = cur.read_u32() else {
        return 0;
    };
    let size = (overwrite_and_size & 0xffff) as usize;
    metadata.overwrite_count = (overwrite_and_size >> 24) & 0xff;

    // The commit field is wider than the 32 bits we just read on 64-bit
    // kernels; skip the rest of it.
    let size_len = table.page_header_size_len() as usize;
    if size_len < 4 || cur.skip(size_len - 4, page.len()).is_none() {
        return 0;
    }

    let end = cur.pos + size;
    if end > page.len() {
        return 0;
    }

    while cur.pos < end {
        let record_start = cur.pos;
        let Some(header) = cur.read_u32() else {
            return record_start;
        };
        let type_or_length = header & 0x1f;
        let time_delta = header >> 5;
        timestamp += u64::from(time_delta);

        match type_or_length {
            TYPE_PADDING => {
                if time_delta == 0 {
                    // Empty padding event: nothing sane can follow.
                    return record_start;
                }
                let Some(length) = cur.read_u32() else {
                    return record_start;
                };
                if cur.skip(length as usize, end).is_none() {
                    return record_start;
                }
            }
            TYPE_TIME_EXTEND => {
                let Some(ext) = cur.read_u32() else {
                    return record_start;
                };
                timestamp += u64::from(ext) << 27;
            }
            TYPE_TIME_STAMP => {
                let (Some(tv_nsec), Some(tv_sec)) = (cur.read_u64(), cur.read_u64()) else {
                    return record_start;
                };
                timestamp = tv_sec * 1_000_000_000 + tv_nsec;
            }
            _ => {
                debug_assert!(type_or_length <= TYPE_DATA_TYPE_LEN_MAX);
                let event_size = if type_or_length == 0 {
                    // Extended record: u32 length including itself.
                    let Some(declared) = cur.read_u32() else {
                        return record_start;
                    };
                    if declared < 4 {
                        return record_start;
                    }
                    (declared - 4) as usize
                } else {
                    4 * type_or_length as usize
                };

                let start = cur.pos;
                let Some(next) = start.checked_add(event_size).filter(|n| *n <= end) else {
                    return record_start;
                };
                let record = &page[start..next];
                if record.len() < 2 {
                    return record_start;
                }
                let event_id = u16::from_le_bytes([record[0], record[1]]);
                if filter.is_enabled(event_id)
                    && let Some(event) = table.event_by_id(event_id)
                    && !parse_event(event, record, table, timestamp, bundle_out, metadata)
                {
                    return record_start;
                }
                cur.pos = next;
            }
        }
    }
    cur.pos
}

/// `record` spans exactly one event, common fields included.
fn parse_event(
    event: &Event,
    record: &[u8],
    table: &TranslationTable,
    timestamp: u64,
    bundle_out: &mut MessageWriter,
    metadata: &mut FtraceMetadata,
) -> bool {
    if (event.size as usize) > record.len() {
        return false;
    }

    let mut evt = MessageWriter::new();
    evt.append_varint(event_proto::TIMESTAMP, timestamp);

    let mut ok = true;
    for field in table.common_fields() {
        ok &= parse_field(field, record, &mut evt, metadata);
    }

    let mut nested = MessageWriter::new();
    if event.proto_field_id == event_proto::GENERIC {
        nested.append_string(generic::EVENT_NAME, &event.name);
        for field in &event.fields {
            let mut generic_field = MessageWriter::new();
            generic_field.append_string(generic_ftrace_event::NAME, &field.ftrace_name);
            ok &= parse_generic_field(field, record, &mut generic_field, metadata);
            nested.append_message(generic::FIELD, &generic_field);
        }
    } else {
        for field in &event.fields {
            ok &= parse_field(field, record, &mut nested, metadata);
        }
    }

    evt.append_message(event.proto_field_id, &nested);
    bundle_out.append_message(bundle::EVENT, &evt);
    ok
}

fn read_unsigned(record: &[u8], offset: usize, size: usize) -> Option<u64> {
    let bytes = record.get(offset..offset + size)?;
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(bytes);
    Some(u64::from_le_bytes(buf))
}

fn read_signed(record: &[u8], offset: usize, size: usize) -> Option<i64> {
    let raw = read_unsigned(record, offset, size)?;
    let shift = 64 - 8 * size as u32;
    Some(((raw << shift) as i64) >> shift)
}

/// NUL-terminated string within `record[begin..limit]`. Fails if the
/// terminator is missing, which on fixed-size kernel buffers means the
/// record is corrupt.
fn read_c_string(record: &[u8], begin: usize, limit: usize) -> Option<&[u8]> {
    let window = record.get(begin..limit)?;
    let nul = window.iter().position(|b| *b == 0)?;
    Some(&window[..nul])
}

enum FieldValue<'a> {
    Unsigned(u64),
    Signed(i64),
    Str(&'a [u8]),
    /// Kernel pointer strings are unresolvable from user space.
    Nothing,
}

fn read_field_value<'a>(
    field: &Field,
    record: &'a [u8],
    metadata: &mut FtraceMetadata,
) -> Option<FieldValue<'a>> {
    let offset = field.offset as usize;
    let size = field.size as usize;
    let value = match field.kind {
        FieldKind::U8 | FieldKind::U16 | FieldKind::U32 | FieldKind::U64 => {
            FieldValue::Unsigned(read_unsigned(record, offset, size)?)
        }
        FieldKind::I8 | FieldKind::I16 | FieldKind::I32 | FieldKind::I64 => {
            FieldValue::Signed(read_signed(record, offset, size)?)
        }
        FieldKind::Bool => FieldValue::Unsigned(u64::from(read_unsigned(record, offset, 1)? != 0)),
        FieldKind::FixedCString => FieldValue::Str(read_c_string(record, offset, offset + size)?),
        FieldKind::CString => FieldValue::Str(read_c_string(record, offset, record.len())?),
        FieldKind::StringPtr => FieldValue::Nothing,
        FieldKind::DataLoc => {
            let data = read_unsigned(record, offset, 4)? as u32;
            let string_offset = (data & 0xffff) as usize;
            let string_len = (data >> 16) as usize;
            if string_offset == 0 || string_offset + string_len > record.len() {
                return None;
            }
            FieldValue::Str(read_c_string(record, string_offset, string_offset + string_len)?)
        }
        FieldKind::Pid | FieldKind::CommonPid => {
            let pid = read_signed(record, offset, 4)? as i32;
            metadata.pids.insert(pid);
            FieldValue::Signed(i64::from(pid))
        }
        FieldKind::Inode32 => {
            let ino = read_unsigned(record, offset, 4)?;
            metadata.inodes.insert(ino);
            FieldValue::Unsigned(ino)
        }
        FieldKind::Inode64 => {
            let ino = read_unsigned(record, offset, 8)?;
            metadata.inodes.insert(ino);
            FieldValue::Unsigned(ino)
        }
        FieldKind::DevId32 => {
            let dev = read_unsigned(record, offset, 4)?;
            metadata.devices.insert(dev);
            FieldValue::Unsigned(dev)
        }
        FieldKind::DevId64 => {
            let dev = read_unsigned(record, offset, 8)?;
            metadata.devices.insert(dev);
            FieldValue::Unsigned(dev)
        }
    };
    Some(value)
}

fn parse_field(
    field: &Field,
    record: &[u8],
    msg: &mut MessageWriter,
    metadata: &mut FtraceMetadata,
) -> bool {
    match read_field_value(field, record, metadata) {
        Some(FieldValue::Unsigned(v)) => msg.append_varint(field.proto_field_id, v),
        Some(FieldValue::Signed(v)) => msg.append_signed(field.proto_field_id, v),
        Some(FieldValue::Str(bytes)) => {
            msg.append_string(field.proto_field_id, &String::from_utf8_lossy(bytes));
        }
        Some(FieldValue::Nothing) => {}
        None => return false,
    }
    true
}

fn parse_generic_field(
    field: &Field,
    record: &[u8],
    msg: &mut MessageWriter,
    metadata: &mut FtraceMetadata,
) -> bool {
    match read_field_value(field, record, metadata) {
        Some(FieldValue::Unsigned(v)) => msg.append_varint(generic_ftrace_event::UINT_VALUE, v),
        Some(FieldValue::Signed(v)) => msg.append_signed(generic_ftrace_event::INT_VALUE, v),
        Some(FieldValue::Str(bytes)) => msg.append_string(
            generic_ftrace_event::STR_VALUE,
            &String::from_utf8_lossy(bytes),
        ),
        Some(FieldValue::Nothing) => {}
        None => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::PageBuilder;
    use crate::translation_table::test_support::small_sched_switch;
    use ferrotrace_proto::ftrace::{FtraceEventBundle, ftrace_event};
    use prost::Message;

    fn table() -> TranslationTable {
        TranslationTable::build(vec![("sched".into(), small_sched_switch())], 8).unwrap()
    }

    fn sched_record(pid: i32, prev: i32, next: i32) -> Vec<u8> {
        let mut record = vec![0u8; 16];
        record[0..2].copy_from_slice(&7u16.to_le_bytes());
        record[4..8].copy_from_slice(&pid.to_le_bytes());
        record[8..12].copy_from_slice(&prev.to_le_bytes());
        record[12..16].copy_from_slice(&next.to_le_bytes());
        record
    }

    fn decode(bundle_writer: MessageWriter) -> FtraceEventBundle {
        FtraceEventBundle::decode(bundle_writer.as_bytes()).unwrap()
    }

    #[test]
    fn parses_three_records_with_time_deltas() {
        let table = table();
        let filter = EventFilter::new(&table, ["sched_switch"]);
        let mut builder = PageBuilder::new(1000);
        for _ in 0..3 {
            builder.add_data_record(5, &sched_record(42, 100, 200));
        }
        let page = builder.build();

        let mut bundle = MessageWriter::new();
        let mut metadata = FtraceMetadata::default();
        let consumed = parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
        assert_eq!(consumed, 16 + 3 * 20);

        let decoded = decode(bundle);
        assert_eq!(decoded.event.len(), 3);
        let times: Vec<u64> = decoded.event.iter().map(|e| e.timestamp.unwrap()).collect();
        assert_eq!(times, vec![1005, 1010, 1015]);
        for event in &decoded.event {
            assert_eq!(event.pid, Some(42));
            let Some(ftrace_event::Event::SchedSwitch(s)) = &event.event else {
                panic!("expected sched_switch");
            };
            assert_eq!(s.prev_pid, Some(100));
            assert_eq!(s.next_pid, Some(200));
        }
        assert!(metadata.pids.contains(&42));
        assert!(metadata.pids.contains(&100));
    }

    #[test]
    fn filtered_events_are_skipped() {
        let table = table();
        let filter = EventFilter::new(&table, std::iter::empty::<&str>());
        let mut builder = PageBuilder::new(0);
        builder.add_data_record(1, &sched_record(1, 2, 3));
        let page = builder.build();

        let mut bundle = MessageWriter::new();
        let mut metadata = FtraceMetadata::default();
        let consumed = parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
        assert!(consumed > 0);
        assert!(bundle.is_empty());
    }

    #[test]
    fn time_extend_shifts_the_clock() {
        let table = table();
        let filter = EventFilter::new(&table, ["sched_switch"]);
        let mut builder = PageBuilder::new(0);
        builder.add_time_extend(3, 2); // timestamp += 3 + (2 << 27)
        builder.add_data_record(1, &sched_record(1, 2, 3));
        let page = builder.build();

        let mut bundle = MessageWriter::new();
        let mut metadata = FtraceMetadata::default();
        parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
        let decoded = decode(bundle);
        assert_eq!(decoded.event[0].timestamp, Some(3 + (2u64 << 27) + 1));
    }

    #[test]
    fn padding_is_skipped_and_empty_padding_truncates() {
        let table = table();
        let filter = EventFilter::new(&table, ["sched_switch"]);

        let mut builder = PageBuilder::new(0);
        builder.add_padding(7, 12);
        builder.add_data_record(1, &sched_record(1, 2, 3));
        let page = builder.build();
        let mut bundle = MessageWriter::new();
        let mut metadata = FtraceMetadata::default();
        parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
        assert_eq!(decode(bundle).event.len(), 1);

        // time_delta == 0 padding ends the page.
        let mut builder = PageBuilder::new(0);
        builder.add_empty_padding();
        builder.add_data_record(1, &sched_record(1, 2, 3));
        let page = builder.build();
        let mut bundle = MessageWriter::new();
        let consumed = parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
        assert_eq!(consumed, 16);
        assert!(bundle.is_empty());
    }

    #[test]
    fn truncated_record_returns_consumed_bytes() {
        let table = table();
        let filter = EventFilter::new(&table, ["sched_switch"]);
        let mut builder = PageBuilder::new(0);
        builder.add_data_record(1, &sched_record(9, 8, 7));
        let mut page = builder.build();
        // Lie: stretch the declared page size past a half record.
        let good_size = u16::from_le_bytes([page[8], page[9]]);
        page[8..10].copy_from_slice(&(good_size + 8).to_le_bytes());
        page.extend_from_slice(&u32::to_le_bytes(3 << 0)); // header claiming 12 bytes
        page.extend_from_slice(&[0u8; 4]); // but only 4 present

        let mut bundle = MessageWriter::new();
        let mut metadata = FtraceMetadata::default();
        let consumed = parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
        assert_eq!(consumed, 16 + 20);
        assert_eq!(decode(bundle).event.len(), 1);
    }

    #[test]
    fn parsing_is_idempotent() {
        let table = table();
        let filter = EventFilter::new(&table, ["sched_switch"]);
        let mut builder = PageBuilder::new(77);
        builder.add_data_record(1, &sched_record(5, 6, 8));
        builder.add_time_extend(1, 1);
        builder.add_data_record(2, &sched_record(5, 6, 8));
        let page = builder.build();

        let mut first = MessageWriter::new();
        let mut second = MessageWriter::new();
        let mut metadata = FtraceMetadata::default();
        let n1 = parse_page(&page, &filter, &table, &mut first, &mut metadata);
        metadata.clear();
        let n2 = parse_page(&page, &filter, &table, &mut second, &mut metadata);
        assert_eq!(n1, n2);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn overwrite_count_lands_in_metadata() {
        let table = table();
        let filter = EventFilter::new(&table, std::iter::empty::<&str>());
        let builder = PageBuilder::new(0).with_overwrite(6);
        let page = builder.build();
        let mut bundle = MessageWriter::new();
        let mut metadata = FtraceMetadata::default();
        parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
        assert_eq!(metadata.overwrite_count, 6);
    }
}
