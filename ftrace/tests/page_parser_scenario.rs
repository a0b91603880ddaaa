//! Deterministic single-CPU ingestion against a hand-built translation
//! table.
use ferrotrace_ftrace::format::{FormatEvent, FormatField};
use ferrotrace_ftrace::page_parser::{FtraceMetadata, parse_page};
use ferrotrace_ftrace::proto_writer::MessageWriter;
use ferrotrace_ftrace::test_utils::PageBuilder;
use ferrotrace_ftrace::translation_table::{EventFilter, TranslationTable};
use ferrotrace_proto::ftrace::{FtraceEventBundle, ftrace_event};
use prost::Message;

fn sched_switch_pid_pair() -> FormatEvent {
    FormatEvent {
        name: "sched_switch".into(),
        id: 7,
        common_fields: vec![FormatField {
            type_and_name: "unsigned short common_type".into(),
            name: "common_type".into(),
            offset: 0,
            size: 2,
            is_signed: false,
        }],
        fields: vec![
            FormatField {
                type_and_name: "pid_t prev_pid".into(),
                name: "prev_pid".into(),
                offset: 4,
                size: 4,
                is_signed: true,
            },
            FormatField {
                type_and_name: "pid_t next_pid".into(),
                name: "next_pid".into(),
                offset: 8,
                size: 4,
                is_signed: true,
            },
        ],
    }
}

#[test]
fn three_records_parse_to_three_timestamped_events() {
    let table =
        TranslationTable::build(vec![("sched".into(), sched_switch_pid_pair())], 8).unwrap();
    let filter = EventFilter::new(&table, ["sched_switch"]);

    // Twelve-byte records: event id, padding, prev_pid=100, next_pid=200.
    let mut record = [0u8; 12];
    record[0..2].copy_from_slice(&7u16.to_le_bytes());
    record[4..8].copy_from_slice(&100i32.to_le_bytes());
    record[8..12].copy_from_slice(&200i32.to_le_bytes());

    let mut builder = PageBuilder::new(1000);
    for _ in 0..3 {
        builder.add_data_record(5, &record);
    }
    let page = builder.build();

    let mut bundle = MessageWriter::new();
    let mut metadata = FtraceMetadata::default();
    let consumed = parse_page(&page, &filter, &table, &mut bundle, &mut metadata);
    assert_eq!(consumed, page.len());

    let decoded = FtraceEventBundle::decode(bundle.as_bytes()).unwrap();
    assert_eq!(decoded.event.len(), 3);
    let timestamps: Vec<u64> = decoded.event.iter().map(|e| e.timestamp.unwrap()).collect();
    assert_eq!(timestamps, vec![1005, 1010, 1015]);
    for event in &decoded.event {
        let Some(ftrace_event::Event::SchedSwitch(sched)) = &event.event else {
            panic!("expected sched_switch payload");
        };
        assert_eq!(sched.prev_pid, Some(100));
        assert_eq!(sched.next_pid, Some(200));
    }
    assert!(metadata.pids.contains(&100) && metadata.pids.contains(&200));
}
