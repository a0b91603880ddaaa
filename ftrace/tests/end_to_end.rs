//! The whole pipeline: a fake tracing root whose per-CPU pipe is a FIFO,
//! the real controller, reader thread, arbiter and service.
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use prost::Message;

use ferrotrace_base::{TaskRunner, ThreadTaskRunner};
use ferrotrace_ftrace::controller::{FtraceController, FtraceControllerConfig};
use ferrotrace_ftrace::producer::{DATA_SOURCE_NAME, FtraceProducer};
use ferrotrace_ftrace::test_utils::PageBuilder;
use ferrotrace_ftrace::tracefs::Tracefs;
use ferrotrace_ftrace::translation_table::TranslationTable;
use ferrotrace_proto::config::{
    BufferConfig, DataSourceConfig, FtraceConfig, TraceConfig, TraceConfigDataSource,
    buffer_config,
};
use ferrotrace_proto::ftrace::ftrace_event;
use ferrotrace_proto::trace::{Trace, trace_packet::Data};
use ferrotrace_service::consumer_session::{ConsumerSessionApi, ConsumerState};
use ferrotrace_service::{TracingService, TracingServiceConfig};

const SCHED_SWITCH_FORMAT: &str = "\
name: sched_switch
ID: 7
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:1;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:int prev_prio;\toffset:28;\tsize:4;\tsigned:1;
\tfield:long prev_state;\toffset:32;\tsize:8;\tsigned:1;
\tfield:char next_comm[16];\toffset:40;\tsize:16;\tsigned:1;
\tfield:pid_t next_pid;\toffset:56;\tsize:4;\tsigned:1;
\tfield:int next_prio;\toffset:60;\tsize:4;\tsigned:1;

print fmt: \"irrelevant\"
";

const HEADER_PAGE: &str = "\
\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;
\tfield: local_t commit;\toffset:8;\tsize:8;\tsigned:1;
\tfield: int overwrite;\toffset:8;\tsize:1;\tsigned:1;
\tfield: char data;\toffset:16;\tsize:4080;\tsigned:1;
";

fn fake_tracing_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("events/sched/sched_switch")).unwrap();
    std::fs::create_dir_all(root.join("per_cpu/cpu0")).unwrap();
    std::fs::write(
        root.join("events/sched/sched_switch/format"),
        SCHED_SWITCH_FORMAT,
    )
    .unwrap();
    std::fs::write(root.join("events/sched/sched_switch/enable"), "0").unwrap();
    std::fs::write(root.join("events/header_page"), HEADER_PAGE).unwrap();
    std::fs::write(root.join("events/enable"), "0").unwrap();
    std::fs::write(root.join("tracing_on"), "0").unwrap();
    std::fs::write(root.join("trace_clock"), "[local] global boot").unwrap();
    std::fs::write(root.join("buffer_size_kb"), "1408").unwrap();
    std::fs::write(root.join("trace"), "").unwrap();

    // The kernel pipe is a FIFO the test feeds by hand.
    let fifo = root.join("per_cpu/cpu0/trace_pipe_raw");
    let mut path_bytes = fifo.as_os_str().as_bytes().to_vec();
    path_bytes.push(0);
    let res = unsafe { libc::mkfifo(path_bytes.as_ptr() as *const libc::c_char, 0o600) };
    assert_eq!(res, 0, "mkfifo failed");
    dir
}

fn sched_switch_record(pid: i32, prev_pid: i32, next_pid: i32) -> Vec<u8> {
    let mut record = vec![0u8; 64];
    record[0..2].copy_from_slice(&7u16.to_le_bytes());
    record[4..8].copy_from_slice(&pid.to_le_bytes());
    record[8..13].copy_from_slice(b"prev\0");
    record[24..28].copy_from_slice(&prev_pid.to_le_bytes());
    record[40..45].copy_from_slice(b"next\0");
    record[56..60].copy_from_slice(&next_pid.to_le_bytes());
    record
}

fn trace_config() -> TraceConfig {
    TraceConfig {
        buffers: vec![BufferConfig {
            size_kb: Some(64),
            fill_policy: Some(buffer_config::FillPolicy::RingBuffer as i32),
        }],
        data_sources: vec![TraceConfigDataSource {
            config: Some(DataSourceConfig {
                name: Some(DATA_SOURCE_NAME.into()),
                target_buffer: Some(0),
                ftrace_config: Some(FtraceConfig {
                    event_names: vec!["sched_switch".into()],
                    buffer_size_kb: None,
                    drain_period_ms: Some(10),
                }),
            }),
            producer_name_filter: vec![],
        }],
        duration_ms: None,
        deferred_start: Some(false),
    }
}

fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
#[serial_test::serial]
fn kernel_pages_come_out_as_trace_packets() {
    let root = fake_tracing_root();

    // Keep a read-write end open so the controller's blocking open and
    // the worker's splice see a live pipe.
    let mut fifo_feeder = OpenOptions::new()
        .read(true)
        .write(true)
        .open(root.path().join("per_cpu/cpu0/trace_pipe_raw"))
        .unwrap();

    let main_runner: Arc<dyn TaskRunner> = Arc::new(ThreadTaskRunner::new("e2e-main"));
    let service = TracingService::new(main_runner.clone(), TracingServiceConfig::default());

    let tracefs = Arc::new(Tracefs::new(root.path()).unwrap());
    let table = TranslationTable::from_tracefs(&tracefs).unwrap();
    let controller = FtraceController::new(
        tracefs.clone(),
        table,
        main_runner.clone(),
        FtraceControllerConfig::default(),
    );
    let producer = FtraceProducer::new(controller.clone());
    producer.connect(&service, main_runner.clone());

    let api = ConsumerSessionApi::new(service.clone());
    let handle = api
        .enable_tracing(&trace_config().encode_to_vec())
        .unwrap();
    assert_eq!(api.poll_state(handle), ConsumerState::Tracing);

    // The engine turns the capture on once the data source starts.
    wait_for(
        || tracefs.is_tracing_enabled(),
        "tracing_on to flip to 1",
    );
    assert_eq!(
        std::fs::read_to_string(root.path().join("events/sched/sched_switch/enable")).unwrap(),
        "1"
    );

    // Feed one synthetic kernel page through the FIFO.
    let mut builder = PageBuilder::new(1000);
    for _ in 0..3 {
        builder.add_data_record(5, &sched_switch_record(42, 100, 200));
    }
    let page = builder.build_padded(4096);
    fifo_feeder.write_all(&page).unwrap();
    fifo_feeder.flush().unwrap();

    // A successful flush guarantees the drained page was parsed and its
    // chunks committed before the ack.
    let (flush_tx, flush_rx) = std::sync::mpsc::channel();
    api.flush(
        handle,
        Duration::from_secs(5),
        Box::new(move |ok| flush_tx.send(ok).unwrap()),
    );
    assert!(
        flush_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        "flush must collect every producer and cpu ack"
    );
    assert!(service.stats().chunks_committed > 0);
    assert_eq!(api.poll_state(handle), ConsumerState::Tracing);

    api.disable_tracing(handle).unwrap();
    let trace_bytes = api.read_trace(handle, Some(Duration::from_secs(10)));
    assert!(!trace_bytes.is_empty(), "trace must be retrievable at end");

    let trace = Trace::decode(trace_bytes.as_slice()).unwrap();
    let mut sched_events = Vec::new();
    for packet in &trace.packet {
        if let Some(Data::FtraceEvents(bundle)) = &packet.data {
            assert_eq!(bundle.cpu, Some(0));
            for event in &bundle.event {
                if let Some(ftrace_event::Event::SchedSwitch(sched)) = &event.event {
                    sched_events.push((
                        event.timestamp.unwrap(),
                        event.pid.unwrap(),
                        sched.prev_pid.unwrap(),
                        sched.next_pid.unwrap(),
                    ));
                }
            }
        }
    }
    assert_eq!(
        sched_events,
        vec![
            (1005, 42, 100, 200),
            (1010, 42, 100, 200),
            (1015, 42, 100, 200),
        ]
    );

    api.destroy(handle);
    wait_for(
        || !tracefs.is_tracing_enabled(),
        "tracing_on to be restored to 0",
    );
}
