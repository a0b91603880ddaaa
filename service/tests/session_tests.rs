//! End-to-end session behavior through real arbiters and writers.
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::time::{Duration, Instant};

use bytes::Bytes;
use prost::Message;

use ferrotrace_arbiter::{ArbiterConfig, SharedMemoryArbiter, TraceWriter};
use ferrotrace_base::{TaskRunner, ThreadTaskRunner};
use ferrotrace_proto::config::{
    BufferConfig, DataSourceConfig, TraceConfig, TraceConfigDataSource, buffer_config,
};
use ferrotrace_proto::trace::{TracePacket, trace_packet::Data};
use ferrotrace_service::{
    Consumer, DataSourceDescriptor, Producer, ProducerEndpoint, SessionState, TracingService,
    TracingServiceConfig,
};

#[derive(Debug)]
enum ProducerEvent {
    Setup(u64, DataSourceConfig),
    Start(u64, DataSourceConfig),
    Stop(u64),
    Flush(u64),
}

struct TestProducer {
    endpoint: OnceLock<Arc<ProducerEndpoint>>,
    events: mpsc::Sender<ProducerEvent>,
    ack_flushes: bool,
    ack_stops: bool,
}

impl TestProducer {
    fn new(
        events: mpsc::Sender<ProducerEvent>,
        ack_flushes: bool,
        ack_stops: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint: OnceLock::new(),
            events,
            ack_flushes,
            ack_stops,
        })
    }
}

impl Producer for TestProducer {
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}
    fn on_tracing_setup(&self) {}

    fn setup_data_source(&self, instance_id: u64, config: DataSourceConfig) {
        let _ = self.events.send(ProducerEvent::Setup(instance_id, config));
    }

    fn start_data_source(&self, instance_id: u64, config: DataSourceConfig) {
        let _ = self.events.send(ProducerEvent::Start(instance_id, config));
    }

    fn stop_data_source(&self, instance_id: u64) {
        if self.ack_stops
            && let Some(endpoint) = self.endpoint.get()
        {
            endpoint.notify_data_source_stopped(instance_id);
        }
        let _ = self.events.send(ProducerEvent::Stop(instance_id));
    }

    fn flush(&self, flush_id: u64, _instances: Vec<u64>) {
        if self.ack_flushes
            && let Some(endpoint) = self.endpoint.get()
        {
            endpoint.notify_flush_complete(flush_id);
        }
        let _ = self.events.send(ProducerEvent::Flush(flush_id));
    }
}

struct TestConsumer {
    batches: Mutex<Vec<(Vec<Bytes>, bool)>>,
    read_done: mpsc::Sender<()>,
    disabled: mpsc::Sender<()>,
}

impl Consumer for TestConsumer {
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}

    fn on_tracing_disabled(&self) {
        let _ = self.disabled.send(());
    }

    fn on_trace_data(&self, packets: Vec<Bytes>, has_more: bool) {
        self.batches.lock().unwrap().push((packets, has_more));
        if !has_more {
            let _ = self.read_done.send(());
        }
    }
}

struct Harness {
    service: TracingService,
    producer: Arc<TestProducer>,
    producer_events: mpsc::Receiver<ProducerEvent>,
    endpoint: Arc<ProducerEndpoint>,
    arbiter: SharedMemoryArbiter,
    consumer: Arc<TestConsumer>,
    consumer_endpoint: Arc<ferrotrace_service::ConsumerEndpoint>,
    read_done: mpsc::Receiver<()>,
    disabled: mpsc::Receiver<()>,
}

fn harness(ack_flushes: bool) -> Harness {
    let service_runner: Arc<dyn TaskRunner> = Arc::new(ThreadTaskRunner::new("svc"));
    let producer_runner: Arc<dyn TaskRunner> = Arc::new(ThreadTaskRunner::new("prod"));
    let service = TracingService::new(service_runner, TracingServiceConfig::default());

    let (events_tx, producer_events) = mpsc::channel();
    let producer = TestProducer::new(events_tx, ack_flushes, true);
    let endpoint = service.connect_producer(
        producer.clone(),
        "test-producer",
        producer_runner.clone(),
        8,
        4096,
    );
    producer.endpoint.set(endpoint.clone()).ok();
    let arbiter = SharedMemoryArbiter::new(
        endpoint.shared_memory(),
        endpoint.clone(),
        producer_runner,
        ArbiterConfig::default(),
    );
    endpoint.register_data_source(DataSourceDescriptor {
        name: "test.data".into(),
    });

    let (read_tx, read_done) = mpsc::channel();
    let (disabled_tx, disabled) = mpsc::channel();
    let consumer = Arc::new(TestConsumer {
        batches: Mutex::new(vec![]),
        read_done: read_tx,
        disabled: disabled_tx,
    });
    let consumer_endpoint = service.connect_consumer(consumer.clone());

    Harness {
        service,
        producer,
        producer_events,
        endpoint,
        arbiter,
        consumer,
        consumer_endpoint,
        read_done,
        disabled,
    }
}

fn config(buffer_size_kb: u32, deferred: bool) -> TraceConfig {
    TraceConfig {
        buffers: vec![BufferConfig {
            size_kb: Some(buffer_size_kb),
            fill_policy: Some(buffer_config::FillPolicy::RingBuffer as i32),
        }],
        data_sources: vec![TraceConfigDataSource {
            config: Some(DataSourceConfig {
                name: Some("test.data".into()),
                target_buffer: Some(0),
                ftrace_config: None,
            }),
            producer_name_filter: vec![],
        }],
        duration_ms: None,
        deferred_start: Some(deferred),
    }
}

fn recv_start(events: &mpsc::Receiver<ProducerEvent>) -> DataSourceConfig {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining).expect("producer event") {
            ProducerEvent::Start(_, config) => return config,
            _ => continue,
        }
    }
}

fn collect_packets(harness: &Harness) -> Vec<TracePacket> {
    harness.consumer_endpoint.read_buffers();
    harness
        .read_done
        .recv_timeout(Duration::from_secs(5))
        .expect("read to complete");
    let batches = harness.consumer.batches.lock().unwrap();
    batches
        .iter()
        .flat_map(|(packets, _)| packets.iter())
        .map(|bytes| TracePacket::decode(bytes.as_ref()).unwrap())
        .collect()
}

fn write_packet(writer: &mut TraceWriter, payload: String) {
    let mut packet = writer.new_trace_packet();
    packet.data = Some(Data::ForTesting(payload));
}

#[test]
fn oversized_packet_arrives_as_exactly_one_packet() {
    let harness = harness(true);
    harness.consumer_endpoint.enable_tracing(config(64, false)).unwrap();
    let ds_config = recv_start(&harness.producer_events);
    let target = ds_config.target_buffer.unwrap() as u16;

    // Larger than any single chunk in the 4 KiB-page region.
    let big = "x".repeat(10_000);
    let mut writer = harness.arbiter.create_trace_writer(target).unwrap();
    write_packet(&mut writer, big.clone());
    writer.flush();

    let packets = collect_packets(&harness);
    assert_eq!(packets.len(), 1, "fragments must stitch into one packet");
    assert_eq!(packets[0], TracePacket::for_testing(big));
    let _ = &harness.producer;
}

#[test]
fn flush_timeout_surfaces_partial_result_and_stat() {
    let harness = harness(false); // producer never acks flushes
    harness.consumer_endpoint.enable_tracing(config(64, false)).unwrap();
    let ds_config = recv_start(&harness.producer_events);
    let target = ds_config.target_buffer.unwrap() as u16;

    let mut writer = harness.arbiter.create_trace_writer(target).unwrap();
    for i in 0..10 {
        write_packet(&mut writer, format!("packet-{i}"));
    }
    writer.flush();

    let (flush_tx, flush_rx) = mpsc::channel();
    let started = Instant::now();
    harness.consumer_endpoint.flush(
        Duration::from_millis(100),
        Box::new(move |ok| flush_tx.send(ok).unwrap()),
    );
    let ok = flush_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!ok, "flush must report the timeout");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(harness.service.stats().flush_timeouts, 1);

    let packets = collect_packets(&harness);
    assert_eq!(packets.len(), 10, "committed data still readable");
}

#[test]
fn producer_disconnect_keeps_session_and_committed_chunks() {
    let harness = harness(true);
    harness.consumer_endpoint.enable_tracing(config(64, false)).unwrap();
    let ds_config = recv_start(&harness.producer_events);
    let target = ds_config.target_buffer.unwrap() as u16;

    let mut writer = harness.arbiter.create_trace_writer(target).unwrap();
    for i in 0..5 {
        write_packet(&mut writer, format!("chunk-{i}"));
        writer.flush(); // one chunk per packet
    }
    drop(writer);
    harness.endpoint.disconnect();

    assert_eq!(
        harness.consumer_endpoint.session_state(),
        Some(SessionState::Active),
        "session survives the crash"
    );
    let packets = collect_packets(&harness);
    assert_eq!(packets.len(), 5);
}

#[test]
fn ring_buffer_overflow_keeps_latest_and_counts_overwrites() {
    let harness = harness(true);
    harness.consumer_endpoint.enable_tracing(config(4, false)).unwrap();
    let ds_config = recv_start(&harness.producer_events);
    let target = ds_config.target_buffer.unwrap() as u16;

    let mut writer = harness.arbiter.create_trace_writer(target).unwrap();
    for i in 0..10 {
        // 1 KiB per chunk: 1018 payload + packet framing + fragment
        // header.
        write_packet(&mut writer, format!("{i}{}", "y".repeat(1015)));
        writer.flush();
    }
    drop(writer);

    let stats = harness.consumer_endpoint.session_buffer_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].overwrite_count, 6);

    let packets = collect_packets(&harness);
    assert_eq!(packets.len(), 4, "latest 4 KiB worth survive");
}

#[test]
fn deferred_start_produces_nothing_until_started() {
    let harness = harness(true);
    harness.consumer_endpoint.enable_tracing(config(64, true)).unwrap();
    assert_eq!(
        harness.consumer_endpoint.session_state(),
        Some(SessionState::Configured)
    );

    // A rogue writer commits before the session started: dropped.
    let setup_config = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match harness.producer_events.recv_timeout(remaining).unwrap() {
                ProducerEvent::Setup(_, config) => break config,
                _ => continue,
            }
        }
    };
    let target = setup_config.target_buffer.unwrap() as u16;
    let mut writer = harness.arbiter.create_trace_writer(target).unwrap();
    write_packet(&mut writer, "too-early".into());
    writer.flush();
    assert!(harness.service.stats().chunks_discarded >= 1);

    harness.consumer_endpoint.start_tracing().unwrap();
    assert_eq!(
        harness.consumer_endpoint.session_state(),
        Some(SessionState::Active)
    );
    recv_start(&harness.producer_events);

    write_packet(&mut writer, "on-time".into());
    writer.flush();
    drop(writer);

    let packets = collect_packets(&harness);
    assert_eq!(packets, vec![TracePacket::for_testing("on-time")]);
}

#[test]
fn disable_tracing_reaches_disabled_after_stop_acks() {
    let harness = harness(true);
    harness.consumer_endpoint.enable_tracing(config(64, false)).unwrap();
    recv_start(&harness.producer_events);

    harness.consumer_endpoint.disable_tracing().unwrap();
    harness
        .disabled
        .recv_timeout(Duration::from_secs(5))
        .expect("on_tracing_disabled");
    assert_eq!(
        harness.consumer_endpoint.session_state(),
        Some(SessionState::Disabled)
    );
}

#[test]
fn duration_expiry_disables_the_session() {
    let harness = harness(true);
    let mut cfg = config(64, false);
    cfg.duration_ms = Some(50);
    harness.consumer_endpoint.enable_tracing(cfg).unwrap();
    recv_start(&harness.producer_events);

    harness
        .disabled
        .recv_timeout(Duration::from_secs(5))
        .expect("duration timer fired");
    assert_eq!(
        harness.consumer_endpoint.session_state(),
        Some(SessionState::Disabled)
    );
}

#[test]
fn chunks_never_leak_across_sessions() {
    let harness = harness(true);
    harness.consumer_endpoint.enable_tracing(config(64, false)).unwrap();
    let ds_config = recv_start(&harness.producer_events);
    let target = ds_config.target_buffer.unwrap() as u16;

    // A second consumer with its own session and buffer.
    let (other_read_tx, other_read_done) = mpsc::channel();
    let (other_disabled_tx, _other_disabled) = mpsc::channel();
    let other_consumer = Arc::new(TestConsumer {
        batches: Mutex::new(vec![]),
        read_done: other_read_tx,
        disabled: other_disabled_tx,
    });
    let other_endpoint = harness.service.connect_consumer(other_consumer.clone());
    other_endpoint.enable_tracing(config(64, false)).unwrap();
    let other_ds_config = recv_start(&harness.producer_events);
    let other_target = other_ds_config.target_buffer.unwrap() as u16;
    assert_ne!(target, other_target);

    let mut writer = harness.arbiter.create_trace_writer(target).unwrap();
    write_packet(&mut writer, "session-one-only".into());
    writer.flush();
    drop(writer);

    let packets = collect_packets(&harness);
    assert_eq!(packets.len(), 1);

    other_endpoint.read_buffers();
    other_read_done.recv_timeout(Duration::from_secs(5)).unwrap();
    let other_batches = other_consumer.batches.lock().unwrap();
    let other_total: usize = other_batches.iter().map(|(p, _)| p.len()).sum();
    assert_eq!(other_total, 0, "the other session must see nothing");
}

#[test]
fn invalid_configs_are_rejected_at_the_boundary() {
    let harness = harness(true);
    let empty = TraceConfig::default();
    assert!(harness.consumer_endpoint.enable_tracing(empty).is_err());

    let mut no_name = config(64, false);
    no_name.data_sources[0].config.as_mut().unwrap().name = None;
    assert!(harness.consumer_endpoint.enable_tracing(no_name).is_err());

    let mut bad_target = config(64, false);
    bad_target.data_sources[0].config.as_mut().unwrap().target_buffer = Some(9);
    assert!(harness.consumer_endpoint.enable_tracing(bad_target).is_err());

    // After rejections, a good config still works.
    assert!(harness.consumer_endpoint.enable_tracing(config(64, false)).is_ok());
}
