//! Trace session configuration messages.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceConfig {
    #[prost(message, repeated, tag = "1")]
    pub buffers: Vec<BufferConfig>,
    #[prost(message, repeated, tag = "2")]
    pub data_sources: Vec<TraceConfigDataSource>,
    #[prost(uint32, optional, tag = "3")]
    pub duration_ms: Option<u32>,
    /// Allocate buffers and set up data sources, but wait for an explicit
    /// start before capturing.
    #[prost(bool, optional, tag = "4")]
    pub deferred_start: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BufferConfig {
    #[prost(uint32, optional, tag = "1")]
    pub size_kb: Option<u32>,
    #[prost(enumeration = "buffer_config::FillPolicy", optional, tag = "2")]
    pub fill_policy: Option<i32>,
}

pub mod buffer_config {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum FillPolicy {
        Unspecified = 0,
        RingBuffer = 1,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceConfigDataSource {
    #[prost(message, optional, tag = "1")]
    pub config: Option<DataSourceConfig>,
    /// When non-empty, only producers whose name is listed here are matched.
    #[prost(string, repeated, tag = "2")]
    pub producer_name_filter: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataSourceConfig {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    /// Index into `TraceConfig.buffers` of the session that instantiates
    /// this source; rewritten to a service BufferID before reaching the
    /// producer.
    #[prost(uint32, optional, tag = "2")]
    pub target_buffer: Option<u32>,
    #[prost(message, optional, tag = "100")]
    pub ftrace_config: Option<FtraceConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FtraceConfig {
    #[prost(string, repeated, tag = "1")]
    pub event_names: Vec<String>,
    #[prost(uint32, optional, tag = "2")]
    pub buffer_size_kb: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub drain_period_ms: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn sample_config() -> TraceConfig {
        TraceConfig {
            buffers: vec![BufferConfig {
                size_kb: Some(64),
                fill_policy: Some(buffer_config::FillPolicy::RingBuffer as i32),
            }],
            data_sources: vec![TraceConfigDataSource {
                config: Some(DataSourceConfig {
                    name: Some("linux.ftrace".into()),
                    target_buffer: Some(0),
                    ftrace_config: Some(FtraceConfig {
                        event_names: vec!["sched_switch".into(), "sched_wakeup".into()],
                        buffer_size_kb: Some(512),
                        drain_period_ms: Some(100),
                    }),
                }),
                producer_name_filter: vec!["probes".into()],
            }],
            duration_ms: Some(10_000),
            deferred_start: Some(true),
        }
    }

    #[test]
    fn config_round_trips() {
        let cfg = sample_config();
        let bytes = cfg.encode_to_vec();
        let back = TraceConfig::decode(bytes.as_slice()).unwrap();
        assert_eq!(cfg, back);
        assert_eq!(bytes, back.encode_to_vec());
    }

    #[test]
    fn absent_fields_have_defaults() {
        let cfg = TraceConfig::default();
        assert!(!cfg.deferred_start());
        assert_eq!(cfg.duration_ms(), 0);
    }
}
