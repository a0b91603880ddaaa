//! Trace packet framing.

use crate::ftrace::FtraceEventBundle;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TracePacket {
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: Option<u64>,
    #[prost(oneof = "trace_packet::Data", tags = "1, 2")]
    pub data: Option<trace_packet::Data>,
}

pub mod trace_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "1")]
        FtraceEvents(super::FtraceEventBundle),
        #[prost(string, tag = "2")]
        ForTesting(String),
    }
}

/// Field numbers of [`TracePacket`].
pub mod packet {
    pub const FTRACE_EVENTS: u32 = 1;
    pub const FOR_TESTING: u32 = 2;
    pub const TIMESTAMP: u32 = 3;
}

/// A whole assembled trace, as handed back by blocking consumer reads.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Trace {
    #[prost(message, repeated, tag = "1")]
    pub packet: Vec<TracePacket>,
}

impl TracePacket {
    pub fn for_testing(payload: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            data: Some(trace_packet::Data::ForTesting(payload.into())),
        }
    }

    pub fn ftrace_events(bundle: FtraceEventBundle) -> Self {
        Self {
            timestamp: None,
            data: Some(trace_packet::Data::FtraceEvents(bundle)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn packet_round_trips() {
        let packet = TracePacket::for_testing("payload");
        let back = TracePacket::decode(packet.encode_to_vec().as_slice()).unwrap();
        assert_eq!(packet, back);
    }

    #[test]
    fn trace_concatenation_matches_repeated_field() {
        // A Trace is the concatenation of its length-delimited packets; the
        // service exploits this to stream packets without building a Trace.
        let a = TracePacket::for_testing("a");
        let b = TracePacket::for_testing("b");
        let trace = Trace {
            packet: vec![a.clone(), b.clone()],
        };
        let mut streamed = Vec::new();
        for p in [&a, &b] {
            prost::encoding::encode_key(
                1,
                prost::encoding::WireType::LengthDelimited,
                &mut streamed,
            );
            prost::encoding::encode_varint(p.encoded_len() as u64, &mut streamed);
            p.encode(&mut streamed).unwrap();
        }
        assert_eq!(trace.encode_to_vec(), streamed);
    }
}
