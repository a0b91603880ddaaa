//! Schema-less protobuf writing, targeted by field number.
//!
//! The page parser is table-driven: the translation table names the proto
//! field each kernel field lands in, so events are serialized directly
//! rather than through typed message structs. The encoding primitives are
//! prost's, which keeps the output bit-identical to what the typed
//! messages in `ferrotrace-proto` decode.
use prost::encoding::{WireType, encode_key, encode_varint};

#[derive(Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn take(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn append_varint(&mut self, field: u32, value: u64) {
        encode_key(field, WireType::Varint, &mut self.buf);
        encode_varint(value, &mut self.buf);
    }

    /// Signed ints go out as the two's-complement 64-bit varint, matching
    /// protobuf `int32`/`int64` (not zigzag `sint*`).
    pub fn append_signed(&mut self, field: u32, value: i64) {
        self.append_varint(field, value as u64);
    }

    pub fn append_bytes(&mut self, field: u32, bytes: &[u8]) {
        encode_key(field, WireType::LengthDelimited, &mut self.buf);
        encode_varint(bytes.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(bytes);
    }

    pub fn append_string(&mut self, field: u32, s: &str) {
        self.append_bytes(field, s.as_bytes());
    }

    pub fn append_message(&mut self, field: u32, nested: &MessageWriter) {
        self.append_bytes(field, &nested.buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrotrace_proto::ftrace::{FtraceEvent, ftrace_event};
    use prost::Message;

    #[test]
    fn field_targeted_output_decodes_as_typed_message() {
        use ferrotrace_proto::ftrace::event;

        let mut sched = MessageWriter::new();
        sched.append_signed(2, 100); // prev_pid
        sched.append_signed(6, 200); // next_pid

        let mut evt = MessageWriter::new();
        evt.append_varint(event::TIMESTAMP, 1005);
        evt.append_signed(event::PID, 42);
        evt.append_message(event::SCHED_SWITCH, &sched);

        let decoded = FtraceEvent::decode(evt.as_bytes()).unwrap();
        assert_eq!(decoded.timestamp, Some(1005));
        assert_eq!(decoded.pid, Some(42));
        let Some(ftrace_event::Event::SchedSwitch(s)) = decoded.event else {
            panic!("expected sched_switch");
        };
        assert_eq!(s.prev_pid, Some(100));
        assert_eq!(s.next_pid, Some(200));
    }

    #[test]
    fn negative_ints_use_twos_complement_varints() {
        let mut evt = MessageWriter::new();
        evt.append_varint(1, 5);
        evt.append_signed(2, -1);
        let decoded = FtraceEvent::decode(evt.as_bytes()).unwrap();
        assert_eq!(decoded.pid, Some(-1));
    }
}
