//! Per-thread writers that turn packets into chunk fragments.
use std::ops::{Deref, DerefMut};

use prost::Message;

use ferrotrace_abi::packets::{FRAGMENT_HEADER_SIZE, write_fragment};
use ferrotrace_abi::{BufferId, ChunkHandle, ChunkHeader, ChunkId, ChunkToMove, WriterId, chunk_flags};
use ferrotrace_proto::TracePacket;

use crate::shared_memory_arbiter::SharedMemoryArbiter;

struct CurrentChunk {
    handle: ChunkHandle,
    chunk_id: ChunkId,
    offset: usize,
    num_packets: u16,
    first_continues: bool,
}

/// Writes length-delimited packets into chunks of one target buffer.
///
/// Not thread-safe: a writer belongs to one thread. Different writers of
/// the same arbiter may be used concurrently. Packets too large for one
/// chunk are fragmented across consecutive chunk ids with the continuation
/// flags set, and the service stitches them back together.
pub struct TraceWriter {
    arbiter: SharedMemoryArbiter,
    writer_id: WriterId,
    target_buffer: BufferId,
    next_chunk_id: ChunkId,
    cur: Option<CurrentChunk>,
    preferred_page: Option<u32>,
}

impl TraceWriter {
    pub(crate) fn new(
        arbiter: SharedMemoryArbiter,
        writer_id: WriterId,
        target_buffer: BufferId,
    ) -> Self {
        Self {
            arbiter,
            writer_id,
            target_buffer,
            next_chunk_id: 0,
            cur: None,
            preferred_page: None,
        }
    }

    pub fn writer_id(&self) -> WriterId {
        self.writer_id
    }

    pub fn target_buffer(&self) -> BufferId {
        self.target_buffer
    }

    /// Starts a packet. The handle finalizes and writes the packet when
    /// dropped; it must go away before the next packet starts, which the
    /// borrow enforces.
    pub fn new_trace_packet(&mut self) -> PacketHandle<'_> {
        PacketHandle {
            writer: self,
            packet: TracePacket::default(),
        }
    }

    /// Writes one already-encoded packet, fragmenting as needed.
    pub fn write_packet_bytes(&mut self, bytes: &[u8]) {
        let mut remaining = bytes;
        let mut continuing = false;
        loop {
            let Some(cur) = self.ensure_chunk(continuing) else {
                self.arbiter.note_dropped_packet();
                return;
            };
            let payload_len = cur.handle.payload_size();
            // Fragment lengths are u16 on the wire.
            let space = (payload_len - cur.offset - FRAGMENT_HEADER_SIZE).min(u16::MAX as usize);

            if remaining.len() <= space {
                let cur = self.cur.as_mut().unwrap();
                cur.offset = write_fragment(cur.handle.payload_mut(), cur.offset, remaining)
                    .expect("fragment fits by construction");
                cur.num_packets += 1;
                // Close out chunks that cannot take another header.
                if payload_len - cur.offset <= FRAGMENT_HEADER_SIZE {
                    self.close_current_chunk(false);
                }
                return;
            }

            let (now, rest) = remaining.split_at(space);
            let cur = self.cur.as_mut().unwrap();
            cur.offset = write_fragment(cur.handle.payload_mut(), cur.offset, now)
                .expect("fragment fits by construction");
            cur.num_packets += 1;
            self.close_current_chunk(true);
            remaining = rest;
            continuing = true;
        }
    }

    fn ensure_chunk(&mut self, continuing: bool) -> Option<&CurrentChunk> {
        if let Some(cur) = &self.cur {
            // At least one payload byte must fit after the fragment
            // header.
            if cur.handle.payload_size() - cur.offset > FRAGMENT_HEADER_SIZE {
                return self.cur.as_ref();
            }
            self.close_current_chunk(false);
        }
        let handle = self
            .arbiter
            .get_new_chunk(self.target_buffer, self.preferred_page)?;
        self.preferred_page = Some(handle.page());
        let chunk_id = self.next_chunk_id;
        self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
        self.cur = Some(CurrentChunk {
            handle,
            chunk_id,
            offset: 0,
            num_packets: 0,
            first_continues: continuing,
        });
        self.cur.as_ref()
    }

    fn close_current_chunk(&mut self, last_continues: bool) {
        let Some(cur) = self.cur.take() else {
            return;
        };
        let mut flags = 0u8;
        if cur.first_continues {
            flags |= chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREVIOUS;
        }
        if last_continues {
            flags |= chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT;
        }
        let commit = ChunkToMove {
            page: cur.handle.page(),
            chunk: cur.handle.chunk(),
        };
        cur.handle.release_as_complete(ChunkHeader {
            writer_id: self.writer_id,
            chunk_id: cur.chunk_id,
            num_packets: cur.num_packets,
            flags,
        });
        self.arbiter.enqueue_commit(commit);
    }

    /// Commits the partially filled current chunk so everything written so
    /// far becomes visible to the service.
    pub fn flush(&mut self) {
        self.close_current_chunk(false);
        self.arbiter.flush_pending_commits(Box::new(|| {}));
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        self.close_current_chunk(false);
        self.arbiter.flush_pending_commits(Box::new(|| {}));
        self.arbiter.release_writer_id(self.writer_id);
    }
}

/// A packet under construction; encodes and writes itself on drop.
pub struct PacketHandle<'a> {
    writer: &'a mut TraceWriter,
    packet: TracePacket,
}

impl Deref for PacketHandle<'_> {
    type Target = TracePacket;
    fn deref(&self) -> &TracePacket {
        &self.packet
    }
}

impl DerefMut for PacketHandle<'_> {
    fn deref_mut(&mut self) -> &mut TracePacket {
        &mut self.packet
    }
}

impl Drop for PacketHandle<'_> {
    fn drop(&mut self) {
        let bytes = self.packet.encode_to_vec();
        self.writer.write_packet_bytes(&bytes);
    }
}
