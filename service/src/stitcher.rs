//! Reassembly of packets from chunk fragments, per (producer, writer).
//!
//! Within one writer, chunk ids are strictly increasing modulo the 16-bit
//! wrap. Out-of-order arrivals are parked in a bounded reorder window;
//! a packet whose missing predecessor never shows up is dropped and
//! counted, never delivered torn.
use std::collections::{BTreeMap, HashMap};

use ferrotrace_abi::packets::ChunkPacketIter;
use ferrotrace_abi::{ChunkId, WriterId, chunk_flags};

use crate::ProducerId;
use crate::trace_buffer::ChunkRecord;

pub const DEFAULT_STITCH_WINDOW: u16 = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StitcherCounters {
    /// Packets dropped: continuation without its prefix, or chunks evicted
    /// from the reorder window.
    pub packets_dropped: u64,
    /// Chunks that lied about their contents.
    pub abi_violations: u64,
    pub chunks_out_of_order: u64,
}

struct WriterState {
    next_chunk_id: Option<ChunkId>,
    /// Bytes of a packet whose last fragment continues on the next chunk.
    pending_prefix: Vec<u8>,
    prefix_active: bool,
    /// Chunks that arrived ahead of their predecessor, keyed by distance
    /// from the expected id.
    parked: BTreeMap<u16, ChunkRecord>,
}

impl WriterState {
    fn new() -> Self {
        Self {
            next_chunk_id: None,
            pending_prefix: Vec::new(),
            prefix_active: false,
            parked: BTreeMap::new(),
        }
    }
}

/// Stateful packet reassembler for one logical buffer.
pub struct PacketStitcher {
    writers: HashMap<(ProducerId, WriterId), WriterState>,
    window: u16,
    counters: StitcherCounters,
}

impl PacketStitcher {
    pub fn new(window: u16) -> Self {
        Self {
            writers: HashMap::new(),
            window,
            counters: StitcherCounters::default(),
        }
    }

    pub fn counters(&self) -> StitcherCounters {
        self.counters
    }

    /// Feeds one chunk; completed packets are appended to `out`.
    pub fn push_chunk(&mut self, record: ChunkRecord, out: &mut Vec<Vec<u8>>) {
        let key = (record.producer_id, record.writer_id);
        let state = self.writers.entry(key).or_insert_with(WriterState::new);

        match state.next_chunk_id {
            None => {}
            Some(expected) => {
                let distance = record.chunk_id.wrapping_sub(expected);
                if distance == 0 {
                    // In order.
                } else if distance <= self.window {
                    self.counters.chunks_out_of_order += 1;
                    state.parked.insert(distance, record);
                    return;
                } else if distance > u16::MAX / 2 {
                    // Behind the cursor: a duplicate or ancient chunk.
                    self.counters.packets_dropped += 1;
                    return;
                } else {
                    // A gap wider than the window never fills: drop the
                    // waiting prefix and the parked chunks, resync at this
                    // chunk and consume it.
                    if state.prefix_active {
                        state.pending_prefix.clear();
                        state.prefix_active = false;
                        self.counters.packets_dropped += 1;
                    }
                    self.counters.packets_dropped += state.parked.len() as u64;
                    state.parked.clear();
                }
            }
        }

        Self::consume_chunk(&mut self.counters, state, &record, out);
        state.next_chunk_id = Some(record.chunk_id.wrapping_add(1));

        // Drain parked chunks that became consecutive.
        loop {
            let mut rekeyed = BTreeMap::new();
            let expected = state.next_chunk_id.unwrap();
            let mut advanced = false;
            for (_, parked) in std::mem::take(&mut state.parked) {
                let distance = parked.chunk_id.wrapping_sub(expected);
                if distance == 0 && !advanced {
                    Self::consume_chunk(&mut self.counters, state, &parked, out);
                    state.next_chunk_id = Some(parked.chunk_id.wrapping_add(1));
                    advanced = true;
                } else {
                    rekeyed.insert(distance, parked);
                }
            }
            state.parked = rekeyed;
            if !advanced {
                break;
            }
        }
    }

    fn consume_chunk(
        counters: &mut StitcherCounters,
        state: &mut WriterState,
        record: &ChunkRecord,
        out: &mut Vec<Vec<u8>>,
    ) {
        let first_continues = record.flags & chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREVIOUS != 0;
        let last_continues = record.flags & chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT != 0;

        let mut iter = ChunkPacketIter::new(&record.payload, record.num_packets);
        let fragments: Vec<&[u8]> = iter.by_ref().collect();
        if iter.malformed() {
            counters.abi_violations += 1;
        }
        let n = fragments.len();

        for (i, fragment) in fragments.iter().enumerate() {
            let is_first = i == 0;
            let is_last = i == n - 1;

            if is_first && first_continues {
                if state.prefix_active {
                    state.pending_prefix.extend_from_slice(fragment);
                } else {
                    // The start of this packet never made it (evicted
                    // predecessor); drop the tail.
                    counters.packets_dropped += 1;
                    continue;
                }
            } else {
                if state.prefix_active {
                    // A prefix was pending but this chunk starts fresh:
                    // the continuation is gone.
                    state.pending_prefix.clear();
                    counters.packets_dropped += 1;
                }
                state.pending_prefix = fragment.to_vec();
                state.prefix_active = true;
            }

            if is_last && last_continues {
                // Stays pending until the next chunk.
            } else {
                out.push(std::mem::take(&mut state.pending_prefix));
                state.prefix_active = false;
            }
        }
    }

    /// Drops every piece of state belonging to `producer`: a disconnected
    /// producer's unfinished packets must not block the stitcher.
    pub fn evict_producer(&mut self, producer: ProducerId) {
        self.writers.retain(|(pid, _), _| *pid != producer);
    }
}
