//! Writers usable before the producer is connected to any service.
//!
//! An unbound writer buffers encoded packets on the heap. Once the
//! producer connects and the registry binds the writer to an arbiter, the
//! buffered packets are replayed into real chunks in write order and all
//! further packets go straight through.
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use prost::Message;

use ferrotrace_abi::BufferId;
use ferrotrace_proto::TracePacket;

use crate::shared_memory_arbiter::SharedMemoryArbiter;
use crate::startup_registry::RegistryInner;
use crate::trace_writer::TraceWriter;

pub(crate) struct StartupWriterState {
    buffered: Vec<Vec<u8>>,
    bound: Option<TraceWriter>,
    /// Best-effort guard: binding is refused while a packet handle is
    /// alive, and retried by the registry on its task runner.
    write_in_progress: bool,
}

pub(crate) struct StartupWriterShared {
    pub(crate) state: Mutex<StartupWriterState>,
}

impl StartupWriterShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StartupWriterState {
                buffered: Vec::new(),
                bound: None,
                write_in_progress: false,
            }),
        })
    }

    /// Moves the buffered packets into a real writer. Fails (and will be
    /// retried) while a write is in progress.
    pub(crate) fn try_bind(&self, arbiter: &SharedMemoryArbiter, target_buffer: BufferId) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.write_in_progress {
            return false;
        }
        if state.bound.is_some() {
            return true;
        }
        let Ok(mut writer) = arbiter.create_trace_writer(target_buffer) else {
            log::warn!("cannot bind startup writer: writer ids exhausted");
            return false;
        };
        for packet in state.buffered.drain(..) {
            writer.write_packet_bytes(&packet);
        }
        state.bound = Some(writer);
        true
    }
}

/// A trace writer that may outlive its unbound phase. Packets written
/// before binding are buffered; packets written after go through the bound
/// [`TraceWriter`]. Dropping an unbound writer discards its buffer.
pub struct StartupTraceWriter {
    shared: Arc<StartupWriterShared>,
    registry: Option<Arc<RegistryInner>>,
}

impl StartupTraceWriter {
    pub(crate) fn new(shared: Arc<StartupWriterShared>, registry: Arc<RegistryInner>) -> Self {
        Self {
            shared,
            registry: Some(registry),
        }
    }

    pub fn new_trace_packet(&mut self) -> StartupPacketHandle<'_> {
        self.shared.state.lock().unwrap().write_in_progress = true;
        StartupPacketHandle {
            writer: self,
            packet: TracePacket::default(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.shared.state.lock().unwrap().bound.is_some()
    }

    /// Packets sitting in the heap buffer, waiting for a bind.
    pub fn buffered_packets(&self) -> usize {
        self.shared.state.lock().unwrap().buffered.len()
    }

    fn commit_packet(&self, bytes: Vec<u8>) {
        let mut state = self.shared.state.lock().unwrap();
        match &mut state.bound {
            Some(writer) => writer.write_packet_bytes(&bytes),
            None => state.buffered.push(bytes),
        }
        state.write_in_progress = false;
    }
}

impl Drop for StartupTraceWriter {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.on_writer_destroyed(&self.shared);
        }
    }
}

/// Packet under construction on a startup writer; commits on drop.
pub struct StartupPacketHandle<'a> {
    writer: &'a mut StartupTraceWriter,
    packet: TracePacket,
}

impl Deref for StartupPacketHandle<'_> {
    type Target = TracePacket;
    fn deref(&self) -> &TracePacket {
        &self.packet
    }
}

impl DerefMut for StartupPacketHandle<'_> {
    fn deref_mut(&mut self) -> &mut TracePacket {
        &mut self.packet
    }
}

impl Drop for StartupPacketHandle<'_> {
    fn drop(&mut self) {
        let bytes = self.packet.encode_to_vec();
        self.writer.commit_packet(bytes);
    }
}
