//! Page and chunk state machine over a paged memory region.
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ferrotrace_base::{PAGE_SIZE, PagedMemory};

/// Stable per-producer writer identifier. 16 bits wide everywhere: the
/// chunk header, the arbiter's pool and the service's stitching keys.
pub type WriterId = u16;

/// Per-writer monotonic chunk counter, compared modulo 2^16.
pub type ChunkId = u16;

/// Index of a logical buffer in the service's bounded pool.
pub type BufferId = u16;

pub const MAX_CHUNKS_PER_PAGE: u32 = 14;
pub const PAGE_HEADER_SIZE: usize = 8;
pub const CHUNK_HEADER_SIZE: usize = 8;

const STATE_MASK: u32 = 0b11;
const LAYOUT_SHIFT: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkState {
    Free = 0,
    BeingWritten = 1,
    Complete = 2,
    BeingRead = 3,
}

impl ChunkState {
    fn from_bits(bits: u32) -> Self {
        match bits & STATE_MASK {
            0 => ChunkState::Free,
            1 => ChunkState::BeingWritten,
            2 => ChunkState::Complete,
            _ => ChunkState::BeingRead,
        }
    }
}

pub mod chunk_flags {
    /// The chunk's first fragment is the continuation of a packet started
    /// in the previous chunk of the same writer.
    pub const FIRST_PACKET_CONTINUES_FROM_PREVIOUS: u8 = 1 << 0;
    /// The chunk's last fragment continues in the next chunk of the same
    /// writer.
    pub const LAST_PACKET_CONTINUES_ON_NEXT: u8 = 1 << 1;
    /// Reserved by the ABI for writers that back-patch nested message
    /// sizes after commit. The current arbiter encodes whole packets
    /// before committing and never sets it.
    pub const CHUNK_NEEDS_PATCHING: u8 = 1 << 2;
}

/// Header stored in the first [`CHUNK_HEADER_SIZE`] bytes of every chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub num_packets: u16,
    pub flags: u8,
}

/// Decoded view of one page's header words.
#[derive(Debug, Clone, Copy)]
pub struct PageSnapshot {
    pub num_chunks: u32,
    pub states: [ChunkState; MAX_CHUNKS_PER_PAGE as usize],
    pub target_buffer: BufferId,
}

fn layout_num_chunks(word: u32) -> u32 {
    word >> LAYOUT_SHIFT
}

fn chunk_state_bits(word: u32, chunk: u32) -> u32 {
    (word >> (chunk * 2)) & STATE_MASK
}

fn with_chunk_state(word: u32, chunk: u32, state: ChunkState) -> u32 {
    (word & !(STATE_MASK << (chunk * 2))) | ((state as u32) << (chunk * 2))
}

/// The shared region plus the atomic operations of the transport.
///
/// Clones are cheap and address the same region; the producer-side arbiter
/// and the service each hold one.
#[derive(Clone)]
pub struct SharedMemoryAbi {
    mem: Arc<PagedMemory>,
    page_size: usize,
    num_pages: u32,
}

impl SharedMemoryAbi {
    /// Creates a region of `num_pages` pages of `page_size` bytes each.
    /// `page_size` must be a multiple of 4 KiB.
    pub fn create(num_pages: u32, page_size: usize) -> Self {
        assert!(num_pages > 0);
        assert!(page_size > 0 && page_size.is_multiple_of(PAGE_SIZE));
        let mem = Arc::new(PagedMemory::allocate(num_pages as usize * page_size));
        Self {
            mem,
            page_size,
            num_pages,
        }
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Payload bytes of one chunk when the page holds `num_chunks` chunks.
    pub fn chunk_size(&self, num_chunks: u32) -> usize {
        assert!((1..=MAX_CHUNKS_PER_PAGE).contains(&num_chunks));
        (self.page_size - PAGE_HEADER_SIZE) / num_chunks as usize
    }

    /// Usable payload of a chunk, net of its header.
    pub fn chunk_payload_size(&self, num_chunks: u32) -> usize {
        self.chunk_size(num_chunks) - CHUNK_HEADER_SIZE
    }

    fn page_offset(&self, page: u32) -> usize {
        assert!(page < self.num_pages);
        page as usize * self.page_size
    }

    fn layout_word(&self, page: u32) -> &AtomicU32 {
        let off = self.page_offset(page);
        // Page starts are 4-byte aligned by construction; the header words
        // are the only atomically accessed bytes of the page.
        unsafe { &*(self.mem.as_ptr().add(off) as *const AtomicU32) }
    }

    fn target_word(&self, page: u32) -> &AtomicU32 {
        let off = self.page_offset(page) + 4;
        unsafe { &*(self.mem.as_ptr().add(off) as *const AtomicU32) }
    }

    fn chunk_range(&self, page: u32, num_chunks: u32, chunk: u32) -> (usize, usize) {
        assert!(chunk < num_chunks);
        let chunk_size = self.chunk_size(num_chunks);
        let begin = self.page_offset(page) + PAGE_HEADER_SIZE + chunk as usize * chunk_size;
        (begin, chunk_size)
    }

    pub fn page_layout(&self, page: u32) -> u32 {
        self.layout_word(page).load(Ordering::Acquire)
    }

    pub fn num_chunks(&self, page: u32) -> u32 {
        layout_num_chunks(self.page_layout(page))
    }

    pub fn chunk_state(&self, page: u32, chunk: u32) -> ChunkState {
        ChunkState::from_bits(chunk_state_bits(self.page_layout(page), chunk))
    }

    pub fn target_buffer(&self, page: u32) -> BufferId {
        self.target_word(page).load(Ordering::Acquire) as BufferId
    }

    pub fn is_page_free(&self, page: u32) -> bool {
        self.page_layout(page) == 0
    }

    /// True when the page is partitioned and every chunk is `Complete`.
    pub fn is_page_complete(&self, page: u32) -> bool {
        let word = self.page_layout(page);
        let n = layout_num_chunks(word);
        n != 0 && (0..n).all(|c| chunk_state_bits(word, c) == ChunkState::Complete as u32)
    }

    pub fn snapshot(&self, page: u32) -> PageSnapshot {
        let word = self.page_layout(page);
        let mut states = [ChunkState::Free; MAX_CHUNKS_PER_PAGE as usize];
        let n = layout_num_chunks(word);
        for c in 0..n {
            states[c as usize] = ChunkState::from_bits(chunk_state_bits(word, c));
        }
        PageSnapshot {
            num_chunks: n,
            states,
            target_buffer: self.target_buffer(page),
        }
    }

    /// Installs a layout on a fully free page, records the target buffer
    /// and atomically acquires chunk 0 for writing. Fails if the page is
    /// not free.
    pub fn try_partition_page(
        &self,
        page: u32,
        num_chunks: u32,
        target_buffer: BufferId,
    ) -> Option<ChunkHandle> {
        assert!((1..=MAX_CHUNKS_PER_PAGE).contains(&num_chunks));
        // The target word is meaningless while the layout word is 0, so it
        // can be staged before the CAS that publishes the partition.
        self.target_word(page)
            .store(target_buffer as u32, Ordering::Release);
        let new_word = with_chunk_state(num_chunks << LAYOUT_SHIFT, 0, ChunkState::BeingWritten);
        self.layout_word(page)
            .compare_exchange(0, new_word, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(ChunkHandle {
            abi: self.clone(),
            page,
            chunk: 0,
            num_chunks,
        })
    }

    /// CAS of one chunk from `Free` to `BeingWritten` under the page's
    /// existing layout. Fails cleanly on any contention.
    pub fn try_acquire_chunk_for_writing(&self, page: u32, chunk: u32) -> Option<ChunkHandle> {
        let word_cell = self.layout_word(page);
        let mut word = word_cell.load(Ordering::Acquire);
        loop {
            let num_chunks = layout_num_chunks(word);
            if num_chunks == 0 || chunk >= num_chunks {
                return None;
            }
            if chunk_state_bits(word, chunk) != ChunkState::Free as u32 {
                return None;
            }
            let new_word = with_chunk_state(word, chunk, ChunkState::BeingWritten);
            match word_cell.compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return Some(ChunkHandle {
                        abi: self.clone(),
                        page,
                        chunk,
                        num_chunks,
                    });
                }
                Err(cur) => word = cur,
            }
        }
    }

    /// Service side: succeeds only if every chunk of the page is
    /// `Complete`; atomically marks them all `BeingRead`.
    pub fn try_acquire_all_chunks_for_reading(&self, page: u32) -> Option<Vec<ChunkReadHandle>> {
        let word_cell = self.layout_word(page);
        let mut word = word_cell.load(Ordering::Acquire);
        loop {
            let num_chunks = layout_num_chunks(word);
            if num_chunks == 0 {
                return None;
            }
            let all_complete = (0..num_chunks)
                .all(|c| chunk_state_bits(word, c) == ChunkState::Complete as u32);
            if !all_complete {
                return None;
            }
            let mut new_word = word;
            for c in 0..num_chunks {
                new_word = with_chunk_state(new_word, c, ChunkState::BeingRead);
            }
            match word_cell.compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return Some(
                        (0..num_chunks)
                            .map(|chunk| ChunkReadHandle {
                                abi: self.clone(),
                                page,
                                chunk,
                                num_chunks,
                            })
                            .collect(),
                    );
                }
                Err(cur) => word = cur,
            }
        }
    }

    /// Service side, rate-limited partial path: acquires one `Complete`
    /// chunk of a page whose siblings are still being written.
    pub fn try_acquire_chunk_for_reading(&self, page: u32, chunk: u32) -> Option<ChunkReadHandle> {
        let word_cell = self.layout_word(page);
        let mut word = word_cell.load(Ordering::Acquire);
        loop {
            let num_chunks = layout_num_chunks(word);
            if num_chunks == 0 || chunk >= num_chunks {
                return None;
            }
            if chunk_state_bits(word, chunk) != ChunkState::Complete as u32 {
                return None;
            }
            let new_word = with_chunk_state(word, chunk, ChunkState::BeingRead);
            match word_cell.compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return Some(ChunkReadHandle {
                        abi: self.clone(),
                        page,
                        chunk,
                        num_chunks,
                    });
                }
                Err(cur) => word = cur,
            }
        }
    }

    /// Clears the whole page: every chunk back to `Free` and the layout
    /// uninstalled. The caller must hold every non-free chunk of the page
    /// in `BeingRead`.
    pub fn release_all_chunks_as_free(&self, page: u32) {
        let word_cell = self.layout_word(page);
        let word = word_cell.load(Ordering::Acquire);
        let num_chunks = layout_num_chunks(word);
        debug_assert!((0..num_chunks).all(|c| {
            let s = chunk_state_bits(word, c);
            s == ChunkState::BeingRead as u32 || s == ChunkState::Free as u32
        }));
        self.target_word(page).store(0, Ordering::Release);
        word_cell.store(0, Ordering::Release);
    }

    fn release_chunk(&self, page: u32, chunk: u32, from: ChunkState, to: ChunkState) {
        let word_cell = self.layout_word(page);
        let mut word = word_cell.load(Ordering::Acquire);
        loop {
            debug_assert_eq!(chunk_state_bits(word, chunk), from as u32);
            let new_word = with_chunk_state(word, chunk, to);
            match word_cell.compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(cur) => word = cur,
            }
        }
    }

    fn payload_range(&self, page: u32, num_chunks: u32, chunk: u32) -> (usize, usize) {
        let (begin, size) = self.chunk_range(page, num_chunks, chunk);
        (begin + CHUNK_HEADER_SIZE, size - CHUNK_HEADER_SIZE)
    }

    fn write_chunk_header(&self, page: u32, num_chunks: u32, chunk: u32, header: ChunkHeader) {
        let (begin, _) = self.chunk_range(page, num_chunks, chunk);
        let ptr = self.mem.as_ptr();
        // Plain stores: the chunk is exclusively owned in `BeingWritten`
        // and the bytes are published by the release CAS to `Complete`.
        unsafe {
            std::ptr::copy_nonoverlapping(header.writer_id.to_le_bytes().as_ptr(), ptr.add(begin), 2);
            std::ptr::copy_nonoverlapping(
                header.chunk_id.to_le_bytes().as_ptr(),
                ptr.add(begin + 2),
                2,
            );
            std::ptr::copy_nonoverlapping(
                header.num_packets.to_le_bytes().as_ptr(),
                ptr.add(begin + 4),
                2,
            );
            *ptr.add(begin + 6) = header.flags;
            *ptr.add(begin + 7) = 0;
        }
    }

    fn read_chunk_header(&self, page: u32, num_chunks: u32, chunk: u32) -> ChunkHeader {
        let (begin, _) = self.chunk_range(page, num_chunks, chunk);
        let ptr = self.mem.as_ptr();
        unsafe {
            let mut buf = [0u8; CHUNK_HEADER_SIZE];
            std::ptr::copy_nonoverlapping(ptr.add(begin), buf.as_mut_ptr(), CHUNK_HEADER_SIZE);
            ChunkHeader {
                writer_id: u16::from_le_bytes([buf[0], buf[1]]),
                chunk_id: u16::from_le_bytes([buf[2], buf[3]]),
                num_packets: u16::from_le_bytes([buf[4], buf[5]]),
                flags: buf[6],
            }
        }
    }
}

/// Exclusive handle to one chunk in `BeingWritten`.
///
/// The handle does not release on drop: leaking it leaves the chunk in
/// `BeingWritten`, which is a producer bug the service tolerates (the page
/// simply never becomes complete).
pub struct ChunkHandle {
    abi: SharedMemoryAbi,
    page: u32,
    chunk: u32,
    num_chunks: u32,
}

impl ChunkHandle {
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn payload_size(&self) -> usize {
        self.abi.chunk_payload_size(self.num_chunks)
    }

    /// The chunk's payload bytes, after the chunk header.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (begin, len) = self.abi.payload_range(self.page, self.num_chunks, self.chunk);
        // Exclusive by the state machine: only the holder of a
        // `BeingWritten` chunk touches these bytes.
        unsafe { std::slice::from_raw_parts_mut(self.abi.mem.as_ptr().add(begin), len) }
    }

    /// Writes the chunk header and publishes the chunk as `Complete`. All
    /// payload stores happen-before the release transition.
    pub fn release_as_complete(self, header: ChunkHeader) {
        self.abi
            .write_chunk_header(self.page, self.num_chunks, self.chunk, header);
        self.abi.release_chunk(
            self.page,
            self.chunk,
            ChunkState::BeingWritten,
            ChunkState::Complete,
        );
    }
}

/// Exclusive handle to one chunk in `BeingRead`.
pub struct ChunkReadHandle {
    abi: SharedMemoryAbi,
    page: u32,
    chunk: u32,
    num_chunks: u32,
}

impl ChunkReadHandle {
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn header(&self) -> ChunkHeader {
        self.abi.read_chunk_header(self.page, self.num_chunks, self.chunk)
    }

    pub fn payload(&self) -> &[u8] {
        let (begin, len) = self.abi.payload_range(self.page, self.num_chunks, self.chunk);
        unsafe { std::slice::from_raw_parts(self.abi.mem.as_ptr().add(begin), len) }
    }

    /// Returns the chunk to `Free`, keeping the page layout installed so
    /// writers can reuse the slot.
    pub fn release_as_free(self) {
        self.abi.release_chunk(
            self.page,
            self.chunk,
            ChunkState::BeingRead,
            ChunkState::Free,
        );
    }
}
