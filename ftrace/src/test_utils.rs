//! Builders for synthetic kernel ring-buffer pages.
//!
//! Pages produced here follow the 64-bit layout (8-byte commit field in the
//! page header), matching translation tables built with
//! `page_header_size_len = 8`.

/// Assembles one raw page: header plus a run of records.
pub struct PageBuilder {
    timestamp: u64,
    overwrite: u8,
    payload: Vec<u8>,
}

impl PageBuilder {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            overwrite: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_overwrite(mut self, overwrite: u8) -> Self {
        self.overwrite = overwrite;
        self
    }

    fn push_header(&mut self, type_or_length: u32, time_delta: u32) {
        assert!(type_or_length < 32);
        assert!(time_delta < (1 << 27));
        let word = type_or_length | (time_delta << 5);
        self.payload.extend_from_slice(&word.to_le_bytes());
    }

    /// Appends a data record. Records whose length is a multiple of 4 and
    /// at most 112 bytes use the compact header; longer ones the extended
    /// form with an explicit length word.
    pub fn add_data_record(&mut self, time_delta: u32, record: &[u8]) {
        if record.len() % 4 == 0 && (1..=28).contains(&(record.len() / 4)) {
            self.push_header((record.len() / 4) as u32, time_delta);
        } else {
            self.push_header(0, time_delta);
            self.payload
                .extend_from_slice(&(record.len() as u32 + 4).to_le_bytes());
        }
        self.payload.extend_from_slice(record);
    }

    pub fn add_time_extend(&mut self, time_delta: u32, extension: u32) {
        self.push_header(30, time_delta);
        self.payload.extend_from_slice(&extension.to_le_bytes());
    }

    pub fn add_time_stamp(&mut self, tv_nsec: u64, tv_sec: u64) {
        self.push_header(31, 0);
        self.payload.extend_from_slice(&tv_nsec.to_le_bytes());
        self.payload.extend_from_slice(&tv_sec.to_le_bytes());
    }

    /// Discarded-event padding: a length word plus that many dead bytes.
    pub fn add_padding(&mut self, time_delta: u32, length: u32) {
        assert!(time_delta != 0);
        self.push_header(29, time_delta);
        self.payload.extend_from_slice(&length.to_le_bytes());
        self.payload.extend(std::iter::repeat_n(0u8, length as usize));
    }

    /// Padding with `time_delta == 0`, which ends the page.
    pub fn add_empty_padding(&mut self) {
        self.push_header(29, 0);
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(self.payload.len() <= u16::MAX as usize);
        let mut page = Vec::with_capacity(16 + self.payload.len());
        page.extend_from_slice(&self.timestamp.to_le_bytes());
        let word = (u32::from(self.overwrite) << 24) | self.payload.len() as u32;
        page.extend_from_slice(&word.to_le_bytes());
        page.extend_from_slice(&[0u8; 4]); // high half of the commit field
        page.extend_from_slice(&self.payload);
        page
    }

    /// Like [`build`](Self::build) but padded with zeros to `page_size`,
    /// the shape the kernel actually hands over.
    pub fn build_padded(&self, page_size: usize) -> Vec<u8> {
        let mut page = self.build();
        assert!(page.len() <= page_size);
        page.resize(page_size, 0);
        page
    }
}
