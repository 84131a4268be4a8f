//! Flash driver interface, plus an in-memory device for simulation.

use crate::config::Geometry;

/// Whether a flash call returns right after issuing the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Return once the command is queued; poll [`FlashDevice::is_bank_busy`].
    IssueOnly,
    /// Return once the operation has completed.
    WaitForCompletion,
}

/// Failures reported by a flash device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    #[error("program failed on bank {bank} block {pbn} page {page}")]
    Program { bank: u32, pbn: u32, page: u32 },
    #[error("erase failed on bank {bank} block {pbn}")]
    Erase { bank: u32, pbn: u32 },
    #[error("uncorrectable read on bank {bank} block {pbn} page {page}")]
    Ecc { bank: u32, pbn: u32, page: u32 },
    #[error("address out of range: bank {bank} block {pbn} page {page}")]
    OutOfRange { bank: u32, pbn: u32, page: u32 },
}

/// Each flash array must be represented by a structure that implements
/// this trait.
///
/// Buffers always hold exactly `sector_count` sectors. Data for a read issued
/// with [`IoMode::IssueOnly`] must be in `buf` when the call returns; the mode
/// only tells the device the caller will not wait on the bank.
pub trait FlashDevice {
    /// Read `sector_count` sectors of a page starting at `sector_offset`.
    fn page_read(
        &mut self,
        bank: u32,
        pbn: u32,
        page: u32,
        sector_offset: u32,
        sector_count: u32,
        buf: &mut [u8],
        mode: IoMode,
    ) -> Result<(), FlashError>;

    /// Program `sector_count` sectors of a page starting at `sector_offset`.
    ///
    /// Low pages of a block may be programmed a second time, carrying an
    /// encoded payload written over the first-pass content.
    fn page_program(
        &mut self,
        bank: u32,
        pbn: u32,
        page: u32,
        sector_offset: u32,
        sector_count: u32,
        data: &[u8],
        mode: IoMode,
    ) -> Result<(), FlashError>;

    /// Erase a block. Every page reads back as `0xFF` afterwards.
    fn block_erase(&mut self, bank: u32, pbn: u32) -> Result<(), FlashError>;

    /// Is an issued operation still running on the bank?
    fn is_bank_busy(&self, bank: u32) -> bool;

    /// Block until every issued operation on the bank has completed.
    fn wait_until_idle(&mut self, bank: u32);
}

/// Operation counts kept by [`RamFlash`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlashCounters {
    pub reads: u64,
    pub read_bytes: u64,
    pub programs: u64,
    pub erases: u64,
}

/// Flash array kept in memory. Pages are allocated on first program.
pub struct RamFlash {
    blocks_per_bank: u32,
    pages_per_block: u32,
    bytes_per_sector: usize,
    bytes_per_page: usize,
    pages: Vec<Option<Box<[u8]>>>,
    counters: FlashCounters,
}

impl RamFlash {
    /// A device large enough for `geometry`, reserved blocks included.
    pub fn new(geometry: &Geometry) -> Self {
        let blocks_per_bank = geometry.reserved_blocks_per_bank + geometry.log_blocks_per_bank;
        let total = geometry.banks * blocks_per_bank * geometry.pages_per_block;
        RamFlash {
            blocks_per_bank,
            pages_per_block: geometry.pages_per_block,
            bytes_per_sector: geometry.bytes_per_sector as usize,
            bytes_per_page: geometry.bytes_per_page(),
            pages: vec![None; total as usize],
            counters: FlashCounters::default(),
        }
    }

    pub fn counters(&self) -> FlashCounters {
        self.counters
    }

    fn index(&self, bank: u32, pbn: u32, page: u32) -> Result<usize, FlashError> {
        if pbn >= self.blocks_per_bank || page >= self.pages_per_block {
            return Err(FlashError::OutOfRange { bank, pbn, page });
        }
        let i = ((bank * self.blocks_per_bank + pbn) * self.pages_per_block + page) as usize;
        if i >= self.pages.len() {
            return Err(FlashError::OutOfRange { bank, pbn, page });
        }
        Ok(i)
    }

    fn span(&self, sector_offset: u32, sector_count: u32) -> std::ops::Range<usize> {
        let start = sector_offset as usize * self.bytes_per_sector;
        start..start + sector_count as usize * self.bytes_per_sector
    }
}

impl FlashDevice for RamFlash {
    fn page_read(
        &mut self,
        bank: u32,
        pbn: u32,
        page: u32,
        sector_offset: u32,
        sector_count: u32,
        buf: &mut [u8],
        _mode: IoMode,
    ) -> Result<(), FlashError> {
        let i = self.index(bank, pbn, page)?;
        let span = self.span(sector_offset, sector_count);
        if span.end > self.bytes_per_page || buf.len() != span.len() {
            return Err(FlashError::OutOfRange { bank, pbn, page });
        }
        match &self.pages[i] {
            Some(data) => buf.copy_from_slice(&data[span]),
            None => buf.fill(0xFF),
        }
        self.counters.reads += 1;
        self.counters.read_bytes += buf.len() as u64;
        Ok(())
    }

    fn page_program(
        &mut self,
        bank: u32,
        pbn: u32,
        page: u32,
        sector_offset: u32,
        sector_count: u32,
        data: &[u8],
        _mode: IoMode,
    ) -> Result<(), FlashError> {
        let i = self.index(bank, pbn, page)?;
        let span = self.span(sector_offset, sector_count);
        if span.end > self.bytes_per_page || data.len() != span.len() {
            return Err(FlashError::OutOfRange { bank, pbn, page });
        }
        let bytes_per_page = self.bytes_per_page;
        let stored = self.pages[i].get_or_insert_with(|| vec![0xFF; bytes_per_page].into_boxed_slice());
        stored[span].copy_from_slice(data);
        self.counters.programs += 1;
        Ok(())
    }

    fn block_erase(&mut self, bank: u32, pbn: u32) -> Result<(), FlashError> {
        let first = self.index(bank, pbn, 0)?;
        for page in &mut self.pages[first..first + self.pages_per_block as usize] {
            *page = None;
        }
        self.counters.erases += 1;
        Ok(())
    }

    fn is_bank_busy(&self, _bank: u32) -> bool {
        false
    }

    fn wait_until_idle(&mut self, _bank: u32) {}
}
