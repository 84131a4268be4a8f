#![allow(dead_code)]

use std::cell::Cell;
use std::iter::zip;

use chunk_ftl::{FlashDevice, FlashError, FtlConfig, Geometry, HostBufferRing, IoMode, Tuning};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

// Struct used to capture call counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimStats {
    pub frozen: bool,
    pub erase: usize,
    pub erase_fail: usize,
    pub prog: usize,
    pub reprog: usize,
    pub prog_fail: usize,
    pub read: usize,
    pub read_bytes: usize,
    pub busy_polls: usize,
}

// Per-page program count since the last erase.  Low pages may be
// programmed twice, every other page once.
#[derive(Clone, Copy, Default)]
struct PageStatus {
    programs: u8,
}

/// Simulated flash array with NAND programming rules.
pub struct SimFlash {
    geo: Geometry,
    blocks_per_bank: u32,
    // The simulated memory
    mem: Vec<u8>,
    pages: Vec<PageStatus>,
    // Blocks whose programs fail.
    failed: Vec<bool>,
    // Polls an issued operation keeps its bank busy for.
    busy_polls: u32,
    busy: Vec<Cell<u32>>,
    stats: SimStats,
    busy_seen: Cell<usize>,
}

impl SimFlash {
    pub fn new(geo: &Geometry) -> Self {
        let blocks_per_bank = geo.reserved_blocks_per_bank + geo.log_blocks_per_bank;
        let pages = (geo.banks * blocks_per_bank * geo.pages_per_block) as usize;
        SimFlash {
            geo: geo.clone(),
            blocks_per_bank,
            mem: vec![0xFF; pages * geo.bytes_per_page()],
            pages: vec![PageStatus::default(); pages],
            failed: vec![false; (geo.banks * blocks_per_bank) as usize],
            busy_polls: 0,
            busy: (0..geo.banks).map(|_| Cell::new(0)).collect(),
            stats: SimStats::default(),
            busy_seen: Cell::new(0),
        }
    }

    /// Every issued program keeps its bank busy for `polls` calls of
    /// `is_bank_busy`.
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    pub fn stats(&self) -> SimStats {
        let mut stats = self.stats;
        stats.busy_polls = self.busy_seen.get();
        stats
    }

    pub fn sim_set_failed(&mut self, bank: u32, pbn: u32) {
        self.failed[(bank * self.blocks_per_bank + pbn) as usize] = true;
    }

    pub fn freeze(&mut self) {
        self.stats.frozen = true;
    }

    pub fn thaw(&mut self) {
        self.stats.frozen = false;
    }

    pub fn sim_dump(&self) {
        let s = self.stats();
        println!("NAND operation counts:");
        println!("    erase:          {}", s.erase);
        println!("    erase failures: {}", s.erase_fail);
        println!("    prog:           {}", s.prog);
        println!("    reprog:         {}", s.reprog);
        println!("    prog failures:  {}", s.prog_fail);
        println!("    read:           {}", s.read);
        println!("    read (bytes):   {}", s.read_bytes);
        println!("    busy polls:     {}", s.busy_polls);
        println!();
    }

    fn page_index(&self, bank: u32, pbn: u32, page: u32) -> usize {
        assert!(bank < self.geo.banks, "sim: invalid bank {bank}");
        assert!(pbn < self.blocks_per_bank, "sim: invalid block {pbn}");
        assert!(page < self.geo.pages_per_block, "sim: invalid page {page}");
        assert!(
            pbn >= self.geo.reserved_blocks_per_bank,
            "sim: access to reserved block {pbn} on bank {bank}"
        );
        ((bank * self.blocks_per_bank + pbn) * self.geo.pages_per_block + page) as usize
    }

    fn span(&self, index: usize, sector_offset: u32, sector_count: u32) -> std::ops::Range<usize> {
        let bps = self.geo.bytes_per_sector as usize;
        assert!(
            sector_offset + sector_count <= self.geo.sectors_per_page,
            "sim: invalid range: offset = {sector_offset}, count = {sector_count}"
        );
        let start = index * self.geo.bytes_per_page() + sector_offset as usize * bps;
        start..start + sector_count as usize * bps
    }

    fn issue(&self, bank: u32, mode: IoMode) {
        if mode == IoMode::IssueOnly {
            self.busy[bank as usize].set(self.busy_polls);
        }
    }
}

impl FlashDevice for SimFlash {
    fn page_read(
        &mut self,
        bank: u32,
        pbn: u32,
        page: u32,
        sector_offset: u32,
        sector_count: u32,
        buf: &mut [u8],
        mode: IoMode,
    ) -> Result<(), FlashError> {
        let index = self.page_index(bank, pbn, page);
        let span = self.span(index, sector_offset, sector_count);
        assert_eq!(buf.len(), span.len(), "sim: read buffer does not match the range");

        if !self.stats.frozen {
            self.stats.read += 1;
            self.stats.read_bytes += span.len();
        }
        buf.copy_from_slice(&self.mem[span]);
        self.issue(bank, mode);
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
        mode: IoMode,
    ) -> Result<(), FlashError> {
        let index = self.page_index(bank, pbn, page);
        let span = self.span(index, sector_offset, sector_count);
        assert_eq!(data.len(), span.len(), "sim: program buffer does not match the range");

        let programs = self.pages[index].programs;
        let limit = if self.geo.is_low_page(page) { 2 } else { 1 };
        assert!(
            programs < limit,
            "sim: page programmed too often. Bank {bank}, block {pbn}, page {page} ({programs} programs)"
        );
        self.pages[index].programs += 1;

        if !self.stats.frozen {
            self.stats.prog += 1;
            if programs > 0 {
                self.stats.reprog += 1;
            }
        }

        if self.failed[(bank * self.blocks_per_bank + pbn) as usize] {
            if !self.stats.frozen {
                self.stats.prog_fail += 1;
            }
            seq_gen(u64::from(page * 57 + 29), &mut self.mem[span]);
            return Err(FlashError::Program { bank, pbn, page });
        }

        self.mem[span].copy_from_slice(data);
        self.issue(bank, mode);
        Ok(())
    }

    fn block_erase(&mut self, bank: u32, pbn: u32) -> Result<(), FlashError> {
        let first = self.page_index(bank, pbn, 0);
        let ppb = self.geo.pages_per_block as usize;
        if !self.stats.frozen {
            self.stats.erase += 1;
        }
        if self.failed[(bank * self.blocks_per_bank + pbn) as usize] {
            if !self.stats.frozen {
                self.stats.erase_fail += 1;
            }
            return Err(FlashError::Erase { bank, pbn });
        }

        let bpp = self.geo.bytes_per_page();
        self.mem[first * bpp..(first + ppb) * bpp].fill(0xFF);
        for status in &mut self.pages[first..first + ppb] {
            *status = PageStatus::default();
        }
        Ok(())
    }

    fn is_bank_busy(&self, bank: u32) -> bool {
        let left = self.busy[bank as usize].get();
        if left == 0 {
            return false;
        }
        self.busy[bank as usize].set(left - 1);
        self.busy_seen.set(self.busy_seen.get() + 1);
        true
    }

    fn wait_until_idle(&mut self, bank: u32) {
        self.busy[bank as usize].set(0);
    }
}

/// Host ring whose limit reaches the FTL's position after a number of polls.
pub struct SimHostRing {
    write_id: u32,
    limit: u32,
    ready_after: Option<u32>,
    polls: u32,
}

impl SimHostRing {
    /// `None` means the host never catches up.
    pub fn new(ready_after: Option<u32>) -> Self {
        SimHostRing { write_id: 1, limit: 0, ready_after, polls: 0 }
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Start lagging again.
    pub fn rearm(&mut self, ready_after: Option<u32>) {
        self.write_id += 1;
        self.ready_after = ready_after;
        self.polls = 0;
    }
}

impl HostBufferRing for SimHostRing {
    fn ftl_write_id(&self) -> u32 {
        self.write_id
    }

    fn write_limit(&mut self) -> u32 {
        self.polls += 1;
        if let Some(n) = self.ready_after {
            if self.polls >= n {
                self.limit = self.write_id;
            }
        }
        self.limit
    }
}

/// 16 pages per block, 4 chunks of 2 sectors per page, 32-byte sectors.
/// The 256-byte list page holds all 64 back-pointers of a block.
pub fn small_config(banks: u32, log_blocks: u32) -> FtlConfig {
    FtlConfig {
        geometry: Geometry {
            banks,
            channels: banks.min(2),
            log_blocks_per_bank: log_blocks,
            reserved_blocks_per_bank: 1,
            pages_per_block: 16,
            sectors_per_page: 8,
            sectors_per_chunk: 2,
            bytes_per_sector: 32,
            chunks_per_recycled_page: 2,
            logical_pages: 64,
        },
        tuning: Tuning::default(),
    }
}

pub fn seq_gen(seed: u64, buf: &mut [u8]) {
    let mut small_rng = SmallRng::seed_from_u64(seed);
    small_rng.fill_bytes(buf);
}

pub fn seq_assert(seed: u64, buf: &[u8]) {
    let mut small_rng = SmallRng::seed_from_u64(seed);
    let mut expected = vec![0u8; buf.len()];
    small_rng.fill_bytes(&mut expected[..]);

    for (&element, expect) in zip(buf, expected) {
        assert_eq!(element, expect, "seq_assert: mismatch in sequences.");
    }
}
