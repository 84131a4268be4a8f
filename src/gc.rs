//! Garbage collection: victim selection and the incremental relocation
//! state machine.
//!
//! A session walks the victim's back-pointer list one page at a time. The
//! read phase finds a page with live chunks and loads it; the write phase
//! moves those chunks to the cold log, copying the page as a whole when every
//! chunk is still live. Once the list is exhausted the victim must hold no
//! valid chunk, and it is erased and returned to the clean list.
//!
//! Sessions advance in steps so peer banks on other channels can be driven
//! in the same round, and so background work can run while a sub-page write
//! waits on the host.

use std::fmt;

use tracing::{debug, trace, warn};

use crate::address::{read_back_pointers, BackPointer, ChunkAddr, Encoding, LogKind};
use crate::config::Geometry;
use crate::ftl::FlashTranslationLayer;
use crate::heap::HeapKind;
use crate::host::HostBufferRing;
use crate::nand::{FlashDevice, IoMode};
use crate::write::RelocSource;
use crate::FtlError;

/// Where a bank's collector stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Idle,
    /// Looking for the next victim page with live chunks.
    Read,
    /// Relocating the live chunks of the loaded page.
    Write,
}

impl GcState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GcState::Idle => "idle",
            GcState::Read => "read",
            GcState::Write => "write",
        }
    }
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one collector step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStep {
    /// Progress was made; call again.
    Continue,
    /// The bank is busy; nothing was done.
    Blocked,
    /// No session is running.
    Done,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GcChunk {
    pub(crate) lpn: u32,
    pub(crate) chunk_idx: u32,
}

/// One victim being collected.
#[derive(Debug)]
pub(crate) struct GcSession {
    pub(crate) phase: GcState,
    pub(crate) victim: u32,
    pub(crate) victim_pbn: u32,
    /// Valid chunks the victim still has to give up.
    pub(crate) expected: u32,
    /// Live chunks found by the scan, minus those lost to races.
    pub(crate) tally: u32,
    pub(crate) page: u32,
    pub(crate) recycled_page: bool,
    /// Live chunks of the loaded page, by chunk offset.
    pub(crate) live: Vec<Option<GcChunk>>,
    pub(crate) n_live: u32,
    pub(crate) list: Vec<BackPointer>,
}

#[derive(Debug)]
pub(crate) struct GcEngine {
    pub(crate) session: Option<GcSession>,
    /// A `run_garbage_collection` call on this bank has not returned yet.
    pub(crate) running: bool,
    /// Content of the victim page being relocated.
    pub(crate) scratch: Vec<u8>,
}

impl GcEngine {
    pub(crate) fn new(geo: &Geometry) -> Self {
        GcEngine { session: None, running: false, scratch: vec![0xFF; geo.bytes_per_page()] }
    }

    pub(crate) fn state(&self) -> GcState {
        self.session.as_ref().map_or(GcState::Idle, |s| s.phase)
    }
}

// ///////////////////////////////////////////////////////////////////////
// Orchestration
// ///////////////////////////////////////////////////////////////////////

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Collect one victim on `bank`, driving peer banks that are short of
    /// clean blocks alongside it.
    ///
    /// Relocations never start a collection of their own, so re-entering
    /// this on a bank means collecting needs the space it is meant to free.
    /// That halts the bank with [`FtlError::GcStalled`].
    pub fn run_garbage_collection(&mut self, bank: u32) -> Result<(), FtlError> {
        self.ensure_running(bank)?;
        if self.banks[bank as usize].gc.running {
            return Err(self.fatal(bank, FtlError::GcStalled(bank)));
        }
        self.banks[bank as usize].gc.running = true;
        let result = self.collect_one_victim(bank);
        self.banks[bank as usize].gc.running = false;
        result
    }

    fn collect_one_victim(&mut self, bank: u32) -> Result<(), FtlError> {
        let group = self.select_gc_banks(bank);

        for &b in &group {
            if self.banks[b as usize].gc.state() == GcState::Idle && !self.init_gc(b)? && b == bank {
                return Err(self.fatal(bank, FtlError::NoVictim(bank)));
            }
        }
        for &b in &group {
            if self.banks[b as usize].gc.state() == GcState::Read {
                self.flash.wait_until_idle(b);
            }
        }

        for _ in 0..self.gc_round_limit() {
            if self.banks[bank as usize].gc.state() == GcState::Idle {
                return Ok(());
            }
            for &b in &group {
                if !self.banks[b as usize].halted {
                    self.gc_step(b)?;
                }
            }
        }
        Err(self.fatal(bank, FtlError::GcStalled(bank)))
    }

    /// Run collection until every bank is idle with at least
    /// `min_clean_blocks` clean blocks, or has nothing left to collect.
    pub fn finish_all_garbage_collection(&mut self) -> Result<(), FtlError> {
        let limit = self.gc_round_limit() * u64::from(self.geo.log_blocks_per_bank);
        for _ in 0..limit {
            let mut settled = 0;
            for b in 0..self.geo.banks {
                if self.banks[b as usize].halted {
                    settled += 1;
                    continue;
                }
                match self.banks[b as usize].gc.state() {
                    GcState::Idle if self.banks[b as usize].clean.len() >= self.tuning.min_clean_blocks => {
                        settled += 1;
                    }
                    GcState::Idle => {
                        if !self.init_gc(b)? {
                            warn!(bank = b, "clean blocks below reserve with nothing to collect");
                            settled += 1;
                        }
                    }
                    GcState::Read | GcState::Write => {
                        self.gc_step(b)?;
                    }
                }
            }
            if settled == self.geo.banks {
                return Ok(());
            }
        }

        let min_clean = self.tuning.min_clean_blocks;
        let stuck = (0..self.geo.banks).find(|&b| {
            let state = &self.banks[b as usize];
            !state.halted && (state.gc.state() != GcState::Idle || state.clean.len() < min_clean)
        });
        let bank = stuck.unwrap_or(0);
        Err(self.fatal(bank, FtlError::GcStalled(bank)))
    }

    /// Advance in-flight sessions of the banks sharing `bank`'s column by
    /// one step each, skipping busy banks.
    pub fn background_step(&mut self, bank: u32) -> Result<(), FtlError> {
        let channels = self.geo.channels;
        let first = bank / channels * channels;
        for b in first..first + channels {
            if self.banks[b as usize].halted || self.flash.is_bank_busy(b) {
                continue;
            }
            match self.banks[b as usize].gc.state() {
                GcState::Idle => {}
                GcState::Read => {
                    self.read_step(b, true)?;
                }
                GcState::Write => {
                    self.write_step(b)?;
                }
            }
        }
        Ok(())
    }

    /// Advance `bank`'s session: a read step scans up to the next page with
    /// live chunks, a write step relocates them.
    pub fn gc_step(&mut self, bank: u32) -> Result<GcStep, FtlError> {
        match self.banks[bank as usize].gc.state() {
            GcState::Idle => Ok(GcStep::Done),
            _ if self.flash.is_bank_busy(bank) => Ok(GcStep::Blocked),
            GcState::Read => self.read_step(bank, false),
            GcState::Write => self.write_step(bank),
        }
    }

    /// `bank` plus, for every other channel, the first bank in the same
    /// column order that is short of clean blocks.
    fn select_gc_banks(&self, bank: u32) -> Vec<u32> {
        let channels = self.geo.channels;
        let banks = self.geo.banks;
        let column = bank / channels;
        let mut group = Vec::with_capacity(channels as usize);

        for channel in 0..channels {
            if channel == bank % channels {
                group.push(bank);
                continue;
            }
            let mut b = column * channels + channel;
            for _ in column..self.geo.columns() {
                let state = &self.banks[b as usize];
                if !state.halted && state.clean.len() < self.tuning.background_gc_threshold {
                    group.push(b);
                    break;
                }
                b = (b + channels) % banks;
            }
        }
        group
    }

    fn gc_round_limit(&self) -> u64 {
        16 * u64::from(self.geo.pages_per_block + 2)
    }
}

// ///////////////////////////////////////////////////////////////////////
// Session steps
// ///////////////////////////////////////////////////////////////////////

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Pick a victim and open a session. Returns `false` if `bank` has
    /// nothing to collect.
    pub(crate) fn init_gc(&mut self, bank: u32) -> Result<bool, FtlError> {
        let state = &mut self.banks[bank as usize];
        let pick = match (state.cold_heap.peek(), state.second_usage.peek()) {
            (None, None) => return Ok(false),
            (Some(cold), None) => (cold, HeapKind::Cold),
            (None, Some(second)) => (second, HeapKind::SecondUsage),
            (Some(cold), Some(second)) => {
                if u64::from(cold.1) <= state.adaptive.scaled_second(second.1) {
                    (cold, HeapKind::Cold)
                } else {
                    (second, HeapKind::SecondUsage)
                }
            }
        };
        let ((victim, valid), heap) = pick;
        state.adaptive.record(valid);
        self.stats.gc_victims += 1;
        debug!(bank, victim, valid, ?heap, "gc victim selected");

        if valid == 0 {
            self.reclaim_block(bank, victim)?;
            return Ok(true);
        }

        let sectors = self.geo.list_sectors();
        let mut page = vec![0xFF; (sectors * self.geo.bytes_per_sector) as usize];
        let victim_pbn = self.pbn(victim);
        self.flash.page_read(
            bank,
            victim_pbn,
            self.geo.list_page(),
            0,
            sectors,
            &mut page,
            IoMode::WaitForCompletion,
        )?;
        let mut list = self.empty_list();
        read_back_pointers(&page, &mut list);

        self.banks[bank as usize].gc.session = Some(GcSession {
            phase: GcState::Read,
            victim,
            victim_pbn,
            expected: valid,
            tally: 0,
            page: 0,
            recycled_page: false,
            live: vec![None; self.geo.chunks_per_page() as usize],
            n_live: 0,
            list,
        });
        Ok(true)
    }

    /// Scan victim pages until one has live chunks and load it. With
    /// `single`, examine one page only.
    pub(crate) fn read_step(&mut self, bank: u32, single: bool) -> Result<GcStep, FtlError> {
        let cpp = self.geo.chunks_per_page() as usize;
        let crp = self.geo.chunks_per_recycled_page as usize;
        let data_pages = self.geo.last_data_page() + 1;
        let spp = self.geo.sectors_per_page;

        loop {
            let Some(s) = self.banks[bank as usize].gc.session.as_mut() else {
                return Ok(GcStep::Done);
            };
            if s.page >= data_pages {
                return self.finish_victim(bank);
            }

            let (victim, page) = (s.victim, s.page);
            let entries = &s.list[page as usize * cpp..][..cpp];
            let recycled = entries.iter().any(|e| matches!(e, BackPointer::Recycled(_)));
            let mixed = recycled
                && entries
                    .iter()
                    .enumerate()
                    .any(|(i, e)| matches!(e, BackPointer::Plain(_)) || (i >= crp && *e != BackPointer::Empty));
            if mixed {
                let detail = format!("victim {victim} page {page} mixes recycled and plain back-pointers");
                return Err(self.fatal(bank, FtlError::Corruption { bank, detail }));
            }

            let encoding = if recycled { Encoding::Recycled } else { Encoding::Plain };
            s.recycled_page = recycled;
            s.n_live = 0;
            for (offset, entry) in entries.iter().enumerate() {
                s.live[offset] = entry.lpn().and_then(|lpn| {
                    let here = ChunkAddr::flash(bank, victim, page, offset as u32, encoding);
                    self.map.find(lpn, here).map(|chunk_idx| GcChunk { lpn, chunk_idx })
                });
                if s.live[offset].is_some() {
                    s.n_live += 1;
                }
            }
            s.tally += s.n_live;

            if s.n_live > 0 {
                s.phase = GcState::Write;
                let pbn = s.victim_pbn;
                if recycled {
                    self.read_recycled_page(bank, victim, page)?;
                    let state = &mut self.banks[bank as usize];
                    let n = self.decoded.len();
                    state.gc.scratch[..n].copy_from_slice(&self.decoded);
                } else {
                    let state = &mut self.banks[bank as usize];
                    self.flash
                        .page_read(bank, pbn, page, 0, spp, &mut state.gc.scratch, IoMode::IssueOnly)?;
                }
                trace!(bank, victim, page, recycled, "victim page loaded");
                return Ok(GcStep::Continue);
            }

            s.page += 1;
            if single {
                return Ok(GcStep::Continue);
            }
        }
    }

    /// Move the live chunks of the loaded victim page to the cold log.
    pub(crate) fn write_step(&mut self, bank: u32) -> Result<GcStep, FtlError> {
        let cpp = self.geo.chunks_per_page();
        let Some(s) = self.banks[bank as usize].gc.session.as_mut() else {
            return Ok(GcStep::Done);
        };
        let (victim, page) = (s.victim, s.page);

        if s.n_live == cpp {
            let mut intact = true;
            for offset in 0..cpp {
                let here = ChunkAddr::flash(bank, victim, page, offset, Encoding::Plain);
                let current = s.live[offset as usize].map(|c| self.map.get(c.lpn, c.chunk_idx));
                if current != Some(here) {
                    s.live[offset as usize] = None;
                    s.n_live -= 1;
                    s.tally = s.tally.saturating_sub(1);
                    self.stats.gc_dropped_races += 1;
                    intact = false;
                    break;
                }
            }
            if intact {
                return self.copy_victim_page(bank);
            }
        }

        loop {
            let Some(s) = self.banks[bank as usize].gc.session.as_mut() else {
                return Ok(GcStep::Continue);
            };
            if s.phase != GcState::Write {
                break;
            }
            let Some(offset) = s.live.iter().position(Option::is_some) else {
                break;
            };
            let Some(c) = s.live[offset].take() else {
                break;
            };
            s.n_live -= 1;

            let encoding = if s.recycled_page { Encoding::Recycled } else { Encoding::Plain };
            let here = ChunkAddr::flash(bank, s.victim, s.page, offset as u32, encoding);
            if self.map.get(c.lpn, c.chunk_idx) != here {
                s.tally = s.tally.saturating_sub(1);
                self.stats.gc_dropped_races += 1;
                trace!(bank, lpn = c.lpn, chunk = c.chunk_idx, "victim chunk overwritten before relocation");
                continue;
            }
            self.relocate_chunk(bank, c.lpn, c.chunk_idx, RelocSource::GcScratch(offset as u32))?;
        }

        if let Some(s) = self.banks[bank as usize].gc.session.as_mut() {
            if s.phase == GcState::Write {
                s.phase = GcState::Read;
                s.page += 1;
            }
        }
        Ok(GcStep::Continue)
    }

    /// Program a fully live victim page at the cold cursor in one go.
    fn copy_victim_page(&mut self, bank: u32) -> Result<GcStep, FtlError> {
        let spp = self.geo.sectors_per_page;
        let state = &mut self.banks[bank as usize];
        let (lbn, page) = (state.cold.lbn(), state.cold.page());
        let Some(s) = state.gc.session.as_mut() else {
            return Ok(GcStep::Done);
        };
        let moved: Vec<GcChunk> = s.live.iter_mut().filter_map(Option::take).collect();
        s.n_live = 0;
        s.phase = GcState::Read;
        s.page += 1;

        let pbn = self.geo.reserved_blocks_per_bank + lbn;
        self.flash
            .page_program(bank, pbn, page, 0, spp, &state.gc.scratch, IoMode::IssueOnly)?;

        for (offset, c) in moved.iter().enumerate() {
            let i = self.list_index(page, offset as u32);
            self.banks[bank as usize].cold.back_pointers[i] = BackPointer::Plain(c.lpn);
            self.remap(c.lpn, c.chunk_idx, ChunkAddr::flash(bank, lbn, page, offset as u32, Encoding::Plain));
        }
        self.stats.gc_relocated_chunks += moved.len() as u64;
        self.stats.gc_page_copies += 1;
        self.increase_lpn(bank, LogKind::Cold)?;
        Ok(GcStep::Continue)
    }

    /// The list is exhausted: check the books and erase the victim.
    fn finish_victim(&mut self, bank: u32) -> Result<GcStep, FtlError> {
        let Some(s) = self.banks[bank as usize].gc.session.as_ref() else {
            return Ok(GcStep::Done);
        };
        let (victim, tally, expected) = (s.victim, s.tally, s.expected);
        if tally != expected {
            return Err(self.fatal(bank, FtlError::ValidChunkMismatch { bank, lbn: victim, found: tally, expected }));
        }
        self.reclaim_block(bank, victim)?;
        Ok(GcStep::Done)
    }

    /// Erase a block without valid chunks and return it to the clean list.
    fn reclaim_block(&mut self, bank: u32, lbn: u32) -> Result<(), FtlError> {
        let left = self.banks[bank as usize].valid[lbn as usize];
        if left != 0 {
            return Err(self.fatal(bank, FtlError::ValidChunkMismatch { bank, lbn, found: left, expected: 0 }));
        }

        let state = &mut self.banks[bank as usize];
        state.gc.session = None;
        for kind in [HeapKind::FirstUsage, HeapKind::SecondUsage, HeapKind::Cold] {
            state.heap_mut(kind).remove(lbn);
        }
        let pbn = self.geo.reserved_blocks_per_bank + lbn;
        self.flash.block_erase(bank, pbn)?;
        state.clean.push(lbn);

        self.stats.blocks_erased += 1;
        self.stats.gc_cycles += 1;
        debug!(bank, lbn, clean = self.banks[bank as usize].clean.len(), "victim erased");
        Ok(())
    }
}
