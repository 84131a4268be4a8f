//! Log controllers and the placement of log pages.
//!
//! Each bank has a hot and a cold [`LogController`]. A controller owns a
//! page-sized staging buffer, a cursor into its current log block and the
//! block's back-pointer list, which is written to the block's list page when
//! the block fills up.
//!
//! Hot blocks are written twice. The first pass fills page 0 and the odd
//! (low) pages up to `P-5` and stores the list in `P-3`. When clean blocks
//! run short, a first-usage block is taken back: the second pass fills the
//! even (high) pages and reprograms low pages whose content has gone stale
//! with a smaller, encoded payload. Its list lands in `P-1`.

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::adaptive::{greedy_should_reuse, Candidates};
use crate::address::{read_back_pointers, write_back_pointers, BackPointer, ChunkAddr, Encoding, LogKind};
use crate::config::{Geometry, ReuseStrategy};
use crate::ftl::FlashTranslationLayer;
use crate::gc::GcState;
use crate::heap::HeapKind;
use crate::host::HostBufferRing;
use crate::nand::{FlashDevice, IoMode};
use crate::write::RelocSource;
use crate::FtlError;

bitflags! {
    /// State bits of a log controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlFlags: u8 {
        /// No staged chunk has been superseded since the last flush.
        const ALL_CHUNKS_VALID = 0b001;
        /// The cursor page is a low page being reprogrammed.
        const RECYCLED_PAGE = 0b010;
        /// The prior content of the next low page is in the precache buffer.
        const PRECACHE_DONE = 0b100;
    }
}

/// How a controller advances through its current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStrategy {
    /// Page 0, then odd pages up to `P-5`.
    FirstUsageHot,
    /// Even pages up to `P-2`, plus reusable low pages.
    SecondUsageHot,
    /// Pages `0..=P-2` of a clean block.
    ColdFresh,
    /// Even pages `2..=P-2` of a first-usage block.
    ColdReused,
}

/// Owner of a staging slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedChunk {
    pub lpn: u32,
    pub chunk_idx: u32,
}

#[derive(Debug)]
pub struct LogController {
    pub(crate) kind: LogKind,
    pub(crate) strategy: LogStrategy,
    pages_per_block: u32,
    /// Cursor: `lbn * pages_per_block + page`.
    pub(crate) log_lpn: u32,
    /// Next free staging slot.
    pub(crate) chunk_ptr: u32,
    pub(crate) slots: Vec<Option<StagedChunk>>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) back_pointers: Vec<BackPointer>,
    pub(crate) flags: CtrlFlags,
    /// Low page prepared for reprogramming, if any.
    pub(crate) next_low_page: Option<u32>,
}

impl LogController {
    pub(crate) fn new(kind: LogKind, geo: &Geometry) -> Self {
        LogController {
            kind,
            strategy: match kind {
                LogKind::Hot => LogStrategy::FirstUsageHot,
                LogKind::Cold => LogStrategy::ColdFresh,
            },
            pages_per_block: geo.pages_per_block,
            log_lpn: 0,
            chunk_ptr: 0,
            slots: vec![None; geo.chunks_per_page() as usize],
            buffer: vec![0xFF; geo.bytes_per_page()],
            back_pointers: vec![BackPointer::Empty; geo.chunks_per_block() as usize],
            flags: CtrlFlags::ALL_CHUNKS_VALID | CtrlFlags::PRECACHE_DONE,
            next_low_page: None,
        }
    }

    /// Point the cursor at `page` of a newly assigned block.
    ///
    /// Staged chunks are kept; they go to whichever page the cursor is on
    /// when the buffer fills.
    pub(crate) fn start_block(&mut self, lbn: u32, page: u32, strategy: LogStrategy) {
        self.strategy = strategy;
        self.log_lpn = lbn * self.pages_per_block + page;
        self.flags.remove(CtrlFlags::RECYCLED_PAGE);
        self.flags.insert(CtrlFlags::PRECACHE_DONE);
        self.next_low_page = None;
        self.back_pointers.fill(BackPointer::Empty);
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn strategy(&self) -> LogStrategy {
        self.strategy
    }

    pub fn log_lpn(&self) -> u32 {
        self.log_lpn
    }

    pub fn lbn(&self) -> u32 {
        self.log_lpn / self.pages_per_block
    }

    pub fn page(&self) -> u32 {
        self.log_lpn % self.pages_per_block
    }

    pub fn chunk_ptr(&self) -> u32 {
        self.chunk_ptr
    }

    pub fn flags(&self) -> CtrlFlags {
        self.flags
    }

    pub fn next_low_page(&self) -> Option<u32> {
        self.next_low_page
    }

    /// Is the cursor on a low page being reprogrammed?
    pub fn recycled(&self) -> bool {
        self.flags.contains(CtrlFlags::RECYCLED_PAGE)
    }

    /// Occupied staging slots.
    pub fn staged(&self) -> impl Iterator<Item = (u32, StagedChunk)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| s.map(|s| (slot as u32, s)))
    }

    pub(crate) fn slot_bytes(&self, slot: u32, bytes_per_chunk: usize) -> &[u8] {
        let start = slot as usize * bytes_per_chunk;
        &self.buffer[start..start + bytes_per_chunk]
    }

    pub(crate) fn slot_bytes_mut(&mut self, slot: u32, bytes_per_chunk: usize) -> &mut [u8] {
        let start = slot as usize * bytes_per_chunk;
        &mut self.buffer[start..start + bytes_per_chunk]
    }
}

/// Who wants a first-usage block back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReusePurpose {
    Hot,
    Cold,
    /// The cold log rolled over while collection relocates into it.
    Collection,
}

// ///////////////////////////////////////////////////////////////////////
// Cursor movement and block rollover
// ///////////////////////////////////////////////////////////////////////

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Advance a log's cursor past the page just programmed, finishing the
    /// block and drawing a new one when it is full.
    pub(crate) fn increase_lpn(&mut self, bank: u32, log: LogKind) -> Result<(), FtlError> {
        let last_data = self.geo.last_data_page();
        let first_last = self.geo.first_usage_last_page();
        let ctrl = self.banks[bank as usize].log_mut(log);
        let page = ctrl.page();
        let strategy = ctrl.strategy;

        match strategy {
            LogStrategy::FirstUsageHot if page == first_last => {
                self.finish_block(bank, log, self.geo.first_usage_list_page(), HeapKind::FirstUsage)?;
                self.find_new_lpn_for_hot_log(bank)
            }
            LogStrategy::FirstUsageHot => {
                ctrl.log_lpn += if page == 0 { 1 } else { 2 };
                Ok(())
            }
            LogStrategy::SecondUsageHot => self.increase_second_usage(bank),
            LogStrategy::ColdFresh | LogStrategy::ColdReused if page == last_data => {
                self.finish_block(bank, log, self.geo.list_page(), HeapKind::Cold)?;
                self.find_new_lpn_for_cold_log(bank)
            }
            LogStrategy::ColdFresh => {
                ctrl.log_lpn += 1;
                Ok(())
            }
            LogStrategy::ColdReused => {
                ctrl.log_lpn += 2;
                Ok(())
            }
        }
    }

    fn increase_second_usage(&mut self, bank: u32) -> Result<(), FtlError> {
        let last_data = self.geo.last_data_page();
        let hot = &mut self.banks[bank as usize].hot;
        let page = hot.page();

        if page == last_data {
            self.finish_block(bank, LogKind::Hot, self.geo.list_page(), HeapKind::SecondUsage)?;
            return self.find_new_lpn_for_hot_log(bank);
        }

        hot.log_lpn += 1;
        let page = page + 1;
        if page % 2 == 1 {
            if hot.next_low_page == Some(page) {
                hot.flags.insert(CtrlFlags::RECYCLED_PAGE);
                return Ok(());
            }
            if page == 1 && self.can_reuse_low_page(bank, 1)? {
                let hot = &mut self.banks[bank as usize].hot;
                hot.next_low_page = Some(1);
                hot.flags.insert(CtrlFlags::RECYCLED_PAGE);
                hot.flags.remove(CtrlFlags::PRECACHE_DONE);
                return Ok(());
            }
            // Low page still holds live data: write the next high page.
            let hot = &mut self.banks[bank as usize].hot;
            hot.flags.remove(CtrlFlags::RECYCLED_PAGE);
            hot.log_lpn += 1;
            self.prepare_low_page(bank, page + 2)
        } else {
            hot.flags.remove(CtrlFlags::RECYCLED_PAGE);
            self.prepare_low_page(bank, page + 1)
        }
    }

    /// Decide whether the low page after the cursor will be reprogrammed.
    fn prepare_low_page(&mut self, bank: u32, page: u32) -> Result<(), FtlError> {
        let reusable = page < self.geo.last_data_page() && self.can_reuse_low_page(bank, page)?;
        let hot = &mut self.banks[bank as usize].hot;
        if reusable {
            hot.next_low_page = Some(page);
            hot.flags.remove(CtrlFlags::PRECACHE_DONE);
        } else {
            hot.next_low_page = None;
        }
        Ok(())
    }

    /// Serialize the back-pointer list into `list_page` and hand the block
    /// to `heap`.
    pub(crate) fn finish_block(&mut self, bank: u32, log: LogKind, list_page: u32, heap: HeapKind) -> Result<(), FtlError> {
        let sectors = self.geo.list_sectors();
        let mut page = vec![0xFF; (sectors * self.geo.bytes_per_sector) as usize];

        let state = &mut self.banks[bank as usize];
        let ctrl = state.log_mut(log);
        let lbn = ctrl.lbn();
        write_back_pointers(&mut page, &ctrl.back_pointers);
        ctrl.back_pointers.fill(BackPointer::Empty);

        let pbn = self.geo.reserved_blocks_per_bank + lbn;
        self.flash.page_program(bank, pbn, list_page, 0, sectors, &page, IoMode::IssueOnly)?;

        let valid = state.valid[lbn as usize];
        state.heap_mut(heap).insert(lbn, valid);
        debug!(bank, lbn, valid, ?heap, "log block completed");
        Ok(())
    }

    /// Load a completed block's back-pointer list into a controller.
    fn load_back_pointers(&mut self, bank: u32, log: LogKind, lbn: u32, list_page: u32) -> Result<(), FtlError> {
        let sectors = self.geo.list_sectors();
        let mut page = vec![0xFF; (sectors * self.geo.bytes_per_sector) as usize];
        let pbn = self.pbn(lbn);
        self.flash
            .page_read(bank, pbn, list_page, 0, sectors, &mut page, IoMode::WaitForCompletion)?;
        read_back_pointers(&page, &mut self.banks[bank as usize].log_mut(log).back_pointers);
        Ok(())
    }

    pub(crate) fn find_new_lpn_for_hot_log(&mut self, bank: u32) -> Result<(), FtlError> {
        let state = &mut self.banks[bank as usize];
        if state.clean.len() > self.tuning.min_clean_blocks {
            if let Some(lbn) = state.clean.pop() {
                state.hot.start_block(lbn, 0, LogStrategy::FirstUsageHot);
                debug!(bank, lbn, "hot log takes a clean block");
                return Ok(());
            }
        }

        if let Some(lbn) = self.take_first_usage_block(bank, ReusePurpose::Hot) {
            self.banks[bank as usize].hot.start_block(lbn, 0, LogStrategy::SecondUsageHot);
            self.load_back_pointers(bank, LogKind::Hot, lbn, self.geo.first_usage_list_page())?;
            self.stats.hot_block_reuses += 1;

            for page in [0, 1] {
                if page == 1 {
                    self.banks[bank as usize].hot.log_lpn += 1;
                }
                if self.can_reuse_low_page(bank, page)? {
                    let hot = &mut self.banks[bank as usize].hot;
                    hot.next_low_page = Some(page);
                    hot.flags.insert(CtrlFlags::RECYCLED_PAGE);
                    hot.flags.remove(CtrlFlags::PRECACHE_DONE);
                    return self.precache_low_page(bank);
                }
            }

            let hot = &mut self.banks[bank as usize].hot;
            hot.flags.remove(CtrlFlags::RECYCLED_PAGE);
            hot.next_low_page = None;
            return self.increase_second_usage(bank);
        }

        let lbn = self.acquire_clean_block(bank)?;
        self.banks[bank as usize].hot.start_block(lbn, 0, LogStrategy::FirstUsageHot);
        debug!(bank, lbn, "hot log takes a clean block");
        self.collect_until_clean(bank, self.tuning.clean_blocks_after_gc_hot)
    }

    pub(crate) fn find_new_lpn_for_cold_log(&mut self, bank: u32) -> Result<(), FtlError> {
        let collecting = self.banks[bank as usize].gc.state() != GcState::Idle;
        let state = &mut self.banks[bank as usize];
        if state.clean.len() > self.tuning.min_clean_blocks {
            if let Some(lbn) = state.clean.pop() {
                state.cold.start_block(lbn, 0, LogStrategy::ColdFresh);
                debug!(bank, lbn, "cold log takes a clean block");
                return Ok(());
            }
        }

        if self.tuning.reuse_blocks_for_cold {
            let purpose = if collecting { ReusePurpose::Collection } else { ReusePurpose::Cold };
            if let Some(lbn) = self.take_first_usage_block(bank, purpose) {
                self.banks[bank as usize].cold.start_block(lbn, 2, LogStrategy::ColdReused);
                self.load_back_pointers(bank, LogKind::Cold, lbn, self.geo.first_usage_list_page())?;
                self.stats.cold_block_reuses += 1;
                return Ok(());
            }
        }

        // Relocations of a running collection must not start another one:
        // dip into the reserve and let the running collection refill it.
        if collecting {
            let Some(lbn) = self.banks[bank as usize].clean.pop() else {
                return Err(self.fatal(bank, FtlError::OutOfSpace(bank)));
            };
            self.banks[bank as usize].cold.start_block(lbn, 0, LogStrategy::ColdFresh);
            debug!(bank, lbn, "cold log takes a reserve block during collection");
            return Ok(());
        }

        let lbn = self.acquire_clean_block(bank)?;
        self.banks[bank as usize].cold.start_block(lbn, 0, LogStrategy::ColdFresh);
        debug!(bank, lbn, "cold log takes a clean block");
        self.collect_until_clean(bank, self.tuning.min_clean_blocks)
    }

    /// Remove and return the best first-usage block if it should be reused.
    fn take_first_usage_block(&mut self, bank: u32, purpose: ReusePurpose) -> Option<u32> {
        if !self.reuse_condition(bank, purpose) {
            return None;
        }
        let state = &mut self.banks[bank as usize];
        let (lbn, valid) = state.first_usage.peek()?;
        state.first_usage.remove(lbn);
        debug!(bank, lbn, valid, ?purpose, "reusing first-usage block");
        Some(lbn)
    }

    fn reuse_condition(&mut self, bank: u32, purpose: ReusePurpose) -> bool {
        let capacity = (self.geo.last_data_page() + 1) * self.geo.chunks_per_page();
        let state = &mut self.banks[bank as usize];
        if state.first_usage.is_empty() {
            return false;
        }
        if purpose == ReusePurpose::Collection {
            return true;
        }

        let c = Candidates {
            first_best: state.first_usage.best_valid(),
            first_len: state.first_usage.len(),
            second_best: state.second_usage.best_valid(),
            cold_best: state.cold_heap.best_valid(),
        };
        let reuse = match self.tuning.reuse_strategy {
            ReuseStrategy::Adaptive => state.adaptive.should_reuse(c),
            ReuseStrategy::Greedy => greedy_should_reuse(c, purpose == ReusePurpose::Hot),
        };

        // Collecting the best victim frees no room when its live chunks fill
        // a whole cold block, or when there is no victim at all.
        let gc_best = c.second_best.into_iter().chain(c.cold_best).min();
        let no_gain = gc_best.map_or(true, |valid| valid >= capacity);
        let below_reserve = state.clean.len() < self.tuning.min_clean_blocks;
        if !reuse && (no_gain || below_reserve) {
            debug!(bank, ?purpose, ?gc_best, clean = state.clean.len(), "collection cannot keep up, reusing");
        }
        reuse || no_gain || below_reserve
    }

    /// Pop a clean block, collecting garbage until one is available.
    pub(crate) fn acquire_clean_block(&mut self, bank: u32) -> Result<u32, FtlError> {
        for _ in 0..=self.geo.log_blocks_per_bank {
            if let Some(lbn) = self.banks[bank as usize].clean.pop() {
                return Ok(lbn);
            }
            self.run_garbage_collection(bank)?;
        }
        Err(self.fatal(bank, FtlError::OutOfSpace(bank)))
    }

    fn collect_until_clean(&mut self, bank: u32, target: u32) -> Result<(), FtlError> {
        let mut rounds = 0;
        while self.banks[bank as usize].clean.len() < target {
            if rounds > 2 * self.geo.log_blocks_per_bank {
                return Err(self.fatal(bank, FtlError::OutOfSpace(bank)));
            }
            self.run_garbage_collection(bank)?;
            rounds += 1;
        }
        Ok(())
    }
}

// ///////////////////////////////////////////////////////////////////////
// Low-page reuse
// ///////////////////////////////////////////////////////////////////////

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Can low `page` of the hot block be reprogrammed?
    ///
    /// A page with no live chunks qualifies at once. A page with fewer live
    /// chunks than the configured threshold qualifies after its chunks are
    /// moved to the cold log.
    pub(crate) fn can_reuse_low_page(&mut self, bank: u32, page: u32) -> Result<bool, FtlError> {
        let cpp = self.geo.chunks_per_page();
        let lbn = self.banks[bank as usize].hot.lbn();
        let base = self.list_index(page, 0);

        let mut live = Vec::new();
        for offset in 0..cpp {
            let entry = self.banks[bank as usize].hot.back_pointers[base + offset as usize];
            let Some(lpn) = entry.lpn() else { continue };
            let here = ChunkAddr::flash(bank, lbn, page, offset, Encoding::Plain);
            if let Some(chunk_idx) = self.map.find(lpn, here) {
                live.push((offset, lpn, chunk_idx));
            }
        }

        if !live.is_empty() {
            if live.len() as u32 >= self.tuning.valid_chunks_in_page_to_reuse_threshold {
                return Ok(false);
            }

            let pbn = self.pbn(lbn);
            let spp = self.geo.sectors_per_page;
            self.flash.page_read(
                bank,
                pbn,
                page,
                0,
                spp,
                &mut self.banks[bank as usize].precache,
                IoMode::WaitForCompletion,
            )?;
            for &(offset, lpn, chunk_idx) in &live {
                let here = ChunkAddr::flash(bank, lbn, page, offset, Encoding::Plain);
                if self.map.get(lpn, chunk_idx) == here {
                    self.relocate_chunk(bank, lpn, chunk_idx, RelocSource::Precache(offset))?;
                }
            }
            self.stats.low_page_relocations += live.len() as u64;
        }

        let hot = &mut self.banks[bank as usize].hot;
        hot.back_pointers[base..base + cpp as usize].fill(BackPointer::Empty);
        self.stats.low_pages_reused += 1;
        trace!(bank, lbn, page, relocated = live.len(), "low page reusable");
        Ok(true)
    }

    /// Read the prior content of the prepared low page.
    pub(crate) fn precache_low_page(&mut self, bank: u32) -> Result<(), FtlError> {
        let hot = &self.banks[bank as usize].hot;
        let Some(page) = hot.next_low_page else {
            return Ok(());
        };
        let pbn = self.pbn(hot.lbn());
        let spp = self.geo.sectors_per_page;
        let state = &mut self.banks[bank as usize];
        self.flash
            .page_read(bank, pbn, page, 0, spp, &mut state.precache, IoMode::IssueOnly)?;
        state.hot.flags.insert(CtrlFlags::PRECACHE_DONE);
        Ok(())
    }

    /// Cursor page for a full-page write.
    ///
    /// A full page cannot go to a recycled low page, so a prepared recycled
    /// page is passed over.
    pub(crate) fn lpn_for_complete_page(&mut self, bank: u32, log: LogKind) -> u32 {
        let ctrl = self.banks[bank as usize].log_mut(log);
        if ctrl.recycled() {
            ctrl.log_lpn += if ctrl.page() == 0 { 2 } else { 1 };
            ctrl.flags.remove(CtrlFlags::RECYCLED_PAGE);
            ctrl.flags.insert(CtrlFlags::PRECACHE_DONE);
            ctrl.next_low_page = None;
            self.stats.recycled_pages_skipped += 1;
        }
        ctrl.log_lpn
    }
}
