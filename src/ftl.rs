//! The translation-layer context: chunk map, per-bank log state and the
//! valid-chunk accounting that ties them together.

use tracing::{error, info};

use crate::adaptive::AdaptiveThreshold;
use crate::address::{BackPointer, ChunkAddr, FlashChunk, LogKind};
use crate::chunk_map::ChunkMap;
use crate::clean_list::CleanList;
use crate::codec::{PageCodec, PassthroughCodec};
use crate::config::{FtlConfig, Geometry, Tuning};
use crate::gc::{GcEngine, GcState};
use crate::heap::{HeapKind, VictimHeap};
use crate::host::{HostBufferRing, NoBackPressure};
use crate::log::{CtrlFlags, LogController, LogStrategy, StagedChunk};
use crate::nand::FlashDevice;
use crate::wom::WomFaults;
use crate::FtlError;

/// Running counters of the FTL's internal activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FtlStats {
    pub host_sectors_written: u64,
    pub host_sectors_read: u64,
    pub full_page_writes: u64,
    /// Staging buffers programmed as ordinary pages.
    pub flushes: u64,
    pub recycled_pages_programmed: u64,
    /// Prepared recycled pages passed over by a full-page write.
    pub recycled_pages_skipped: u64,
    /// Low pages found reusable during a second hot pass.
    pub low_pages_reused: u64,
    /// Chunks moved out of nearly empty low pages to make them reusable.
    pub low_page_relocations: u64,
    pub hot_block_reuses: u64,
    pub cold_block_reuses: u64,
    pub gc_victims: u64,
    pub gc_cycles: u64,
    pub gc_relocated_chunks: u64,
    /// Whole victim pages copied without staging.
    pub gc_page_copies: u64,
    /// Victim chunks that turned stale between the scan and the copy.
    pub gc_dropped_races: u64,
    pub blocks_erased: u64,
    pub wom_fallbacks: u64,
    pub dram_absorbed_sectors: u64,
    pub consolidations: u64,
}

/// Everything one bank owns.
pub(crate) struct BankState {
    pub(crate) hot: LogController,
    pub(crate) cold: LogController,
    pub(crate) clean: CleanList,
    pub(crate) first_usage: VictimHeap,
    pub(crate) second_usage: VictimHeap,
    pub(crate) cold_heap: VictimHeap,
    /// Valid chunks per log block, counting flash copies only.
    pub(crate) valid: Vec<u32>,
    pub(crate) adaptive: AdaptiveThreshold,
    pub(crate) gc: GcEngine,
    /// Prior content of the low page the hot log reprograms next.
    pub(crate) precache: Vec<u8>,
    pub(crate) halted: bool,
}

impl BankState {
    fn new(geo: &Geometry, tuning: &Tuning) -> Self {
        BankState {
            hot: LogController::new(LogKind::Hot, geo),
            cold: LogController::new(LogKind::Cold, geo),
            clean: CleanList::seeded(geo.log_blocks_per_bank),
            first_usage: VictimHeap::new(geo.log_blocks_per_bank),
            second_usage: VictimHeap::new(geo.log_blocks_per_bank),
            cold_heap: VictimHeap::new(geo.log_blocks_per_bank),
            valid: vec![0; geo.log_blocks_per_bank as usize],
            adaptive: AdaptiveThreshold::new(tuning),
            gc: GcEngine::new(geo),
            precache: vec![0xFF; geo.bytes_per_page()],
            halted: false,
        }
    }

    pub(crate) fn log(&self, kind: LogKind) -> &LogController {
        match kind {
            LogKind::Hot => &self.hot,
            LogKind::Cold => &self.cold,
        }
    }

    pub(crate) fn log_mut(&mut self, kind: LogKind) -> &mut LogController {
        match kind {
            LogKind::Hot => &mut self.hot,
            LogKind::Cold => &mut self.cold,
        }
    }

    pub(crate) fn heap(&self, kind: HeapKind) -> &VictimHeap {
        match kind {
            HeapKind::FirstUsage => &self.first_usage,
            HeapKind::SecondUsage => &self.second_usage,
            HeapKind::Cold => &self.cold_heap,
        }
    }

    pub(crate) fn heap_mut(&mut self, kind: HeapKind) -> &mut VictimHeap {
        match kind {
            HeapKind::FirstUsage => &mut self.first_usage,
            HeapKind::SecondUsage => &mut self.second_usage,
            HeapKind::Cold => &mut self.cold_heap,
        }
    }
}

/// A chunk-mapped FTL over a multi-bank flash array.
///
/// `F` drives the flash, `H` gates sub-page writes on the host buffer ring.
/// All state is owned here; the caller serializes access.
pub struct FlashTranslationLayer<F: FlashDevice, H: HostBufferRing = NoBackPressure> {
    pub(crate) geo: Geometry,
    pub(crate) tuning: Tuning,
    pub(crate) flash: F,
    pub(crate) host: H,
    pub(crate) codec: Box<dyn PageCodec>,
    pub(crate) map: ChunkMap,
    pub(crate) banks: Vec<BankState>,

    /// Page assembled by a read or a consolidation.
    pub(crate) assembly: Vec<u8>,
    /// Raw page content, mostly encoded pages on their way to the codec.
    pub(crate) page_scratch: Vec<u8>,
    /// Decoded payload of a recycled page.
    pub(crate) decoded: Vec<u8>,

    pub(crate) wom: Option<WomFaults>,
    pub(crate) stats: FtlStats,
}

// ///////////////////////////////////////////////////////////////////////
// Construction
// ///////////////////////////////////////////////////////////////////////

impl<F: FlashDevice> FlashTranslationLayer<F> {
    /// Build an FTL with no host back-pressure.
    pub fn new(config: FtlConfig, flash: F) -> Result<Self, FtlError> {
        Self::with_host(config, flash, NoBackPressure)
    }
}

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Build an FTL whose sub-page writes wait on `host`.
    pub fn with_host(config: FtlConfig, flash: F, host: H) -> Result<Self, FtlError> {
        config.validate()?;
        let FtlConfig { geometry: geo, tuning } = config;

        let mut ftl = FlashTranslationLayer {
            map: ChunkMap::new(geo.logical_pages, geo.chunks_per_page()),
            banks: (0..geo.banks).map(|_| BankState::new(&geo, &tuning)).collect(),
            assembly: vec![0xFF; geo.bytes_per_page()],
            page_scratch: vec![0xFF; geo.bytes_per_page()],
            decoded: vec![0xFF; geo.chunks_per_recycled_page as usize * geo.bytes_per_chunk()],
            wom: None,
            stats: FtlStats::default(),
            codec: Box::new(PassthroughCodec),
            geo,
            tuning,
            flash,
            host,
        };
        ftl.initialize_log_subsystem()?;
        Ok(ftl)
    }

    /// Replace the recycled-page codec.
    pub fn with_codec(mut self, codec: impl PageCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// Return every bank to its power-on state: all log blocks erased and
    /// clean, one taken by each log, empty heaps and an empty chunk map.
    pub fn initialize_log_subsystem(&mut self) -> Result<(), FtlError> {
        for bank in 0..self.geo.banks {
            for lbn in 0..self.geo.log_blocks_per_bank {
                self.flash.block_erase(bank, self.pbn(lbn))?;
            }
        }

        self.map.reset();
        self.banks = (0..self.geo.banks).map(|_| BankState::new(&self.geo, &self.tuning)).collect();
        self.wom = self.tuning.wom_fault.map(WomFaults::new);
        self.stats = FtlStats::default();

        for state in &mut self.banks {
            // Freshly seeded: two pops cannot fail.
            let hot = state.clean.pop().unwrap_or(0);
            let cold = state.clean.pop().unwrap_or(1);
            state.hot.start_block(hot, 0, LogStrategy::FirstUsageHot);
            state.cold.start_block(cold, 0, LogStrategy::ColdFresh);
        }

        info!(
            banks = self.geo.banks,
            log_blocks = self.geo.log_blocks_per_bank,
            logical_pages = self.geo.logical_pages,
            "log subsystem initialized"
        );
        Ok(())
    }
}

// ///////////////////////////////////////////////////////////////////////
// Inspection
// ///////////////////////////////////////////////////////////////////////

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn stats(&self) -> FtlStats {
        self.stats
    }

    pub fn map_entry(&self, lpn: u32, chunk_idx: u32) -> ChunkAddr {
        self.map.get(lpn, chunk_idx)
    }

    pub fn clean_blocks(&self, bank: u32) -> u32 {
        self.banks[bank as usize].clean.len()
    }

    pub fn gc_state(&self, bank: u32) -> GcState {
        self.banks[bank as usize].gc.state()
    }

    /// Valid flash chunks of a log block.
    pub fn valid_chunks(&self, bank: u32, lbn: u32) -> u32 {
        self.banks[bank as usize].valid[lbn as usize]
    }

    pub fn heap_len(&self, bank: u32, kind: HeapKind) -> u32 {
        self.banks[bank as usize].heap(kind).len()
    }

    pub fn heap_contains(&self, bank: u32, kind: HeapKind, lbn: u32) -> bool {
        self.banks[bank as usize].heap(kind).contains(lbn)
    }

    pub fn controller(&self, bank: u32, kind: LogKind) -> &LogController {
        self.banks[bank as usize].log(kind)
    }

    pub fn reuse_threshold(&self, bank: u32) -> u32 {
        self.banks[bank as usize].adaptive.threshold()
    }

    pub fn is_halted(&self, bank: u32) -> bool {
        self.banks[bank as usize].halted
    }

    /// Physical block backing a log block.
    pub fn physical_block(&self, _bank: u32, lbn: u32) -> u32 {
        self.geo.reserved_blocks_per_bank + lbn
    }

    /// Bank serving the chunk that holds `sector_offset` of `lpn`.
    pub fn choose_bank(&self, lpn: u32, sector_offset: u32) -> u32 {
        let chunk = u64::from(lpn) * u64::from(self.geo.chunks_per_page())
            + u64::from(sector_offset / self.geo.sectors_per_chunk);
        (chunk % u64::from(self.geo.banks)) as u32
    }

    /// Cross-check the chunk map against the staging buffers, the per-block
    /// counters, the heaps and the clean lists.
    pub fn verify_consistency(&self) -> Result<(), FtlError> {
        let lbpb = self.geo.log_blocks_per_bank as usize;
        let mut counts = vec![vec![0u32; lbpb]; self.banks.len()];

        for (lpn, idx, addr) in self.map.iter() {
            match addr {
                ChunkAddr::Unwritten => {}
                ChunkAddr::Flash(f) => counts[f.bank as usize][f.lbn as usize] += 1,
                ChunkAddr::Staged { log, bank, slot } => {
                    let staged = self.banks[bank as usize].log(log).slots.get(slot as usize).copied().flatten();
                    if staged != Some(StagedChunk { lpn, chunk_idx: idx }) {
                        return Err(FtlError::Corruption {
                            bank,
                            detail: format!("chunk {lpn}:{idx} mapped to {log:?} slot {slot} holding {staged:?}"),
                        });
                    }
                }
            }
        }

        let ppb = self.geo.pages_per_block;
        for (b, state) in self.banks.iter().enumerate() {
            let bank = b as u32;
            for ctrl in [&state.hot, &state.cold] {
                for (slot, s) in ctrl.staged() {
                    let here = ChunkAddr::Staged { log: ctrl.kind(), bank, slot };
                    if self.map.get(s.lpn, s.chunk_idx) != here {
                        return Err(FtlError::Corruption {
                            bank,
                            detail: format!("{:?} slot {slot} holds stale chunk {}:{}", ctrl.kind(), s.lpn, s.chunk_idx),
                        });
                    }
                }
            }

            for lbn in 0..lbpb as u32 {
                let found = counts[b][lbn as usize];
                let expected = state.valid[lbn as usize];
                if found != expected {
                    return Err(FtlError::ValidChunkMismatch { bank, lbn, found, expected });
                }

                let mut homes = 0;
                if state.clean.contains(lbn) {
                    if expected != 0 {
                        return Err(FtlError::ValidChunkMismatch { bank, lbn, found: expected, expected: 0 });
                    }
                    homes += 1;
                }
                for kind in [HeapKind::FirstUsage, HeapKind::SecondUsage, HeapKind::Cold] {
                    if state.heap(kind).contains(lbn) {
                        homes += 1;
                    }
                }
                homes += usize::from(state.hot.log_lpn / ppb == lbn);
                homes += usize::from(state.cold.log_lpn / ppb == lbn);
                if homes != 1 {
                    return Err(FtlError::Corruption {
                        bank,
                        detail: format!("log block {lbn} is tracked {homes} times"),
                    });
                }
            }

            for kind in [HeapKind::FirstUsage, HeapKind::SecondUsage, HeapKind::Cold] {
                for (lbn, key) in state.heap(kind).iter() {
                    if key != state.valid[lbn as usize] {
                        return Err(FtlError::Corruption {
                            bank,
                            detail: format!("{kind:?} heap keys block {lbn} at {key}"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

// ///////////////////////////////////////////////////////////////////////
// Accounting helpers
// ///////////////////////////////////////////////////////////////////////

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Point a chunk at `addr`, moving its valid-chunk count from the old
    /// flash block to the new one.
    pub(crate) fn remap(&mut self, lpn: u32, chunk_idx: u32, addr: ChunkAddr) {
        let old = self.map.replace(lpn, chunk_idx, addr);
        if let ChunkAddr::Flash(f) = old {
            self.adjust_valid(f, -1);
        }
        if let ChunkAddr::Flash(f) = addr {
            self.adjust_valid(f, 1);
        }
    }

    fn adjust_valid(&mut self, f: FlashChunk, delta: i32) {
        let state = &mut self.banks[f.bank as usize];
        let count = &mut state.valid[f.lbn as usize];
        match count.checked_add_signed(delta) {
            Some(n) => *count = n,
            None => debug_assert!(false, "valid count of block {} underflows", f.lbn),
        }
        let n = *count;
        state.first_usage.update(f.lbn, n);
        state.second_usage.update(f.lbn, n);
        state.cold_heap.update(f.lbn, n);
    }

    /// Forget the copy a chunk is about to lose.
    ///
    /// A staged copy frees its slot. A flash copy inside the block being
    /// collected no longer needs relocating.
    pub(crate) fn release_old_chunk(&mut self, old: ChunkAddr) {
        match old {
            ChunkAddr::Unwritten => {}
            ChunkAddr::Flash(f) => self.note_victim_loss(f),
            ChunkAddr::Staged { log, bank, slot } => {
                let ctrl = self.banks[bank as usize].log_mut(log);
                ctrl.slots[slot as usize] = None;
                ctrl.flags.remove(CtrlFlags::ALL_CHUNKS_VALID);
            }
        }
    }

    pub(crate) fn note_victim_loss(&mut self, f: FlashChunk) {
        if let Some(session) = self.banks[f.bank as usize].gc.session.as_mut() {
            if session.victim == f.lbn {
                session.expected = session.expected.saturating_sub(1);
            }
        }
    }

    /// Halt `bank` and hand the fault back to the caller.
    pub(crate) fn fatal(&mut self, bank: u32, err: FtlError) -> FtlError {
        error!(bank, error = %err, "metadata fault, halting bank");
        self.banks[bank as usize].halted = true;
        err
    }

    pub(crate) fn ensure_running(&self, bank: u32) -> Result<(), FtlError> {
        if self.banks[bank as usize].halted {
            return Err(FtlError::BankHalted(bank));
        }
        Ok(())
    }

    pub(crate) fn pbn(&self, lbn: u32) -> u32 {
        self.geo.reserved_blocks_per_bank + lbn
    }

    /// Split a log page number into (log block, page in block).
    pub(crate) fn split(&self, log_lpn: u32) -> (u32, u32) {
        (log_lpn / self.geo.pages_per_block, log_lpn % self.geo.pages_per_block)
    }

    /// Validate a host request and return its sector count.
    pub(crate) fn check_request(&self, lpn: u32, sector_offset: u32, len: usize) -> Result<u32, FtlError> {
        let bps = self.geo.bytes_per_sector as usize;
        if lpn >= self.geo.logical_pages {
            return Err(FtlError::InvalidRequest(format!("logical page {lpn} out of range")));
        }
        if len == 0 || len % bps != 0 {
            return Err(FtlError::InvalidRequest(format!("{len} bytes is not a whole number of sectors")));
        }
        let count = u32::try_from(len / bps).unwrap_or(u32::MAX);
        match sector_offset.checked_add(count) {
            Some(end) if end <= self.geo.sectors_per_page => Ok(count),
            _ => Err(FtlError::InvalidRequest(format!(
                "{count} sectors from sector {sector_offset} run past the page"
            ))),
        }
    }

    /// Offset in a block's back-pointer list of a chunk slot.
    pub(crate) fn list_index(&self, page: u32, offset: u32) -> usize {
        (page * self.geo.chunks_per_page() + offset) as usize
    }

    pub(crate) fn empty_list(&self) -> Vec<BackPointer> {
        vec![BackPointer::Empty; self.geo.chunks_per_block() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Encoding;
    use crate::nand::RamFlash;

    fn config() -> FtlConfig {
        FtlConfig {
            geometry: Geometry {
                banks: 2,
                channels: 1,
                log_blocks_per_bank: 6,
                reserved_blocks_per_bank: 1,
                pages_per_block: 16,
                sectors_per_page: 8,
                sectors_per_chunk: 2,
                bytes_per_sector: 32,
                chunks_per_recycled_page: 2,
                logical_pages: 32,
            },
            tuning: Tuning::default(),
        }
    }

    fn ftl() -> FlashTranslationLayer<RamFlash> {
        let config = config();
        let flash = RamFlash::new(&config.geometry);
        FlashTranslationLayer::new(config, flash).unwrap()
    }

    #[test]
    fn fresh_banks() {
        let ftl = ftl();
        for bank in 0..2 {
            assert_eq!(ftl.clean_blocks(bank), 4);
            assert_eq!(ftl.gc_state(bank), GcState::Idle);
            let hot = ftl.controller(bank, LogKind::Hot);
            assert_eq!(hot.strategy(), LogStrategy::FirstUsageHot);
            assert_eq!((hot.log_lpn(), hot.chunk_ptr()), (0, 0));
            assert!(hot.flags().contains(CtrlFlags::ALL_CHUNKS_VALID | CtrlFlags::PRECACHE_DONE));
            let cold = ftl.controller(bank, LogKind::Cold);
            assert_eq!(cold.strategy(), LogStrategy::ColdFresh);
            assert_eq!(cold.log_lpn(), 16);
        }
        ftl.verify_consistency().unwrap();
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = config();
        config.geometry.channels = 3;
        let flash = RamFlash::new(&config.geometry);
        assert!(matches!(
            FlashTranslationLayer::new(config, flash),
            Err(FtlError::Config(_))
        ));
    }

    #[test]
    fn remap_moves_counts_between_blocks() {
        let mut ftl = ftl();
        ftl.banks[0].first_usage.insert(3, 0);

        ftl.remap(5, 1, ChunkAddr::flash(0, 3, 2, 0, Encoding::Plain));
        ftl.remap(5, 2, ChunkAddr::flash(0, 3, 2, 1, Encoding::Plain));
        assert_eq!(ftl.valid_chunks(0, 3), 2);
        assert_eq!(ftl.banks[0].first_usage.peek(), Some((3, 2)));

        ftl.remap(5, 1, ChunkAddr::flash(1, 4, 0, 0, Encoding::Recycled));
        assert_eq!(ftl.valid_chunks(0, 3), 1);
        assert_eq!(ftl.valid_chunks(1, 4), 1);

        ftl.remap(5, 2, ChunkAddr::Unwritten);
        assert_eq!(ftl.banks[0].first_usage.peek(), Some((3, 0)));
    }

    #[test]
    fn bank_selection_follows_chunks() {
        let ftl = ftl();
        // 4 chunks per page, 2 banks.
        assert_eq!(ftl.choose_bank(0, 0), 0);
        assert_eq!(ftl.choose_bank(0, 2), 1);
        assert_eq!(ftl.choose_bank(3, 6), 1);
    }

    #[test]
    fn request_checks() {
        let ftl = ftl();
        assert!(ftl.check_request(32, 0, 32).is_err());
        assert!(ftl.check_request(0, 0, 31).is_err());
        assert!(ftl.check_request(0, 7, 64).is_err());
        assert_eq!(ftl.check_request(0, 6, 64).unwrap(), 2);
    }

    #[test]
    fn huge_sector_offset_is_rejected() {
        let mut ftl = ftl();
        assert!(matches!(ftl.check_request(0, u32::MAX, 32), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(ftl.check_request(0, u32::MAX - 1, 64), Err(FtlError::InvalidRequest(_))));
        let mut buf = [0u8; 32];
        assert!(matches!(ftl.read_from_log(0, u32::MAX, &mut buf), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(
            ftl.write_to_log(LogKind::Hot, 0, u32::MAX, &buf),
            Err(FtlError::InvalidRequest(_))
        ));
        assert_eq!(ftl.stats().host_sectors_written, 0);
    }

    #[test]
    fn halted_bank_is_reported() {
        let mut ftl = ftl();
        let err = ftl.fatal(1, FtlError::NoVictim(1));
        assert!(matches!(err, FtlError::NoVictim(1)));
        assert!(ftl.is_halted(1));
        assert!(matches!(ftl.ensure_running(1), Err(FtlError::BankHalted(1))));
        ftl.ensure_running(0).unwrap();
    }
}
