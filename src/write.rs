//! Host writes, chunk staging and log-buffer flushes.

use tracing::{trace, warn};

use crate::address::{BackPointer, ChunkAddr, Encoding, FlashChunk, LogKind};
use crate::ftl::FlashTranslationLayer;
use crate::host::HostBufferRing;
use crate::log::{CtrlFlags, StagedChunk};
use crate::nand::{FlashDevice, IoMode};
use crate::FtlError;

/// Where a relocated chunk is copied from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RelocSource {
    /// Chunk offset in the page garbage collection has read.
    GcScratch(u32),
    /// Chunk offset in the precached low page.
    Precache(u32),
}

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Write sectors of a logical page through the hot or cold log.
    ///
    /// `data` holds whole sectors and must stay within the page. A write of
    /// the full page goes straight to flash; anything smaller is staged
    /// chunk by chunk.
    pub fn write_to_log(&mut self, log: LogKind, lpn: u32, sector_offset: u32, data: &[u8]) -> Result<(), FtlError> {
        let count = self.check_request(lpn, sector_offset, data.len())?;
        let bank = self.choose_bank(lpn, sector_offset);
        self.ensure_running(bank)?;
        self.stats.host_sectors_written += u64::from(count);

        if count == self.geo.sectors_per_page {
            self.write_complete_page(bank, log, lpn, data)
        } else {
            self.sync_with_write_limit(bank)?;
            self.write_partial_page(bank, log, lpn, sector_offset, data)
        }
    }

    /// Program a whole logical page at the log's cursor.
    pub(crate) fn write_complete_page(&mut self, bank: u32, log: LogKind, lpn: u32, data: &[u8]) -> Result<(), FtlError> {
        let log_lpn = self.lpn_for_complete_page(bank, log);
        let (lbn, page) = self.split(log_lpn);
        let pbn = self.pbn(lbn);
        self.flash
            .page_program(bank, pbn, page, 0, self.geo.sectors_per_page, data, IoMode::IssueOnly)?;

        for chunk_idx in 0..self.geo.chunks_per_page() {
            let old = self.map.get(lpn, chunk_idx);
            self.release_old_chunk(old);
            self.remap(lpn, chunk_idx, ChunkAddr::flash(bank, lbn, page, chunk_idx, Encoding::Plain));
            let i = self.list_index(page, chunk_idx);
            self.banks[bank as usize].log_mut(log).back_pointers[i] = BackPointer::Plain(lpn);
        }
        self.stats.full_page_writes += 1;
        trace!(bank, ?log, lpn, lbn, page, "full page written");

        self.increase_lpn(bank, log)?;

        // Staged chunks beyond the recycled payload cannot use the new page.
        let ctrl = self.banks[bank as usize].log(log);
        if ctrl.recycled() && ctrl.chunk_ptr >= self.geo.chunks_per_recycled_page {
            self.lpn_for_complete_page(bank, log);
        }
        Ok(())
    }

    fn write_partial_page(
        &mut self,
        bank: u32,
        log: LogKind,
        lpn: u32,
        sector_offset: u32,
        data: &[u8],
    ) -> Result<(), FtlError> {
        let spc = self.geo.sectors_per_chunk;
        let bps = self.geo.bytes_per_sector as usize;
        let end = sector_offset + (data.len() / bps) as u32;

        let mut sector = sector_offset;
        let mut consumed = 0;
        while sector < end {
            let in_chunk = sector % spc;
            let count = (spc - in_chunk).min(end - sector);
            let len = count as usize * bps;
            self.write_chunk(bank, log, lpn, sector / spc, in_chunk, &data[consumed..consumed + len])?;
            sector += count;
            consumed += len;
        }
        Ok(())
    }

    /// Stage new sectors of one chunk, merging in whatever part of the old
    /// chunk they do not cover.
    fn write_chunk(
        &mut self,
        bank: u32,
        log: LogKind,
        lpn: u32,
        chunk_idx: u32,
        in_chunk: u32,
        bytes: &[u8],
    ) -> Result<(), FtlError> {
        let bpc = self.geo.bytes_per_chunk();
        let start = in_chunk as usize * self.geo.bytes_per_sector as usize;
        let old = self.map.get(lpn, chunk_idx);

        match old {
            ChunkAddr::Unwritten => self.stage_fresh(bank, log, start, bytes),
            ChunkAddr::Flash(f) => {
                if bytes.len() == bpc {
                    self.stage_fresh(bank, log, 0, bytes);
                } else {
                    self.stage_from_flash(bank, log, f)?;
                    let ctrl = self.banks[bank as usize].log_mut(log);
                    let slot = ctrl.chunk_ptr;
                    ctrl.slot_bytes_mut(slot, bpc)[start..start + bytes.len()].copy_from_slice(bytes);
                }
                self.note_victim_loss(f);
            }
            ChunkAddr::Staged { log: old_log, bank: old_bank, slot } => {
                self.flash.wait_until_idle(old_bank);
                if self.tuning.dram_absorb {
                    let ctrl = self.banks[old_bank as usize].log_mut(old_log);
                    ctrl.slot_bytes_mut(slot, bpc)[start..start + bytes.len()].copy_from_slice(bytes);
                    self.stats.dram_absorbed_sectors += (bytes.len() / self.geo.bytes_per_sector as usize) as u64;
                    return Ok(());
                }

                let mut chunk = self.banks[old_bank as usize].log(old_log).slot_bytes(slot, bpc).to_vec();
                chunk[start..start + bytes.len()].copy_from_slice(bytes);
                self.release_old_chunk(old);
                self.stage_fresh(bank, log, 0, &chunk);
            }
        }

        self.commit_staged(bank, log, lpn, chunk_idx);
        self.update_chunk_ptr(bank, log)
    }

    /// Copy `bytes` into the free slot at byte `start`, padding the rest of
    /// the chunk with `0xFF`.
    fn stage_fresh(&mut self, bank: u32, log: LogKind, start: usize, bytes: &[u8]) {
        let bpc = self.geo.bytes_per_chunk();
        self.flash.wait_until_idle(bank);
        let ctrl = self.banks[bank as usize].log_mut(log);
        let slot = ctrl.chunk_ptr;
        let dst = ctrl.slot_bytes_mut(slot, bpc);
        if bytes.len() != bpc {
            dst.fill(0xFF);
        }
        dst[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Load the flash copy of a chunk into the free slot.
    fn stage_from_flash(&mut self, bank: u32, log: LogKind, f: FlashChunk) -> Result<(), FtlError> {
        let bpc = self.geo.bytes_per_chunk();
        let spc = self.geo.sectors_per_chunk;
        self.flash.wait_until_idle(bank);
        self.flash.wait_until_idle(f.bank);

        match f.encoding {
            Encoding::Plain => {
                let pbn = self.pbn(f.lbn);
                let ctrl = self.banks[bank as usize].log_mut(log);
                let slot = ctrl.chunk_ptr;
                self.flash.page_read(
                    f.bank,
                    pbn,
                    f.page,
                    f.offset * spc,
                    spc,
                    ctrl.slot_bytes_mut(slot, bpc),
                    IoMode::WaitForCompletion,
                )?;
            }
            Encoding::Recycled => {
                self.read_recycled_page(f.bank, f.lbn, f.page)?;
                let src = &self.decoded[f.offset as usize * bpc..][..bpc];
                let ctrl = self.banks[bank as usize].log_mut(log);
                let slot = ctrl.chunk_ptr;
                ctrl.slot_bytes_mut(slot, bpc).copy_from_slice(src);
            }
        }
        Ok(())
    }

    /// Read a recycled page and decode its payload into `self.decoded`.
    pub(crate) fn read_recycled_page(&mut self, bank: u32, lbn: u32, page: u32) -> Result<(), FtlError> {
        let pbn = self.pbn(lbn);
        self.flash.page_read(
            bank,
            pbn,
            page,
            0,
            self.geo.sectors_per_page,
            &mut self.page_scratch,
            IoMode::WaitForCompletion,
        )?;
        self.codec.decode(&self.page_scratch, &mut self.decoded);
        Ok(())
    }

    /// Claim the free slot for a chunk.
    fn commit_staged(&mut self, bank: u32, log: LogKind, lpn: u32, chunk_idx: u32) {
        let ctrl = self.banks[bank as usize].log_mut(log);
        let slot = ctrl.chunk_ptr;
        ctrl.slots[slot as usize] = Some(StagedChunk { lpn, chunk_idx });
        self.remap(lpn, chunk_idx, ChunkAddr::Staged { log, bank, slot });
    }

    /// Advance to the next free slot, flushing the buffer when it is full.
    pub(crate) fn update_chunk_ptr(&mut self, bank: u32, log: LogKind) -> Result<(), FtlError> {
        let capacity = if self.banks[bank as usize].log(log).recycled() {
            self.geo.chunks_per_recycled_page
        } else {
            self.geo.chunks_per_page()
        };
        let ctrl = self.banks[bank as usize].log_mut(log);
        ctrl.chunk_ptr = (ctrl.chunk_ptr + 1) % capacity;

        if ctrl.chunk_ptr == 0 {
            return if ctrl.recycled() {
                self.flush_recycled_page(bank)
            } else {
                self.flush_log_buffer(bank, log)
            };
        }

        let pending = ctrl.next_low_page.is_some() && !ctrl.flags.contains(CtrlFlags::PRECACHE_DONE);
        if pending && !self.flash.is_bank_busy(bank) {
            self.precache_low_page(bank)?;
        }
        Ok(())
    }

    /// Program the staging buffer as an ordinary page.
    pub(crate) fn flush_log_buffer(&mut self, bank: u32, log: LogKind) -> Result<(), FtlError> {
        let ctrl = self.banks[bank as usize].log(log);
        let (lbn, page) = (ctrl.lbn(), ctrl.page());
        let pbn = self.pbn(lbn);
        self.flash
            .page_program(bank, pbn, page, 0, self.geo.sectors_per_page, &ctrl.buffer, IoMode::IssueOnly)?;

        let base = self.list_index(page, 0);
        let cpp = self.geo.chunks_per_page() as usize;
        let ctrl = self.banks[bank as usize].log_mut(log);
        let staged = take_slots(&mut ctrl.slots);
        ctrl.back_pointers[base..base + cpp].fill(BackPointer::Empty);
        for (slot, s) in &staged {
            ctrl.back_pointers[base + *slot as usize] = BackPointer::Plain(s.lpn);
        }
        ctrl.flags.insert(CtrlFlags::ALL_CHUNKS_VALID);

        for (slot, s) in &staged {
            self.settle_staged(bank, log, *slot, *s, ChunkAddr::flash(bank, lbn, page, *slot, Encoding::Plain))?;
        }
        self.stats.flushes += 1;
        trace!(bank, ?log, lbn, page, chunks = staged.len(), "staging buffer flushed");
        self.increase_lpn(bank, log)
    }

    /// Reprogram the prepared low page with the encoded hot payload.
    fn flush_recycled_page(&mut self, bank: u32) -> Result<(), FtlError> {
        if let Some(wom) = self.wom.as_mut() {
            if wom.next_fails() {
                return self.divert_recycled_to_cold(bank);
            }
        }

        let hot = &self.banks[bank as usize].hot;
        let (lbn, page) = (hot.lbn(), hot.page());
        if hot.next_low_page != Some(page) {
            let detail = format!("recycled flush at page {page}, prepared page is {:?}", hot.next_low_page);
            return Err(self.fatal(bank, FtlError::Corruption { bank, detail }));
        }
        if !hot.flags.contains(CtrlFlags::PRECACHE_DONE) {
            self.precache_low_page(bank)?;
        }
        self.flash.wait_until_idle(bank);

        let payload = self.geo.chunks_per_recycled_page as usize * self.geo.bytes_per_chunk();
        let state = &self.banks[bank as usize];
        self.codec
            .encode(&state.hot.buffer[..payload], &state.precache, &mut self.page_scratch);
        let pbn = self.pbn(lbn);
        self.flash.page_program(
            bank,
            pbn,
            page,
            0,
            self.geo.sectors_per_page,
            &self.page_scratch,
            IoMode::IssueOnly,
        )?;

        let base = self.list_index(page, 0);
        let cpp = self.geo.chunks_per_page() as usize;
        let hot = &mut self.banks[bank as usize].hot;
        let staged = take_slots(&mut hot.slots);
        hot.back_pointers[base..base + cpp].fill(BackPointer::Empty);
        for (slot, s) in &staged {
            hot.back_pointers[base + *slot as usize] = BackPointer::Recycled(s.lpn);
        }
        hot.flags.insert(CtrlFlags::ALL_CHUNKS_VALID);

        for (slot, s) in &staged {
            let addr = ChunkAddr::flash(bank, lbn, page, *slot, Encoding::Recycled);
            self.settle_staged(bank, LogKind::Hot, *slot, *s, addr)?;
        }
        self.stats.recycled_pages_programmed += 1;
        trace!(bank, lbn, page, chunks = staged.len(), "recycled page programmed");
        self.increase_lpn(bank, LogKind::Hot)
    }

    /// Move a flushed slot's chunk to its flash address.
    fn settle_staged(&mut self, bank: u32, log: LogKind, slot: u32, s: StagedChunk, addr: ChunkAddr) -> Result<(), FtlError> {
        if self.map.get(s.lpn, s.chunk_idx) != (ChunkAddr::Staged { log, bank, slot }) {
            let detail = format!("{log:?} slot {slot} owned by {}:{} which maps elsewhere", s.lpn, s.chunk_idx);
            return Err(self.fatal(bank, FtlError::Corruption { bank, detail }));
        }
        self.remap(s.lpn, s.chunk_idx, addr);
        Ok(())
    }

    /// A recycled program failed: the staged hot chunks go to the cold log
    /// and the hot log keeps its cursor.
    fn divert_recycled_to_cold(&mut self, bank: u32) -> Result<(), FtlError> {
        let bpc = self.geo.bytes_per_chunk();
        warn!(bank, "recycled page program failed, moving staged chunks to the cold log");
        self.flash.wait_until_idle(bank);

        for slot in 0..self.geo.chunks_per_recycled_page {
            let state = &mut self.banks[bank as usize];
            let Some(s) = state.hot.slots[slot as usize].take() else {
                continue;
            };
            let dst = state.cold.chunk_ptr;
            state
                .cold
                .slot_bytes_mut(dst, bpc)
                .copy_from_slice(state.hot.slot_bytes(slot, bpc));
            state.cold.slots[dst as usize] = Some(s);
            self.settle_staged(bank, LogKind::Hot, slot, s, ChunkAddr::Staged { log: LogKind::Cold, bank, slot: dst })?;
            self.update_chunk_ptr(bank, LogKind::Cold)?;
        }

        let hot = &mut self.banks[bank as usize].hot;
        hot.chunk_ptr = 0;
        hot.flags.insert(CtrlFlags::ALL_CHUNKS_VALID);
        self.stats.wom_fallbacks += 1;
        Ok(())
    }

    /// Stage a still-valid chunk in the cold log on behalf of garbage
    /// collection or low-page reuse.
    pub(crate) fn relocate_chunk(&mut self, bank: u32, lpn: u32, chunk_idx: u32, src: RelocSource) -> Result<(), FtlError> {
        let bpc = self.geo.bytes_per_chunk();
        self.flash.wait_until_idle(bank);

        let state = &mut self.banks[bank as usize];
        let dst = state.cold.chunk_ptr;
        let from = match src {
            RelocSource::GcScratch(offset) => &state.gc.scratch[offset as usize * bpc..][..bpc],
            RelocSource::Precache(offset) => &state.precache[offset as usize * bpc..][..bpc],
        };
        state.cold.slot_bytes_mut(dst, bpc).copy_from_slice(from);
        state.cold.slots[dst as usize] = Some(StagedChunk { lpn, chunk_idx });
        self.remap(lpn, chunk_idx, ChunkAddr::Staged { log: LogKind::Cold, bank, slot: dst });
        if let RelocSource::GcScratch(_) = src {
            self.stats.gc_relocated_chunks += 1;
        }
        self.update_chunk_ptr(bank, LogKind::Cold)
    }

    /// Hold a sub-page write until the host ring lets the FTL move on,
    /// doing background collection while waiting.
    pub(crate) fn sync_with_write_limit(&mut self, bank: u32) -> Result<(), FtlError> {
        let mut polls: u64 = 0;
        while self.host.ftl_write_id() != self.host.write_limit() {
            polls += 1;
            if polls > self.tuning.max_backpressure_polls {
                warn!(bank, polls, "host write buffer never caught up");
                return Err(FtlError::Stalled(bank));
            }
            self.background_step(bank)?;
        }
        Ok(())
    }
}

fn take_slots(slots: &mut [Option<StagedChunk>]) -> Vec<(u32, StagedChunk)> {
    slots
        .iter_mut()
        .enumerate()
        .filter_map(|(slot, s)| s.take().map(|s| (slot as u32, s)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FtlConfig, Geometry, Tuning, WomFaultConfig};
    use crate::log::LogStrategy;
    use crate::nand::RamFlash;

    // One bank, P = 16, 4 chunks of 2 sectors, 32-byte sectors.
    fn config(tuning: Tuning) -> FtlConfig {
        FtlConfig {
            geometry: Geometry {
                banks: 1,
                channels: 1,
                log_blocks_per_bank: 8,
                reserved_blocks_per_bank: 1,
                pages_per_block: 16,
                sectors_per_page: 8,
                sectors_per_chunk: 2,
                bytes_per_sector: 32,
                chunks_per_recycled_page: 2,
                logical_pages: 64,
            },
            tuning,
        }
    }

    fn ftl(tuning: Tuning) -> FlashTranslationLayer<RamFlash> {
        let config = config(tuning);
        let flash = RamFlash::new(&config.geometry);
        FlashTranslationLayer::new(config, flash).unwrap()
    }

    fn read(ftl: &mut FlashTranslationLayer<RamFlash>, lpn: u32) -> Vec<u8> {
        let mut buf = vec![0; 256];
        ftl.read_from_log(lpn, 0, &mut buf).unwrap();
        buf
    }

    #[test]
    fn full_page_write_maps_every_chunk() {
        let mut ftl = ftl(Tuning::default());
        ftl.write_to_log(LogKind::Hot, 9, 0, &[7; 256]).unwrap();
        for idx in 0..4 {
            assert_eq!(ftl.map_entry(9, idx), ChunkAddr::flash(0, 0, 0, idx, Encoding::Plain));
        }
        assert_eq!(ftl.valid_chunks(0, 0), 4);
        assert_eq!(ftl.controller(0, LogKind::Hot).page(), 1);
        assert_eq!(read(&mut ftl, 9), vec![7; 256]);
    }

    #[test]
    fn buffer_flushes_after_one_page_of_chunks() {
        let mut ftl = ftl(Tuning::default());
        for lpn in 0..3 {
            ftl.write_to_log(LogKind::Hot, lpn, 0, &[lpn as u8; 64]).unwrap();
        }
        assert_eq!(ftl.stats().flushes, 0);
        assert_eq!(ftl.controller(0, LogKind::Hot).chunk_ptr(), 3);
        assert_eq!(ftl.map_entry(2, 0), ChunkAddr::Staged { log: LogKind::Hot, bank: 0, slot: 2 });

        ftl.write_to_log(LogKind::Hot, 3, 0, &[3; 64]).unwrap();
        assert_eq!(ftl.stats().flushes, 1);
        assert_eq!(ftl.controller(0, LogKind::Hot).chunk_ptr(), 0);
        assert_eq!(ftl.map_entry(2, 0), ChunkAddr::flash(0, 0, 0, 2, Encoding::Plain));
        assert_eq!(ftl.banks[0].hot.back_pointers[2], BackPointer::Plain(2));

        let page = read(&mut ftl, 2);
        assert_eq!(&page[..64], &[2; 64]);
        assert!(page[64..].iter().all(|b| *b == 0xFF));
        ftl.verify_consistency().unwrap();
    }

    #[test]
    fn staged_partial_update_is_absorbed() {
        let mut ftl = ftl(Tuning::default());
        ftl.write_to_log(LogKind::Cold, 4, 0, &[1; 64]).unwrap();
        ftl.write_to_log(LogKind::Cold, 4, 1, &[2; 32]).unwrap();

        assert_eq!(ftl.controller(0, LogKind::Cold).chunk_ptr(), 1);
        assert_eq!(ftl.stats().dram_absorbed_sectors, 1);
        let page = read(&mut ftl, 4);
        assert_eq!(&page[..32], &[1; 32]);
        assert_eq!(&page[32..64], &[2; 32]);
    }

    #[test]
    fn staged_partial_update_without_absorb_takes_a_new_slot() {
        let mut ftl = ftl(Tuning { dram_absorb: false, ..Tuning::default() });
        ftl.write_to_log(LogKind::Cold, 4, 0, &[1; 64]).unwrap();
        ftl.write_to_log(LogKind::Cold, 4, 1, &[2; 32]).unwrap();

        let cold = ftl.controller(0, LogKind::Cold);
        assert_eq!(cold.chunk_ptr(), 2);
        assert!(!cold.flags().contains(CtrlFlags::ALL_CHUNKS_VALID));
        assert_eq!(cold.staged().count(), 1);
        assert_eq!(ftl.map_entry(4, 0), ChunkAddr::Staged { log: LogKind::Cold, bank: 0, slot: 1 });
        let page = read(&mut ftl, 4);
        assert_eq!(&page[..32], &[1; 32]);
        assert_eq!(&page[32..64], &[2; 32]);
        ftl.verify_consistency().unwrap();
    }

    #[test]
    fn partial_update_of_flash_chunk_keeps_old_sectors() {
        let mut ftl = ftl(Tuning::default());
        let mut data = vec![0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        ftl.write_to_log(LogKind::Hot, 5, 0, &data).unwrap();
        // Sector 3 is the second half of chunk 1.
        ftl.write_to_log(LogKind::Hot, 5, 3, &[0xEE; 32]).unwrap();

        assert_eq!(ftl.valid_chunks(0, 0), 3);
        data[96..128].fill(0xEE);
        assert_eq!(read(&mut ftl, 5), data);
    }

    #[test]
    fn write_spanning_chunks_splits_at_boundaries() {
        let mut ftl = ftl(Tuning::default());
        ftl.write_to_log(LogKind::Hot, 1, 1, &[9; 96]).unwrap();
        let hot = ftl.controller(0, LogKind::Hot);
        assert_eq!(hot.chunk_ptr(), 2);
        let page = read(&mut ftl, 1);
        assert!(page[..32].iter().all(|b| *b == 0xFF));
        assert_eq!(&page[32..128], &[9; 96]);
        assert!(page[128..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn failed_recycled_program_moves_chunks_to_cold() {
        let tuning = Tuning {
            wom_fault: Some(WomFaultConfig { success_rate: 0.0, seed: 3 }),
            ..Tuning::default()
        };
        let mut ftl = ftl(tuning);
        {
            let hot = &mut ftl.banks[0].hot;
            hot.strategy = LogStrategy::SecondUsageHot;
            hot.log_lpn = 3;
            hot.next_low_page = Some(3);
            hot.flags.insert(CtrlFlags::RECYCLED_PAGE);
        }
        ftl.write_to_log(LogKind::Hot, 10, 0, &[0xA1; 64]).unwrap();
        ftl.write_to_log(LogKind::Hot, 11, 0, &[0xB2; 64]).unwrap();

        assert_eq!(ftl.stats().wom_fallbacks, 1);
        let hot = ftl.controller(0, LogKind::Hot);
        assert_eq!((hot.page(), hot.chunk_ptr()), (3, 0));
        assert!(hot.recycled());
        assert_eq!(ftl.map_entry(10, 0), ChunkAddr::Staged { log: LogKind::Cold, bank: 0, slot: 0 });
        assert_eq!(ftl.map_entry(11, 0), ChunkAddr::Staged { log: LogKind::Cold, bank: 0, slot: 1 });
        assert_eq!(&read(&mut ftl, 11)[..64], &[0xB2; 64]);
        ftl.verify_consistency().unwrap();
    }

    #[test]
    fn recycled_page_holds_reduced_payload() {
        let mut ftl = ftl(Tuning::default());
        ftl.write_to_log(LogKind::Hot, 20, 0, &[0x11; 256]).unwrap();
        ftl.write_to_log(LogKind::Hot, 20, 0, &[0x22; 256]).unwrap();
        {
            // Second pass over block 0: page 0 is stale and can be reprogrammed.
            let hot = &mut ftl.banks[0].hot;
            hot.strategy = LogStrategy::SecondUsageHot;
            hot.log_lpn = 0;
        }
        assert!(ftl.can_reuse_low_page(0, 0).unwrap());
        {
            let hot = &mut ftl.banks[0].hot;
            hot.next_low_page = Some(0);
            hot.flags.insert(CtrlFlags::RECYCLED_PAGE);
            hot.flags.remove(CtrlFlags::PRECACHE_DONE);
        }

        ftl.write_to_log(LogKind::Hot, 30, 0, &[0x30; 64]).unwrap();
        ftl.write_to_log(LogKind::Hot, 31, 2, &[0x31; 64]).unwrap();
        assert_eq!(ftl.stats().recycled_pages_programmed, 1);
        assert_eq!(ftl.map_entry(30, 0), ChunkAddr::flash(0, 0, 0, 0, Encoding::Recycled));
        assert_eq!(ftl.map_entry(31, 1), ChunkAddr::flash(0, 0, 0, 1, Encoding::Recycled));
        assert_eq!(ftl.banks[0].hot.back_pointers[1], BackPointer::Recycled(31));
        assert_eq!(ftl.banks[0].hot.back_pointers[3], BackPointer::Empty);

        assert_eq!(&read(&mut ftl, 30)[..64], &[0x30; 64]);
        assert_eq!(&read(&mut ftl, 31)[64..128], &[0x31; 64]);
        assert_eq!(read(&mut ftl, 20), vec![0x22; 256]);
        ftl.verify_consistency().unwrap();
    }
}
