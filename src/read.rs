//! Page reconstruction from staged and flash chunks.

use tracing::trace;

use crate::address::{ChunkAddr, Encoding, LogKind};
use crate::ftl::FlashTranslationLayer;
use crate::host::HostBufferRing;
use crate::nand::{FlashDevice, IoMode};
use crate::FtlError;

/// Purpose of a page reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildMode {
    /// Serve a host read; the chunk map is left alone.
    Read,
    /// Gather a page for rewriting; every chunk read is detached from its
    /// old location.
    GcRelocation,
}

impl<F: FlashDevice, H: HostBufferRing> FlashTranslationLayer<F, H> {
    /// Read sectors of a logical page. Sectors never written read as `0xFF`.
    pub fn read_from_log(&mut self, lpn: u32, sector_offset: u32, buf: &mut [u8]) -> Result<(), FtlError> {
        let count = self.check_request(lpn, sector_offset, buf.len())?;
        let bank = self.choose_bank(lpn, sector_offset);
        self.ensure_running(bank)?;

        self.rebuild_page(lpn, sector_offset, count, RebuildMode::Read)?;
        let start = sector_offset as usize * self.geo.bytes_per_sector as usize;
        buf.copy_from_slice(&self.assembly[start..start + buf.len()]);
        self.stats.host_sectors_read += u64::from(count);
        Ok(())
    }

    /// Gather the chunks covering sectors `sector_offset..sector_offset +
    /// sector_count` of `lpn` into the assembly buffer.
    ///
    /// Chunks sharing a flash page are fetched together when that saves
    /// reads: more than two plain chunks cost one full-page read, and a
    /// recycled page is always decoded whole.
    pub fn rebuild_page(
        &mut self,
        lpn: u32,
        sector_offset: u32,
        sector_count: u32,
        mode: RebuildMode,
    ) -> Result<(), FtlError> {
        let spc = self.geo.sectors_per_chunk;
        let bpc = self.geo.bytes_per_chunk();
        let crp = self.geo.chunks_per_recycled_page as usize;
        let spp = self.geo.sectors_per_page;

        for bank in 0..self.geo.banks {
            self.flash.wait_until_idle(bank);
        }

        let first = sector_offset / spc;
        let last = sector_offset.saturating_add(sector_count).min(spp).div_ceil(spc);
        let mut done = vec![false; self.geo.chunks_per_page() as usize];

        for idx in first..last {
            if done[idx as usize] {
                continue;
            }
            done[idx as usize] = true;
            let dst = idx as usize * bpc;

            match self.map.get(lpn, idx) {
                ChunkAddr::Unwritten => self.assembly[dst..dst + bpc].fill(0xFF),
                ChunkAddr::Staged { log, bank, slot } => {
                    let src = self.banks[bank as usize].log(log).slot_bytes(slot, bpc);
                    self.assembly[dst..dst + bpc].copy_from_slice(src);
                    if mode == RebuildMode::GcRelocation {
                        self.detach(lpn, idx);
                    }
                }
                ChunkAddr::Flash(f) => {
                    // Chunks of this request living on the same flash page.
                    let batch: Vec<(u32, u32)> = (idx..last)
                        .filter(|&j| j == idx || !done[j as usize])
                        .filter_map(|j| match self.map.get(lpn, j) {
                            ChunkAddr::Flash(g) if g.same_page(&f) => Some((j, g.offset)),
                            _ => None,
                        })
                        .collect();
                    let pbn = self.pbn(f.lbn);

                    let served: &[(u32, u32)] = match f.encoding {
                        Encoding::Plain if batch.len() > 2 => {
                            self.flash.page_read(
                                f.bank,
                                pbn,
                                f.page,
                                0,
                                spp,
                                &mut self.page_scratch,
                                IoMode::WaitForCompletion,
                            )?;
                            for &(j, offset) in &batch {
                                let src = offset as usize * bpc;
                                let out = j as usize * bpc;
                                self.assembly[out..out + bpc].copy_from_slice(&self.page_scratch[src..src + bpc]);
                            }
                            &batch
                        }
                        Encoding::Plain => {
                            self.flash.page_read(
                                f.bank,
                                pbn,
                                f.page,
                                f.offset * spc,
                                spc,
                                &mut self.assembly[dst..dst + bpc],
                                IoMode::WaitForCompletion,
                            )?;
                            &batch[..1]
                        }
                        Encoding::Recycled => {
                            if batch.len() > crp {
                                let detail = format!(
                                    "{} chunks of page {lpn} mapped to a recycled page holding {crp}",
                                    batch.len()
                                );
                                return Err(self.fatal(f.bank, FtlError::Corruption { bank: f.bank, detail }));
                            }
                            self.read_recycled_page(f.bank, f.lbn, f.page)?;
                            for &(j, offset) in &batch {
                                let src = offset as usize * bpc;
                                let out = j as usize * bpc;
                                self.assembly[out..out + bpc].copy_from_slice(&self.decoded[src..src + bpc]);
                            }
                            &batch
                        }
                    };

                    for &(j, _) in served {
                        done[j as usize] = true;
                        if mode == RebuildMode::GcRelocation {
                            self.detach(lpn, j);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite a logical page as one full page in the cold log, gathering
    /// its chunks from wherever they are.
    ///
    /// Returns `false` if the page has never been written.
    pub fn consolidate_page(&mut self, lpn: u32) -> Result<bool, FtlError> {
        if lpn >= self.geo.logical_pages {
            return Err(FtlError::InvalidRequest(format!("logical page {lpn} out of range")));
        }
        let cpp = self.geo.chunks_per_page();
        if (0..cpp).all(|idx| self.map.get(lpn, idx) == ChunkAddr::Unwritten) {
            return Ok(false);
        }
        let bank = self.choose_bank(lpn, 0);
        self.ensure_running(bank)?;

        self.rebuild_page(lpn, 0, self.geo.sectors_per_page, RebuildMode::GcRelocation)?;
        let page = std::mem::take(&mut self.assembly);
        let written = self.write_complete_page(bank, LogKind::Cold, lpn, &page);
        self.assembly = page;
        written?;

        self.stats.consolidations += 1;
        trace!(bank, lpn, "page consolidated");
        Ok(true)
    }

    /// Drop a chunk's mapping while its content sits in the assembly buffer.
    fn detach(&mut self, lpn: u32, chunk_idx: u32) {
        let old = self.map.get(lpn, chunk_idx);
        self.release_old_chunk(old);
        self.remap(lpn, chunk_idx, ChunkAddr::Unwritten);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FtlConfig, Geometry, Tuning};
    use crate::nand::RamFlash;

    fn ftl() -> FlashTranslationLayer<RamFlash> {
        let config = FtlConfig {
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
            tuning: Tuning::default(),
        };
        let flash = RamFlash::new(&config.geometry);
        FlashTranslationLayer::new(config, flash).unwrap()
    }

    #[test]
    fn unwritten_page_reads_erased() {
        let mut ftl = ftl();
        let mut buf = vec![0; 96];
        ftl.read_from_log(7, 2, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xFF));
        assert_eq!(ftl.flash().counters().reads, 0);
    }

    #[test]
    fn neighbouring_chunks_share_one_read() {
        let mut ftl = ftl();
        ftl.write_to_log(LogKind::Hot, 3, 0, &[5; 256]).unwrap();

        let before = ftl.flash().counters().reads;
        let mut buf = vec![0; 256];
        ftl.read_from_log(3, 0, &mut buf).unwrap();
        assert_eq!(buf, vec![5; 256]);
        assert_eq!(ftl.flash().counters().reads - before, 1);

        // Two chunks are fetched one at a time.
        let before = ftl.flash().counters().reads;
        ftl.read_from_log(3, 4, &mut buf[..128]).unwrap();
        assert_eq!(ftl.flash().counters().reads - before, 2);
    }

    #[test]
    fn out_of_range_requests() {
        let mut ftl = ftl();
        let mut buf = vec![0; 32];
        assert!(matches!(ftl.read_from_log(64, 0, &mut buf), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(ftl.read_from_log(0, 8, &mut buf), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(ftl.consolidate_page(99), Err(FtlError::InvalidRequest(_))));
    }

    #[test]
    fn consolidation_gathers_scattered_chunks() {
        let mut ftl = ftl();
        ftl.write_to_log(LogKind::Hot, 2, 0, &[1; 256]).unwrap();
        ftl.write_to_log(LogKind::Hot, 2, 2, &[2; 64]).unwrap();
        ftl.write_to_log(LogKind::Cold, 2, 6, &[3; 64]).unwrap();
        assert!(!ftl.consolidate_page(40).unwrap());

        assert!(ftl.consolidate_page(2).unwrap());
        let cold_lbn = 1;
        for idx in 0..4 {
            assert_eq!(ftl.map_entry(2, idx), ChunkAddr::flash(0, cold_lbn, 0, idx, Encoding::Plain));
        }
        assert_eq!(ftl.valid_chunks(0, 0), 0);
        assert_eq!(ftl.valid_chunks(0, cold_lbn), 4);
        assert_eq!(ftl.controller(0, LogKind::Hot).staged().count(), 0);
        assert_eq!(ftl.controller(0, LogKind::Cold).staged().count(), 0);

        let mut buf = vec![0; 256];
        ftl.read_from_log(2, 0, &mut buf).unwrap();
        let mut expected = vec![1; 256];
        expected[64..128].fill(2);
        expected[192..256].fill(3);
        assert_eq!(buf, expected);
        ftl.verify_consistency().unwrap();
    }
}
