//! Logical page × chunk index → [`ChunkAddr`].

use crate::address::ChunkAddr;

pub struct ChunkMap {
    chunks_per_page: u32,
    entries: Vec<ChunkAddr>,
}

impl ChunkMap {
    pub fn new(logical_pages: u32, chunks_per_page: u32) -> Self {
        ChunkMap {
            chunks_per_page,
            entries: vec![ChunkAddr::Unwritten; (logical_pages * chunks_per_page) as usize],
        }
    }

    pub fn logical_pages(&self) -> u32 {
        self.entries.len() as u32 / self.chunks_per_page
    }

    fn index(&self, lpn: u32, chunk_idx: u32) -> usize {
        debug_assert!(chunk_idx < self.chunks_per_page);
        (lpn * self.chunks_per_page + chunk_idx) as usize
    }

    pub fn get(&self, lpn: u32, chunk_idx: u32) -> ChunkAddr {
        self.entries[self.index(lpn, chunk_idx)]
    }

    /// Store `addr` and return the entry it replaced.
    ///
    /// Callers inside the crate go through `FlashTranslationLayer::remap`,
    /// which keeps the per-block valid counters in step.
    pub(crate) fn replace(&mut self, lpn: u32, chunk_idx: u32, addr: ChunkAddr) -> ChunkAddr {
        let i = self.index(lpn, chunk_idx);
        std::mem::replace(&mut self.entries[i], addr)
    }

    /// Chunk index of `lpn` whose entry equals `addr`, if any.
    pub fn find(&self, lpn: u32, addr: ChunkAddr) -> Option<u32> {
        let start = self.index(lpn, 0);
        self.entries[start..start + self.chunks_per_page as usize]
            .iter()
            .position(|e| *e == addr)
            .map(|i| i as u32)
    }

    /// Every entry with its logical page and chunk index.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, ChunkAddr)> + '_ {
        let cpp = self.chunks_per_page;
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, addr)| (i as u32 / cpp, i as u32 % cpp, *addr))
    }

    pub fn reset(&mut self) {
        self.entries.fill(ChunkAddr::Unwritten);
    }
}
