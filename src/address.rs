//! Chunk addresses and the on-flash back-pointer entries.

/// Back-pointer word marking an empty slot.
pub const BACK_POINTER_NONE: u32 = 0xFFFF_FFFF;

/// Bit set in a back-pointer word when the chunk lives in a recycled page.
const RECYCLED_MARK: u32 = 0x8000_0000;

/// Largest logical page number a back-pointer word can carry. One below the
/// mask so that a recycled entry never encodes as [`BACK_POINTER_NONE`].
pub const MAX_LOGICAL_PAGE: u32 = RECYCLED_MARK - 2;

/// The two log streams of a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Hot,
    Cold,
}

/// How the chunk's page was programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Ordinary page, chunks stored as-is.
    Plain,
    /// Reprogrammed low page; the page must go through the codec first.
    Recycled,
}

/// Physical position of a chunk in a log block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlashChunk {
    pub bank: u32,
    pub lbn: u32,
    pub page: u32,
    pub offset: u32,
    pub encoding: Encoding,
}

impl FlashChunk {
    /// True if `other` is programmed as part of the same flash page.
    pub fn same_page(&self, other: &FlashChunk) -> bool {
        self.bank == other.bank
            && self.lbn == other.lbn
            && self.page == other.page
            && self.encoding == other.encoding
    }
}

/// Where the latest copy of a (logical page, chunk index) pair lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChunkAddr {
    /// Never written, or detached while a page is being relocated.
    #[default]
    Unwritten,
    Flash(FlashChunk),
    /// Sitting in a log controller's DRAM staging buffer.
    Staged { log: LogKind, bank: u32, slot: u32 },
}

impl ChunkAddr {
    pub fn flash(bank: u32, lbn: u32, page: u32, offset: u32, encoding: Encoding) -> Self {
        ChunkAddr::Flash(FlashChunk { bank, lbn, page, offset, encoding })
    }

    pub fn location(&self) -> ChunkLocation {
        match self {
            ChunkAddr::Unwritten => ChunkLocation::Invalid,
            ChunkAddr::Flash(f) => match f.encoding {
                Encoding::Plain => ChunkLocation::FlashLog,
                Encoding::Recycled => ChunkLocation::FlashLogEncoded,
            },
            ChunkAddr::Staged { log: LogKind::Hot, .. } => ChunkLocation::DramHot,
            ChunkAddr::Staged { log: LogKind::Cold, .. } => ChunkLocation::DramCold,
        }
    }
}

/// Coarse classification of a [`ChunkAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLocation {
    Invalid,
    FlashLog,
    FlashLogEncoded,
    DramHot,
    DramCold,
}

/// Reverse-map entry: which logical page owns a physical chunk slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackPointer {
    #[default]
    Empty,
    Plain(u32),
    Recycled(u32),
}

impl BackPointer {
    pub fn lpn(&self) -> Option<u32> {
        match *self {
            BackPointer::Empty => None,
            BackPointer::Plain(lpn) | BackPointer::Recycled(lpn) => Some(lpn),
        }
    }

    pub fn encode(&self) -> u32 {
        match *self {
            BackPointer::Empty => BACK_POINTER_NONE,
            BackPointer::Plain(lpn) => lpn,
            BackPointer::Recycled(lpn) => lpn | RECYCLED_MARK,
        }
    }

    pub fn decode(word: u32) -> Self {
        if word == BACK_POINTER_NONE {
            BackPointer::Empty
        } else if word & RECYCLED_MARK != 0 {
            BackPointer::Recycled(word & !RECYCLED_MARK)
        } else {
            BackPointer::Plain(word)
        }
    }
}

/// Serialize a block's back-pointer list into the start of `page`, one
/// little-endian word per entry. Entries past the end of `page` are dropped.
pub fn write_back_pointers(page: &mut [u8], list: &[BackPointer]) {
    for (word, entry) in page.chunks_exact_mut(4).zip(list) {
        word.copy_from_slice(&entry.encode().to_le_bytes());
    }
}

/// Fill `list` from the words stored at the start of `page`. Entries with no
/// word behind them keep their value.
pub fn read_back_pointers(page: &[u8], list: &mut [BackPointer]) {
    for (entry, word) in list.iter_mut().zip(page.chunks_exact(4)) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        *entry = BackPointer::decode(word);
    }
}
