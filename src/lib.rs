//! Page-mapped flash translation layer with chunk-granular log buffers.
//!
//! Host pages are split into chunks. Each bank runs a hot and a cold log;
//! chunks are staged in a DRAM buffer per log and flushed a page at a time.
//! Hot log blocks live twice: first their low pages are filled, later the
//! high pages are filled and stale low pages are reprogrammed with an encoded,
//! reduced payload. Garbage collection relocates the still-valid chunks of a
//! victim block into the cold log before erasing it.
//!
//! [`FlashTranslationLayer`] is the entry point. The flash array, the host
//! buffer ring and the recycled-page codec are supplied by the caller through
//! [`FlashDevice`], [`HostBufferRing`] and [`PageCodec`].

pub mod adaptive;
pub mod address;
pub mod chunk_map;
pub mod clean_list;
pub mod codec;
pub mod config;
mod ftl;
pub mod gc;
pub mod heap;
pub mod host;
pub mod log;
pub mod nand;
mod read;
mod wom;
mod write;

pub use address::{BackPointer, ChunkAddr, ChunkLocation, Encoding, FlashChunk, LogKind};
pub use codec::{PageCodec, PassthroughCodec};
pub use config::{ConfigError, FtlConfig, Geometry, ReuseStrategy, Tuning, WomFaultConfig};
pub use ftl::{FlashTranslationLayer, FtlStats};
pub use gc::{GcState, GcStep};
pub use heap::HeapKind;
pub use host::{HostBufferRing, NoBackPressure};
pub use log::{CtrlFlags, LogController, LogStrategy, StagedChunk};
pub use nand::{FlashDevice, FlashError, IoMode, RamFlash};
pub use read::RebuildMode;

/// Errors returned by the FTL.
///
/// Metadata faults halt the bank they occur on; later calls that land on it
/// return [`FtlError::BankHalted`]. [`FtlError::is_fatal`] is false only for
/// errors the caller can retry or fix.
#[derive(Debug, thiserror::Error)]
pub enum FtlError {
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("bank {bank} block {lbn}: found {found} valid chunks, expected {expected}")]
    ValidChunkMismatch { bank: u32, lbn: u32, found: u32, expected: u32 },
    #[error("bank {bank}: corrupt metadata: {detail}")]
    Corruption { bank: u32, detail: String },
    #[error("bank {0} has no block to garbage collect")]
    NoVictim(u32),
    #[error("bank {0} cannot free a log block")]
    OutOfSpace(u32),
    #[error("bank {0} stalled waiting for the host write buffer")]
    Stalled(u32),
    #[error("garbage collection on bank {0} did not finish")]
    GcStalled(u32),
    #[error("bank {0} is halted after a metadata fault")]
    BankHalted(u32),
}

impl FtlError {
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FtlError::InvalidRequest(_) | FtlError::Config(_) | FtlError::Stalled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(!FtlError::InvalidRequest("x".into()).is_fatal());
        assert!(!FtlError::Stalled(0).is_fatal());
        assert!(FtlError::Corruption { bank: 0, detail: "x".into() }.is_fatal());
        assert!(FtlError::from(FlashError::Erase { bank: 1, pbn: 2 }).is_fatal());
    }

    #[test]
    fn messages_name_the_bank() {
        let err = FtlError::ValidChunkMismatch { bank: 3, lbn: 7, found: 5, expected: 6 };
        assert_eq!(err.to_string(), "bank 3 block 7: found 5 valid chunks, expected 6");
    }
}
