//! Host write-buffer ring as seen by the FTL.

/// Counters shared with the host interface.
///
/// The FTL may consume the next write buffer once the host's consumption
/// limit has caught up with the FTL's own position in the ring.
pub trait HostBufferRing {
    /// Ring slot the FTL consumes next.
    fn ftl_write_id(&self) -> u32;

    /// Consumption limit currently published by the host interface.
    fn write_limit(&mut self) -> u32;
}

/// A ring that never holds the FTL back.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackPressure;

impl HostBufferRing for NoBackPressure {
    fn ftl_write_id(&self) -> u32 {
        0
    }

    fn write_limit(&mut self) -> u32 {
        0
    }
}
