//! Encode/decode hook for recycled low pages.

/// Turns a recycled page's payload into the bits programmed over the page's
/// first-pass content, and back.
///
/// `payload` and the `out` of [`PageCodec::decode`] hold exactly
/// `chunks_per_recycled_page` chunks. `prior` and the `out` of
/// [`PageCodec::encode`] hold a full page.
pub trait PageCodec {
    fn encode(&self, payload: &[u8], prior: &[u8], out: &mut [u8]);

    fn decode(&self, raw: &[u8], out: &mut [u8]);
}

/// Stores the payload at the start of the page, padded with `0xFF`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

impl PageCodec for PassthroughCodec {
    fn encode(&self, payload: &[u8], _prior: &[u8], out: &mut [u8]) {
        out[..payload.len()].copy_from_slice(payload);
        out[payload.len()..].fill(0xFF);
    }

    fn decode(&self, raw: &[u8], out: &mut [u8]) {
        let n = out.len();
        out.copy_from_slice(&raw[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_pads_and_restores() {
        let payload = [1u8, 2, 3, 4, 5, 6];
        let prior = [0u8; 16];
        let mut page = [0u8; 16];
        PassthroughCodec.encode(&payload, &prior, &mut page);
        assert_eq!(&page[..6], &payload);
        assert!(page[6..].iter().all(|b| *b == 0xFF));

        let mut out = [0u8; 6];
        PassthroughCodec.decode(&page, &mut out);
        assert_eq!(out, payload);
    }
}
