//! Big-endian AES-128-CTR keystream

use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};

type Ctr128 = ctr::Ctr128BE<Aes128>;

/// An AES-128-CTR stream with a big-endian full-block counter.
///
/// Pair-verify consumes part of the keystream over bytes whose ciphertext
/// is discarded, so the stream exposes [`CtrStream::advance`] in addition
/// to in-place encryption.
pub struct CtrStream {
    inner: Ctr128,
}

impl CtrStream {
    /// Create a stream from a 16-byte key and 16-byte IV.
    #[must_use]
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            inner: Ctr128::new(key.into(), iv.into()),
        }
    }

    /// Encrypt (or decrypt) `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }

    /// Consume `n` keystream bytes without producing output.
    pub fn advance(&mut self, n: usize) {
        let mut scratch = [0u8; 64];
        let mut left = n;
        while left > 0 {
            let take = left.min(scratch.len());
            self.inner.apply_keystream(&mut scratch[..take]);
            left -= take;
        }
    }
}
