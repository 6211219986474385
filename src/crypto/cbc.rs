//! Per-packet AES-128-CBC payload decryption

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};

/// Decrypts RTP audio payloads.
///
/// The sender encrypts only complete 16-byte blocks of each packet with
/// AES-128-CBC, restarting from the negotiated IV on every packet; any
/// trailing partial block travels in cleartext.
pub struct PacketDecryptor {
    cipher: Aes128,
    iv: [u8; 16],
}

impl PacketDecryptor {
    /// Create a decryptor from the key and IV carried in the SDP.
    #[must_use]
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            iv: *iv,
        }
    }

    /// Decrypt one packet payload into `out` (cleared first).
    pub fn decrypt(&self, input: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(input.len());

        let aes_len = input.len() & !0xF;
        let mut prev = self.iv;

        for chunk in input[..aes_len].chunks_exact(16) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.cipher.decrypt_block(&mut block);
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= *p;
            }
            out.extend_from_slice(&block);
            prev.copy_from_slice(chunk);
        }

        // cleartext remainder
        out.extend_from_slice(&input[aes_len..]);
    }
}
