//! Pair-verify and auth-setup request bodies
//!
//! Pair-verify is a two-step Curve25519 exchange with an Apple TV style
//! receiver. Step 1 posts `0x01000000 || verify_pub || auth_pub` and gets
//! back `atv_pub || atv_data`. Step 2 derives an AES key/iv from the
//! SHA-512 of the X25519 shared secret, signs `verify_pub || atv_pub`
//! with the long-term Ed25519 key, consumes the CTR keystream over
//! `atv_data`, and posts `0x00000000` followed by the encrypted
//! signature. The RTSP client drives the two POSTs.

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::CtrStream;

/// Ed25519/X25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;
/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// Pairing failures surfaced to the RTSP client.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// The verify step 1 reply was shorter than one public key.
    #[error("pair-verify reply too short: {0} bytes")]
    ShortReply(usize),
}

/// State carried between the two pair-verify steps.
pub struct PairVerify {
    auth: SigningKey,
    verify_secret: StaticSecret,
    verify_pub: PublicKey,
}

impl PairVerify {
    /// Build the session keys from the stored 32-byte authentication
    /// secret. A fresh ephemeral verification key is drawn per session.
    #[must_use]
    pub fn new(secret: &[u8; 32]) -> Self {
        let verify_secret = StaticSecret::random_from_rng(OsRng);
        let verify_pub = PublicKey::from(&verify_secret);
        Self {
            auth: SigningKey::from_bytes(secret),
            verify_secret,
            verify_pub,
        }
    }

    /// Body of the first `POST /pair-verify`.
    #[must_use]
    pub fn step1_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + 2 * PUBLIC_KEY_LEN);
        body.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        body.extend_from_slice(self.verify_pub.as_bytes());
        body.extend_from_slice(self.auth.verifying_key().as_bytes());
        body
    }

    /// Body of the second `POST /pair-verify`, built from the step 1
    /// reply (`atv_pub || atv_data`).
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::ShortReply`] if the reply cannot hold the
    /// device public key.
    pub fn step2_body(&self, reply: &[u8]) -> Result<Vec<u8>, PairingError> {
        if reply.len() < PUBLIC_KEY_LEN {
            return Err(PairingError::ShortReply(reply.len()));
        }
        let mut atv_pub = [0u8; PUBLIC_KEY_LEN];
        atv_pub.copy_from_slice(&reply[..PUBLIC_KEY_LEN]);
        let atv_data = &reply[PUBLIC_KEY_LEN..];

        let shared = self.verify_secret.diffie_hellman(&PublicKey::from(atv_pub));
        let key = digest_16(b"Pair-Verify-AES-Key", shared.as_bytes());
        let iv = digest_16(b"Pair-Verify-AES-IV", shared.as_bytes());

        let mut signed = Vec::with_capacity(2 * PUBLIC_KEY_LEN);
        signed.extend_from_slice(self.verify_pub.as_bytes());
        signed.extend_from_slice(&atv_pub);
        let mut signature = self.auth.sign(&signed).to_bytes();

        // the keystream runs over atv_data first; only the encrypted
        // signature is posted
        let mut ctr = CtrStream::new(&key, &iv);
        ctr.advance(atv_data.len());
        ctr.apply(&mut signature);

        let mut body = Vec::with_capacity(4 + SIGNATURE_LEN);
        body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        body.extend_from_slice(&signature);
        Ok(body)
    }

    /// The ephemeral verification public key of this session.
    #[must_use]
    pub fn verify_public(&self) -> &[u8; 32] {
        self.verify_pub.as_bytes()
    }

    /// The long-term authentication public key.
    #[must_use]
    pub fn auth_public(&self) -> [u8; 32] {
        self.auth.verifying_key().to_bytes()
    }
}

/// Body of `POST /auth-setup`: `0x01` followed by a fresh X25519 public
/// key. The reply is read and discarded by the caller.
#[must_use]
pub fn auth_setup_body() -> Vec<u8> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let mut body = Vec::with_capacity(1 + PUBLIC_KEY_LEN);
    body.push(0x01);
    body.extend_from_slice(public.as_bytes());
    body
}

fn digest_16(label: &[u8], secret: &[u8]) -> [u8; 16] {
    let mut hasher = Sha512::new();
    hasher.update(label);
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    #[test]
    fn test_step1_body_layout() {
        let pv = PairVerify::new(&[0x55; 32]);
        let body = pv.step1_body();
        assert_eq!(body.len(), 4 + 64);
        assert_eq!(&body[..4], &[1, 0, 0, 0]);
        assert_eq!(&body[4..36], pv.verify_public());
        assert_eq!(&body[36..68], &pv.auth_public());
    }

    #[test]
    fn test_step2_rejects_short_reply() {
        let pv = PairVerify::new(&[0x55; 32]);
        assert!(matches!(
            pv.step2_body(&[0u8; 10]),
            Err(PairingError::ShortReply(10))
        ));
    }

    #[test]
    fn test_step2_signature_verifies_after_decrypt() {
        let pv = PairVerify::new(&[0x77; 32]);

        // simulate the device side of the exchange
        let atv_secret = StaticSecret::from([0x33u8; 32]);
        let atv_pub = PublicKey::from(&atv_secret);
        let atv_data = [0xC5u8; 48];
        let mut reply = atv_pub.as_bytes().to_vec();
        reply.extend_from_slice(&atv_data);

        let body = pv.step2_body(&reply).unwrap();
        assert_eq!(body.len(), 4 + SIGNATURE_LEN);
        assert_eq!(&body[..4], &[0, 0, 0, 0]);

        // the device derives the same shared secret and keys, decrypts at
        // the same keystream offset, and checks the signature
        let shared = atv_secret.diffie_hellman(&PublicKey::from(*pv.verify_public()));
        let key = digest_16(b"Pair-Verify-AES-Key", shared.as_bytes());
        let iv = digest_16(b"Pair-Verify-AES-IV", shared.as_bytes());

        let mut ctr = CtrStream::new(&key, &iv);
        ctr.advance(atv_data.len());
        let mut sig_bytes = body[4..].to_vec();
        ctr.apply(&mut sig_bytes);

        let mut signed = pv.verify_public().to_vec();
        signed.extend_from_slice(atv_pub.as_bytes());

        let verifying = VerifyingKey::from_bytes(&pv.auth_public()).unwrap();
        let signature = Signature::from_slice(&sig_bytes).unwrap();
        verifying.verify(&signed, &signature).unwrap();
    }

    #[test]
    fn test_auth_setup_body_layout() {
        let body = auth_setup_body();
        assert_eq!(body.len(), 33);
        assert_eq!(body[0], 0x01);
    }
}
