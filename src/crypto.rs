//! Envelope encryption for platform tokens and OAuth state signing.
//!
//! A single symmetric key is derived once at process start from the
//! configured secret via PBKDF2-HMAC-SHA256 (100k iterations, stable salt)
//! and used for AES-256-GCM sealing of token blobs at rest. Tampered
//! ciphertext fails `open` with kind `CRYPTO_TAMPER`. Key material and
//! plaintexts never appear in logs or error messages.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::{Error, ErrorKind, Result};

const KDF_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Derive the process-wide sealing key from the configured secret.
    pub fn derive(secret: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, KDF_ITERATIONS, &mut key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self { cipher }
    }

    /// Encrypt plaintext; output is `nonce || ciphertext+tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| Error::internal(format!("rng failure: {e}")))?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::internal("encryption failure"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a sealed blob. Any truncation or tamper yields `CRYPTO_TAMPER`.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(Error::new(
                ErrorKind::CryptoTamper,
                "ciphertext shorter than nonce",
            ));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::new(ErrorKind::CryptoTamper, "ciphertext failed authentication"))
    }

    /// Convenience for UTF-8 secrets such as OAuth tokens.
    pub fn seal_str(&self, plaintext: &str) -> Result<Vec<u8>> {
        self.seal(plaintext.as_bytes())
    }

    pub fn open_str(&self, blob: &[u8]) -> Result<String> {
        let bytes = self.open(blob)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::new(ErrorKind::CryptoTamper, "decrypted bytes are not utf-8"))
    }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-signed, short-lived OAuth `state` tokens.
///
/// The payload binds the user, the platform, an optional adapter claim
/// (PKCE code verifiers ride here), and an expiry instant; the HTTP layer
/// round-trips it through the provider untouched. Any signature or expiry
/// mismatch yields `AUTH_STATE_INVALID`.
pub struct StateSigner {
    key: Vec<u8>,
}

impl StateSigner {
    pub const DEFAULT_TTL_MS: i64 = 10 * 60 * 1000;

    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    pub fn mint(&self, user_id: &str, platform: &str, expires_at_ms: i64) -> String {
        self.mint_with_claim(user_id, platform, "", expires_at_ms)
    }

    /// Mint a state token carrying an adapter claim that must round-trip
    /// to `complete_platform_oauth` (e.g. a PKCE verifier).
    pub fn mint_with_claim(
        &self,
        user_id: &str,
        platform: &str,
        claim: &str,
        expires_at_ms: i64,
    ) -> String {
        let claim_b64 = URL_SAFE_NO_PAD.encode(claim.as_bytes());
        let payload = format!("{user_id}:{platform}:{claim_b64}:{expires_at_ms}");
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        let sig = self.sign(payload_b64.as_bytes());
        format!("{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
    }

    /// Verify a state token against the expected user and platform,
    /// returning the embedded claim when one was minted.
    pub fn verify(
        &self,
        state: &str,
        user_id: &str,
        platform: &str,
        now_ms: i64,
    ) -> Result<Option<String>> {
        let invalid = || Error::new(ErrorKind::AuthStateInvalid, "oauth state rejected");

        let (payload_b64, sig_b64) = state.split_once('.').ok_or_else(invalid)?;
        let expected = self.sign(payload_b64.as_bytes());
        let actual = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| invalid())?;
        if !constant_time_eq(&expected, &actual) {
            return Err(invalid());
        }

        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| invalid())?;
        let payload = String::from_utf8(payload).map_err(|_| invalid())?;
        // The user id may itself contain ':', so peel fields off the tail.
        let mut parts = payload.rsplitn(3, ':');
        let expires_at: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(invalid)?;
        let claim_b64 = parts.next().ok_or_else(invalid)?;
        let subject = parts.next().ok_or_else(invalid)?;

        if subject != format!("{user_id}:{platform}") {
            return Err(invalid());
        }
        if now_ms > expires_at {
            return Err(Error::new(ErrorKind::AuthStateInvalid, "oauth state expired"));
        }

        let claim = URL_SAFE_NO_PAD.decode(claim_b64).map_err(|_| invalid())?;
        let claim = String::from_utf8(claim).map_err(|_| invalid())?;
        Ok((!claim.is_empty()).then_some(claim))
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts keys of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> SecretBox {
        SecretBox::derive("test-secret", b"vidcast-test-salt")
    }

    #[test]
    fn seal_open_round_trip() {
        let sb = test_box();
        for plaintext in [&b""[..], b"x", b"an access token", &[0u8; 4096][..]] {
            let sealed = sb.seal(plaintext).unwrap();
            assert_eq!(sb.open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let sb = test_box();
        let sealed = sb.seal(b"secret").unwrap();
        assert_ne!(&sealed, b"secret");
        // Distinct nonces: sealing twice yields distinct blobs.
        assert_ne!(sealed, sb.seal(b"secret").unwrap());
    }

    #[test]
    fn tampered_ciphertext_fails_with_crypto_tamper() {
        let sb = test_box();
        let mut sealed = sb.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let err = sb.open(&sealed).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CryptoTamper);
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let sb = test_box();
        let err = sb.open(&[0u8; 4]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CryptoTamper);
    }

    #[test]
    fn different_keys_cannot_open() {
        let a = SecretBox::derive("key-a", b"salt");
        let b = SecretBox::derive("key-b", b"salt");
        let sealed = a.seal(b"secret").unwrap();
        assert_eq!(b.open(&sealed).unwrap_err().kind, ErrorKind::CryptoTamper);
    }

    #[test]
    fn state_round_trip() {
        let signer = StateSigner::new("secret");
        let state = signer.mint("user-1", "TIKTOK", 1_000_000);
        let claim = signer.verify(&state, "user-1", "TIKTOK", 999_999).unwrap();
        assert_eq!(claim, None);
    }

    #[test]
    fn state_claim_round_trips() {
        let signer = StateSigner::new("secret");
        let state = signer.mint_with_claim("user-1", "TWITTER", "pkce-verifier", 1_000_000);
        let claim = signer.verify(&state, "user-1", "TWITTER", 999_999).unwrap();
        assert_eq!(claim.as_deref(), Some("pkce-verifier"));
        // The claim is not readable as plaintext in the token itself.
        assert!(!state.contains("pkce-verifier"));
    }

    #[test]
    fn state_rejects_wrong_subject() {
        let signer = StateSigner::new("secret");
        let state = signer.mint("user-1", "TIKTOK", 1_000_000);
        let err = signer
            .verify(&state, "user-2", "TIKTOK", 999_999)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthStateInvalid);
        let err = signer
            .verify(&state, "user-1", "YOUTUBE", 999_999)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthStateInvalid);
    }

    #[test]
    fn state_rejects_expiry_and_forgery() {
        let signer = StateSigner::new("secret");
        let state = signer.mint("user-1", "TIKTOK", 1_000_000);
        let err = signer
            .verify(&state, "user-1", "TIKTOK", 1_000_001)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthStateInvalid);

        let forged = StateSigner::new("other").mint("user-1", "TIKTOK", 1_000_000);
        let err = signer
            .verify(&forged, "user-1", "TIKTOK", 999_999)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthStateInvalid);
    }
}
