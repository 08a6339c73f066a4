//! Pairing cryptography for the Shadow controller.
//!
//! This module provides key derivation, AES-256-CBC envelope encryption and
//! the challenge exchange used to prove both sides hold the same key.
//!
//! Ciphertext is always laid out as `IV || AES-CBC-PKCS7(plaintext)` with a
//! fresh random IV per message. The device manager expects exactly this
//! layout, both for binary frames and for the hex-encoded challenge fields.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::error::{ProtocolError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the symmetric key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of a challenge (and of every random nonce) in bytes.
pub const CHALLENGE_LENGTH: usize = 16;

/// Length of the AES-CBC initialization vector prepended to ciphertext.
pub const IV_LENGTH: usize = 16;

/// PBKDF2 iteration count used in passcode mode.
pub const PBKDF2_ITERATIONS: u32 = 1000;

/// Salt used when the controller pairs without a stored encryption token.
pub const DEFAULT_SALT: &str = "b8b5d15f0de11ceed565376436d25d74";

const SELF_TEST_INPUT: &[u8] = b"test";
const SELF_TEST_DIGEST: &str = "098f6bcd4621d373cade4e832627b4f6";

/// How the engine obtains its key.
#[derive(Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Derive the key from a salt and passcode with PBKDF2-HMAC-SHA1.
    Passcode { salt: String, passcode: String },
    /// Use a previously shared key, hex-encoded.
    EncryptionKey(String),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Passcode { salt, .. } => f
                .debug_struct("Passcode")
                .field("salt", salt)
                .field("passcode", &"[REDACTED]")
                .finish(),
            KeySource::EncryptionKey(_) => f.debug_tuple("EncryptionKey").field(&"[REDACTED]").finish(),
        }
    }
}

/// The symmetric key in both of the forms the protocol needs.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: [u8; KEY_LENGTH],
    hex: String,
}

impl KeyMaterial {
    /// Parses a hex-encoded 32-byte key.
    pub fn from_hex(token: &str) -> Result<Self> {
        let decoded = hex::decode(token.trim())?;
        if decoded.len() != KEY_LENGTH {
            return Err(ProtocolError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                decoded.len()
            )));
        }
        let mut bytes = [0u8; KEY_LENGTH];
        bytes.copy_from_slice(&decoded);
        Ok(Self::from_bytes(bytes))
    }

    /// Derives a key from a passcode and salt.
    pub fn derive(salt: &str, passcode: &str) -> Self {
        Self::from_bytes(derive_key(passcode, salt, PBKDF2_ITERATIONS))
    }

    fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self {
            hex: hex::encode(bytes),
            bytes,
        }
    }

    /// Returns the key as lowercase hex.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// The controller's half of the mutual challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_LENGTH]);

impl Challenge {
    /// Generates a fresh random challenge.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the raw challenge bytes.
    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LENGTH] {
        &self.0
    }

    /// Returns the challenge as lowercase hex, as carried in `options.rand`.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Key state and cipher operations for one session.
///
/// An engine is unconfigured until [`CryptoEngine::configure`] is called.
/// Every call to `configure` replaces the key and generates a new challenge,
/// so exactly one challenge is live at a time.
#[derive(Debug, Default)]
pub struct CryptoEngine {
    key: Option<KeyMaterial>,
    challenge: Option<Challenge>,
}

impl CryptoEngine {
    /// Creates an unconfigured engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs key material and generates a fresh challenge.
    pub fn configure(&mut self, source: KeySource) -> Result<()> {
        let key = match source {
            KeySource::EncryptionKey(token) => KeyMaterial::from_hex(&token)?,
            KeySource::Passcode { salt, passcode } => KeyMaterial::derive(&salt, &passcode),
        };
        self.key = Some(key);
        self.challenge = Some(Challenge::generate());
        Ok(())
    }

    /// Drops all key and challenge state.
    pub fn reset(&mut self) {
        self.key = None;
        self.challenge = None;
    }

    /// Returns true once key material is installed.
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Returns the session key as hex, if configured.
    pub fn key_hex(&self) -> Option<&str> {
        self.key.as_ref().map(KeyMaterial::as_hex)
    }

    /// Returns the live challenge, if configured.
    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    /// Returns 16 random bytes, hex-encoded.
    pub fn random_hex() -> String {
        let mut bytes = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Checks that the hash primitive produces a known answer.
    pub fn self_test() -> Result<()> {
        let digest = hex::encode(Md5::digest(SELF_TEST_INPUT));
        if digest == SELF_TEST_DIGEST {
            Ok(())
        } else {
            Err(ProtocolError::SelfTestFailed)
        }
    }

    fn key(&self) -> Result<&KeyMaterial> {
        self.key.as_ref().ok_or(ProtocolError::NotConfigured)
    }

    /// Encrypts `plaintext`, returning `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.key()?;
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new(&key.bytes.into(), &iv.into());
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LENGTH + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts `IV || ciphertext` produced by [`CryptoEngine::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.key()?;
        if data.len() < IV_LENGTH * 2 || data.len() % IV_LENGTH != 0 {
            return Err(ProtocolError::Decryption(format!(
                "invalid ciphertext length {}",
                data.len()
            )));
        }

        let (iv, ciphertext) = data.split_at(IV_LENGTH);
        let mut iv_block = [0u8; IV_LENGTH];
        iv_block.copy_from_slice(iv);

        let cipher = Aes256CbcDec::new(&key.bytes.into(), &iv_block.into());
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))
    }

    /// Encrypts and hex-encodes, for ciphertext carried inside JSON.
    pub fn encrypt_hex(&self, plaintext: &[u8]) -> Result<String> {
        self.encrypt(plaintext).map(hex::encode)
    }

    /// Decodes hex and decrypts.
    pub fn decrypt_hex(&self, data: &str) -> Result<Vec<u8>> {
        let bytes =
            hex::decode(data).map_err(|e| ProtocolError::Decryption(e.to_string()))?;
        self.decrypt(&bytes)
    }

    /// Checks the peer's challenge candidate and builds our completion payload.
    ///
    /// The decrypted candidate is `our_challenge (16 bytes) || peer_challenge
    /// (16 bytes)`. On a match the peer's half is returned to it, followed by
    /// fresh random bytes, encrypted and hex-encoded.
    pub fn verify_challenge(&self, candidate: &str) -> Result<String> {
        let challenge = self.challenge.ok_or(ProtocolError::NotConfigured)?;
        let unpacked = self.decrypt_hex(candidate)?;
        if unpacked.len() < CHALLENGE_LENGTH {
            return Err(ProtocolError::ChallengeMismatch);
        }

        let (mine, rest) = unpacked.split_at(CHALLENGE_LENGTH);
        if mine != challenge.as_bytes() {
            return Err(ProtocolError::ChallengeMismatch);
        }
        let yours = &rest[..rest.len().min(CHALLENGE_LENGTH)];

        let mut response = Vec::with_capacity(CHALLENGE_LENGTH * 2);
        response.extend_from_slice(yours);
        let mut fresh = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut fresh);
        response.extend_from_slice(&fresh);

        self.encrypt_hex(&response)
    }

    /// Encrypts a serialized JSON envelope for a binary frame.
    pub fn encrypt_envelope(&self, json: &str) -> Result<Vec<u8>> {
        self.encrypt(json.as_bytes())
    }

    /// Decrypts a binary frame and parses the JSON envelope inside it.
    pub fn decrypt_envelope(&self, data: &[u8]) -> Result<serde_json::Value> {
        let plaintext = self.decrypt(data)?;
        let text = String::from_utf8(plaintext)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// PBKDF2-HMAC-SHA1 over UTF-8 passcode and salt.
fn derive_key(passcode: &str, salt: &str, iterations: u32) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha1>(passcode.as_bytes(), salt.as_bytes(), iterations, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "2bcf6b8854e61983b87b7756754ec6a694ce667aa1a2e2181c5d6dd949823d99";

    fn configured() -> CryptoEngine {
        let mut engine = CryptoEngine::new();
        engine
            .configure(KeySource::EncryptionKey(TOKEN.to_string()))
            .unwrap();
        engine
    }

    /// Builds what the device manager would send in `pair_ready`.
    fn peer_candidate(peer: &CryptoEngine, echoed: &[u8], peer_half: &[u8]) -> String {
        let mut plaintext = echoed.to_vec();
        plaintext.extend_from_slice(peer_half);
        peer.encrypt_hex(&plaintext).unwrap()
    }

    #[test]
    fn test_self_test_passes() {
        assert!(CryptoEngine::self_test().is_ok());
    }

    #[test]
    fn test_pbkdf2_matches_rfc6070_prefix() {
        // RFC 6070: P="password", S="salt", c=1, dkLen=20
        let key = derive_key("password", "salt", 1);
        assert_eq!(
            hex::encode(&key[..20]),
            "0c60c80f961f0e71f3a9b524af6012062fe037a6"
        );
    }

    #[test]
    fn test_passcode_mode_is_deterministic() {
        let a = KeyMaterial::derive(DEFAULT_SALT, "passcode-1");
        let b = KeyMaterial::derive(DEFAULT_SALT, "passcode-1");
        let c = KeyMaterial::derive(DEFAULT_SALT, "passcode-2");
        assert_eq!(a.as_hex(), b.as_hex());
        assert_ne!(a.as_hex(), c.as_hex());
        assert_eq!(a.as_hex().len(), KEY_LENGTH * 2);
    }

    #[test]
    fn test_encryption_key_mode_keeps_hex() {
        let engine = configured();
        assert_eq!(engine.key_hex(), Some(TOKEN));
    }

    #[test]
    fn test_rejects_short_token() {
        let mut engine = CryptoEngine::new();
        let result = engine.configure(KeySource::EncryptionKey("abcd".to_string()));
        assert!(matches!(result, Err(ProtocolError::InvalidKey(_))));
        assert!(!engine.is_configured());
    }

    #[test]
    fn test_rejects_non_hex_token() {
        let mut engine = CryptoEngine::new();
        let result = engine.configure(KeySource::EncryptionKey("x".repeat(64)));
        assert!(matches!(result, Err(ProtocolError::InvalidKey(_))));
    }

    #[test]
    fn test_configure_regenerates_challenge() {
        let mut engine = configured();
        let first = *engine.challenge().unwrap();
        engine
            .configure(KeySource::EncryptionKey(TOKEN.to_string()))
            .unwrap();
        assert_ne!(first, *engine.challenge().unwrap());
    }

    #[test]
    fn test_random_hex_shape() {
        let value = CryptoEngine::random_hex();
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(value, CryptoEngine::random_hex());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let engine = configured();
        for plaintext in [&b""[..], b"a", b"exactly sixteen!", b"{\"action\":\"ping\"}"] {
            let ciphertext = engine.encrypt(plaintext).unwrap();
            assert_eq!(ciphertext.len() % 16, 0);
            assert!(ciphertext.len() > plaintext.len());
            assert_eq!(engine.decrypt(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_encrypt_uses_fresh_iv() {
        let engine = configured();
        let a = engine.encrypt(b"same").unwrap();
        let b = engine.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_variants_roundtrip() {
        let engine = configured();
        let hex_ct = engine.encrypt_hex(b"hello").unwrap();
        assert_eq!(engine.decrypt_hex(&hex_ct).unwrap(), b"hello");
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails_or_differs() {
        let engine = configured();
        let mut other = CryptoEngine::new();
        other
            .configure(KeySource::Passcode {
                salt: DEFAULT_SALT.to_string(),
                passcode: "other".to_string(),
            })
            .unwrap();

        let ciphertext = engine.encrypt(b"{\"action\":\"connect_ok\"}").unwrap();
        match other.decrypt(&ciphertext) {
            Ok(plaintext) => assert_ne!(plaintext, b"{\"action\":\"connect_ok\"}"),
            Err(e) => assert!(matches!(e, ProtocolError::Decryption(_))),
        }
    }

    #[test]
    fn test_decrypt_rejects_truncated_input() {
        let engine = configured();
        assert!(engine.decrypt(&[0u8; 10]).is_err());
        assert!(engine.decrypt(&[0u8; 33]).is_err());
        assert!(engine.decrypt_hex("not hex").is_err());
    }

    #[test]
    fn test_unconfigured_engine_refuses() {
        let engine = CryptoEngine::new();
        assert!(matches!(
            engine.encrypt(b"x"),
            Err(ProtocolError::NotConfigured)
        ));
        assert!(matches!(
            engine.verify_challenge("00"),
            Err(ProtocolError::NotConfigured)
        ));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let engine = configured();
        let json = r#"{"action":"publish","options":{"destinations":[]},"source":"abc"}"#;
        let bytes = engine.encrypt_envelope(json).unwrap();
        let parsed = engine.decrypt_envelope(&bytes).unwrap();
        assert_eq!(parsed, serde_json::from_str::<serde_json::Value>(json).unwrap());
    }

    #[test]
    fn test_decrypt_envelope_rejects_non_json() {
        let engine = configured();
        let bytes = engine.encrypt(b"not json at all").unwrap();
        assert!(matches!(
            engine.decrypt_envelope(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_verify_challenge_success() {
        let engine = configured();
        let peer = configured();
        let peer_half = [7u8; CHALLENGE_LENGTH];

        let candidate = peer_candidate(&peer, engine.challenge().unwrap().as_bytes(), &peer_half);
        let response = engine.verify_challenge(&candidate).unwrap();

        let unpacked = peer.decrypt_hex(&response).unwrap();
        assert_eq!(unpacked.len(), CHALLENGE_LENGTH * 2);
        assert_eq!(&unpacked[..CHALLENGE_LENGTH], &peer_half);
    }

    #[test]
    fn test_verify_challenge_mismatch() {
        let engine = configured();
        let peer = configured();
        let candidate = peer_candidate(&peer, &[0u8; CHALLENGE_LENGTH], &[1u8; CHALLENGE_LENGTH]);
        assert!(matches!(
            engine.verify_challenge(&candidate),
            Err(ProtocolError::ChallengeMismatch)
        ));
    }

    #[test]
    fn test_verify_challenge_undecryptable() {
        let engine = configured();
        assert!(engine.verify_challenge("deadbeef").is_err());
        assert!(engine.verify_challenge("").is_err());
    }

    #[test]
    fn test_verify_challenge_fails_after_reconfigure() {
        let mut engine = configured();
        let peer = configured();
        let stale = *engine.challenge().unwrap();
        engine
            .configure(KeySource::EncryptionKey(TOKEN.to_string()))
            .unwrap();
        let candidate = peer_candidate(&peer, stale.as_bytes(), &[2u8; CHALLENGE_LENGTH]);
        assert!(engine.verify_challenge(&candidate).is_err());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut engine = configured();
        engine.reset();
        assert!(!engine.is_configured());
        assert!(engine.challenge().is_none());
        assert!(engine.key_hex().is_none());
    }

    #[test]
    fn test_debug_redacts_key() {
        let engine = configured();
        let debug = format!("{:?}", engine);
        assert!(!debug.contains(TOKEN));
        assert!(debug.contains("REDACTED"));
        let source = KeySource::EncryptionKey(TOKEN.to_string());
        assert!(!format!("{:?}", source).contains(TOKEN));
    }
}
