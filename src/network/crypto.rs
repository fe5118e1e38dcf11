//! Session crypto: stream RSA keys and the lock AES key store
//!
//! Two independent materials live here:
//!
//! 1. A per-session RSA-2048 keypair, generated lazily and rotated on
//!    reconnect. Its public modulus is embedded (hex) in stream-start
//!    command payloads so the device can return the stream's symmetric key
//!    encrypted to it. A second, externally supplied RSA private key
//!    (fetched by cipher id through the cloud collaborator) decrypts
//!    downloaded recordings only.
//! 2. The lock sub-protocol AES-256-CBC key store, keyed by command type.
//!    The basic-lock key derives from account id + device serial; its IV
//!    derives from the device serial alone — stable per device, not per
//!    message. Deployed lock firmware depends on that exact derivation.

use std::collections::HashMap;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::protocol::CommandType;

use super::error::SessionError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// RSA modulus size for the session stream keypair
const STREAM_KEY_BITS: usize = 2048;

/// Decrypted stream key material: AES-128 key + IV, one per (channel, kind)
#[derive(Clone)]
pub struct StreamCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl StreamCipher {
    /// Build from the 32-byte block the device returns (key || iv)
    pub fn from_key_block(block: &[u8]) -> Result<Self, SessionError> {
        if block.len() != 32 {
            return Err(SessionError::Crypto(format!(
                "Stream key block must be 32 bytes, got {}",
                block.len()
            )));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&block[..16]);
        iv.copy_from_slice(&block[16..]);
        Ok(Self { key, iv })
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| SessionError::Crypto("Stream payload decryption failed".to_string()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }
}

/// Derive the "basic" lock key for a device from account id + serial.
/// The higher-level command builder may supply other keys directly.
pub fn derive_basic_lock_key(account_id: &str, serial: &str) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(account_id.len() + serial.len());
    ikm.extend_from_slice(account_id.as_bytes());
    ikm.extend_from_slice(serial.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut key = [0u8; 32];
    hk.expand(b"basic-lock-key", &mut key)
        .expect("HKDF expand should not fail");
    key
}

/// Basic-lock IV: derived from the device serial only, never per message.
pub fn basic_lock_iv(serial: &str) -> [u8; 16] {
    let digest = Sha256::digest(serial.as_bytes());
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

/// All cryptographic state private to one session. Never shared across
/// sessions; the stream keypair rotates on reconnect.
pub struct SessionCrypto {
    stream_keypair: Option<RsaPrivateKey>,
    download_key: Option<RsaPrivateKey>,
    lock_keys: HashMap<CommandType, [u8; 32]>,
    key_bits: usize,
}

impl SessionCrypto {
    pub fn new() -> Self {
        Self::with_key_bits(STREAM_KEY_BITS)
    }

    /// Override the stream keypair size. Exists so tests can use small,
    /// fast keys; production callers should stick with the default.
    pub fn with_key_bits(key_bits: usize) -> Self {
        Self {
            stream_keypair: None,
            download_key: None,
            lock_keys: HashMap::new(),
            key_bits,
        }
    }

    fn ensure_stream_keypair(&mut self) -> Result<&RsaPrivateKey, SessionError> {
        if self.stream_keypair.is_none() {
            debug!("Generating session stream RSA keypair ({} bits)", self.key_bits);
            let key = RsaPrivateKey::new(&mut OsRng, self.key_bits)
                .map_err(|e| SessionError::Crypto(format!("RSA keygen failed: {}", e)))?;
            self.stream_keypair = Some(key);
        }
        Ok(self.stream_keypair.as_ref().unwrap())
    }

    /// The session's stream private key (lazily generated).
    pub fn rsa_private_key(&mut self) -> Result<RsaPrivateKey, SessionError> {
        Ok(self.ensure_stream_keypair()?.clone())
    }

    /// Hex public modulus for embedding in stream-start command payloads.
    pub fn stream_public_modulus_hex(&mut self) -> Result<String, SessionError> {
        let key = self.ensure_stream_keypair()?;
        Ok(hex::encode(key.n().to_bytes_be()))
    }

    /// Drop the stream keypair so the next use generates a fresh one.
    pub fn rotate_stream_keypair(&mut self) {
        self.stream_keypair = None;
    }

    /// Per-connection key material does not outlive the connection:
    /// drop the stream keypair and clear the lock key store. The
    /// download key is cloud-supplied and survives.
    pub fn reset_for_reconnect(&mut self) {
        self.stream_keypair = None;
        self.lock_keys.clear();
    }

    /// Decrypt the device's RSA-encrypted 32-byte stream key block with
    /// the session keypair.
    pub fn decrypt_stream_key(&mut self, ciphertext: &[u8]) -> Result<StreamCipher, SessionError> {
        let key = self.ensure_stream_keypair()?;
        let block = key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| SessionError::Crypto(format!("Stream key decryption failed: {}", e)))?;
        StreamCipher::from_key_block(&block)
    }

    /// Decrypt a recording key block with the externally supplied download
    /// key. Independent of the live-stream keypair.
    pub fn decrypt_recording_key(&self, ciphertext: &[u8]) -> Result<StreamCipher, SessionError> {
        let key = self
            .download_key
            .as_ref()
            .ok_or_else(|| SessionError::Crypto("No download RSA key set".to_string()))?;
        let block = key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| SessionError::Crypto(format!("Recording key decryption failed: {}", e)))?;
        StreamCipher::from_key_block(&block)
    }

    /// Import the cloud-supplied download private key (PKCS#8 or PKCS#1
    /// PEM).
    pub fn set_download_key_pem(&mut self, pem: &str) -> Result<(), SessionError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| SessionError::Crypto(format!("Invalid download key PEM: {}", e)))?;
        self.download_key = Some(key);
        Ok(())
    }

    pub fn download_key(&self) -> Option<RsaPrivateKey> {
        self.download_key.clone()
    }

    /// Register the AES key for one lock command type. Must happen before
    /// the first send of that type.
    pub fn set_lock_key(&mut self, command: CommandType, key: [u8; 32]) {
        self.lock_keys.insert(command, key);
    }

    pub fn has_lock_key(&self, command: CommandType) -> bool {
        self.lock_keys.contains_key(&command)
    }

    pub fn encrypt_lock_payload(
        &self,
        command: CommandType,
        serial: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let key = self
            .lock_keys
            .get(&command)
            .ok_or(SessionError::MissingLockKey { command })?;
        let iv = basic_lock_iv(serial);
        Ok(Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    pub fn decrypt_lock_payload(
        &self,
        command: CommandType,
        serial: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let key = self
            .lock_keys
            .get(&command)
            .ok_or(SessionError::MissingLockKey { command })?;
        let iv = basic_lock_iv(serial);
        Aes256CbcDec::new(key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| SessionError::Crypto("Lock response decryption failed".to_string()))
    }
}

impl Default for SessionCrypto {
    fn default() -> Self {
        Self::new()
    }
}

/// Encrypt a 32-byte key block to a public key. Used by the mock station
/// and tests to play the device side of the exchange.
pub fn encrypt_key_block_to(
    public: &RsaPublicKey,
    block: &[u8; 32],
) -> Result<Vec<u8>, SessionError> {
    public
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, block)
        .map_err(|e| SessionError::Crypto(format!("RSA encryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small keys keep the tests fast; production uses 2048.
    const TEST_KEY_BITS: usize = 512;

    #[test]
    fn test_basic_lock_key_deterministic() {
        let a = derive_basic_lock_key("account-1", "T8010P1234567890");
        let b = derive_basic_lock_key("account-1", "T8010P1234567890");
        let c = derive_basic_lock_key("account-2", "T8010P1234567890");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_basic_lock_iv_depends_on_serial_only() {
        let a = basic_lock_iv("T8010P1234567890");
        let b = basic_lock_iv("T8010P1234567890");
        let c = basic_lock_iv("T8010P0000000000");

        assert_eq!(a, b, "IV must be stable per device");
        assert_ne!(a, c);
    }

    #[test]
    fn test_lock_payload_roundtrip() {
        let mut crypto = SessionCrypto::new();
        let command = CommandType::LOCK_BASIC_OPERATION;
        let serial = "T8010P1234567890";
        crypto.set_lock_key(command, derive_basic_lock_key("acct", serial));

        let plaintext = br#"{"lock": true}"#;
        let ciphertext = crypto
            .encrypt_lock_payload(command, serial, plaintext)
            .unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let decrypted = crypto
            .decrypt_lock_payload(command, serial, &ciphertext)
            .unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_lock_encrypt_without_key_fails() {
        let crypto = SessionCrypto::new();
        let result =
            crypto.encrypt_lock_payload(CommandType::LOCK_STATUS, "serial", b"payload");
        assert!(matches!(
            result,
            Err(SessionError::MissingLockKey { command }) if command == CommandType::LOCK_STATUS
        ));
    }

    #[test]
    fn test_stream_key_exchange_roundtrip() {
        let mut crypto = SessionCrypto::with_key_bits(TEST_KEY_BITS);
        let modulus = crypto.stream_public_modulus_hex().unwrap();
        assert!(!modulus.is_empty());

        // Device side: encrypt a key block to the session public key
        let public = crypto.rsa_private_key().unwrap().to_public_key();
        let mut block = [0u8; 32];
        block[..16].copy_from_slice(b"0123456789abcdef");
        block[16..].copy_from_slice(b"fedcba9876543210");
        let ciphertext = encrypt_key_block_to(&public, &block).unwrap();

        let cipher = crypto.decrypt_stream_key(&ciphertext).unwrap();
        let encrypted = cipher.encrypt(b"media chunk");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"media chunk");
    }

    #[test]
    fn test_rotate_generates_new_modulus() {
        let mut crypto = SessionCrypto::with_key_bits(TEST_KEY_BITS);
        let first = crypto.stream_public_modulus_hex().unwrap();
        crypto.rotate_stream_keypair();
        let second = crypto.stream_public_modulus_hex().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_reconnect_reset_clears_lock_keys() {
        let mut crypto = SessionCrypto::with_key_bits(TEST_KEY_BITS);
        crypto.set_lock_key(CommandType::LOCK_STATUS, [1u8; 32]);
        let first = crypto.stream_public_modulus_hex().unwrap();

        crypto.reset_for_reconnect();

        assert!(!crypto.has_lock_key(CommandType::LOCK_STATUS));
        assert_ne!(
            crypto.stream_public_modulus_hex().unwrap(),
            first,
            "Stream keypair must rotate as well"
        );
    }

    #[test]
    fn test_reconnect_reset_keeps_download_key() {
        use rsa::pkcs8::EncodePrivateKey;

        let key = RsaPrivateKey::new(&mut OsRng, TEST_KEY_BITS).unwrap();
        let pem = key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap();

        let mut crypto = SessionCrypto::with_key_bits(TEST_KEY_BITS);
        crypto.set_download_key_pem(&pem).unwrap();
        crypto.reset_for_reconnect();
        assert!(crypto.download_key().is_some());
    }

    #[test]
    fn test_stream_cipher_rejects_short_block() {
        assert!(StreamCipher::from_key_block(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_download_key_pem_import() {
        use rsa::pkcs8::EncodePrivateKey;

        let key = RsaPrivateKey::new(&mut OsRng, TEST_KEY_BITS).unwrap();
        let pem = key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap();

        let mut crypto = SessionCrypto::new();
        assert!(crypto.download_key().is_none());
        crypto.set_download_key_pem(&pem).unwrap();
        assert!(crypto.download_key().is_some());

        assert!(crypto.set_download_key_pem("not a pem").is_err());
    }
}
