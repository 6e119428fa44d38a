//! Software-based HSM implementation.
//!
//! Enforces:
//! 1. Memory hygiene (Zeroize)
//! 2. Encryption at rest (AES-256-GCM, one file per key, handle bound as AAD)
//! 3. Master key derivation from a BIP-39 mnemonic (PBKDF2-HMAC-SHA256)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use async_trait::async_trait;
use bip39::Mnemonic;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::hsm::{GeneratedKey, HsmConnector, HsmError, HsmSession, KeyGenParams};
use crate::types::{HsmHandle, KeyAlgorithm};

/// PBKDF2 rounds for the master key.
pub const KDF_ROUNDS: u32 = 100_000;
const KDF_SALT: &[u8] = b"eks-gateway/software-hsm/v1";
const KEY_FILE_EXT: &str = "key";

/// Plaintext layout: `[algorithm tag || secret scalar]`.
fn algorithm_tag(algorithm: KeyAlgorithm) -> u8 {
    match algorithm {
        KeyAlgorithm::EcdsaSecp256k1 => 0x01,
        KeyAlgorithm::EcdsaP256 => 0x02,
        KeyAlgorithm::EddsaEd25519 => 0x03,
    }
}

fn algorithm_from_tag(tag: u8) -> Result<KeyAlgorithm, HsmError> {
    match tag {
        0x01 => Ok(KeyAlgorithm::EcdsaSecp256k1),
        0x02 => Ok(KeyAlgorithm::EcdsaP256),
        0x03 => Ok(KeyAlgorithm::EddsaEd25519),
        other => Err(HsmError::Internal(format!("unknown key tag {:#04x}", other))),
    }
}

/// Generate a fresh 24-word mnemonic for a new key store.
pub fn generate_mnemonic() -> Result<String, HsmError> {
    let mut entropy = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *entropy);
    let mnemonic = Mnemonic::from_entropy(&*entropy)
        .map_err(|e| HsmError::Internal(format!("mnemonic generation failed: {}", e)))?;
    Ok(mnemonic.to_string())
}

struct Keystore {
    /// Directory holding encrypted key files; `None` keeps ciphertexts in memory.
    dir: Option<PathBuf>,
    /// Master key derived from mnemonic (Zeroized on drop)
    master_key: Zeroizing<[u8; 32]>,
    /// Encrypted blobs: `[nonce (12) || ciphertext]`.
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl Keystore {
    fn cipher(&self) -> Aes256Gcm {
        let key = aes_gcm::aead::generic_array::GenericArray::from_slice(&*self.master_key);
        Aes256Gcm::new(key)
    }

    fn key_path(dir: &Path, handle: &str) -> PathBuf {
        dir.join(format!("{}.{}", handle, KEY_FILE_EXT))
    }

    fn seal(&self, handle: &str, plaintext: &[u8]) -> Result<Vec<u8>, HsmError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = aes_gcm::Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(nonce, Payload { msg: plaintext, aad: handle.as_bytes() })
            .map_err(|e| HsmError::Internal(format!("encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open_blob(&self, handle: &str, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        if blob.len() < 12 {
            return Err(HsmError::Internal(format!("key {} corrupted (too short)", handle)));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher()
            .decrypt(nonce, Payload { msg: ciphertext, aad: handle.as_bytes() })
            .map_err(|_| HsmError::Rejected(format!("key {} failed to decrypt (wrong mnemonic?)", handle)))?;
        Ok(Zeroizing::new(plaintext))
    }

    fn store(&self, handle: &str, blob: Vec<u8>) -> Result<(), HsmError> {
        if let Some(dir) = &self.dir {
            let path = Self::key_path(dir, handle);
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, &blob)
                .and_then(|_| fs::rename(&tmp, &path))
                .map_err(|e| HsmError::Unavailable(format!("keystore write failed: {}", e)))?;
        }
        self.blobs.write().insert(handle.to_string(), blob);
        Ok(())
    }

    fn load(&self, handle: &str) -> Result<Vec<u8>, HsmError> {
        if let Some(blob) = self.blobs.read().get(handle) {
            return Ok(blob.clone());
        }
        let Some(dir) = &self.dir else {
            return Err(HsmError::KeyNotFound(handle.to_string()));
        };
        let path = Self::key_path(dir, handle);
        match fs::read(&path) {
            Ok(blob) => {
                self.blobs.write().insert(handle.to_string(), blob.clone());
                Ok(blob)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HsmError::KeyNotFound(handle.to_string()))
            }
            Err(e) => Err(HsmError::Unavailable(format!("keystore read failed: {}", e))),
        }
    }

    fn remove(&self, handle: &str) -> Result<(), HsmError> {
        let in_memory = self.blobs.write().remove(handle).is_some();
        let on_disk = match &self.dir {
            Some(dir) => match fs::remove_file(Self::key_path(dir, handle)) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(HsmError::Unavailable(format!("keystore delete failed: {}", e))),
            },
            None => false,
        };
        if in_memory || on_disk {
            Ok(())
        } else {
            Err(HsmError::KeyNotFound(handle.to_string()))
        }
    }

    /// Decrypt the key behind `handle` and hand it to `f`; the secret is zeroized afterwards.
    fn with_secret<T>(
        &self,
        handle: &str,
        f: impl FnOnce(KeyAlgorithm, &[u8]) -> Result<T, HsmError>,
    ) -> Result<T, HsmError> {
        let blob = self.load(handle)?;
        let plaintext = self.open_blob(handle, &blob)?;
        let (tag, secret) = plaintext
            .split_first()
            .ok_or_else(|| HsmError::Internal(format!("key {} is empty", handle)))?;
        f(algorithm_from_tag(*tag)?, secret)
    }
}

/// A software-backed HSM that encrypts keys at rest.
#[derive(Clone)]
pub struct SoftwareHsm {
    keystore: Arc<Keystore>,
}

impl SoftwareHsm {
    /// Open a key store protected by `mnemonic_phrase`.
    ///
    /// With `dir = None` keys live only in memory.
    pub fn open(dir: Option<PathBuf>, mnemonic_phrase: &str, passphrase: &str) -> Result<Self, HsmError> {
        let mnemonic = Mnemonic::parse(mnemonic_phrase)
            .map_err(|e| HsmError::Rejected(format!("invalid mnemonic: {}", e)))?;
        let entropy = Zeroizing::new(mnemonic.to_entropy());

        let mut salt = KDF_SALT.to_vec();
        salt.extend_from_slice(passphrase.as_bytes());
        let mut master_key = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<Sha256>(&entropy, &salt, KDF_ROUNDS, &mut *master_key);

        if let Some(dir) = &dir {
            fs::create_dir_all(dir)
                .map_err(|e| HsmError::Unavailable(format!("cannot create keystore dir: {}", e)))?;
        }

        Ok(Self {
            keystore: Arc::new(Keystore { dir, master_key, blobs: RwLock::new(HashMap::new()) }),
        })
    }

    /// An in-memory store with a random master key.
    pub fn ephemeral() -> Self {
        let mut master_key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *master_key);
        Self {
            keystore: Arc::new(Keystore { dir: None, master_key, blobs: RwLock::new(HashMap::new()) }),
        }
    }

    /// Number of keys currently held in memory.
    pub fn loaded_keys(&self) -> usize {
        self.keystore.blobs.read().len()
    }
}

#[async_trait]
impl HsmConnector for SoftwareHsm {
    async fn open_session(&self) -> Result<Box<dyn HsmSession>, HsmError> {
        Ok(Box::new(SoftwareSession { keystore: Arc::clone(&self.keystore) }))
    }
}

struct SoftwareSession {
    keystore: Arc<Keystore>,
}

fn generate_secret(algorithm: KeyAlgorithm) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), HsmError> {
    let der_err = |e: spki_error::Error| HsmError::Internal(format!("public key encoding failed: {}", e));
    match algorithm {
        KeyAlgorithm::EcdsaSecp256k1 => {
            use k256::pkcs8::EncodePublicKey;
            let sk = k256::ecdsa::SigningKey::random(&mut OsRng);
            let der = sk.verifying_key().to_public_key_der().map_err(der_err)?;
            Ok((Zeroizing::new(sk.to_bytes().to_vec()), der.as_bytes().to_vec()))
        }
        KeyAlgorithm::EcdsaP256 => {
            use p256::pkcs8::EncodePublicKey;
            let sk = p256::ecdsa::SigningKey::random(&mut OsRng);
            let der = sk.verifying_key().to_public_key_der().map_err(der_err)?;
            Ok((Zeroizing::new(sk.to_bytes().to_vec()), der.as_bytes().to_vec()))
        }
        KeyAlgorithm::EddsaEd25519 => {
            use ed25519_dalek::pkcs8::EncodePublicKey;
            let sk = ed25519_dalek::SigningKey::generate(&mut OsRng);
            let der = sk.verifying_key().to_public_key_der().map_err(der_err)?;
            Ok((Zeroizing::new(sk.to_bytes().to_vec()), der.as_bytes().to_vec()))
        }
    }
}

/// Re-exported SPKI error type shared by the three curve crates.
mod spki_error {
    pub use k256::pkcs8::spki::Error;
}

fn public_key_der(algorithm: KeyAlgorithm, secret: &[u8]) -> Result<Vec<u8>, HsmError> {
    let bad_key = |e: String| HsmError::Internal(format!("stored key invalid: {}", e));
    let der_err = |e: spki_error::Error| HsmError::Internal(format!("public key encoding failed: {}", e));
    let der = match algorithm {
        KeyAlgorithm::EcdsaSecp256k1 => {
            use k256::pkcs8::EncodePublicKey;
            let sk = k256::ecdsa::SigningKey::from_slice(secret).map_err(|e| bad_key(e.to_string()))?;
            sk.verifying_key().to_public_key_der().map_err(der_err)?
        }
        KeyAlgorithm::EcdsaP256 => {
            use p256::pkcs8::EncodePublicKey;
            let sk = p256::ecdsa::SigningKey::from_slice(secret).map_err(|e| bad_key(e.to_string()))?;
            sk.verifying_key().to_public_key_der().map_err(der_err)?
        }
        KeyAlgorithm::EddsaEd25519 => {
            use ed25519_dalek::pkcs8::EncodePublicKey;
            let bytes: [u8; 32] = secret.try_into().map_err(|_| bad_key("ed25519 seed length".into()))?;
            let sk = ed25519_dalek::SigningKey::from_bytes(&bytes);
            sk.verifying_key().to_public_key_der().map_err(der_err)?
        }
    };
    Ok(der.as_bytes().to_vec())
}

fn sign_digest(algorithm: KeyAlgorithm, secret: &[u8], digest: &[u8]) -> Result<Vec<u8>, HsmError> {
    let bad_key = |e: String| HsmError::Internal(format!("stored key invalid: {}", e));
    match algorithm {
        KeyAlgorithm::EcdsaSecp256k1 => {
            use k256::ecdsa::signature::hazmat::PrehashSigner;
            let sk = k256::ecdsa::SigningKey::from_slice(secret).map_err(|e| bad_key(e.to_string()))?;
            let sig: k256::ecdsa::Signature = sk
                .sign_prehash(digest)
                .map_err(|e| HsmError::Rejected(format!("secp256k1 signing failed: {}", e)))?;
            Ok(sig.to_der().as_bytes().to_vec())
        }
        KeyAlgorithm::EcdsaP256 => {
            use p256::ecdsa::signature::hazmat::PrehashSigner;
            let sk = p256::ecdsa::SigningKey::from_slice(secret).map_err(|e| bad_key(e.to_string()))?;
            let sig: p256::ecdsa::Signature = sk
                .sign_prehash(digest)
                .map_err(|e| HsmError::Rejected(format!("P-256 signing failed: {}", e)))?;
            Ok(sig.to_der().as_bytes().to_vec())
        }
        KeyAlgorithm::EddsaEd25519 => {
            use ed25519_dalek::Signer;
            let bytes: [u8; 32] = secret.try_into().map_err(|_| bad_key("ed25519 seed length".into()))?;
            let sk = ed25519_dalek::SigningKey::from_bytes(&bytes);
            Ok(sk.sign(digest).to_bytes().to_vec())
        }
    }
}

#[async_trait]
impl HsmSession for SoftwareSession {
    async fn generate_key(&mut self, params: &KeyGenParams) -> Result<GeneratedKey, HsmError> {
        let handle = Uuid::new_v4().to_string();
        let (secret, public_key_der) = generate_secret(params.algorithm)?;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(1 + secret.len()));
        plaintext.push(algorithm_tag(params.algorithm));
        plaintext.extend_from_slice(&secret);

        let blob = self.keystore.seal(&handle, &plaintext)?;
        self.keystore.store(&handle, blob)?;
        tracing::debug!(handle = %handle, label = %params.label, algorithm = %params.algorithm, "software HSM generated key");

        Ok(GeneratedKey { handle: HsmHandle::new(handle), public_key_der })
    }

    async fn sign(
        &mut self,
        handle: &HsmHandle,
        algorithm: KeyAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, HsmError> {
        if digest.len() != algorithm.digest_len() {
            return Err(HsmError::Rejected(format!(
                "digest must be {} bytes, got {}",
                algorithm.digest_len(),
                digest.len()
            )));
        }
        self.keystore.with_secret(handle.as_str(), |stored, secret| {
            if stored != algorithm {
                return Err(HsmError::UnsupportedAlgorithm(format!(
                    "key {} is {}, not {}",
                    handle, stored, algorithm
                )));
            }
            sign_digest(stored, secret, digest)
        })
    }

    async fn export_public_key(&mut self, handle: &HsmHandle) -> Result<Vec<u8>, HsmError> {
        self.keystore.with_secret(handle.as_str(), public_key_der)
    }

    async fn destroy_key(&mut self, handle: &HsmHandle) -> Result<(), HsmError> {
        self.keystore.remove(handle.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    async fn generate(hsm: &SoftwareHsm, algorithm: KeyAlgorithm) -> GeneratedKey {
        let mut session = hsm.open_session().await.unwrap();
        session
            .generate_key(&KeyGenParams { algorithm, label: "test".into() })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_secp256k1_signature_verifies() {
        use k256::ecdsa::signature::hazmat::PrehashVerifier;
        use k256::pkcs8::DecodePublicKey;

        let hsm = SoftwareHsm::ephemeral();
        let key = generate(&hsm, KeyAlgorithm::EcdsaSecp256k1).await;
        let digest = crate::utils::sha256(b"payload");
        let mut session = hsm.open_session().await.unwrap();
        let der = session.sign(&key.handle, KeyAlgorithm::EcdsaSecp256k1, &digest).await.unwrap();

        let vk = k256::ecdsa::VerifyingKey::from_public_key_der(&key.public_key_der).unwrap();
        let sig = k256::ecdsa::Signature::from_der(&der).unwrap();
        assert!(vk.verify_prehash(&digest, &sig).is_ok());
    }

    #[tokio::test]
    async fn test_ed25519_signature_verifies() {
        use ed25519_dalek::pkcs8::DecodePublicKey;
        use ed25519_dalek::Verifier;

        let hsm = SoftwareHsm::ephemeral();
        let key = generate(&hsm, KeyAlgorithm::EddsaEd25519).await;
        let digest = crate::utils::sha256(b"payload");
        let mut session = hsm.open_session().await.unwrap();
        let raw = session.sign(&key.handle, KeyAlgorithm::EddsaEd25519, &digest).await.unwrap();

        let vk = ed25519_dalek::VerifyingKey::from_public_key_der(&key.public_key_der).unwrap();
        let sig = ed25519_dalek::Signature::from_slice(&raw).unwrap();
        assert!(vk.verify(&digest, &sig).is_ok());
    }

    #[tokio::test]
    async fn test_export_matches_generated_public_key() {
        let hsm = SoftwareHsm::ephemeral();
        let key = generate(&hsm, KeyAlgorithm::EcdsaP256).await;
        let mut session = hsm.open_session().await.unwrap();
        assert_eq!(session.export_public_key(&key.handle).await.unwrap(), key.public_key_der);
    }

    #[tokio::test]
    async fn test_wrong_algorithm_and_short_digest_are_rejected() {
        let hsm = SoftwareHsm::ephemeral();
        let key = generate(&hsm, KeyAlgorithm::EcdsaP256).await;
        let mut session = hsm.open_session().await.unwrap();
        assert!(matches!(
            session.sign(&key.handle, KeyAlgorithm::EcdsaSecp256k1, &[1u8; 32]).await,
            Err(HsmError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            session.sign(&key.handle, KeyAlgorithm::EcdsaP256, &[1u8; 16]).await,
            Err(HsmError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_destroyed_key_is_gone() {
        let hsm = SoftwareHsm::ephemeral();
        let key = generate(&hsm, KeyAlgorithm::EddsaEd25519).await;
        let mut session = hsm.open_session().await.unwrap();
        session.destroy_key(&key.handle).await.unwrap();
        assert!(matches!(
            session.sign(&key.handle, KeyAlgorithm::EddsaEd25519, &[0u8; 32]).await,
            Err(HsmError::KeyNotFound(_))
        ));
        assert!(matches!(session.destroy_key(&key.handle).await, Err(HsmError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_keys_persist_encrypted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = {
            let hsm = SoftwareHsm::open(Some(dir.path().to_path_buf()), MNEMONIC, "").unwrap();
            generate(&hsm, KeyAlgorithm::EcdsaSecp256k1).await
        };

        let reopened = SoftwareHsm::open(Some(dir.path().to_path_buf()), MNEMONIC, "").unwrap();
        let mut session = reopened.open_session().await.unwrap();
        assert_eq!(session.export_public_key(&key.handle).await.unwrap(), key.public_key_der);

        let wrong = SoftwareHsm::open(Some(dir.path().to_path_buf()), MNEMONIC, "other").unwrap();
        let mut session = wrong.open_session().await.unwrap();
        assert!(matches!(session.export_public_key(&key.handle).await, Err(HsmError::Rejected(_))));
    }

    #[test]
    fn test_generated_mnemonic_parses() {
        let phrase = generate_mnemonic().unwrap();
        assert_eq!(phrase.split_whitespace().count(), 24);
        assert!(SoftwareHsm::open(None, &phrase, "").is_ok());
    }
}
