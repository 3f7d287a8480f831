//! Public-key authenticated encryption
//!
//! NaCl `crypto_box`: X25519 key agreement + XSalsa20-Poly1305, the layout
//! KeePassXC speaks over the browser proxy (libsodium compatible).
//! Key size: 32 bytes.  Nonce: 24 bytes.  Tag: 16 bytes.
//!
//! Keys never leave [`SecureBuffer`]s except for the duration of a single
//! encrypt/decrypt call.

use crypto_box::{
    aead::{generic_array::GenericArray, Aead},
    PublicKey, SalsaBox, SecretKey,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::secure_memory::{MemoryError, MemoryState, SecureBuffer};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const MAC_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Crypto initialisation failed: {0}")]
    Init(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("No key pair has been generated")]
    NoKeys,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid nonce length {0}, expected {NONCE_SIZE}")]
    InvalidNonce(usize),

    #[error("Box encryption failed")]
    Encrypt,

    #[error("Box decryption failed (authentication tag mismatch or wrong key/nonce)")]
    Decrypt,

    #[error("Random generation failed: {0}")]
    Random(String),

    #[error("Secure memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Proof that the crypto backend came up. Required to build a [`CryptoBox`].
#[derive(Debug, Clone, Copy)]
pub struct CryptoInit {
    _private: (),
}

impl CryptoInit {
    /// Checks the OS random source and the secure allocator once per process.
    pub fn init() -> Result<Self, CryptoError> {
        let mut sample = [0u8; KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut sample)
            .map_err(|e| CryptoError::Init(e.to_string()))?;
        sample.zeroize();

        SecureBuffer::with_len(KEY_SIZE, MemoryState::NoAccess)
            .map_err(|e| CryptoError::Init(e.to_string()))?;

        tracing::debug!("crypto backend initialised");
        Ok(Self { _private: () })
    }
}

struct KeyPair {
    secret: SecureBuffer,
    public: SecureBuffer,
}

pub struct CryptoBox {
    keys: Option<KeyPair>,
}

impl CryptoBox {
    pub fn new(_init: CryptoInit) -> Self {
        Self { keys: None }
    }

    /// Replaces any existing key pair. Secret key ends NoAccess, public key ReadOnly.
    pub fn generate_key_pair(&mut self) -> Result<(), CryptoError> {
        self.drop_keys();

        let keygen = |e: MemoryError| CryptoError::KeyGeneration(e.to_string());
        let mut secret = SecureBuffer::with_len(KEY_SIZE, MemoryState::ReadWrite).map_err(keygen)?;
        let mut public = SecureBuffer::with_len(KEY_SIZE, MemoryState::ReadWrite).map_err(keygen)?;
        {
            let mut sk = secret.write().map_err(keygen)?;
            OsRng
                .try_fill_bytes(&mut sk)
                .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
            let mut raw = Zeroizing::new([0u8; KEY_SIZE]);
            raw.copy_from_slice(&sk);
            let derived = SecretKey::from(take_key(&mut raw)).public_key();
            public.write().map_err(keygen)?.copy_from_slice(derived.as_bytes());
        }
        secret.make_no_access().map_err(keygen)?;
        public.make_read_only().map_err(keygen)?;

        self.keys = Some(KeyPair { secret, public });
        Ok(())
    }

    pub fn drop_keys(&mut self) {
        self.keys = None;
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    pub fn public_key(&self) -> Option<&SecureBuffer> {
        self.keys.as_ref().map(|keys| &keys.public)
    }

    pub fn public_key_base64(&self) -> Result<String, CryptoError> {
        let key = self.public_key().ok_or(CryptoError::NoKeys)?;
        Ok(key.to_base64()?)
    }

    /// Fresh random bytes from the OS generator, left in `state`.
    pub fn random_bytes(&self, len: usize, state: MemoryState) -> Result<SecureBuffer, CryptoError> {
        let mut buffer = SecureBuffer::with_len(len, MemoryState::ReadWrite)?;
        OsRng
            .try_fill_bytes(&mut buffer.write()?)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        buffer.set_state(state)?;
        Ok(buffer)
    }

    pub fn random_nonce(&self, state: MemoryState) -> Result<SecureBuffer, CryptoError> {
        self.random_bytes(NONCE_SIZE, state)
    }

    /// Output is `MAC_SIZE + plaintext.len()` bytes.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        peer_public: &SecureBuffer,
        nonce: &SecureBuffer,
    ) -> Result<Vec<u8>, CryptoError> {
        let salsa = self.salsa_box(peer_public)?;
        let nonce = nonce_bytes(nonce)?;
        salsa
            .encrypt(GenericArray::from_slice(&nonce[..]), plaintext)
            .map_err(|_| CryptoError::Encrypt)
    }

    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        peer_public: &SecureBuffer,
        nonce: &SecureBuffer,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() < MAC_SIZE {
            return Err(CryptoError::Decrypt);
        }
        let salsa = self.salsa_box(peer_public)?;
        let nonce = nonce_bytes(nonce)?;
        salsa
            .decrypt(GenericArray::from_slice(&nonce[..]), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Decrypt)
    }

    fn salsa_box(&self, peer_public: &SecureBuffer) -> Result<SalsaBox, CryptoError> {
        let keys = self.keys.as_ref().ok_or(CryptoError::NoKeys)?;

        let peer = {
            let view = peer_public.read()?;
            let bytes: [u8; KEY_SIZE] = view
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKey(format!("peer key is {} bytes", view.len())))?;
            PublicKey::from(bytes)
        };

        // The secret key is only readable inside this block.
        let secret = {
            let view = keys.secret.read()?;
            let mut raw = Zeroizing::new([0u8; KEY_SIZE]);
            raw.copy_from_slice(&view);
            SecretKey::from(take_key(&mut raw))
        };

        Ok(SalsaBox::new(&peer, &secret))
    }
}

/// Moves the key bytes out, leaving zeros behind. `SecretKey` wipes its own
/// copy on drop.
fn take_key(raw: &mut Zeroizing<[u8; KEY_SIZE]>) -> [u8; KEY_SIZE] {
    std::mem::take(&mut **raw)
}

fn nonce_bytes(nonce: &SecureBuffer) -> Result<[u8; NONCE_SIZE], CryptoError> {
    let view = nonce.read()?;
    view.as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidNonce(view.len()))
}
