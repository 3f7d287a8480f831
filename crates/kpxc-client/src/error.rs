use thiserror::Error;

use crate::codec::FrameError;
use crate::crypto::CryptoError;
use crate::protocol::ProxyErrorCode;
use crate::secure_memory::MemoryError;

/// Everything a session can report. Errors raised by KeePassXC itself keep
/// their wire code; client-side errors use codes from `0x10000` upward so the
/// two ranges never collide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("{message}")]
    Proxy { code: ProxyErrorCode, message: String },

    #[error("Already connected to a KeePassXC instance")]
    AlreadyConnected,

    #[error("Failed to generate session keys")]
    KeyGenerationFailed,

    #[error("Unexpected nonce received from KeePassXC")]
    ReceivedNonceInvalid,

    #[error("Received JSON-data is invalid. JSON-Error: {0}")]
    JsonParse(String),

    #[error("Data-Action field of encrypted and unencrypted message are not equal")]
    ActionsDontMatch,

    #[error("Unsupported KeePassXC Version. Must be at least {minimum}, but currently is {found}")]
    UnsupportedVersion { minimum: String, found: String },

    #[error("The opened database in KeePassXC was changed")]
    DatabaseChanged,

    #[error("The database hash was not known and thus rejected")]
    DatabaseRejected,

    #[error("An unsupported action was received from KeePassXC: {0}")]
    UnsupportedAction(String),

    #[error("Failed to encrypt message for KeePassXC")]
    EncryptionFailed,

    #[error("Failed to decrypt message from KeePassXC")]
    DecryptionFailed,

    #[error("Not connected to KeePassXC")]
    NotConnected,

    #[error("No association exists for the current database")]
    NotAssociated,

    #[error("Secure memory failure: {0}")]
    SecureMemory(String),

    #[error("Failed to persist client identity: {0}")]
    Registry(String),

    #[error("Failed to start proxy {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Proxy process exited unexpectedly: {0}")]
    ProcessCrashed(String),

    #[error("Proxy I/O failed: {0}")]
    Io(String),
}

impl ClientError {
    pub fn code(&self) -> i64 {
        match self {
            ClientError::Proxy { code, .. } => code.code(),
            ClientError::AlreadyConnected => 0x1_0000,
            ClientError::KeyGenerationFailed => 0x2_0000,
            ClientError::ReceivedNonceInvalid => 0x3_0000,
            ClientError::JsonParse(_) => 0x4_0000,
            ClientError::ActionsDontMatch => 0x5_0000,
            ClientError::UnsupportedVersion { .. } => 0x6_0000,
            ClientError::DatabaseChanged => 0x7_0000,
            ClientError::DatabaseRejected => 0x8_0000,
            ClientError::UnsupportedAction(_) => 0x9_0000,
            ClientError::EncryptionFailed => 0xA_0000,
            ClientError::DecryptionFailed => 0xB_0000,
            ClientError::NotConnected => 0xC_0000,
            ClientError::NotAssociated => 0xD_0000,
            ClientError::SecureMemory(_) => 0xE_0000,
            ClientError::Registry(_) => 0xF_0000,
            ClientError::SpawnFailed { .. } => 0x10_0000,
            ClientError::ProcessCrashed(_) => 0x11_0000,
            ClientError::Io(_) => 0x12_0000,
        }
    }

    /// Unrecoverable errors end the session: the client disconnects and drops
    /// its session secrets before the error is surfaced.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Proxy { code, .. } => code.is_recoverable(),
            ClientError::AlreadyConnected
            | ClientError::NotConnected
            | ClientError::NotAssociated
            | ClientError::Registry(_) => true,
            _ => false,
        }
    }
}

impl From<MemoryError> for ClientError {
    fn from(err: MemoryError) -> Self {
        ClientError::SecureMemory(err.to_string())
    }
}

impl From<CryptoError> for ClientError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyGeneration(_) | CryptoError::NoKeys => ClientError::KeyGenerationFailed,
            CryptoError::Encrypt => ClientError::EncryptionFailed,
            CryptoError::Decrypt | CryptoError::InvalidNonce(_) => ClientError::DecryptionFailed,
            CryptoError::Memory(err) => err.into(),
            other => ClientError::SecureMemory(other.to_string()),
        }
    }
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Json(err) => ClientError::JsonParse(err.to_string()),
            FrameError::TooLarge(len) => ClientError::JsonParse(format!("frame of {len} bytes is too large")),
        }
    }
}

/// Error as surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub error: ClientError,
    /// Action the failure belongs to, when it could be attributed.
    pub action: Option<String>,
    pub unrecoverable: bool,
}
