//! Encrypted request/reply layer over the proxy, without any I/O.
//!
//! Nonce discipline: a request goes out under nonce `n`, KeePassXC answers
//! under `n + 1`, and our next request uses `n + 2`. Each direction therefore
//! uses a nonce exactly once under the shared key. Reply nonces we are still
//! waiting for are remembered together with the action that used them. A
//! reply under any other nonce, or naming another action, is rejected.

use base64::{engine::general_purpose, Engine as _};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::codec::encode_frame;
use crate::crypto::{CryptoBox, CryptoInit, NONCE_SIZE};
use crate::error::ClientError;
use crate::protocol::{
    check_version, reply_failure, str_field, Action, EncryptedRequest, KeyExchangeRequest, ProxyErrorCode,
};
use crate::secure_memory::{MemoryState, SecureBuffer};

/// Replies that never arrive (KeePassXC error replies carry no nonce) must
/// not grow the expected set forever.
const MAX_PENDING_NONCES: usize = 64;

/// A reply we are still waiting for.
struct PendingReply {
    nonce: SecureBuffer,
    action: String,
}

/// What one inbound envelope turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `change-public-keys` succeeded; encrypted traffic may start.
    KeysExchanged,
    Locked,
    Unlocked,
    Message { action: String, message: Map<String, Value> },
    /// A reply that failed, attributed to its action.
    Failed { action: String, error: ClientError },
    /// Could not be attributed to any action.
    Invalid(ClientError),
}

pub struct SecureChannel {
    crypto: CryptoBox,
    client_id: SecureBuffer,
    nonce: SecureBuffer,
    server_key: SecureBuffer,
    pending: Vec<PendingReply>,
}

impl SecureChannel {
    pub fn new(init: CryptoInit) -> Self {
        Self {
            crypto: CryptoBox::new(init),
            client_id: SecureBuffer::new(),
            nonce: SecureBuffer::new(),
            server_key: SecureBuffer::new(),
            pending: Vec::new(),
        }
    }

    /// Fresh key pair, client id and starting nonce for a new connection.
    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.clear();
        self.crypto.generate_key_pair().map_err(|err| {
            warn!(error = %err, "session key generation failed");
            ClientError::KeyGenerationFailed
        })?;
        self.client_id = self
            .crypto
            .random_bytes(NONCE_SIZE, MemoryState::ReadOnly)
            .map_err(|_| ClientError::KeyGenerationFailed)?;
        self.nonce = self
            .crypto
            .random_nonce(MemoryState::ReadOnly)
            .map_err(|_| ClientError::KeyGenerationFailed)?;
        Ok(())
    }

    /// Drops every secret this channel holds.
    pub fn clear(&mut self) {
        self.crypto.drop_keys();
        self.client_id.deallocate();
        self.nonce.deallocate();
        self.server_key.deallocate();
        self.pending.clear();
    }

    pub fn crypto(&self) -> &CryptoBox {
        &self.crypto
    }

    /// True once KeePassXC's public key is known.
    pub fn is_established(&self) -> bool {
        self.server_key.is_allocated()
    }

    /// The unencrypted `change-public-keys` request, framed.
    pub fn key_exchange(&mut self) -> Result<Vec<u8>, ClientError> {
        let request = KeyExchangeRequest {
            action: Action::ChangePublicKeys.as_str(),
            public_key: self.crypto.public_key_base64()?,
            nonce: self.nonce.to_base64()?,
            client_id: self.client_id.to_base64()?,
        };
        let frame = encode_frame(&request)?;
        self.advance_nonce(Action::ChangePublicKeys.as_str())?;
        Ok(frame)
    }

    /// Encrypts `payload` (its `action` field is set here) into a framed envelope.
    pub fn seal(
        &mut self,
        action: &str,
        mut payload: Map<String, Value>,
        trigger_unlock: bool,
    ) -> Result<Vec<u8>, ClientError> {
        if !self.is_established() {
            return Err(ClientError::NotConnected);
        }
        payload.insert("action".into(), Value::String(action.to_owned()));
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&payload).map_err(|e| ClientError::JsonParse(e.to_string()))?,
        );
        let ciphertext = self
            .crypto
            .encrypt(&plaintext, &self.server_key, &self.nonce)
            .map_err(|err| {
                warn!(error = %err, action, "encryption failed");
                ClientError::EncryptionFailed
            })?;

        let request = EncryptedRequest {
            action,
            message: general_purpose::STANDARD.encode(ciphertext),
            nonce: self.nonce.to_base64()?,
            client_id: self.client_id.to_base64()?,
            trigger_unlock: trigger_unlock.then_some("true"),
        };
        let frame = encode_frame(&request)?;
        self.advance_nonce(action)?;
        Ok(frame)
    }

    /// Validates one decoded frame.
    pub fn open(&mut self, frame: Value) -> Inbound {
        let Value::Object(envelope) = frame else {
            return Inbound::Invalid(ClientError::JsonParse("envelope is not an object".into()));
        };
        let Some(action) = str_field(&envelope, "action").map(str::to_owned) else {
            return Inbound::Invalid(ClientError::JsonParse("envelope has no action".into()));
        };

        match Action::from_wire(&action) {
            Some(Action::DatabaseLocked) => return Inbound::Locked,
            Some(Action::DatabaseUnlocked) => return Inbound::Unlocked,
            _ => {}
        }

        match self.open_reply(&action, &envelope) {
            Ok(inbound) => inbound,
            Err(error) => Inbound::Failed { action, error },
        }
    }

    fn open_reply(&mut self, action: &str, envelope: &Map<String, Value>) -> Result<Inbound, ClientError> {
        check_version(envelope)?;
        if let Some(error) = reply_failure(envelope) {
            return Err(error);
        }
        let nonce = self.claim_nonce(action, envelope)?;

        if action == Action::ChangePublicKeys.as_str() {
            let key = str_field(envelope, "publicKey").ok_or_else(|| ClientError::Proxy {
                code: ProxyErrorCode::PublicKeyNotReceived,
                message: "Key exchange reply carries no public key".into(),
            })?;
            self.server_key = SecureBuffer::from_base64(key, MemoryState::ReadOnly)?;
            debug!("server public key received");
            return Ok(Inbound::KeysExchanged);
        }

        if !self.is_established() {
            return Err(ClientError::NotConnected);
        }
        let ciphertext = str_field(envelope, "message")
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ClientError::Proxy {
                code: ProxyErrorCode::EmptyMessageReceived,
                message: "Reply carries no encrypted message".into(),
            })?;
        let ciphertext = general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|_| ClientError::DecryptionFailed)?;
        let plaintext = self
            .crypto
            .decrypt(&ciphertext, &self.server_key, &nonce)
            .map_err(|err| {
                warn!(error = %err, action, "reply failed to decrypt");
                ClientError::DecryptionFailed
            })?;
        let message: Map<String, Value> =
            serde_json::from_slice(&plaintext).map_err(|e| ClientError::JsonParse(e.to_string()))?;

        if let Some(inner) = str_field(&message, "action") {
            if inner != action {
                return Err(ClientError::ActionsDontMatch);
            }
        }
        if let Some(inner_nonce) = str_field(&message, "nonce") {
            if inner_nonce != str_field(envelope, "nonce").unwrap_or_default() {
                return Err(ClientError::ReceivedNonceInvalid);
            }
        }
        check_version(&message)?;
        if let Some(error) = reply_failure(&message) {
            return Err(error);
        }
        Ok(Inbound::Message {
            action: action.to_owned(),
            message,
        })
    }

    /// The nonce must belong to a request for the same action. A mismatch
    /// leaves the request pending.
    fn claim_nonce(&mut self, action: &str, envelope: &Map<String, Value>) -> Result<SecureBuffer, ClientError> {
        let encoded = str_field(envelope, "nonce").ok_or(ClientError::ReceivedNonceInvalid)?;
        let nonce = SecureBuffer::from_base64(encoded, MemoryState::ReadOnly)
            .map_err(|_| ClientError::ReceivedNonceInvalid)?;
        let index = self
            .pending
            .iter()
            .position(|pending| pending.nonce == nonce)
            .ok_or(ClientError::ReceivedNonceInvalid)?;
        if self.pending[index].action != action {
            warn!(action, expected = %self.pending[index].action, "reply names another action");
            return Err(ClientError::ActionsDontMatch);
        }
        Ok(self.pending.remove(index).nonce)
    }

    fn advance_nonce(&mut self, action: &str) -> Result<(), ClientError> {
        self.nonce.increment()?;
        if self.pending.len() == MAX_PENDING_NONCES {
            self.pending.remove(0);
        }
        self.pending.push(PendingReply {
            nonce: self.nonce.try_clone()?,
            action: action.to_owned(),
        });
        self.nonce.increment()?;
        Ok(())
    }
}
