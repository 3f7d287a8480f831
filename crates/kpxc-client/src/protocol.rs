//! KeePassXC browser protocol vocabulary: actions, peer error codes, the
//! outbound envelopes and the checks every inbound envelope goes through.

use semver::Version;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ClientError;

/// Oldest KeePassXC release whose proxy protocol is understood.
pub const MIN_VERSION: &str = "2.3.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ChangePublicKeys,
    GetDatabaseHash,
    Associate,
    TestAssociate,
    GeneratePassword,
    GetLogins,
    SetLogin,
    LockDatabase,
    DatabaseLocked,
    DatabaseUnlocked,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ChangePublicKeys => "change-public-keys",
            Action::GetDatabaseHash => "get-databasehash",
            Action::Associate => "associate",
            Action::TestAssociate => "test-associate",
            Action::GeneratePassword => "generate-password",
            Action::GetLogins => "get-logins",
            Action::SetLogin => "set-login",
            Action::LockDatabase => "lock-database",
            Action::DatabaseLocked => "database-locked",
            Action::DatabaseUnlocked => "database-unlocked",
        }
    }

    pub fn from_wire(action: &str) -> Option<Self> {
        let action = match action {
            "change-public-keys" => Action::ChangePublicKeys,
            "get-databasehash" => Action::GetDatabaseHash,
            "associate" => Action::Associate,
            "test-associate" => Action::TestAssociate,
            "generate-password" => Action::GeneratePassword,
            "get-logins" => Action::GetLogins,
            "set-login" => Action::SetLogin,
            "lock-database" => Action::LockDatabase,
            "database-locked" => Action::DatabaseLocked,
            "database-unlocked" => Action::DatabaseUnlocked,
            _ => return None,
        };
        Some(action)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes KeePassXC puts in `errorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyErrorCode {
    DatabaseNotOpened,
    DatabaseHashNotReceived,
    PublicKeyNotReceived,
    CannotDecryptMessage,
    Timeout,
    ActionDenied,
    CannotEncryptMessage,
    AssociationFailed,
    KeyChangeFailed,
    EncryptionKeyUnrecognized,
    NoSavedDatabasesFound,
    IncorrectAction,
    EmptyMessageReceived,
    NoUrlProvided,
    NoLoginsFound,
    Other(i64),
}

impl ProxyErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::DatabaseNotOpened,
            2 => Self::DatabaseHashNotReceived,
            3 => Self::PublicKeyNotReceived,
            4 => Self::CannotDecryptMessage,
            5 => Self::Timeout,
            6 => Self::ActionDenied,
            7 => Self::CannotEncryptMessage,
            8 => Self::AssociationFailed,
            9 => Self::KeyChangeFailed,
            10 => Self::EncryptionKeyUnrecognized,
            11 => Self::NoSavedDatabasesFound,
            12 => Self::IncorrectAction,
            13 => Self::EmptyMessageReceived,
            14 => Self::NoUrlProvided,
            15 => Self::NoLoginsFound,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::DatabaseNotOpened => 1,
            Self::DatabaseHashNotReceived => 2,
            Self::PublicKeyNotReceived => 3,
            Self::CannotDecryptMessage => 4,
            Self::Timeout => 5,
            Self::ActionDenied => 6,
            Self::CannotEncryptMessage => 7,
            Self::AssociationFailed => 8,
            Self::KeyChangeFailed => 9,
            Self::EncryptionKeyUnrecognized => 10,
            Self::NoSavedDatabasesFound => 11,
            Self::IncorrectAction => 12,
            Self::EmptyMessageReceived => 13,
            Self::NoUrlProvided => 14,
            Self::NoLoginsFound => 15,
            Self::Other(code) => code,
        }
    }

    /// Failures the user can fix (unlock, confirm, retry) without a new session.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::DatabaseNotOpened
                | Self::Timeout
                | Self::ActionDenied
                | Self::AssociationFailed
                | Self::IncorrectAction
                | Self::EmptyMessageReceived
                | Self::NoUrlProvided
                | Self::NoLoginsFound
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeRequest {
    pub action: &'static str,
    pub public_key: String,
    pub nonce: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
}

/// KeePassXC compares `triggerUnlock` against the string `"true"`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRequest<'a> {
    pub action: &'a str,
    pub message: String,
    pub nonce: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_unlock: Option<&'static str>,
}

pub fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

/// Accepts both `"true"` and `true`; KeePassXC has sent either over the years.
pub fn bool_field(object: &Map<String, Value>, key: &str) -> Option<bool> {
    match object.get(key)? {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => Some(text == "true"),
        _ => None,
    }
}

/// Parses `2.7`, `2.7.4` or `2.7.4-snapshot` leniently into a comparable version.
pub fn parse_version(text: &str) -> Option<Version> {
    let core = text.trim().split(['-', '+', ' ']).next()?;
    let mut parts = core.split('.').map(str::parse::<u64>);
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// Rejects envelopes announcing an older KeePassXC. A missing or unparsable
/// version is not an error.
pub fn check_version(object: &Map<String, Value>) -> Result<(), ClientError> {
    let Some(text) = str_field(object, "version") else {
        return Ok(());
    };
    let (Some(found), Some(minimum)) = (parse_version(text), parse_version(MIN_VERSION)) else {
        return Ok(());
    };
    if found < minimum {
        return Err(ClientError::UnsupportedVersion {
            minimum: minimum.to_string(),
            found: text.to_owned(),
        });
    }
    Ok(())
}

/// A reply is a failure when it carries an `errorCode` or `error`, or says
/// `success: false` outright.
pub fn reply_failure(object: &Map<String, Value>) -> Option<ClientError> {
    let code = match object.get("errorCode") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let message = str_field(object, "error").map(str::to_owned);
    let failed = bool_field(object, "success") == Some(false);

    if code.is_none() && message.is_none() && !failed {
        return None;
    }
    Some(ClientError::Proxy {
        code: ProxyErrorCode::from_code(code.unwrap_or(0)),
        message: message.unwrap_or_else(|| "KeePassXC reported a failure".to_owned()),
    })
}

/// Formats a dash-less 32 hex digit UUID as `8-4-4-4-12`.
pub fn expand_compact_uuid(compact: &str) -> Option<String> {
    if compact.len() != 32 || !compact.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!(
        "{}-{}-{}-{}-{}",
        &compact[0..8],
        &compact[8..12],
        &compact[12..16],
        &compact[16..20],
        &compact[20..32]
    ))
}
