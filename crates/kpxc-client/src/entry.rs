use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::protocol::{expand_compact_uuid, str_field};

/// A login entry as KeePassXC reports it, or as we hand it over for storage.
///
/// Only username and password are settable; the rest is owned by KeePassXC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    uuid: Option<Uuid>,
    title: String,
    username: String,
    password: String,
    totp: String,
    extra_fields: BTreeMap<String, String>,
}

impl Entry {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Builds an entry from one `get-logins` result object.
    pub fn from_reply(object: &Map<String, Value>) -> Self {
        let text = |key: &str| str_field(object, key).unwrap_or_default().to_owned();

        let uuid = str_field(object, "uuid").and_then(|raw| {
            expand_compact_uuid(raw)
                .and_then(|dashed| Uuid::parse_str(&dashed).ok())
                .or_else(|| Uuid::parse_str(raw).ok())
        });

        let mut extra_fields = BTreeMap::new();
        if let Some(Value::Array(fields)) = object.get("stringFields") {
            for field in fields.iter().filter_map(Value::as_object) {
                for (key, value) in field {
                    if let Some(value) = value.as_str() {
                        extra_fields.insert(key.clone(), value.to_owned());
                    }
                }
            }
        }

        Self {
            uuid,
            title: text("name"),
            username: text("login"),
            password: text("password"),
            totp: text("totp"),
            extra_fields,
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub fn totp(&self) -> &str {
        &self.totp
    }

    pub fn extra_fields(&self) -> &BTreeMap<String, String> {
        &self.extra_fields
    }

    pub fn extra_field(&self, name: &str) -> Option<&str> {
        self.extra_fields.get(name).map(String::as_str)
    }

    /// True for entries that exist in KeePassXC, i.e. carry a UUID.
    pub fn is_stored(&self) -> bool {
        self.uuid.is_some()
    }

    /// UUID without dashes, the form `set-login` expects.
    pub fn compact_uuid(&self) -> Option<String> {
        self.uuid.map(|uuid| uuid.simple().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_objects_are_mapped() {
        let reply = json!({
            "uuid": "0123456789abcdef0123456789abcdef",
            "name": "Example",
            "login": "alice",
            "password": "s3cret",
            "totp": "123456",
            "stringFields": [{"KPH: pin": "0000"}, {"KPH: note": "x"}, "ignored"]
        });
        let entry = Entry::from_reply(reply.as_object().unwrap());
        assert_eq!(
            entry.uuid().unwrap().to_string(),
            "01234567-89ab-cdef-0123-456789abcdef"
        );
        assert_eq!(entry.title(), "Example");
        assert_eq!(entry.username(), "alice");
        assert_eq!(entry.password(), "s3cret");
        assert_eq!(entry.totp(), "123456");
        assert_eq!(entry.extra_fields().len(), 2);
        assert_eq!(entry.extra_field("KPH: pin"), Some("0000"));
        assert!(entry.is_stored());
        assert_eq!(entry.compact_uuid().as_deref(), Some("0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn missing_fields_default() {
        let entry = Entry::from_reply(json!({"login": "bob", "uuid": "nope"}).as_object().unwrap());
        assert_eq!(entry.username(), "bob");
        assert!(entry.uuid().is_none());
        assert!(entry.password().is_empty());
        assert!(entry.extra_fields().is_empty());
    }

    #[test]
    fn setters() {
        let mut entry = Entry::new("alice", "old");
        entry.set_password("new");
        entry.set_username("carol");
        assert_eq!(entry.password(), "new");
        assert_eq!(entry.username(), "carol");
        assert!(entry.compact_uuid().is_none());
        assert!(!entry.is_stored());
    }
}
