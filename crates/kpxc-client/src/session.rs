//! Database-level session on top of a [`Link`].
//!
//! A session tracks which KeePassXC database it is bound to, pairs with it
//! (associate / test-associate) and turns replies into [`ClientEvent`]s.
//! It never blocks: commands queue requests on the link, and results arrive
//! later through [`Session::handle_transport_event`].

use std::collections::VecDeque;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, ClientOptions};
use crate::crypto::{CryptoInit, KEY_SIZE};
use crate::entry::Entry;
use crate::error::{ClientError, ErrorEvent};
use crate::protocol::{str_field, Action, ProxyErrorCode};
use crate::registry::{ClientId, DatabaseRegistry};
use crate::secure_memory::{MemoryState, SecureBuffer};
use crate::transport::{Link, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    StateChanged(ClientState),
    /// The session is now bound to this database hash.
    CurrentDatabaseChanged(Vec<u8>),
    DatabaseOpened(Vec<u8>),
    DatabaseClosed,
    PasswordsGenerated(Vec<String>),
    LoginsReceived(Vec<Entry>),
    LoginAdded,
    Error(ErrorEvent),
}

/// Parameters of a `get-logins` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginQuery {
    url: String,
    submit_url: Option<String>,
    http_auth: bool,
    search_all_databases: bool,
}

impl LoginQuery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            submit_url: None,
            http_auth: false,
            search_all_databases: false,
        }
    }

    /// Defaults to the url itself.
    pub fn submit_url(mut self, submit_url: impl Into<String>) -> Self {
        self.submit_url = Some(submit_url.into());
        self
    }

    pub fn http_auth(mut self, http_auth: bool) -> Self {
        self.http_auth = http_auth;
        self
    }

    /// Query every database we hold an association for, not just the current one.
    pub fn search_all_databases(mut self, search_all: bool) -> Self {
        self.search_all_databases = search_all;
        self
    }
}

type DatabaseFilter = Box<dyn Fn(&[u8]) -> bool + Send>;

pub struct Session<L: Link = Transport> {
    link: L,
    registry: Box<dyn DatabaseRegistry>,
    options: ClientOptions,
    program: String,
    current_database: Option<Vec<u8>>,
    locked: bool,
    pending_key: Option<SecureBuffer>,
    testing_association: bool,
    database_filter: Option<DatabaseFilter>,
    events: VecDeque<ClientEvent>,
    last_state: ClientState,
}

/// Session over the real proxy process.
pub type Client = Session<Transport>;

impl Session<Transport> {
    pub fn new(init: CryptoInit, config: &ClientConfig, registry: Box<dyn DatabaseRegistry>) -> Self {
        Self::with_link(
            Transport::new(init, config),
            registry,
            config.options,
            config.proxy_program.clone(),
        )
    }

    /// Drives the proxy until the session has something to report. `None`
    /// once disconnected with nothing left to deliver.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            let event = self.link.next_event().await?;
            self.handle_transport_event(event);
        }
    }
}

impl<L: Link> Session<L> {
    pub fn with_link(
        link: L,
        registry: Box<dyn DatabaseRegistry>,
        options: ClientOptions,
        program: impl Into<String>,
    ) -> Self {
        Self {
            link,
            registry,
            options,
            program: program.into(),
            current_database: None,
            locked: true,
            pending_key: None,
            testing_association: false,
            database_filter: None,
            events: VecDeque::new(),
            last_state: ClientState::Disconnected,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn registry(&self) -> &dyn DatabaseRegistry {
        self.registry.as_ref()
    }

    pub fn options(&self) -> ClientOptions {
        self.options
    }

    pub fn set_options(&mut self, options: ClientOptions) {
        self.options = options;
    }

    /// Decides whether to associate with a database we hold no identity for.
    /// Replaces the `allow_new_database` option while set.
    pub fn set_database_filter<F>(&mut self, filter: F)
    where
        F: Fn(&[u8]) -> bool + Send + 'static,
    {
        self.database_filter = Some(Box::new(filter));
    }

    pub fn state(&self) -> ClientState {
        if self.link.is_connected() {
            if self.locked {
                ClientState::Locked
            } else {
                ClientState::Unlocked
            }
        } else if self.link.is_connecting() {
            ClientState::Connecting
        } else {
            ClientState::Disconnected
        }
    }

    pub fn current_database(&self) -> Option<&[u8]> {
        self.current_database.as_deref()
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn connect(&mut self) {
        let program = self.program.clone();
        self.connect_to(&program);
    }

    pub fn connect_to(&mut self, program: &str) {
        if self.link.is_connected() || self.link.is_connecting() {
            self.raise(None, ClientError::AlreadyConnected);
            return;
        }
        self.clear();
        if let Err(error) = self.link.connect(program) {
            self.raise(None, error);
        }
        self.sync_state();
    }

    /// Takes one step of the link's disconnect sequence.
    pub fn disconnect(&mut self) {
        self.pending_key = None;
        self.link.disconnect();
        self.sync_state();
    }

    /// Asks KeePassXC which database is open. Only meaningful while locked.
    pub fn open_database(&mut self) {
        if self.state() != ClientState::Locked {
            return;
        }
        self.link.send_encrypted(
            Action::GetDatabaseHash.as_str(),
            Map::new(),
            self.options.trigger_unlock,
        );
    }

    pub fn close_database(&mut self) {
        if self.state() != ClientState::Unlocked {
            return;
        }
        self.link
            .send_encrypted(Action::LockDatabase.as_str(), Map::new(), false);
    }

    pub fn generate_password(&mut self) {
        self.link
            .send_encrypted(Action::GeneratePassword.as_str(), Map::new(), false);
    }

    pub fn get_logins(&mut self, query: &LoginQuery) {
        let action = Action::GetLogins.as_str();
        match self.logins_request(query) {
            Ok(message) => self.link.send_encrypted(action, message, false),
            Err(error) => self.raise(Some(action), error),
        }
    }

    /// Stores `entry` for `url`. An entry with a UUID updates that entry.
    pub fn add_login(&mut self, url: &str, entry: &Entry, submit_url: Option<&str>) {
        let action = Action::SetLogin.as_str();
        let name = match self.current_client_id().map(|id| id.name.clone()) {
            Ok(name) => name,
            Err(error) => return self.raise(Some(action), error),
        };
        let mut message = Map::new();
        message.insert("id".into(), name.into());
        message.insert("url".into(), url.into());
        message.insert("submitUrl".into(), submit_url.unwrap_or(url).into());
        if let Some(uuid) = entry.compact_uuid() {
            message.insert("uuid".into(), uuid.into());
        }
        message.insert("login".into(), entry.username().into());
        message.insert("password".into(), entry.password().into());
        self.link.send_encrypted(action, message, false);
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.events.push_back(ClientEvent::Connected);
                if self.options.open_on_connect {
                    self.open_database();
                }
            }
            TransportEvent::Disconnected => {
                self.events.push_back(ClientEvent::Disconnected);
                self.clear();
            }
            TransportEvent::Locked => self.on_locked(),
            TransportEvent::Unlocked => {
                if self.locked {
                    self.open_database();
                }
            }
            TransportEvent::Message { action, message } => self.on_message(&action, message),
            TransportEvent::Failed { action, error } => self.on_failed(&action, error),
            TransportEvent::Error(error) => self.raise(None, error),
        }
        self.sync_state();
    }

    fn on_message(&mut self, action: &str, message: Map<String, Value>) {
        match Action::from_wire(action) {
            Some(Action::GetDatabaseHash) => self.on_database_hash(&message),
            Some(Action::Associate) => self.on_associate(&message),
            Some(Action::TestAssociate) => self.on_test_associate(&message),
            Some(Action::GeneratePassword) => self.on_passwords(&message),
            Some(Action::GetLogins) => self.on_logins(&message),
            Some(Action::SetLogin) => self.events.push_back(ClientEvent::LoginAdded),
            Some(Action::LockDatabase) => self.on_locked(),
            _ => self.raise(Some(action), ClientError::UnsupportedAction(action.to_owned())),
        }
    }

    fn on_failed(&mut self, action: &str, error: ClientError) {
        if Action::from_wire(action) == Some(Action::TestAssociate) {
            self.testing_association = false;
        }
        match (Action::from_wire(action), &error) {
            (
                Some(Action::GetDatabaseHash),
                ClientError::Proxy {
                    code: ProxyErrorCode::DatabaseNotOpened,
                    ..
                },
            ) if self.options.trigger_unlock => {
                debug!("database is locked, waiting for KeePassXC to unlock it");
            }
            (
                Some(Action::TestAssociate),
                ClientError::Proxy {
                    code: ProxyErrorCode::AssociationFailed | ProxyErrorCode::NoSavedDatabasesFound,
                    ..
                },
            ) => self.reassociate(),
            (Some(Action::Associate), _) => {
                self.pending_key = None;
                self.raise(Some(action), error);
            }
            _ => self.raise(Some(action), error),
        }
    }

    fn on_database_hash(&mut self, message: &Map<String, Value>) {
        let action = Action::GetDatabaseHash.as_str();
        let Some(hash) = message_hash(message) else {
            return self.raise(
                Some(action),
                ClientError::Proxy {
                    code: ProxyErrorCode::DatabaseHashNotReceived,
                    message: "Reply carries no database hash".into(),
                },
            );
        };

        match self.current_database.as_deref() {
            Some(current) if current == hash.as_slice() => {}
            Some(_) if !self.options.allow_database_change => {
                return self.raise(Some(action), ClientError::DatabaseChanged);
            }
            previous => {
                if previous.is_some() {
                    info!(hash = %hex::encode(&hash), "KeePassXC switched databases");
                }
                self.locked = true;
                self.current_database = Some(hash.clone());
                self.events
                    .push_back(ClientEvent::CurrentDatabaseChanged(hash.clone()));
            }
        }

        if self.registry.has_client_id(&hash) {
            self.send_test_associate();
        } else if self.allow_database(&hash) {
            self.send_associate();
        } else {
            self.raise(Some(action), ClientError::DatabaseRejected);
        }
    }

    fn on_associate(&mut self, message: &Map<String, Value>) {
        let action = Action::Associate.as_str();
        let Some(hash) = self.verify_database(action, message) else {
            return;
        };
        let Some(key) = self.pending_key.take() else {
            return self.raise(
                Some(action),
                ClientError::Proxy {
                    code: ProxyErrorCode::AssociationFailed,
                    message: "Association reply without a pending request".into(),
                },
            );
        };
        let Some(name) = str_field(message, "id").filter(|name| !name.is_empty()) else {
            return self.raise(
                Some(action),
                ClientError::Proxy {
                    code: ProxyErrorCode::AssociationFailed,
                    message: "Association reply carries no id".into(),
                },
            );
        };

        info!(name, "associated with database");
        if let Err(err) = self.registry.add_client_id(&hash, ClientId::new(name, key)) {
            self.raise(Some(action), ClientError::Registry(err.to_string()));
        }
        self.unlock(hash);
    }

    fn on_test_associate(&mut self, message: &Map<String, Value>) {
        let action = Action::TestAssociate.as_str();
        if !std::mem::take(&mut self.testing_association) {
            return self.raise(Some(action), ClientError::ActionsDontMatch);
        }
        if let Some(hash) = self.verify_database(action, message) {
            self.unlock(hash);
        }
    }

    fn on_passwords(&mut self, message: &Map<String, Value>) {
        let mut passwords = Vec::new();
        if let Some(Value::Array(entries)) = message.get("entries") {
            passwords.extend(
                entries
                    .iter()
                    .filter_map(|entry| entry.get("password"))
                    .filter_map(Value::as_str)
                    .map(str::to_owned),
            );
        } else if let Some(password) = str_field(message, "password") {
            passwords.push(password.to_owned());
        }
        self.events.push_back(ClientEvent::PasswordsGenerated(passwords));
    }

    fn on_logins(&mut self, message: &Map<String, Value>) {
        let entries = match message.get("entries") {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(Value::as_object)
                .map(Entry::from_reply)
                .collect(),
            _ => Vec::new(),
        };
        self.events.push_back(ClientEvent::LoginsReceived(entries));
    }

    fn on_locked(&mut self) {
        if self.locked {
            return;
        }
        self.locked = true;
        self.events.push_back(ClientEvent::DatabaseClosed);
        if self.options.disconnect_on_close {
            self.disconnect();
        }
    }

    fn unlock(&mut self, hash: Vec<u8>) {
        self.locked = false;
        self.events.push_back(ClientEvent::DatabaseOpened(hash));
    }

    fn reassociate(&mut self) {
        warn!("stored association was rejected, associating again");
        if let Some(hash) = self.current_database.clone() {
            if let Err(err) = self.registry.remove_client_id(&hash) {
                warn!(error = %err, "failed to forget rejected association");
            }
        }
        self.send_associate();
    }

    fn send_associate(&mut self) {
        let action = Action::Associate.as_str();
        match self.associate_request() {
            Ok((message, key)) => {
                self.pending_key = Some(key);
                self.link.send_encrypted(action, message, false);
            }
            Err(error) => self.raise(Some(action), error),
        }
    }

    fn send_test_associate(&mut self) {
        let action = Action::TestAssociate.as_str();
        match self.test_associate_request() {
            Ok(message) => {
                self.testing_association = true;
                self.link.send_encrypted(action, message, false);
            }
            Err(error) => self.raise(Some(action), error),
        }
    }

    fn associate_request(&self) -> Result<(Map<String, Value>, SecureBuffer), ClientError> {
        let mut key = self.link.random_bytes(KEY_SIZE, MemoryState::ReadOnly)?;
        let mut message = Map::new();
        message.insert("key".into(), self.link.public_key()?.into());
        message.insert("idKey".into(), key.to_base64()?.into());
        key.make_no_access()?;
        Ok((message, key))
    }

    fn test_associate_request(&self) -> Result<Map<String, Value>, ClientError> {
        let id = self.current_client_id()?;
        let mut message = Map::new();
        message.insert("id".into(), id.name.clone().into());
        message.insert("key".into(), id.key.to_base64()?.into());
        Ok(message)
    }

    fn logins_request(&self, query: &LoginQuery) -> Result<Map<String, Value>, ClientError> {
        let current = self.current_client_id()?;
        let ids = if query.search_all_databases {
            self.registry.all_client_ids()
        } else {
            vec![current]
        };
        let keys = ids
            .iter()
            .map(|id| -> Result<Value, ClientError> {
                Ok(json!({ "id": id.name, "key": id.key.to_base64()? }))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut message = Map::new();
        message.insert("id".into(), current.name.clone().into());
        message.insert("url".into(), query.url.clone().into());
        message.insert(
            "submitUrl".into(),
            query.submit_url.as_deref().unwrap_or(&query.url).into(),
        );
        message.insert(
            "httpAuth".into(),
            if query.http_auth { "true" } else { "false" }.into(),
        );
        message.insert("keys".into(), Value::Array(keys));
        Ok(message)
    }

    fn current_client_id(&self) -> Result<&ClientId, ClientError> {
        self.current_database
            .as_deref()
            .and_then(|hash| self.registry.client_id(hash))
            .ok_or(ClientError::NotAssociated)
    }

    /// Association replies must name the database we are bound to.
    fn verify_database(&mut self, action: &str, message: &Map<String, Value>) -> Option<Vec<u8>> {
        match (message_hash(message), self.current_database.as_ref()) {
            (Some(hash), Some(current)) if &hash == current => Some(hash),
            _ => {
                self.raise(Some(action), ClientError::DatabaseChanged);
                None
            }
        }
    }

    fn allow_database(&self, hash: &[u8]) -> bool {
        match &self.database_filter {
            Some(filter) => filter(hash),
            None => self.options.allow_new_database,
        }
    }

    fn raise(&mut self, action: Option<&str>, error: ClientError) {
        let unrecoverable = !error.is_recoverable();
        if unrecoverable {
            error!(error = %error, action, "unrecoverable session error");
            self.pending_key = None;
            if self.link.is_connected() || self.link.is_connecting() {
                self.link.disconnect();
            }
        } else {
            warn!(error = %error, action, "session error");
        }
        self.events.push_back(ClientEvent::Error(ErrorEvent {
            error,
            action: action.map(str::to_owned),
            unrecoverable,
        }));
    }

    fn clear(&mut self) {
        self.current_database = None;
        self.locked = true;
        self.pending_key = None;
        self.testing_association = false;
    }

    fn sync_state(&mut self) {
        let state = self.state();
        if state != self.last_state {
            debug!(?state, "session state changed");
            self.last_state = state;
            self.events.push_back(ClientEvent::StateChanged(state));
        }
    }
}

fn message_hash(message: &Map<String, Value>) -> Option<Vec<u8>> {
    str_field(message, "hash")
        .filter(|hash| !hash.is_empty())
        .and_then(|hash| hex::decode(hash).ok())
}
