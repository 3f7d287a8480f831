use kpxc_client::{
    ClientError, ClientEvent, ClientId, ClientOptions, ClientState, CryptoBox, CryptoInit, DatabaseRegistry, Entry,
    ErrorEvent, Link, LoginQuery, MemoryRegistry, MemoryState, ProxyErrorCode, SecureBuffer, Session, TransportEvent,
};
use serde_json::{json, Map, Value};

struct FakeLink {
    connected: bool,
    connecting: bool,
    sent: Vec<(String, Map<String, Value>, bool)>,
    disconnects: usize,
    crypto: CryptoBox,
}

impl FakeLink {
    fn new() -> Self {
        let mut crypto = CryptoBox::new(CryptoInit::init().unwrap());
        crypto.generate_key_pair().unwrap();
        Self {
            connected: false,
            connecting: false,
            sent: Vec::new(),
            disconnects: 0,
            crypto,
        }
    }

    fn last_sent(&self) -> &(String, Map<String, Value>, bool) {
        self.sent.last().unwrap()
    }
}

impl Link for FakeLink {
    fn connect(&mut self, _program: &str) -> Result<(), ClientError> {
        if self.connected {
            return Err(ClientError::AlreadyConnected);
        }
        self.connecting = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.connected = false;
        self.connecting = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_connecting(&self) -> bool {
        self.connecting
    }

    fn send_encrypted(&mut self, action: &str, message: Map<String, Value>, trigger_unlock: bool) {
        self.sent.push((action.to_owned(), message, trigger_unlock));
    }

    fn public_key(&self) -> Result<String, ClientError> {
        Ok(self.crypto.public_key_base64()?)
    }

    fn random_bytes(&self, len: usize, state: MemoryState) -> Result<SecureBuffer, ClientError> {
        Ok(self.crypto.random_bytes(len, state)?)
    }
}

const HASH: &str = "abcd";
const HASH_BYTES: [u8; 2] = [0xab, 0xcd];

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn drain(session: &mut Session<FakeLink>) -> Vec<ClientEvent> {
    std::iter::from_fn(|| session.poll_event()).collect()
}

fn registry_with(name: &str, key: &[u8]) -> MemoryRegistry {
    let mut registry = MemoryRegistry::new();
    let key = SecureBuffer::from_slice(key, MemoryState::ReadOnly).unwrap();
    registry.add_client_id(&HASH_BYTES, ClientId::new(name, key)).unwrap();
    registry
}

/// Spawned and key exchange completed; the hash request is out.
fn connected(registry: MemoryRegistry, options: ClientOptions) -> Session<FakeLink> {
    let mut session = Session::with_link(FakeLink::new(), Box::new(registry), options, "keepassxc-proxy");
    session.connect();
    assert_eq!(drain(&mut session), vec![ClientEvent::StateChanged(ClientState::Connecting)]);

    session.link_mut().connecting = false;
    session.link_mut().connected = true;
    session.handle_transport_event(TransportEvent::Connected);
    assert_eq!(
        drain(&mut session),
        vec![ClientEvent::Connected, ClientEvent::StateChanged(ClientState::Locked)]
    );
    session
}

fn reply(session: &mut Session<FakeLink>, action: &str, message: Value) {
    session.handle_transport_event(TransportEvent::Message {
        action: action.into(),
        message: object(message),
    });
}

fn failed(session: &mut Session<FakeLink>, action: &str, code: ProxyErrorCode) {
    session.handle_transport_event(TransportEvent::Failed {
        action: action.into(),
        error: ClientError::Proxy {
            code,
            message: "refused".into(),
        },
    });
}

/// Paired through test-associate with an identity named `desk`.
fn unlocked(options: ClientOptions) -> Session<FakeLink> {
    let mut session = connected(registry_with("desk", &[5; 32]), options);
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));
    reply(&mut session, "test-associate", json!({"hash": HASH, "id": "desk"}));
    drain(&mut session);
    assert_eq!(session.state(), ClientState::Unlocked);
    session
}

#[test]
fn fresh_pairing_associates_and_stores_identity() {
    let mut session = connected(MemoryRegistry::new(), ClientOptions::default());
    let (action, _, trigger_unlock) = session.link().last_sent();
    assert_eq!(action, "get-databasehash");
    assert!(trigger_unlock);

    reply(&mut session, "get-databasehash", json!({"hash": HASH, "version": "2.7.6"}));
    assert_eq!(
        drain(&mut session),
        vec![ClientEvent::CurrentDatabaseChanged(HASH_BYTES.to_vec())]
    );
    let (action, request, _) = session.link().last_sent().clone();
    assert_eq!(action, "associate");
    assert_eq!(request["key"], session.link().public_key().unwrap().as_str());
    let id_key = request["idKey"].as_str().unwrap().to_owned();
    assert_eq!(
        SecureBuffer::from_base64(&id_key, MemoryState::ReadOnly).unwrap().len(),
        32
    );

    reply(&mut session, "associate", json!({"hash": HASH, "id": "laptop"}));
    assert_eq!(
        drain(&mut session),
        vec![
            ClientEvent::DatabaseOpened(HASH_BYTES.to_vec()),
            ClientEvent::StateChanged(ClientState::Unlocked)
        ]
    );
    let stored = session.registry().client_id(&HASH_BYTES).unwrap();
    assert_eq!(stored.name, "laptop");
    assert_eq!(stored.key.state(), MemoryState::NoAccess);
    assert_eq!(stored.key.to_base64().unwrap(), id_key);

    session.get_logins(&LoginQuery::new("https://example.com"));
    let (action, request, _) = session.link().last_sent();
    assert_eq!(action, "get-logins");
    assert_eq!(request["id"], "laptop");
    assert_eq!(request["url"], "https://example.com");
    assert_eq!(request["submitUrl"], "https://example.com");
    assert_eq!(request["httpAuth"], "false");
    assert_eq!(request["keys"], json!([{"id": "laptop", "key": id_key}]));

    reply(
        &mut session,
        "get-logins",
        json!({"entries": [{"login": "alice", "password": "pw", "name": "Example", "uuid": "0123456789abcdef0123456789abcdef"}]}),
    );
    match drain(&mut session).as_slice() {
        [ClientEvent::LoginsReceived(entries)] => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].username(), "alice");
            assert_eq!(entries[0].title(), "Example");
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn rejected_association_is_replaced() {
    let mut session = connected(registry_with("old", &[1; 32]), ClientOptions::default());
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));
    drain(&mut session);

    let (action, request, _) = session.link().last_sent();
    assert_eq!(action, "test-associate");
    assert_eq!(request["id"], "old");
    assert_eq!(
        request["key"],
        SecureBuffer::from_slice(&[1; 32], MemoryState::ReadOnly)
            .unwrap()
            .to_base64()
            .unwrap()
            .as_str()
    );

    failed(&mut session, "test-associate", ProxyErrorCode::AssociationFailed);
    assert!(drain(&mut session).is_empty());
    assert!(!session.registry().has_client_id(&HASH_BYTES));
    assert_eq!(session.link().last_sent().0, "associate");

    reply(&mut session, "associate", json!({"hash": HASH, "id": "new"}));
    assert!(drain(&mut session).contains(&ClientEvent::DatabaseOpened(HASH_BYTES.to_vec())));
    assert_eq!(session.registry().client_id(&HASH_BYTES).unwrap().name, "new");
    assert_eq!(session.link().disconnects, 0);
}

#[test]
fn missing_saved_database_also_reassociates() {
    let mut session = connected(registry_with("old", &[1; 32]), ClientOptions::default());
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));
    failed(&mut session, "test-associate", ProxyErrorCode::NoSavedDatabasesFound);
    assert_eq!(session.link().last_sent().0, "associate");
    assert!(!drain(&mut session)
        .iter()
        .any(|event| matches!(event, ClientEvent::Error(_))));
}

#[test]
fn database_swap_is_rejected_by_default() {
    let mut session = unlocked(ClientOptions::default());

    session.handle_transport_event(TransportEvent::Locked);
    assert_eq!(
        drain(&mut session),
        vec![ClientEvent::DatabaseClosed, ClientEvent::StateChanged(ClientState::Locked)]
    );

    session.handle_transport_event(TransportEvent::Unlocked);
    assert_eq!(session.link().last_sent().0, "get-databasehash");

    reply(&mut session, "get-databasehash", json!({"hash": "ef01"}));
    assert_eq!(
        drain(&mut session),
        vec![
            ClientEvent::Error(ErrorEvent {
                error: ClientError::DatabaseChanged,
                action: Some("get-databasehash".into()),
                unrecoverable: true,
            }),
            ClientEvent::StateChanged(ClientState::Disconnected)
        ]
    );
    assert_eq!(session.link().disconnects, 1);
    assert_eq!(session.current_database(), Some(&HASH_BYTES[..]));
}

#[test]
fn database_swap_followed_when_allowed() {
    let options = ClientOptions {
        allow_database_change: true,
        ..ClientOptions::default()
    };
    let mut session = unlocked(options);
    session.handle_transport_event(TransportEvent::Locked);
    session.handle_transport_event(TransportEvent::Unlocked);
    drain(&mut session);

    reply(&mut session, "get-databasehash", json!({"hash": "ef01"}));
    assert_eq!(
        drain(&mut session),
        vec![ClientEvent::CurrentDatabaseChanged(vec![0xef, 0x01])]
    );
    assert_eq!(session.link().last_sent().0, "associate");
    assert_eq!(session.link().disconnects, 0);
}

#[test]
fn unknown_database_rejected_without_permission() {
    let options = ClientOptions {
        allow_new_database: false,
        ..ClientOptions::default()
    };
    let mut session = connected(MemoryRegistry::new(), options);
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));

    let events = drain(&mut session);
    assert!(events.contains(&ClientEvent::Error(ErrorEvent {
        error: ClientError::DatabaseRejected,
        action: Some("get-databasehash".into()),
        unrecoverable: true,
    })));
    assert_eq!(session.link().sent.len(), 1);
    assert_eq!(session.link().disconnects, 1);
}

#[test]
fn database_filter_overrides_option() {
    let options = ClientOptions {
        allow_new_database: false,
        ..ClientOptions::default()
    };
    let mut session = connected(MemoryRegistry::new(), options);
    session.set_database_filter(|hash| hash == HASH_BYTES);
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));
    assert_eq!(session.link().last_sent().0, "associate");
}

#[test]
fn locked_database_waits_for_unlock() {
    let mut session = connected(MemoryRegistry::new(), ClientOptions::default());
    failed(&mut session, "get-databasehash", ProxyErrorCode::DatabaseNotOpened);
    assert!(drain(&mut session).is_empty());

    let options = ClientOptions {
        trigger_unlock: false,
        ..ClientOptions::default()
    };
    let mut session = connected(MemoryRegistry::new(), options);
    assert!(!session.link().last_sent().2);
    failed(&mut session, "get-databasehash", ProxyErrorCode::DatabaseNotOpened);
    match drain(&mut session).as_slice() {
        [ClientEvent::Error(event)] => {
            assert!(!event.unrecoverable);
            assert_eq!(event.error.code(), 1);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(session.link().disconnects, 0);
}

#[test]
fn association_reply_for_other_database_is_fatal() {
    let mut session = connected(MemoryRegistry::new(), ClientOptions::default());
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));
    reply(&mut session, "associate", json!({"hash": "ffff", "id": "laptop"}));

    let events = drain(&mut session);
    assert!(events.iter().any(|event| matches!(
        event,
        ClientEvent::Error(ErrorEvent { error: ClientError::DatabaseChanged, .. })
    )));
    assert!(!session.registry().has_client_id(&HASH_BYTES));
}

#[test]
fn unsupported_action_ends_session() {
    let mut session = unlocked(ClientOptions::default());
    reply(&mut session, "get-totp", json!({}));
    let events = drain(&mut session);
    assert_eq!(
        events[0],
        ClientEvent::Error(ErrorEvent {
            error: ClientError::UnsupportedAction("get-totp".into()),
            action: Some("get-totp".into()),
            unrecoverable: true,
        })
    );
    assert_eq!(session.link().disconnects, 1);
}

#[test]
fn second_connect_is_refused() {
    let mut session = unlocked(ClientOptions::default());
    session.connect();
    assert_eq!(
        drain(&mut session),
        vec![ClientEvent::Error(ErrorEvent {
            error: ClientError::AlreadyConnected,
            action: None,
            unrecoverable: false,
        })]
    );
    assert_eq!(session.state(), ClientState::Unlocked);
}

#[test]
fn disconnect_clears_binding() {
    let mut session = unlocked(ClientOptions::default());
    session.link_mut().connected = false;
    session.handle_transport_event(TransportEvent::Disconnected);
    assert_eq!(
        drain(&mut session),
        vec![
            ClientEvent::Disconnected,
            ClientEvent::StateChanged(ClientState::Disconnected)
        ]
    );
    assert_eq!(session.current_database(), None);
}

#[test]
fn close_on_lock_disconnects() {
    let options = ClientOptions {
        disconnect_on_close: true,
        ..ClientOptions::default()
    };
    let mut session = unlocked(options);
    session.close_database();
    assert_eq!(session.link().last_sent().0, "lock-database");

    reply(&mut session, "lock-database", json!({}));
    session.handle_transport_event(TransportEvent::Locked);
    let events = drain(&mut session);
    assert_eq!(
        events.iter().filter(|e| **e == ClientEvent::DatabaseClosed).count(),
        1
    );
    assert_eq!(session.link().disconnects, 1);
}

#[test]
fn generated_passwords_and_new_logins() {
    let mut session = unlocked(ClientOptions::default());
    session.generate_password();
    assert_eq!(session.link().last_sent().0, "generate-password");
    reply(
        &mut session,
        "generate-password",
        json!({"entries": [{"login": 128, "password": "Zx9!"}]}),
    );
    assert_eq!(
        drain(&mut session),
        vec![ClientEvent::PasswordsGenerated(vec!["Zx9!".into()])]
    );

    let mut entry = Entry::from_reply(&object(json!({"uuid": "0123456789abcdef0123456789abcdef"})));
    entry.set_username("alice");
    entry.set_password("Zx9!");
    session.add_login("https://example.com", &entry, None);
    let (action, request, _) = session.link().last_sent();
    assert_eq!(action, "set-login");
    assert_eq!(request["id"], "desk");
    assert_eq!(request["uuid"], "0123456789abcdef0123456789abcdef");
    assert_eq!(request["submitUrl"], "https://example.com");
    assert_eq!(request["login"], "alice");
    assert_eq!(request["password"], "Zx9!");

    reply(&mut session, "set-login", json!({"success": "true"}));
    assert_eq!(drain(&mut session), vec![ClientEvent::LoginAdded]);
}

#[test]
fn logins_without_association_are_refused_locally() {
    let mut session = connected(MemoryRegistry::new(), ClientOptions::default());
    let sent = session.link().sent.len();
    session.get_logins(&LoginQuery::new("https://example.com").http_auth(true));
    assert_eq!(session.link().sent.len(), sent);
    match drain(&mut session).as_slice() {
        [ClientEvent::Error(event)] => assert_eq!(event.error, ClientError::NotAssociated),
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn search_all_databases_sends_every_key() {
    let mut registry = registry_with("desk", &[5; 32]);
    registry
        .add_client_id(
            &[0x99],
            ClientId::new("other", SecureBuffer::from_slice(&[6; 32], MemoryState::ReadOnly).unwrap()),
        )
        .unwrap();
    let mut session = connected(registry, ClientOptions::default());
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));
    reply(&mut session, "test-associate", json!({"hash": HASH}));

    session.get_logins(
        &LoginQuery::new("https://example.com")
            .submit_url("https://example.com/post")
            .search_all_databases(true),
    );
    let (_, request, _) = session.link().last_sent();
    assert_eq!(request["id"], "desk");
    assert_eq!(request["submitUrl"], "https://example.com/post");
    assert_eq!(request["keys"].as_array().unwrap().len(), 2);
}

#[test]
fn unrequested_test_associate_does_not_unlock() {
    let mut session = connected(MemoryRegistry::new(), ClientOptions::default());
    reply(&mut session, "get-databasehash", json!({"hash": HASH}));
    assert_eq!(session.link().last_sent().0, "associate");
    drain(&mut session);

    reply(&mut session, "test-associate", json!({"hash": HASH, "id": "intruder"}));
    let events = drain(&mut session);
    assert_eq!(
        events[0],
        ClientEvent::Error(ErrorEvent {
            error: ClientError::ActionsDontMatch,
            action: Some("test-associate".into()),
            unrecoverable: true,
        })
    );
    assert!(!events.contains(&ClientEvent::DatabaseOpened(HASH_BYTES.to_vec())));
    assert_ne!(session.state(), ClientState::Unlocked);
    assert_eq!(session.link().disconnects, 1);
}
