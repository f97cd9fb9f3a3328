//! End-to-end scenarios: full agent sessions against an in-process server.

use keywarden_agent::client::ApiClient;
use keywarden_agent::config::{shared, AgentConfig, AgentMode, SharedConfig};
use keywarden_agent::session::{self, NewUser, Session};
use keywarden_agent::AgentError;
use keywarden_core::model::{CustomField, CustomFieldKind, Item, ItemType, SecretPayload, Uri};
use keywarden_core::proto;
use keywarden_server::auth::TokenAuthority;
use keywarden_server::server::build_router;
use keywarden_server::storage::Storage;
use keywarden_server::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_SECRET: u32 = 1024 * 1024;
const SECRET_KEY: &str = "cisco-123";

async fn start_server() -> String {
    let state = AppState {
        storage: Storage::in_memory(MAX_SECRET).unwrap(),
        tokens: Arc::new(TokenAuthority::new(
            *b"0123456789abcdef0123456789abcdef",
            Duration::from_secs(300),
        )),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("127.0.0.1:{}", addr.port())
}

fn test_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("kw-e2e-{tag}-{}", std::process::id()))
}

fn agent_config(server: &str, user: &str, mode: AgentMode, tag: &str) -> SharedConfig {
    shared(AgentConfig {
        user: user.to_string(),
        secretkey: SECRET_KEY.to_string(),
        server: server.to_string(),
        mode,
        syncinterval: 600,
        disabletls: true,
        datadir: Some(test_dir(tag)),
        ..AgentConfig::default()
    })
}

async fn register_user(
    client: &ApiClient,
    username: &str,
    password: &str,
    two_factor: bool,
) -> Option<proto::TotpKey> {
    session::register(
        client,
        &NewUser {
            username: username.to_string(),
            password: password.to_string(),
            password_confirm: password.to_string(),
            secret_key: SECRET_KEY.to_string(),
            email: format!("{username}@example.com"),
            two_factor,
        },
    )
    .await
    .unwrap()
}

async fn open_session(config: SharedConfig, password: &str) -> (Session, Arc<ApiClient>) {
    let client = Arc::new(ApiClient::new(&config.read().unwrap().clone()).unwrap());
    let mut session = Session::new(client.clone(), config);
    let (status_tx, mut status_rx) = mpsc::channel(64);
    tokio::spawn(async move { while status_rx.recv().await.is_some() {} });

    session.login(password, "", status_tx).await.unwrap();
    (session, client)
}

fn login_item(name: &str) -> Item {
    Item {
        name: name.to_string(),
        item_type: ItemType::Login,
        reprompt: true,
        notes: "issued by IT".to_string(),
        secret: Some(SecretPayload::Login {
            username: "testuser".to_string(),
            password: "testpwd".to_string(),
            authkey: String::new(),
        }),
        uris: vec![
            Uri {
                uri: "https://one.example.com".to_string(),
                matching: "domain".to_string(),
            },
            Uri {
                uri: "https://two.example.com".to_string(),
                matching: String::new(),
            },
        ],
        custom_fields: vec![
            CustomField {
                name: "env".to_string(),
                kind: CustomFieldKind::Text,
                text_value: "prod".to_string(),
                bool_value: false,
            },
            CustomField {
                name: "pin".to_string(),
                kind: CustomFieldKind::Hidden,
                text_value: "9999".to_string(),
                bool_value: false,
            },
            CustomField {
                name: "shared".to_string(),
                kind: CustomFieldKind::Bool,
                text_value: String::new(),
                bool_value: true,
            },
        ],
        ..Item::default()
    }
}

// S1: register, login, create a login item, fetch it back decrypted.
#[tokio::test]
async fn register_login_create_fetch() {
    let server = start_server().await;
    let config = agent_config(&server, "alice", AgentMode::Server, "s1");

    let bootstrap = ApiClient::new(&config.read().unwrap().clone()).unwrap();
    assert!(register_user(&bootstrap, "alice", "hunter2", false)
        .await
        .is_none());

    let (mut session, _client) = open_session(config, "hunter2").await;

    let item = login_item("seclogin1");
    session.save_item(&item).await.unwrap();

    let fetched = session.get_item("seclogin1", ItemType::Login).await.unwrap();
    assert!(fetched.id > 0);
    assert!(!fetched.hash.is_empty());
    assert!(fetched.updated.is_some());
    assert_eq!(fetched.notes, item.notes);
    assert_eq!(fetched.secret, item.secret);
    assert_eq!(fetched.uris, item.uris);
    assert_eq!(fetched.custom_fields, item.custom_fields);

    session.logout().await;
}

// S2: wrong password is a straight permission denial, not a session expiry.
#[tokio::test]
async fn wrong_password_denied() {
    let server = start_server().await;
    let config = agent_config(&server, "bob", AgentMode::Server, "s2");

    let client = Arc::new(ApiClient::new(&config.read().unwrap().clone()).unwrap());
    register_user(&client, "bob", "hunter2", false).await;

    let mut session = Session::new(client, config);
    let (status_tx, _status_rx) = mpsc::channel(8);
    let err = session.login("wrong", "", status_tx).await.unwrap_err();

    match err {
        AgentError::Server { code, .. } => assert_eq!(code, proto::code::PERMISSION_DENIED),
        other => panic!("unexpected error: {other:?}"),
    }
}

// S3: two-factor registration and login round trip.
#[tokio::test]
async fn two_factor_login() {
    let server = start_server().await;
    let config = agent_config(&server, "carol", AgentMode::Server, "s3");

    let client = Arc::new(ApiClient::new(&config.read().unwrap().clone()).unwrap());
    let totp_key = register_user(&client, "carol", "hunter2", true)
        .await
        .expect("TOTP enrolment material");
    assert!(!totp_key.secret.is_empty());
    assert_eq!(&totp_key.qr_png[..4], b"\x89PNG");

    let mut session = Session::new(client, config);
    let (status_tx, _status_rx) = mpsc::channel(8);

    // Without a code the server asks for the second factor.
    let err = session
        .login("hunter2", "", status_tx.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::SecondFactorRequired));

    // With a generated code the login completes.
    let code = keywarden_core::totp::generate_current_code(&totp_key.secret).unwrap();
    session.login("hunter2", &code, status_tx).await.unwrap();

    session.logout().await;
}

// S4: creating the same (name, type) twice fails with INVALID_ARGUMENT.
#[tokio::test]
async fn duplicate_item_rejected() {
    let server = start_server().await;
    let config = agent_config(&server, "dave", AgentMode::Server, "s4");

    let bootstrap = ApiClient::new(&config.read().unwrap().clone()).unwrap();
    register_user(&bootstrap, "dave", "hunter2", false).await;
    let (session, _client) = open_session(config, "hunter2").await;

    session.save_item(&login_item("dup")).await.unwrap();
    let err = session.save_item(&login_item("dup")).await.unwrap_err();

    match err {
        AgentError::Server { code, .. } => assert_eq!(code, proto::code::INVALID_ARGUMENT),
        other => panic!("unexpected error: {other:?}"),
    }
}

// S5: a local-mode agent converges with mutations made by another agent.
#[tokio::test]
async fn local_cache_converges() {
    let server = start_server().await;

    let writer_config = agent_config(&server, "erin", AgentMode::Server, "s5-writer");
    let bootstrap = ApiClient::new(&writer_config.read().unwrap().clone()).unwrap();
    register_user(&bootstrap, "erin", "hunter2", false).await;
    let (writer, writer_client) = open_session(writer_config, "hunter2").await;

    writer.save_item(&login_item("i1")).await.unwrap();
    let server_list = writer_client.get_item_list().await.unwrap();
    assert_eq!(server_list.len(), 1);

    let reader_config = agent_config(&server, "erin", AgentMode::Local, "s5-reader");
    let (mut reader, _reader_client) = open_session(reader_config, "hunter2").await;
    reader.sync_now().await;

    let cached_list = reader.list_items().await.unwrap();
    assert_eq!(cached_list.len(), 1);
    assert_eq!(cached_list[0].id, server_list[0].id);
    assert_eq!(cached_list[0].name, server_list[0].name);
    assert_eq!(cached_list[0].hash, server_list[0].hash);

    // The cached copy decrypts to the full item.
    let cached_item = reader.get_item("i1", ItemType::Login).await.unwrap();
    assert_eq!(cached_item.secret, login_item("i1").secret);

    // Deletion propagates on the next cycle.
    writer.delete_item(server_list[0].id).await.unwrap();
    reader.sync_now().await;
    assert!(reader.list_items().await.unwrap().is_empty());

    reader.logout().await;
}

// An oversized payload is rejected locally before anything is sent.
#[tokio::test]
async fn oversized_secret_rejected_locally() {
    let server = start_server().await;
    let config = agent_config(&server, "grace", AgentMode::Server, "size");

    let bootstrap = ApiClient::new(&config.read().unwrap().clone()).unwrap();
    register_user(&bootstrap, "grace", "hunter2", false).await;
    let (mut session, client) = open_session(config, "hunter2").await;

    let item = Item {
        name: "huge".to_string(),
        item_type: ItemType::SecData,
        secret: Some(SecretPayload::Data {
            bytes: vec![0u8; (MAX_SECRET + 1) as usize],
        }),
        ..Item::default()
    };

    let err = session.save_item(&item).await.unwrap_err();
    match err {
        AgentError::SecretTooBig { got, max } => {
            assert_eq!(max, MAX_SECRET as usize);
            assert!(got > MAX_SECRET as usize);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Nothing reached the server.
    assert!(client.get_item_list().await.unwrap().is_empty());
    session.logout().await;
}

// S6: concurrent update of the same item trips the hash guard.
#[tokio::test]
async fn stale_update_is_out_of_sync() {
    let server = start_server().await;

    let config_a = agent_config(&server, "frank", AgentMode::Local, "s6-a");
    let bootstrap = ApiClient::new(&config_a.read().unwrap().clone()).unwrap();
    register_user(&bootstrap, "frank", "hunter2", false).await;

    let (mut agent_a, _client_a) = open_session(config_a, "hunter2").await;
    agent_a.save_item(&login_item("contested")).await.unwrap();
    agent_a.sync_now().await;

    let config_b = agent_config(&server, "frank", AgentMode::Local, "s6-b");
    let (mut agent_b, _client_b) = open_session(config_b, "hunter2").await;
    agent_b.sync_now().await;

    // Both agents hold the same view of the item.
    let mut item_a = agent_a.get_item("contested", ItemType::Login).await.unwrap();
    let mut item_b = agent_b.get_item("contested", ItemType::Login).await.unwrap();
    assert_eq!(item_a.hash, item_b.hash);

    // A wins the race.
    item_a.secret = Some(SecretPayload::Login {
        username: "testuser".to_string(),
        password: "rotated".to_string(),
        authkey: String::new(),
    });
    agent_a.save_item(&item_a).await.unwrap();

    // B still holds the stale view; the guard rejects the update locally.
    item_b.secret = Some(SecretPayload::Login {
        username: "testuser".to_string(),
        password: "lost-update".to_string(),
        authkey: String::new(),
    });
    let err = agent_b.save_item(&item_b).await.unwrap_err();
    assert!(matches!(err, AgentError::OutOfSync));

    // The server row still carries A's update.
    agent_b.sync_now().await;
    let current = agent_b.get_item("contested", ItemType::Login).await.unwrap();
    match current.secret {
        Some(SecretPayload::Login { ref password, .. }) => assert_eq!(password, "rotated"),
        other => panic!("unexpected payload: {other:?}"),
    }

    agent_a.logout().await;
    agent_b.logout().await;
}
