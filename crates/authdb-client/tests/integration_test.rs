//! データベースとクライアントをループバックで繋いだ結合テスト

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use authdb_client::handshake::{self, HandshakeParams, HandshakeResult, RegistrationRequest};
use authdb_client::{ClientConfig, DatabaseClient, Registration};
use authdb_proto::messages::{server_edit, BootstrapAdmin, NewOperator, ServerEdits};
use authdb_proto::{permission, Status};
use authdb_server::{Database, ServerError};
use authdb_store::{ConfigUpdate, CredentialCheck, LockoutPolicy, LATEST_KEY};
use authdb_transport::SecureChannel;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const ADMIN: &str = "admin";
const ADMIN_PASSWORD: &str = "correct horse";
const PING_MS: u32 = 500;

fn test_config_update() -> ConfigUpdate {
    ConfigUpdate {
        hash_iterations: Some(16),
        key_bits: Some(1024),
        ephemeral_key_bits: Some(1024),
        ping_interval_ms: Some(PING_MS),
        ..Default::default()
    }
}

async fn start_database(dir: &Path, with_admin: bool) -> (Arc<Database>, SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let db = Database::open(dir).unwrap();
    db.config().update(&test_config_update()).unwrap();
    db.ensure_preferred_key().await.unwrap();
    if with_admin {
        db.bootstrap_admin(ADMIN, ADMIN_PASSWORD, "Administrator").unwrap();
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(db.clone().run_with_listener(listener));
    (db, addr, task)
}

fn client_config(addr: SocketAddr, state_path: Option<PathBuf>, registration: Registration) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".into(),
        port: addr.port(),
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(20),
        ephemeral_key_bits: 1024,
        state_path,
        registration,
        reconnect_delay_error: Duration::from_millis(100),
        reconnect_delay_clean: Duration::from_millis(200),
        lockout: LockoutPolicy {
            attempts: 2,
            period_ms: 60_000,
            lockout_ms: 60_000,
        },
        ..Default::default()
    }
}

fn kiosk_registration() -> Registration {
    Registration::Server {
        name: "kiosk".into(),
        description: "front desk".into(),
        secret: String::new(),
    }
}

/// 管理ツールとして接続し、管理者でログインする
async fn admin_client(addr: SocketAddr) -> (DatabaseClient, u32) {
    let client = DatabaseClient::start(client_config(addr, None, Registration::Unspecified)).unwrap();
    assert!(client.wait_connected(Duration::from_secs(20)).await);
    let reply = client.login(ADMIN, ADMIN_PASSWORD).await.unwrap();
    assert_eq!(reply.status, Status::Success);
    let id = reply.value.unwrap().id;
    (client, id)
}

/// 条件が成り立つまでポーリングする
async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn new_operator(username: &str, permissions: u32) -> NewOperator {
    NewOperator {
        username: username.into(),
        password: "pw".into(),
        display_name: username.to_uppercase(),
        permissions,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blank_install_bootstrap_then_login() {
    let dir = tempfile::tempdir().unwrap();
    let (db, addr, task) = start_database(dir.path(), false).await;

    let mut config = client_config(addr, None, Registration::Unspecified);
    config.bootstrap = Some(BootstrapAdmin {
        username: "alice".into(),
        password: "wonderland".into(),
        display_name: "Alice".into(),
    });
    let client = DatabaseClient::start(config).unwrap();
    assert!(client.wait_connected(Duration::from_secs(20)).await);
    assert_eq!(db.operators().len(), 1);

    let reply = client.login("alice", "wonderland").await.unwrap();
    assert_eq!(reply.status, Status::Success);
    let info = reply.value.unwrap();
    assert_eq!(info.display_name, "Alice");
    assert_eq!(info.permissions, permission::ALL);

    let reply = client.login("alice", "rabbit").await.unwrap();
    assert_eq!(reply.status, Status::Failure);
    assert!(reply.value.is_none());
    assert_eq!(client.login("nobody", "x").await.unwrap().status, Status::DoesNotExist);

    client.shutdown().await;
    db.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handshake_latest_key_matches_session_hash() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    db.config().update(&test_config_update()).unwrap();
    let key = db.ensure_preferred_key().await.unwrap();
    db.bootstrap_admin(ADMIN, ADMIN_PASSWORD, "").unwrap();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let conn = db.register_connection("127.0.0.1:7".parse().unwrap());
    let server_db = db.clone();
    let server = tokio::spawn(async move {
        let mut channel = SecureChannel::new(b, Duration::from_secs(10));
        let outcome = authdb_server::handshake::accept(&server_db, &conn, &mut channel).await;
        (outcome, channel.session_hash(8))
    });

    let params = HandshakeParams {
        requested_key: LATEST_KEY,
        pinned_key: None,
        ephemeral_key_bits: 1024,
        bootstrap: None,
        registration: RegistrationRequest::Unspecified,
        max_block_length: 64 * 1024,
    };
    let mut channel = SecureChannel::new(a, Duration::from_secs(10));
    let result = handshake::connect(&mut channel, &params).await.unwrap();
    let HandshakeResult::Established(session) = result else {
        panic!("expected an established session, got {result:?}");
    };
    assert_eq!(session.key_id, key.id());
    assert_eq!(session.public_key, key.public_der());
    assert_eq!(session.ping_interval_ms, PING_MS as i32);
    assert!(session.registered.is_none());

    let (outcome, server_hash) = server.await.unwrap();
    assert!(outcome.is_ok());
    assert!(server_hash.is_some());
    assert_eq!(channel.session_hash(8), server_hash);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_operator() {
    let dir = tempfile::tempdir().unwrap();
    let (db, addr, task) = start_database(dir.path(), true).await;

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(Arc::new(admin_client(addr).await));
    }

    let mut handles = Vec::new();
    for (n, client) in clients.iter().enumerate() {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let (client, admin) = &*client;
            let mut ids = Vec::new();
            for i in 0..5 {
                let reply = client
                    .create_operator(*admin, new_operator(&format!("op-{n}-{i}"), 0))
                    .await
                    .unwrap();
                assert_eq!(reply.status, Status::Success);
                ids.push(reply.value.unwrap());
            }
            let shared = client
                .create_operator(*admin, new_operator("shared", 0))
                .await
                .unwrap();
            (ids, shared.status)
        }));
    }

    let mut all_ids = Vec::new();
    let mut shared_successes = 0;
    for handle in handles {
        let (ids, status) = handle.await.unwrap();
        all_ids.extend(ids);
        match status {
            Status::Success => shared_successes += 1,
            Status::Failure => {}
            other => panic!("unexpected status {other:?}"),
        }
    }
    let count = all_ids.len();
    all_ids.sort_unstable();
    all_ids.dedup();
    assert_eq!(all_ids.len(), count);
    assert_eq!(shared_successes, 1);
    // 管理者 + 20 人 + shared
    assert_eq!(db.operators().len(), 22);

    for client in &clients {
        client.0.shutdown().await;
    }
    db.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_permissions_are_contained() {
    let dir = tempfile::tempdir().unwrap();
    let (db, addr, task) = start_database(dir.path(), true).await;
    let (client, admin) = admin_client(addr).await;

    let manager = client
        .create_operator(admin, new_operator("manager", permission::OPERATORS))
        .await
        .unwrap()
        .value
        .unwrap();
    let login = client.login("manager", "pw").await.unwrap();
    assert_eq!(login.status, Status::Success);

    let created = client
        .create_operator(manager, new_operator("clerk", permission::ALL))
        .await
        .unwrap();
    assert_eq!(created.status, Status::Success);
    let clerk = created.value.unwrap();

    let list = client.get_operator_list(manager).await.unwrap().value.unwrap();
    let clerk_info = list.operators.iter().find(|op| op.id == clerk).unwrap();
    assert_eq!(clerk_info.permissions, permission::OPERATORS);

    assert_eq!(
        client.delete_operator(manager, admin).await,
        Some(Status::InsufficientPermissions)
    );
    assert_eq!(
        client.get_server_list(manager).await.unwrap().status,
        Status::InsufficientPermissions
    );
    assert_eq!(client.delete_operator(manager, clerk).await, Some(Status::Success));
    assert_eq!(client.logout(manager).await, Some(Status::Success));
    assert_eq!(
        client.get_operator_list(manager).await.unwrap().status,
        Status::NotLoggedIn
    );

    client.shutdown().await;
    db.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_configure_and_get_config() {
    let dir = tempfile::tempdir().unwrap();
    let (db, addr, task) = start_database(dir.path(), true).await;
    let (client, admin) = admin_client(addr).await;

    let config = client.get_config(admin).await.unwrap().value.unwrap();
    assert_eq!(config.ping_interval_ms, PING_MS);

    let update = ConfigUpdate {
        ping_interval_ms: Some(PING_MS + 100),
        ..Default::default()
    };
    assert_eq!(client.configure(admin, &update).await, Some(Status::Success));
    assert!(wait_until(|| client.state().ping_interval_ms == PING_MS + 100).await);

    let invalid = ConfigUpdate {
        ping_interval_ms: Some(1),
        ..Default::default()
    };
    assert_eq!(client.configure(admin, &invalid).await, Some(Status::Failure));
    assert_eq!(db.config().get().ping_interval_ms, PING_MS + 100);

    client.shutdown().await;
    db.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operator_updates_reach_cache_and_offline_lockout() {
    let dir = tempfile::tempdir().unwrap();
    let (db, addr, task) = start_database(dir.path(), true).await;
    let state_path = dir.path().join("kiosk-state.db");

    let kiosk = DatabaseClient::start(client_config(addr, Some(state_path.clone()), kiosk_registration())).unwrap();
    assert!(kiosk.wait_connected(Duration::from_secs(20)).await);
    assert!(kiosk.server_id().is_some());
    assert!(wait_until(|| kiosk.cached_operator(ADMIN).is_some()).await);

    let (admin_tool, admin) = admin_client(addr).await;
    let reply = admin_tool
        .create_operator(admin, new_operator("bob", 0))
        .await
        .unwrap();
    assert_eq!(reply.status, Status::Success);
    assert!(wait_until(|| kiosk.cached_operator("bob").is_some()).await);

    // 接続中は失敗を記録しない
    for _ in 0..4 {
        assert_eq!(
            kiosk.check_cached_credentials("bob", "wrong").await,
            Some(CredentialCheck::Failure)
        );
    }
    assert_eq!(
        kiosk.check_cached_credentials("bob", "pw").await,
        Some(CredentialCheck::Success)
    );

    admin_tool.shutdown().await;
    db.shutdown();
    task.await.unwrap().unwrap();
    assert!(wait_until(|| !kiosk.is_connected()).await);

    for _ in 0..3 {
        assert_eq!(
            kiosk.check_cached_credentials("bob", "wrong").await,
            Some(CredentialCheck::Failure)
        );
    }
    assert_eq!(
        kiosk.check_cached_credentials("bob", "pw").await,
        Some(CredentialCheck::LockedOut)
    );
    assert_eq!(kiosk.check_cached_credentials("mallory", "pw").await, None);
    kiosk.shutdown().await;

    // キャッシュとロックアウトは状態ファイルに残る
    let (state, operators) = authdb_client::PersistentState::load(&state_path).unwrap();
    assert!(state.snapshot().server_id.is_some());
    let bob = operators.iter().find(|op| op.username == "bob").unwrap();
    assert!(bob.lockout_until.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_migration_after_generate() {
    let dir = tempfile::tempdir().unwrap();
    let (db, addr, task) = start_database(dir.path(), true).await;
    let state_path = dir.path().join("kiosk-state.db");

    let kiosk = DatabaseClient::start(client_config(addr, Some(state_path), kiosk_registration())).unwrap();
    assert!(kiosk.wait_connected(Duration::from_secs(20)).await);
    let first_key = kiosk.state().key_id.unwrap();

    let (admin_tool, admin) = admin_client(addr).await;
    let reply = admin_tool.generate_preshared_key(admin).await.unwrap();
    assert_eq!(reply.status, Status::Success);
    let new_key = reply.value.unwrap();
    assert_ne!(new_key, first_key);

    assert!(wait_until(|| kiosk.state().key_id == Some(new_key)).await);
    let pinned = kiosk.state().public_key;
    assert_eq!(pinned, db.keys().get(new_key).unwrap().public_der());

    // 新しい鍵で接続し直せる
    kiosk.disconnect();
    assert!(wait_until(|| !kiosk.is_connected()).await);
    assert!(kiosk.wait_connected(Duration::from_secs(20)).await);
    assert_eq!(kiosk.state().key_id, Some(new_key));

    admin_tool.shutdown().await;
    kiosk.shutdown().await;
    db.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_as_existing_server() {
    let dir = tempfile::tempdir().unwrap();
    let (db, addr, task) = start_database(dir.path(), true).await;
    let state_path = dir.path().join("kiosk-state.db");

    let kiosk = DatabaseClient::start(client_config(addr, Some(state_path.clone()), kiosk_registration())).unwrap();
    assert!(kiosk.wait_connected(Duration::from_secs(20)).await);
    let server_id = kiosk.server_id().unwrap();
    kiosk.shutdown().await;
    drop(kiosk);

    let kiosk = DatabaseClient::start(client_config(addr, Some(state_path), kiosk_registration())).unwrap();
    assert!(kiosk.wait_connected(Duration::from_secs(20)).await);
    assert_eq!(kiosk.server_id(), Some(server_id));
    assert_eq!(db.servers().len(), 1);
    assert!(db.servers().get(server_id).unwrap().is_connected());

    let (admin_tool, admin) = admin_client(addr).await;
    let edits = ServerEdits::from_fields([
        server_edit::Field::Name("lobby".into()),
        server_edit::Field::Description("main entrance".into()),
    ]);
    assert_eq!(admin_tool.modify_server(admin, server_id, edits).await, Some(Status::Success));
    assert!(wait_until(|| kiosk.state().name == "lobby").await);
    assert_eq!(kiosk.state().description, "main entrance");

    let servers = admin_tool.get_server_list(admin).await.unwrap().value.unwrap();
    assert_eq!(servers.servers.len(), 1);
    assert!(servers.servers[0].connected);

    admin_tool.shutdown().await;
    kiosk.shutdown().await;
    db.shutdown();
    task.await.unwrap().unwrap();
}
