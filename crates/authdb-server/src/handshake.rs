//! サーバー側ハンドシェイク
//!
//! 状態機械として実装する。各状態の処理は次の状態を返し、失敗はそのまま
//! コネクションを終わらせる。
//!
//! ```text
//! Version → KeyRequest → EphemeralKey → SessionKey → InstallState
//!                                                     ├─ Bootstrap → Done(Bootstrapped)
//!                                                     └─ Registration → PingInterval → Done(Established)
//! ```

use std::sync::Arc;

use authdb_crypto::password::constant_time_eq;
use authdb_crypto::rsa::{decrypt_chunked, encrypt_chunked, public_key_from_der};
use authdb_crypto::{generate_session_key, RsaPublicKey};
use authdb_proto::messages::{BootstrapAdmin, PresharedKey, ServerRegistration};
use authdb_proto::{
    check_compatible, HandshakeCode, Status, MAX_KEY_BLOCK_LENGTH, MAX_VERSION_LENGTH, PROTOCOL_VERSION,
};
use authdb_store::{now_ms, Key, IDENTIFIER_LEN};
use authdb_transport::SecureChannel;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::connection::ConnectionHandle;
use crate::database::{Database, StoreKind};
use crate::error::{ServerError, SessionError};
use crate::push::PushTask;

/// ハンドシェイクの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// 定常状態（ping サイクル）へ進む
    Established {
        key_id: i32,
        server_id: Option<u32>,
    },
    /// 初回管理者を作成した。コネクションはここで終わる
    Bootstrapped { operator_id: u32 },
}

enum State {
    Version,
    KeyRequest,
    EphemeralKey(Arc<Key>),
    SessionKey { key: Arc<Key>, ephemeral: RsaPublicKey },
    InstallState(Arc<Key>),
    Bootstrap,
    Registration(Arc<Key>),
    PingInterval { key: Arc<Key>, server_id: Option<u32> },
    Done(HandshakeOutcome),
}

/// クライアントからのハンドシェイクを受け付ける
pub async fn accept<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<HandshakeOutcome, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut state = State::Version;
    loop {
        state = match state {
            State::Version => exchange_version(channel).await?,
            State::KeyRequest => resolve_key(db, channel).await?,
            State::EphemeralKey(key) => receive_ephemeral_key(key, channel).await?,
            State::SessionKey { key, ephemeral } => send_session_key(key, &ephemeral, channel).await?,
            State::InstallState(key) => send_install_state(db, key, channel).await?,
            State::Bootstrap => bootstrap(db, channel).await?,
            State::Registration(key) => register(db, conn, key, channel).await?,
            State::PingInterval { key, server_id } => send_ping_interval(db, key, server_id, channel).await?,
            State::Done(outcome) => return Ok(outcome),
        };
    }
}

async fn exchange_version<S>(channel: &mut SecureChannel<S>) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let remote = channel.read_string(MAX_VERSION_LENGTH).await?;
    channel.write_string(PROTOCOL_VERSION).await?;
    check_compatible(PROTOCOL_VERSION, &remote)?;
    Ok(State::KeyRequest)
}

async fn resolve_key<S>(db: &Database, channel: &mut SecureChannel<S>) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let requested = channel.read_int().await?;
    let key = db.keys().lookup(requested).ok_or(SessionError::UnknownKey(requested))?;
    channel.write_int(key.id()).await?;
    channel.write_block(key.public_der()).await?;
    debug!(requested, key = key.id(), "handshake key resolved");
    Ok(State::EphemeralKey(key))
}

async fn receive_ephemeral_key<S>(key: Arc<Key>, channel: &mut SecureChannel<S>) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let wrapped = channel.read_block(MAX_KEY_BLOCK_LENGTH).await?;
    let der = decrypt_chunked(key.private_key(), &wrapped)?;
    let ephemeral = public_key_from_der(&der)?;
    Ok(State::SessionKey { key, ephemeral })
}

async fn send_session_key<S>(
    key: Arc<Key>,
    ephemeral: &RsaPublicKey,
    channel: &mut SecureChannel<S>,
) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let session_key = generate_session_key()?;
    let wrapped = encrypt_chunked(ephemeral, &session_key)?;
    channel.write_block(&wrapped).await?;
    channel.rekey(&session_key)?;
    Ok(State::InstallState(key))
}

async fn send_install_state<S>(db: &Database, key: Arc<Key>, channel: &mut SecureChannel<S>) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if db.operators().is_empty() {
        channel.write_opcode(HandshakeCode::BlankInstall).await?;
        Ok(State::Bootstrap)
    } else {
        channel.write_opcode(HandshakeCode::Configured).await?;
        Ok(State::Registration(key))
    }
}

async fn bootstrap<S>(db: &Arc<Database>, channel: &mut SecureChannel<S>) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let max = db.config().get().max_block_length;
    let request: BootstrapAdmin = channel.read_message(max).await?;
    let db_for_hash = db.clone();
    let created = tokio::task::spawn_blocking(move || {
        db_for_hash.bootstrap_admin(&request.username, &request.password, &request.display_name)
    })
    .await?;
    match created {
        Ok(operator) => {
            channel.write_opcode(Status::Success).await?;
            Ok(State::Done(HandshakeOutcome::Bootstrapped { operator_id: operator.id() }))
        }
        Err(e) => {
            channel.write_opcode(Status::Failure).await?;
            match e {
                ServerError::AlreadyConfigured | ServerError::Store(_) => Err(SessionError::Rejected(e.to_string())),
                other => Err(other.into()),
            }
        }
    }
}

async fn register<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    key: Arc<Key>,
    channel: &mut SecureChannel<S>,
) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let code: HandshakeCode = channel.read_opcode().await?;
    let server_id = match code {
        HandshakeCode::NewServer => Some(register_new_server(db, conn, channel).await?),
        HandshakeCode::ExistingServer => Some(reconnect_server(db, conn, channel).await?),
        HandshakeCode::Unspecified => None,
        other => return Err(SessionError::Protocol(format!("unexpected handshake code {other:?}"))),
    };

    if server_id.is_some() {
        conn.enqueue(PushTask::full_sync(db.operators().records()));
        if let Some(preferred) = db.keys().preferred().filter(|p| p.id() != key.id()) {
            conn.enqueue(PushTask::PresharedKey(PresharedKey {
                key_id: preferred.id(),
                public_key: preferred.public_der().to_vec(),
            }));
        }
    }
    Ok(State::PingInterval { key, server_id })
}

/// 失敗ステータスを送ってから拒否する
async fn reject<S>(channel: &mut SecureChannel<S>, status: Status, reason: String) -> Result<u32, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    channel.write_opcode(status).await?;
    Err(SessionError::Rejected(reason))
}

async fn register_new_server<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<u32, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = db.config().get();
    let request: ServerRegistration = channel.read_message(config.max_block_length).await?;
    if !config.registration_secret.is_empty()
        && !constant_time_eq(config.registration_secret.as_bytes(), request.secret.as_bytes())
    {
        return reject(channel, Status::Failure, "registration secret mismatch".into()).await;
    }

    let ip = conn.peer().ip().to_string();
    let server = match db.servers().register(&request.name, &request.description, &ip, now_ms()) {
        Ok(server) => server,
        Err(e) => return reject(channel, Status::Failure, e.to_string()).await,
    };
    server.connect();
    conn.bind_server(server.clone());
    db.save_later(StoreKind::Servers);

    channel.write_opcode(Status::Success).await?;
    channel.write_u32(server.id()).await?;
    channel.write_fixed(&server.identifier()).await?;
    info!(conn = conn.id(), server = server.id(), name = %server.name(), "new server registered");
    Ok(server.id())
}

async fn reconnect_server<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<u32, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = channel.read_u32().await?;
    let identifier = channel.read_fixed(IDENTIFIER_LEN).await?;
    let Some(server) = db.servers().get(id) else {
        return reject(channel, Status::DoesNotExist, format!("unknown server {id}")).await;
    };
    if !server.verify_identifier(&identifier) {
        return reject(channel, Status::Failure, format!("identifier mismatch for server {id}")).await;
    }
    if !server.connect() {
        return reject(channel, Status::Failure, format!("server {id} is already connected")).await;
    }
    conn.bind_server(server.clone());
    server.set_ip(&conn.peer().ip().to_string());

    channel.write_opcode(Status::Success).await?;
    channel.write_message(&server.params()).await?;
    info!(conn = conn.id(), server = id, "server reconnected");
    Ok(id)
}

async fn send_ping_interval<S>(
    db: &Database,
    key: Arc<Key>,
    server_id: Option<u32>,
    channel: &mut SecureChannel<S>,
) -> Result<State, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let ping_ms = i32::try_from(db.config().get().ping_interval_ms).unwrap_or(i32::MAX);
    channel.write_int(ping_ms).await?;
    Ok(State::Done(HandshakeOutcome::Established {
        key_id: key.id(),
        server_id,
    }))
}
