//! データベースクライアント
//!
//! [`DatabaseClient::start`] がバックグラウンドのドライバータスクを起動し、
//! ドライバーが接続・ハンドシェイク・ping サイクル・再接続を繰り返す。
//!
//! ```text
//! driver:
//!   connect (TCP + ハンドシェイクを connect_timeout 内で)
//!     → steady_state: PING → push 1 件 or 終端 → キューのコマンド → NO_FURTHER_INSTRUCTIONS
//!   切断 → backoff（異常切断は短く、意図した切断は長く）→ connect …
//! ```
//!
//! コマンド API は接続中のみ要求をキューに積む。接続していない、または
//! 応答前に接続が落ちた要求は `None` になる。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use authdb_crypto::rsa::public_key_from_der;
use authdb_proto::messages::{
    ActiveOperatorList, ClientState, NewOperator, OperatorEdits, OperatorInfo, OperatorList, OperatorRecord,
    OperatorUpdate, PresharedKey, ServerEdits, ServerList, ServerParams, ServerRegistration,
};
use authdb_proto::{Command, Push, Status};
use authdb_store::{now_ms, Config, ConfigUpdate, CredentialCheck, IDENTIFIER_LEN, LATEST_KEY};
use authdb_transport::SecureChannel;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::OperatorCache;
use crate::config::{ClientConfig, Registration};
use crate::error::ClientError;
use crate::handshake::{self, HandshakeParams, HandshakeResult, Registered, RegistrationRequest, Session};
use crate::request::{Body, Payload, Reply, Request, Response};
use crate::signalled;
use crate::state::PersistentState;

/// 意図した切断の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// 初回管理者を作成した
    Bootstrapped,
    /// `disconnect()` またはクライアントの破棄
    Requested,
}

struct Shared {
    config: ClientConfig,
    state: PersistentState,
    cache: OperatorCache,
    connected: watch::Sender<bool>,
    disconnect: Notify,
    shutdown: watch::Sender<bool>,
}

/// データベースへの接続を保ち続けるクライアント
///
/// # 例
/// ```no_run
/// # async fn demo() -> Result<(), authdb_client::ClientError> {
/// use std::time::Duration;
/// use authdb_client::{ClientConfig, DatabaseClient};
///
/// let client = DatabaseClient::start(ClientConfig::default())?;
/// if client.wait_connected(Duration::from_secs(10)).await {
///     if let Some(reply) = client.login("alice", "secret").await {
///         println!("login: {:?}", reply.status);
///     }
/// }
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct DatabaseClient {
    shared: Arc<Shared>,
    requests: mpsc::Sender<Request>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseClient {
    /// 状態ファイルを読み込み、ドライバータスクを起動する
    ///
    /// tokio ランタイムの中から呼ぶこと。
    ///
    /// # エラー
    /// - `ClientError::Store`: 状態ファイルが読めない・壊れている
    pub fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let (state, operators) = match &config.state_path {
            Some(path) => PersistentState::load(path)?,
            None => (PersistentState::in_memory(), Vec::new()),
        };
        let cache = OperatorCache::new(config.lockout, operators);
        let (requests, receiver) = mpsc::channel(config.request_queue.max(1));
        let shared = Arc::new(Shared {
            config,
            state,
            cache,
            connected: watch::channel(false).0,
            disconnect: Notify::new(),
            shutdown: watch::channel(false).0,
        });
        let driver = tokio::spawn(run_driver(shared.clone(), receiver));
        Ok(DatabaseClient {
            shared,
            requests,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// ハンドシェイクを終えて定常状態にあるか
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// 接続するまで最大 `limit` 待つ
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.shared.connected.subscribe();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(limit, wait).await.unwrap_or(false)
    }

    /// 登録済みサーバー ID
    pub fn server_id(&self) -> Option<u32> {
        self.shared.state.snapshot().server_id
    }

    /// 永続状態のコピー（オペレーターキャッシュは含まない）
    pub fn state(&self) -> ClientState {
        self.shared.state.snapshot()
    }

    pub fn cached_operators(&self) -> Vec<OperatorRecord> {
        self.shared.cache.records()
    }

    pub fn cached_operator(&self, username: &str) -> Option<OperatorInfo> {
        self.shared.cache.get(username)
    }

    /// キャッシュしたオペレーター情報でローカルに認証する
    ///
    /// データベースと切断中は失敗を記録し、ロックアウト規則を適用する。
    /// 接続中は記録しない（データベース側の LOGIN が記録する）。
    ///
    /// # 戻り値
    /// キャッシュにいないユーザー名なら `None`
    pub async fn check_cached_credentials(&self, username: &str, password: &str) -> Option<CredentialCheck> {
        let record_failures = !self.is_connected();
        let shared = self.shared.clone();
        let username = username.to_string();
        let password = password.to_string();
        let check = tokio::task::spawn_blocking(move || {
            shared.cache.check(&username, &password, now_ms(), record_failures)
        })
        .await
        .ok()??;
        if record_failures {
            persist(&self.shared).await;
        }
        Some(check)
    }

    // ==============================================================
    // コマンド
    // ==============================================================

    /// LOGIN
    ///
    /// ログイン扱い（SUCCESS / CHANGE_PASSWORD）ならオペレーター情報が付く。
    pub async fn login(&self, username: &str, password: &str) -> Option<Reply<OperatorInfo>> {
        let body = Body::Login {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response = self.call(Command::Login, body).await?;
        Some(reply(response, |p| match p {
            Payload::Operator(info) => Some(info),
            _ => None,
        }))
    }

    pub async fn logout(&self, actor: u32) -> Option<Status> {
        self.status(Command::Logout, Body::Actor(actor)).await
    }

    /// CREATE_OPERATOR。成功すると新しいオペレーター ID が付く
    pub async fn create_operator(&self, actor: u32, new: NewOperator) -> Option<Reply<u32>> {
        let response = self.call(Command::CreateOperator, Body::CreateOperator { actor, new }).await?;
        Some(reply(response, |p| match p {
            Payload::OperatorId(id) => Some(id),
            _ => None,
        }))
    }

    /// MODIFY_OPERATOR
    ///
    /// 一部の変更だけが受け入れられた場合は PARTIAL_SUCCESS。
    pub async fn modify_operator(&self, actor: u32, target: u32, edits: OperatorEdits) -> Option<Status> {
        self.status(Command::ModifyOperator, Body::ModifyOperator { actor, target, edits })
            .await
    }

    pub async fn delete_operator(&self, actor: u32, target: u32) -> Option<Status> {
        self.status(Command::DeleteOperator, Body::ActorTarget { actor, target })
            .await
    }

    pub async fn get_operator_list(&self, actor: u32) -> Option<Reply<OperatorList>> {
        let response = self.call(Command::GetOperatorList, Body::Actor(actor)).await?;
        Some(reply(response, |p| match p {
            Payload::Operators(list) => Some(list),
            _ => None,
        }))
    }

    pub async fn get_active_operators(&self, actor: u32) -> Option<Reply<ActiveOperatorList>> {
        let response = self.call(Command::GetActiveOperators, Body::Actor(actor)).await?;
        Some(reply(response, |p| match p {
            Payload::ActiveOperators(list) => Some(list),
            _ => None,
        }))
    }

    pub async fn modify_server(&self, actor: u32, server: u32, edits: ServerEdits) -> Option<Status> {
        self.status(Command::ModifyServer, Body::ModifyServer { actor, server, edits })
            .await
    }

    /// DISCONNECT_SERVER。接続していないサーバーには FAILURE
    pub async fn disconnect_server(&self, actor: u32, server: u32) -> Option<Status> {
        self.status(Command::DisconnectServer, Body::ActorTarget { actor, target: server })
            .await
    }

    pub async fn delete_server(&self, actor: u32, server: u32) -> Option<Status> {
        self.status(Command::DeleteServer, Body::ActorTarget { actor, target: server })
            .await
    }

    pub async fn get_server_list(&self, actor: u32) -> Option<Reply<ServerList>> {
        let response = self.call(Command::GetServerList, Body::Actor(actor)).await?;
        Some(reply(response, |p| match p {
            Payload::Servers(list) => Some(list),
            _ => None,
        }))
    }

    /// GET_CONFIG
    pub async fn get_config(&self, actor: u32) -> Option<Reply<Config>> {
        let response = self.call(Command::GetConfig, Body::Actor(actor)).await?;
        Some(reply(response, |p| match p {
            Payload::Config(json) => serde_json::from_str(&json)
                .map_err(|e| warn!(error = %e, "database sent an unreadable config"))
                .ok(),
            _ => None,
        }))
    }

    /// CONFIGURE。ポート・バックログの変更は RESTART_DATABASE まで反映されない
    pub async fn configure(&self, actor: u32, update: &ConfigUpdate) -> Option<Status> {
        let json = serde_json::to_string(update).ok()?;
        self.status(Command::Configure, Body::Configure { actor, json }).await
    }

    /// GENERATE_PRESHARED_KEY。成功すると新しい鍵 ID が付く
    pub async fn generate_preshared_key(&self, actor: u32) -> Option<Reply<i32>> {
        let response = self.call(Command::GeneratePresharedKey, Body::Actor(actor)).await?;
        Some(reply(response, |p| match p {
            Payload::KeyId(id) => Some(id),
            _ => None,
        }))
    }

    pub async fn restart_database(&self, actor: u32) -> Option<Status> {
        self.status(Command::RestartDatabase, Body::Actor(actor)).await
    }

    // ==============================================================
    // 接続の制御
    // ==============================================================

    /// 現在の接続を閉じる。再接続は長い方の待ち時間の後になる
    pub fn disconnect(&self) {
        if self.is_connected() {
            self.shared.disconnect.notify_one();
        }
    }

    /// ドライバーを止めて終了を待つ
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(error = %e, "client driver task failed");
            }
        }
    }

    async fn call(&self, command: Command, body: Body) -> Option<Response> {
        if !self.is_connected() {
            return None;
        }
        let (request, response) = Request::new(command, body);
        self.requests.send(request).await.ok()?;
        response.await.ok()
    }

    async fn status(&self, command: Command, body: Body) -> Option<Status> {
        self.call(command, body).await.map(|r| r.status)
    }
}

impl Drop for DatabaseClient {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

fn reply<T>(response: Response, extract: impl FnOnce(Payload) -> Option<T>) -> Reply<T> {
    Reply {
        status: response.status,
        value: extract(response.payload),
    }
}

// ==============================================================
// ドライバー
// ==============================================================

async fn run_driver(shared: Arc<Shared>, mut requests: mpsc::Receiver<Request>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let end = tokio::select! {
            end = connect_and_serve(&shared, &mut requests) => end,
            _ = signalled(&mut shutdown) => break,
        };
        shared.connected.send_replace(false);

        let delay = match end {
            // 初回管理者を作った直後のデータベースは構成済みなので、すぐに繋ぎ直す
            Ok(Disconnect::Bootstrapped) => Duration::ZERO,
            Ok(Disconnect::Requested) => {
                info!("disconnected from database");
                shared.config.reconnect_delay_clean
            }
            Err(e) => {
                recover(&shared, &e).await;
                shared.config.reconnect_delay_error
            }
        };
        if !backoff(&mut requests, &mut shutdown, delay).await {
            break;
        }
    }
    shared.connected.send_replace(false);
    debug!("client driver stopped");
}

/// 失敗の種類に応じて永続状態を直す
async fn recover(shared: &Arc<Shared>, e: &ClientError) {
    match e {
        ClientError::KeyRejected(key) => {
            warn!(key, "database no longer has the pinned key, requesting the latest key");
            shared.state.clear_pinned_key();
            persist(shared).await;
        }
        ClientError::UnknownServer(server) => {
            warn!(server, "database does not know this server, registering again");
            shared.state.clear_registration();
            persist(shared).await;
        }
        ClientError::KeyMismatch(key) => {
            error!(key, "database public key does not match the pinned key");
        }
        ClientError::Channel(c) if c.is_disconnect() => info!(reason = %c, "connection to database lost"),
        other => warn!(error = %other, "connection to database failed"),
    }
}

/// 再接続まで待つ。待つ間に届いた要求は破棄する。シャットダウンなら false
async fn backoff(
    requests: &mut mpsc::Receiver<Request>,
    shutdown: &mut watch::Receiver<bool>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = signalled(shutdown) => return false,
            request = requests.recv() => match request {
                Some(request) => debug!(command = ?request.command, "dropping request while disconnected"),
                None => return false,
            },
        }
    }
}

fn handshake_params(shared: &Shared) -> HandshakeParams {
    let config = &shared.config;
    let state = shared.state.snapshot();
    let (requested_key, pinned_key) = match state.key_id {
        Some(id) if !state.public_key.is_empty() => (id, Some(state.public_key)),
        _ => (LATEST_KEY, None),
    };
    let registration = match &config.registration {
        Registration::Unspecified => RegistrationRequest::Unspecified,
        Registration::Server {
            name,
            description,
            secret,
        } => match state.server_id {
            Some(server_id) if state.identifier.len() == IDENTIFIER_LEN => RegistrationRequest::Existing {
                server_id,
                identifier: state.identifier,
            },
            _ => RegistrationRequest::New(ServerRegistration {
                name: name.clone(),
                description: description.clone(),
                secret: secret.clone(),
            }),
        },
    };
    HandshakeParams {
        requested_key,
        pinned_key,
        ephemeral_key_bits: config.ephemeral_key_bits,
        bootstrap: config.bootstrap.clone(),
        registration,
        max_block_length: config.max_block_length,
    }
}

async fn connect_and_serve(
    shared: &Arc<Shared>,
    requests: &mut mpsc::Receiver<Request>,
) -> Result<Disconnect, ClientError> {
    let config = &shared.config;
    let params = handshake_params(shared);
    let addr = format!("{}:{}", config.host, config.port);

    let connecting = async {
        let stream = TcpStream::connect(addr.as_str()).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let mut channel = SecureChannel::new(stream, config.timeout);
        let result = handshake::connect(&mut channel, &params).await?;
        Ok::<_, ClientError>((channel, result))
    };
    let (mut channel, result) = tokio::time::timeout(config.connect_timeout, connecting)
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;

    let session = match result {
        HandshakeResult::Bootstrapped => {
            info!(%addr, "bootstrap administrator created");
            channel.shutdown().await;
            return Ok(Disconnect::Bootstrapped);
        }
        HandshakeResult::Established(session) => session,
    };

    apply_session(shared, &session).await;
    shared.connected.send_replace(true);
    info!(%addr, key = session.key_id, server = ?shared.state.snapshot().server_id, "connected to database");

    let result = steady_state(shared, &mut channel, requests, &session).await;
    channel.shutdown().await;
    result
}

/// ハンドシェイクの結果を永続状態に反映する
async fn apply_session(shared: &Arc<Shared>, session: &Session) {
    let registration = &shared.config.registration;
    shared.state.modify(|s| {
        s.key_id = Some(session.key_id);
        s.public_key = session.public_key.clone();
        s.ping_interval_ms = u32::try_from(session.ping_interval_ms).unwrap_or(0);
        match &session.registered {
            Some(Registered::New { server_id, identifier }) => {
                s.server_id = Some(*server_id);
                s.identifier = identifier.clone();
                if let Registration::Server { name, description, .. } = registration {
                    s.name = name.clone();
                    s.description = description.clone();
                }
            }
            Some(Registered::Existing { params, .. }) => {
                s.name = params.name.clone();
                s.description = params.description.clone();
            }
            None => {}
        }
    });
    if let Some(Registered::New { server_id, .. }) = &session.registered {
        info!(server = server_id, "registered with database");
    }
    persist(shared).await;
}

fn ping_interval(ms: i32) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0).max(1))
}

async fn steady_state<S>(
    shared: &Arc<Shared>,
    channel: &mut SecureChannel<S>,
    requests: &mut mpsc::Receiver<Request>,
    session: &Session,
) -> Result<Disconnect, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let max = shared.config.max_block_length;
    let mut interval = ping_interval(session.ping_interval_ms);
    let mut queued: VecDeque<Request> = VecDeque::new();
    let mut ping_now = true;

    loop {
        if !ping_now {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shared.disconnect.notified() => return Ok(Disconnect::Requested),
                request = requests.recv() => match request {
                    Some(request) => queued.push_back(request),
                    None => return Ok(Disconnect::Requested),
                },
            }
        }

        channel.write_opcode(Command::Ping).await?;
        let push: Push = channel.read_opcode().await?;
        let delivered = push != Push::NoFurtherInstructions;
        if delivered {
            if let Some(updated) = apply_push(shared, channel, push).await? {
                interval = updated;
            }
        }

        while let Some(request) = queued.pop_front().or_else(|| requests.try_recv().ok()) {
            debug!(command = ?request.command, "sending command");
            request.execute(channel, max).await?;
        }
        channel.write_opcode(Command::NoFurtherInstructions).await?;

        // プッシュが届いたサイクルの直後は残りを取りに行く
        ping_now = delivered;
    }
}

/// プッシュ通知を 1 件読んで反映する。ping 間隔が変わればそれを返す
async fn apply_push<S>(
    shared: &Arc<Shared>,
    channel: &mut SecureChannel<S>,
    push: Push,
) -> Result<Option<Duration>, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let max = shared.config.max_block_length;
    let mut interval = None;
    match push {
        Push::NoFurtherInstructions => return Ok(None),
        Push::UpdatePresharedKey => {
            let key: PresharedKey = channel.read_message(max).await?;
            public_key_from_der(&key.public_key)?;
            info!(key = key.key_id, "migrating to new database key");
            shared.state.modify(|s| {
                s.key_id = Some(key.key_id);
                s.public_key = key.public_key;
            });
        }
        Push::UpdatePingInterval => {
            let ms = channel.read_int().await?;
            let Ok(stored) = u32::try_from(ms) else {
                warn!(ms, "ignoring invalid ping interval");
                return Ok(None);
            };
            debug!(ms, "ping interval updated");
            shared.state.modify(|s| s.ping_interval_ms = stored);
            interval = Some(ping_interval(ms));
        }
        Push::UpdateOperators => {
            let update: OperatorUpdate = channel.read_message(max).await?;
            shared.cache.apply(&update);
        }
        Push::UpdateServerParams => {
            let params: ServerParams = channel.read_message(max).await?;
            info!(name = %params.name, "server parameters updated");
            shared.state.modify(|s| {
                s.name = params.name;
                s.description = params.description;
            });
        }
    }
    persist(shared).await;
    Ok(interval)
}

/// 永続状態を書き出す。失敗はログに残して false を返す
async fn persist(shared: &Arc<Shared>) -> bool {
    let shared = shared.clone();
    let saved = tokio::task::spawn_blocking(move || shared.state.save(shared.cache.records())).await;
    match saved {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "failed to save client state");
            false
        }
        Err(e) => {
            error!(error = %e, "client state save task failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(config: ClientConfig) -> Shared {
        Shared {
            cache: OperatorCache::new(config.lockout, Vec::new()),
            config,
            state: PersistentState::in_memory(),
            connected: watch::channel(false).0,
            disconnect: Notify::new(),
            shutdown: watch::channel(false).0,
        }
    }

    #[test]
    fn test_params_request_latest_key_until_pinned() {
        let shared = shared(ClientConfig::default());
        let params = handshake_params(&shared);
        assert_eq!(params.requested_key, LATEST_KEY);
        assert_eq!(params.pinned_key, None);
        assert_eq!(params.registration, RegistrationRequest::Unspecified);

        shared.state.modify(|s| {
            s.key_id = Some(3);
            s.public_key = vec![1, 2];
        });
        let params = handshake_params(&shared);
        assert_eq!(params.requested_key, 3);
        assert_eq!(params.pinned_key, Some(vec![1, 2]));
    }

    #[test]
    fn test_params_registration_follows_stored_identity() {
        let shared = shared(ClientConfig {
            registration: Registration::Server {
                name: "kiosk".into(),
                description: "front desk".into(),
                secret: "s3cret".into(),
            },
            ..Default::default()
        });
        assert!(matches!(
            handshake_params(&shared).registration,
            RegistrationRequest::New(ref r) if r.name == "kiosk" && r.secret == "s3cret"
        ));

        shared.state.modify(|s| {
            s.server_id = Some(8);
            s.identifier = vec![5; IDENTIFIER_LEN];
        });
        assert_eq!(
            handshake_params(&shared).registration,
            RegistrationRequest::Existing {
                server_id: 8,
                identifier: vec![5; IDENTIFIER_LEN]
            }
        );

        // 壊れた識別子は登録し直す
        shared.state.modify(|s| s.identifier = vec![5; 3]);
        assert!(matches!(handshake_params(&shared).registration, RegistrationRequest::New(_)));
    }

    #[tokio::test]
    async fn test_commands_resolve_to_none_while_disconnected() {
        let client = DatabaseClient::start(ClientConfig {
            port: 1,
            reconnect_delay_error: Duration::from_secs(60),
            ..Default::default()
        })
        .unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.login("alice", "pw").await, None);
        assert_eq!(client.logout(1).await, None);
        assert!(!client.wait_connected(Duration::from_millis(50)).await);
        client.shutdown().await;
    }

    #[test]
    fn test_ping_interval_floor() {
        assert_eq!(ping_interval(250), Duration::from_millis(250));
        assert_eq!(ping_interval(0), Duration::from_millis(1));
        assert_eq!(ping_interval(-5), Duration::from_millis(1));
    }
}
