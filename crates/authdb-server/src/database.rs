//! データベースサービス
//!
//! ストア・鍵リング・設定・生きているコネクションをまとめて所有し、
//! `Arc<Database>` として各コネクションタスクへ渡される。
//!
//! ## ライフサイクル
//! ```text
//! open(data_dir) → ensure_preferred_key() → run()
//!   run: bind → accept ループ ─┬─ restart 要求 → 全切断・保存・設定再読込・再 bind
//!                              └─ shutdown    → 全切断・保存して終了
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use authdb_proto::messages::{ActiveOperator, ActiveOperatorList, NewOperator, PresharedKey};
use authdb_proto::permission;
use authdb_store::{now_ms, ConfigStore, Key, KeyRing, Operator, OperatorStore, ServerRegistry, StoreError};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionHandle;
use crate::error::ServerError;
use crate::push::PushTask;
use crate::{backup, session, signalled};
use crate::{CONFIG_FILE, KEYS_FILE, OPERATORS_FILE, SERVERS_FILE};

/// accept ループを抜けた理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeOutcome {
    Restart,
    Shutdown,
}

/// バックグラウンド保存の対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreKind {
    Operators,
    Servers,
}

/// データベースサービス本体
#[derive(Debug)]
pub struct Database {
    data_dir: PathBuf,
    config: ConfigStore,
    operators: OperatorStore,
    servers: ServerRegistry,
    keys: KeyRing,
    connections: RwLock<HashMap<u64, Arc<ConnectionHandle>>>,
    next_connection: AtomicU64,
    /// 初回管理者の作成を直列化する
    bootstrap: Mutex<()>,
    local_addr: Mutex<Option<SocketAddr>>,
    restart: Notify,
    shutdown: watch::Sender<bool>,
}

impl Database {
    /// データディレクトリからすべてのストアを読み込む
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Arc<Self>, ServerError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let config = ConfigStore::load(data_dir.join(CONFIG_FILE))?;
        let operators = OperatorStore::load(data_dir.join(OPERATORS_FILE))?;
        let servers = ServerRegistry::load(data_dir.join(SERVERS_FILE))?;
        let keys = KeyRing::load(data_dir.join(KEYS_FILE))?;
        let (shutdown, _) = watch::channel(false);
        info!(dir = %data_dir.display(), operators = operators.len(), servers = servers.len(), "database opened");
        Ok(Arc::new(Database {
            data_dir,
            config,
            operators,
            servers,
            keys,
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            bootstrap: Mutex::new(()),
            local_addr: Mutex::new(None),
            restart: Notify::new(),
            shutdown,
        }))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn operators(&self) -> &OperatorStore {
        &self.operators
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// 現在 listen しているアドレス
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    // ==============================================================
    // 鍵
    // ==============================================================

    /// 優先鍵がなければ生成する（初回起動時）
    pub async fn ensure_preferred_key(self: &Arc<Self>) -> Result<Arc<Key>, ServerError> {
        if let Some(key) = self.keys.preferred() {
            return Ok(key);
        }
        info!("key ring is empty, generating the first key");
        self.spawn_key_generation().await
    }

    /// 新しい優先鍵を生成し、すべてのコネクションへ通知する
    pub async fn generate_key(self: &Arc<Self>) -> Result<Arc<Key>, ServerError> {
        let key = self.spawn_key_generation().await?;
        self.push_to_all(PushTask::PresharedKey(PresharedKey {
            key_id: key.id(),
            public_key: key.public_der().to_vec(),
        }));
        Ok(key)
    }

    async fn spawn_key_generation(self: &Arc<Self>) -> Result<Arc<Key>, ServerError> {
        let bits = self.config.get().key_bits;
        let db = self.clone();
        let key = tokio::task::spawn_blocking(move || db.keys.generate_new_key(bits)).await??;
        Ok(key)
    }

    // ==============================================================
    // 初回管理者
    // ==============================================================

    /// オペレーターが 1 人もいないときに、全権限を持つ最初の管理者を作る
    ///
    /// パスワードのハッシュ計算を含むため、非同期コンテキストからは
    /// `spawn_blocking` 経由で呼ぶこと。
    ///
    /// # エラー
    /// - `ServerError::AlreadyConfigured`: すでにオペレーターがいる
    /// - `ServerError::Store`: ユーザー名が不正、または保存に失敗した
    pub fn bootstrap_admin(&self, username: &str, password: &str, display_name: &str) -> Result<Arc<Operator>, ServerError> {
        let _guard = self.bootstrap.lock();
        if !self.operators.is_empty() {
            return Err(ServerError::AlreadyConfigured);
        }
        let new = NewOperator {
            username: username.to_string(),
            password: password.to_string(),
            display_name: display_name.to_string(),
            permissions: permission::ALL,
            ..Default::default()
        };
        let iterations = self.config.get().hash_iterations;
        let operator = self.operators.add(&new, iterations, now_ms())?;
        self.operators.save()?;
        info!(operator = operator.id(), "bootstrap administrator created");
        Ok(operator)
    }

    // ==============================================================
    // コネクション
    // ==============================================================

    pub fn register_connection(&self, peer: SocketAddr) -> Arc<ConnectionHandle> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(id, peer));
        self.connections.write().insert(id, handle.clone());
        handle
    }

    pub fn unregister_connection(&self, id: u64) {
        self.connections.write().remove(&id);
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// すべてのコネクションに切断を要求する
    pub fn close_all_connections(&self) {
        for conn in self.connections() {
            conn.close();
        }
    }

    /// サーバーに紐付いたコネクションを切断する。接続していなければ false
    pub fn disconnect_server(&self, server_id: u32) -> bool {
        let mut found = false;
        for conn in self.connections() {
            if conn.server_id() == Some(server_id) {
                conn.close();
                found = true;
            }
        }
        found
    }

    /// 全コネクションのログイン中オペレーター
    pub fn active_operators(&self) -> ActiveOperatorList {
        let mut operators = Vec::new();
        for conn in self.connections() {
            let server = conn.server();
            for (operator, remaining) in conn.active_operators() {
                operators.push(ActiveOperator {
                    operator_id: operator.id(),
                    username: operator.username(),
                    display_name: operator.display_name(),
                    server_id: server.as_ref().map(|s| s.id()),
                    server_name: server.as_ref().map(|s| s.name()).unwrap_or_default(),
                    expires_in_ms: i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX),
                });
            }
        }
        operators.sort_by_key(|o| o.operator_id);
        ActiveOperatorList { operators }
    }

    // ==============================================================
    // プッシュ通知のファンアウト
    // ==============================================================

    pub fn push_to_all(&self, task: PushTask) {
        for conn in self.connections() {
            conn.enqueue(task.clone());
        }
    }

    /// サーバーとして登録済みのコネクションにだけ送る（オペレーターキャッシュ用）
    pub fn push_to_servers(&self, task: PushTask) {
        for conn in self.connections() {
            if conn.server_id().is_some() {
                conn.enqueue(task.clone());
            }
        }
    }

    /// 指定サーバーのコネクションに送る。接続していなければ false
    pub fn push_to_server(&self, server_id: u32, task: PushTask) -> bool {
        let mut delivered = false;
        for conn in self.connections() {
            if conn.server_id() == Some(server_id) {
                conn.enqueue(task.clone());
                delivered = true;
            }
        }
        delivered
    }

    // ==============================================================
    // 保存
    // ==============================================================

    /// すべてのストアを保存する。失敗はログに残し、全成功なら true
    pub fn save_all(&self) -> bool {
        let results: [(&str, Result<(), StoreError>); 4] = [
            ("config", self.config.save()),
            ("operators", self.operators.save()),
            ("servers", self.servers.save()),
            ("keys", self.keys.save()),
        ];
        let mut ok = true;
        for (store, result) in results {
            if let Err(e) = result {
                error!(store, error = %e, "failed to save store");
                ok = false;
            }
        }
        ok
    }

    /// ストアをブロッキングスレッドで保存する（完了は待たない）
    pub(crate) fn save_later(self: &Arc<Self>, kind: StoreKind) {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = match kind {
                StoreKind::Operators => db.operators.save(),
                StoreKind::Servers => db.servers.save(),
            };
            if let Err(e) = result {
                error!(store = ?kind, error = %e, "failed to save store");
            }
        });
    }

    // ==============================================================
    // 実行・再起動・停止
    // ==============================================================

    /// 再起動を要求する（全切断・保存・設定再読込・再 bind）
    pub fn request_restart(&self) {
        info!("database restart requested");
        self.restart.notify_one();
    }

    /// 停止を要求する
    pub fn shutdown(&self) {
        info!("database shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 設定のポートで listen して実行する
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let config = self.config.get();
        let listener = bind(SocketAddr::from(([0, 0, 0, 0], config.port)), config.backlog)?;
        self.serve(listener, true).await
    }

    /// 既に bind 済みのリスナーで実行する（再起動時も同じアドレスを使う）
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        self.serve(listener, false).await
    }

    async fn serve(self: Arc<Self>, mut listener: TcpListener, follow_config_port: bool) -> Result<(), ServerError> {
        let backups = tokio::spawn(backup::run_backups(self.clone()));
        let result = loop {
            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => break Err(e.into()),
            };
            *self.local_addr.lock() = Some(addr);
            info!(%addr, "database listening");

            let outcome = self.accept_loop(&listener).await;
            drop(listener);
            self.servers.disconnect_all();
            self.save_all();
            if outcome == ServeOutcome::Shutdown {
                break Ok(());
            }

            let config = match self.config.reload() {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "failed to reload config, keeping the current one");
                    self.config.get()
                }
            };
            let port = if follow_config_port { config.port } else { addr.port() };
            listener = match bind(SocketAddr::new(addr.ip(), port), config.backlog) {
                Ok(listener) => listener,
                Err(e) => break Err(e),
            };
            info!("database restarted");
        };
        backups.abort();
        *self.local_addr.lock() = None;
        result
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> ServeOutcome {
        let mut shutdown = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let db = self.clone();
                        tasks.spawn(session::serve_connection(db, stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = self.restart.notified() => break ServeOutcome::Restart,
                _ = signalled(&mut shutdown) => break ServeOutcome::Shutdown,
            }
        };
        self.close_all_connections();
        while tasks.join_next().await.is_some() {}
        debug!(?outcome, "accept loop stopped");
        outcome
    }
}

/// SO_REUSEADDR 付きで bind する（再起動直後の再 bind のため）
fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}
