//! コネクションハンドル
//!
//! 生きているソケット 1 本につき 1 つ。コネクションタスクとデータベース
//! （ファンアウト・強制切断・アクティブオペレーター一覧）の双方から参照される。
//! チャンネル本体はコネクションタスクだけが持ち、ここには共有が必要な状態だけを置く。

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use authdb_store::{Operator, Server};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::push::PushTask;

/// ログイン中のオペレーター 1 人分のセッション
#[derive(Debug, Clone)]
struct OperatorTracker {
    operator: Arc<Operator>,
    expires_at: Instant,
}

impl OperatorTracker {
    fn is_valid(&self, now: Instant) -> bool {
        !self.operator.is_disposed() && self.expires_at > now
    }
}

/// 共有されるコネクション状態
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    server: RwLock<Option<Arc<Server>>>,
    trackers: Mutex<HashMap<u32, OperatorTracker>>,
    pushes: Mutex<VecDeque<PushTask>>,
    close: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        let (close, _) = watch::channel(false);
        ConnectionHandle {
            id,
            peer,
            server: RwLock::new(None),
            trackers: Mutex::new(HashMap::new()),
            pushes: Mutex::new(VecDeque::new()),
            close,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    // ==============================================================
    // サーバーの紐付け
    // ==============================================================

    /// ハンドシェイクで認証されたサーバーを紐付ける
    pub fn bind_server(&self, server: Arc<Server>) {
        *self.server.write() = Some(server);
    }

    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.read().clone()
    }

    pub fn server_id(&self) -> Option<u32> {
        self.server.read().as_ref().map(|s| s.id())
    }

    /// 紐付いたサーバーを未接続に戻して外す
    pub fn release_server(&self) {
        if let Some(server) = self.server.write().take() {
            server.disconnect();
        }
    }

    // ==============================================================
    // プッシュ通知キュー
    // ==============================================================

    pub fn enqueue(&self, task: PushTask) {
        self.pushes.lock().push_back(task);
    }

    /// listen2 で送る 1 件を取り出す
    pub fn pop_push(&self) -> Option<PushTask> {
        self.pushes.lock().pop_front()
    }

    pub fn pending_pushes(&self) -> usize {
        self.pushes.lock().len()
    }

    // ==============================================================
    // 切断シグナル
    // ==============================================================

    /// コネクションタスクに切断を要求する
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closing(&self) -> bool {
        *self.close.borrow()
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }

    // ==============================================================
    // オペレータートラッカー
    // ==============================================================

    /// ログインに成功したオペレーターのトラッカーを作る（既存なら置き換える）
    pub fn login(&self, operator: Arc<Operator>, session_timeout: Duration) {
        let id = operator.id();
        self.trackers.lock().insert(
            id,
            OperatorTracker {
                operator,
                expires_at: Instant::now() + session_timeout,
            },
        );
        debug!(conn = self.id, operator = id, "operator logged in");
    }

    /// トラッカーを外す。ログインしていなければ false
    pub fn logout(&self, operator_id: u32) -> bool {
        let removed = self.trackers.lock().remove(&operator_id);
        matches!(removed, Some(t) if t.is_valid(Instant::now()))
    }

    /// コマンドの実行者を検証し、有効なら期限を延長して返す
    ///
    /// 期限切れ・削除済みのトラッカーはここで捨てる。
    pub fn authenticate(&self, operator_id: u32, session_timeout: Duration) -> Option<Arc<Operator>> {
        let now = Instant::now();
        let mut trackers = self.trackers.lock();
        let tracker = trackers.get_mut(&operator_id)?;
        if !tracker.is_valid(now) {
            trackers.remove(&operator_id);
            return None;
        }
        tracker.expires_at = now + session_timeout;
        Some(tracker.operator.clone())
    }

    /// 有効なトラッカーと失効までの残り時間
    pub fn active_operators(&self) -> Vec<(Arc<Operator>, Duration)> {
        let now = Instant::now();
        self.trackers
            .lock()
            .values()
            .filter(|t| t.is_valid(now))
            .map(|t| (t.operator.clone(), t.expires_at - now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authdb_proto::messages::NewOperator;
    use authdb_store::OperatorStore;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new(1, "127.0.0.1:5000".parse().unwrap())
    }

    fn operator(store: &OperatorStore, name: &str) -> Arc<Operator> {
        let new = NewOperator {
            username: name.into(),
            password: "pw".into(),
            ..Default::default()
        };
        store.add(&new, 16, 0).unwrap()
    }

    #[test]
    fn test_tracker_lifecycle() {
        let store = OperatorStore::in_memory();
        let alice = operator(&store, "alice");
        let conn = handle();

        assert!(conn.authenticate(alice.id(), Duration::from_secs(60)).is_none());
        conn.login(alice.clone(), Duration::from_secs(60));
        assert_eq!(conn.authenticate(alice.id(), Duration::from_secs(60)).unwrap().id(), alice.id());
        assert_eq!(conn.active_operators().len(), 1);

        assert!(conn.logout(alice.id()));
        assert!(!conn.logout(alice.id()));
        assert!(conn.active_operators().is_empty());
    }

    #[test]
    fn test_expired_tracker_is_rejected() {
        let store = OperatorStore::in_memory();
        let alice = operator(&store, "alice");
        let conn = handle();

        conn.login(alice.clone(), Duration::ZERO);
        assert!(conn.authenticate(alice.id(), Duration::from_secs(60)).is_none());
        assert!(conn.active_operators().is_empty());
    }

    #[test]
    fn test_removed_operator_invalidates_tracker() {
        let store = OperatorStore::in_memory();
        let alice = operator(&store, "alice");
        let conn = handle();
        conn.login(alice.clone(), Duration::from_secs(60));

        store.remove(alice.id());
        assert!(conn.authenticate(alice.id(), Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_push_queue_is_fifo() {
        let conn = handle();
        conn.enqueue(PushTask::PingInterval(1000));
        conn.enqueue(PushTask::removal(3));
        assert_eq!(conn.pending_pushes(), 2);
        assert_eq!(conn.pop_push(), Some(PushTask::PingInterval(1000)));
        assert_eq!(conn.pop_push(), Some(PushTask::removal(3)));
        assert_eq!(conn.pop_push(), None);
    }

    #[tokio::test]
    async fn test_close_signal_wakes_subscribers() {
        let conn = handle();
        let mut signal = conn.close_signal();
        assert!(!conn.is_closing());
        conn.close();
        signal.wait_for(|closed| *closed).await.unwrap();
        assert!(conn.is_closing());
    }
}
