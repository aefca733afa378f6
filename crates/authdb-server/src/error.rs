//! authdb-server エラー型

use authdb_crypto::CryptoError;
use authdb_proto::ProtoError;
use authdb_store::StoreError;
use authdb_transport::ChannelError;
use thiserror::Error;

/// 1 コネクションを終わらせるエラー
///
/// アプリケーションレベルの失敗（権限不足など）はステータスバイトで返すので
/// ここには含まれない。
#[derive(Debug, Error)]
pub enum SessionError {
    /// トランスポートエラー（I/O・タイムアウト・整合性検証の失敗）
    #[error("Transport error: {0}")]
    Channel(#[from] ChannelError),
    /// 相手がプロトコルに従わなかった
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// プロトコルバージョンの不一致
    #[error("Version error: {0}")]
    Version(#[from] ProtoError),
    /// 要求された鍵 ID が鍵リングにない
    #[error("Unknown key id {0}")]
    UnknownKey(i32),
    /// ハンドシェイクでの登録・再接続の拒否（失敗ステータス送信済み）
    #[error("Handshake rejected: {0}")]
    Rejected(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// 管理者の操作・再起動・シャットダウンによる切断
    #[error("Connection closed by the database")]
    ForcedDisconnect,
    /// ブロッキングタスクの失敗
    #[error("Background task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// 警告を出すまでもない終わり方か
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Channel(e) => e.is_disconnect(),
            SessionError::ForcedDisconnect => true,
            _ => false,
        }
    }
}

/// データベースサービスのエラー
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// すでにオペレーターがいるのに初回管理者を作ろうとした
    #[error("Database already has operators")]
    AlreadyConfigured,
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServerError::Task(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(e: tokio::task::JoinError) -> Self {
        SessionError::Task(e.to_string())
    }
}

impl From<ServerError> for SessionError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::Store(e) => SessionError::Store(e),
            other => SessionError::Task(other.to_string()),
        }
    }
}
