//! authdb-client エラー型

use authdb_crypto::CryptoError;
use authdb_proto::{ProtoError, Status};
use authdb_store::StoreError;
use authdb_transport::ChannelError;
use thiserror::Error;

/// 1 回の接続を終わらせるエラー
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Version error: {0}")]
    Version(#[from] ProtoError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// 接続とハンドシェイクが `connect_timeout` 内に終わらなかった
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// ピン留めした公開鍵とデータベースの公開鍵が一致しない
    #[error("Public key for key id {0} does not match the pinned key")]
    KeyMismatch(i32),
    /// ピン留めした鍵 ID をデータベースが知らない（接続を閉じられた）
    #[error("Database rejected key id {0}")]
    KeyRejected(i32),
    /// 登録済みのはずのサーバー ID をデータベースが知らない
    #[error("Database does not know server {0}")]
    UnknownServer(u32),
    /// 登録・再接続が拒否された
    #[error("Registration rejected with {0:?}")]
    Rejected(Status),
    /// 初回起動のデータベースだが初回管理者の情報がない
    #[error("Database is a blank install and no bootstrap credentials are configured")]
    NoBootstrapCredentials,
    #[error("Bootstrap rejected with {0:?}")]
    BootstrapRejected(Status),
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(e: tokio::task::JoinError) -> Self {
        ClientError::Task(e.to_string())
    }
}
