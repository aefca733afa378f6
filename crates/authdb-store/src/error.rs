//! authdb-store エラー型

use authdb_crypto::CryptoError;
use authdb_proto::ProtoError;
use thiserror::Error;

/// ストア操作のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// ストアファイルの読み書き
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// ストアファイルの内容が壊れている
    #[error("Corrupt store file: {0}")]
    Decode(#[from] ProtoError),
    /// 設定ファイルの JSON が不正
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// 設定値が範囲外
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// ユーザー名が空・長すぎる
    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),
    /// 大文字小文字を区別せず同名のオペレーターがいる
    #[error("Username already in use: {0}")]
    UsernameTaken(String),
    /// サーバー名が空・長すぎる
    #[error("Invalid server name: {0:?}")]
    InvalidServerName(String),
    #[error("Server name already in use: {0}")]
    ServerNameTaken(String),
    /// 鍵リングに該当 ID の鍵がない
    #[error("Unknown key id {0}")]
    UnknownKey(i32),
    /// 鍵リングが空
    #[error("Key ring is empty")]
    EmptyKeyRing,
}
