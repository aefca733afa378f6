//! authdb-proto エラー型

use thiserror::Error;

/// プロトコル定義レベルのエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Protobuf デコード失敗
    #[error("Proto decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),
    /// バージョン文字列が major.minor.patch 形式でない
    #[error("Malformed version string: {0:?}")]
    MalformedVersion(String),
    /// major.minor が一致しない
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },
    /// 未知のコマンドオペコード
    #[error("Unknown command opcode: {0}")]
    UnknownCommand(u8),
    /// 未知のプッシュ通知オペコード
    #[error("Unknown push opcode: {0}")]
    UnknownPush(u8),
    /// 未知のステータスバイト
    #[error("Unknown status byte: {0}")]
    UnknownStatus(u8),
    /// 未知のハンドシェイクコード
    #[error("Unknown handshake code: {0}")]
    UnknownHandshakeCode(u8),
}
