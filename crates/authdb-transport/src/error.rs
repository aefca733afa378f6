//! authdb-transport エラー型
//!
//! ここに定義されるエラーはすべてトランスポートエラーであり、
//! 発生したチャンネルは閉じられる（以後の操作は `Closed` で失敗する）。

use std::time::Duration;

use authdb_crypto::CryptoError;
use authdb_proto::ProtoError;
use thiserror::Error;

/// Secure Channel のエラー
#[derive(Debug, Error)]
pub enum ChannelError {
    /// ソケットの I/O エラー
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// 読み書きがタイムアウトした
    #[error("Channel operation timed out after {0:?}")]
    Timeout(Duration),
    /// 相手がストリームを閉じた
    #[error("Connection closed by peer")]
    ConnectionClosed,
    /// すでに閉じたチャンネルを使おうとした
    #[error("Channel is closed")]
    Closed,
    /// 整合性ハッシュの不一致が再試行回数を超えた
    #[error("Integrity check failed after {attempts} attempts")]
    IntegrityFailure { attempts: u32 },
    /// 確認応答が成功・失敗のどちらの配列でもない
    #[error("Unexpected acknowledgment bytes: {0:?}")]
    UnexpectedAck(Vec<u8>),
    /// 長さフィールドが許容範囲外
    #[error("Block length {length} out of range (max {max})")]
    LengthOutOfRange { length: i64, max: usize },
    /// セッション鍵の設定前に暗号化ユニットを扱おうとした
    #[error("Channel has no session key")]
    NotEncrypted,
    /// 文字列ブロックが UTF-8 でない
    #[error("Block is not valid UTF-8")]
    InvalidUtf8,
    /// メッセージ・オペコードのデコード失敗
    #[error("Decode failed: {0}")]
    Decode(#[from] ProtoError),
    /// セッション鍵の設定に失敗
    #[error("Cipher error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ChannelError {
    /// 相手側の切断・タイムアウトなど、ログを警告レベルに留めてよいエラーか
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ChannelError::ConnectionClosed | ChannelError::Closed | ChannelError::Timeout(_)
        ) || matches!(self, ChannelError::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
        ))
    }
}
