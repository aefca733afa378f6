//! 暗号エラー型

use thiserror::Error;

/// 暗号操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 鍵の長さが不正（16バイト以外）
    #[error("Invalid key length (expected {expected} bytes, got {actual})")]
    InvalidKeyLength { expected: usize, actual: usize },
    /// Base64 デコードに失敗
    #[error("Invalid Base64 encoding")]
    InvalidBase64,
    /// OS の乱数源が使えない
    #[error("Random number generator unavailable: {0}")]
    Random(String),
    /// RSA 鍵の生成・エンコード・デコードに失敗
    #[error("RSA key error: {0}")]
    KeyMaterial(String),
    /// RSA 暗号化に失敗
    #[error("RSA encryption failed: {0}")]
    EncryptionFailed(String),
    /// RSA 復号に失敗（OAEP パディング不正を含む）
    #[error("RSA decryption failed")]
    DecryptionFailed,
    /// 鍵が小さすぎて OAEP ブロックに 1 バイトも入らない
    #[error("RSA key of {0} bytes is too small for OAEP-SHA256")]
    KeyTooSmall(usize),
}
