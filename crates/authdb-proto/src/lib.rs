//! # authdb-proto
//!
//! authdb プロトコルの定義：バージョン、オペコード、ステータス、権限ビット、
//! 複合ペイロードとストアレコードの Protobuf メッセージ。
//!
//! ## 1 コネクションの流れ
//!
//! ```text
//! ハンドシェイク（平文 → 暗号化）
//!   version ⇄ version
//!   key_id → (key_id, public_key)
//!   enc(ephemeral_pub) → enc(session_key)     … ここから暗号化
//!   ← BLANK_INSTALL | CONFIGURED
//!   → NEW_SERVER | EXISTING_SERVER | UNSPECIFIED
//!   ← ping_interval
//!
//! 定常状態（ping サイクル）
//!   → PING
//!   ← push* , NO_FURTHER_INSTRUCTIONS
//!   → (command → status, payload)* , NO_FURTHER_INSTRUCTIONS
//! ```
//!
//! ## プロトコルバージョン
//!
//! `major.minor.patch` 形式。互換性判定は major.minor のみで行う。

pub mod error;
pub mod messages;
pub mod opcodes;

pub use error::ProtoError;
pub use messages::WireMessage;
pub use opcodes::{permission, Command, HandshakeCode, Push, Status};

/// authdb プロトコルバージョン
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// バージョン文字列の最大長（ハンドシェイクで受け取る上限）
pub const MAX_VERSION_LENGTH: usize = 64;

/// ユーザー名・パスワードなど単一文字列フィールドの最大長（バイト）
pub const MAX_FIELD_LENGTH: usize = 4096;

/// ハンドシェイクの鍵ブロック（公開鍵 DER・RSA 暗号文）の最大長
pub const MAX_KEY_BLOCK_LENGTH: usize = 64 * 1024;

/// バージョン文字列から (major, minor) を取り出す
///
/// # エラー
/// - `ProtoError::MalformedVersion`: 数値の major.minor を含まない
pub fn parse_major_minor(version: &str) -> Result<(u32, u32), ProtoError> {
    let malformed = || ProtoError::MalformedVersion(version.to_string());
    let mut parts = version.trim().split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
    let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
    Ok((major, minor))
}

/// 相手のバージョンが互換か（major.minor が一致するか）を確認する
///
/// # エラー
/// - `ProtoError::MalformedVersion`: どちらかの形式が不正
/// - `ProtoError::VersionMismatch`: major.minor が一致しない
pub fn check_compatible(local: &str, remote: &str) -> Result<(), ProtoError> {
    if parse_major_minor(local)? == parse_major_minor(remote)? {
        Ok(())
    } else {
        Err(ProtoError::VersionMismatch {
            local: local.to_string(),
            remote: remote.to_string(),
        })
    }
}
