//! # authdb-store
//!
//! データベースの共有状態。すべてスレッド安全で、ストアごとに 1 ファイルへ原子的に保存する。
//!
//! | ストア             | ファイル        | 形式              |
//! |--------------------|-----------------|-------------------|
//! | [`OperatorStore`]  | `operators.db`  | prost `OperatorTable` |
//! | [`ServerRegistry`] | `servers.db`    | prost `ServerTable`   |
//! | [`KeyRing`]        | `keys.db`       | prost `KeyRingRecord` |
//! | [`ConfigStore`]    | `config.json`   | JSON (serde)      |
//!
//! ## ロック規則
//!
//! 各ストアは `parking_lot::RwLock` で守られる。`for_each` のコールバックは
//! 読み取りロックを保持したまま呼ばれるので、コールバックの中から同じストアを
//! 変更してはならない（読み取りロックから書き込みロックへの昇格はデッドロックする）。

mod arena;
pub mod config;
pub mod error;
pub mod keyring;
pub mod operator;
pub mod persist;
pub mod server;

pub use config::{Config, ConfigChange, ConfigStore, ConfigUpdate};
pub use error::StoreError;
pub use keyring::{Key, KeyRing, LATEST_KEY};
pub use operator::{CredentialCheck, LockoutPolicy, Operator, OperatorStore};
pub use persist::StoreFile;
pub use server::{Server, ServerRegistry};

/// ユーザー名・サーバー名の最大文字数
pub const MAX_NAME_LENGTH: usize = 64;

/// サーバー識別子の長さ（バイト）
pub const IDENTIFIER_LEN: usize = 32;

/// 現在時刻（Unix エポックからのミリ秒）
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
