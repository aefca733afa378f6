//! # authdb-server
//!
//! オペレーター認証情報データベースのサービス本体。
//!
//! ## 構成
//!
//! ```text
//! Database (Arc)
//!   ├─ ConfigStore / OperatorStore / ServerRegistry / KeyRing
//!   ├─ connections: ConnectionHandle × N   … トラッカー・プッシュキュー・切断シグナル
//!   └─ accept ループ ─ spawn ─▶ serve_connection
//!                                  handshake::accept → steady_state (listen1/2/3)
//!                                                        └─ commands::dispatch
//! ```
//!
//! ## データディレクトリ
//!
//! | ファイル        | 内容                 |
//! |-----------------|----------------------|
//! | `config.json`   | 設定                 |
//! | `operators.db`  | オペレーター         |
//! | `servers.db`    | 登録サーバー         |
//! | `keys.db`       | 鍵リング（秘密鍵）   |
//! | `backups/`      | 定期バックアップ     |

pub mod backup;
pub mod commands;
pub mod connection;
pub mod database;
pub mod error;
pub mod handshake;
pub mod push;
pub mod session;

pub use connection::ConnectionHandle;
pub use database::Database;
pub use error::{ServerError, SessionError};
pub use handshake::HandshakeOutcome;
pub use push::PushTask;

pub const CONFIG_FILE: &str = "config.json";
pub const OPERATORS_FILE: &str = "operators.db";
pub const SERVERS_FILE: &str = "servers.db";
pub const KEYS_FILE: &str = "keys.db";
pub const BACKUP_DIR: &str = "backups";

/// watch シグナルが true になるまで待つ
///
/// 送信側が落ちた場合も戻る。
pub(crate) async fn signalled(rx: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::Arc;

    use authdb_store::ConfigUpdate;

    use crate::Database;

    /// 小さい鍵・少ない反復回数のテスト用データベース
    pub(crate) fn test_database(dir: &Path) -> Arc<Database> {
        let db = Database::open(dir).unwrap();
        db.config()
            .update(&ConfigUpdate {
                hash_iterations: Some(16),
                key_bits: Some(1024),
                ephemeral_key_bits: Some(1024),
                ..Default::default()
            })
            .unwrap();
        db
    }
}
