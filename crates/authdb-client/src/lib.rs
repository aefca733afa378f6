//! # authdb-client
//!
//! データベースに接続するリモートサーバー・管理ツール側のクライアント。
//! サーバーと同じハンドシェイクと ping サイクルを開始側から進める。
//!
//! ## 構成
//!
//! ```text
//! DatabaseClient ── mpsc ──▶ driver task
//!   │                          connect → handshake::connect → steady_state
//!   │                                     ├─ push → PersistentState / OperatorCache
//!   │                                     └─ Request::execute
//!   ├─ PersistentState   … サーバー ID・識別子・ピン留めした鍵（状態ファイル）
//!   └─ OperatorCache     … オフライン認証とロックアウト
//! ```
//!
//! ## 再接続
//!
//! 異常切断の後は `reconnect_delay_error`、意図した切断の後は
//! `reconnect_delay_clean` だけ待ってから繋ぎ直す。待っている間のコマンドは
//! すぐに `None` を返す。

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod request;
pub mod state;

pub use cache::OperatorCache;
pub use client::DatabaseClient;
pub use config::{ClientConfig, Registration};
pub use error::ClientError;
pub use handshake::{HandshakeParams, HandshakeResult, RegistrationRequest, Session};
pub use request::Reply;
pub use state::PersistentState;

/// watch シグナルが true になるまで待つ
pub(crate) async fn signalled(rx: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}
