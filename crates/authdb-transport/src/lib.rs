//! # authdb-transport
//!
//! Secure Channel: バイトストリーム上の暗号化・整合性検証付き転送。
//!
//! ハンドシェイク前半（バージョン・鍵交換）は平文モードで動き、セッション鍵の
//! 合意後に `rekey()` で暗号化モードへ切り替える。暗号化モードでは各ユニットの
//! 後ろに暗号状態のハッシュを付け、受信側が平文の確認応答を返す。
//! 不一致なら両端が `mark()` 地点まで巻き戻して再送する（最大 3 回）。
//!
//! ## 暗号化ユニットの全体構造
//!
//! ```text
//! sender                                   receiver
//!   mark()
//!   [enc(payload)][enc(hash)]  ──────────▶ mark(); decrypt; compare
//!                              ◀────────── [ack]  (不一致なら reset())
//!   (reject なら reset() して再送)
//! ```

pub mod block;
pub mod channel;
pub mod error;
pub mod file;

pub use block::{BLOCK_SIZE, FILE_ERROR, MAX_ATTEMPTS};
pub use channel::SecureChannel;
pub use error::ChannelError;
pub use file::FileOutcome;
