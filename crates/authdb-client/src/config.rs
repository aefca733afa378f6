//! クライアント設定

use std::path::PathBuf;
use std::time::Duration;

use authdb_proto::messages::BootstrapAdmin;
use authdb_store::LockoutPolicy;

/// ハンドシェイクでの名乗り方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// サーバー登録なし（管理ツールなど）。オペレーターキャッシュは受け取らない
    Unspecified,
    /// リモートサーバーとして登録する。登録済みなら保存した識別子で再接続する
    Server {
        name: String,
        description: String,
        /// データベースの `registration_secret`
        secret: String,
    },
}

/// `DatabaseClient` の設定
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// 1 回の送受信のタイムアウト
    pub timeout: Duration,
    /// TCP 接続からハンドシェイク完了までの上限
    pub connect_timeout: Duration,
    /// ハンドシェイクごとに生成する一時 RSA 鍵のビット長
    pub ephemeral_key_bits: usize,
    /// 永続状態ファイル（None なら保存しない）
    pub state_path: Option<PathBuf>,
    pub registration: Registration,
    /// 初回起動のデータベースに作る管理者
    pub bootstrap: Option<BootstrapAdmin>,
    /// 異常切断後の再接続待ち
    pub reconnect_delay_error: Duration,
    /// 意図した切断・初回管理者作成後の再接続待ち
    pub reconnect_delay_clean: Duration,
    /// オフライン認証のロックアウト規則
    pub lockout: LockoutPolicy,
    /// 受け取るメッセージの最大長
    pub max_block_length: usize,
    /// 送信待ちコマンドの上限
    pub request_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 1978,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
            ephemeral_key_bits: 2048,
            state_path: None,
            registration: Registration::Unspecified,
            bootstrap: None,
            reconnect_delay_error: Duration::from_secs(5),
            reconnect_delay_clean: Duration::from_secs(60),
            lockout: LockoutPolicy {
                attempts: 5,
                period_ms: 300_000,
                lockout_ms: 900_000,
            },
            max_block_length: 1 << 20,
            request_queue: 64,
        }
    }
}
