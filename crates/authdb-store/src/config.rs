//! データベース設定
//!
//! データディレクトリの `config.json` に保存する。欠けているフィールドは
//! 既定値で補うので、空の `{}` も有効な設定ファイルになる。
//! 変更は CONFIGURE コマンド（[`ConfigUpdate`]）かファイルの直接編集で行う。

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::operator::LockoutPolicy;
use crate::persist::StoreFile;

/// データベース全体の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// 待ち受けポート
    #[serde(default = "default_port")]
    pub port: u16,
    /// accept キューの長さ
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// チャンネルの 1 回の読み書きのタイムアウト
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// クライアント側のハンドシェイク全体のタイムアウト
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// クライアントが ping を送る間隔
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u32,
    /// ログインセッション（トラッカー）の有効期間。コマンドごとに延長される
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// ロックアウトせずに許す失敗回数
    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,
    /// 失敗回数を数える期間
    #[serde(default = "default_login_time_period_ms")]
    pub login_time_period_ms: u64,
    /// ロックアウトの長さ
    #[serde(default = "default_login_lockout_time_ms")]
    pub login_lockout_time_ms: u64,
    /// 新しく設定するパスワードハッシュの反復回数
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,
    /// 鍵リングの RSA 鍵長
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    /// ハンドシェイクの一時鍵の RSA 鍵長
    #[serde(default = "default_ephemeral_key_bits")]
    pub ephemeral_key_bits: usize,
    /// 受信する可変長ブロックの上限
    #[serde(default = "default_max_block_length")]
    pub max_block_length: usize,
    /// NEW_SERVER 登録に必要な共有シークレット（空なら不要）
    #[serde(default)]
    pub registration_secret: String,
    /// バックアップ間隔（0 なら無効）
    #[serde(default)]
    pub backup_interval_minutes: u64,
    /// 残すバックアップの数
    #[serde(default = "default_backup_retain")]
    pub backup_retain: usize,
}

fn default_port() -> u16 { 1978 }
fn default_backlog() -> u32 { 128 }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_connect_timeout_ms() -> u64 { 60_000 }
fn default_ping_interval_ms() -> u32 { 15_000 }
fn default_session_timeout_ms() -> u64 { 900_000 }
fn default_login_attempts() -> u32 { 5 }
fn default_login_time_period_ms() -> u64 { 300_000 }
fn default_login_lockout_time_ms() -> u64 { 900_000 }
fn default_hash_iterations() -> u32 { 65_536 }
fn default_key_bits() -> usize { 4096 }
fn default_ephemeral_key_bits() -> usize { 2048 }
fn default_max_block_length() -> usize { 1 << 20 }
fn default_backup_retain() -> usize { 7 }

impl Default for Config {
    fn default() -> Self {
        Config {
            port: default_port(),
            backlog: default_backlog(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            login_attempts: default_login_attempts(),
            login_time_period_ms: default_login_time_period_ms(),
            login_lockout_time_ms: default_login_lockout_time_ms(),
            hash_iterations: default_hash_iterations(),
            key_bits: default_key_bits(),
            ephemeral_key_bits: default_ephemeral_key_bits(),
            max_block_length: default_max_block_length(),
            registration_secret: String::new(),
            backup_interval_minutes: 0,
            backup_retain: default_backup_retain(),
        }
    }
}

impl Config {
    /// 値の範囲を検証する
    pub fn validate(&self) -> Result<(), StoreError> {
        let invalid = |msg: &str| Err(StoreError::InvalidConfig(msg.to_string()));
        if self.port == 0 {
            return invalid("port must be non-zero");
        }
        if self.backlog == 0 {
            return invalid("backlog must be at least 1");
        }
        if self.timeout_ms == 0 || self.connect_timeout_ms == 0 || self.session_timeout_ms == 0 {
            return invalid("timeouts must be non-zero");
        }
        if self.ping_interval_ms < 100 || self.ping_interval_ms > i32::MAX as u32 {
            return invalid("ping_interval_ms must be between 100 and i32::MAX");
        }
        if self.login_attempts == 0 {
            return invalid("login_attempts must be at least 1");
        }
        if self.login_time_period_ms == 0 || self.login_lockout_time_ms == 0 {
            return invalid("login periods must be non-zero");
        }
        if self.hash_iterations == 0 {
            return invalid("hash_iterations must be at least 1");
        }
        if self.key_bits < 1024 || self.ephemeral_key_bits < 1024 {
            return invalid("RSA key sizes must be at least 1024 bits");
        }
        if self.max_block_length < 4096 || self.max_block_length > i32::MAX as usize {
            return invalid("max_block_length must be between 4096 and i32::MAX");
        }
        if self.backup_retain == 0 {
            return invalid("backup_retain must be at least 1");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms as u64)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// ログイン失敗のロックアウト規則
    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            attempts: self.login_attempts,
            period_ms: self.login_time_period_ms as i64,
            lockout_ms: self.login_lockout_time_ms as i64,
        }
    }
}

/// CONFIGURE コマンドの JSON。指定したフィールドだけを変更する
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub backlog: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u32>,
    pub session_timeout_ms: Option<u64>,
    pub login_attempts: Option<u32>,
    pub login_time_period_ms: Option<u64>,
    pub login_lockout_time_ms: Option<u64>,
    pub hash_iterations: Option<u32>,
    pub key_bits: Option<usize>,
    pub ephemeral_key_bits: Option<usize>,
    pub max_block_length: Option<usize>,
    pub registration_secret: Option<String>,
    pub backup_interval_minutes: Option<u64>,
    pub backup_retain: Option<usize>,
}

impl ConfigUpdate {
    /// 指定されたフィールドを `config` に上書きする
    pub fn apply_to(&self, config: &mut Config) {
        macro_rules! patch {
            ($($field:ident),+ $(,)?) => {
                $( if let Some(v) = &self.$field { config.$field = v.clone(); } )+
            };
        }
        patch!(
            port,
            backlog,
            timeout_ms,
            connect_timeout_ms,
            ping_interval_ms,
            session_timeout_ms,
            login_attempts,
            login_time_period_ms,
            login_lockout_time_ms,
            hash_iterations,
            key_bits,
            ephemeral_key_bits,
            max_block_length,
            registration_secret,
            backup_interval_minutes,
            backup_retain,
        );
    }
}

/// 設定変更の前後
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub previous: Config,
    pub current: Config,
}

impl ConfigChange {
    pub fn ping_interval_changed(&self) -> bool {
        self.previous.ping_interval_ms != self.current.ping_interval_ms
    }

    /// 再起動しないと反映されない変更があるか
    pub fn requires_restart(&self) -> bool {
        self.previous.port != self.current.port || self.previous.backlog != self.current.backlog
    }
}

/// 設定の保持と永続化
#[derive(Debug)]
pub struct ConfigStore {
    file: StoreFile,
    config: RwLock<Config>,
}

impl ConfigStore {
    /// 設定ファイルを読み込む。なければ既定値で作成する
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = StoreFile::new(path);
        let config = Self::read_file(&file)?;
        let store = ConfigStore {
            file,
            config: RwLock::new(config),
        };
        if store.file.read()?.is_none() {
            store.save()?;
        }
        Ok(store)
    }

    /// 現在の設定のコピー
    pub fn get(&self) -> Config {
        self.config.read().clone()
    }

    /// 変更を検証・適用して保存する
    ///
    /// 検証に失敗した場合は何も変更しない。
    pub fn update(&self, update: &ConfigUpdate) -> Result<ConfigChange, StoreError> {
        let mut guard = self.config.write();
        let previous = guard.clone();
        let mut current = previous.clone();
        update.apply_to(&mut current);
        current.validate()?;

        self.file.write(&serde_json::to_vec_pretty(&current)?)?;
        *guard = current.clone();
        info!(ping_interval_ms = current.ping_interval_ms, "configuration updated");
        Ok(ConfigChange { previous, current })
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&*self.config.read())?;
        self.file.write(&bytes)
    }

    /// ファイルから読み直す（直接編集を反映する）
    pub fn reload(&self) -> Result<Config, StoreError> {
        let config = Self::read_file(&self.file)?;
        *self.config.write() = config.clone();
        Ok(config)
    }

    pub fn file(&self) -> &StoreFile {
        &self.file
    }

    fn read_file(file: &StoreFile) -> Result<Config, StoreError> {
        let config = match file.read()? {
            Some(bytes) => serde_json::from_slice::<Config>(&bytes)?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }
}
