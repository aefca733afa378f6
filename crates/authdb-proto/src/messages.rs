//! Protocol Buffers メッセージ
//!
//! 複合ペイロード（リスト・レコード）は prost メッセージとしてエンコードし、
//! Secure Channel のブロック 1 つに載せる。同じレコード型をストアの
//! ディスク上フォーマットにも使う。
//!
//! 時刻はすべて Unix エポックからのミリ秒。

use prost::Message;

use crate::error::ProtoError;

/// prost メッセージのエンコード・デコード補助
pub trait WireMessage: Message + Default + Sized {
    /// バイト列にエンコードする
    fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// バイト列からデコードする
    fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        Self::decode(bytes).map_err(ProtoError::DecodeFailed)
    }
}

impl<T: Message + Default> WireMessage for T {}

// ==============================================================
// ストアレコード
// ==============================================================

/// オペレーター 1 件（ストアファイル・UPDATE_OPERATORS 共通）
#[derive(Clone, PartialEq, Message)]
pub struct OperatorRecord {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(bytes = "vec", tag = "3")]
    pub salt: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub hash: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub iterations: u32,
    #[prost(uint32, tag = "6")]
    pub permissions: u32,
    #[prost(string, tag = "7")]
    pub display_name: String,
    #[prost(int32, tag = "8")]
    pub navigation_timeout: i32,
    #[prost(string, tag = "9")]
    pub description: String,
    #[prost(int64, tag = "10")]
    pub created: i64,
    #[prost(int64, tag = "11")]
    pub modified: i64,
    #[prost(int64, optional, tag = "12")]
    pub last_login: Option<i64>,
    #[prost(bool, tag = "13")]
    pub force_password_change: bool,
    #[prost(int64, optional, tag = "14")]
    pub lockout_until: Option<i64>,
    #[prost(int64, repeated, tag = "15")]
    pub failed_logins: Vec<i64>,
}

/// オペレーターストアファイル
#[derive(Clone, PartialEq, Message)]
pub struct OperatorTable {
    #[prost(message, repeated, tag = "1")]
    pub operators: Vec<OperatorRecord>,
}

/// 登録サーバー 1 件
#[derive(Clone, PartialEq, Message)]
pub struct ServerRecord {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(string, tag = "4")]
    pub ip: String,
    #[prost(bytes = "vec", tag = "5")]
    pub identifier: Vec<u8>,
    #[prost(int64, tag = "6")]
    pub created: i64,
}

/// サーバーレジストリファイル
#[derive(Clone, PartialEq, Message)]
pub struct ServerTable {
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<ServerRecord>,
}

/// 鍵リングの鍵 1 件（秘密鍵を含む。ローカル保存専用）
#[derive(Clone, PartialEq, Message)]
pub struct KeyRecord {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub private_der: Vec<u8>,
}

/// 鍵リングファイル
#[derive(Clone, PartialEq, Message)]
pub struct KeyRingRecord {
    #[prost(message, repeated, tag = "1")]
    pub keys: Vec<KeyRecord>,
}

/// クライアント側の永続状態
#[derive(Clone, PartialEq, Message)]
pub struct ClientState {
    /// 登録済みサーバー ID（未登録なら None）
    #[prost(uint32, optional, tag = "1")]
    pub server_id: Option<u32>,
    /// 再接続時に本人性を証明する識別子
    #[prost(bytes = "vec", tag = "2")]
    pub identifier: Vec<u8>,
    /// ピン留めした鍵 ID（未取得なら None）
    #[prost(int32, optional, tag = "3")]
    pub key_id: Option<i32>,
    /// ピン留めした公開鍵 DER
    #[prost(bytes = "vec", tag = "4")]
    pub public_key: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub ping_interval_ms: u32,
    #[prost(string, tag = "6")]
    pub name: String,
    #[prost(string, tag = "7")]
    pub description: String,
    /// オフライン認証用のオペレーターキャッシュ
    #[prost(message, repeated, tag = "8")]
    pub operators: Vec<OperatorRecord>,
}

// ==============================================================
// コマンドペイロード
// ==============================================================

/// 秘密情報を含まないオペレーター情報（LOGIN 応答・一覧）
#[derive(Clone, PartialEq, Message)]
pub struct OperatorInfo {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(string, tag = "3")]
    pub display_name: String,
    #[prost(uint32, tag = "4")]
    pub permissions: u32,
    #[prost(int32, tag = "5")]
    pub navigation_timeout: i32,
    #[prost(string, tag = "6")]
    pub description: String,
    #[prost(bool, tag = "7")]
    pub force_password_change: bool,
    #[prost(int64, optional, tag = "8")]
    pub last_login: Option<i64>,
    #[prost(int64, optional, tag = "9")]
    pub lockout_until: Option<i64>,
}

/// GET_OPERATOR_LIST 応答
#[derive(Clone, PartialEq, Message)]
pub struct OperatorList {
    #[prost(message, repeated, tag = "1")]
    pub operators: Vec<OperatorInfo>,
}

/// CREATE_OPERATOR 要求
#[derive(Clone, PartialEq, Message)]
pub struct NewOperator {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
    #[prost(string, tag = "3")]
    pub display_name: String,
    #[prost(uint32, tag = "4")]
    pub permissions: u32,
    #[prost(int32, tag = "5")]
    pub navigation_timeout: i32,
    #[prost(string, tag = "6")]
    pub description: String,
    #[prost(bool, tag = "7")]
    pub force_password_change: bool,
}

/// MODIFY_OPERATOR の個々の変更
#[derive(Clone, PartialEq, Message)]
pub struct OperatorEdit {
    #[prost(oneof = "operator_edit::Field", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub field: Option<operator_edit::Field>,
}

pub mod operator_edit {
    /// 変更対象のフィールドと新しい値
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Field {
        #[prost(string, tag = "1")]
        Username(String),
        #[prost(string, tag = "2")]
        Password(String),
        #[prost(string, tag = "3")]
        DisplayName(String),
        #[prost(string, tag = "4")]
        Description(String),
        #[prost(uint32, tag = "5")]
        Permissions(u32),
        #[prost(int32, tag = "6")]
        NavigationTimeout(i32),
        #[prost(bool, tag = "7")]
        ForcePasswordChange(bool),
        /// ロックアウトを解除する（値は無視）
        #[prost(bool, tag = "8")]
        Unlock(bool),
    }
}

/// MODIFY_OPERATOR 要求
#[derive(Clone, PartialEq, Message)]
pub struct OperatorEdits {
    #[prost(message, repeated, tag = "1")]
    pub edits: Vec<OperatorEdit>,
}

impl OperatorEdits {
    /// フィールド列から要求を組み立てる
    pub fn from_fields(fields: impl IntoIterator<Item = operator_edit::Field>) -> Self {
        OperatorEdits {
            edits: fields
                .into_iter()
                .map(|f| OperatorEdit { field: Some(f) })
                .collect(),
        }
    }
}

/// MODIFY_SERVER の個々の変更
#[derive(Clone, PartialEq, Message)]
pub struct ServerEdit {
    #[prost(oneof = "server_edit::Field", tags = "1, 2")]
    pub field: Option<server_edit::Field>,
}

pub mod server_edit {
    /// 変更対象のフィールドと新しい値
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Field {
        #[prost(string, tag = "1")]
        Name(String),
        #[prost(string, tag = "2")]
        Description(String),
    }
}

/// MODIFY_SERVER 要求
#[derive(Clone, PartialEq, Message)]
pub struct ServerEdits {
    #[prost(message, repeated, tag = "1")]
    pub edits: Vec<ServerEdit>,
}

impl ServerEdits {
    /// フィールド列から要求を組み立てる
    pub fn from_fields(fields: impl IntoIterator<Item = server_edit::Field>) -> Self {
        ServerEdits {
            edits: fields
                .into_iter()
                .map(|f| ServerEdit { field: Some(f) })
                .collect(),
        }
    }
}

/// GET_SERVER_LIST の 1 件（識別子は含めない）
#[derive(Clone, PartialEq, Message)]
pub struct ServerInfo {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(string, tag = "4")]
    pub ip: String,
    #[prost(int64, tag = "5")]
    pub created: i64,
    #[prost(bool, tag = "6")]
    pub connected: bool,
}

/// GET_SERVER_LIST 応答
#[derive(Clone, PartialEq, Message)]
pub struct ServerList {
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<ServerInfo>,
}

/// ログイン中のオペレーター 1 件
#[derive(Clone, PartialEq, Message)]
pub struct ActiveOperator {
    #[prost(uint32, tag = "1")]
    pub operator_id: u32,
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(string, tag = "3")]
    pub display_name: String,
    /// ログイン元サーバー（管理ツールからなら None）
    #[prost(uint32, optional, tag = "4")]
    pub server_id: Option<u32>,
    #[prost(string, tag = "5")]
    pub server_name: String,
    /// セッション失効までの残りミリ秒
    #[prost(int64, tag = "6")]
    pub expires_in_ms: i64,
}

/// GET_ACTIVE_OPERATORS 応答
#[derive(Clone, PartialEq, Message)]
pub struct ActiveOperatorList {
    #[prost(message, repeated, tag = "1")]
    pub operators: Vec<ActiveOperator>,
}

// ==============================================================
// プッシュ通知・ハンドシェイクペイロード
// ==============================================================

/// UPDATE_OPERATORS
#[derive(Clone, PartialEq, Message)]
pub struct OperatorUpdate {
    /// true ならクライアントはキャッシュ全体を置き換える
    #[prost(bool, tag = "1")]
    pub full_sync: bool,
    #[prost(message, repeated, tag = "2")]
    pub upserts: Vec<OperatorRecord>,
    #[prost(uint32, repeated, tag = "3")]
    pub removed: Vec<u32>,
}

/// UPDATE_SERVER_PARAMS / EXISTING_SERVER 応答
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ServerParams {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
}

/// UPDATE_PRESHARED_KEY
#[derive(Clone, PartialEq, Message)]
pub struct PresharedKey {
    #[prost(int32, tag = "1")]
    pub key_id: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
}

/// NEW_SERVER 要求
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ServerRegistration {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    /// 登録用共有シークレット
    #[prost(string, tag = "3")]
    pub secret: String,
}

/// 初回起動時の管理者作成要求
#[derive(Clone, PartialEq, Message)]
pub struct BootstrapAdmin {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
    #[prost(string, tag = "3")]
    pub display_name: String,
}
