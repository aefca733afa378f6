//! オペコード・ステータス・ハンドシェイクコード
//!
//! すべて 1 バイトで送信する。コマンド（クライアント → データベース）と
//! プッシュ通知（データベース → クライアント）は独立した番号空間を持ち、
//! ステータスは両方向で共通。
//!
//! ```text
//! Command  : NO_FURTHER_INSTRUCTIONS=0, PING=1, LOGIN=2 … RESTART_DATABASE=16
//! Push     : NO_FURTHER_INSTRUCTIONS=0, UPDATE_PRESHARED_KEY=1 … UPDATE_SERVER_PARAMS=4
//! Status   : SUCCESS=0 … UNKNOWN_COMMAND=8
//! ```

use crate::error::ProtoError;

/// `u8` との相互変換を持つ列挙型を定義する
macro_rules! byte_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $err:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            /// ワイヤ上のバイト値
            pub fn as_byte(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = ProtoError;

            fn try_from(value: u8) -> Result<Self, ProtoError> {
                match value {
                    $( $value => Ok($name::$variant), )+
                    other => Err(ProtoError::$err(other)),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }
    };
}

byte_enum! {
    /// クライアントが送るコマンド
    Command, UnknownCommand {
        /// このサイクルのコマンドはもうない（listen1 に戻る）
        NoFurtherInstructions = 0,
        /// キープアライブ（listen1 で待つ信号）
        Ping = 1,
        Login = 2,
        Logout = 3,
        CreateOperator = 4,
        ModifyOperator = 5,
        DeleteOperator = 6,
        GetOperatorList = 7,
        ModifyServer = 8,
        DisconnectServer = 9,
        DeleteServer = 10,
        GetServerList = 11,
        GetActiveOperators = 12,
        GetConfig = 13,
        Configure = 14,
        GeneratePresharedKey = 15,
        RestartDatabase = 16,
    }
}

byte_enum! {
    /// データベースが ping サイクル中に送るプッシュ通知
    Push, UnknownPush {
        NoFurtherInstructions = 0,
        /// 新しい優先鍵（鍵 ID + 公開鍵）
        UpdatePresharedKey = 1,
        /// ping 間隔の変更
        UpdatePingInterval = 2,
        /// オペレーターの追加・変更・削除
        UpdateOperators = 3,
        /// 自サーバーの名前・説明の変更
        UpdateServerParams = 4,
    }
}

byte_enum! {
    /// コマンドの結果
    Status, UnknownStatus {
        Success = 0,
        /// 一部の変更のみ適用された
        PartialSuccess = 1,
        Failure = 2,
        DoesNotExist = 3,
        LockedOut = 4,
        /// 認証は成功したがパスワード変更が必要
        ChangePassword = 5,
        NotLoggedIn = 6,
        InsufficientPermissions = 7,
        UnknownCommand = 8,
    }
}

byte_enum! {
    /// ハンドシェイク中に使うコード
    HandshakeCode, UnknownHandshakeCode {
        /// オペレーターが 1 人もいない（初回起動）
        BlankInstall = 1,
        /// 通常運用中
        Configured = 2,
        /// 新規サーバーとして登録する
        NewServer = 3,
        /// 登録済みサーバーとして再接続する
        ExistingServer = 4,
        /// サーバー登録なし（管理ツールなど）
        Unspecified = 5,
    }
}

impl Status {
    /// 適用結果の数から SUCCESS / PARTIAL_SUCCESS / FAILURE を決める
    ///
    /// すべて適用 → SUCCESS、一部 → PARTIAL_SUCCESS、ひとつも適用されない → FAILURE。
    /// 変更要求が 0 件の場合は SUCCESS。
    pub fn from_counts(applied: usize, requested: usize) -> Status {
        if applied == requested {
            Status::Success
        } else if applied == 0 {
            Status::Failure
        } else {
            Status::PartialSuccess
        }
    }

    /// ログイン済みとして扱えるステータスか
    pub fn is_logged_in(self) -> bool {
        matches!(self, Status::Success | Status::ChangePassword)
    }
}

/// オペレーターの権限ビット
///
/// 管理者ビットは他のすべてのビットを含意する。
pub mod permission {
    /// 管理者（すべての操作が可能）
    pub const ADMINISTRATOR: u32 = 1;
    /// オペレーターの作成・変更・削除
    pub const OPERATORS: u32 = 1 << 1;
    /// サーバーの変更・切断・削除
    pub const SERVERS: u32 = 1 << 2;
    /// 設定の参照・変更
    pub const CONFIGURE: u32 = 1 << 3;
    /// 定義済みの全ビット
    pub const ALL: u32 = ADMINISTRATOR | OPERATORS | SERVERS | CONFIGURE;

    /// 実効権限マスク（管理者なら ALL）
    pub fn effective(mask: u32) -> u32 {
        if mask & ADMINISTRATOR != 0 {
            ALL
        } else {
            mask & ALL
        }
    }

    /// `mask` が `required` のすべてのビットを持つか
    pub fn has(mask: u32, required: u32) -> bool {
        effective(mask) & required == required
    }

    /// 付与しようとする権限を操作者の実効権限内に制限する
    pub fn restrict(requested: u32, actor: u32) -> u32 {
        requested & effective(actor)
    }

    /// `target` の権限がすべて `actor` の実効権限に含まれるか
    pub fn within(target: u32, actor: u32) -> bool {
        effective(target) & !effective(actor) == 0
    }
}
