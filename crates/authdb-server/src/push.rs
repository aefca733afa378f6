//! プッシュ通知
//!
//! データベースからクライアントへの通知は、各コネクションのキューに積まれ、
//! listen2（PING を受けた直後）で 1 サイクルにつき 1 件送られる。
//! キューが空なら `NO_FURTHER_INSTRUCTIONS` を送る。

use authdb_proto::messages::{OperatorRecord, OperatorUpdate, PresharedKey, ServerParams};
use authdb_proto::Push;
use authdb_transport::{ChannelError, SecureChannel};
use tokio::io::{AsyncRead, AsyncWrite};

/// キューに積む通知 1 件
#[derive(Debug, Clone, PartialEq)]
pub enum PushTask {
    /// 新しい優先鍵へ移行させる
    PresharedKey(PresharedKey),
    /// ping 間隔（ミリ秒）
    PingInterval(i32),
    /// オペレーターキャッシュの更新
    Operators(OperatorUpdate),
    /// 自サーバーの名前・説明
    ServerParams(ServerParams),
}

impl PushTask {
    pub fn opcode(&self) -> Push {
        match self {
            PushTask::PresharedKey(_) => Push::UpdatePresharedKey,
            PushTask::PingInterval(_) => Push::UpdatePingInterval,
            PushTask::Operators(_) => Push::UpdateOperators,
            PushTask::ServerParams(_) => Push::UpdateServerParams,
        }
    }

    /// 1 件のオペレーターを追加・更新する差分
    pub fn upsert(record: OperatorRecord) -> Self {
        PushTask::Operators(OperatorUpdate {
            full_sync: false,
            upserts: vec![record],
            removed: Vec::new(),
        })
    }

    /// 1 件のオペレーターを削除する差分
    pub fn removal(id: u32) -> Self {
        PushTask::Operators(OperatorUpdate {
            full_sync: false,
            upserts: Vec::new(),
            removed: vec![id],
        })
    }

    /// キャッシュ全体の置き換え
    pub fn full_sync(records: Vec<OperatorRecord>) -> Self {
        PushTask::Operators(OperatorUpdate {
            full_sync: true,
            upserts: records,
            removed: Vec::new(),
        })
    }

    /// オペコードとペイロードを送る
    pub async fn send<S>(&self, channel: &mut SecureChannel<S>) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        channel.write_opcode(self.opcode()).await?;
        match self {
            PushTask::PresharedKey(key) => channel.write_message(key).await,
            PushTask::PingInterval(ms) => channel.write_int(*ms).await,
            PushTask::Operators(update) => channel.write_message(update).await,
            PushTask::ServerParams(params) => channel.write_message(params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_is_opcode_then_payload() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = SecureChannel::new(a, Duration::from_secs(5));
        let mut rx = SecureChannel::new(b, Duration::from_secs(5));

        PushTask::PingInterval(2500).send(&mut tx).await.unwrap();
        PushTask::removal(9).send(&mut tx).await.unwrap();

        assert_eq!(rx.read_opcode::<Push>().await.unwrap(), Push::UpdatePingInterval);
        assert_eq!(rx.read_int().await.unwrap(), 2500);
        assert_eq!(rx.read_opcode::<Push>().await.unwrap(), Push::UpdateOperators);
        let update: OperatorUpdate = rx.read_message(1024).await.unwrap();
        assert_eq!(update.removed, vec![9]);
        assert!(!update.full_sync);
    }
}
