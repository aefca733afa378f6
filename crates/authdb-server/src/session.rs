//! コネクションタスクと定常状態ループ
//!
//! ```text
//! listen1: PING を待つ（2 × ping 間隔でタイムアウト）
//! listen2: プッシュ通知を 1 件、なければ NO_FURTHER_INSTRUCTIONS を送る
//! listen3: NO_FURTHER_INSTRUCTIONS までコマンドを読んで実行する → listen1
//! ```
//!
//! コネクションの future は切断シグナルと `select!` され、強制切断では
//! future ごと破棄される（ソケットと待機中のタイマーも一緒に落ちる）。

use std::net::SocketAddr;
use std::sync::Arc;

use authdb_proto::{Command, Push};
use authdb_transport::SecureChannel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::commands;
use crate::connection::ConnectionHandle;
use crate::database::Database;
use crate::error::SessionError;
use crate::handshake::{self, HandshakeOutcome};
use crate::signalled;

/// 受け付けたソケット 1 本を最後まで処理する
pub(crate) async fn serve_connection(db: Arc<Database>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }
    let conn = db.register_connection(peer);
    debug!(conn = conn.id(), %peer, "connection accepted");

    let mut channel = SecureChannel::new(stream, db.config().get().timeout());
    let result = run_connection(&db, &conn, &mut channel).await;
    channel.shutdown().await;

    conn.release_server();
    db.unregister_connection(conn.id());
    match result {
        Ok(()) => debug!(conn = conn.id(), %peer, "connection finished"),
        Err(e) if e.is_disconnect() => info!(conn = conn.id(), %peer, reason = %e, "connection closed"),
        Err(e) => warn!(conn = conn.id(), %peer, error = %e, "connection terminated"),
    }
}

/// ハンドシェイクと定常状態を切断シグナルと競わせて実行する
pub async fn run_connection<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut close = conn.close_signal();
    tokio::select! {
        result = drive(db, conn, channel) => result,
        _ = signalled(&mut close) => Err(SessionError::ForcedDisconnect),
    }
}

async fn drive<S>(db: &Arc<Database>, conn: &ConnectionHandle, channel: &mut SecureChannel<S>) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match handshake::accept(db, conn, channel).await? {
        HandshakeOutcome::Bootstrapped { .. } => Ok(()),
        HandshakeOutcome::Established { key_id, server_id } => {
            debug!(conn = conn.id(), key = key_id, server = ?server_id, "handshake complete");
            steady_state(db, conn, channel).await
        }
    }
}

async fn steady_state<S>(db: &Arc<Database>, conn: &ConnectionHandle, channel: &mut SecureChannel<S>) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        // listen1
        let wait = db.config().get().ping_interval() * 2;
        let command: Command = channel.read_opcode_within(wait).await?;
        if command != Command::Ping {
            return Err(SessionError::Protocol(format!("expected PING, got {command:?}")));
        }

        // listen2
        match conn.pop_push() {
            Some(task) => {
                debug!(conn = conn.id(), push = ?task.opcode(), "sending push update");
                task.send(channel).await?;
            }
            None => channel.write_opcode(Push::NoFurtherInstructions).await?,
        }

        // listen3
        loop {
            let command: Command = channel.read_opcode().await?;
            match command {
                Command::NoFurtherInstructions => break,
                Command::Ping => return Err(SessionError::Protocol("PING inside a command sequence".into())),
                other => commands::dispatch(db, conn, channel, other).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushTask;
    use crate::testing::test_database;
    use authdb_proto::messages::OperatorUpdate;
    use std::time::Duration;

    /// ハンドシェイクを省いて定常状態だけを動かす
    fn spawn_steady(
        db: Arc<Database>,
        conn: Arc<ConnectionHandle>,
        stream: tokio::io::DuplexStream,
    ) -> tokio::task::JoinHandle<Result<(), SessionError>> {
        tokio::spawn(async move {
            let mut channel = SecureChannel::new(stream, Duration::from_secs(5));
            let mut close = conn.close_signal();
            tokio::select! {
                result = steady_state(&db, &conn, &mut channel) => result,
                _ = signalled(&mut close) => Err(SessionError::ForcedDisconnect),
            }
        })
    }

    #[tokio::test]
    async fn test_one_push_per_ping_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_database(dir.path());
        let conn = db.register_connection("127.0.0.1:9".parse().unwrap());
        conn.enqueue(PushTask::PingInterval(1000));
        conn.enqueue(PushTask::removal(2));

        let (a, b) = tokio::io::duplex(4096);
        let task = spawn_steady(db.clone(), conn.clone(), b);
        let mut client = SecureChannel::new(a, Duration::from_secs(5));

        client.write_opcode(Command::Ping).await.unwrap();
        assert_eq!(client.read_opcode::<Push>().await.unwrap(), Push::UpdatePingInterval);
        assert_eq!(client.read_int().await.unwrap(), 1000);
        client.write_opcode(Command::NoFurtherInstructions).await.unwrap();

        client.write_opcode(Command::Ping).await.unwrap();
        assert_eq!(client.read_opcode::<Push>().await.unwrap(), Push::UpdateOperators);
        let update: OperatorUpdate = client.read_message(1024).await.unwrap();
        assert_eq!(update.removed, vec![2]);
        client.write_opcode(Command::NoFurtherInstructions).await.unwrap();

        client.write_opcode(Command::Ping).await.unwrap();
        assert_eq!(client.read_opcode::<Push>().await.unwrap(), Push::NoFurtherInstructions);
        client.write_opcode(Command::NoFurtherInstructions).await.unwrap();

        conn.close();
        assert!(matches!(task.await.unwrap(), Err(SessionError::ForcedDisconnect)));
    }

    #[tokio::test]
    async fn test_command_before_ping_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_database(dir.path());
        let conn = db.register_connection("127.0.0.1:9".parse().unwrap());
        let (a, b) = tokio::io::duplex(4096);
        let task = spawn_steady(db, conn, b);

        let mut client = SecureChannel::new(a, Duration::from_secs(5));
        client.write_opcode(Command::Login).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(SessionError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unknown_command_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_database(dir.path());
        let conn = db.register_connection("127.0.0.1:9".parse().unwrap());
        let (a, b) = tokio::io::duplex(4096);
        let task = spawn_steady(db, conn, b);

        let mut client = SecureChannel::new(a, Duration::from_secs(5));
        client.write_opcode(Command::Ping).await.unwrap();
        client.read_opcode::<Push>().await.unwrap();
        client.write_byte(200).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(SessionError::Channel(_))));
    }

    #[tokio::test]
    async fn test_missing_ping_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_database(dir.path());
        db.config()
            .update(&authdb_store::ConfigUpdate {
                ping_interval_ms: Some(100),
                ..Default::default()
            })
            .unwrap();
        let conn = db.register_connection("127.0.0.1:9".parse().unwrap());
        let (_a, b) = tokio::io::duplex(4096);
        let task = spawn_steady(db, conn, b);
        match task.await.unwrap() {
            Err(SessionError::Channel(e)) => assert!(matches!(e, authdb_transport::ChannelError::Timeout(_))),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
