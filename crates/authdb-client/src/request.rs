//! 定常状態で送るコマンド要求
//!
//! API 呼び出しは [`Request`] をキューに積み、ping サイクルの listen3 で
//! 1 件ずつ送って応答を oneshot で返す。接続が落ちた要求は応答を送らずに
//! 破棄され、呼び出し側には `None` として見える。

use authdb_proto::messages::{
    ActiveOperatorList, NewOperator, OperatorEdits, OperatorInfo, OperatorList, ServerEdits, ServerList,
};
use authdb_proto::{Command, Status};
use authdb_transport::{ChannelError, SecureChannel};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// コマンドごとの送信内容
#[derive(Debug, Clone)]
pub(crate) enum Body {
    Login { username: String, password: String },
    Actor(u32),
    ActorTarget { actor: u32, target: u32 },
    CreateOperator { actor: u32, new: NewOperator },
    ModifyOperator { actor: u32, target: u32, edits: OperatorEdits },
    ModifyServer { actor: u32, server: u32, edits: ServerEdits },
    Configure { actor: u32, json: String },
}

/// 成功時に続くペイロード
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    None,
    Operator(OperatorInfo),
    OperatorId(u32),
    Operators(OperatorList),
    Servers(ServerList),
    ActiveOperators(ActiveOperatorList),
    Config(String),
    KeyId(i32),
}

/// コマンドの応答
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Response {
    pub status: Status,
    pub payload: Payload,
}

/// API 呼び出しの結果
///
/// `value` はステータスが成功（LOGIN ではログイン扱い）のときだけ入る。
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub status: Status,
    pub value: Option<T>,
}

impl<T> Reply<T> {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

pub(crate) struct Request {
    pub command: Command,
    pub body: Body,
    pub reply: oneshot::Sender<Response>,
}

impl Request {
    pub fn new(command: Command, body: Body) -> (Self, oneshot::Receiver<Response>) {
        let (reply, rx) = oneshot::channel();
        (Request { command, body, reply }, rx)
    }

    /// 要求を送り、応答を読んで呼び出し側へ返す
    pub async fn execute<S>(self, channel: &mut SecureChannel<S>, max: usize) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        channel.write_opcode(self.command).await?;
        write_body(channel, &self.body).await?;

        let status: Status = channel.read_opcode().await?;
        let has_payload = match self.command {
            Command::Login => status.is_logged_in(),
            _ => status == Status::Success,
        };
        let payload = if has_payload {
            read_payload(channel, self.command, max).await?
        } else {
            Payload::None
        };
        // 呼び出し側が待つのをやめていれば捨てる
        let _ = self.reply.send(Response { status, payload });
        Ok(())
    }
}

async fn write_body<S>(channel: &mut SecureChannel<S>, body: &Body) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match body {
        Body::Login { username, password } => {
            channel.write_string(username).await?;
            channel.write_string(password).await?;
        }
        Body::Actor(actor) => channel.write_u32(*actor).await?,
        Body::ActorTarget { actor, target } => {
            channel.write_u32(*actor).await?;
            channel.write_u32(*target).await?;
        }
        Body::CreateOperator { actor, new } => {
            channel.write_u32(*actor).await?;
            channel.write_message(new).await?;
        }
        Body::ModifyOperator { actor, target, edits } => {
            channel.write_u32(*actor).await?;
            channel.write_u32(*target).await?;
            channel.write_message(edits).await?;
        }
        Body::ModifyServer { actor, server, edits } => {
            channel.write_u32(*actor).await?;
            channel.write_u32(*server).await?;
            channel.write_message(edits).await?;
        }
        Body::Configure { actor, json } => {
            channel.write_u32(*actor).await?;
            channel.write_string(json).await?;
        }
    }
    Ok(())
}

async fn read_payload<S>(channel: &mut SecureChannel<S>, command: Command, max: usize) -> Result<Payload, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Ok(match command {
        Command::Login => Payload::Operator(channel.read_message(max).await?),
        Command::CreateOperator => Payload::OperatorId(channel.read_u32().await?),
        Command::GetOperatorList => Payload::Operators(channel.read_message(max).await?),
        Command::GetServerList => Payload::Servers(channel.read_message(max).await?),
        Command::GetActiveOperators => Payload::ActiveOperators(channel.read_message(max).await?),
        Command::GetConfig => Payload::Config(channel.read_string(max).await?),
        Command::GeneratePresharedKey => Payload::KeyId(channel.read_int().await?),
        _ => Payload::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_login_reads_operator_only_when_logged_in() {
        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut channel = SecureChannel::new(b, Duration::from_secs(5));
            for status in [Status::ChangePassword, Status::LockedOut] {
                assert_eq!(channel.read_opcode::<Command>().await.unwrap(), Command::Login);
                assert_eq!(channel.read_string(64).await.unwrap(), "alice");
                assert_eq!(channel.read_string(64).await.unwrap(), "pw");
                channel.write_opcode(status).await.unwrap();
                if status.is_logged_in() {
                    let info = OperatorInfo {
                        id: 1,
                        username: "alice".into(),
                        force_password_change: true,
                        ..Default::default()
                    };
                    channel.write_message(&info).await.unwrap();
                }
            }
        });

        let mut channel = SecureChannel::new(a, Duration::from_secs(5));
        let login = || Body::Login {
            username: "alice".into(),
            password: "pw".into(),
        };

        let (request, rx) = Request::new(Command::Login, login());
        request.execute(&mut channel, 4096).await.unwrap();
        let response = rx.await.unwrap();
        assert_eq!(response.status, Status::ChangePassword);
        assert!(matches!(response.payload, Payload::Operator(ref info) if info.force_password_change));

        let (request, rx) = Request::new(Command::Login, login());
        request.execute(&mut channel, 4096).await.unwrap();
        assert_eq!(
            rx.await.unwrap(),
            Response {
                status: Status::LockedOut,
                payload: Payload::None
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_command_has_no_payload() {
        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut channel = SecureChannel::new(b, Duration::from_secs(5));
            assert_eq!(channel.read_opcode::<Command>().await.unwrap(), Command::GetServerList);
            assert_eq!(channel.read_u32().await.unwrap(), 7);
            channel.write_opcode(Status::NotLoggedIn).await.unwrap();
        });

        let mut channel = SecureChannel::new(a, Duration::from_secs(5));
        let (request, rx) = Request::new(Command::GetServerList, Body::Actor(7));
        request.execute(&mut channel, 4096).await.unwrap();
        assert_eq!(rx.await.unwrap().status, Status::NotLoggedIn);
        server.await.unwrap();
    }
}
