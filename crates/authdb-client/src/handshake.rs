//! クライアント側ハンドシェイク
//!
//! サーバー側と同じ状態機械を開始側から進める。
//!
//! ```text
//! Version → KeyRequest → EphemeralKey → SessionKey → InstallState
//!                                                     ├─ Bootstrap → Done(Bootstrapped)
//!                                                     └─ Registration → PingInterval → Done(Established)
//! ```
//!
//! 鍵はトラスト・オン・ファースト・ユースでピン留めする。ピン留めした鍵 ID を
//! 要求したのにデータベースが接続を閉じた場合は [`ClientError::KeyRejected`]、
//! 受け取った公開鍵がピン留めと違う場合は [`ClientError::KeyMismatch`] で失敗する。

use authdb_crypto::rsa::{decrypt_chunked, encrypt_chunked, generate_private_key, public_key_from_der, public_key_to_der};
use authdb_crypto::RsaPrivateKey;
use authdb_proto::messages::{BootstrapAdmin, ServerParams, ServerRegistration};
use authdb_proto::{
    check_compatible, HandshakeCode, Status, MAX_KEY_BLOCK_LENGTH, MAX_VERSION_LENGTH, PROTOCOL_VERSION,
};
use authdb_store::{IDENTIFIER_LEN, LATEST_KEY};
use authdb_transport::{ChannelError, SecureChannel};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::ClientError;

/// ハンドシェイクでの名乗り
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    Unspecified,
    New(ServerRegistration),
    Existing { server_id: u32, identifier: Vec<u8> },
}

/// ハンドシェイクの入力
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    /// 要求する鍵 ID（`LATEST_KEY` なら最新）
    pub requested_key: i32,
    /// ピン留めした公開鍵 DER
    pub pinned_key: Option<Vec<u8>>,
    pub ephemeral_key_bits: usize,
    pub bootstrap: Option<BootstrapAdmin>,
    pub registration: RegistrationRequest,
    pub max_block_length: usize,
}

/// 登録の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registered {
    New { server_id: u32, identifier: Vec<u8> },
    Existing { server_id: u32, params: ServerParams },
}

/// 確立したセッションの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub key_id: i32,
    /// データベースの公開鍵 DER（ピン留め用）
    pub public_key: Vec<u8>,
    pub ping_interval_ms: i32,
    pub registered: Option<Registered>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    /// 初回管理者を作成した。データベースは接続を閉じる
    Bootstrapped,
    Established(Session),
}

enum State {
    Version,
    KeyRequest,
    EphemeralKey { key_id: i32, public_key: Vec<u8> },
    SessionKey { key_id: i32, public_key: Vec<u8>, ephemeral: RsaPrivateKey },
    InstallState { key_id: i32, public_key: Vec<u8> },
    Registration { key_id: i32, public_key: Vec<u8> },
    PingInterval { key_id: i32, public_key: Vec<u8>, registered: Option<Registered> },
    Done(HandshakeResult),
}

/// データベースへのハンドシェイクを開始側として進める
pub async fn connect<S>(channel: &mut SecureChannel<S>, params: &HandshakeParams) -> Result<HandshakeResult, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut state = State::Version;
    loop {
        state = match state {
            State::Version => exchange_version(channel).await?,
            State::KeyRequest => request_key(channel, params).await?,
            State::EphemeralKey { key_id, public_key } => {
                send_ephemeral_key(channel, params, key_id, public_key).await?
            }
            State::SessionKey {
                key_id,
                public_key,
                ephemeral,
            } => {
                let wrapped = channel.read_block(MAX_KEY_BLOCK_LENGTH).await?;
                let session_key = decrypt_chunked(&ephemeral, &wrapped)?;
                channel.rekey(&session_key)?;
                State::InstallState { key_id, public_key }
            }
            State::InstallState { key_id, public_key } => match channel.read_opcode().await? {
                HandshakeCode::BlankInstall => bootstrap(channel, params).await?,
                HandshakeCode::Configured => State::Registration { key_id, public_key },
                other => return Err(ClientError::Protocol(format!("unexpected install state {other:?}"))),
            },
            State::Registration { key_id, public_key } => {
                let registered = register(channel, params).await?;
                State::PingInterval {
                    key_id,
                    public_key,
                    registered,
                }
            }
            State::PingInterval {
                key_id,
                public_key,
                registered,
            } => {
                let ping_interval_ms = channel.read_int().await?;
                State::Done(HandshakeResult::Established(Session {
                    key_id,
                    public_key,
                    ping_interval_ms,
                    registered,
                }))
            }
            State::Done(result) => return Ok(result),
        };
    }
}

async fn exchange_version<S>(channel: &mut SecureChannel<S>) -> Result<State, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    channel.write_string(PROTOCOL_VERSION).await?;
    let remote = channel.read_string(MAX_VERSION_LENGTH).await?;
    check_compatible(PROTOCOL_VERSION, &remote)?;
    Ok(State::KeyRequest)
}

async fn request_key<S>(channel: &mut SecureChannel<S>, params: &HandshakeParams) -> Result<State, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    channel.write_int(params.requested_key).await?;
    let key_id = match channel.read_int().await {
        Ok(id) => id,
        // 知らない鍵 ID を要求するとデータベースは何も返さずに閉じる
        Err(ChannelError::ConnectionClosed) if params.requested_key != LATEST_KEY => {
            return Err(ClientError::KeyRejected(params.requested_key));
        }
        Err(e) => return Err(e.into()),
    };
    let public_key = channel.read_block(MAX_KEY_BLOCK_LENGTH).await?;

    if params.requested_key != LATEST_KEY && key_id != params.requested_key {
        return Err(ClientError::Protocol(format!(
            "requested key {} but database answered with key {key_id}",
            params.requested_key
        )));
    }
    if let Some(pinned) = &params.pinned_key {
        if *pinned != public_key {
            return Err(ClientError::KeyMismatch(key_id));
        }
    }
    debug!(requested = params.requested_key, key = key_id, "database key received");
    Ok(State::EphemeralKey { key_id, public_key })
}

async fn send_ephemeral_key<S>(
    channel: &mut SecureChannel<S>,
    params: &HandshakeParams,
    key_id: i32,
    public_key: Vec<u8>,
) -> Result<State, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let server_key = public_key_from_der(&public_key)?;
    let bits = params.ephemeral_key_bits;
    let (ephemeral, wrapped) = tokio::task::spawn_blocking(move || {
        let ephemeral = generate_private_key(bits)?;
        let der = public_key_to_der(&ephemeral.to_public_key())?;
        let wrapped = encrypt_chunked(&server_key, &der)?;
        Ok::<_, authdb_crypto::CryptoError>((ephemeral, wrapped))
    })
    .await??;
    channel.write_block(&wrapped).await?;
    Ok(State::SessionKey {
        key_id,
        public_key,
        ephemeral,
    })
}

async fn bootstrap<S>(channel: &mut SecureChannel<S>, params: &HandshakeParams) -> Result<State, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(admin) = &params.bootstrap else {
        return Err(ClientError::NoBootstrapCredentials);
    };
    channel.write_message(admin).await?;
    match channel.read_opcode().await? {
        Status::Success => Ok(State::Done(HandshakeResult::Bootstrapped)),
        status => Err(ClientError::BootstrapRejected(status)),
    }
}

async fn register<S>(channel: &mut SecureChannel<S>, params: &HandshakeParams) -> Result<Option<Registered>, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match &params.registration {
        RegistrationRequest::Unspecified => {
            channel.write_opcode(HandshakeCode::Unspecified).await?;
            Ok(None)
        }
        RegistrationRequest::New(request) => {
            channel.write_opcode(HandshakeCode::NewServer).await?;
            channel.write_message(request).await?;
            match channel.read_opcode().await? {
                Status::Success => {
                    let server_id = channel.read_u32().await?;
                    let identifier = channel.read_fixed(IDENTIFIER_LEN).await?;
                    Ok(Some(Registered::New { server_id, identifier }))
                }
                status => Err(ClientError::Rejected(status)),
            }
        }
        RegistrationRequest::Existing { server_id, identifier } => {
            if identifier.len() != IDENTIFIER_LEN {
                return Err(ClientError::Protocol(format!(
                    "stored identifier has {} bytes, expected {IDENTIFIER_LEN}",
                    identifier.len()
                )));
            }
            channel.write_opcode(HandshakeCode::ExistingServer).await?;
            channel.write_u32(*server_id).await?;
            channel.write_fixed(identifier).await?;
            match channel.read_opcode().await? {
                Status::Success => {
                    let params: ServerParams = channel.read_message(params.max_block_length).await?;
                    Ok(Some(Registered::Existing {
                        server_id: *server_id,
                        params,
                    }))
                }
                Status::DoesNotExist => Err(ClientError::UnknownServer(*server_id)),
                status => Err(ClientError::Rejected(status)),
            }
        }
    }
}
