//! コマンドディスパッチ
//!
//! LOGIN 以外のコマンドは先頭に実行者のオペレーター ID を持つ。
//! ペイロードをすべて読み終えてから実行者を検証し、ステータス 1 バイトと
//! （成功時のみ）応答ペイロードを返す。
//!
//! | コマンド               | 必要な権限      | 成功時の応答         |
//! |------------------------|-----------------|----------------------|
//! | LOGIN                  | -               | `OperatorInfo`       |
//! | LOGOUT                 | ログイン        | -                    |
//! | CREATE_OPERATOR        | OPERATORS       | オペレーター ID      |
//! | MODIFY_OPERATOR        | 本人 / OPERATORS| -                    |
//! | DELETE_OPERATOR        | OPERATORS       | -                    |
//! | GET_OPERATOR_LIST      | OPERATORS       | `OperatorList`       |
//! | MODIFY_SERVER          | SERVERS         | -                    |
//! | DISCONNECT_SERVER      | SERVERS         | -                    |
//! | DELETE_SERVER          | SERVERS         | -                    |
//! | GET_SERVER_LIST        | SERVERS         | `ServerList`         |
//! | GET_ACTIVE_OPERATORS   | OPERATORS       | `ActiveOperatorList` |
//! | GET_CONFIG             | CONFIGURE       | JSON 文字列          |
//! | CONFIGURE              | CONFIGURE       | -                    |
//! | GENERATE_PRESHARED_KEY | ADMINISTRATOR   | 鍵 ID                |
//! | RESTART_DATABASE       | ADMINISTRATOR   | -                    |

use std::sync::Arc;

use authdb_proto::messages::operator_edit::Field as OperatorField;
use authdb_proto::messages::server_edit::Field as ServerField;
use authdb_proto::messages::{NewOperator, OperatorEdits, OperatorList, ServerEdits, ServerList};
use authdb_proto::{permission, Command, Status, MAX_FIELD_LENGTH};
use authdb_store::{now_ms, ConfigUpdate, Operator};
use authdb_transport::SecureChannel;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::database::{Database, StoreKind};
use crate::error::SessionError;
use crate::push::PushTask;

/// listen3 で受け取ったコマンドを実行する
pub async fn dispatch<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
    command: Command,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!(conn = conn.id(), ?command, "dispatching command");
    match command {
        Command::Login => login(db, conn, channel).await,
        Command::Logout => logout(conn, channel).await,
        Command::CreateOperator => create_operator(db, conn, channel).await,
        Command::ModifyOperator => modify_operator(db, conn, channel).await,
        Command::DeleteOperator => delete_operator(db, conn, channel).await,
        Command::GetOperatorList => get_operator_list(db, conn, channel).await,
        Command::ModifyServer => modify_server(db, conn, channel).await,
        Command::DisconnectServer => disconnect_server(db, conn, channel).await,
        Command::DeleteServer => delete_server(db, conn, channel).await,
        Command::GetServerList => get_server_list(db, conn, channel).await,
        Command::GetActiveOperators => get_active_operators(db, conn, channel).await,
        Command::GetConfig => get_config(db, conn, channel).await,
        Command::Configure => configure(db, conn, channel).await,
        Command::GeneratePresharedKey => generate_preshared_key(db, conn, channel).await,
        Command::RestartDatabase => restart_database(db, conn, channel).await,
        Command::Ping | Command::NoFurtherInstructions => {
            Err(SessionError::Protocol(format!("{command:?} is not a command")))
        }
    }
}

/// 実行者のトラッカーを検証・延長し、権限を確認する
fn authorize(db: &Database, conn: &ConnectionHandle, actor_id: u32, required: u32) -> Result<Arc<Operator>, Status> {
    let timeout = db.config().get().session_timeout();
    let actor = conn.authenticate(actor_id, timeout).ok_or(Status::NotLoggedIn)?;
    if !permission::has(actor.permissions(), required) {
        return Err(Status::InsufficientPermissions);
    }
    Ok(actor)
}

async fn reply<S>(channel: &mut SecureChannel<S>, status: Status) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    channel.write_opcode(status).await?;
    Ok(())
}

fn max_message(db: &Database) -> usize {
    db.config().get().max_block_length
}

// ==============================================================
// セッション
// ==============================================================

async fn login<S>(db: &Arc<Database>, conn: &ConnectionHandle, channel: &mut SecureChannel<S>) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let username = channel.read_string(MAX_FIELD_LENGTH).await?;
    let password = channel.read_string(MAX_FIELD_LENGTH).await?;
    let Some(operator) = db.operators().get_by_username(&username) else {
        return reply(channel, Status::DoesNotExist).await;
    };

    let config = db.config().get();
    let policy = config.lockout_policy();
    let checking = operator.clone();
    let check =
        tokio::task::spawn_blocking(move || checking.check_credentials(&password, &policy, now_ms(), true)).await?;
    db.save_later(StoreKind::Operators);

    if !check.is_authenticated() {
        info!(conn = conn.id(), operator = operator.id(), result = ?check, "login rejected");
        return reply(channel, check.status()).await;
    }
    conn.login(operator.clone(), config.session_timeout());
    channel.write_opcode(check.status()).await?;
    channel.write_message(&operator.info()).await?;
    info!(conn = conn.id(), operator = operator.id(), "login accepted");
    Ok(())
}

async fn logout<S>(conn: &ConnectionHandle, channel: &mut SecureChannel<S>) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let status = if conn.logout(actor_id) {
        Status::Success
    } else {
        Status::NotLoggedIn
    };
    reply(channel, status).await
}

// ==============================================================
// オペレーター
// ==============================================================

async fn create_operator<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let mut new: NewOperator = channel.read_message(max_message(db)).await?;
    let actor = match authorize(db, conn, actor_id, permission::OPERATORS) {
        Ok(actor) => actor,
        Err(status) => return reply(channel, status).await,
    };

    new.permissions = permission::restrict(new.permissions, actor.permissions());
    let iterations = db.config().get().hash_iterations;
    let adding = db.clone();
    let created = tokio::task::spawn_blocking(move || adding.operators().add(&new, iterations, now_ms())).await?;
    let operator = match created {
        Ok(operator) => operator,
        Err(e) => {
            debug!(conn = conn.id(), actor = actor_id, error = %e, "create operator rejected");
            return reply(channel, Status::Failure).await;
        }
    };

    db.push_to_servers(PushTask::upsert(operator.record()));
    db.save_later(StoreKind::Operators);
    channel.write_opcode(Status::Success).await?;
    channel.write_u32(operator.id()).await?;
    info!(actor = actor_id, operator = operator.id(), "operator created");
    Ok(())
}

async fn modify_operator<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let target_id = channel.read_u32().await?;
    let edits: OperatorEdits = channel.read_message(max_message(db)).await?;
    let actor = match authorize(db, conn, actor_id, 0) {
        Ok(actor) => actor,
        Err(status) => return reply(channel, status).await,
    };
    let Some(target) = db.operators().get(target_id) else {
        return reply(channel, Status::DoesNotExist).await;
    };

    let actor_mask = actor.permissions();
    let access = EditAccess {
        is_self: actor.id() == target.id(),
        manages: permission::has(actor_mask, permission::OPERATORS)
            && permission::within(target.permissions(), actor_mask),
        actor_mask,
    };
    let requested = edits.edits.len();
    let mut applied = 0;
    for field in edits.edits.into_iter().filter_map(|e| e.field) {
        if apply_operator_edit(db, &target, field, &access).await? {
            applied += 1;
        }
    }

    if applied > 0 {
        db.push_to_servers(PushTask::upsert(target.record()));
        db.save_later(StoreKind::Operators);
    }
    info!(actor = actor_id, operator = target_id, applied, requested, "operator modified");
    reply(channel, Status::from_counts(applied, requested)).await
}

/// 実行者と対象の関係
struct EditAccess {
    is_self: bool,
    /// OPERATORS を持ち、対象の権限が実行者の実効権限に収まる
    manages: bool,
    actor_mask: u32,
}

impl EditAccess {
    fn allows(&self, field: &OperatorField) -> bool {
        match field {
            OperatorField::Password(_) | OperatorField::DisplayName(_) | OperatorField::Description(_) => {
                self.is_self || self.manages
            }
            _ => self.manages,
        }
    }
}

/// 変更 1 件を適用する。受け付けたら true
async fn apply_operator_edit(
    db: &Database,
    target: &Arc<Operator>,
    field: OperatorField,
    access: &EditAccess,
) -> Result<bool, SessionError> {
    if !access.allows(&field) {
        return Ok(false);
    }
    let now = now_ms();
    match field {
        OperatorField::Password(password) => {
            let iterations = db.config().get().hash_iterations;
            let operator = target.clone();
            let result = tokio::task::spawn_blocking(move || operator.set_password(&password, iterations, now)).await?;
            if let Err(e) = &result {
                warn!(operator = target.id(), error = %e, "failed to set password");
            }
            Ok(result.is_ok())
        }
        OperatorField::Username(username) => Ok(db.operators().rename(target, &username, now).is_ok()),
        OperatorField::DisplayName(name) => {
            target.set_display_name(&name, now);
            Ok(true)
        }
        OperatorField::Description(description) => {
            target.set_description(&description, now);
            Ok(true)
        }
        OperatorField::Permissions(mask) => {
            target.set_permissions(permission::restrict(mask, access.actor_mask), now);
            Ok(true)
        }
        OperatorField::NavigationTimeout(timeout) => {
            target.set_navigation_timeout(timeout, now);
            Ok(true)
        }
        OperatorField::ForcePasswordChange(force) => {
            target.set_force_password_change(force, now);
            Ok(true)
        }
        OperatorField::Unlock(_) => {
            target.unlock(now);
            Ok(true)
        }
    }
}

async fn delete_operator<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let target_id = channel.read_u32().await?;
    let actor = match authorize(db, conn, actor_id, permission::OPERATORS) {
        Ok(actor) => actor,
        Err(status) => return reply(channel, status).await,
    };
    if target_id == actor.id() {
        return reply(channel, Status::Failure).await;
    }
    let Some(target) = db.operators().get(target_id) else {
        return reply(channel, Status::DoesNotExist).await;
    };
    if !permission::within(target.permissions(), actor.permissions()) {
        return reply(channel, Status::InsufficientPermissions).await;
    }
    if db.operators().remove(target_id).is_none() {
        return reply(channel, Status::DoesNotExist).await;
    }

    db.push_to_servers(PushTask::removal(target_id));
    db.save_later(StoreKind::Operators);
    info!(actor = actor_id, operator = target_id, "operator deleted");
    reply(channel, Status::Success).await
}

async fn get_operator_list<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::OPERATORS) {
        return reply(channel, status).await;
    }
    let mut operators: Vec<_> = db.operators().snapshot().iter().map(|op| op.info()).collect();
    operators.sort_by_key(|op| op.id);
    channel.write_opcode(Status::Success).await?;
    channel.write_message(&OperatorList { operators }).await?;
    Ok(())
}

async fn get_active_operators<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::OPERATORS) {
        return reply(channel, status).await;
    }
    channel.write_opcode(Status::Success).await?;
    channel.write_message(&db.active_operators()).await?;
    Ok(())
}

// ==============================================================
// サーバー
// ==============================================================

async fn modify_server<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let server_id = channel.read_u32().await?;
    let edits: ServerEdits = channel.read_message(max_message(db)).await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::SERVERS) {
        return reply(channel, status).await;
    }
    let Some(server) = db.servers().get(server_id) else {
        return reply(channel, Status::DoesNotExist).await;
    };

    let requested = edits.edits.len();
    let mut applied = 0;
    for field in edits.edits.into_iter().filter_map(|e| e.field) {
        let accepted = match field {
            ServerField::Name(name) => db.servers().rename(&server, &name).is_ok(),
            ServerField::Description(description) => {
                server.set_description(&description);
                true
            }
        };
        if accepted {
            applied += 1;
        }
    }

    if applied > 0 {
        db.push_to_server(server_id, PushTask::ServerParams(server.params()));
        db.save_later(StoreKind::Servers);
    }
    info!(actor = actor_id, server = server_id, applied, requested, "server modified");
    reply(channel, Status::from_counts(applied, requested)).await
}

async fn disconnect_server<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let server_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::SERVERS) {
        return reply(channel, status).await;
    }
    if db.servers().get(server_id).is_none() {
        return reply(channel, Status::DoesNotExist).await;
    }
    let status = if db.disconnect_server(server_id) {
        info!(actor = actor_id, server = server_id, "server disconnected");
        Status::Success
    } else {
        Status::Failure
    };
    reply(channel, status).await
}

async fn delete_server<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let server_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::SERVERS) {
        return reply(channel, status).await;
    }
    if db.servers().remove(server_id).is_none() {
        return reply(channel, Status::DoesNotExist).await;
    }
    db.disconnect_server(server_id);
    db.save_later(StoreKind::Servers);
    info!(actor = actor_id, server = server_id, "server deleted");
    reply(channel, Status::Success).await
}

async fn get_server_list<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::SERVERS) {
        return reply(channel, status).await;
    }
    let mut servers: Vec<_> = db.servers().snapshot().iter().map(|s| s.info()).collect();
    servers.sort_by_key(|s| s.id);
    channel.write_opcode(Status::Success).await?;
    channel.write_message(&ServerList { servers }).await?;
    Ok(())
}

// ==============================================================
// 設定・鍵・再起動
// ==============================================================

async fn get_config<S>(db: &Arc<Database>, conn: &ConnectionHandle, channel: &mut SecureChannel<S>) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::CONFIGURE) {
        return reply(channel, status).await;
    }
    let json = match serde_json::to_string_pretty(&db.config().get()) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize config");
            return reply(channel, Status::Failure).await;
        }
    };
    channel.write_opcode(Status::Success).await?;
    channel.write_string(&json).await?;
    Ok(())
}

async fn configure<S>(db: &Arc<Database>, conn: &ConnectionHandle, channel: &mut SecureChannel<S>) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    let json = channel.read_string(max_message(db)).await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::CONFIGURE) {
        return reply(channel, status).await;
    }

    let update: ConfigUpdate = match serde_json::from_str(&json) {
        Ok(update) => update,
        Err(e) => {
            debug!(actor = actor_id, error = %e, "malformed config update");
            return reply(channel, Status::Failure).await;
        }
    };
    let change = match db.config().update(&update) {
        Ok(change) => change,
        Err(e) => {
            debug!(actor = actor_id, error = %e, "config update rejected");
            return reply(channel, Status::Failure).await;
        }
    };

    if change.ping_interval_changed() {
        let ping_ms = i32::try_from(change.current.ping_interval_ms).unwrap_or(i32::MAX);
        db.push_to_all(PushTask::PingInterval(ping_ms));
    }
    if change.requires_restart() {
        info!("listener settings changed, they take effect after RESTART_DATABASE");
    }
    info!(actor = actor_id, "configuration changed");
    reply(channel, Status::Success).await
}

async fn generate_preshared_key<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::ADMINISTRATOR) {
        return reply(channel, status).await;
    }
    match db.generate_key().await {
        Ok(key) => {
            info!(actor = actor_id, key = key.id(), "preshared key generated");
            channel.write_opcode(Status::Success).await?;
            channel.write_int(key.id()).await?;
            Ok(())
        }
        Err(e) => {
            warn!(actor = actor_id, error = %e, "key generation failed");
            reply(channel, Status::Failure).await
        }
    }
}

async fn restart_database<S>(
    db: &Arc<Database>,
    conn: &ConnectionHandle,
    channel: &mut SecureChannel<S>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let actor_id = channel.read_u32().await?;
    if let Err(status) = authorize(db, conn, actor_id, permission::ADMINISTRATOR) {
        return reply(channel, status).await;
    }
    reply(channel, Status::Success).await?;
    info!(actor = actor_id, "restart requested by operator");
    db.request_restart();
    Ok(())
}
