//! オペレーター（認証情報ストア）
//!
//! ## ログイン失敗とロックアウト
//! ```text
//! check_credentials(password, now):
//!   lockout_until <= now なら解除
//!   ロック中                → LockedOut
//!   パスワード一致          → 失敗履歴とロックを消し last_login = now
//!                              → Success / ChangePassword
//!   不一致（記録する場合）  → failed_logins に now を追加し、period より古いものを捨てる
//!                              件数 > attempts なら lockout_until = now + lockout、履歴を消す
//!                              → Failure
//! ```
//!
//! サーバー側は常に失敗を記録する。クライアント側はデータベースと切断中のみ記録する。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use authdb_crypto::password::{self, generate_salt, verify_password};
use authdb_proto::messages::{NewOperator, OperatorInfo, OperatorRecord, OperatorTable, OperatorUpdate};
use authdb_proto::{Status, WireMessage};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::arena::{Arena, Tombstone};
use crate::error::StoreError;
use crate::persist::StoreFile;
use crate::MAX_NAME_LENGTH;

/// ログイン失敗のロックアウト規則
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// ロックせずに許す失敗回数
    pub attempts: u32,
    /// 失敗を数える期間（ミリ秒）
    pub period_ms: i64,
    /// ロックアウトの長さ（ミリ秒）
    pub lockout_ms: i64,
}

/// 認証の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    Success,
    /// 認証は成功したがパスワード変更が必要
    ChangePassword,
    Failure,
    LockedOut,
}

impl CredentialCheck {
    pub fn is_authenticated(self) -> bool {
        matches!(self, CredentialCheck::Success | CredentialCheck::ChangePassword)
    }

    /// LOGIN 応答のステータス
    pub fn status(self) -> Status {
        match self {
            CredentialCheck::Success => Status::Success,
            CredentialCheck::ChangePassword => Status::ChangePassword,
            CredentialCheck::Failure => Status::Failure,
            CredentialCheck::LockedOut => Status::LockedOut,
        }
    }
}

#[derive(Debug, Clone)]
struct OperatorData {
    username: String,
    salt: Vec<u8>,
    hash: Vec<u8>,
    iterations: u32,
    permissions: u32,
    display_name: String,
    navigation_timeout: i32,
    description: String,
    created: i64,
    modified: i64,
    last_login: Option<i64>,
    force_password_change: bool,
    lockout_until: Option<i64>,
    failed_logins: Vec<i64>,
}

impl From<OperatorRecord> for OperatorData {
    fn from(r: OperatorRecord) -> Self {
        OperatorData {
            username: r.username,
            salt: r.salt,
            hash: r.hash,
            iterations: r.iterations,
            permissions: r.permissions,
            display_name: r.display_name,
            navigation_timeout: r.navigation_timeout,
            description: r.description,
            created: r.created,
            modified: r.modified,
            last_login: r.last_login,
            force_password_change: r.force_password_change,
            lockout_until: r.lockout_until,
            failed_logins: r.failed_logins,
        }
    }
}

/// オペレーター 1 人
///
/// `Arc<Operator>` はトラッカーなどから参照され続けることがあるため、
/// 削除は `disposed` フラグで表し、次の `save()` でスロットから回収する。
#[derive(Debug)]
pub struct Operator {
    id: u32,
    data: RwLock<OperatorData>,
    disposed: AtomicBool,
}

impl Tombstone for Operator {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Operator {
    /// ストアに属さないオペレーターをレコードから作る
    pub fn from_record(record: OperatorRecord) -> Self {
        Operator {
            id: record.id,
            data: RwLock::new(record.into()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn username(&self) -> String {
        self.data.read().username.clone()
    }

    pub fn display_name(&self) -> String {
        self.data.read().display_name.clone()
    }

    /// 保存されている権限ビット（実効権限は `permission::effective` で求める）
    pub fn permissions(&self) -> u32 {
        self.data.read().permissions
    }

    pub fn force_password_change(&self) -> bool {
        self.data.read().force_password_change
    }

    pub fn is_disposed(&self) -> bool {
        Tombstone::is_disposed(self)
    }

    pub fn is_locked_out(&self, now: i64) -> bool {
        self.data.read().lockout_until.is_some_and(|until| until > now)
    }

    /// 保存・同期用のレコード（ID を含む）
    pub fn record(&self) -> OperatorRecord {
        let d = self.data.read();
        OperatorRecord {
            id: self.id,
            username: d.username.clone(),
            salt: d.salt.clone(),
            hash: d.hash.clone(),
            iterations: d.iterations,
            permissions: d.permissions,
            display_name: d.display_name.clone(),
            navigation_timeout: d.navigation_timeout,
            description: d.description.clone(),
            created: d.created,
            modified: d.modified,
            last_login: d.last_login,
            force_password_change: d.force_password_change,
            lockout_until: d.lockout_until,
            failed_logins: d.failed_logins.clone(),
        }
    }

    /// 秘密情報を含まない公開情報
    pub fn info(&self) -> OperatorInfo {
        let d = self.data.read();
        OperatorInfo {
            id: self.id,
            username: d.username.clone(),
            display_name: d.display_name.clone(),
            permissions: d.permissions,
            navigation_timeout: d.navigation_timeout,
            description: d.description.clone(),
            force_password_change: d.force_password_change,
            last_login: d.last_login,
            lockout_until: d.lockout_until,
        }
    }

    /// パスワードを検証し、ログイン失敗・ロックアウトの状態を更新する
    ///
    /// ハッシュ計算はロックの外で行う。
    pub fn check_credentials(
        &self,
        password: &str,
        policy: &LockoutPolicy,
        now: i64,
        record_failures: bool,
    ) -> CredentialCheck {
        let (salt, hash, iterations) = {
            let mut d = self.data.write();
            if let Some(until) = d.lockout_until {
                if until <= now {
                    d.lockout_until = None;
                } else {
                    return CredentialCheck::LockedOut;
                }
            }
            (d.salt.clone(), d.hash.clone(), d.iterations)
        };

        let matched = verify_password(password, &salt, iterations, &hash);

        let mut d = self.data.write();
        if matched {
            d.lockout_until = None;
            d.failed_logins.clear();
            d.last_login = Some(now);
            return if d.force_password_change {
                CredentialCheck::ChangePassword
            } else {
                CredentialCheck::Success
            };
        }

        if record_failures {
            d.failed_logins.push(now);
            d.failed_logins.retain(|&t| now - t < policy.period_ms);
            if d.failed_logins.len() > policy.attempts as usize {
                d.lockout_until = Some(now + policy.lockout_ms);
                d.failed_logins.clear();
                info!(operator = self.id, until = now + policy.lockout_ms, "operator locked out");
            }
        }
        CredentialCheck::Failure
    }

    /// 新しいソルトでパスワードを設定する
    pub fn set_password(&self, password: &str, iterations: u32, now: i64) -> Result<(), StoreError> {
        let salt = generate_salt()?;
        let hash = password::hash_password(password, &salt, iterations);
        let mut d = self.data.write();
        d.salt = salt.to_vec();
        d.hash = hash.to_vec();
        d.iterations = iterations;
        d.force_password_change = false;
        d.modified = now;
        Ok(())
    }

    pub fn set_display_name(&self, display_name: &str, now: i64) {
        let mut d = self.data.write();
        d.display_name = display_name.to_string();
        d.modified = now;
    }

    pub fn set_description(&self, description: &str, now: i64) {
        let mut d = self.data.write();
        d.description = description.to_string();
        d.modified = now;
    }

    pub fn set_permissions(&self, permissions: u32, now: i64) {
        let mut d = self.data.write();
        d.permissions = permissions;
        d.modified = now;
    }

    pub fn set_navigation_timeout(&self, timeout: i32, now: i64) {
        let mut d = self.data.write();
        d.navigation_timeout = timeout;
        d.modified = now;
    }

    pub fn set_force_password_change(&self, force: bool, now: i64) {
        let mut d = self.data.write();
        d.force_password_change = force;
        d.modified = now;
    }

    /// ロックアウトと失敗履歴を消す
    pub fn unlock(&self, now: i64) {
        let mut d = self.data.write();
        d.lockout_until = None;
        d.failed_logins.clear();
        d.modified = now;
    }

    fn replace(&self, record: OperatorRecord) {
        *self.data.write() = record.into();
    }

    fn set_username(&self, username: &str, now: i64) {
        let mut d = self.data.write();
        d.username = username.to_string();
        d.modified = now;
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// ユーザー名を検証し、比較用のキーを返す
fn username_key(username: &str) -> Result<String, StoreError> {
    let trimmed = username.trim();
    if trimmed.is_empty()
        || trimmed.chars().count() > MAX_NAME_LENGTH
        || trimmed.chars().any(char::is_control)
    {
        return Err(StoreError::InvalidUsername(username.to_string()));
    }
    Ok(trimmed.to_lowercase())
}

#[derive(Debug)]
struct Table {
    arena: Arena<Operator>,
    /// 小文字化したユーザー名 → ID（削除済みは含まない）
    by_name: HashMap<String, u32>,
}

/// オペレーターのスレッド安全なテーブル
///
/// `for_each` などのコールバックは読み取りロックを保持したまま呼ばれる。
/// コールバックからストアを変更してはならない（書き込みロックへの昇格はデッドロックする）。
#[derive(Debug)]
pub struct OperatorStore {
    file: Option<StoreFile>,
    table: RwLock<Table>,
}

impl OperatorStore {
    /// 永続化しないストア（クライアントのオフラインキャッシュ用）
    pub fn in_memory() -> Self {
        Self::with_file(None)
    }

    /// ストアファイルを読み込む。なければ空
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = StoreFile::new(path);
        let bytes = file.read()?;
        let store = Self::with_file(Some(file));
        if let Some(bytes) = bytes {
            let table = OperatorTable::decode_from_bytes(&bytes)?;
            store.replace_all(table.operators);
        }
        info!(operators = store.len(), "operator store loaded");
        Ok(store)
    }

    fn with_file(file: Option<StoreFile>) -> Self {
        OperatorStore {
            file,
            table: RwLock::new(Table {
                arena: Arena::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    /// 新しいオペレーターを追加する
    ///
    /// # エラー
    /// - `StoreError::InvalidUsername`: 空・長すぎる・制御文字を含む
    /// - `StoreError::UsernameTaken`: 大文字小文字を区別せず同名がいる
    pub fn add(&self, new: &NewOperator, iterations: u32, now: i64) -> Result<Arc<Operator>, StoreError> {
        let key = username_key(&new.username)?;
        if self.table.read().by_name.contains_key(&key) {
            return Err(StoreError::UsernameTaken(new.username.trim().to_string()));
        }

        // ハッシュ計算はロックの外で行う
        let salt = generate_salt()?;
        let hash = password::hash_password(&new.password, &salt, iterations);

        let mut table = self.table.write();
        if table.by_name.contains_key(&key) {
            return Err(StoreError::UsernameTaken(new.username.trim().to_string()));
        }
        let operator = table.arena.insert_with(|id| {
            Operator::from_record(OperatorRecord {
                id,
                username: new.username.trim().to_string(),
                salt: salt.to_vec(),
                hash: hash.to_vec(),
                iterations,
                permissions: new.permissions,
                display_name: new.display_name.clone(),
                navigation_timeout: new.navigation_timeout,
                description: new.description.clone(),
                created: now,
                modified: now,
                last_login: None,
                force_password_change: new.force_password_change,
                lockout_until: None,
                failed_logins: Vec::new(),
            })
        });
        table.by_name.insert(key, operator.id());
        debug!(operator = operator.id(), "operator added");
        Ok(operator)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Operator>> {
        self.table.read().arena.get(id).cloned()
    }

    /// 大文字小文字を区別せずユーザー名で探す
    pub fn get_by_username(&self, username: &str) -> Option<Arc<Operator>> {
        let key = username.trim().to_lowercase();
        let table = self.table.read();
        table.by_name.get(&key).and_then(|&id| table.arena.get(id)).cloned()
    }

    /// ユーザー名を変更する
    pub fn rename(&self, operator: &Operator, username: &str, now: i64) -> Result<(), StoreError> {
        let key = username_key(username)?;
        let mut table = self.table.write();
        if operator.is_disposed() {
            return Err(StoreError::InvalidUsername(username.to_string()));
        }
        match table.by_name.get(&key) {
            Some(&id) if id != operator.id() => {
                return Err(StoreError::UsernameTaken(username.trim().to_string()))
            }
            _ => {}
        }
        let old_key = operator.username().trim().to_lowercase();
        table.by_name.remove(&old_key);
        table.by_name.insert(key, operator.id());
        operator.set_username(username.trim(), now);
        Ok(())
    }

    /// オペレーターを削除する（tombstone として残り、次の `save()` で回収される）
    pub fn remove(&self, id: u32) -> Option<Arc<Operator>> {
        let mut table = self.table.write();
        let operator = table.arena.get(id).cloned()?;
        operator.dispose();
        let key = operator.username().trim().to_lowercase();
        if table.by_name.get(&key) == Some(&id) {
            table.by_name.remove(&key);
        }
        debug!(operator = id, "operator disposed");
        Some(operator)
    }

    /// 生きているオペレーターの数
    pub fn len(&self) -> usize {
        self.table.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 読み取りロックを保持したまま各オペレーターを処理する
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Operator>)) {
        let table = self.table.read();
        for operator in table.arena.live() {
            f(operator);
        }
    }

    /// 生きているオペレーターの参照のコピー
    pub fn snapshot(&self) -> Vec<Arc<Operator>> {
        self.table.read().arena.live().cloned().collect()
    }

    /// 全オペレーターのレコード（全体同期用）
    pub fn records(&self) -> Vec<OperatorRecord> {
        self.snapshot().iter().map(|op| op.record()).collect()
    }

    /// 全体を置き換える（ストアファイル読み込み・全体同期）
    pub fn replace_all(&self, records: Vec<OperatorRecord>) {
        let mut table = self.table.write();
        for operator in table.arena.live() {
            operator.dispose();
        }
        table.arena.clear();
        table.by_name.clear();
        for record in records {
            Self::upsert_locked(&mut table, record);
        }
    }

    /// UPDATE_OPERATORS を適用する
    pub fn apply_update(&self, update: &OperatorUpdate) {
        if update.full_sync {
            self.replace_all(update.upserts.clone());
            return;
        }
        let mut table = self.table.write();
        for record in &update.upserts {
            Self::upsert_locked(&mut table, record.clone());
        }
        for &id in &update.removed {
            if let Some(operator) = table.arena.get(id).cloned() {
                operator.dispose();
                let key = operator.username().trim().to_lowercase();
                table.by_name.remove(&key);
            }
        }
    }

    /// tombstone を回収し、ストアファイルに書き出す
    ///
    /// 参照のコピーは書き込みロックの下で短く取り、エンコードとファイル書き込みは
    /// ロックの外で行う。
    pub fn save(&self) -> Result<(), StoreError> {
        let live: Vec<Arc<Operator>> = {
            let mut table = self.table.write();
            let collected = table.arena.collect_tombstones();
            if collected > 0 {
                debug!(collected, "collected disposed operators");
            }
            table.arena.live().cloned().collect()
        };
        let Some(file) = &self.file else {
            return Ok(());
        };
        let table = OperatorTable {
            operators: live.iter().map(|op| op.record()).collect(),
        };
        file.write(&table.encode_to_bytes())
    }

    pub fn file(&self) -> Option<&StoreFile> {
        self.file.as_ref()
    }

    fn upsert_locked(table: &mut Table, record: OperatorRecord) {
        let key = record.username.trim().to_lowercase();
        // 同名の別 ID は名前が変わった後の古い割り当て
        if let Some(&other) = table.by_name.get(&key) {
            if other != record.id {
                warn!(operator = record.id, other, "duplicate username in operator records");
                table.by_name.remove(&key);
            }
        }
        let id = record.id;
        match table.arena.get(id).cloned() {
            Some(existing) => {
                let old_key = existing.username().trim().to_lowercase();
                table.by_name.remove(&old_key);
                existing.replace(record);
            }
            None => {
                table.arena.place(id, Arc::new(Operator::from_record(record)));
            }
        }
        table.by_name.insert(key, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authdb_proto::permission;

    const ITERATIONS: u32 = 16;

    fn policy() -> LockoutPolicy {
        LockoutPolicy {
            attempts: 3,
            period_ms: 60_000,
            lockout_ms: 120_000,
        }
    }

    fn new_operator(username: &str, password: &str) -> NewOperator {
        NewOperator {
            username: username.into(),
            password: password.into(),
            display_name: username.to_uppercase(),
            permissions: permission::OPERATORS,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_get_check() {
        let store = OperatorStore::in_memory();
        let alice = store.add(&new_operator("alice", "s3cret"), ITERATIONS, 1_000).unwrap();

        let found = store.get_by_username("ALICE").unwrap();
        assert_eq!(found.id(), alice.id());
        assert_eq!(store.get(alice.id()).unwrap().username(), "alice");
        assert_eq!(
            found.check_credentials("s3cret", &policy(), 2_000, true),
            CredentialCheck::Success
        );
        assert_eq!(found.record().last_login, Some(2_000));
        assert_eq!(
            found.check_credentials("nope", &policy(), 3_000, true),
            CredentialCheck::Failure
        );
    }

    #[test]
    fn test_username_unique_case_insensitive() {
        let store = OperatorStore::in_memory();
        store.add(&new_operator("Bob", "pw"), ITERATIONS, 0).unwrap();
        assert!(matches!(
            store.add(&new_operator(" bob ", "pw"), ITERATIONS, 0),
            Err(StoreError::UsernameTaken(_))
        ));
        assert!(matches!(
            store.add(&new_operator("   ", "pw"), ITERATIONS, 0),
            Err(StoreError::InvalidUsername(_))
        ));
    }

    #[test]
    fn test_lockout_after_more_than_attempts() {
        let store = OperatorStore::in_memory();
        let op = store.add(&new_operator("carol", "right"), ITERATIONS, 0).unwrap();
        let p = policy();

        // attempts 回までの失敗ではロックされない
        for t in 0..p.attempts as i64 {
            assert_eq!(op.check_credentials("wrong", &p, 1_000 + t, true), CredentialCheck::Failure);
        }
        assert!(!op.is_locked_out(1_010));
        assert_eq!(op.check_credentials("right", &p, 1_010, true), CredentialCheck::Success);

        // attempts + 1 回目でロック
        for t in 0..=p.attempts as i64 {
            op.check_credentials("wrong", &p, 2_000 + t, true);
        }
        let locked_at = 2_000 + p.attempts as i64;
        assert!(op.is_locked_out(locked_at));
        assert_eq!(
            op.check_credentials("right", &p, locked_at + 1, true),
            CredentialCheck::LockedOut
        );

        // ロックアウト期間が過ぎれば正しいパスワードで成功
        assert_eq!(
            op.check_credentials("right", &p, locked_at + p.lockout_ms, true),
            CredentialCheck::Success
        );
        assert_eq!(op.record().lockout_until, None);
    }

    #[test]
    fn test_failures_outside_period_do_not_count() {
        let store = OperatorStore::in_memory();
        let op = store.add(&new_operator("dave", "right"), ITERATIONS, 0).unwrap();
        let p = policy();
        for i in 0..10i64 {
            op.check_credentials("wrong", &p, i * p.period_ms, true);
        }
        assert!(!op.is_locked_out(10 * p.period_ms));
    }

    #[test]
    fn test_failures_not_recorded_when_disabled() {
        let store = OperatorStore::in_memory();
        let op = store.add(&new_operator("erin", "right"), ITERATIONS, 0).unwrap();
        for t in 0..10 {
            op.check_credentials("wrong", &policy(), t, false);
        }
        assert!(op.record().failed_logins.is_empty());
        assert!(!op.is_locked_out(10));
    }

    #[test]
    fn test_force_password_change() {
        let store = OperatorStore::in_memory();
        let mut new = new_operator("frank", "temp");
        new.force_password_change = true;
        let op = store.add(&new, ITERATIONS, 0).unwrap();
        assert_eq!(op.check_credentials("temp", &policy(), 1, true), CredentialCheck::ChangePassword);

        op.set_password("permanent", ITERATIONS, 2).unwrap();
        assert_eq!(op.check_credentials("permanent", &policy(), 3, true), CredentialCheck::Success);
        assert_eq!(op.check_credentials("temp", &policy(), 4, true), CredentialCheck::Failure);
    }

    #[test]
    fn test_remove_frees_name_and_id_after_save() {
        let store = OperatorStore::in_memory();
        let a = store.add(&new_operator("gina", "pw"), ITERATIONS, 0).unwrap();
        store.add(&new_operator("hank", "pw"), ITERATIONS, 0).unwrap();

        let removed = store.remove(a.id()).unwrap();
        assert!(removed.is_disposed());
        assert!(store.get(a.id()).is_none());
        assert!(store.get_by_username("gina").is_none());
        assert_eq!(store.len(), 1);

        // 名前はすぐ再利用できるが ID は save() まで再利用されない
        let again = store.add(&new_operator("gina", "pw"), ITERATIONS, 0).unwrap();
        assert_ne!(again.id(), a.id());
        store.remove(again.id());
        store.save().unwrap();
        let third = store.add(&new_operator("ivan", "pw"), ITERATIONS, 0).unwrap();
        assert_eq!(third.id(), a.id());
    }

    #[test]
    fn test_rename() {
        let store = OperatorStore::in_memory();
        let a = store.add(&new_operator("jack", "pw"), ITERATIONS, 0).unwrap();
        store.add(&new_operator("kate", "pw"), ITERATIONS, 0).unwrap();
        assert!(matches!(store.rename(&a, "KATE", 1), Err(StoreError::UsernameTaken(_))));
        store.rename(&a, "Jackie", 1).unwrap();
        assert!(store.get_by_username("jack").is_none());
        assert_eq!(store.get_by_username("jackie").unwrap().id(), a.id());
        store.rename(&a, "JACKIE", 2).unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operators.db");
        let store = OperatorStore::load(&path).unwrap();
        let a = store.add(&new_operator("lena", "pw"), ITERATIONS, 5).unwrap();
        let b = store.add(&new_operator("mike", "pw"), ITERATIONS, 5).unwrap();
        store.remove(a.id());
        store.save().unwrap();

        let reloaded = OperatorStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        let mike = reloaded.get_by_username("mike").unwrap();
        assert_eq!(mike.id(), b.id());
        assert_eq!(
            mike.check_credentials("pw", &policy(), 6, true),
            CredentialCheck::Success
        );
    }

    #[test]
    fn test_apply_update() {
        let server = OperatorStore::in_memory();
        let a = server.add(&new_operator("nina", "pw"), ITERATIONS, 0).unwrap();
        let b = server.add(&new_operator("omar", "pw"), ITERATIONS, 0).unwrap();

        let cache = OperatorStore::in_memory();
        cache.apply_update(&OperatorUpdate {
            full_sync: true,
            upserts: server.records(),
            removed: vec![],
        });
        assert_eq!(cache.len(), 2);

        a.set_display_name("Nina N.", 1);
        cache.apply_update(&OperatorUpdate {
            full_sync: false,
            upserts: vec![a.record()],
            removed: vec![b.id()],
        });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(a.id()).unwrap().display_name(), "Nina N.");
        assert!(cache.get_by_username("omar").is_none());
    }

    #[test]
    fn test_concurrent_adds_same_username() {
        let store = Arc::new(OperatorStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.add(&new_operator("pat", "pw"), ITERATIONS, 0).is_ok())
            })
            .collect();
        let successes = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(successes, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_adds_distinct_ids() {
        let store = Arc::new(OperatorStore::in_memory());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .add(&new_operator(&format!("user{i}"), "pw"), ITERATIONS, 0)
                        .unwrap()
                        .id()
                })
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }
}
