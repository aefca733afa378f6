//! オフライン認証用のオペレーターキャッシュ
//!
//! データベースから UPDATE_OPERATORS で届いたレコードを保持し、ローカルで
//! パスワードを検証する。ログイン失敗はデータベースと切断中のみ記録し、
//! ロックアウトの判定は [`LockoutPolicy`] に従う。

use std::sync::Arc;

use authdb_proto::messages::{OperatorInfo, OperatorRecord, OperatorUpdate};
use authdb_store::{CredentialCheck, LockoutPolicy, Operator, OperatorStore};
use tracing::debug;

pub struct OperatorCache {
    store: OperatorStore,
    policy: LockoutPolicy,
}

impl OperatorCache {
    pub fn new(policy: LockoutPolicy, records: Vec<OperatorRecord>) -> Self {
        let store = OperatorStore::in_memory();
        store.replace_all(records);
        OperatorCache { store, policy }
    }

    /// キャッシュ上の認証情報を検証する
    ///
    /// # 引数
    /// - `record_failures`: 失敗をスライディングウィンドウに記録するか
    ///   （データベースと切断中のみ true にする）
    ///
    /// # 戻り値
    /// キャッシュにいないユーザー名なら `None`
    pub fn check(&self, username: &str, password: &str, now: i64, record_failures: bool) -> Option<CredentialCheck> {
        let operator = self.lookup(username)?;
        let check = operator.check_credentials(password, &self.policy, now, record_failures);
        debug!(operator = operator.id(), result = ?check, record_failures, "cached credential check");
        Some(check)
    }

    /// UPDATE_OPERATORS を適用する
    pub fn apply(&self, update: &OperatorUpdate) {
        self.store.apply_update(update);
        debug!(
            full_sync = update.full_sync,
            upserts = update.upserts.len(),
            removed = update.removed.len(),
            "operator cache updated"
        );
    }

    pub fn get(&self, username: &str) -> Option<OperatorInfo> {
        self.lookup(username).map(|op| op.info())
    }

    pub fn records(&self) -> Vec<OperatorRecord> {
        self.store.records()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn lookup(&self, username: &str) -> Option<Arc<Operator>> {
        self.store.get_by_username(username).filter(|op| !op.is_disposed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authdb_proto::messages::NewOperator;

    const POLICY: LockoutPolicy = LockoutPolicy {
        attempts: 2,
        period_ms: 10_000,
        lockout_ms: 60_000,
    };

    fn record(username: &str, password: &str) -> OperatorRecord {
        let source = OperatorStore::in_memory();
        let new = NewOperator {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        };
        source.add(&new, 16, 1_000).unwrap().record()
    }

    #[test]
    fn test_unknown_user_is_none() {
        let cache = OperatorCache::new(POLICY, vec![record("alice", "pw")]);
        assert_eq!(cache.check("mallory", "pw", 0, true), None);
        assert_eq!(cache.check("ALICE", "pw", 0, true), Some(CredentialCheck::Success));
    }

    #[test]
    fn test_offline_lockout_after_repeated_failures() {
        let cache = OperatorCache::new(POLICY, vec![record("alice", "pw")]);
        let now = 2_000;
        assert_eq!(cache.check("alice", "x", now, true), Some(CredentialCheck::Failure));
        assert_eq!(cache.check("alice", "x", now + 1, true), Some(CredentialCheck::Failure));
        // 3 回目の失敗でロックされる
        assert_eq!(cache.check("alice", "x", now + 2, true), Some(CredentialCheck::Failure));
        assert_eq!(cache.check("alice", "pw", now + 3, true), Some(CredentialCheck::LockedOut));
        // ロックアウト期間が過ぎれば解除
        assert_eq!(
            cache.check("alice", "pw", now + 2 + POLICY.lockout_ms, true),
            Some(CredentialCheck::Success)
        );
    }

    #[test]
    fn test_failures_not_recorded_while_connected() {
        let cache = OperatorCache::new(POLICY, vec![record("alice", "pw")]);
        for i in 0..5 {
            assert_eq!(cache.check("alice", "x", 2_000 + i, false), Some(CredentialCheck::Failure));
        }
        assert_eq!(cache.check("alice", "pw", 2_010, false), Some(CredentialCheck::Success));
    }

    #[test]
    fn test_apply_update_upserts_and_removes() {
        let alice = record("alice", "pw");
        let cache = OperatorCache::new(POLICY, vec![alice.clone()]);

        let mut bob = record("bob", "pw2");
        bob.id = alice.id + 1;
        cache.apply(&OperatorUpdate {
            full_sync: false,
            upserts: vec![bob],
            removed: vec![alice.id],
        });
        assert!(cache.get("alice").is_none());
        assert_eq!(cache.check("bob", "pw2", 3_000, true), Some(CredentialCheck::Success));

        cache.apply(&OperatorUpdate {
            full_sync: true,
            upserts: vec![alice],
            removed: Vec::new(),
        });
        assert!(cache.get("bob").is_none());
        assert!(cache.get("alice").is_some());
        assert_eq!(cache.records().len(), 1);
    }
}
