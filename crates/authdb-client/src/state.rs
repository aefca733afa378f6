//! クライアントの永続状態
//!
//! 登録済みサーバー ID・識別子・ピン留めした鍵・ping 間隔と、オフライン認証用の
//! オペレーターキャッシュを 1 つのファイル（prost `ClientState`）に保存する。
//! メモリ上の `operators` は常に空で、キャッシュの本体は [`OperatorCache`] が持つ。
//!
//! [`OperatorCache`]: crate::cache::OperatorCache

use std::path::PathBuf;

use authdb_proto::messages::{ClientState, OperatorRecord};
use authdb_proto::WireMessage;
use authdb_store::{StoreError, StoreFile};
use parking_lot::RwLock;
use tracing::debug;

pub struct PersistentState {
    file: Option<StoreFile>,
    state: RwLock<ClientState>,
}

impl PersistentState {
    /// 保存先のない状態
    pub fn in_memory() -> Self {
        PersistentState {
            file: None,
            state: RwLock::new(ClientState::default()),
        }
    }

    /// 状態ファイルを読み込む
    ///
    /// ファイルがなければ空の状態から始める。キャッシュしたオペレーターは
    /// 状態から取り外して返す。
    pub fn load(path: impl Into<PathBuf>) -> Result<(Self, Vec<OperatorRecord>), StoreError> {
        let file = StoreFile::new(path);
        let mut state = match file.read()? {
            Some(bytes) => ClientState::decode_from_bytes(&bytes)?,
            None => ClientState::default(),
        };
        let operators = std::mem::take(&mut state.operators);
        debug!(
            path = %file.path().display(),
            server = ?state.server_id,
            key = ?state.key_id,
            operators = operators.len(),
            "client state loaded"
        );
        Ok((
            PersistentState {
                file: Some(file),
                state: RwLock::new(state),
            },
            operators,
        ))
    }

    pub fn snapshot(&self) -> ClientState {
        self.state.read().clone()
    }

    /// 状態を書き換える（保存はしない）
    pub fn modify<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        f(&mut self.state.write())
    }

    /// オペレーターキャッシュと合わせてファイルに書き出す
    pub fn save(&self, operators: Vec<OperatorRecord>) -> Result<(), StoreError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut state = self.snapshot();
        state.operators = operators;
        file.write(&state.encode_to_bytes())
    }

    /// ピン留めした鍵を忘れる（次回は最新の鍵を要求する）
    pub fn clear_pinned_key(&self) {
        self.modify(|s| {
            s.key_id = None;
            s.public_key.clear();
        });
    }

    /// サーバー登録を忘れる（次回は新規登録する）
    pub fn clear_registration(&self) {
        self.modify(|s| {
            s.server_id = None;
            s.identifier.clear();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (state, operators) = PersistentState::load(dir.path().join("client.db")).unwrap();
        assert!(operators.is_empty());
        assert_eq!(state.snapshot(), ClientState::default());
    }

    #[test]
    fn test_save_and_reload_keeps_operators_separate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        let (state, _) = PersistentState::load(&path).unwrap();
        state.modify(|s| {
            s.server_id = Some(4);
            s.identifier = vec![7; 32];
            s.key_id = Some(2);
        });
        let record = OperatorRecord {
            id: 9,
            username: "bob".into(),
            ..Default::default()
        };
        state.save(vec![record.clone()]).unwrap();

        let (reloaded, operators) = PersistentState::load(&path).unwrap();
        assert_eq!(operators, vec![record]);
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.server_id, Some(4));
        assert_eq!(snapshot.key_id, Some(2));
        assert!(snapshot.operators.is_empty());

        reloaded.clear_registration();
        reloaded.clear_pinned_key();
        let cleared = reloaded.snapshot();
        assert_eq!(cleared.server_id, None);
        assert!(cleared.identifier.is_empty());
        assert_eq!(cleared.key_id, None);
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let state = PersistentState::in_memory();
        assert!(state.save(Vec::new()).is_ok());
    }
}
