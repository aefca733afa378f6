//! 登録サーバーのレジストリ

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use authdb_crypto::password::constant_time_eq;
use authdb_crypto::random_array;
use authdb_proto::messages::{ServerInfo, ServerParams, ServerRecord, ServerTable};
use authdb_proto::WireMessage;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::arena::{Arena, Tombstone};
use crate::error::StoreError;
use crate::persist::StoreFile;
use crate::{IDENTIFIER_LEN, MAX_NAME_LENGTH};

#[derive(Debug, Clone)]
struct ServerData {
    name: String,
    description: String,
    ip: String,
    identifier: [u8; IDENTIFIER_LEN],
    created: i64,
}

/// 登録済みのリモートサーバー
#[derive(Debug)]
pub struct Server {
    id: u32,
    data: RwLock<ServerData>,
    /// このサーバーとしてログイン中のコネクションがあるか
    connected: AtomicBool,
    disposed: AtomicBool,
}

impl Tombstone for Server {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Server {
    fn from_record(record: ServerRecord) -> Option<Self> {
        let identifier: [u8; IDENTIFIER_LEN] = record.identifier.as_slice().try_into().ok()?;
        Some(Server {
            id: record.id,
            data: RwLock::new(ServerData {
                name: record.name,
                description: record.description,
                ip: record.ip,
                identifier,
                created: record.created,
            }),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> String {
        self.data.read().name.clone()
    }

    pub fn description(&self) -> String {
        self.data.read().description.clone()
    }

    pub fn ip(&self) -> String {
        self.data.read().ip.clone()
    }

    /// 登録時に払い出した識別子（暗号化済みチャンネルでのみ送る）
    pub fn identifier(&self) -> [u8; IDENTIFIER_LEN] {
        self.data.read().identifier
    }

    /// 再接続時に提示された識別子を定数時間で照合する
    pub fn verify_identifier(&self, presented: &[u8]) -> bool {
        constant_time_eq(&self.data.read().identifier, presented)
    }

    pub fn params(&self) -> ServerParams {
        let d = self.data.read();
        ServerParams {
            name: d.name.clone(),
            description: d.description.clone(),
        }
    }

    pub fn info(&self) -> ServerInfo {
        let d = self.data.read();
        ServerInfo {
            id: self.id,
            name: d.name.clone(),
            description: d.description.clone(),
            ip: d.ip.clone(),
            created: d.created,
            connected: self.is_connected(),
        }
    }

    pub fn record(&self) -> ServerRecord {
        let d = self.data.read();
        ServerRecord {
            id: self.id,
            name: d.name.clone(),
            description: d.description.clone(),
            ip: d.ip.clone(),
            identifier: d.identifier.to_vec(),
            created: d.created,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        Tombstone::is_disposed(self)
    }

    /// 接続中にする。すでに接続中・削除済みなら false
    pub fn connect(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn set_description(&self, description: &str) {
        self.data.write().description = description.to_string();
    }

    /// 再接続元のアドレスを記録する
    pub fn set_ip(&self, ip: &str) {
        self.data.write().ip = ip.to_string();
    }

    fn set_name(&self, name: &str) {
        self.data.write().name = name.to_string();
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// サーバー名を検証して正規化する（前後の空白を除く。内部の空白は許す）
fn normalize_name(name: &str) -> Result<String, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.chars().count() > MAX_NAME_LENGTH
        || trimmed.chars().any(char::is_control)
    {
        return Err(StoreError::InvalidServerName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug)]
struct Table {
    arena: Arena<Server>,
    by_name: HashMap<String, u32>,
}

/// 登録サーバーのスレッド安全なテーブル
#[derive(Debug)]
pub struct ServerRegistry {
    file: StoreFile,
    table: RwLock<Table>,
}

impl ServerRegistry {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = StoreFile::new(path);
        let mut table = Table {
            arena: Arena::new(),
            by_name: HashMap::new(),
        };
        if let Some(bytes) = file.read()? {
            for record in ServerTable::decode_from_bytes(&bytes)?.servers {
                let (id, name) = (record.id, record.name.clone());
                if table.by_name.contains_key(&name) {
                    warn!(server = id, name = %name, "skipping server with duplicate name");
                    continue;
                }
                match Server::from_record(record) {
                    Some(server) => {
                        table.arena.place(id, Arc::new(server));
                        table.by_name.insert(name, id);
                    }
                    None => warn!(server = id, "skipping server with malformed identifier"),
                }
            }
        }
        info!(servers = table.by_name.len(), "server registry loaded");
        Ok(ServerRegistry {
            file,
            table: RwLock::new(table),
        })
    }

    /// 新しいサーバーを登録し、ランダムな識別子を払い出す
    pub fn register(&self, name: &str, description: &str, ip: &str, now: i64) -> Result<Arc<Server>, StoreError> {
        let name = normalize_name(name)?;
        let identifier = random_array::<IDENTIFIER_LEN>()?;

        let mut table = self.table.write();
        if table.by_name.contains_key(&name) {
            return Err(StoreError::ServerNameTaken(name));
        }
        let server = table.arena.insert_with(|id| Server {
            id,
            data: RwLock::new(ServerData {
                name: name.clone(),
                description: description.to_string(),
                ip: ip.to_string(),
                identifier,
                created: now,
            }),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        table.by_name.insert(name, server.id());
        debug!(server = server.id(), "server registered");
        Ok(server)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Server>> {
        self.table.read().arena.get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Server>> {
        let table = self.table.read();
        table.by_name.get(name.trim()).and_then(|&id| table.arena.get(id)).cloned()
    }

    pub fn rename(&self, server: &Server, name: &str) -> Result<(), StoreError> {
        let name = normalize_name(name)?;
        let mut table = self.table.write();
        if server.is_disposed() {
            return Err(StoreError::InvalidServerName(name));
        }
        if matches!(table.by_name.get(&name), Some(&id) if id != server.id()) {
            return Err(StoreError::ServerNameTaken(name));
        }
        table.by_name.remove(&server.name());
        table.by_name.insert(name.clone(), server.id());
        server.set_name(&name);
        Ok(())
    }

    /// サーバーを削除する（tombstone として残り、次の `save()` で回収される）
    pub fn remove(&self, id: u32) -> Option<Arc<Server>> {
        let mut table = self.table.write();
        let server = table.arena.get(id).cloned()?;
        server.dispose();
        let name = server.name();
        if table.by_name.get(&name) == Some(&id) {
            table.by_name.remove(&name);
        }
        Some(server)
    }

    pub fn len(&self) -> usize {
        self.table.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 読み取りロックを保持したまま各サーバーを処理する（ストアを変更しないこと）
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Server>)) {
        let table = self.table.read();
        for server in table.arena.live() {
            f(server);
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Server>> {
        self.table.read().arena.live().cloned().collect()
    }

    /// 全サーバーを未接続に戻す（再起動時）
    pub fn disconnect_all(&self) {
        self.for_each(|server| server.disconnect());
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let live: Vec<Arc<Server>> = {
            let mut table = self.table.write();
            table.arena.collect_tombstones();
            table.arena.live().cloned().collect()
        };
        let table = ServerTable {
            servers: live.iter().map(|s| s.record()).collect(),
        };
        self.file.write(&table.encode_to_bytes())
    }

    pub fn file(&self) -> &StoreFile {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, ServerRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServerRegistry::load(dir.path().join("servers.db")).unwrap();
        (dir, registry)
    }

    #[test]
    fn test_register_and_lookup() {
        let (_dir, registry) = registry();
        let s = registry.register("  Front Desk ", "lobby", "10.0.0.5", 7).unwrap();
        assert_eq!(s.name(), "Front Desk");
        assert_eq!(registry.get_by_name("Front Desk").unwrap().id(), s.id());
        assert!(registry.get_by_name("front desk").is_none(), "名前は完全一致");
        assert!(matches!(
            registry.register("Front Desk", "", "10.0.0.6", 8),
            Err(StoreError::ServerNameTaken(_))
        ));
    }

    #[test]
    fn test_identifiers_are_random_and_verified() {
        let (_dir, registry) = registry();
        let a = registry.register("a", "", "", 0).unwrap();
        let b = registry.register("b", "", "", 0).unwrap();
        assert_ne!(a.identifier(), b.identifier());
        assert!(a.verify_identifier(&a.identifier()));
        assert!(!a.verify_identifier(&b.identifier()));
        assert!(!a.verify_identifier(&a.identifier()[..16]));
    }

    #[test]
    fn test_connect_is_exclusive() {
        let (_dir, registry) = registry();
        let s = registry.register("kiosk", "", "", 0).unwrap();
        assert!(s.connect());
        assert!(!s.connect());
        s.disconnect();
        assert!(s.connect());

        registry.remove(s.id());
        s.disconnect();
        assert!(!s.connect(), "削除済みのサーバーには接続できない");
    }

    #[test]
    fn test_rename_and_remove() {
        let (_dir, registry) = registry();
        let a = registry.register("alpha", "", "", 0).unwrap();
        registry.register("beta", "", "", 0).unwrap();
        assert!(matches!(registry.rename(&a, "beta"), Err(StoreError::ServerNameTaken(_))));
        registry.rename(&a, "gamma").unwrap();
        assert!(registry.get_by_name("alpha").is_none());

        registry.remove(a.id());
        assert!(registry.get(a.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.db");
        let registry = ServerRegistry::load(&path).unwrap();
        let a = registry.register("one", "first", "1.1.1.1", 1).unwrap();
        let b = registry.register("two", "second", "2.2.2.2", 2).unwrap();
        assert!(a.connect());
        registry.remove(b.id());
        registry.save().unwrap();

        let reloaded = ServerRegistry::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        let one = reloaded.get(a.id()).unwrap();
        assert_eq!(one.identifier(), a.identifier());
        assert_eq!(one.description(), "first");
        assert!(!one.is_connected(), "接続状態は保存しない");
    }
}
