//! 鍵リング
//!
//! ハンドシェイクで使う RSA 鍵を ID 付きで保持する。最も新しい鍵が優先鍵で、
//! 新しいハンドシェイクは優先鍵を使う。古い鍵も残しておき、まだ移行していない
//! クライアントが古い鍵 ID でハンドシェイクできるようにする。
//!
//! 秘密鍵はローカルのストアファイルにだけ保存し、ネットワークには出さない。

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use authdb_crypto::rsa::{
    fingerprint, generate_private_key, private_key_from_der, private_key_to_der, public_key_to_der,
};
use authdb_crypto::{RsaPrivateKey, RsaPublicKey};
use authdb_proto::messages::{KeyRecord, KeyRingRecord};
use authdb_proto::WireMessage;
use parking_lot::RwLock;
use tracing::info;

use crate::error::StoreError;
use crate::persist::StoreFile;

/// ハンドシェイクで「最新の鍵」を要求する鍵 ID
pub const LATEST_KEY: i32 = -1;

/// 鍵リングの鍵 1 つ
pub struct Key {
    id: i32,
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_der: Vec<u8>,
    fingerprint: OnceLock<String>,
}

impl Key {
    fn new(id: i32, private: RsaPrivateKey) -> Result<Self, StoreError> {
        let public = private.to_public_key();
        let public_der = public_key_to_der(&public)?;
        Ok(Key {
            id,
            private,
            public,
            public_der,
            fingerprint: OnceLock::new(),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// 公開鍵の PKCS#1 DER（ハンドシェイクで送る）
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    /// 公開鍵のフィンガープリント（初回アクセス時に計算）
    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| fingerprint(&self.public_der))
    }

    fn record(&self) -> Result<KeyRecord, StoreError> {
        Ok(KeyRecord {
            id: self.id,
            private_der: private_key_to_der(&self.private)?,
        })
    }
}

impl core::fmt::Debug for Key {
    // 秘密鍵は出力しない
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// ID 順に並んだ鍵の集合
#[derive(Debug)]
pub struct KeyRing {
    file: StoreFile,
    /// ID の昇順。末尾が優先鍵
    keys: RwLock<Vec<Arc<Key>>>,
}

impl KeyRing {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = StoreFile::new(path);
        let mut keys = Vec::new();
        if let Some(bytes) = file.read()? {
            for record in KeyRingRecord::decode_from_bytes(&bytes)?.keys {
                let private = private_key_from_der(&record.private_der)?;
                keys.push(Arc::new(Key::new(record.id, private)?));
            }
        }
        keys.sort_by_key(|k| k.id());
        keys.dedup_by_key(|k| k.id());
        info!(keys = keys.len(), "key ring loaded");
        Ok(KeyRing {
            file,
            keys: RwLock::new(keys),
        })
    }

    /// 新しい鍵を生成して優先鍵にし、保存する
    ///
    /// 鍵生成はロックの外で行う。数秒かかるため非同期コンテキストからは
    /// `spawn_blocking` 経由で呼ぶこと。
    pub fn generate_new_key(&self, bits: usize) -> Result<Arc<Key>, StoreError> {
        let private = generate_private_key(bits)?;
        let key = {
            let mut keys = self.keys.write();
            let id = keys.last().map_or(0, |k| k.id() + 1);
            let key = Arc::new(Key::new(id, private)?);
            keys.push(key.clone());
            key
        };
        info!(key = key.id(), fingerprint = key.fingerprint(), "generated new preferred key");
        self.save()?;
        Ok(key)
    }

    pub fn get(&self, id: i32) -> Option<Arc<Key>> {
        self.keys.read().iter().find(|k| k.id() == id).cloned()
    }

    /// 最新（優先）の鍵
    pub fn preferred(&self) -> Option<Arc<Key>> {
        self.keys.read().last().cloned()
    }

    /// ハンドシェイクで要求された鍵 ID を解決する（`LATEST_KEY` なら優先鍵）
    pub fn lookup(&self, requested: i32) -> Option<Arc<Key>> {
        if requested == LATEST_KEY {
            self.preferred()
        } else {
            self.get(requested)
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.keys.read().iter().any(|k| k.id() == id)
    }

    pub fn is_preferred(&self, id: i32) -> bool {
        self.keys.read().last().is_some_and(|k| k.id() == id)
    }

    pub fn ids(&self) -> Vec<i32> {
        self.keys.read().iter().map(|k| k.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let keys: Vec<Arc<Key>> = self.keys.read().clone();
        let record = KeyRingRecord {
            keys: keys.iter().map(|k| k.record()).collect::<Result<_, _>>()?,
        };
        self.file.write(&record.encode_to_bytes())
    }

    pub fn file(&self) -> &StoreFile {
        &self.file
    }
}
