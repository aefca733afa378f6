//! ストアファイルの原子的な読み書き
//!
//! 書き込みは `<name>.tmp` に書いて fsync してから rename する。
//! 途中でプロセスが落ちても元のファイルか新しいファイルのどちらかが残る。
//! 同じファイルへの書き込みはファイルごとの Mutex で直列化する。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::StoreError;

/// 1 つのストアファイル
#[derive(Debug)]
pub struct StoreFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StoreFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreFile {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ファイル全体を読む。存在しなければ `None`
    pub fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.lock.lock();
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// ファイル全体を原子的に置き換える
    pub fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// 現在の内容を `dest` にコピーする（バックアップ用）。存在しなければ false
    pub fn copy_to(&self, dest: &Path) -> Result<bool, StoreError> {
        let _guard = self.lock.lock();
        match fs::copy(&self.path, dest) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = StoreFile::new(dir.path().join("operators.db"));
        assert_eq!(file.read().unwrap(), None);
    }

    #[test]
    fn test_write_replaces_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let file = StoreFile::new(dir.path().join("nested").join("servers.db"));
        file.write(b"first").unwrap();
        file.write(b"second").unwrap();
        assert_eq!(file.read().unwrap().as_deref(), Some(&b"second"[..]));
        assert!(!dir.path().join("nested").join("servers.db.tmp").exists());
    }

    #[test]
    fn test_copy_to() {
        let dir = tempfile::tempdir().unwrap();
        let file = StoreFile::new(dir.path().join("keys.db"));
        let dest = dir.path().join("backup.db");
        assert!(!file.copy_to(&dest).unwrap());
        file.write(b"keys").unwrap();
        assert!(file.copy_to(&dest).unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"keys");
    }
}
