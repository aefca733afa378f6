//! 定期バックアップ
//!
//! `backup_interval_minutes` ごとに全ストアを保存し、ストアファイルを
//! `backups/<タイムスタンプ>/` へコピーする。古いものから消して
//! `backup_retain` 個だけ残す。間隔が 0 なら何もしない。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use authdb_store::StoreFile;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::ServerError;
use crate::BACKUP_DIR;

/// 無効時に設定を見直す間隔
const IDLE_RECHECK: Duration = Duration::from_secs(60);

/// バックアップタスク（サービスの停止時に abort される）
pub(crate) async fn run_backups(db: Arc<Database>) {
    loop {
        let minutes = db.config().get().backup_interval_minutes;
        if minutes == 0 {
            tokio::time::sleep(IDLE_RECHECK).await;
            continue;
        }
        tokio::time::sleep(Duration::from_secs(minutes.saturating_mul(60))).await;

        let worker = db.clone();
        match tokio::task::spawn_blocking(move || backup_now(&worker)).await {
            Ok(Ok(dir)) => info!(dir = %dir.display(), "backup written"),
            Ok(Err(e)) => warn!(error = %e, "backup failed"),
            Err(e) => warn!(error = %e, "backup task failed"),
        }
    }
}

/// 今すぐバックアップを取り、作成したディレクトリを返す
pub fn backup_now(db: &Database) -> Result<PathBuf, ServerError> {
    db.save_all();
    let root = db.data_dir().join(BACKUP_DIR);
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let dir = root.join(stamp);
    std::fs::create_dir_all(&dir)?;

    let files: [&StoreFile; 3] = [db.config().file(), db.servers().file(), db.keys().file()];
    for file in files.into_iter().chain(db.operators().file()) {
        let Some(name) = file.path().file_name() else {
            continue;
        };
        if !file.copy_to(&dir.join(name))? {
            debug!(file = %file.path().display(), "store file missing, not backed up");
        }
    }

    prune(&root, db.config().get().backup_retain)?;
    Ok(dir)
}

/// 新しいものから `retain` 個を残して削除する（名前順 = 時刻順）
fn prune(root: &std::path::Path, retain: usize) -> Result<(), ServerError> {
    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    snapshots.sort();
    let excess = snapshots.len().saturating_sub(retain);
    for old in snapshots.into_iter().take(excess) {
        debug!(dir = %old.display(), "removing old backup");
        std::fs::remove_dir_all(old)?;
    }
    Ok(())
}
