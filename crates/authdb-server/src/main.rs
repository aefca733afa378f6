//! authdb-server バイナリ
//!
//! ```text
//! authdb-server --data-dir /var/lib/authdb [--port 1978]
//! AUTHDB_ADMIN_PASSWORD=... authdb-server --bootstrap-admin alice
//! authdb-server --backup
//! ```
//!
//! ログレベルは `RUST_LOG` で指定する（既定は `info`）。

use std::path::PathBuf;

use anyhow::Context;
use authdb_server::{backup, Database};
use authdb_store::ConfigUpdate;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 初回管理者のパスワードを渡す環境変数
const ADMIN_PASSWORD_ENV: &str = "AUTHDB_ADMIN_PASSWORD";

#[derive(Debug, Parser)]
#[command(name = "authdb-server", version, about = "Operator credential database")]
struct Args {
    /// ストアファイルを置くディレクトリ
    #[arg(long, default_value = "authdb-data")]
    data_dir: PathBuf,

    /// 待ち受けポート（設定ファイルにも保存される）
    #[arg(long)]
    port: Option<u16>,

    /// オペレーターがいなければこの名前で管理者を作る
    #[arg(long, value_name = "USERNAME")]
    bootstrap_admin: Option<String>,

    /// バックアップを 1 回取って終了する
    #[arg(long)]
    backup: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let db = Database::open(&args.data_dir)
        .with_context(|| format!("failed to open data directory {}", args.data_dir.display()))?;

    if let Some(port) = args.port {
        db.config()
            .update(&ConfigUpdate {
                port: Some(port),
                ..Default::default()
            })
            .context("invalid --port")?;
    }

    if let Some(username) = &args.bootstrap_admin {
        let password = std::env::var(ADMIN_PASSWORD_ENV)
            .with_context(|| format!("{ADMIN_PASSWORD_ENV} must be set with --bootstrap-admin"))?;
        db.bootstrap_admin(username, &password, username)
            .context("failed to create the bootstrap administrator")?;
    }

    if args.backup {
        let dir = backup::backup_now(&db)?;
        info!(dir = %dir.display(), "backup written");
        return Ok(());
    }

    let key = db.ensure_preferred_key().await?;
    info!(key = key.id(), fingerprint = key.fingerprint(), "preferred key ready");

    let signal_db = db.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_db.shutdown();
        }
    });

    db.run().await?;
    info!("database stopped");
    Ok(())
}
