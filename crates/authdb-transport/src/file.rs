//! ファイル転送
//!
//! ```text
//! [len: i32]  … FILE_ERROR(-1) なら送信側がファイルを開けなかった
//! [chunk0: <=32KiB][chunk1]...
//! ```
//!
//! 送信側がファイルを開けない・受信側がファイルを作れない場合はどちらも
//! アプリケーションレベルの失敗で、チャンネルは開いたまま。
//! 受信側は書き込みに失敗してもストリームは最後まで読み切る。

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::block::{check_length, chunk_lengths, BLOCK_HASH_LEN, BLOCK_SIZE, FILE_ERROR};
use crate::channel::SecureChannel;
use crate::error::ChannelError;

/// ファイル転送の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// 転送したバイト数
    Transferred(u64),
    /// こちら側のファイル操作が失敗した
    LocalError(String),
    /// 相手側がファイルを開けなかった
    RemoteError,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// ファイルの内容を送る
    ///
    /// 送信途中の読み取り失敗は長さを約束した後なのでチャンネルごと閉じる。
    pub async fn send_file(&mut self, path: &Path) -> Result<FileOutcome, ChannelError> {
        self.check_open()?;
        let result = self.send_file_inner(path).await;
        self.settle(result)
    }

    /// ファイルを受け取り `path` に書き込む
    pub async fn receive_file(&mut self, path: &Path, max: usize) -> Result<FileOutcome, ChannelError> {
        self.check_open()?;
        let result = self.receive_file_inner(path, max).await;
        self.settle(result)
    }

    async fn send_file_inner(&mut self, path: &Path) -> Result<FileOutcome, ChannelError> {
        let opened = async {
            let file = File::open(path).await?;
            let len = file.metadata().await?.len();
            let len = i32::try_from(len).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "file too large to transfer")
            })?;
            Ok::<_, std::io::Error>((file, len))
        };
        let (mut file, len) = match opened.await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open file for transfer");
                self.send_length(FILE_ERROR).await?;
                return Ok(FileOutcome::LocalError(e.to_string()));
            }
        };

        self.send_length(len).await?;
        let mut buf = vec![0u8; (len as usize).min(BLOCK_SIZE)];
        for n in chunk_lengths(len as usize) {
            file.read_exact(&mut buf[..n]).await?;
            self.send_piece(&buf[..n], BLOCK_HASH_LEN).await?;
        }
        Ok(FileOutcome::Transferred(len as u64))
    }

    async fn receive_file_inner(&mut self, path: &Path, max: usize) -> Result<FileOutcome, ChannelError> {
        let raw = self.recv_length().await?;
        if raw == FILE_ERROR {
            return Ok(FileOutcome::RemoteError);
        }
        let len = check_length(raw, max)?;

        let mut local_error = None;
        let mut file = match File::create(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot create file; draining transfer");
                local_error = Some(e.to_string());
                None
            }
        };

        for n in chunk_lengths(len) {
            let chunk = self.recv_piece(n, BLOCK_HASH_LEN).await?;
            if let Some(f) = file.as_mut() {
                if let Err(e) = f.write_all(&chunk).await {
                    warn!(path = %path.display(), error = %e, "write failed; draining transfer");
                    local_error = Some(e.to_string());
                    file = None;
                }
            }
        }

        if let Some(mut f) = file {
            if let Err(e) = f.flush().await {
                local_error = Some(e.to_string());
            } else if let Err(e) = f.sync_all().await {
                local_error = Some(e.to_string());
            }
        }

        Ok(match local_error {
            Some(reason) => FileOutcome::LocalError(reason),
            None => FileOutcome::Transferred(len as u64),
        })
    }
}
