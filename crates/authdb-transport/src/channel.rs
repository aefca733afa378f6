//! Secure Channel 実装
//!
//! 1 本のバイトストリーム（TCP ソケット、テストでは `tokio::io::duplex`）の上に
//! 以下を提供する。
//!
//! - 1 バイト交換（オペコード・ステータス・ハンドシェイクコード）
//! - 固定長ユニット（整数・識別子。長さは双方が既知）
//! - ブロック（長さ付き可変長データ。受信側が上限を指定）
//! - ファイル転送（`file.rs`）
//!
//! 生成直後は平文モード。`rekey()` でセッション鍵を設定すると暗号化モードになり、
//! 以後のユニットはすべて状態ハッシュで検証される（`block.rs` の Wire Format 参照）。
//!
//! どの操作もエラーになった時点でチャンネルは閉じられ、以後の操作は
//! `ChannelError::Closed` で失敗する。

use std::time::Duration;

use authdb_crypto::{password::constant_time_eq, StreamCipher};
use authdb_proto::{ProtoError, WireMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::block::{
    ack_bytes, check_length, chunk_lengths, encode_length, parse_ack, BLOCK_HASH_LEN,
    BYTE_HASH_LEN, MAX_ATTEMPTS,
};
use crate::error::ChannelError;

/// 暗号化時に鍵発展関数の追加ステップを使う
const CIPHER_EXTRA_STEP: bool = true;

/// 暗号化・整合性検証付きの双方向チャンネル
pub struct SecureChannel<S> {
    /// 下位のバイトストリーム
    stream: S,
    /// セッション鍵で初期化した暗号（平文モードでは None）
    cipher: Option<StreamCipher>,
    /// 1 回の読み書きのタイムアウト
    timeout: Duration,
    /// エラー発生・shutdown 後は true
    closed: bool,
    /// 送信した総バイト数（統計用）
    bytes_sent: u64,
    /// 受信した総バイト数（統計用）
    bytes_received: u64,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// 平文モードのチャンネルを生成する
    pub fn new(stream: S, timeout: Duration) -> Self {
        SecureChannel {
            stream,
            cipher: None,
            timeout,
            closed: false,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// セッション鍵を設定して暗号化モードに切り替える
    ///
    /// 両端が同じ地点で同じ鍵を設定すること。
    pub fn rekey(&mut self, session_key: &[u8]) -> Result<(), ChannelError> {
        self.check_open()?;
        let result = StreamCipher::from_slice(session_key, CIPHER_EXTRA_STEP)
            .map(|cipher| self.cipher = Some(cipher))
            .map_err(ChannelError::from);
        self.settle(result)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// 送信した総バイト数（確認応答を含む）
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// 受信した総バイト数（確認応答を含む）
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// 現在の暗号状態のフィンガープリント（平文モードでは None）
    ///
    /// 同じ呼び出し列を処理した両端では一致する。
    pub fn session_hash(&self, len: usize) -> Option<Vec<u8>> {
        self.cipher.as_ref().map(|c| c.hash(len))
    }

    // ==============================================================
    // 1 バイト交換
    // ==============================================================

    pub async fn write_byte(&mut self, byte: u8) -> Result<(), ChannelError> {
        self.check_open()?;
        let result = self.send_piece(&[byte], BYTE_HASH_LEN).await;
        self.settle(result)
    }

    pub async fn read_byte(&mut self) -> Result<u8, ChannelError> {
        self.check_open()?;
        let result = self.recv_piece(1, BYTE_HASH_LEN).await.map(|b| b[0]);
        self.settle(result)
    }

    /// オペコード・ステータスなど 1 バイトの列挙値を送る
    pub async fn write_opcode<T: Into<u8>>(&mut self, code: T) -> Result<(), ChannelError> {
        self.write_byte(code.into()).await
    }

    /// 1 バイトの列挙値を受け取る
    ///
    /// 未定義の値は `ChannelError::Decode` としてチャンネルを閉じる。
    pub async fn read_opcode<T>(&mut self) -> Result<T, ChannelError>
    where
        T: TryFrom<u8, Error = ProtoError>,
    {
        let byte = self.read_byte().await?;
        let result = T::try_from(byte).map_err(ChannelError::from);
        self.settle(result)
    }

    /// 一時的に別のタイムアウトで 1 バイトの列挙値を待つ
    ///
    /// ping 待ちのように通常のタイムアウトより長く待つ読み取りに使う。
    pub async fn read_opcode_within<T>(&mut self, limit: Duration) -> Result<T, ChannelError>
    where
        T: TryFrom<u8, Error = ProtoError>,
    {
        let saved = std::mem::replace(&mut self.timeout, limit);
        let result = self.read_opcode().await;
        self.timeout = saved;
        result
    }

    // ==============================================================
    // 固定長ユニット
    // ==============================================================

    /// 長さを送らない固定長ユニットを送る（受信側は同じ長さを指定する）
    pub async fn write_fixed(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.check_open()?;
        let result = self.send_chunks(data).await;
        self.settle(result)
    }

    /// 長さ `len` の固定長ユニットを受け取る
    pub async fn read_fixed(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        self.check_open()?;
        let result = self.recv_chunks(len).await;
        self.settle(result)
    }

    pub async fn write_int(&mut self, value: i32) -> Result<(), ChannelError> {
        self.write_fixed(&value.to_be_bytes()).await
    }

    pub async fn read_int(&mut self) -> Result<i32, ChannelError> {
        let bytes = self.read_fixed(4).await?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// オペレーター ID・サーバー ID
    pub async fn write_u32(&mut self, value: u32) -> Result<(), ChannelError> {
        self.write_fixed(&value.to_be_bytes()).await
    }

    pub async fn read_u32(&mut self) -> Result<u32, ChannelError> {
        let bytes = self.read_fixed(4).await?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub async fn write_long(&mut self, value: i64) -> Result<(), ChannelError> {
        self.write_fixed(&value.to_be_bytes()).await
    }

    pub async fn read_long(&mut self) -> Result<i64, ChannelError> {
        let bytes = self.read_fixed(8).await?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(i64::from_be_bytes(buf))
    }

    // ==============================================================
    // ブロック
    // ==============================================================

    /// 長さ付きブロックを送る
    pub async fn write_block(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.check_open()?;
        let result = self.send_block(data).await;
        self.settle(result)
    }

    /// 長さ付きブロックを受け取る
    ///
    /// # エラー
    /// - `ChannelError::LengthOutOfRange`: 長さが負、または `max` を超える
    pub async fn read_block(&mut self, max: usize) -> Result<Vec<u8>, ChannelError> {
        self.check_open()?;
        let result = self.recv_block(max).await;
        self.settle(result)
    }

    pub async fn write_string(&mut self, text: &str) -> Result<(), ChannelError> {
        self.write_block(text.as_bytes()).await
    }

    pub async fn read_string(&mut self, max: usize) -> Result<String, ChannelError> {
        let bytes = self.read_block(max).await?;
        let result = String::from_utf8(bytes).map_err(|_| ChannelError::InvalidUtf8);
        self.settle(result)
    }

    /// prost メッセージを 1 ブロックとして送る
    pub async fn write_message<M: WireMessage>(&mut self, message: &M) -> Result<(), ChannelError> {
        self.write_block(&message.encode_to_bytes()).await
    }

    /// prost メッセージを 1 ブロックとして受け取る
    pub async fn read_message<M: WireMessage>(&mut self, max: usize) -> Result<M, ChannelError> {
        let bytes = self.read_block(max).await?;
        let result = M::decode_from_bytes(&bytes).map_err(ChannelError::from);
        self.settle(result)
    }

    /// ストリームを閉じる（エラーは無視する）
    pub async fn shutdown(&mut self) {
        self.closed = true;
        let limit = self.timeout;
        match tokio::time::timeout(limit, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "shutdown of secure channel failed"),
            Err(_) => debug!("shutdown of secure channel timed out"),
        }
    }

    // ==============================================================
    // 内部: 状態管理
    // ==============================================================

    pub(crate) fn check_open(&self) -> Result<(), ChannelError> {
        if self.closed {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }

    /// エラーならチャンネルを閉じて結果をそのまま返す
    pub(crate) fn settle<T>(&mut self, result: Result<T, ChannelError>) -> Result<T, ChannelError> {
        if let Err(e) = &result {
            if !self.closed {
                debug!(error = %e, "closing secure channel");
            }
            self.closed = true;
        }
        result
    }

    fn cipher_mut(&mut self) -> Result<&mut StreamCipher, ChannelError> {
        self.cipher.as_mut().ok_or(ChannelError::NotEncrypted)
    }

    // ==============================================================
    // 内部: ブロック・チャンク
    // ==============================================================

    pub(crate) async fn send_length(&mut self, length: i32) -> Result<(), ChannelError> {
        self.send_piece(&length.to_be_bytes(), BLOCK_HASH_LEN).await
    }

    pub(crate) async fn recv_length(&mut self) -> Result<i32, ChannelError> {
        let bytes = self.recv_piece(4, BLOCK_HASH_LEN).await?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn send_block(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let length = encode_length(data.len())?;
        self.send_piece(&length, BLOCK_HASH_LEN).await?;
        self.send_chunks(data).await
    }

    async fn recv_block(&mut self, max: usize) -> Result<Vec<u8>, ChannelError> {
        let raw = self.recv_length().await?;
        let len = check_length(raw, max)?;
        self.recv_chunks(len).await
    }

    /// `BLOCK_SIZE` ごとに区切って送る
    pub(crate) async fn send_chunks(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let mut offset = 0;
        for n in chunk_lengths(data.len()) {
            self.send_piece(&data[offset..offset + n], BLOCK_HASH_LEN).await?;
            offset += n;
        }
        Ok(())
    }

    pub(crate) async fn recv_chunks(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        let mut out = Vec::with_capacity(len);
        for n in chunk_lengths(len) {
            out.extend_from_slice(&self.recv_piece(n, BLOCK_HASH_LEN).await?);
        }
        Ok(out)
    }

    // ==============================================================
    // 内部: 検証ユニット
    // ==============================================================

    /// 1 ユニットを送る（平文モードではそのまま、暗号化モードでは検証付き）
    pub(crate) async fn send_piece(&mut self, payload: &[u8], hash_len: usize) -> Result<(), ChannelError> {
        if self.cipher.is_none() {
            return self.send_raw(payload).await;
        }

        let ack_len = ack_bytes(true, hash_len).len();
        for attempt in 1..=MAX_ATTEMPTS {
            let frame = {
                let cipher = self.cipher_mut()?;
                cipher.mark();
                let mut frame = payload.to_vec();
                cipher.encrypt_in_place(&mut frame);
                let mut hash = cipher.hash(hash_len);
                cipher.encrypt_in_place(&mut hash);
                frame.extend_from_slice(&hash);
                frame
            };
            self.send_raw(&frame).await?;

            let ack = self.recv_raw(ack_len).await?;
            match parse_ack(&ack) {
                Some(true) => return Ok(()),
                Some(false) => {
                    self.cipher_mut()?.reset();
                    warn!(attempt, len = payload.len(), "peer rejected unit hash; resending");
                }
                None => return Err(ChannelError::UnexpectedAck(ack)),
            }
        }
        Err(ChannelError::IntegrityFailure {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// 長さ `len` のユニットを受け取る
    pub(crate) async fn recv_piece(&mut self, len: usize, hash_len: usize) -> Result<Vec<u8>, ChannelError> {
        if self.cipher.is_none() {
            return self.recv_raw(len).await;
        }

        for attempt in 1..=MAX_ATTEMPTS {
            let mut frame = self.recv_raw(len + hash_len).await?;
            let accepted = {
                let cipher = self.cipher_mut()?;
                cipher.mark();
                cipher.decrypt_in_place(&mut frame[..len]);
                let expected = cipher.hash(hash_len);
                cipher.decrypt_in_place(&mut frame[len..]);
                let accepted = constant_time_eq(&expected, &frame[len..]);
                if !accepted {
                    cipher.reset();
                }
                accepted
            };
            self.send_raw(ack_bytes(accepted, hash_len)).await?;

            if accepted {
                frame.truncate(len);
                return Ok(frame);
            }
            warn!(attempt, len, "unit hash mismatch; requesting resend");
        }
        Err(ChannelError::IntegrityFailure {
            attempts: MAX_ATTEMPTS,
        })
    }

    // ==============================================================
    // 内部: ソケット I/O
    // ==============================================================

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let limit = self.timeout;
        let stream = &mut self.stream;
        let io = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(limit, io).await {
            Ok(result) => result?,
            Err(_) => return Err(ChannelError::Timeout(limit)),
        }
        self.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    async fn recv_raw(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        let limit = self.timeout;
        let mut buf = vec![0u8; len];
        match tokio::time::timeout(limit, self.stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::ConnectionClosed)
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ChannelError::Timeout(limit)),
        }
        self.bytes_received += len as u64;
        Ok(buf)
    }
}

impl<S> core::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("encrypted", &self.cipher.is_some())
            .field("closed", &self.closed)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_received", &self.bytes_received)
            .finish()
    }
}
