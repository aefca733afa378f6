//! ブロック転送のワイヤ定数と分割
//!
//! ## 暗号化モードの Wire Format
//! ```text
//! 1 バイト交換:
//!   [enc(byte): 1][enc(hash(1)): 1]            → 相手から [ack: 1]
//!
//! 固定長ユニット（長さは双方が既知）:
//!   [enc(payload): n][enc(hash(4)): 4]         → 相手から [ack: 4]
//!
//! ブロック（長さ可変）:
//!   [enc(len: i32 BE): 4][enc(hash(4)): 4]     → [ack: 4]
//!   [enc(chunk0): <=32KiB][enc(hash(4)): 4]    → [ack: 4]
//!   ...
//! ```
//!
//! ack は平文で送る。不一致を検出した側の暗号状態は信用できないため。
//!
//! ## 平文モード（ハンドシェイク前半）
//! ```text
//! 1 バイト: [byte]
//! ブロック: [len: i32 BE][payload]
//! ```

use crate::error::ChannelError;

/// 1 チャンクの最大長（1 回の I/O 待ちを抑える）
pub const BLOCK_SIZE: usize = 32 * 1024;

/// ブロック・固定長ユニットに付ける状態ハッシュの長さ
pub const BLOCK_HASH_LEN: usize = 4;

/// 1 バイト交換に付ける状態ハッシュの長さ
pub const BYTE_HASH_LEN: usize = 1;

/// ハッシュ不一致時の最大試行回数
pub const MAX_ATTEMPTS: u32 = 3;

/// ブロックの確認応答（一致）
pub const HASH_COMPARISON_SUCCESS_ARRAY: [u8; 4] = [0x5A, 0xC3, 0x3C, 0xA5];

/// ブロックの確認応答（不一致）
pub const HASH_COMPARISON_FAILURE_ARRAY: [u8; 4] = [0xA5, 0x3C, 0xC3, 0x5A];

/// 1 バイト交換の確認応答（一致）
pub const BYTE_ACK_SUCCESS: u8 = 0x5A;

/// 1 バイト交換の確認応答（不一致）
pub const BYTE_ACK_FAILURE: u8 = 0xA5;

/// ファイル送信側がファイルを開けなかったことを示す長さ
pub const FILE_ERROR: i32 = -1;

/// ハッシュ長に対応する確認応答バイト列
pub fn ack_bytes(accepted: bool, hash_len: usize) -> &'static [u8] {
    match (accepted, hash_len) {
        (true, BYTE_HASH_LEN) => &[BYTE_ACK_SUCCESS],
        (false, BYTE_HASH_LEN) => &[BYTE_ACK_FAILURE],
        (true, _) => &HASH_COMPARISON_SUCCESS_ARRAY,
        (false, _) => &HASH_COMPARISON_FAILURE_ARRAY,
    }
}

/// 受け取った確認応答を解釈する
///
/// # 戻り値
/// - `Some(true)`: 一致
/// - `Some(false)`: 不一致（巻き戻して再送）
/// - `None`: どちらでもない（チャンネルを閉じる）
pub fn parse_ack(bytes: &[u8]) -> Option<bool> {
    match bytes {
        [BYTE_ACK_SUCCESS] => Some(true),
        [BYTE_ACK_FAILURE] => Some(false),
        b if b == HASH_COMPARISON_SUCCESS_ARRAY => Some(true),
        b if b == HASH_COMPARISON_FAILURE_ARRAY => Some(false),
        _ => None,
    }
}

/// ブロック長を長さフィールドに変換する
///
/// # エラー
/// - `ChannelError::LengthOutOfRange`: i32 に収まらない
pub fn encode_length(len: usize) -> Result<[u8; 4], ChannelError> {
    let len = i32::try_from(len).map_err(|_| ChannelError::LengthOutOfRange {
        length: len as i64,
        max: i32::MAX as usize,
    })?;
    Ok(len.to_be_bytes())
}

/// 受信した長さフィールドを検証する
///
/// 信頼できない相手から巨大なメモリ確保を強いられないよう、
/// 呼び出し側が指定した上限を超える長さは拒否する。
pub fn check_length(raw: i32, max: usize) -> Result<usize, ChannelError> {
    if raw < 0 || raw as usize > max {
        return Err(ChannelError::LengthOutOfRange {
            length: raw as i64,
            max,
        });
    }
    Ok(raw as usize)
}

/// 長さ `total` のペイロードを `BLOCK_SIZE` 以下のチャンク長に分割する
///
/// 空のペイロードはチャンクを持たない（長さフィールドのみ送る）。
pub fn chunk_lengths(total: usize) -> impl Iterator<Item = usize> {
    let full = total / BLOCK_SIZE;
    let rest = total % BLOCK_SIZE;
    core::iter::repeat(BLOCK_SIZE)
        .take(full)
        .chain((rest > 0).then_some(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_roundtrip() {
        for hash_len in [BYTE_HASH_LEN, BLOCK_HASH_LEN] {
            assert_eq!(parse_ack(ack_bytes(true, hash_len)), Some(true));
            assert_eq!(parse_ack(ack_bytes(false, hash_len)), Some(false));
        }
        assert_eq!(ack_bytes(true, BLOCK_HASH_LEN), &HASH_COMPARISON_SUCCESS_ARRAY);
    }

    #[test]
    fn test_garbled_ack() {
        assert_eq!(parse_ack(&[0x00]), None);
        assert_eq!(parse_ack(&[0x5A, 0xC3, 0x3C, 0x00]), None);
    }

    #[test]
    fn test_check_length_bounds() {
        assert_eq!(check_length(0, 10).unwrap(), 0);
        assert_eq!(check_length(10, 10).unwrap(), 10);
        assert!(matches!(
            check_length(11, 10),
            Err(ChannelError::LengthOutOfRange { length: 11, max: 10 })
        ));
        assert!(matches!(
            check_length(FILE_ERROR, 10),
            Err(ChannelError::LengthOutOfRange { length: -1, .. })
        ));
    }

    #[test]
    fn test_chunk_lengths() {
        assert_eq!(chunk_lengths(0).count(), 0);
        assert_eq!(chunk_lengths(5).collect::<Vec<_>>(), vec![5]);
        assert_eq!(
            chunk_lengths(BLOCK_SIZE * 2 + 3).collect::<Vec<_>>(),
            vec![BLOCK_SIZE, BLOCK_SIZE, 3]
        );
        assert_eq!(chunk_lengths(BLOCK_SIZE).collect::<Vec<_>>(), vec![BLOCK_SIZE]);
    }

    #[test]
    fn test_encode_length_big_endian() {
        assert_eq!(encode_length(0x0102_0304).unwrap(), [1, 2, 3, 4]);
    }
}
