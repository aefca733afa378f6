//! ソルト付き鍵付きハッシュによるパスワード検証
//!
//! PBKDF2-HMAC-SHA256 を使う。反復回数はオペレーターごとに記録し、
//! 設定変更後も既存のハッシュを検証できるようにする。

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::CryptoError;

/// ソルト長（バイト）
pub const SALT_LEN: usize = 16;

/// ハッシュ長（バイト）
pub const HASH_LEN: usize = 32;

/// ランダムなソルトを生成する
pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    crate::random_array()
}

/// パスワードのハッシュを計算する
pub fn hash_password(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations.max(1), &mut out);
    out
}

/// パスワードが保存済みハッシュと一致するか（定数時間比較）
pub fn verify_password(password: &str, salt: &[u8], iterations: u32, expected: &[u8]) -> bool {
    let actual = hash_password(password, salt, iterations);
    constant_time_eq(&actual, expected)
}

/// 2 つのバイト列を定数時間で比較する
///
/// 最初に異なる位置や異なるバイト数に実行時間が依存しない。
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
