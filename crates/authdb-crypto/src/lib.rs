//! # authdb-crypto
//!
//! authdb の暗号プリミティブ。
//!
//! - [`StreamCipher`]: セッション鍵で駆動する状態付きストリーム暗号（Secure Channel の土台）
//! - [`rsa`]: 鍵リング用 RSA 鍵の生成・DER 変換、OAEP による分割暗号化
//! - [`password`]: PBKDF2 によるソルト付きパスワードハッシュと定数時間比較
//!
//! ## ハンドシェイクでの使われ方
//!
//! ```text
//! client                                   server
//!   ── 要求する鍵 ID ───────────────────────▶
//!   ◀─────────────── 公開鍵 (PKCS#1 DER) ──
//!   ── encrypt_chunked(server_pub, eph_pub) ▶
//!   ◀── encrypt_chunked(eph_pub, session) ─
//!   StreamCipher::new(session)   StreamCipher::new(session)
//! ```

mod cipher;
mod error;
pub mod password;
pub mod rsa;

pub use cipher::{StreamCipher, KEY_LEN};
pub use error::CryptoError;

pub use ::rsa::{RsaPrivateKey, RsaPublicKey};

/// OS の乱数源でバッファを埋める
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|e| CryptoError::Random(e.to_string()))
}

/// 固定長のランダムバイト列を生成する
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}

/// 新しいセッション鍵を生成する
pub fn generate_session_key() -> Result<[u8; KEY_LEN], CryptoError> {
    random_array()
}

/// バイト列を Base64（URL-safe, パディングなし）にエンコードする
pub fn encode_base64(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Base64（URL-safe, パディングなし）文字列をデコードする
pub fn decode_base64(text: &str) -> Result<Vec<u8>, CryptoError> {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|_| CryptoError::InvalidBase64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_array_not_constant() {
        let a: [u8; 32] = random_array().unwrap();
        let b: [u8; 32] = random_array().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_key_length() {
        let key = generate_session_key().unwrap();
        assert_eq!(key.len(), KEY_LEN);
    }

    #[test]
    fn test_base64_roundtrip() {
        let bytes = [0u8, 1, 2, 250, 251, 252];
        let text = encode_base64(&bytes);
        assert_eq!(decode_base64(&text).unwrap(), bytes);
    }

    #[test]
    fn test_decode_base64_invalid() {
        assert_eq!(decode_base64("***"), Err(CryptoError::InvalidBase64));
    }
}
