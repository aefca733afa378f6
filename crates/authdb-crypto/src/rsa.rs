//! RSA 鍵の生成・DER 変換・OAEP による鍵ラップ
//!
//! ハンドシェイクでは公開鍵そのもの（PKCS#1 DER）やセッション鍵を相手の公開鍵で
//! 暗号化して送る。OAEP 1 ブロックに収まらない長さは鍵長ごとに分割して暗号化する。
//!
//! ```text
//! 暗号文 = enc(chunk0) || enc(chunk1) || ...   （各 enc は鍵のモジュラス長）
//! chunk の最大長 = modulus_len - 2 * 32 - 2     （OAEP-SHA256）
//! ```

use rand::rngs::OsRng;
use ::rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use ::rsa::traits::PublicKeyParts;
use ::rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// OAEP-SHA256 のパディングオーバーヘッド（バイト）
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// 指定ビット長の RSA 秘密鍵を生成する
///
/// 4096 ビットは数秒かかるため、非同期コンテキストからは
/// `spawn_blocking` 経由で呼ぶこと。
pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| CryptoError::KeyMaterial(e.to_string()))
}

/// 公開鍵を PKCS#1 DER にエンコードする
pub fn public_key_to_der(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    key.to_pkcs1_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CryptoError::KeyMaterial(e.to_string()))
}

/// PKCS#1 DER から公開鍵を復元する
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_der(der).map_err(|e| CryptoError::KeyMaterial(e.to_string()))
}

/// 秘密鍵を PKCS#1 DER にエンコードする（ローカル保存専用）
pub fn private_key_to_der(key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    key.to_pkcs1_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CryptoError::KeyMaterial(e.to_string()))
}

/// PKCS#1 DER から秘密鍵を復元する
pub fn private_key_from_der(der: &[u8]) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs1_der(der).map_err(|e| CryptoError::KeyMaterial(e.to_string()))
}

/// 任意長のデータを公開鍵で暗号化する（OAEP ブロック単位に分割）
pub fn encrypt_chunked(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let modulus = key.size();
    let max_chunk = modulus
        .checked_sub(OAEP_OVERHEAD)
        .filter(|n| *n > 0)
        .ok_or(CryptoError::KeyTooSmall(modulus))?;

    let mut out = Vec::with_capacity(data.len().div_ceil(max_chunk) * modulus);
    for chunk in data.chunks(max_chunk) {
        let enc = key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), chunk)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        out.extend_from_slice(&enc);
    }
    Ok(out)
}

/// `encrypt_chunked` の逆変換
///
/// # エラー
/// - `CryptoError::DecryptionFailed`: 長さがモジュラス長の倍数でない、またはパディング不正
pub fn decrypt_chunked(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let modulus = key.size();
    if data.len() % modulus != 0 {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(modulus) {
        let plain = key
            .decrypt(Oaep::new::<Sha256>(), chunk)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        out.extend_from_slice(&plain);
    }
    Ok(out)
}

/// 公開鍵 DER のフィンガープリント（SHA-256 の Base64）
pub fn fingerprint(public_der: &[u8]) -> String {
    use base64::Engine as _;
    let digest = Sha256::digest(public_der);
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    // テストでは鍵生成を速くするため小さな鍵を使う
    const TEST_BITS: usize = 1024;

    #[test]
    fn test_der_roundtrip() {
        let private = generate_private_key(TEST_BITS).unwrap();
        let public = RsaPublicKey::from(&private);

        let pub_der = public_key_to_der(&public).unwrap();
        assert_eq!(public_key_from_der(&pub_der).unwrap(), public);

        let priv_der = private_key_to_der(&private).unwrap();
        assert_eq!(private_key_from_der(&priv_der).unwrap(), private);
    }

    #[test]
    fn test_chunked_wraps_public_key_larger_than_one_block() {
        let server = generate_private_key(TEST_BITS).unwrap();
        let ephemeral = generate_private_key(TEST_BITS).unwrap();
        let eph_der = public_key_to_der(&RsaPublicKey::from(&ephemeral)).unwrap();
        // 1024 ビット鍵の OAEP ブロックは 62 バイトなので複数ブロックになる
        assert!(eph_der.len() > 62);

        let wrapped = encrypt_chunked(&RsaPublicKey::from(&server), &eph_der).unwrap();
        assert_eq!(wrapped.len() % 128, 0);
        let unwrapped = decrypt_chunked(&server, &wrapped).unwrap();
        assert_eq!(unwrapped, eph_der);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let a = generate_private_key(TEST_BITS).unwrap();
        let b = generate_private_key(TEST_BITS).unwrap();
        let wrapped = encrypt_chunked(&RsaPublicKey::from(&a), b"session key 16b!").unwrap();
        assert_eq!(decrypt_chunked(&b, &wrapped), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_decrypt_truncated_fails() {
        let a = generate_private_key(TEST_BITS).unwrap();
        let wrapped = encrypt_chunked(&RsaPublicKey::from(&a), b"abc").unwrap();
        assert_eq!(
            decrypt_chunked(&a, &wrapped[..wrapped.len() - 1]),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
    }
}
