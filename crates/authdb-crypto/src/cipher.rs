//! ストリーム暗号
//!
//! セッション鍵（16 バイト）を内部状態として持ち、1 バイトずつ暗号化/復号する。
//! 暗号化のたびに平文バイトを全鍵バイトにフィードバックするため、
//! 同じ鍵で初期化した 2 つのインスタンスは同じ呼び出し列を処理する限り同期し続ける。
//!
//! ## 状態
//! ```text
//! key[0..16]  : 可変鍵バッファ
//! check       : key の全バイトの XOR（暗号化に使うマスク）
//! ```
//!
//! ## 1 バイトの処理
//! ```text
//! encrypt: c = p ^ check; feed(p); (extra_step なら evolve()); check = xor(key)
//! decrypt: p = c ^ check; feed(p); (extra_step なら evolve()); check = xor(key)
//! ```
//!
//! `mark()` / `reset()` で状態を保存・復元できる。整合性ハッシュの不一致を検出した
//! ときに両端が同じ地点まで巻き戻して再送するために使う。

use crate::error::CryptoError;

/// セッション鍵の長さ（バイト）
pub const KEY_LEN: usize = 16;

/// 状態付きストリーム暗号
///
/// ブロック暗号ではないため、暗号化・復号は必ず送受信の順序どおりに呼ぶこと。
#[derive(Clone)]
pub struct StreamCipher {
    /// 可変鍵バッファ
    key: [u8; KEY_LEN],
    /// key の XOR チェックサム
    check: u8,
    /// 1 バイトごとに鍵発展関数を追加で適用するか
    extra_step: bool,
    /// `mark()` で保存した状態
    marked: Option<([u8; KEY_LEN], u8)>,
}

impl StreamCipher {
    /// 16 バイトの鍵から暗号を初期化する
    pub fn new(key: [u8; KEY_LEN], extra_step: bool) -> Self {
        let mut cipher = StreamCipher {
            key,
            check: 0,
            extra_step,
            marked: None,
        };
        cipher.update_check();
        cipher
    }

    /// スライスから初期化する（ハンドシェイクで受け取った鍵用）
    ///
    /// # エラー
    /// - `CryptoError::InvalidKeyLength`: 16 バイト以外
    pub fn from_slice(key: &[u8], extra_step: bool) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        Ok(Self::new(key, extra_step))
    }

    /// 平文 1 バイトを暗号化する
    pub fn encrypt(&mut self, plain: u8) -> u8 {
        let out = plain ^ self.check;
        self.feed(plain);
        out
    }

    /// 暗号文 1 バイトを復号する
    pub fn decrypt(&mut self, cipher: u8) -> u8 {
        let plain = cipher ^ self.check;
        self.feed(plain);
        plain
    }

    /// バッファをその場で暗号化する
    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.encrypt(*b);
        }
    }

    /// バッファをその場で復号する
    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.decrypt(*b);
        }
    }

    /// 現在の状態を保存する（直前の保存は上書き）
    pub fn mark(&mut self) {
        self.marked = Some((self.key, self.check));
    }

    /// `mark()` した状態に戻す。保存がなければ何もしない
    pub fn reset(&mut self) {
        if let Some((key, check)) = self.marked {
            self.key = key;
            self.check = check;
        }
    }

    /// 現在の状態から `len` バイトのフィンガープリントを計算する
    ///
    /// 状態は変更しない。送受信後に両端の状態が一致していることを
    /// 相手に証明するために使う。
    pub fn hash(&self, len: usize) -> Vec<u8> {
        let mut scratch = StreamCipher {
            key: self.key,
            check: self.check,
            extra_step: self.extra_step,
            marked: None,
        };
        (0..len)
            .map(|i| {
                scratch.feed((i as u8) ^ 0xA5);
                scratch.check ^ scratch.key[i % KEY_LEN]
            })
            .collect()
    }

    /// 平文バイトを全鍵バイトにフィードバックする
    fn feed(&mut self, plain: u8) {
        let mut carry = plain;
        for i in 0..KEY_LEN {
            let next = self.key[(i + 1) % KEY_LEN];
            self.key[i] = self.key[i].wrapping_add(carry ^ next).rotate_left(3);
            carry = self.key[i];
        }
        if self.extra_step {
            self.evolve();
        }
        self.update_check();
    }

    /// 追加の拡散ステップ（決定的な鍵発展関数）
    fn evolve(&mut self) {
        for i in 0..KEY_LEN {
            let prev = self.key[(i + KEY_LEN - 1) % KEY_LEN];
            self.key[i] = self.key[i].wrapping_mul(167).wrapping_add(prev ^ 0x9E);
        }
    }

    fn update_check(&mut self) {
        self.check = self.key.iter().fold(0u8, |acc, b| acc ^ b);
    }
}

impl core::fmt::Debug for StreamCipher {
    // 鍵バッファは出力しない
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamCipher")
            .field("extra_step", &self.extra_step)
            .field("marked", &self.marked.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> [u8; KEY_LEN] {
        let mut k = [0u8; KEY_LEN];
        for (i, b) in k.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8 * 7);
        }
        k
    }

    #[test]
    fn test_roundtrip_many_keys() {
        for seed in 0..32u8 {
            for extra in [false, true] {
                let mut sender = StreamCipher::new(key(seed), extra);
                let mut receiver = StreamCipher::new(key(seed), extra);

                let plain: Vec<u8> = (0..=255u8).chain(b"operator database".iter().copied()).collect();
                let mut buf = plain.clone();
                sender.encrypt_in_place(&mut buf);
                receiver.decrypt_in_place(&mut buf);
                assert_eq!(buf, plain, "同じ鍵・同じ呼び出し列なら復号できるべき");
                assert_eq!(sender.hash(4), receiver.hash(4));
            }
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let mut cipher = StreamCipher::new(key(9), true);
        let plain = [0u8; 64];
        let mut buf = plain;
        cipher.encrypt_in_place(&mut buf);
        assert_ne!(buf, plain);
    }

    #[test]
    fn test_mark_reset_restores_state() {
        let mut cipher = StreamCipher::new(key(3), false);
        cipher.encrypt(0x42);

        let before = cipher.hash(8);
        cipher.mark();
        cipher.encrypt(0x10);
        cipher.encrypt(0x20);
        assert_ne!(cipher.hash(8), before);

        cipher.reset();
        assert_eq!(cipher.hash(8), before, "reset 後は mark 時点の状態に戻るべき");

        // 巻き戻し後の再暗号化は最初の暗号化と同じ結果
        let mut twin = cipher.clone();
        assert_eq!(cipher.encrypt(0x10), twin.encrypt(0x10));
    }

    #[test]
    fn test_reset_without_mark_is_noop() {
        let mut cipher = StreamCipher::new(key(4), false);
        cipher.encrypt(1);
        let before = cipher.hash(4);
        cipher.reset();
        assert_eq!(cipher.hash(4), before);
    }

    #[test]
    fn test_hash_does_not_mutate() {
        let cipher = StreamCipher::new(key(5), true);
        let h1 = cipher.hash(16);
        let h2 = cipher.hash(16);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn test_desync_changes_hash() {
        let mut a = StreamCipher::new(key(6), false);
        let mut b = StreamCipher::new(key(6), false);
        a.encrypt(1);
        b.encrypt(2); // 異なる平文を処理させる
        assert_ne!(a.hash(4), b.hash(4));
    }

    #[test]
    fn test_from_slice_invalid_length() {
        let result = StreamCipher::from_slice(&[0u8; 10], false);
        assert_eq!(
            result.err(),
            Some(CryptoError::InvalidKeyLength { expected: 16, actual: 10 })
        );
    }
}
