//! 암호화 모듈 - X25519 키 합의 + ChaCha20-Poly1305 메시지 암호화
//!
//! 흐름:
//! 1. 핸드쉐이크 시작 시 연결마다 키 합의 객체 생성
//! 2. Connect / ConnectResponse에 공개키 포함
//! 3. 상대 공개키로 공유 비밀 계산 → 연결의 암호화 키
//! 4. 사용자 범위 메시지를 ChaCha20-Poly1305로 암호화/복호화
//!
//! 정적 키 모드에서는 설정의 32바이트 키를 모든 연결이 공유.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("키 교환 실패")]
    KeyExchangeFailed,
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
}

/// 키 합의 서비스: 로컬/원격 공개값으로 공유 비밀 생성
pub trait KeyAgreement: Send {
    fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE];

    fn shared_secret(&self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> Result<[u8; 32], CryptoError>;
}

/// X25519 키쌍
///
/// 응답이 중복으로 올 수 있으므로 핸드쉐이크가 끝날 때까지 비밀키를 유지함.
pub struct X25519Agreement {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519Agreement {
    /// 새 키쌍 생성
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl KeyAgreement for X25519Agreement {
    fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    fn shared_secret(&self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
        let remote = PublicKey::from(*remote_public);
        let shared = self.secret.diffie_hellman(&remote);
        // 저차수 점이면 공유 비밀이 0이 됨
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchangeFailed);
        }
        Ok(*shared.as_bytes())
    }
}

/// 메시지 암호화기
pub struct MessageCipher {
    cipher: ChaCha20Poly1305,
}

impl MessageCipher {
    /// 32바이트 키로 암호화기 생성
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// 반환: nonce(12) + ciphertext(원본 + 16바이트 태그)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 입력: nonce(12) + ciphertext
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageCipher")
    }
}
