use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;

/// Version prefix of the encoded ciphertext format.
const FORMAT_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SecretBoxError {
    #[error("encryption key must be base64 of exactly 32 bytes")]
    BadKey,
    #[error("malformed secret ciphertext")]
    BadFormat,
    #[error("secret encryption failed")]
    EncryptFailed,
    #[error("secret decryption failed")]
    DecryptFailed,
}

/// AES-256-GCM envelope for API-key secrets at rest.
///
/// Encoded form is `v1:<base64(nonce || ciphertext || tag)>` with a fresh
/// 12-byte random nonce per encryption.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    pub fn from_base64(key_b64: &str) -> Result<Self, SecretBoxError> {
        let key = BASE64
            .decode(key_b64.trim())
            .map_err(|_| SecretBoxError::BadKey)?;
        if key.len() != 32 {
            return Err(SecretBoxError::BadKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SecretBoxError::BadKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecretBoxError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce[..]);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecretBoxError::EncryptFailed)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{FORMAT_VERSION}:{}", BASE64.encode(payload)))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, SecretBoxError> {
        let payload = encoded
            .strip_prefix(FORMAT_VERSION)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or(SecretBoxError::BadFormat)?;
        let payload = BASE64
            .decode(payload)
            .map_err(|_| SecretBoxError::BadFormat)?;
        if payload.len() <= NONCE_LEN {
            return Err(SecretBoxError::BadFormat);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretBoxError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> SecretBox {
        SecretBox::from_base64(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn round_trip() {
        let secrets = test_box();
        let encoded = secrets.encrypt(b"the-secret-key").unwrap();
        assert!(encoded.starts_with("v1:"));
        assert_eq!(secrets.decrypt(&encoded).unwrap(), b"the-secret-key");
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let secrets = test_box();
        let a = secrets.encrypt(b"same").unwrap();
        let b = secrets.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let secrets = test_box();
        let encoded = secrets.encrypt(b"payload").unwrap();
        let mut payload = BASE64.decode(encoded.strip_prefix("v1:").unwrap()).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        let tampered = format!("v1:{}", BASE64.encode(payload));
        assert!(matches!(
            secrets.decrypt(&tampered),
            Err(SecretBoxError::DecryptFailed)
        ));
    }

    #[test]
    fn malformed_inputs_rejected() {
        let secrets = test_box();
        assert!(matches!(
            secrets.decrypt("v2:abcd"),
            Err(SecretBoxError::BadFormat)
        ));
        assert!(matches!(
            secrets.decrypt("v1:!!!"),
            Err(SecretBoxError::BadFormat)
        ));
        assert!(matches!(
            secrets.decrypt("v1:AAAA"),
            Err(SecretBoxError::BadFormat)
        ));
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let encoded = test_box().encrypt(b"payload").unwrap();
        let other = SecretBox::from_base64(&BASE64.encode([9u8; 32])).unwrap();
        assert!(matches!(
            other.decrypt(&encoded),
            Err(SecretBoxError::DecryptFailed)
        ));
    }

    #[test]
    fn short_keys_rejected() {
        assert!(matches!(
            SecretBox::from_base64(&BASE64.encode([1u8; 16])),
            Err(SecretBoxError::BadKey)
        ));
        assert!(matches!(
            SecretBox::from_base64("not base64 at all"),
            Err(SecretBoxError::BadKey)
        ));
    }
}
