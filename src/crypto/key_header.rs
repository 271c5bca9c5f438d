// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-file key headers.
//!
//! A [`KeyHeader`] is the AES key and IV protecting a file's payloads. It only
//! ever exists in clear inside a single call and wipes itself on drop. At rest
//! and on the wire it travels as an [`EncryptedKeyHeader`]: the 32 bytes
//! `iv || aes_key` encrypted with AES-CBC under some holder's shared secret.
//!
//! ```text
//! wrap(kh, iv, S)            -> EncryptedKeyHeader { iv, aes_cbc(iv||key, S, iv) }
//! unwrap(ekh, S)             -> KeyHeader
//! rewrap(ekh, S_old, S_new)  -> EncryptedKeyHeader under S_new, fresh IV
//! ```

use std::fmt;

use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::secret::{is_strong_key, random_iv, SensitiveByteArray, KEY_LENGTH};
use super::{aes_cbc, CryptoError};

pub const IV_LENGTH: usize = 16;

/// Current wrapped key header format.
pub const ENCRYPTION_VERSION: u32 = 1;

/// Length of a wrapped key header: 32 bytes of plaintext plus one padding block.
const WRAPPED_LENGTH: usize = 48;

/// The clear per-file encryption secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyHeader {
    iv: [u8; IV_LENGTH],
    aes_key: SensitiveByteArray,
}

impl KeyHeader {
    /// Fresh AES key and IV from the system CSPRNG.
    pub fn new_random() -> Result<Self, CryptoError> {
        Ok(Self {
            iv: random_iv()?,
            aes_key: SensitiveByteArray::random(KEY_LENGTH)?,
        })
    }

    /// All-zero key header used for unencrypted files.
    pub fn empty() -> Self {
        Self {
            iv: [0; IV_LENGTH],
            aes_key: SensitiveByteArray::zeroed(KEY_LENGTH),
        }
    }

    pub fn from_parts(iv: &[u8], aes_key: &[u8]) -> Result<Self, CryptoError> {
        let iv: [u8; IV_LENGTH] = iv.try_into().map_err(|_| CryptoError::InvalidIvLength {
            expected: IV_LENGTH,
            got: iv.len(),
        })?;
        if aes_key.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LENGTH,
                got: aes_key.len(),
            });
        }
        Ok(Self {
            iv,
            aes_key: SensitiveByteArray::from_slice(aes_key),
        })
    }

    pub fn iv(&self) -> &[u8; IV_LENGTH] {
        &self.iv
    }

    pub fn aes_key(&self) -> &SensitiveByteArray {
        &self.aes_key
    }

    pub fn has_strong_iv(&self) -> bool {
        is_strong_key(&self.iv)
    }

    pub fn has_strong_key(&self) -> bool {
        is_strong_key(self.aes_key.as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.iv.iter().all(|b| *b == 0) && self.aes_key.is_all_zero()
    }

    /// Encrypt payload bytes with this file key.
    pub fn encrypt_data(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aes_cbc::encrypt(data, self.aes_key.as_bytes(), &self.iv)
    }

    pub fn decrypt_data(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        aes_cbc::decrypt(data, self.aes_key.as_bytes(), &self.iv)
    }

    fn combine(&self) -> Zeroizing<Vec<u8>> {
        let mut combined = Zeroizing::new(Vec::with_capacity(IV_LENGTH + KEY_LENGTH));
        combined.extend_from_slice(&self.iv);
        combined.extend_from_slice(self.aes_key.as_bytes());
        combined
    }

    fn split(combined: &[u8]) -> Result<Self, CryptoError> {
        if combined.len() != IV_LENGTH + KEY_LENGTH {
            return Err(CryptoError::MalformedKeyHeader);
        }
        Self::from_parts(&combined[..IV_LENGTH], &combined[IV_LENGTH..])
    }
}

impl fmt::Debug for KeyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyHeader([REDACTED])")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncryptionType {
    #[default]
    Aes,
}

/// A [`KeyHeader`] wrapped for one holder of a shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyHeader {
    pub encryption_version: u32,
    #[serde(rename = "type", default)]
    pub encryption_type: EncryptionType,
    #[serde(with = "super::base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "super::base64_bytes")]
    pub encrypted_aes_key: Vec<u8>,
}

impl EncryptedKeyHeader {
    /// Placeholder carried by unencrypted files.
    pub fn empty() -> Self {
        Self {
            encryption_version: ENCRYPTION_VERSION,
            encryption_type: EncryptionType::Aes,
            iv: vec![0; IV_LENGTH],
            encrypted_aes_key: vec![0; WRAPPED_LENGTH],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iv.iter().all(|b| *b == 0) && self.encrypted_aes_key.iter().all(|b| *b == 0)
    }

    /// Wrap `key_header` under `shared_secret` using the supplied IV.
    pub fn wrap(
        key_header: &KeyHeader,
        iv: &[u8],
        shared_secret: &SensitiveByteArray,
    ) -> Result<Self, CryptoError> {
        let combined = key_header.combine();
        let encrypted_aes_key = aes_cbc::encrypt(&combined, shared_secret.as_bytes(), iv)?;
        Ok(Self {
            encryption_version: ENCRYPTION_VERSION,
            encryption_type: EncryptionType::Aes,
            iv: iv.to_vec(),
            encrypted_aes_key,
        })
    }

    /// Wrap under a freshly generated IV.
    pub fn wrap_with_random_iv(
        key_header: &KeyHeader,
        shared_secret: &SensitiveByteArray,
    ) -> Result<Self, CryptoError> {
        let iv = random_iv()?;
        Self::wrap(key_header, &iv, shared_secret)
    }

    pub fn unwrap(&self, shared_secret: &SensitiveByteArray) -> Result<KeyHeader, CryptoError> {
        if self.encryption_version != ENCRYPTION_VERSION {
            return Err(CryptoError::MalformedKeyHeader);
        }
        let combined = aes_cbc::decrypt(&self.encrypted_aes_key, shared_secret.as_bytes(), &self.iv)?;
        KeyHeader::split(&combined)
    }

    /// Move this key header from one holder's secret to another's.
    ///
    /// The intermediate clear key header lives only inside this call.
    pub fn rewrap(
        &self,
        old_shared_secret: &SensitiveByteArray,
        new_shared_secret: &SensitiveByteArray,
    ) -> Result<Self, CryptoError> {
        let key_header = self.unwrap(old_shared_secret)?;
        Self::wrap_with_random_iv(&key_header, new_shared_secret)
    }

    /// Compact header form: base64 of the JSON encoding.
    pub fn to_base64(&self) -> Result<String, CryptoError> {
        let json = serde_json::to_vec(self).map_err(|_| CryptoError::MalformedKeyHeader)?;
        Ok(Base64::encode_string(&json))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let json = Base64::decode_vec(encoded.trim()).map_err(|_| CryptoError::InvalidEncoding)?;
        serde_json::from_slice(&json).map_err(|_| CryptoError::MalformedKeyHeader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SensitiveByteArray {
        SensitiveByteArray::random(KEY_LENGTH).unwrap()
    }

    #[test]
    fn new_random_is_strong() {
        let kh = KeyHeader::new_random().unwrap();
        assert!(kh.has_strong_iv());
        assert!(kh.has_strong_key());
        assert!(!kh.is_empty());
    }

    #[test]
    fn wrap_then_unwrap_recovers_key() {
        let kh = KeyHeader::new_random().unwrap();
        let iv = random_iv().unwrap();
        let s1 = secret();

        let wrapped = EncryptedKeyHeader::wrap(&kh, &iv, &s1).unwrap();
        assert_eq!(wrapped.iv, iv.to_vec());
        assert_eq!(wrapped.encrypted_aes_key.len(), WRAPPED_LENGTH);

        let unwrapped = wrapped.unwrap(&s1).unwrap();
        assert_eq!(unwrapped.iv(), kh.iv());
        assert!(unwrapped.aes_key().ct_eq(kh.aes_key().as_bytes()));
    }

    #[test]
    fn rewrap_moves_key_to_new_secret() {
        let kh = KeyHeader::new_random().unwrap();
        let s1 = secret();
        let s2 = secret();

        let wrapped = EncryptedKeyHeader::wrap_with_random_iv(&kh, &s1).unwrap();
        let rewrapped = wrapped.rewrap(&s1, &s2).unwrap();
        assert_ne!(rewrapped.encrypted_aes_key, wrapped.encrypted_aes_key);

        let unwrapped = rewrapped.unwrap(&s2).unwrap();
        assert!(unwrapped.aes_key().ct_eq(kh.aes_key().as_bytes()));
        assert_eq!(unwrapped.iv(), kh.iv());
    }

    #[test]
    fn unwrap_with_wrong_secret_never_yields_the_key() {
        let kh = KeyHeader::new_random().unwrap();
        let wrapped = EncryptedKeyHeader::wrap_with_random_iv(&kh, &secret()).unwrap();

        match wrapped.unwrap(&secret()) {
            Err(e) => assert!(matches!(
                e,
                CryptoError::DecryptionFailed | CryptoError::MalformedKeyHeader
            )),
            Ok(other) => assert!(!other.aes_key().ct_eq(kh.aes_key().as_bytes())),
        }
    }

    #[test]
    fn malformed_ciphertext_is_rejected() {
        let mut wrapped = EncryptedKeyHeader::wrap_with_random_iv(&KeyHeader::new_random().unwrap(), &secret()).unwrap();
        wrapped.encrypted_aes_key.truncate(20);
        assert!(wrapped.unwrap(&secret()).is_err());
    }

    #[test]
    fn short_iv_is_rejected() {
        let kh = KeyHeader::new_random().unwrap();
        let err = EncryptedKeyHeader::wrap(&kh, &[1, 2, 3], &secret()).unwrap_err();
        assert_eq!(err, CryptoError::InvalidIvLength { expected: 16, got: 3 });
    }

    #[test]
    fn short_secret_is_rejected() {
        let kh = KeyHeader::new_random().unwrap();
        let short = SensitiveByteArray::from_slice(&[1u8; 8]);
        assert!(matches!(
            EncryptedKeyHeader::wrap_with_random_iv(&kh, &short),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn empty_headers() {
        assert!(KeyHeader::empty().is_empty());
        assert!(EncryptedKeyHeader::empty().is_empty());
        assert!(!KeyHeader::empty().has_strong_key());
    }

    #[test]
    fn base64_form_round_trips_and_errors_do_not_leak() {
        let wrapped = EncryptedKeyHeader::wrap_with_random_iv(&KeyHeader::new_random().unwrap(), &secret()).unwrap();
        let encoded = wrapped.to_base64().unwrap();
        assert_eq!(EncryptedKeyHeader::from_base64(&encoded).unwrap(), wrapped);

        let err = EncryptedKeyHeader::from_base64("not base64!").unwrap_err();
        assert_eq!(err.to_string(), "invalid base64 encoding");
    }

    #[test]
    fn payload_encryption_uses_file_key() {
        let kh = KeyHeader::new_random().unwrap();
        let cipher = kh.encrypt_data(b"hello payload").unwrap();
        assert_eq!(kh.decrypt_data(&cipher).unwrap().as_slice(), b"hello payload");
    }

    #[test]
    fn debug_is_redacted() {
        let kh = KeyHeader::new_random().unwrap();
        assert_eq!(format!("{kh:?}"), "KeyHeader([REDACTED])");
    }
}
