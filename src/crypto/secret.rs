// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secret byte buffers and secure randomness.

use std::fmt;

use base64ct::{Base64, Encoding};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{aes_cbc, CryptoError};

/// Length of every symmetric key and IV in this crate (AES-128).
pub const KEY_LENGTH: usize = 16;

/// A byte buffer holding secret material. Wiped on drop.
///
/// `Debug` never prints the contents and there is no `PartialEq`; use
/// [`SensitiveByteArray::ct_eq`] for comparisons.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveByteArray(Vec<u8>);

impl SensitiveByteArray {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// A buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0; len])
    }

    /// A buffer of `len` bytes from the system CSPRNG.
    pub fn random(len: usize) -> Result<Self, CryptoError> {
        let mut bytes = vec![0u8; len];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| CryptoError::RandomUnavailable)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Constant-time comparison against another byte slice.
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        #[allow(deprecated)]
        ring::constant_time::verify_slices_are_equal(&self.0, other).is_ok()
    }
}

impl fmt::Debug for SensitiveByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveByteArray([REDACTED; {}])", self.0.len())
    }
}

impl Serialize for SensitiveByteArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(Base64::encode_string(&self.0));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for SensitiveByteArray {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        Base64::decode_vec(&encoded)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Fill a fresh IV from the system CSPRNG.
pub fn random_iv() -> Result<[u8; KEY_LENGTH], CryptoError> {
    let mut iv = [0u8; KEY_LENGTH];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(iv)
}

/// A key or IV is strong when it has the expected length and is not a
/// single repeated byte (all-zero included).
pub fn is_strong_key(bytes: &[u8]) -> bool {
    match bytes.first() {
        Some(first) if bytes.len() == KEY_LENGTH => bytes.iter().any(|b| b != first),
        _ => false,
    }
}

/// A secret encrypted under another symmetric key, stored alongside its IV.
///
/// Used for token half-keys and connection shared secrets at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKey {
    #[serde(with = "super::base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "super::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedKey {
    /// Encrypt `secret` under `key` with a random IV.
    pub fn encrypt(secret: &SensitiveByteArray, key: &SensitiveByteArray) -> Result<Self, CryptoError> {
        let iv = random_iv()?;
        let ciphertext = aes_cbc::encrypt(secret.as_bytes(), key.as_bytes(), &iv)?;
        Ok(Self {
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    pub fn decrypt(&self, key: &SensitiveByteArray) -> Result<SensitiveByteArray, CryptoError> {
        let plain = aes_cbc::decrypt(&self.ciphertext, key.as_bytes(), &self.iv)?;
        Ok(SensitiveByteArray::from_slice(&plain))
    }
}
