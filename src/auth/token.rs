// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Client access tokens.
//!
//! A token is a registration id plus a random half key. The server stores
//! only a SHA-256 hash of the half key and the client's shared secret
//! encrypted under it, so a stolen registration record alone cannot be used
//! to authenticate or to recover the shared secret.

use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::secret::KEY_LENGTH;
use crate::crypto::{CryptoError, SensitiveByteArray};

const PORTABLE_LENGTH: usize = 16 + KEY_LENGTH;

#[derive(Clone)]
pub struct ClientAuthenticationToken {
    pub id: Uuid,
    pub access_token_half_key: SensitiveByteArray,
}

impl std::fmt::Debug for ClientAuthenticationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuthenticationToken")
            .field("id", &self.id)
            .field("access_token_half_key", &"[REDACTED]")
            .finish()
    }
}

impl ClientAuthenticationToken {
    pub fn new_random() -> Result<Self, CryptoError> {
        Ok(Self {
            id: Uuid::new_v4(),
            access_token_half_key: SensitiveByteArray::random(KEY_LENGTH)?,
        })
    }

    /// Compact form used in `Authorization` and peer token headers.
    pub fn to_portable(&self) -> Zeroizing<String> {
        let mut raw = Zeroizing::new(Vec::with_capacity(PORTABLE_LENGTH));
        raw.extend_from_slice(self.id.as_bytes());
        raw.extend_from_slice(self.access_token_half_key.as_bytes());
        Zeroizing::new(Base64::encode_string(&raw))
    }

    pub fn parse(portable: &str) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(Base64::decode_vec(portable.trim()).map_err(|_| CryptoError::InvalidEncoding)?);
        if raw.len() != PORTABLE_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: PORTABLE_LENGTH,
                got: raw.len(),
            });
        }
        let id = Uuid::from_slice(&raw[..16]).map_err(|_| CryptoError::InvalidEncoding)?;
        Ok(Self {
            id,
            access_token_half_key: SensitiveByteArray::from_slice(&raw[16..]),
        })
    }

    pub fn half_key_hash(&self) -> [u8; 32] {
        half_key_hash(&self.access_token_half_key)
    }
}

pub fn half_key_hash(half_key: &SensitiveByteArray) -> [u8; 32] {
    Sha256::digest(half_key.as_bytes()).into()
}
