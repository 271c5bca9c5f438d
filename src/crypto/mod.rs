// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Crypto Module
//!
//! Symmetric primitives used by the upload and transit pipelines.
//!
//! - `secret` - zeroize-on-drop secret buffers and secure randomness
//! - `aes_cbc` - AES-128-CBC with PKCS#7 padding
//! - `key_header` - per-file key headers and their wrapped form
//!
//! Every buffer that holds decrypted key material is either a
//! [`SensitiveByteArray`] or a `Zeroizing<Vec<u8>>`, so it is wiped when it
//! goes out of scope on every exit path.

pub mod aes_cbc;
pub mod error;
pub mod key_header;
pub mod secret;

pub use error::CryptoError;
pub use key_header::{EncryptedKeyHeader, KeyHeader};
pub use secret::{is_strong_key, random_iv, EncryptedKey, SensitiveByteArray};

/// Serde adapter that renders byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Base64::decode_vec(&encoded).map_err(serde::de::Error::custom)
    }
}
