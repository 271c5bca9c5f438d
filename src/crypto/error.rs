// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Crypto errors.
//!
//! Messages never include key bytes, IVs or plaintext.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid iv length: expected {expected} bytes, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("malformed key header")]
    MalformedKeyHeader,

    #[error("invalid base64 encoding")]
    InvalidEncoding,

    #[error("secure random source unavailable")]
    RandomUnavailable,
}
