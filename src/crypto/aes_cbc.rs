// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-128-CBC with PKCS#7 padding.

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroizing;

use super::secret::KEY_LENGTH;
use super::CryptoError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const BLOCK_SIZE: usize = 16;

fn check_lengths(key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: key.len(),
        });
    }
    if iv.len() != BLOCK_SIZE {
        return Err(CryptoError::InvalidIvLength {
            expected: BLOCK_SIZE,
            got: iv.len(),
        });
    }
    Ok(())
}

pub fn encrypt(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_lengths(key, iv)?;
    let cipher = Aes128CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LENGTH,
        got: key.len(),
    })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

/// Decrypt `data`. The plaintext is wiped when the returned buffer drops.
pub fn decrypt(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    check_lengths(key, iv)?;
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LENGTH,
        got: key.len(),
    })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
}
