// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The client-encrypted metadata part of an upload.
//!
//! The client serializes an [`UploadFileDescriptor`] to JSON and encrypts it
//! with its shared secret and the instruction set's transfer IV. The server
//! opens it during finalize.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{aes_cbc, EncryptedKeyHeader, SensitiveByteArray};
use crate::drive::metadata::AppFileMetadata;
use crate::drive::AccessControlList;
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::GlobalTransitIdFileIdentifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileMetadata {
    #[serde(default)]
    pub allow_distribution: bool,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub app_data: AppFileMetadata,
    #[serde(default)]
    pub access_control_list: Option<AccessControlList>,
    /// Version tag of the file being overwritten.
    #[serde(default)]
    pub version_tag: Option<Uuid>,
    #[serde(default)]
    pub referenced_file: Option<GlobalTransitIdFileIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileDescriptor {
    /// Key header wrapped under the uploading client's shared secret.
    #[serde(default)]
    pub encrypted_key_header: Option<EncryptedKeyHeader>,
    pub file_metadata: UploadFileMetadata,
}

impl UploadFileDescriptor {
    /// Encrypt for transport, as a client does.
    pub fn seal(&self, shared_secret: &SensitiveByteArray, transfer_iv: &[u8]) -> ServiceResult<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(|e| ServiceError::system(e.to_string()))?;
        Ok(aes_cbc::encrypt(&json, shared_secret.as_bytes(), transfer_iv)?)
    }

    pub fn open(sealed: &[u8], shared_secret: &SensitiveByteArray, transfer_iv: &[u8]) -> ServiceResult<Self> {
        let json = aes_cbc::decrypt(sealed, shared_secret.as_bytes(), transfer_iv).map_err(|_| {
            ServiceError::client(
                ClientErrorCode::MalformedMetadata,
                "upload metadata could not be decrypted with the transfer IV",
            )
        })?;
        serde_json::from_slice(&json).map_err(|e| {
            ServiceError::client(
                ClientErrorCode::MalformedMetadata,
                format!("upload metadata is not a valid descriptor: {e}"),
            )
        })
    }
}
