// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Policy checks that must pass before anything is committed.

use crate::crypto::{is_strong_key, KeyHeader};
use crate::drive::metadata::{
    FileMetadata, PayloadDescriptor, ThumbnailContent, MAX_APP_DATA_CONTENT_LENGTH,
    MAX_PAYLOAD_DESCRIPTOR_CONTENT_LENGTH, MAX_PREVIEW_THUMBNAIL_CONTENT_LENGTH,
};
use crate::drive::{AccessControlList, SecurityGroupType, StorageDrive};
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};

use super::instruction_set::{assert_valid_payload_key, StorageIntent};

/// Everything the validator looks at. Built from the opened upload
/// descriptor and the target drive; no I/O happens during validation.
pub struct UploadCandidate<'a> {
    pub access_control_list: Option<&'a AccessControlList>,
    pub metadata: &'a FileMetadata,
    pub key_header: &'a KeyHeader,
    pub drive: &'a StorageDrive,
    pub storage_intent: StorageIntent,
}

pub struct AccessControlValidator;

impl AccessControlValidator {
    pub fn validate(candidate: &UploadCandidate<'_>) -> ServiceResult<()> {
        let metadata = candidate.metadata;

        let Some(acl) = candidate.access_control_list else {
            return Err(ServiceError::client(
                ClientErrorCode::MissingUploadData,
                "access control list must be specified",
            ));
        };
        acl.validate()
            .map_err(|e| ServiceError::client(ClientErrorCode::InvalidAccessControlList, e))?;

        if metadata.is_encrypted && !acl.required_security_group.holds_shared_secret() {
            return Err(ServiceError::client(
                ClientErrorCode::CannotUploadEncryptedFileForAnonymous,
                format!(
                    "cannot upload an encrypted file readable by {:?} callers",
                    acl.required_security_group
                ),
            ));
        }

        if !metadata.payloads.is_empty() {
            if !metadata.payloads.iter().all(payload_is_valid) {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidFile,
                    "one or more payload descriptors is invalid",
                ));
            }
            if !metadata.is_encrypted && metadata.payloads.iter().any(|p| p.iv.iter().any(|b| *b != 0)) {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidUpload,
                    "payload IVs must be zero when the file is not encrypted",
                ));
            }
            if metadata.is_encrypted && !metadata.payloads.iter().all(|p| is_strong_key(&p.iv)) {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidUpload,
                    "encrypted files need a strong 16 byte IV on every payload",
                ));
            }
        }

        if candidate.drive.owner_only && acl.required_security_group != SecurityGroupType::Owner {
            return Err(ServiceError::client(
                ClientErrorCode::DriveSecurityAndAclMismatch,
                "drive is owner only so files must require the owner security group",
            ));
        }

        if metadata.app_data.unique_id.is_some_and(|u| u.is_nil()) {
            return Err(ServiceError::client(
                ClientErrorCode::MalformedMetadata,
                "unique id cannot be an empty id",
            ));
        }

        if candidate.storage_intent == StorageIntent::NewFileOrOverwrite
            && metadata.is_encrypted
            && !(candidate.key_header.has_strong_iv() && candidate.key_header.has_strong_key())
        {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidKeyHeader,
                "file is encrypted but its key header is too simple",
            ));
        }

        assert_content_length(
            metadata.app_data.content.as_deref(),
            MAX_APP_DATA_CONTENT_LENGTH,
            "app data content",
        )?;
        assert_preview_thumbnail(metadata.app_data.preview_thumbnail.as_ref())?;
        for payload in &metadata.payloads {
            assert_content_length(
                payload.descriptor_content.as_deref(),
                MAX_PAYLOAD_DESCRIPTOR_CONTENT_LENGTH,
                "payload descriptor content",
            )?;
            assert_preview_thumbnail(payload.preview_thumbnail.as_ref())?;
        }
        Ok(())
    }
}

fn payload_is_valid(payload: &PayloadDescriptor) -> bool {
    assert_valid_payload_key(&payload.key).is_ok()
        && !payload.content_type.trim().is_empty()
        && payload.iv.len() == 16
        && payload
            .thumbnails
            .iter()
            .all(|t| t.pixel_width > 0 && t.pixel_height > 0 && !t.content_type.trim().is_empty())
}

fn assert_content_length(content: Option<&str>, max: usize, what: &str) -> ServiceResult<()> {
    match content {
        Some(c) if c.len() > max => Err(ServiceError::client(
            ClientErrorCode::MaxContentLengthExceeded,
            format!("{what} is {} bytes; the limit is {max}", c.len()),
        )),
        _ => Ok(()),
    }
}

fn assert_preview_thumbnail(thumb: Option<&ThumbnailContent>) -> ServiceResult<()> {
    assert_content_length(
        thumb.map(|t| t.content.as_str()),
        MAX_PREVIEW_THUMBNAIL_CONTENT_LENGTH,
        "preview thumbnail",
    )
}
