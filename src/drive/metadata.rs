// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted file descriptions.
//!
//! A stored file is a [`ServerFileHeader`] (this module) plus raw payload and
//! thumbnail parts on disk. The header holds the file's key header wrapped
//! under the owning drive's storage key, never in clear.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::acl::AccessControlList;
use super::file_system::FileSystemType;
use crate::crypto::EncryptedKeyHeader;
use crate::models::{GlobalTransitIdFileIdentifier, IdentityId, InternalDriveFileId};

/// Upper bound for `AppFileMetadata::content`.
pub const MAX_APP_DATA_CONTENT_LENGTH: usize = 10 * 1024;

/// Upper bound for a payload descriptor's inline content.
pub const MAX_PAYLOAD_DESCRIPTOR_CONTENT_LENGTH: usize = 4 * 1024;

/// Upper bound for the base64 preview thumbnail carried in app data.
pub const MAX_PREVIEW_THUMBNAIL_CONTENT_LENGTH: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailDescriptor {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    #[serde(default)]
    pub bytes_written: u64,
}

/// A small inline thumbnail shipped inside the metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailContent {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDescriptor {
    pub key: String,
    /// Server-assigned, unique per upload of this key.
    pub uid: u64,
    /// IV the client encrypted this payload with. All zero when unencrypted.
    #[serde(with = "crate::crypto::base64_bytes")]
    pub iv: Vec<u8>,
    pub content_type: String,
    pub bytes_written: u64,
    pub last_modified: i64,
    #[serde(default)]
    pub descriptor_content: Option<String>,
    #[serde(default)]
    pub preview_thumbnail: Option<ThumbnailContent>,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppFileMetadata {
    #[serde(default)]
    pub file_type: i32,
    #[serde(default)]
    pub data_type: i32,
    #[serde(default)]
    pub unique_id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub user_date: Option<i64>,
    #[serde(default)]
    pub tags: Vec<Uuid>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub preview_thumbnail: Option<ThumbnailContent>,
    #[serde(default)]
    pub archival_status: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Local address. Removed before the metadata leaves this host.
    #[serde(default)]
    pub file: Option<InternalDriveFileId>,
    #[serde(default)]
    pub global_transit_id: Option<Uuid>,
    pub created: i64,
    pub updated: i64,
    pub is_encrypted: bool,
    #[serde(default)]
    pub sender_identity: Option<IdentityId>,
    #[serde(default)]
    pub original_recipient_list: Vec<IdentityId>,
    pub app_data: AppFileMetadata,
    #[serde(default)]
    pub payloads: Vec<PayloadDescriptor>,
    pub version_tag: Uuid,
    #[serde(default)]
    pub referenced_file: Option<GlobalTransitIdFileIdentifier>,
}

impl FileMetadata {
    pub fn get_payload(&self, key: &str) -> Option<&PayloadDescriptor> {
        self.payloads.iter().find(|p| p.key == key)
    }

    /// Copy suitable for another host: no local file address.
    pub fn redacted(&self) -> Self {
        Self {
            file: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    pub access_control_list: AccessControlList,
    pub allow_distribution: bool,
    #[serde(default)]
    pub file_system_type: FileSystemType,
    #[serde(default)]
    pub original_recipient_count: usize,
    #[serde(default)]
    pub file_byte_count: u64,
}

/// Everything persisted about a file besides its raw parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFileHeader {
    /// Wrapped under the drive storage key.
    pub encrypted_key_header: EncryptedKeyHeader,
    pub file_metadata: FileMetadata,
    pub server_metadata: ServerMetadata,
}

impl ServerFileHeader {
    pub fn file(&self) -> Option<InternalDriveFileId> {
        self.file_metadata.file
    }
}
