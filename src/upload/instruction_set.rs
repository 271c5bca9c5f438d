// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Caller-declared intent for uploads and updates.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::is_strong_key;
use crate::drive::metadata::ThumbnailContent;
use crate::drive::FileSystemType;
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::{FileIdentifier, IdentityId, TargetDrive};

pub const MAX_PAYLOAD_KEY_LENGTH: usize = 32;

/// Payload keys are short lowercase tokens: `[a-z0-9_]{1,32}`.
pub fn assert_valid_payload_key(key: &str) -> ServiceResult<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_PAYLOAD_KEY_LENGTH
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::client(
            ClientErrorCode::InvalidUpload,
            format!("invalid payload key '{key}'"),
        ))
    }
}

/// Recipients must be unique. An empty list is allowed.
pub fn assert_valid_recipient_list(recipients: &[IdentityId]) -> ServiceResult<()> {
    let mut seen = HashSet::with_capacity(recipients.len());
    if recipients.iter().all(|r| seen.insert(r)) {
        Ok(())
    } else {
        Err(ServiceError::client(
            ClientErrorCode::InvalidRecipient,
            "recipient list contains duplicates",
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageIntent {
    #[default]
    NewFileOrOverwrite,
    MetadataOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleOptions {
    #[default]
    SendNowAwaitResponse,
    SendLater,
}

/// Which parts of a file travel to recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendContents(u8);

impl SendContents {
    pub const HEADER: SendContents = SendContents(1);
    pub const THUMBNAILS: SendContents = SendContents(2);
    pub const PAYLOAD: SendContents = SendContents(4);
    pub const ALL: SendContents = SendContents(7);

    pub fn contains(&self, other: SendContents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for SendContents {
    fn default() -> Self {
        SendContents::ALL
    }
}

impl std::ops::BitOr for SendContents {
    type Output = SendContents;

    fn bitor(self, rhs: Self) -> Self::Output {
        SendContents(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppNotificationOptions {
    pub app_id: Uuid,
    pub type_id: Uuid,
    #[serde(default)]
    pub tag_id: Uuid,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub unencrypted_message: Option<String>,
    #[serde(default)]
    pub recipients: Vec<IdentityId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitOptions {
    #[serde(default)]
    pub recipients: Vec<IdentityId>,
    #[serde(default)]
    pub schedule: ScheduleOptions,
    #[serde(default)]
    pub use_global_transit_id: bool,
    #[serde(default)]
    pub send_contents: SendContents,
    /// Drive on the recipient's host. Defaults to the local drive's address.
    #[serde(default)]
    pub remote_target_drive: Option<TargetDrive>,
    #[serde(default)]
    pub override_remote_global_transit_id: Option<Uuid>,
    /// Delete the local copy once every recipient has it.
    #[serde(default)]
    pub is_transient: bool,
    #[serde(default)]
    pub use_app_notification: bool,
    #[serde(default)]
    pub app_notification_options: Option<AppNotificationOptions>,
}

impl TransitOptions {
    pub fn assert_is_valid(&self) -> ServiceResult<()> {
        assert_valid_recipient_list(&self.recipients)?;
        if !self.recipients.is_empty() && !self.use_global_transit_id {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidInstructionSet,
                "sending to recipients requires useGlobalTransitId",
            ));
        }
        if let Some(drive) = &self.remote_target_drive {
            if !drive.is_valid() {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidTargetDrive,
                    "remote target drive is invalid",
                ));
            }
        }
        if self.use_app_notification && self.app_notification_options.is_none() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidInstructionSet,
                "app notification options are required when useAppNotification is set",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadUpdateOperationType {
    #[default]
    AppendOrOverwrite,
    DeletePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedManifestThumbnailDescriptor {
    pub thumbnail_key: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifestPayloadDescriptor {
    pub payload_key: String,
    /// IV the client encrypted the payload with; empty or zero when unencrypted.
    #[serde(default, with = "crate::crypto::base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(default)]
    pub descriptor_content: Option<String>,
    #[serde(default)]
    pub preview_thumbnail: Option<ThumbnailContent>,
    #[serde(default)]
    pub thumbnails: Vec<UploadedManifestThumbnailDescriptor>,
    #[serde(default)]
    pub payload_update_operation_type: PayloadUpdateOperationType,
    /// Assigned by the server when the package is created.
    #[serde(default)]
    pub payload_uid: u64,
}

impl UploadManifestPayloadDescriptor {
    /// Payload IV padded to 16 zero bytes when the client sent none.
    pub fn normalized_iv(&self) -> Vec<u8> {
        if self.iv.is_empty() {
            vec![0; 16]
        } else {
            self.iv.clone()
        }
    }

    pub fn has_strong_iv(&self) -> bool {
        is_strong_key(&self.iv)
    }

    pub fn has_zero_iv(&self) -> bool {
        self.iv.iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    #[serde(default)]
    pub payload_descriptors: Vec<UploadManifestPayloadDescriptor>,
}

impl UploadManifest {
    pub fn assert_is_valid(&self) -> ServiceResult<()> {
        let mut keys = HashSet::new();
        let mut thumbnail_keys = HashSet::new();
        for descriptor in &self.payload_descriptors {
            assert_valid_payload_key(&descriptor.payload_key)?;
            if !keys.insert(descriptor.payload_key.as_str()) {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidUpload,
                    format!("duplicate payload key '{}'", descriptor.payload_key),
                ));
            }
            for thumb in &descriptor.thumbnails {
                if thumb.thumbnail_key.trim().is_empty() || !thumbnail_keys.insert(thumb.thumbnail_key.as_str()) {
                    return Err(ServiceError::client(
                        ClientErrorCode::InvalidUpload,
                        format!("missing or duplicate thumbnail key on payload '{}'", descriptor.payload_key),
                    ));
                }
                if thumb.pixel_width == 0 || thumb.pixel_height == 0 {
                    return Err(ServiceError::client(
                        ClientErrorCode::InvalidUpload,
                        "thumbnail dimensions must be positive",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&UploadManifestPayloadDescriptor> {
        self.payload_descriptors.iter().find(|d| d.payload_key == key)
    }

    /// Give every payload a fresh uid so re-uploads never collide on disk.
    pub fn assign_payload_uids(&mut self, mut next_uid: impl FnMut() -> u64) {
        for descriptor in &mut self.payload_descriptors {
            descriptor.payload_uid = next_uid();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageOptions {
    pub drive: TargetDrive,
    #[serde(default)]
    pub overwrite_file_id: Option<Uuid>,
    #[serde(default)]
    pub storage_intent: StorageIntent,
    #[serde(default)]
    pub file_system_type: FileSystemType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInstructionSet {
    /// IV the client used to encrypt the upload descriptor.
    #[serde(with = "crate::crypto::base64_bytes")]
    pub transfer_iv: Vec<u8>,
    pub storage_options: StorageOptions,
    #[serde(default)]
    pub transit_options: Option<TransitOptions>,
    #[serde(default)]
    pub manifest: UploadManifest,
}

impl UploadInstructionSet {
    pub fn assert_is_valid(&self) -> ServiceResult<()> {
        if !is_strong_key(&self.transfer_iv) {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidInstructionSet,
                "transfer IV must be 16 random bytes",
            ));
        }
        if !self.storage_options.drive.is_valid() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidTargetDrive,
                "storage drive is invalid",
            ));
        }
        if self.storage_options.overwrite_file_id == Some(Uuid::nil()) {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidInstructionSet,
                "overwrite file id is empty",
            ));
        }
        if self.storage_options.storage_intent == StorageIntent::MetadataOnly {
            if self.storage_options.overwrite_file_id.is_none() {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidInstructionSet,
                    "metadata-only uploads must target an existing file",
                ));
            }
            if !self.manifest.payload_descriptors.is_empty() {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidInstructionSet,
                    "metadata-only uploads cannot carry payloads",
                ));
            }
        }
        self.manifest.assert_is_valid()?;
        if let Some(transit) = &self.transit_options {
            transit.assert_is_valid()?;
        }
        Ok(())
    }

    pub fn recipients(&self) -> &[IdentityId] {
        self.transit_options
            .as_ref()
            .map(|t| t.recipients.as_slice())
            .unwrap_or_default()
    }
}

/// Where an update is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateLocale {
    /// Update the stored local file, then distribute the change.
    #[default]
    Local,
    /// No local copy: send the update to recipients only.
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdateInstructionSet {
    #[serde(with = "crate::crypto::base64_bytes")]
    pub transfer_iv: Vec<u8>,
    #[serde(default)]
    pub locale: UpdateLocale,
    pub file: FileIdentifier,
    #[serde(default)]
    pub recipients: Vec<IdentityId>,
    #[serde(default)]
    pub manifest: UploadManifest,
    #[serde(default)]
    pub use_app_notification: bool,
    #[serde(default)]
    pub app_notification_options: Option<AppNotificationOptions>,
}

impl FileUpdateInstructionSet {
    pub fn assert_is_valid(&self) -> ServiceResult<()> {
        if !is_strong_key(&self.transfer_iv) {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidInstructionSet,
                "transfer IV must be 16 random bytes",
            ));
        }
        self.file.kind()?;
        assert_valid_recipient_list(&self.recipients)?;
        self.manifest.assert_is_valid()?;
        if self.locale == UpdateLocale::Peer {
            if self.recipients.is_empty() {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidInstructionSet,
                    "peer updates need at least one recipient",
                ));
            }
            if self.file.global_transit_id.is_none() {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidFileIdentifier,
                    "peer updates must address the file by global transit id",
                ));
            }
        }
        Ok(())
    }
}
