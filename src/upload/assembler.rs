// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Multipart upload assembly.
//!
//! ```text
//! create_package ─▶ add_metadata / add_payload / add_thumbnail ─▶ finalize_upload
//!                        (parts land in temp storage)              (validate, commit, send)
//! ```
//!
//! Nothing reaches long-term storage before every check in
//! `finalize_upload` has passed. A failed finalize leaves only temp parts,
//! which are deleted on a best-effort basis.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::descriptor::UploadFileDescriptor;
use super::instruction_set::{PayloadUpdateOperationType, StorageIntent, UploadInstructionSet};
use super::package::{PackageId, PackageInstructions, PackagePayload, PackageRegistry, PackageThumbnail, UploadPackage};
use super::validator::{AccessControlValidator, UploadCandidate};
use crate::auth::{CallerContext, PermissionKey};
use crate::crypto::{EncryptedKeyHeader, KeyHeader};
use crate::drive::metadata::{FileMetadata, PayloadDescriptor, ServerFileHeader, ServerMetadata, ThumbnailDescriptor};
use crate::drive::storage::{payload_part_name, thumbnail_part_name, METADATA_PART};
use crate::drive::{file_system_for, DriveManager, DriveStorage};
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::{unix_millis_now, ExternalFileIdentifier, IdentityId, InternalDriveFileId};
use crate::transit::sender::PeerTransitSender;
use crate::transit::types::TransferStatus;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub file: ExternalFileIdentifier,
    pub global_transit_id: Option<Uuid>,
    pub new_version_tag: Uuid,
    /// One entry per requested recipient.
    #[schema(value_type = Object)]
    pub recipient_status: BTreeMap<IdentityId, TransferStatus>,
}

pub(crate) fn invalid_upload(message: impl Into<String>) -> ServiceError {
    ServiceError::client(ClientErrorCode::InvalidUpload, message)
}

pub(crate) fn reject_self_recipient(tenant: &IdentityId, recipients: &[IdentityId]) -> ServiceResult<()> {
    if recipients.contains(tenant) {
        return Err(ServiceError::client(
            ClientErrorCode::InvalidRecipient,
            "cannot transfer to yourself",
        ));
    }
    Ok(())
}

pub struct UploadPackageAssembler {
    tenant: IdentityId,
    drives: Arc<DriveManager>,
    storage: Arc<dyn DriveStorage>,
    packages: Arc<PackageRegistry>,
    sender: Arc<PeerTransitSender>,
    next_uid: AtomicU64,
}

impl UploadPackageAssembler {
    pub fn new(
        tenant: IdentityId,
        drives: Arc<DriveManager>,
        storage: Arc<dyn DriveStorage>,
        packages: Arc<PackageRegistry>,
        sender: Arc<PeerTransitSender>,
    ) -> Self {
        let seed = u64::try_from(unix_millis_now()).unwrap_or_default() << 12;
        Self {
            tenant,
            drives,
            storage,
            packages,
            sender,
            next_uid: AtomicU64::new(seed),
        }
    }

    pub(crate) fn next_payload_uid(&self) -> u64 {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Store a new package, cleaning up whichever package the registry had
    /// to drop to make room.
    pub(crate) async fn register(&self, package: UploadPackage) -> ServiceResult<PackageId> {
        let id = package.id;
        if let Some(evicted) = self.packages.insert(package)? {
            warn!(package_id = %evicted.id, "upload registry full, dropping least recent package");
            self.discard_temp(&evicted.file).await;
        }
        Ok(id)
    }

    /// Remove a package from the registry for finalizing.
    pub(crate) fn take(&self, package_id: PackageId) -> ServiceResult<UploadPackage> {
        self.packages.remove(package_id)?.ok_or_else(|| {
            ServiceError::client(
                ClientErrorCode::InvalidPackage,
                format!("unknown upload package {package_id}"),
            )
        })
    }

    pub(crate) fn pending(&self) -> usize {
        self.packages.len()
    }

    pub(crate) async fn discard_temp(&self, file: &InternalDriveFileId) {
        if let Err(e) = self.storage.delete_temp_files(file).await {
            warn!(file = %file, error = %e, "could not delete temp upload parts");
        }
    }

    // ========== Package ==========

    /// Validate the instruction set and open a package for its parts.
    pub async fn create_package(
        &self,
        ctx: &CallerContext,
        mut instruction_set: UploadInstructionSet,
    ) -> ServiceResult<PackageId> {
        instruction_set.assert_is_valid()?;
        reject_self_recipient(&self.tenant, instruction_set.recipients())?;
        if !instruction_set.recipients().is_empty() {
            ctx.assert_has_permission(PermissionKey::UseTransitWrite)?;
        }

        let drive_id = self.drives.get_drive_id(&instruction_set.storage_options.drive)?;
        ctx.assert_can_write_to_drive(drive_id)?;

        let (file, is_update) = match instruction_set.storage_options.overwrite_file_id {
            Some(file_id) => {
                let file = InternalDriveFileId::new(drive_id, file_id);
                if !self.storage.file_exists(&file).await? {
                    return Err(ServiceError::client(
                        ClientErrorCode::CannotOverwriteNonExistentFile,
                        format!("file {file_id} does not exist"),
                    ));
                }
                (file, true)
            }
            None => (self.storage.create_file_id(drive_id), false),
        };

        instruction_set
            .manifest
            .assign_payload_uids(|| self.next_payload_uid());
        let package = UploadPackage::new(file, PackageInstructions::Upload(instruction_set), is_update);
        let id = self.register(package).await?;
        info!(package_id = %id, file = %file, is_update, "upload package created");
        Ok(id)
    }

    pub async fn add_metadata(&self, package_id: PackageId, sealed: &[u8]) -> ServiceResult<()> {
        let package = self.packages.get(package_id)?;
        if package.has_metadata {
            return Err(invalid_upload("metadata was already uploaded"));
        }
        self.storage
            .write_temp_stream(&package.file, METADATA_PART, sealed)
            .await?;
        self.packages.update(package_id, |p| {
            p.has_metadata = true;
            Ok(())
        })
    }

    pub async fn add_payload(
        &self,
        package_id: PackageId,
        key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> ServiceResult<()> {
        let package = self.packages.get(package_id)?;
        let descriptor = package
            .manifest()
            .get(key)
            .cloned()
            .ok_or_else(|| invalid_upload(format!("payload '{key}' is not declared in the manifest")))?;
        if package.has_payload(key) {
            return Err(invalid_upload(format!("duplicate payload key '{key}'")));
        }

        let bytes_written = self
            .storage
            .write_temp_stream(&package.file, &payload_part_name(key, descriptor.payload_uid), bytes)
            .await?;

        self.packages.update(package_id, |p| {
            if p.has_payload(key) {
                return Err(invalid_upload(format!("duplicate payload key '{key}'")));
            }
            p.payloads.push(PackagePayload {
                key: key.to_string(),
                uid: descriptor.payload_uid,
                iv: descriptor.normalized_iv(),
                content_type: content_type.to_string(),
                bytes_written,
                descriptor_content: descriptor.descriptor_content.clone(),
                preview_thumbnail: descriptor.preview_thumbnail.clone(),
            });
            Ok(())
        })
    }

    pub async fn add_thumbnail(
        &self,
        package_id: PackageId,
        thumbnail_key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> ServiceResult<()> {
        let package = self.packages.get(package_id)?;
        let (payload, thumb) = package
            .manifest()
            .payload_descriptors
            .iter()
            .find_map(|p| {
                p.thumbnails
                    .iter()
                    .find(|t| t.thumbnail_key == thumbnail_key)
                    .map(|t| (p.clone(), t.clone()))
            })
            .ok_or_else(|| invalid_upload(format!("thumbnail '{thumbnail_key}' is not declared in the manifest")))?;

        let is_duplicate = |p: &UploadPackage| {
            p.thumbnails_for(&payload.payload_key)
                .any(|t| t.pixel_width == thumb.pixel_width && t.pixel_height == thumb.pixel_height)
        };
        if is_duplicate(&package) {
            return Err(invalid_upload(format!("duplicate thumbnail '{thumbnail_key}'")));
        }

        let part = thumbnail_part_name(
            &payload.payload_key,
            payload.payload_uid,
            thumb.pixel_width,
            thumb.pixel_height,
        );
        let bytes_written = self.storage.write_temp_stream(&package.file, &part, bytes).await?;

        let content_type = if content_type.trim().is_empty() {
            thumb.content_type.clone().unwrap_or_default()
        } else {
            content_type.to_string()
        };
        self.packages.update(package_id, |p| {
            if is_duplicate(p) {
                return Err(invalid_upload(format!("duplicate thumbnail '{thumbnail_key}'")));
            }
            p.thumbnails.push(PackageThumbnail {
                payload_key: payload.payload_key.clone(),
                pixel_width: thumb.pixel_width,
                pixel_height: thumb.pixel_height,
                content_type,
                bytes_written,
            });
            Ok(())
        })
    }

    /// Drop a package whose parts could not be received.
    pub async fn abandon(&self, package_id: PackageId) {
        if let Ok(package) = self.take(package_id) {
            self.discard_temp(&package.file).await;
            info!(package_id = %package_id, "upload package abandoned");
        }
    }

    /// Drop packages past their TTL and delete their temp parts.
    pub async fn reclaim_expired_packages(&self) -> ServiceResult<usize> {
        let expired = self.packages.evict_expired()?;
        for package in &expired {
            self.discard_temp(&package.file).await;
        }
        Ok(expired.len())
    }

    // ========== Finalize ==========

    /// Decrypt the sealed metadata part of a package.
    pub(crate) async fn open_descriptor(
        &self,
        ctx: &CallerContext,
        package: &UploadPackage,
    ) -> ServiceResult<UploadFileDescriptor> {
        if !package.has_metadata {
            return Err(ServiceError::client(
                ClientErrorCode::MissingUploadData,
                "upload has no metadata part",
            ));
        }
        let sealed = self.storage.get_temp_stream(&package.file, METADATA_PART).await?;
        UploadFileDescriptor::open(&sealed, ctx.shared_secret_key()?, package.transfer_iv())
    }

    /// Validate, commit and distribute a package. The package is consumed
    /// whether or not this succeeds.
    pub async fn finalize_upload(&self, ctx: &CallerContext, package_id: PackageId) -> ServiceResult<UploadResult> {
        let package = self.take(package_id)?;
        let result = self.finalize(ctx, &package).await;
        if result.is_err() {
            self.discard_temp(&package.file).await;
        }
        result
    }

    async fn finalize(&self, ctx: &CallerContext, package: &UploadPackage) -> ServiceResult<UploadResult> {
        let PackageInstructions::Upload(instruction_set) = &package.instructions else {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidPackage,
                "package was opened for an update",
            ));
        };
        let storage_options = &instruction_set.storage_options;
        let file = package.file;

        let descriptor = self.open_descriptor(ctx, package).await?;
        let upload_metadata = &descriptor.file_metadata;

        let key_header = client_key_header(ctx, &descriptor)?;
        if storage_options.storage_intent == StorageIntent::MetadataOnly
            && upload_metadata.is_encrypted
            && !(key_header.has_strong_iv() && key_header.aes_key().is_all_zero())
        {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidKeyHeader,
                "metadata-only uploads carry a fresh IV and no AES key",
            ));
        }

        let drive = self.drives.get_drive(file.drive_id)?;
        let existing = if package.is_update_operation {
            let existing = self
                .storage
                .get_server_file_header(&file)
                .await?
                .ok_or_else(|| {
                    ServiceError::client(
                        ClientErrorCode::CannotOverwriteNonExistentFile,
                        format!("file {} does not exist", file.file_id),
                    )
                })?;
            match upload_metadata.version_tag {
                None => {
                    return Err(ServiceError::client(
                        ClientErrorCode::MissingVersionTag,
                        "overwriting a file requires its current version tag",
                    ))
                }
                Some(tag) if tag != existing.file_metadata.version_tag => {
                    return Err(ServiceError::client(
                        ClientErrorCode::VersionTagMismatch,
                        "the file was changed since this version was read",
                    ))
                }
                Some(_) => {}
            }
            Some(existing)
        } else {
            None
        };

        let now = unix_millis_now();
        let payloads = match (&existing, storage_options.storage_intent) {
            (Some(existing), StorageIntent::MetadataOnly) => existing.file_metadata.payloads.clone(),
            _ => package_payload_descriptors(package, now)?,
        };

        let use_global_transit_id = instruction_set
            .transit_options
            .as_ref()
            .is_some_and(|t| t.use_global_transit_id);
        let global_transit_id = existing
            .as_ref()
            .and_then(|e| e.file_metadata.global_transit_id)
            .or_else(|| use_global_transit_id.then(Uuid::new_v4));

        let metadata = FileMetadata {
            file: Some(file),
            global_transit_id,
            created: existing.as_ref().map_or(now, |e| e.file_metadata.created),
            updated: now,
            is_encrypted: upload_metadata.is_encrypted,
            sender_identity: Some(self.tenant.clone()),
            original_recipient_list: instruction_set.recipients().to_vec(),
            app_data: upload_metadata.app_data.clone(),
            payloads,
            version_tag: Uuid::new_v4(),
            referenced_file: upload_metadata.referenced_file.clone(),
        };

        AccessControlValidator::validate(&UploadCandidate {
            access_control_list: upload_metadata.access_control_list.as_ref(),
            metadata: &metadata,
            key_header: &key_header,
            drive: &drive,
            storage_intent: storage_options.storage_intent,
        })?;
        let file_system = file_system_for(storage_options.file_system_type);
        file_system.validate_metadata(&metadata)?;
        file_system
            .validate_references(&self.drives, self.storage.as_ref(), &metadata)
            .await?;
        assert_unique_id_is_free(self.storage.as_ref(), &metadata).await?;

        let encrypted_key_header = match (&existing, storage_options.storage_intent) {
            (Some(existing), StorageIntent::MetadataOnly) => existing.encrypted_key_header.clone(),
            _ if metadata.is_encrypted => {
                EncryptedKeyHeader::wrap_with_random_iv(&key_header, &self.drives.storage_key(drive.id)?)?
            }
            _ => EncryptedKeyHeader::empty(),
        };

        let access_control_list = upload_metadata
            .access_control_list
            .clone()
            .ok_or_else(|| ServiceError::client(ClientErrorCode::MissingUploadData, "access control list must be specified"))?;
        let header = ServerFileHeader {
            server_metadata: ServerMetadata {
                access_control_list,
                allow_distribution: upload_metadata.allow_distribution,
                file_system_type: storage_options.file_system_type,
                original_recipient_count: instruction_set.recipients().len(),
                file_byte_count: byte_count(&metadata.payloads),
            },
            encrypted_key_header,
            file_metadata: metadata,
        };

        match existing {
            Some(_) => self.storage.overwrite_file(&file, &header).await?,
            None => self.storage.commit_new_file(&file, &header).await?,
        }
        info!(
            file = %file,
            global_transit_id = ?header.file_metadata.global_transit_id,
            payloads = header.file_metadata.payloads.len(),
            "upload committed"
        );

        let recipient_status = match &instruction_set.transit_options {
            Some(options) if !options.recipients.is_empty() => {
                self.sender
                    .send_file(ctx, file, options, storage_options.file_system_type)
                    .await?
            }
            _ => BTreeMap::new(),
        };

        Ok(UploadResult {
            file: ExternalFileIdentifier {
                target_drive: drive.target_drive,
                file_id: file.file_id,
            },
            global_transit_id: header.file_metadata.global_transit_id,
            new_version_tag: header.file_metadata.version_tag,
            recipient_status,
        })
    }
}

/// The file key the client sent, opened with its shared secret.
pub(crate) fn client_key_header(ctx: &CallerContext, descriptor: &UploadFileDescriptor) -> ServiceResult<KeyHeader> {
    match (&descriptor.encrypted_key_header, descriptor.file_metadata.is_encrypted) {
        (Some(encrypted), true) => Ok(encrypted.unwrap(ctx.shared_secret_key()?)?),
        (None, true) => Err(ServiceError::client(
            ClientErrorCode::MissingUploadData,
            "encrypted uploads must carry a key header",
        )),
        (_, false) => Ok(KeyHeader::empty()),
    }
}

/// Descriptors for every payload staged in `package`. Every payload the
/// manifest declares must have arrived.
pub(crate) fn package_payload_descriptors(package: &UploadPackage, now: i64) -> ServiceResult<Vec<PayloadDescriptor>> {
    for declared in &package.manifest().payload_descriptors {
        let uploading = declared.payload_update_operation_type == PayloadUpdateOperationType::AppendOrOverwrite;
        if uploading && !package.has_payload(&declared.payload_key) {
            return Err(invalid_upload(format!(
                "payload '{}' is declared but was not uploaded",
                declared.payload_key
            )));
        }
    }

    Ok(package
        .payloads
        .iter()
        .map(|p| PayloadDescriptor {
            key: p.key.clone(),
            uid: p.uid,
            iv: p.iv.clone(),
            content_type: p.content_type.clone(),
            bytes_written: p.bytes_written,
            last_modified: now,
            descriptor_content: p.descriptor_content.clone(),
            preview_thumbnail: p.preview_thumbnail.clone(),
            thumbnails: package
                .thumbnails_for(&p.key)
                .map(|t| ThumbnailDescriptor {
                    pixel_width: t.pixel_width,
                    pixel_height: t.pixel_height,
                    content_type: t.content_type.clone(),
                    bytes_written: t.bytes_written,
                })
                .collect(),
        })
        .collect())
}

pub(crate) fn byte_count(payloads: &[PayloadDescriptor]) -> u64 {
    payloads
        .iter()
        .map(|p| p.bytes_written + p.thumbnails.iter().map(|t| t.bytes_written).sum::<u64>())
        .sum()
}

/// A client unique id may be used by one file per drive.
pub(crate) async fn assert_unique_id_is_free(storage: &dyn DriveStorage, metadata: &FileMetadata) -> ServiceResult<()> {
    let (Some(unique_id), Some(file)) = (metadata.app_data.unique_id, metadata.file) else {
        return Ok(());
    };
    match storage.find_by_unique_id(file.drive_id, unique_id).await? {
        Some(other) if other.file() != Some(file) => Err(ServiceError::client(
            ClientErrorCode::ExistingFileWithUniqueId,
            format!("unique id {unique_id} is already used on this drive"),
        )),
        _ => Ok(()),
    }
}
