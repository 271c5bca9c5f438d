// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payload-level updates of existing files.
//!
//! Parts are staged through the same package registry as uploads; only the
//! instruction set and the finalize step differ.
//!
//! - **Local**: the file lives here. Its payloads are merged, the version tag
//!   is bumped and the change is queued for every listed recipient.
//! - **Peer**: the file lives with the recipients. The new parts are held in
//!   the transient temp drive until every recipient has them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use super::assembler::{
    assert_unique_id_is_free, byte_count, client_key_header, package_payload_descriptors, reject_self_recipient,
    UploadPackageAssembler,
};
use super::descriptor::UploadFileDescriptor;
use super::instruction_set::{FileUpdateInstructionSet, PayloadUpdateOperationType, StorageIntent, UpdateLocale};
use super::package::{PackageId, PackageInstructions, UploadPackage};
use super::validator::{AccessControlValidator, UploadCandidate};
use crate::auth::{CallerContext, PermissionKey};
use crate::crypto::{EncryptedKeyHeader, KeyHeader};
use crate::drive::metadata::{FileMetadata, PayloadDescriptor, ServerFileHeader, ServerMetadata};
use crate::drive::{file_system_for, DriveManager, DriveStorage, FileSystemType};
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::{
    unix_millis_now, ExternalFileIdentifier, FileIdentifier, FileIdentifierKind, GlobalTransitIdFileIdentifier,
    IdentityId, InternalDriveFileId,
};
use crate::transit::sender::{PeerTransitSender, UpdateDistribution};
use crate::transit::types::TransferStatus;
use crate::transit::wire::PayloadInstruction;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    /// Local address of the updated file. Absent for peer updates.
    pub file: Option<ExternalFileIdentifier>,
    pub global_transit_id: Option<Uuid>,
    pub new_version_tag: Uuid,
    #[schema(value_type = Object)]
    pub recipient_status: BTreeMap<IdentityId, TransferStatus>,
}

/// `current` payloads after applying `instructions`, taking new descriptors
/// from `incoming`.
pub(crate) fn merge_payloads(
    current: &[PayloadDescriptor],
    incoming: &[PayloadDescriptor],
    instructions: &[PayloadInstruction],
) -> Vec<PayloadDescriptor> {
    let mut payloads = current.to_vec();
    for instruction in instructions {
        payloads.retain(|p| p.key != instruction.key);
        if instruction.operation_type == PayloadUpdateOperationType::AppendOrOverwrite {
            if let Some(descriptor) = incoming.iter().find(|p| p.key == instruction.key) {
                payloads.push(descriptor.clone());
            }
        }
    }
    payloads
}

fn missing_file() -> ServiceError {
    ServiceError::client(
        ClientErrorCode::CannotOverwriteNonExistentFile,
        "the file to update does not exist",
    )
}

pub struct FileUpdatePipeline {
    tenant: IdentityId,
    drives: Arc<DriveManager>,
    storage: Arc<dyn DriveStorage>,
    uploads: Arc<UploadPackageAssembler>,
    sender: Arc<PeerTransitSender>,
}

impl FileUpdatePipeline {
    pub fn new(
        tenant: IdentityId,
        drives: Arc<DriveManager>,
        storage: Arc<dyn DriveStorage>,
        uploads: Arc<UploadPackageAssembler>,
        sender: Arc<PeerTransitSender>,
    ) -> Self {
        Self {
            tenant,
            drives,
            storage,
            uploads,
            sender,
        }
    }

    async fn find_local(&self, drive_id: Uuid, identifier: &FileIdentifier) -> ServiceResult<Option<ServerFileHeader>> {
        Ok(match identifier.kind()? {
            FileIdentifierKind::File(file_id) => {
                self.storage
                    .get_server_file_header(&InternalDriveFileId::new(drive_id, file_id))
                    .await?
            }
            FileIdentifierKind::GlobalTransitId(gtid) => self.storage.find_by_global_transit_id(drive_id, gtid).await?,
            FileIdentifierKind::UniqueId(unique_id) => self.storage.find_by_unique_id(drive_id, unique_id).await?,
        })
    }

    /// Validate an update instruction set and open a package for its parts.
    /// Parts are added through the upload assembler.
    pub async fn create_package(
        &self,
        ctx: &CallerContext,
        mut instruction_set: FileUpdateInstructionSet,
    ) -> ServiceResult<PackageId> {
        instruction_set.assert_is_valid()?;
        reject_self_recipient(&self.tenant, &instruction_set.recipients)?;
        if !instruction_set.recipients.is_empty() {
            ctx.assert_has_permission(PermissionKey::UseTransitWrite)?;
        }

        let file = match instruction_set.locale {
            UpdateLocale::Local => {
                let drive_id = self.drives.get_drive_id(&instruction_set.file.target_drive)?;
                ctx.assert_can_write_to_drive(drive_id)?;
                self.find_local(drive_id, &instruction_set.file)
                    .await?
                    .and_then(|h| h.file())
                    .ok_or_else(missing_file)?
            }
            UpdateLocale::Peer => {
                let transient = self.drives.transient_temp_drive()?;
                self.storage.create_file_id(transient.id)
            }
        };

        instruction_set
            .manifest
            .assign_payload_uids(|| self.uploads.next_payload_uid());
        let locale = instruction_set.locale;
        let package = UploadPackage::new(file, PackageInstructions::Update(instruction_set), true);
        let id = self.uploads.register(package).await?;
        info!(package_id = %id, file = %file, locale = ?locale, "update package created");
        Ok(id)
    }

    /// Apply a staged update. The package is consumed whether or not this
    /// succeeds.
    pub async fn finalize_update(&self, ctx: &CallerContext, package_id: PackageId) -> ServiceResult<UpdateResult> {
        let package = self.uploads.take(package_id)?;
        let result = self.finalize(ctx, &package).await;
        if result.is_err() {
            self.uploads.discard_temp(&package.file).await;
        }
        result
    }

    async fn finalize(&self, ctx: &CallerContext, package: &UploadPackage) -> ServiceResult<UpdateResult> {
        let PackageInstructions::Update(instruction_set) = &package.instructions else {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidPackage,
                "package was opened for an upload",
            ));
        };
        let descriptor = self.uploads.open_descriptor(ctx, package).await?;
        let now = unix_millis_now();
        let incoming = package_payload_descriptors(package, now)?;
        let instructions: Vec<PayloadInstruction> = instruction_set
            .manifest
            .payload_descriptors
            .iter()
            .map(|d| PayloadInstruction {
                key: d.payload_key.clone(),
                operation_type: d.payload_update_operation_type,
            })
            .collect();

        match instruction_set.locale {
            UpdateLocale::Local => {
                self.update_local(ctx, instruction_set, package.file, &descriptor, incoming, instructions, now)
                    .await
            }
            UpdateLocale::Peer => {
                self.update_peer(ctx, instruction_set, package.file, &descriptor, incoming, instructions, now)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_local(
        &self,
        ctx: &CallerContext,
        instruction_set: &FileUpdateInstructionSet,
        file: InternalDriveFileId,
        descriptor: &UploadFileDescriptor,
        incoming: Vec<PayloadDescriptor>,
        instructions: Vec<PayloadInstruction>,
        now: i64,
    ) -> ServiceResult<UpdateResult> {
        let existing = self
            .storage
            .get_server_file_header(&file)
            .await?
            .ok_or_else(missing_file)?;
        let upload_metadata = &descriptor.file_metadata;

        match upload_metadata.version_tag {
            None => {
                return Err(ServiceError::client(
                    ClientErrorCode::MissingVersionTag,
                    "updating a file requires its current version tag",
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
        if upload_metadata.is_encrypted != existing.file_metadata.is_encrypted {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidUpload,
                "an update cannot change whether the file is encrypted",
            ));
        }
        let global_transit_id = existing.file_metadata.global_transit_id;
        if !instruction_set.recipients.is_empty() && global_transit_id.is_none() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidInstructionSet,
                "distributing an update needs a file with a global transit id",
            ));
        }

        let drive = self.drives.get_drive(file.drive_id)?;
        let key_header = if existing.file_metadata.is_encrypted {
            existing
                .encrypted_key_header
                .unwrap(&self.drives.storage_key(drive.id)?)?
        } else {
            KeyHeader::empty()
        };

        let mut metadata = existing.file_metadata.clone();
        metadata.payloads = merge_payloads(&existing.file_metadata.payloads, &incoming, &instructions);
        metadata.app_data = upload_metadata.app_data.clone();
        metadata.updated = now;
        metadata.version_tag = Uuid::new_v4();
        let access_control_list = upload_metadata
            .access_control_list
            .clone()
            .unwrap_or_else(|| existing.server_metadata.access_control_list.clone());

        AccessControlValidator::validate(&UploadCandidate {
            access_control_list: Some(&access_control_list),
            metadata: &metadata,
            key_header: &key_header,
            drive: &drive,
            storage_intent: StorageIntent::NewFileOrOverwrite,
        })?;
        let file_system = file_system_for(existing.server_metadata.file_system_type);
        file_system.validate_metadata(&metadata)?;
        file_system
            .validate_references(&self.drives, self.storage.as_ref(), &metadata)
            .await?;
        assert_unique_id_is_free(self.storage.as_ref(), &metadata).await?;

        let header = ServerFileHeader {
            encrypted_key_header: existing.encrypted_key_header.clone(),
            server_metadata: ServerMetadata {
                access_control_list,
                file_byte_count: byte_count(&metadata.payloads),
                ..existing.server_metadata.clone()
            },
            file_metadata: metadata,
        };
        self.storage.update_batch(&file, &header).await?;
        let new_version_tag = header.file_metadata.version_tag;
        info!(file = %file, version_tag = %new_version_tag, "local file updated");

        let recipient_status = match global_transit_id {
            Some(gtid) if !instruction_set.recipients.is_empty() => {
                self.sender
                    .update_file(
                        ctx,
                        UpdateDistribution {
                            file,
                            target: GlobalTransitIdFileIdentifier {
                                target_drive: drive.target_drive.clone(),
                                global_transit_id: gtid,
                            },
                            payload_instructions: instructions,
                            new_version_tag,
                            recipients: instruction_set.recipients.clone(),
                            app_notification: instruction_set
                                .app_notification_options
                                .clone()
                                .filter(|_| instruction_set.use_app_notification),
                            is_transient: false,
                        },
                    )
                    .await?
            }
            _ => BTreeMap::new(),
        };

        Ok(UpdateResult {
            file: Some(ExternalFileIdentifier {
                target_drive: drive.target_drive,
                file_id: file.file_id,
            }),
            global_transit_id,
            new_version_tag,
            recipient_status,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_peer(
        &self,
        ctx: &CallerContext,
        instruction_set: &FileUpdateInstructionSet,
        file: InternalDriveFileId,
        descriptor: &UploadFileDescriptor,
        incoming: Vec<PayloadDescriptor>,
        instructions: Vec<PayloadInstruction>,
        now: i64,
    ) -> ServiceResult<UpdateResult> {
        let Some(global_transit_id) = instruction_set.file.global_transit_id else {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidFileIdentifier,
                "peer updates must address the file by global transit id",
            ));
        };
        let upload_metadata = &descriptor.file_metadata;
        let key_header = client_key_header(ctx, descriptor)?;
        let drive = self.drives.transient_temp_drive()?;

        let metadata = FileMetadata {
            file: Some(file),
            global_transit_id: Some(global_transit_id),
            created: now,
            updated: now,
            is_encrypted: upload_metadata.is_encrypted,
            sender_identity: Some(self.tenant.clone()),
            original_recipient_list: instruction_set.recipients.clone(),
            app_data: upload_metadata.app_data.clone(),
            payloads: incoming,
            version_tag: Uuid::new_v4(),
            referenced_file: upload_metadata.referenced_file.clone(),
        };
        AccessControlValidator::validate(&UploadCandidate {
            access_control_list: upload_metadata.access_control_list.as_ref(),
            metadata: &metadata,
            key_header: &key_header,
            drive: &drive,
            storage_intent: StorageIntent::NewFileOrOverwrite,
        })?;
        let access_control_list = upload_metadata
            .access_control_list
            .clone()
            .ok_or_else(|| ServiceError::client(ClientErrorCode::MissingUploadData, "access control list must be specified"))?;

        let encrypted_key_header = if metadata.is_encrypted {
            EncryptedKeyHeader::wrap_with_random_iv(&key_header, &self.drives.storage_key(drive.id)?)?
        } else {
            EncryptedKeyHeader::empty()
        };
        let header = ServerFileHeader {
            encrypted_key_header,
            server_metadata: ServerMetadata {
                access_control_list,
                allow_distribution: true,
                file_system_type: FileSystemType::default(),
                original_recipient_count: instruction_set.recipients.len(),
                file_byte_count: byte_count(&metadata.payloads),
            },
            file_metadata: metadata,
        };
        self.storage.commit_new_file(&file, &header).await?;
        let new_version_tag = header.file_metadata.version_tag;
        info!(file = %file, global_transit_id = %global_transit_id, "peer update staged in transient drive");

        let recipient_status = self
            .sender
            .update_file(
                ctx,
                UpdateDistribution {
                    file,
                    target: GlobalTransitIdFileIdentifier {
                        target_drive: instruction_set.file.target_drive.clone(),
                        global_transit_id,
                    },
                    payload_instructions: instructions,
                    new_version_tag,
                    recipients: instruction_set.recipients.clone(),
                    app_notification: instruction_set
                        .app_notification_options
                        .clone()
                        .filter(|_| instruction_set.use_app_notification),
                    is_transient: true,
                },
            )
            .await?;

        Ok(UpdateResult {
            file: None,
            global_transit_id: Some(global_transit_id),
            new_version_tag,
            recipient_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frodo, sam, sample_payload, TestWorld, UpdateFixture, UploadFixture};
    use crate::upload::instruction_set::{ScheduleOptions, TransitOptions};

    #[test]
    fn merge_replaces_and_deletes_payloads() {
        let current = vec![sample_payload("doc", 1), sample_payload("img", 2)];
        let incoming = vec![sample_payload("doc", 3), sample_payload("new", 4)];

        let merged = merge_payloads(
            &current,
            &incoming,
            &[
                PayloadInstruction {
                    key: "doc".to_string(),
                    operation_type: PayloadUpdateOperationType::AppendOrOverwrite,
                },
                PayloadInstruction {
                    key: "img".to_string(),
                    operation_type: PayloadUpdateOperationType::DeletePayload,
                },
                PayloadInstruction {
                    key: "new".to_string(),
                    operation_type: PayloadUpdateOperationType::AppendOrOverwrite,
                },
            ],
        );
        let keys: Vec<(&str, u64)> = merged.iter().map(|p| (p.key.as_str(), p.uid)).collect();
        assert_eq!(keys, vec![("doc", 3), ("new", 4)]);
    }

    #[tokio::test]
    async fn local_update_swaps_payloads_and_bumps_version() {
        let world = TestWorld::new(&[frodo()]).await;
        let drive = world.create_drive(&frodo(), false, false);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        fixture.add_payload("img", &[]);
        let uploaded = fixture.upload(&world, &frodo(), &owner).await.unwrap();

        let mut update = UpdateFixture::local(&drive, uploaded.file.file_id, uploaded.new_version_tag);
        update.replace_payload("doc", b"second draft");
        update.delete_payload("img");
        let updated = update.apply(&world, &frodo(), &owner).await.unwrap();
        assert_ne!(updated.new_version_tag, uploaded.new_version_tag);

        let storage = &world.tenant(&frodo()).storage;
        let file = InternalDriveFileId::new(drive.id, uploaded.file.file_id);
        let header = storage.get_server_file_header(&file).await.unwrap().unwrap();
        assert_eq!(header.file_metadata.version_tag, updated.new_version_tag);
        assert_eq!(header.file_metadata.payloads.len(), 1);
        let doc = header.file_metadata.get_payload("doc").unwrap();
        assert_eq!(storage.get_payload(&file, doc).await.unwrap(), b"second draft");
    }

    #[tokio::test]
    async fn stale_update_is_rejected_without_changes() {
        let world = TestWorld::new(&[frodo()]).await;
        let drive = world.create_drive(&frodo(), false, false);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        let uploaded = fixture.upload(&world, &frodo(), &owner).await.unwrap();

        let mut update = UpdateFixture::local(&drive, uploaded.file.file_id, Uuid::new_v4());
        update.replace_payload("doc", b"lost edit");
        let err = update.apply(&world, &frodo(), &owner).await.unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::VersionTagMismatch));

        let file = InternalDriveFileId::new(drive.id, uploaded.file.file_id);
        let header = world
            .tenant(&frodo())
            .storage
            .get_server_file_header(&file)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header.file_metadata.version_tag, uploaded.new_version_tag);
    }

    #[tokio::test]
    async fn update_cannot_take_another_files_unique_id() {
        let world = TestWorld::new(&[frodo()]).await;
        let drive = world.create_drive(&frodo(), false, false);
        let owner = world.owner(&frodo());
        let unique_id = Uuid::new_v4();

        let mut taken = UploadFixture::new(&drive);
        taken.descriptor.file_metadata.app_data.unique_id = Some(unique_id);
        taken.upload(&world, &frodo(), &owner).await.unwrap();
        let other = UploadFixture::new(&drive).upload(&world, &frodo(), &owner).await.unwrap();

        let storage = &world.tenant(&frodo()).storage;
        let other_file = InternalDriveFileId::new(drive.id, other.file.file_id);
        let before = storage.get_server_file_header(&other_file).await.unwrap().unwrap();

        let mut update = UpdateFixture::local(&drive, other.file.file_id, other.new_version_tag);
        update.descriptor.file_metadata.app_data.unique_id = Some(unique_id);
        let err = update.apply(&world, &frodo(), &owner).await.unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::ExistingFileWithUniqueId));

        let after = storage.get_server_file_header(&other_file).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn local_update_reaches_recipient_copy_through_outbox() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let remote = world.mirror_drive(&sam(), &drive);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        fixture.instruction_set.transit_options = Some(TransitOptions {
            recipients: vec![sam()],
            use_global_transit_id: true,
            ..TransitOptions::default()
        });
        let uploaded = fixture.upload(&world, &frodo(), &owner).await.unwrap();
        assert_eq!(uploaded.recipient_status[&sam()], TransferStatus::TransferKeyCreated);

        let mut update = UpdateFixture::local(&drive, uploaded.file.file_id, uploaded.new_version_tag);
        update.instruction_set.recipients = vec![sam()];
        update.replace_payload("doc", b"edited");
        let updated = update.apply(&world, &frodo(), &owner).await.unwrap();
        assert_eq!(updated.recipient_status[&sam()], TransferStatus::Enqueued);

        let report = world.tenant(&frodo()).process_outbox().await.unwrap();
        assert_eq!(report.delivered, 1);

        let sam_storage = &world.tenant(&sam()).storage;
        let copy = sam_storage
            .find_by_global_transit_id(remote.id, uploaded.global_transit_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copy.file_metadata.version_tag, updated.new_version_tag);
        let doc = copy.file_metadata.get_payload("doc").unwrap();
        let bytes = sam_storage.get_payload(&copy.file().unwrap(), doc).await.unwrap();
        assert_eq!(bytes, b"edited");
    }

    #[tokio::test]
    async fn peer_update_goes_through_transient_drive() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let remote = world.mirror_drive(&sam(), &drive);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        fixture.instruction_set.transit_options = Some(TransitOptions {
            recipients: vec![sam()],
            use_global_transit_id: true,
            schedule: ScheduleOptions::SendNowAwaitResponse,
            is_transient: true,
            ..TransitOptions::default()
        });
        let uploaded = fixture.upload(&world, &frodo(), &owner).await.unwrap();
        let gtid = uploaded.global_transit_id.unwrap();
        assert!(world.tenant(&frodo()).storage.list_headers(drive.id).await.unwrap().is_empty());

        let mut update = UpdateFixture::peer(&drive, gtid, vec![sam()]);
        update.replace_payload("doc", b"from afar");
        let updated = update.apply(&world, &frodo(), &owner).await.unwrap();
        assert!(updated.file.is_none());
        assert_eq!(updated.recipient_status[&sam()], TransferStatus::Enqueued);

        let transient = world.tenant(&frodo()).drives.transient_temp_drive().unwrap();
        let tenant = world.tenant(&frodo());
        assert_eq!(tenant.storage.list_headers(transient.id).await.unwrap().len(), 1);

        let report = tenant.process_outbox().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(tenant.storage.list_headers(transient.id).await.unwrap().is_empty());

        let sam_storage = &world.tenant(&sam()).storage;
        let copy = sam_storage.find_by_global_transit_id(remote.id, gtid).await.unwrap().unwrap();
        assert_eq!(copy.file_metadata.version_tag, updated.new_version_tag);
        let doc = copy.file_metadata.get_payload("doc").unwrap();
        assert_eq!(sam_storage.get_payload(&copy.file().unwrap(), doc).await.unwrap(), b"from afar");
    }
}
