// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Files arriving from connected identities.
//!
//! Transfers are written straight into the target drive. Re-delivery of a
//! version already stored is acknowledged without touching storage, so an
//! outbox sweep may resend safely.

use tracing::{info, warn};

use super::PeerPerimeterService;
use crate::auth::CallerContext;
use crate::crypto::EncryptedKeyHeader;
use crate::drive::metadata::{FileMetadata, ServerFileHeader, ServerMetadata};
use crate::drive::{file_system_for, SecurityGroupType, StorageDrive};
use crate::error::ServiceResult;
use crate::models::{unix_millis_now, IdentityId, InternalDriveFileId};
use crate::transit::types::PeerResponseCode;
use crate::transit::wire::{
    DeleteRemoteFileRequest, EncryptedRecipientTransferInstructionSet, HostToHostTransfer, PeerTransferResponse,
    TransferFileType, TransferPart,
};
use crate::upload::assembler::byte_count;
use crate::upload::update::merge_payloads;

fn response(code: PeerResponseCode, message: impl Into<String>) -> PeerTransferResponse {
    PeerTransferResponse {
        code,
        message: Some(message.into()),
    }
}

fn accepted() -> PeerTransferResponse {
    PeerTransferResponse {
        code: PeerResponseCode::AcceptedDirectWrite,
        message: None,
    }
}

impl PeerPerimeterService {
    fn connected_sender(ctx: &CallerContext) -> Option<&IdentityId> {
        (ctx.caller.security_level == SecurityGroupType::Connected)
            .then(|| ctx.caller_identity())
            .flatten()
    }

    fn receiving_drive(&self, instructions: &EncryptedRecipientTransferInstructionSet) -> ServiceResult<Option<StorageDrive>> {
        Ok(self
            .drives
            .get_drive_by_target(&instructions.target_drive)?
            .filter(|d| !d.is_system))
    }

    /// Store a file sent by a connected identity.
    pub async fn accept_transfer(
        &self,
        ctx: &CallerContext,
        transfer: HostToHostTransfer,
    ) -> ServiceResult<PeerTransferResponse> {
        let Some(sender) = Self::connected_sender(ctx) else {
            return Ok(response(PeerResponseCode::AccessDenied, "only connected identities may send files"));
        };
        let HostToHostTransfer {
            instructions,
            metadata,
            parts,
        } = transfer;

        let Some(drive) = self.receiving_drive(&instructions)? else {
            return Ok(response(PeerResponseCode::Rejected, "target drive does not exist"));
        };
        let Some(global_transit_id) = metadata.global_transit_id else {
            return Ok(response(PeerResponseCode::Rejected, "transfers need a global transit id"));
        };
        if let Err(e) = file_system_for(instructions.file_system_type).validate_metadata(&metadata) {
            return Ok(response(PeerResponseCode::Rejected, e.to_string()));
        }

        let encrypted_key_header = if metadata.is_encrypted {
            let storage_key = self.drives.storage_key(drive.id)?;
            match instructions
                .shared_secret_encrypted_key_header
                .rewrap(ctx.shared_secret_key()?, &storage_key)
            {
                Ok(key_header) => key_header,
                Err(_) => {
                    warn!(tenant = %self.tenant, sender = %sender, "transfer key header did not open");
                    return Ok(response(PeerResponseCode::Rejected, "key header could not be opened"));
                }
            }
        } else {
            EncryptedKeyHeader::empty()
        };

        let existing = self
            .storage
            .find_by_global_transit_id(drive.id, global_transit_id)
            .await?;
        if let Some(existing) = &existing {
            if existing.file_metadata.sender_identity.as_ref() != Some(sender) {
                return Ok(response(
                    PeerResponseCode::AccessDenied,
                    "file was sent by another identity",
                ));
            }
            if existing.file_metadata.version_tag == metadata.version_tag {
                info!(tenant = %self.tenant, sender = %sender, global_transit_id = %global_transit_id, "duplicate transfer acknowledged");
                return Ok(accepted());
            }
        }

        match instructions.transfer_file_type {
            TransferFileType::Normal => {
                self.store_new_version(sender, &drive, &instructions, metadata, parts, encrypted_key_header, existing)
                    .await
            }
            TransferFileType::Update => match existing {
                Some(existing) => {
                    self.apply_update(sender, &instructions, metadata, parts, existing)
                        .await
                }
                None => Ok(response(PeerResponseCode::Rejected, "no copy of the file to update")),
            },
        }
    }

    async fn write_parts(&self, file: &InternalDriveFileId, parts: &[TransferPart]) -> ServiceResult<u64> {
        let mut written = 0;
        for part in parts {
            written += self.storage.write_temp_stream(file, &part.name, &part.bytes).await?;
        }
        Ok(written)
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_new_version(
        &self,
        sender: &IdentityId,
        drive: &StorageDrive,
        instructions: &EncryptedRecipientTransferInstructionSet,
        mut metadata: FileMetadata,
        parts: Vec<TransferPart>,
        encrypted_key_header: EncryptedKeyHeader,
        existing: Option<ServerFileHeader>,
    ) -> ServiceResult<PeerTransferResponse> {
        let file = existing
            .as_ref()
            .and_then(ServerFileHeader::file)
            .unwrap_or_else(|| self.storage.create_file_id(drive.id));
        let file_byte_count = self.write_parts(&file, &parts).await?;

        metadata.file = Some(file);
        metadata.sender_identity = Some(sender.clone());
        metadata.updated = unix_millis_now();
        if let Some(existing) = &existing {
            metadata.created = existing.file_metadata.created;
        }

        let header = ServerFileHeader {
            encrypted_key_header,
            file_metadata: metadata,
            server_metadata: ServerMetadata {
                access_control_list: instructions.access_control_list.clone(),
                allow_distribution: false,
                file_system_type: instructions.file_system_type,
                original_recipient_count: 0,
                file_byte_count,
            },
        };

        let stored = match existing {
            Some(_) => self.storage.overwrite_file(&file, &header).await,
            None => self.storage.commit_new_file(&file, &header).await,
        };
        if let Err(e) = stored {
            if let Err(cleanup) = self.storage.delete_temp_files(&file).await {
                warn!(file = %file, error = %cleanup, "could not clean up transfer parts");
            }
            return Err(e.into());
        }

        info!(tenant = %self.tenant, sender = %sender, file = %file, "transfer stored");
        Ok(accepted())
    }

    async fn apply_update(
        &self,
        sender: &IdentityId,
        instructions: &EncryptedRecipientTransferInstructionSet,
        metadata: FileMetadata,
        parts: Vec<TransferPart>,
        existing: ServerFileHeader,
    ) -> ServiceResult<PeerTransferResponse> {
        let Some(file) = existing.file() else {
            return Ok(response(PeerResponseCode::Rejected, "stored copy has no address"));
        };
        self.write_parts(&file, &parts).await?;

        let mut header = existing;
        header.file_metadata.payloads =
            merge_payloads(&header.file_metadata.payloads, &metadata.payloads, &instructions.payload_instructions);
        header.file_metadata.app_data = metadata.app_data;
        header.file_metadata.version_tag = metadata.version_tag;
        header.file_metadata.updated = unix_millis_now();
        header.server_metadata.access_control_list = instructions.access_control_list.clone();
        header.server_metadata.file_byte_count = byte_count(&header.file_metadata.payloads);

        self.storage.update_batch(&file, &header).await?;
        info!(tenant = %self.tenant, sender = %sender, file = %file, "transferred update applied");
        Ok(accepted())
    }

    /// Remove the copy of a file that the calling identity sent here.
    pub async fn delete_linked_file(
        &self,
        ctx: &CallerContext,
        request: DeleteRemoteFileRequest,
    ) -> ServiceResult<PeerTransferResponse> {
        let Some(sender) = Self::connected_sender(ctx) else {
            return Ok(response(PeerResponseCode::AccessDenied, "only connected identities may delete files"));
        };
        let Some(drive) = self
            .drives
            .get_drive_by_target(&request.target.target_drive)?
            .filter(|d| !d.is_system)
        else {
            return Ok(response(PeerResponseCode::Rejected, "target drive does not exist"));
        };

        let Some(existing) = self
            .storage
            .find_by_global_transit_id(drive.id, request.target.global_transit_id)
            .await?
        else {
            return Ok(accepted());
        };
        if existing.file_metadata.sender_identity.as_ref() != Some(sender) {
            return Ok(response(PeerResponseCode::AccessDenied, "file was sent by another identity"));
        }
        if let Some(file) = existing.file() {
            self.storage.hard_delete(&file).await?;
            info!(tenant = %self.tenant, sender = %sender, file = %file, "linked file deleted");
        }
        Ok(accepted())
    }
}
