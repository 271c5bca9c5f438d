// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Distribution of committed files to connected identities.
//!
//! Every delivery goes through [`PeerTransitSender::deliver`], whether it is
//! the immediate attempt of an upload or an outbox sweep. Immediate attempts
//! are recorded in the outbox under a lease before they start, so a request
//! that goes away mid-send still leaves an item for the poller. Retryable
//! failures release the item to the next sweep; everything else is reported
//! back to the caller as a terminal [`TransferStatus`].

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::StatusCode;
use futures_util::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::icr::{ConnectionRegistry, PeerAccessToken};
use super::outbox::{FailureOutcome, Outbox, OutboxItem, OutboxWork};
use super::retry::{try_retry, ImmediateRetry};
use super::transport::{PeerReply, PeerRequest, PeerTransport};
use super::types::{DeleteLinkedFileStatus, PeerResponseCode, SendResult, TransferFailureReason, TransferStatus};
use super::wire::{
    DeleteRemoteFileRequest, EncryptedRecipientTransferInstructionSet, HostToHostTransfer, PayloadInstruction,
    PeerTransferResponse, TransferFileType, TransferPart,
};
use crate::auth::{CallerContext, PermissionKey};
use crate::crypto::{EncryptedKeyHeader, SensitiveByteArray};
use crate::drive::metadata::ServerFileHeader;
use crate::drive::storage::{payload_part_name, thumbnail_part_name};
use crate::drive::{DriveManager, DriveStorage, FileSystemType, SecurityGroupType};
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::{unix_millis_now, GlobalTransitIdFileIdentifier, IdentityId, InternalDriveFileId, TargetDrive};
use crate::upload::instruction_set::{
    AppNotificationOptions, PayloadUpdateOperationType, ScheduleOptions, SendContents, TransitOptions,
};

#[derive(Debug, Clone, Copy)]
pub struct SenderSettings {
    pub immediate_retry: ImmediateRetry,
    pub outbox_batch_size: usize,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            immediate_retry: ImmediateRetry::default(),
            outbox_batch_size: 100,
        }
    }
}

/// Counts from one outbox sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutboxSweepReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// An update to distribute to the recipients' copies of a file.
#[derive(Debug, Clone)]
pub struct UpdateDistribution {
    /// Local file holding the updated header and new parts.
    pub file: InternalDriveFileId,
    pub target: GlobalTransitIdFileIdentifier,
    pub payload_instructions: Vec<PayloadInstruction>,
    pub new_version_tag: Uuid,
    pub recipients: Vec<IdentityId>,
    pub app_notification: Option<AppNotificationOptions>,
    pub is_transient: bool,
}

struct DeliveryFailure {
    reason: TransferFailureReason,
    code: Option<PeerResponseCode>,
    detail: String,
}

impl DeliveryFailure {
    fn new(reason: TransferFailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            code: None,
            detail: detail.into(),
        }
    }

    fn with_code(mut self, code: PeerResponseCode) -> Self {
        self.code = Some(code);
        self
    }
}

pub struct PeerTransitSender {
    tenant: IdentityId,
    drives: Arc<DriveManager>,
    storage: Arc<dyn DriveStorage>,
    connections: Arc<ConnectionRegistry>,
    outbox: Arc<Outbox>,
    transport: Arc<dyn PeerTransport>,
    settings: SenderSettings,
}

impl PeerTransitSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant: IdentityId,
        drives: Arc<DriveManager>,
        storage: Arc<dyn DriveStorage>,
        connections: Arc<ConnectionRegistry>,
        outbox: Arc<Outbox>,
        transport: Arc<dyn PeerTransport>,
        settings: SenderSettings,
    ) -> Self {
        Self {
            tenant,
            drives,
            storage,
            connections,
            outbox,
            transport,
            settings,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn reject_self(&self, recipients: &[IdentityId]) -> ServiceResult<()> {
        if recipients.contains(&self.tenant) {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidRecipient,
                "cannot transfer to yourself",
            ));
        }
        Ok(())
    }

    // ========== Send ==========

    /// Distribute a committed file to `options.recipients`.
    pub async fn send_file(
        &self,
        ctx: &CallerContext,
        file: InternalDriveFileId,
        options: &TransitOptions,
        file_system_type: FileSystemType,
    ) -> ServiceResult<BTreeMap<IdentityId, TransferStatus>> {
        ctx.assert_has_permission(PermissionKey::UseTransitWrite)?;
        if options.recipients.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.reject_self(&options.recipients)?;

        let header = self
            .storage
            .get_server_file_header(&file)
            .await?
            .ok_or_else(|| ServiceError::client(ClientErrorCode::FileNotFound, format!("file {file} not found")))?;
        if header.file_metadata.global_transit_id.is_none() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidInstructionSet,
                "files sent to recipients need a global transit id",
            ));
        }

        let work = OutboxWork::SendFile {
            remote_target_drive: options.remote_target_drive.clone(),
            remote_global_transit_id: options.override_remote_global_transit_id,
            send_contents: options.send_contents,
            file_system_type,
            app_notification: options.app_notification_options.clone().filter(|_| options.use_app_notification),
        };
        let items: Vec<OutboxItem> = options
            .recipients
            .iter()
            .map(|r| OutboxItem::new(file, r.clone(), work.clone(), options.is_transient))
            .collect();

        match options.schedule {
            ScheduleOptions::SendLater => Ok(self.enqueue_all(items)),
            ScheduleOptions::SendNowAwaitResponse => {
                let icr_key = ctx.icr_key()?;
                Ok(self.send_now(file, items, icr_key, options.is_transient).await)
            }
        }
    }

    fn enqueue_all(&self, items: Vec<OutboxItem>) -> BTreeMap<IdentityId, TransferStatus> {
        let mut statuses = BTreeMap::new();
        for item in items {
            let status = match self.outbox.add(&item) {
                Ok(()) => {
                    info!(recipient = %item.recipient, file = %item.file, "transfer enqueued");
                    TransferStatus::Enqueued
                }
                Err(e) => {
                    error!(recipient = %item.recipient, file = %item.file, error = %e, "could not enqueue transfer");
                    TransferStatus::EnqueueFailed
                }
            };
            statuses.insert(item.recipient, status);
        }
        statuses
    }

    async fn send_now(
        &self,
        file: InternalDriveFileId,
        items: Vec<OutboxItem>,
        icr_key: &SensitiveByteArray,
        is_transient: bool,
    ) -> BTreeMap<IdentityId, TransferStatus> {
        let now = unix_millis_now();
        let leased: Vec<bool> = items
            .iter()
            .map(|item| match self.outbox.add_leased(item, now) {
                Ok(()) => true,
                Err(e) => {
                    error!(recipient = %item.recipient, file = %file, error = %e, "could not record transfer before sending");
                    false
                }
            })
            .collect();

        let results = join_all(items.iter().map(|item| self.deliver(item, icr_key))).await;

        let mut statuses = BTreeMap::new();
        let mut any_pending = false;
        for ((item, result), leased) in items.into_iter().zip(results).zip(leased) {
            let status = if result.success {
                info!(recipient = %item.recipient, file = %file, "transfer delivered");
                self.settle(&item, leased);
                TransferStatus::TransferKeyCreated
            } else if result.should_retry {
                warn!(
                    recipient = %item.recipient,
                    file = %file,
                    reason = ?result.failure_reason,
                    "transfer failed, handed to outbox"
                );
                if self.hand_to_outbox(&item, leased, now) {
                    any_pending = true;
                    TransferStatus::PendingRetry
                } else {
                    TransferStatus::EnqueueFailed
                }
            } else {
                let reason = result.failure_reason.unwrap_or(TransferFailureReason::UnknownError);
                warn!(recipient = %item.recipient, file = %file, reason = ?reason, "transfer rejected");
                self.settle(&item, leased);
                reason.terminal_status()
            };
            statuses.insert(item.recipient, status);
        }

        if is_transient && !any_pending {
            match self.storage.hard_delete(&file).await {
                Ok(()) => info!(file = %file, "transient file removed after delivery"),
                Err(e) => error!(file = %file, error = %e, "could not remove transient file"),
            }
        }
        statuses
    }

    /// Drop the leased record of an attempt that needs no retry. A record
    /// that cannot be dropped is retried once its lease runs out.
    fn settle(&self, item: &OutboxItem, leased: bool) {
        if !leased {
            return;
        }
        if let Err(e) = self.outbox.remove(item.id) {
            error!(item_id = %item.id, recipient = %item.recipient, error = %e, "could not clear finished transfer");
        }
    }

    /// Make a failed attempt due for the next sweep. Returns whether the
    /// outbox holds it.
    fn hand_to_outbox(&self, item: &OutboxItem, leased: bool, now: i64) -> bool {
        let handed = if leased {
            self.outbox.release(item.id, now)
        } else {
            self.outbox.add(item).map(|()| true)
        };
        match handed {
            Ok(true) => true,
            Ok(false) => {
                warn!(item_id = %item.id, recipient = %item.recipient, "leased transfer left the outbox");
                false
            }
            // A leased item that cannot be released comes back after the lease.
            Err(e) if leased => {
                warn!(item_id = %item.id, recipient = %item.recipient, error = %e, "could not release transfer");
                true
            }
            Err(e) => {
                error!(item_id = %item.id, recipient = %item.recipient, error = %e, "could not enqueue transfer");
                false
            }
        }
    }

    /// Queue an update for the recipients' copies of a file.
    pub async fn update_file(
        &self,
        ctx: &CallerContext,
        update: UpdateDistribution,
    ) -> ServiceResult<BTreeMap<IdentityId, TransferStatus>> {
        ctx.assert_has_permission(PermissionKey::UseTransitWrite)?;
        self.reject_self(&update.recipients)?;
        if !update.target.is_valid() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidFileIdentifier,
                "updates need the global transit id of the file",
            ));
        }

        let work = OutboxWork::UpdateFile {
            target: update.target,
            payload_instructions: update.payload_instructions,
            new_version_tag: update.new_version_tag,
            app_notification: update.app_notification,
        };
        let items = update
            .recipients
            .into_iter()
            .map(|r| OutboxItem::new(update.file, r, work.clone(), update.is_transient))
            .collect();
        Ok(self.enqueue_all(items))
    }

    // ========== Delivery ==========

    /// One delivery attempt for one outbox item, including short retries of
    /// transport failures.
    pub async fn deliver(&self, item: &OutboxItem, icr_key: &SensitiveByteArray) -> SendResult {
        match self.try_deliver(item, icr_key).await {
            Ok(code) => SendResult::delivered(item.recipient.clone(), code, item.id),
            Err(failure) => {
                warn!(
                    recipient = %item.recipient,
                    file = %item.file,
                    reason = ?failure.reason,
                    error = %failure.detail,
                    "delivery attempt failed"
                );
                SendResult::failed(item.recipient.clone(), failure.reason, failure.code, item.id)
            }
        }
    }

    async fn try_deliver(
        &self,
        item: &OutboxItem,
        icr_key: &SensitiveByteArray,
    ) -> Result<PeerResponseCode, DeliveryFailure> {
        let header = self
            .storage
            .get_server_file_header(&item.file)
            .await
            .map_err(|e| DeliveryFailure::new(TransferFailureReason::UnknownError, e.to_string()))?
            .ok_or_else(|| DeliveryFailure::new(TransferFailureReason::SourceFileMissing, "source file is gone"))?;

        if !header.server_metadata.allow_distribution {
            return Err(DeliveryFailure::new(
                TransferFailureReason::FileDoesNotAllowDistribution,
                "file does not allow distribution",
            ));
        }

        let icr = self
            .connections
            .get_identity_connection_registration(&item.recipient)
            .map_err(|e| DeliveryFailure::new(TransferFailureReason::UnknownError, e.to_string()))?
            .filter(|icr| icr.is_connected())
            .ok_or_else(|| DeliveryFailure::new(TransferFailureReason::NotConnected, "recipient is not connected"))?;

        if !header.server_metadata.access_control_list.is_satisfied_by(
            SecurityGroupType::Connected,
            Some(&item.recipient),
            &icr.circles,
        ) {
            return Err(DeliveryFailure::new(
                TransferFailureReason::RecipientDoesNotHavePermissionToFileAcl,
                "recipient is not allowed by the file ACL",
            ));
        }

        let PeerAccessToken { token, shared_secret } = self
            .connections
            .resolve_outgoing(&item.recipient, icr_key)
            .map_err(|e| DeliveryFailure::new(TransferFailureReason::EncryptionFailed, e.to_string()))?
            .ok_or_else(|| DeliveryFailure::new(TransferFailureReason::NotConnected, "recipient is not connected"))?;

        // Only the token travels with the transfer.
        let shared_secret_encrypted_key_header = if header.file_metadata.is_encrypted {
            let storage_key = self
                .drives
                .storage_key(item.file.drive_id)
                .map_err(|e| DeliveryFailure::new(TransferFailureReason::EncryptionFailed, e.to_string()))?;
            header
                .encrypted_key_header
                .rewrap(&storage_key, &shared_secret)
                .map_err(|e| DeliveryFailure::new(TransferFailureReason::EncryptionFailed, e.to_string()))?
        } else {
            EncryptedKeyHeader::empty()
        };
        drop(shared_secret);

        let transfer = self
            .build_transfer(item, &header, shared_secret_encrypted_key_header)
            .await
            .map_err(|e| DeliveryFailure::new(TransferFailureReason::UnknownError, e.to_string()))?;

        let reply = try_retry(
            self.settings.immediate_retry,
            |_| true,
            || {
                self.transport.send(
                    &self.tenant,
                    &item.recipient,
                    Some(&token),
                    PeerRequest::SendHostToHost(transfer.clone()),
                )
            },
        )
        .await
        .map_err(|e| DeliveryFailure::new(TransferFailureReason::TransportFailure, e.to_string()))?;

        map_transfer_reply(&item.recipient, reply)
    }

    async fn build_transfer(
        &self,
        item: &OutboxItem,
        header: &ServerFileHeader,
        shared_secret_encrypted_key_header: EncryptedKeyHeader,
    ) -> ServiceResult<HostToHostTransfer> {
        let mut metadata = header.file_metadata.redacted();
        let mut parts = Vec::new();

        let instructions = match &item.work {
            OutboxWork::SendFile {
                remote_target_drive,
                remote_global_transit_id,
                send_contents,
                file_system_type,
                app_notification,
            } => {
                if let Some(gtid) = remote_global_transit_id {
                    metadata.global_transit_id = Some(*gtid);
                }
                for payload in &header.file_metadata.payloads {
                    if send_contents.contains(SendContents::PAYLOAD) {
                        let bytes = self.storage.get_payload(&item.file, payload).await?;
                        parts.push(TransferPart {
                            name: payload_part_name(&payload.key, payload.uid),
                            bytes,
                        });
                    }
                    if send_contents.contains(SendContents::THUMBNAILS) {
                        for thumb in &payload.thumbnails {
                            let bytes = self
                                .storage
                                .get_thumbnail(&item.file, payload, thumb.pixel_width, thumb.pixel_height)
                                .await?;
                            parts.push(TransferPart {
                                name: thumbnail_part_name(&payload.key, payload.uid, thumb.pixel_width, thumb.pixel_height),
                                bytes,
                            });
                        }
                    }
                }
                if !send_contents.contains(SendContents::PAYLOAD) {
                    metadata.payloads.clear();
                } else if !send_contents.contains(SendContents::THUMBNAILS) {
                    for payload in &mut metadata.payloads {
                        payload.thumbnails.clear();
                    }
                }

                let target_drive = match remote_target_drive {
                    Some(drive) => drive.clone(),
                    None => self.drives.get_drive(item.file.drive_id)?.target_drive,
                };
                EncryptedRecipientTransferInstructionSet {
                    target_drive,
                    transfer_file_type: TransferFileType::Normal,
                    file_system_type: *file_system_type,
                    shared_secret_encrypted_key_header,
                    access_control_list: header.server_metadata.access_control_list.clone(),
                    payload_instructions: Vec::new(),
                    app_notification_options: app_notification.clone(),
                }
            }
            OutboxWork::UpdateFile {
                target,
                payload_instructions,
                new_version_tag,
                app_notification,
            } => {
                metadata.global_transit_id = Some(target.global_transit_id);
                metadata.version_tag = *new_version_tag;
                for instruction in payload_instructions
                    .iter()
                    .filter(|i| i.operation_type == PayloadUpdateOperationType::AppendOrOverwrite)
                {
                    let Some(payload) = header.file_metadata.get_payload(&instruction.key) else {
                        continue;
                    };
                    parts.push(TransferPart {
                        name: payload_part_name(&payload.key, payload.uid),
                        bytes: self.storage.get_payload(&item.file, payload).await?,
                    });
                    for thumb in &payload.thumbnails {
                        parts.push(TransferPart {
                            name: thumbnail_part_name(&payload.key, payload.uid, thumb.pixel_width, thumb.pixel_height),
                            bytes: self
                                .storage
                                .get_thumbnail(&item.file, payload, thumb.pixel_width, thumb.pixel_height)
                                .await?,
                        });
                    }
                }
                EncryptedRecipientTransferInstructionSet {
                    target_drive: target.target_drive.clone(),
                    transfer_file_type: TransferFileType::Update,
                    file_system_type: header.server_metadata.file_system_type,
                    shared_secret_encrypted_key_header,
                    access_control_list: header.server_metadata.access_control_list.clone(),
                    payload_instructions: payload_instructions.clone(),
                    app_notification_options: app_notification.clone(),
                }
            }
        };

        Ok(HostToHostTransfer {
            instructions,
            metadata,
            parts,
        })
    }

    // ========== Outbox ==========

    /// Attempt every due outbox item once. `icr_key` opens the outgoing
    /// connection tokens; sweeps run without a caller.
    pub async fn process_outbox(&self, icr_key: &SensitiveByteArray) -> ServiceResult<OutboxSweepReport> {
        let now = unix_millis_now();
        let items = self.outbox.due_items(now, self.settings.outbox_batch_size)?;
        let mut report = OutboxSweepReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        let results = join_all(items.iter().map(|item| self.deliver(item, icr_key))).await;
        for (item, result) in items.iter().zip(results) {
            if result.success {
                if let Err(e) = self.outbox.mark_complete(item.id) {
                    warn!(item_id = %item.id, error = %e, "delivered item already left the outbox");
                }
                report.delivered += 1;
            } else if result.should_retry {
                let reason = format!("{:?}", result.failure_reason.unwrap_or(TransferFailureReason::UnknownError));
                match self.outbox.record_failure(item.id, &reason, now) {
                    Ok(FailureOutcome::Rescheduled { attempt, next_attempt_at }) => {
                        info!(
                            recipient = %item.recipient,
                            attempt,
                            next_attempt_at,
                            "outbox item rescheduled"
                        );
                        report.rescheduled += 1;
                    }
                    Ok(FailureOutcome::Dropped) => {
                        error!(
                            recipient = %item.recipient,
                            file = %item.file,
                            attempts = item.attempt_count + 1,
                            "outbox item dropped after exhausting attempts"
                        );
                        report.dropped += 1;
                    }
                    // The item keeps its lease and comes back when it runs out.
                    Err(e) => {
                        error!(item_id = %item.id, recipient = %item.recipient, error = %e, "could not record failed delivery");
                        report.rescheduled += 1;
                    }
                }
            } else {
                if let Err(e) = self.outbox.remove(item.id) {
                    error!(item_id = %item.id, error = %e, "could not remove failed outbox item");
                }
                error!(
                    recipient = %item.recipient,
                    file = %item.file,
                    reason = ?result.failure_reason,
                    "outbox item failed permanently"
                );
                report.failed += 1;
            }

            if item.is_transient {
                self.remove_transient_file(&item.file).await;
            }
        }

        info!(
            tenant = %self.tenant,
            delivered = report.delivered,
            rescheduled = report.rescheduled,
            dropped = report.dropped,
            failed = report.failed,
            "outbox sweep finished"
        );
        Ok(report)
    }

    /// Delete a transient file once no outbox item refers to it.
    async fn remove_transient_file(&self, file: &InternalDriveFileId) {
        match self.outbox.items_for_file(file) {
            Ok(pending) if pending.is_empty() => match self.storage.hard_delete(file).await {
                Ok(()) => info!(file = %file, "transient file removed after its last delivery"),
                Err(e) => error!(file = %file, error = %e, "could not remove transient file"),
            },
            Ok(_) => {}
            Err(e) => error!(file = %file, error = %e, "could not look up pending deliveries"),
        }
    }

    // ========== Linked file deletion ==========

    /// Ask each recipient to delete its copy of a file it received from
    /// this identity.
    pub async fn send_delete_linked_file(
        &self,
        ctx: &CallerContext,
        target_drive: &TargetDrive,
        global_transit_id: Uuid,
        recipients: &[IdentityId],
    ) -> ServiceResult<BTreeMap<IdentityId, DeleteLinkedFileStatus>> {
        ctx.assert_has_permission(PermissionKey::UseTransitWrite)?;
        self.reject_self(recipients)?;
        let icr_key = ctx.icr_key()?;
        let request = DeleteRemoteFileRequest {
            target: GlobalTransitIdFileIdentifier {
                target_drive: target_drive.clone(),
                global_transit_id,
            },
        };

        let mut statuses = BTreeMap::new();
        for recipient in recipients {
            let status = match self.connections.resolve_outgoing(recipient, icr_key)? {
                None => DeleteLinkedFileStatus::RemoteServerFailed,
                Some(access) => {
                    let reply = try_retry(
                        self.settings.immediate_retry,
                        |_| true,
                        || {
                            self.transport.send(
                                &self.tenant,
                                recipient,
                                Some(&access.token),
                                PeerRequest::DeleteLinkedFile(request.clone()),
                            )
                        },
                    )
                    .await;
                    match reply {
                        Ok(reply) if reply.status == StatusCode::OK => match reply.decode::<PeerTransferResponse>() {
                            Ok(response) if response.code.is_accepted() => DeleteLinkedFileStatus::RequestAccepted,
                            _ => DeleteLinkedFileStatus::RemoteServerFailed,
                        },
                        Ok(_) => DeleteLinkedFileStatus::RemoteServerFailed,
                        Err(e) => {
                            warn!(recipient = %recipient, error = %e, "delete linked file request failed");
                            DeleteLinkedFileStatus::RemoteServerFailed
                        }
                    }
                }
            };
            info!(recipient = %recipient, status = ?status, "delete linked file sent");
            statuses.insert(recipient.clone(), status);
        }
        Ok(statuses)
    }
}

fn map_transfer_reply(recipient: &IdentityId, reply: PeerReply) -> Result<PeerResponseCode, DeliveryFailure> {
    match reply.status {
        StatusCode::OK => {
            let response: PeerTransferResponse = reply
                .decode()
                .map_err(|e| DeliveryFailure::new(TransferFailureReason::UnknownError, e.to_string()))?;
            match response.code {
                code if code.is_accepted() => Ok(code),
                PeerResponseCode::AccessDenied => Err(DeliveryFailure::new(
                    TransferFailureReason::RecipientReturnedAccessDenied,
                    response.message.unwrap_or_default(),
                )
                .with_code(PeerResponseCode::AccessDenied)),
                PeerResponseCode::Rejected => Err(DeliveryFailure::new(
                    TransferFailureReason::RecipientReturnedBadRequest,
                    response.message.unwrap_or_default(),
                )
                .with_code(PeerResponseCode::Rejected)),
                code => Err(DeliveryFailure::new(TransferFailureReason::UnknownError, "unknown response code")
                    .with_code(code)),
            }
        }
        StatusCode::FORBIDDEN => {
            if reply.icr_issue {
                warn!(recipient = %recipient, "recipient no longer honours this connection");
            }
            Err(DeliveryFailure::new(
                TransferFailureReason::RecipientReturnedAccessDenied,
                "recipient returned 403",
            ))
        }
        StatusCode::BAD_REQUEST => Err(DeliveryFailure::new(
            TransferFailureReason::RecipientReturnedBadRequest,
            "recipient returned 400",
        )),
        status if status.is_server_error() => Err(DeliveryFailure::new(
            TransferFailureReason::RecipientServerError,
            format!("recipient returned {status}"),
        )),
        status => Err(DeliveryFailure::new(
            TransferFailureReason::UnknownError,
            format!("recipient returned {status}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::drive::metadata::PayloadDescriptor;
    use crate::drive::AccessControlList;
    use crate::storage::{StorageError, StorageResult};
    use crate::test_support::{frodo, merry, sam, TestWorld, UploadFixture};
    use crate::transit::outbox::RetryPolicy;
    use crate::transit::transport::{HostedPeerTransport, HostedPerimeters};
    use crate::upload::instruction_set::{ScheduleOptions, TransitOptions};

    fn pippin() -> IdentityId {
        "pippin.dotyou.cloud".parse().unwrap()
    }

    fn send_to(fixture: &mut UploadFixture, recipients: Vec<IdentityId>, schedule: ScheduleOptions, is_transient: bool) {
        fixture.instruction_set.transit_options = Some(TransitOptions {
            recipients,
            schedule,
            use_global_transit_id: true,
            is_transient,
            ..TransitOptions::default()
        });
    }

    #[tokio::test]
    async fn unreachable_recipient_goes_to_outbox_while_others_succeed() {
        let world = TestWorld::new(&[frodo(), sam(), merry(), pippin()]).await;
        world.connect(&frodo(), &sam());
        world.connect(&frodo(), &merry());
        let drive = world.create_drive(&frodo(), false, false);
        world.mirror_drive(&sam(), &drive);
        let merry_drive = world.mirror_drive(&merry(), &drive);
        world.set_unreachable(&merry(), true);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        send_to(&mut fixture, vec![sam(), merry(), pippin()], ScheduleOptions::SendNowAwaitResponse, false);
        let result = fixture.upload(&world, &frodo(), &owner).await.unwrap();

        assert_eq!(result.recipient_status[&sam()], TransferStatus::TransferKeyCreated);
        assert_eq!(result.recipient_status[&merry()], TransferStatus::PendingRetry);
        assert_eq!(result.recipient_status[&pippin()], TransferStatus::NotAConnectedIdentity);

        let sender = &world.tenant(&frodo()).sender;
        assert_eq!(sender.outbox().len().unwrap(), 1);

        world.set_unreachable(&merry(), false);
        let report = world.tenant(&frodo()).process_outbox().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(sender.outbox().is_empty().unwrap());

        let copy = world
            .tenant(&merry())
            .storage
            .find_by_global_transit_id(merry_drive.id, result.global_transit_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copy.file_metadata.sender_identity, Some(frodo()));
    }

    #[tokio::test]
    async fn encrypted_file_arrives_under_the_recipients_storage_key() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let remote = world.mirror_drive(&sam(), &drive);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        let key_header = fixture.encrypt(&owner);
        fixture.add_payload("doc", &[]);
        send_to(&mut fixture, vec![sam()], ScheduleOptions::SendNowAwaitResponse, false);
        let result = fixture.upload(&world, &frodo(), &owner).await.unwrap();
        assert_eq!(result.recipient_status[&sam()], TransferStatus::TransferKeyCreated);

        let sam_tenant = world.tenant(&sam());
        let copy = sam_tenant
            .storage
            .find_by_global_transit_id(remote.id, result.global_transit_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(copy.file_metadata.is_encrypted);
        let storage_key = sam_tenant.drives.storage_key(remote.id).unwrap();
        let stored = copy.encrypted_key_header.unwrap(&storage_key).unwrap();
        assert!(stored.aes_key().ct_eq(key_header.aes_key().as_bytes()));
    }

    #[tokio::test]
    async fn send_later_only_enqueues() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let remote = world.mirror_drive(&sam(), &drive);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        send_to(&mut fixture, vec![sam()], ScheduleOptions::SendLater, false);
        let result = fixture.upload(&world, &frodo(), &owner).await.unwrap();
        assert_eq!(result.recipient_status[&sam()], TransferStatus::Enqueued);
        assert!(world.tenant(&sam()).storage.list_headers(remote.id).await.unwrap().is_empty());

        let report = world.tenant(&frodo()).process_outbox().await.unwrap();
        assert_eq!(report, OutboxSweepReport { delivered: 1, ..Default::default() });
        assert_eq!(world.tenant(&sam()).storage.list_headers(remote.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_file_outlives_its_last_failed_delivery_only() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        world.mirror_drive(&sam(), &drive);
        world.set_unreachable(&sam(), true);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        send_to(&mut fixture, vec![sam()], ScheduleOptions::SendNowAwaitResponse, true);
        let result = fixture.upload(&world, &frodo(), &owner).await.unwrap();
        assert_eq!(result.recipient_status[&sam()], TransferStatus::PendingRetry);

        let tenant = world.tenant(&frodo());
        assert_eq!(tenant.storage.list_headers(drive.id).await.unwrap().len(), 1);

        let mut dropped = 0;
        for _ in 0..5 {
            let report = tenant.process_outbox().await.unwrap();
            dropped += report.dropped;
            if dropped > 0 {
                break;
            }
            assert_eq!(report.rescheduled, 1);
            assert_eq!(tenant.storage.list_headers(drive.id).await.unwrap().len(), 1);
        }
        assert_eq!(dropped, 1);
        assert!(tenant.sender.outbox().is_empty().unwrap());
        assert!(tenant.storage.list_headers(drive.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_send_leaves_the_transfer_in_the_outbox() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let remote = world.mirror_drive(&sam(), &drive);
        world.set_hanging(&sam(), true);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        send_to(&mut fixture, vec![sam()], ScheduleOptions::SendNowAwaitResponse, false);
        let sender_id = frodo();
        let upload = fixture.upload(&world, &sender_id, &owner);
        assert!(tokio::time::timeout(Duration::from_millis(200), upload).await.is_err());

        let tenant = world.tenant(&frodo());
        assert_eq!(tenant.storage.list_headers(drive.id).await.unwrap().len(), 1);
        let outbox = tenant.sender.outbox();
        assert_eq!(outbox.len().unwrap(), 1);
        // Still leased to the dropped attempt.
        assert!(outbox.due_items(unix_millis_now(), 10).unwrap().is_empty());

        let after_lease = unix_millis_now() + 10 * 60 * 1000;
        let due = outbox.due_items(after_lease, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recipient, sam());

        world.set_hanging(&sam(), false);
        assert!(tenant.sender.deliver(&due[0], tenant.icr_key()).await.success);
        assert_eq!(world.tenant(&sam()).storage.list_headers(remote.id).await.unwrap().len(), 1);
    }

    /// Delegates to the tenant's storage but cannot delete files.
    struct UndeletableStorage(Arc<dyn DriveStorage>);

    #[async_trait]
    impl DriveStorage for UndeletableStorage {
        async fn write_temp_stream(&self, file: &InternalDriveFileId, part: &str, data: &[u8]) -> StorageResult<u64> {
            self.0.write_temp_stream(file, part, data).await
        }

        async fn get_temp_stream(&self, file: &InternalDriveFileId, part: &str) -> StorageResult<Vec<u8>> {
            self.0.get_temp_stream(file, part).await
        }

        async fn delete_temp_files(&self, file: &InternalDriveFileId) -> StorageResult<()> {
            self.0.delete_temp_files(file).await
        }

        async fn commit_new_file(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()> {
            self.0.commit_new_file(file, header).await
        }

        async fn overwrite_file(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()> {
            self.0.overwrite_file(file, header).await
        }

        async fn update_batch(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()> {
            self.0.update_batch(file, header).await
        }

        async fn get_server_file_header(&self, file: &InternalDriveFileId) -> StorageResult<Option<ServerFileHeader>> {
            self.0.get_server_file_header(file).await
        }

        async fn file_exists(&self, file: &InternalDriveFileId) -> StorageResult<bool> {
            self.0.file_exists(file).await
        }

        async fn get_payload(&self, file: &InternalDriveFileId, descriptor: &PayloadDescriptor) -> StorageResult<Vec<u8>> {
            self.0.get_payload(file, descriptor).await
        }

        async fn get_thumbnail(
            &self,
            file: &InternalDriveFileId,
            descriptor: &PayloadDescriptor,
            width: u32,
            height: u32,
        ) -> StorageResult<Vec<u8>> {
            self.0.get_thumbnail(file, descriptor, width, height).await
        }

        async fn list_headers(&self, drive_id: Uuid) -> StorageResult<Vec<ServerFileHeader>> {
            self.0.list_headers(drive_id).await
        }

        async fn hard_delete(&self, _file: &InternalDriveFileId) -> StorageResult<()> {
            Err(StorageError::Io(std::io::Error::other("read-only volume")))
        }
    }

    #[tokio::test]
    async fn sweep_continues_past_a_file_it_cannot_delete() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let remote = world.mirror_drive(&sam(), &drive);
        let owner = world.owner(&frodo());

        for is_transient in [true, false] {
            let mut fixture = UploadFixture::new(&drive);
            fixture.add_payload("doc", &[]);
            send_to(&mut fixture, vec![sam()], ScheduleOptions::SendLater, is_transient);
            fixture.upload(&world, &frodo(), &owner).await.unwrap();
        }

        let tenant = world.tenant(&frodo());
        let mut items = tenant.sender.outbox().due_items(unix_millis_now(), 10).unwrap();
        assert_eq!(items.len(), 2);
        // The transient file's item goes first so its failed delete comes
        // before the other item's bookkeeping.
        items.sort_by_key(|i| !i.is_transient);

        let dir = TempDir::new().unwrap();
        let outbox = Arc::new(Outbox::open(&dir.path().join("outbox.redb"), RetryPolicy::default()).unwrap());
        for (at, item) in items.iter_mut().enumerate() {
            item.next_attempt_at = at as i64;
            outbox.add(item).unwrap();
        }

        let hosted = Arc::new(HostedPerimeters::default());
        hosted.register(sam(), world.tenant(&sam()).perimeter.clone());
        let sender = PeerTransitSender::new(
            frodo(),
            tenant.drives.clone(),
            Arc::new(UndeletableStorage(tenant.storage.clone())),
            tenant.connections.clone(),
            outbox.clone(),
            Arc::new(HostedPeerTransport::new(hosted, None)),
            SenderSettings::default(),
        );

        let report = sender.process_outbox(tenant.icr_key()).await.unwrap();
        assert_eq!(report, OutboxSweepReport { delivered: 2, ..Default::default() });
        assert!(outbox.is_empty().unwrap());
        assert_eq!(tenant.storage.list_headers(drive.id).await.unwrap().len(), 2);
        assert_eq!(world.tenant(&sam()).storage.list_headers(remote.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn owner_only_file_is_not_sent() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        world.mirror_drive(&sam(), &drive);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.descriptor.file_metadata.access_control_list = Some(AccessControlList::owner_only());
        send_to(&mut fixture, vec![sam()], ScheduleOptions::SendNowAwaitResponse, false);
        let result = fixture.upload(&world, &frodo(), &owner).await.unwrap();

        assert_eq!(
            result.recipient_status[&sam()],
            TransferStatus::RecipientDoesNotHavePermissionToFileAcl
        );
        assert!(world.tenant(&frodo()).sender.outbox().is_empty().unwrap());
    }

    #[tokio::test]
    async fn linked_copies_can_be_deleted() {
        let world = TestWorld::new(&[frodo(), sam(), merry()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let remote = world.mirror_drive(&sam(), &drive);
        let owner = world.owner(&frodo());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        send_to(&mut fixture, vec![sam()], ScheduleOptions::SendNowAwaitResponse, false);
        let result = fixture.upload(&world, &frodo(), &owner).await.unwrap();
        let gtid = result.global_transit_id.unwrap();

        let statuses = world
            .tenant(&frodo())
            .sender
            .send_delete_linked_file(&owner, &drive.target_drive, gtid, &[sam(), merry()])
            .await
            .unwrap();
        assert_eq!(statuses[&sam()], DeleteLinkedFileStatus::RequestAccepted);
        assert_eq!(statuses[&merry()], DeleteLinkedFileStatus::RemoteServerFailed);
        assert!(world
            .tenant(&sam())
            .storage
            .find_by_global_transit_id(remote.id, gtid)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sending_to_self_is_rejected() {
        let world = TestWorld::new(&[frodo()]).await;
        let owner = world.owner(&frodo());
        let err = world
            .tenant(&frodo())
            .sender
            .send_delete_linked_file(&owner, &TargetDrive::new(Uuid::new_v4(), Uuid::new_v4()), Uuid::new_v4(), &[frodo()])
            .await
            .unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::InvalidRecipient));
    }
}
