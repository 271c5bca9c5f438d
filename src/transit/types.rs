// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delivery outcomes.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::IdentityId;

/// Per-recipient status reported to the uploading caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    /// The recipient accepted the file and its transfer key header.
    TransferKeyCreated,
    /// Queued for the outbox without an immediate attempt.
    Enqueued,
    /// The immediate attempt failed; the outbox will retry.
    PendingRetry,
    /// The outbox could not record the transfer. It will not be retried.
    EnqueueFailed,
    NotAConnectedIdentity,
    FileDoesNotAllowDistribution,
    RecipientDoesNotHavePermissionToFileAcl,
    RecipientReturnedAccessDenied,
    RecipientReturnedBadRequest,
    SourceFileMissing,
}

/// Acceptance code returned by a recipient's perimeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum PeerResponseCode {
    AcceptedIntoInbox,
    AcceptedDirectWrite,
    Rejected,
    AccessDenied,
    Unknown,
}

impl PeerResponseCode {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PeerResponseCode::AcceptedIntoInbox | PeerResponseCode::AcceptedDirectWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferFailureReason {
    /// Network failure or timeout reaching the recipient.
    TransportFailure,
    RecipientServerError,
    RecipientReturnedAccessDenied,
    RecipientReturnedBadRequest,
    NotConnected,
    FileDoesNotAllowDistribution,
    RecipientDoesNotHavePermissionToFileAcl,
    SourceFileMissing,
    EncryptionFailed,
    UnknownError,
}

impl TransferFailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferFailureReason::TransportFailure
                | TransferFailureReason::RecipientServerError
                | TransferFailureReason::UnknownError
        )
    }

    /// Status for a failure that will not be retried.
    pub fn terminal_status(&self) -> TransferStatus {
        match self {
            TransferFailureReason::NotConnected => TransferStatus::NotAConnectedIdentity,
            TransferFailureReason::FileDoesNotAllowDistribution => TransferStatus::FileDoesNotAllowDistribution,
            TransferFailureReason::RecipientDoesNotHavePermissionToFileAcl => {
                TransferStatus::RecipientDoesNotHavePermissionToFileAcl
            }
            TransferFailureReason::RecipientReturnedAccessDenied => TransferStatus::RecipientReturnedAccessDenied,
            TransferFailureReason::SourceFileMissing => TransferStatus::SourceFileMissing,
            TransferFailureReason::RecipientReturnedBadRequest
            | TransferFailureReason::EncryptionFailed
            | TransferFailureReason::TransportFailure
            | TransferFailureReason::RecipientServerError
            | TransferFailureReason::UnknownError => TransferStatus::RecipientReturnedBadRequest,
        }
    }
}

/// Outcome of one delivery attempt to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub recipient: IdentityId,
    pub success: bool,
    pub response_code: Option<PeerResponseCode>,
    pub should_retry: bool,
    pub failure_reason: Option<TransferFailureReason>,
    pub timestamp: i64,
    pub outbox_item_id: Uuid,
}

impl SendResult {
    pub fn delivered(recipient: IdentityId, code: PeerResponseCode, outbox_item_id: Uuid) -> Self {
        Self {
            recipient,
            success: true,
            response_code: Some(code),
            should_retry: false,
            failure_reason: None,
            timestamp: crate::models::unix_millis_now(),
            outbox_item_id,
        }
    }

    pub fn failed(
        recipient: IdentityId,
        reason: TransferFailureReason,
        code: Option<PeerResponseCode>,
        outbox_item_id: Uuid,
    ) -> Self {
        Self {
            recipient,
            success: false,
            response_code: code,
            should_retry: reason.is_retryable(),
            failure_reason: Some(reason),
            timestamp: crate::models::unix_millis_now(),
            outbox_item_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum DeleteLinkedFileStatus {
    RequestAccepted,
    RemoteServerFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_retry() {
        assert!(TransferFailureReason::TransportFailure.is_retryable());
        assert!(TransferFailureReason::RecipientServerError.is_retryable());
        assert!(!TransferFailureReason::RecipientReturnedAccessDenied.is_retryable());
        assert!(!TransferFailureReason::NotConnected.is_retryable());
    }

    #[test]
    fn failed_result_carries_retry_flag() {
        let sam: IdentityId = "sam.dotyou.cloud".parse().unwrap();
        let result = SendResult::failed(sam, TransferFailureReason::TransportFailure, None, Uuid::new_v4());
        assert!(!result.success);
        assert!(result.should_retry);
    }

    #[test]
    fn accepted_codes() {
        assert!(PeerResponseCode::AcceptedDirectWrite.is_accepted());
        assert!(!PeerResponseCode::Rejected.is_accepted());
    }
}
