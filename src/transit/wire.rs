// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bodies and headers exchanged between hosts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::PeerResponseCode;
use crate::crypto::EncryptedKeyHeader;
use crate::drive::metadata::{FileMetadata, ServerMetadata};
use crate::drive::query::{FileQueryParams, QueryBatchOptions, QueryModifiedOptions};
use crate::drive::{AccessControlList, FileSystemType};
use crate::models::{ExternalFileIdentifier, GlobalTransitIdFileIdentifier, TargetDrive};
use crate::upload::instruction_set::{AppNotificationOptions, PayloadUpdateOperationType};

// =============================================================================
// Headers
// =============================================================================

/// Identity a request is addressed to, when `Host` is shared.
pub const PEER_RECIPIENT_HEADER: &str = "x-peer-recipient";

/// Identity of the calling host.
pub const PEER_SENDER_HEADER: &str = "x-peer-sender";

/// Set on a 403 when the caller's connection is no longer valid here.
pub const ICR_ISSUE_HEADER: &str = "x-peer-icr-issue";

pub const PAYLOAD_ENCRYPTED_HEADER: &str = "x-peer-payload-encrypted";

pub const DECRYPTED_CONTENT_TYPE_HEADER: &str = "x-peer-decrypted-content-type";

/// Key header of streamed content, wrapped for the caller, base64 JSON.
pub const SHARED_SECRET_ENCRYPTED_HEADER: &str = "x-peer-ss-encrypted-key-header";

/// Unix millis of the last change to streamed content.
pub const LAST_MODIFIED_HEADER: &str = "x-peer-last-modified";

// =============================================================================
// Routes
// =============================================================================

pub const PERIMETER_PREFIX: &str = "/api/perimeter";

pub const HOST_STREAM_PATH: &str = "/transit/host/stream";
pub const HOST_DELETE_LINKED_FILE_PATH: &str = "/transit/host/delete-linked-file";
pub const QUERY_BATCH_PATH: &str = "/drive/query/batch";
pub const QUERY_BATCH_COLLECTION_PATH: &str = "/drive/query/batch-collection";
pub const QUERY_MODIFIED_PATH: &str = "/drive/query/modified";
pub const FILE_HEADER_PATH: &str = "/drive/header";
pub const PAYLOAD_PATH: &str = "/drive/payload";
pub const THUMBNAIL_PATH: &str = "/drive/thumb";
pub const DRIVES_BY_TYPE_PATH: &str = "/drive/drives";
pub const SECURITY_CONTEXT_PATH: &str = "/security/context";

/// Multipart field names of a host-to-host transfer. Every other field is a
/// stored part, named as on disk.
pub const INSTRUCTIONS_FIELD: &str = "instructions";
pub const METADATA_FIELD: &str = "metadata";

// =============================================================================
// Host to host transfer
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferFileType {
    #[default]
    Normal,
    /// Apply payload instructions to the copy the recipient already holds.
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadInstruction {
    pub key: String,
    pub operation_type: PayloadUpdateOperationType,
}

/// Instructions for the recipient, carrying the file key wrapped under the
/// connection's shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecipientTransferInstructionSet {
    pub target_drive: TargetDrive,
    #[serde(default)]
    pub transfer_file_type: TransferFileType,
    #[serde(default)]
    pub file_system_type: FileSystemType,
    pub shared_secret_encrypted_key_header: EncryptedKeyHeader,
    pub access_control_list: AccessControlList,
    #[serde(default)]
    pub payload_instructions: Vec<PayloadInstruction>,
    #[serde(default)]
    pub app_notification_options: Option<AppNotificationOptions>,
}

/// One stored part travelling with a transfer, named as on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPart {
    pub name: String,
    #[serde(with = "crate::crypto::base64_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostToHostTransfer {
    pub instructions: EncryptedRecipientTransferInstructionSet,
    /// Sender's metadata with the local file address removed.
    pub metadata: FileMetadata,
    #[serde(default)]
    pub parts: Vec<TransferPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerTransferResponse {
    pub code: PeerResponseCode,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRemoteFileRequest {
    pub target: GlobalTransitIdFileIdentifier,
}

// =============================================================================
// Queries
// =============================================================================

/// A file header as handed to a remote or local caller: the key header is
/// wrapped under a secret that caller holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSecretEncryptedFileHeader {
    pub file_id: Uuid,
    pub target_drive: TargetDrive,
    pub file_metadata: FileMetadata,
    pub server_metadata: ServerMetadata,
    pub shared_secret_encrypted_key_header: EncryptedKeyHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchRequest {
    pub query_params: FileQueryParams,
    #[serde(default)]
    pub result_options: QueryBatchOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchResponse {
    #[serde(default)]
    pub name: Option<String>,
    pub cursor_state: String,
    pub has_more: bool,
    pub search_results: Vec<SharedSecretEncryptedFileHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionQueryParamSection {
    pub name: String,
    pub query_params: FileQueryParams,
    #[serde(default)]
    pub result_options: QueryBatchOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchCollectionRequest {
    pub queries: Vec<CollectionQueryParamSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchCollectionResponse {
    pub results: Vec<QueryBatchResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModifiedRequest {
    pub query_params: FileQueryParams,
    #[serde(default)]
    pub result_options: QueryModifiedOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModifiedResponse {
    pub cursor: i64,
    pub has_more: bool,
    pub search_results: Vec<SharedSecretEncryptedFileHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPayloadRequest {
    pub file: ExternalFileIdentifier,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetThumbnailRequest {
    pub file: ExternalFileIdentifier,
    pub payload_key: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDrivesByTypeRequest {
    pub drive_type: Uuid,
}

/// What a peer may learn about one of this host's drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDriveInfo {
    pub target_drive: TargetDrive,
    pub name: String,
    pub allow_anonymous_reads: bool,
}

/// A streamed payload or thumbnail plus the headers describing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContent {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub is_encrypted: bool,
    /// `None` when the content is not encrypted.
    pub shared_secret_encrypted_key_header: Option<EncryptedKeyHeader>,
    pub last_modified: i64,
}
