// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transit endpoints for local clients: outbox control, linked-file
//! deletion and reads of files held by other identities.

use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::perimeter::content_response;
use crate::auth::{PermissionKey, RedactedCallerContext, TenantCaller};
use crate::error::ServiceError;
use crate::models::{ExternalFileIdentifier, GlobalTransitIdFileIdentifier, IdentityId, TargetDrive};
use crate::transit::sender::OutboxSweepReport;
use crate::transit::types::DeleteLinkedFileStatus;
use crate::transit::wire::{
    GetDrivesByTypeRequest, GetPayloadRequest, GetThumbnailRequest, PeerContent, PeerDriveInfo,
    QueryBatchCollectionRequest, QueryBatchCollectionResponse, QueryBatchRequest, QueryBatchResponse,
    QueryModifiedRequest, QueryModifiedResponse, SharedSecretEncryptedFileHeader,
};

/// A request relayed to `recipient`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest<T> {
    pub recipient: IdentityId,
    #[serde(flatten)]
    pub request: T,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIdentity {
    #[schema(value_type = String)]
    pub recipient: IdentityId,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteLinkedFileRequest {
    pub target_drive: TargetDrive,
    pub global_transit_id: Uuid,
    #[schema(value_type = Vec<String>)]
    pub recipients: Vec<IdentityId>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteLinkedFileResponse {
    #[schema(value_type = Object)]
    pub recipient_status: BTreeMap<IdentityId, DeleteLinkedFileStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadByGlobalTransitIdRequest {
    pub recipient: IdentityId,
    pub file: GlobalTransitIdFileIdentifier,
    pub key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailByGlobalTransitIdRequest {
    pub recipient: IdentityId,
    pub file: GlobalTransitIdFileIdentifier,
    pub payload_key: String,
    pub width: u32,
    pub height: u32,
}

fn json_or_not_found<T: Serialize>(value: Option<T>) -> Response {
    match value {
        Some(value) => Json(value).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_or_not_found(content: Option<PeerContent>) -> Response {
    match content {
        Some(content) => content_response(content),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ========== Outbox and linked files ==========

/// Attempt every due outbox item now instead of waiting for the poller.
#[utoipa::path(
    post,
    path = "/api/v1/transit/outbox/process",
    tag = "Transit",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Sweep counts", body = OutboxSweepReport),
        (status = 403, description = "Caller may not send")
    )
)]
pub async fn process_outbox(caller: TenantCaller) -> Result<Json<OutboxSweepReport>, ServiceError> {
    caller.ctx.assert_has_permission(PermissionKey::UseTransitWrite)?;
    Ok(Json(caller.tenant.process_outbox().await?))
}

/// Ask recipients to delete the copies they received of a file.
#[utoipa::path(
    post,
    path = "/api/v1/transit/delete-linked-file",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body = DeleteLinkedFileRequest,
    responses(
        (status = 200, description = "Outcome per recipient", body = DeleteLinkedFileResponse),
        (status = 400, description = "Invalid recipient list"),
        (status = 403, description = "Caller may not send")
    )
)]
pub async fn delete_linked_file(
    caller: TenantCaller,
    Json(request): Json<DeleteLinkedFileRequest>,
) -> Result<Json<DeleteLinkedFileResponse>, ServiceError> {
    let recipient_status = caller
        .tenant
        .sender
        .send_delete_linked_file(
            &caller.ctx,
            &request.target_drive,
            request.global_transit_id,
            &request.recipients,
        )
        .await?;
    Ok(Json(DeleteLinkedFileResponse { recipient_status }))
}

// ========== Remote queries ==========

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/header",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Remote file header, key header wrapped for the caller", body = Object),
        (status = 404, description = "File not found or not visible"),
        (status = 400, description = "Remote identity unreachable")
    )
)]
pub async fn get_file_header(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<ExternalFileIdentifier>>,
) -> Result<Response, ServiceError> {
    let header: Option<SharedSecretEncryptedFileHeader> = caller
        .tenant
        .queries
        .get_file_header(&caller.ctx, &request.recipient, request.request)
        .await?;
    Ok(json_or_not_found(header))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/batch",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Remote file headers", body = Object)
    )
)]
pub async fn get_batch(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<QueryBatchRequest>>,
) -> Result<Json<QueryBatchResponse>, ServiceError> {
    let response = caller
        .tenant
        .queries
        .get_batch(&caller.ctx, &request.recipient, request.request)
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/batch-collection",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "One named result set per query", body = Object)
    )
)]
pub async fn get_batch_collection(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<QueryBatchCollectionRequest>>,
) -> Result<Json<QueryBatchCollectionResponse>, ServiceError> {
    let response = caller
        .tenant
        .queries
        .get_batch_collection(&caller.ctx, &request.recipient, request.request)
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/modified",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Remote file headers modified after the cursor", body = Object)
    )
)]
pub async fn get_modified(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<QueryModifiedRequest>>,
) -> Result<Json<QueryModifiedResponse>, ServiceError> {
    let response = caller
        .tenant
        .queries
        .get_modified(&caller.ctx, &request.recipient, request.request)
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/payload",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Payload bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Payload not found or not visible")
    )
)]
pub async fn get_payload(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<GetPayloadRequest>>,
) -> Result<Response, ServiceError> {
    let content = caller
        .tenant
        .queries
        .get_payload(&caller.ctx, &request.recipient, request.request)
        .await?;
    Ok(content_or_not_found(content))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/thumb",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Thumbnail bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Thumbnail not found or not visible")
    )
)]
pub async fn get_thumbnail(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<GetThumbnailRequest>>,
) -> Result<Response, ServiceError> {
    let content = caller
        .tenant
        .queries
        .get_thumbnail(&caller.ctx, &request.recipient, request.request)
        .await?;
    Ok(content_or_not_found(content))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/drives",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Remote drives of the type", body = Object)
    )
)]
pub async fn get_drives_by_type(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<GetDrivesByTypeRequest>>,
) -> Result<Json<Vec<PeerDriveInfo>>, ServiceError> {
    let drives = caller
        .tenant
        .queries
        .get_drives_by_type(&caller.ctx, &request.recipient, request.request.drive_type)
        .await?;
    Ok(Json(drives))
}

/// How the remote identity sees this one.
#[utoipa::path(
    post,
    path = "/api/v1/transit/query/context",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body = RemoteIdentity,
    responses(
        (status = 200, description = "Remote view of this identity", body = RedactedCallerContext)
    )
)]
pub async fn get_remote_context(
    caller: TenantCaller,
    Json(request): Json<RemoteIdentity>,
) -> Result<Json<RedactedCallerContext>, ServiceError> {
    let context = caller
        .tenant
        .queries
        .get_remote_context(&caller.ctx, &request.recipient)
        .await?;
    Ok(Json(context))
}

// ========== By global transit id ==========

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/header-by-global-transit-id",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Remote file header", body = Object),
        (status = 404, description = "File not found or not visible")
    )
)]
pub async fn get_file_header_by_global_transit_id(
    caller: TenantCaller,
    Json(request): Json<RemoteRequest<GlobalTransitIdFileIdentifier>>,
) -> Result<Response, ServiceError> {
    let header = caller
        .tenant
        .queries
        .get_file_header_by_global_transit_id(&caller.ctx, &request.recipient, &request.request)
        .await?;
    Ok(json_or_not_found(header))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/payload-by-global-transit-id",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Payload bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Payload not found or not visible")
    )
)]
pub async fn get_payload_by_global_transit_id(
    caller: TenantCaller,
    Json(request): Json<PayloadByGlobalTransitIdRequest>,
) -> Result<Response, ServiceError> {
    let content = caller
        .tenant
        .queries
        .get_payload_by_global_transit_id(&caller.ctx, &request.recipient, &request.file, &request.key)
        .await?;
    Ok(content_or_not_found(content))
}

#[utoipa::path(
    post,
    path = "/api/v1/transit/query/thumb-by-global-transit-id",
    tag = "Transit",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Thumbnail bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Thumbnail not found or not visible")
    )
)]
pub async fn get_thumbnail_by_global_transit_id(
    caller: TenantCaller,
    Json(request): Json<ThumbnailByGlobalTransitIdRequest>,
) -> Result<Response, ServiceError> {
    let content = caller
        .tenant
        .queries
        .get_thumbnail_by_global_transit_id(
            &caller.ctx,
            &request.recipient,
            &request.file,
            &request.payload_key,
            request.width,
            request.height,
        )
        .await?;
    Ok(content_or_not_found(content))
}
