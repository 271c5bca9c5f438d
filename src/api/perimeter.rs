// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Peer perimeter endpoints.
//!
//! Each route turns its body into a [`PeerRequest`] and hands it to the
//! addressed tenant's perimeter, which authenticates the calling host.
//! Replies are rendered back into the headers [`HttpPeerTransport`] reads.
//!
//! [`HttpPeerTransport`]: crate::transit::HttpPeerTransport

use axum::{
    extract::Multipart,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::auth::PeerCaller;
use crate::drive::metadata::FileMetadata;
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::ExternalFileIdentifier;
use crate::transit::transport::{PeerReply, PeerReplyBody, PeerRequest};
use crate::transit::wire::{
    self, DeleteRemoteFileRequest, EncryptedRecipientTransferInstructionSet, GetDrivesByTypeRequest,
    GetPayloadRequest, GetThumbnailRequest, HostToHostTransfer, PeerContent, QueryBatchCollectionRequest,
    QueryBatchRequest, QueryModifiedRequest, TransferPart,
};

// ========== Rendering ==========

/// Streamed content with its describing headers.
pub(crate) fn content_response(content: PeerContent) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        wire::PAYLOAD_ENCRYPTED_HEADER,
        HeaderValue::from_static(if content.is_encrypted { "true" } else { "false" }),
    );
    if let Ok(value) = HeaderValue::from_str(&content.content_type) {
        headers.insert(wire::DECRYPTED_CONTENT_TYPE_HEADER, value.clone());
        if !content.is_encrypted {
            headers.insert(axum::http::header::CONTENT_TYPE, value);
        }
    }
    if content.is_encrypted {
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
    }
    if let Some(key_header) = &content.shared_secret_encrypted_key_header {
        match key_header.to_base64().map(HeaderValue::try_from) {
            Ok(Ok(value)) => {
                headers.insert(wire::SHARED_SECRET_ENCRYPTED_HEADER, value);
            }
            _ => {
                warn!("key header could not be encoded into a response header");
                return ServiceError::system("key header could not be encoded").into_response();
            }
        }
    }
    headers.insert(wire::LAST_MODIFIED_HEADER, HeaderValue::from(content.last_modified));
    (StatusCode::OK, headers, content.bytes).into_response()
}

fn reply_response(reply: PeerReply) -> Response {
    let mut response = match reply.body {
        PeerReplyBody::Empty => reply.status.into_response(),
        PeerReplyBody::Json(value) => (reply.status, Json(value)).into_response(),
        PeerReplyBody::Content(content) => content_response(content),
    };
    if reply.icr_issue {
        response
            .headers_mut()
            .insert(wire::ICR_ISSUE_HEADER, HeaderValue::from_static("true"));
    }
    response
}

async fn dispatch(caller: PeerCaller, request: PeerRequest) -> Response {
    let reply = caller
        .tenant
        .perimeter
        .handle(caller.sender.as_ref(), caller.token.as_ref(), request)
        .await;
    reply_response(reply)
}

// ========== Transfers ==========

fn invalid_transfer(message: impl Into<String>) -> ServiceError {
    ServiceError::client(ClientErrorCode::InvalidUpload, message)
}

async fn read_transfer(mut multipart: Multipart) -> ServiceResult<HostToHostTransfer> {
    let mut instructions: Option<EncryptedRecipientTransferInstructionSet> = None;
    let mut metadata: Option<FileMetadata> = None;
    let mut parts = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid_transfer(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|e| invalid_transfer(e.to_string()))?;
        match name.as_str() {
            wire::INSTRUCTIONS_FIELD => {
                instructions = Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|e| invalid_transfer(format!("unreadable transfer instructions: {e}")))?,
                );
            }
            wire::METADATA_FIELD => {
                metadata = Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|e| invalid_transfer(format!("unreadable transfer metadata: {e}")))?,
                );
            }
            "" => return Err(invalid_transfer("unnamed transfer part")),
            _ => parts.push(TransferPart {
                name,
                bytes: bytes.to_vec(),
            }),
        }
    }

    Ok(HostToHostTransfer {
        instructions: instructions.ok_or_else(|| invalid_transfer("transfer has no instructions"))?,
        metadata: metadata.ok_or_else(|| invalid_transfer("transfer has no metadata"))?,
        parts,
    })
}

/// Receive a file (or an update to one) from a connected host.
#[utoipa::path(
    post,
    path = "/api/perimeter/transit/host/stream",
    tag = "Perimeter",
    request_body(content = inline(Object), content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Transfer processed; see the response code"),
        (status = 400, description = "Malformed transfer"),
        (status = 403, description = "Caller is not a connected identity")
    )
)]
pub async fn host_stream(caller: PeerCaller, multipart: Multipart) -> Response {
    match read_transfer(multipart).await {
        Ok(transfer) => dispatch(caller, PeerRequest::SendHostToHost(transfer)).await,
        Err(e) => e.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/api/perimeter/transit/host/delete-linked-file",
    tag = "Perimeter",
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Request processed; see the response code"),
        (status = 403, description = "Caller is not a connected identity")
    )
)]
pub async fn delete_linked_file(caller: PeerCaller, Json(request): Json<DeleteRemoteFileRequest>) -> Response {
    dispatch(caller, PeerRequest::DeleteLinkedFile(request)).await
}

// ========== Queries ==========

#[utoipa::path(
    post,
    path = "/api/perimeter/drive/query/batch",
    tag = "Perimeter",
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Matching file headers", body = Object),
        (status = 403, description = "Drive is not readable by the caller"),
        (status = 404, description = "Drive not found")
    )
)]
pub async fn query_batch(caller: PeerCaller, Json(request): Json<QueryBatchRequest>) -> Response {
    dispatch(caller, PeerRequest::QueryBatch(request)).await
}

#[utoipa::path(
    post,
    path = "/api/perimeter/drive/query/batch-collection",
    tag = "Perimeter",
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "One named result set per query", body = Object)
    )
)]
pub async fn query_batch_collection(
    caller: PeerCaller,
    Json(request): Json<QueryBatchCollectionRequest>,
) -> Response {
    dispatch(caller, PeerRequest::QueryBatchCollection(request)).await
}

#[utoipa::path(
    post,
    path = "/api/perimeter/drive/query/modified",
    tag = "Perimeter",
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "File headers modified after the cursor", body = Object),
        (status = 404, description = "Drive not found")
    )
)]
pub async fn query_modified(caller: PeerCaller, Json(request): Json<QueryModifiedRequest>) -> Response {
    dispatch(caller, PeerRequest::QueryModified(request)).await
}

#[utoipa::path(
    post,
    path = "/api/perimeter/drive/header",
    tag = "Perimeter",
    request_body = ExternalFileIdentifier,
    responses(
        (status = 200, description = "File header", body = Object),
        (status = 404, description = "File not found or not visible")
    )
)]
pub async fn file_header(caller: PeerCaller, Json(file): Json<ExternalFileIdentifier>) -> Response {
    dispatch(caller, PeerRequest::GetFileHeader(file)).await
}

#[utoipa::path(
    post,
    path = "/api/perimeter/drive/payload",
    tag = "Perimeter",
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Payload bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Payload not found or not visible")
    )
)]
pub async fn payload(caller: PeerCaller, Json(request): Json<GetPayloadRequest>) -> Response {
    dispatch(caller, PeerRequest::GetPayload(request)).await
}

#[utoipa::path(
    post,
    path = "/api/perimeter/drive/thumb",
    tag = "Perimeter",
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Thumbnail bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Thumbnail not found or not visible")
    )
)]
pub async fn thumbnail(caller: PeerCaller, Json(request): Json<GetThumbnailRequest>) -> Response {
    dispatch(caller, PeerRequest::GetThumbnail(request)).await
}

#[utoipa::path(
    post,
    path = "/api/perimeter/drive/drives",
    tag = "Perimeter",
    request_body(content = inline(Object)),
    responses(
        (status = 200, description = "Drives of the type readable by the caller", body = Object)
    )
)]
pub async fn drives_by_type(caller: PeerCaller, Json(request): Json<GetDrivesByTypeRequest>) -> Response {
    dispatch(caller, PeerRequest::GetDrivesByType(request)).await
}

/// How this host sees the caller.
#[utoipa::path(
    get,
    path = "/api/perimeter/security/context",
    tag = "Perimeter",
    responses(
        (status = 200, description = "Redacted caller context", body = crate::auth::RedactedCallerContext),
        (status = 403, description = "Connection token is no longer valid")
    )
)]
pub async fn security_context(caller: PeerCaller) -> Response {
    dispatch(caller, PeerRequest::GetSecurityContext).await
}
