// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Carrying requests to a peer's perimeter.
//!
//! [`HttpPeerTransport`] speaks HTTP to `https://{identity}`.
//! [`HostedPeerTransport`] short-cuts identities hosted by this process
//! straight into their perimeter and falls back to another transport for
//! everything else.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::wire::{
    self, DeleteRemoteFileRequest, GetDrivesByTypeRequest, GetPayloadRequest, GetThumbnailRequest,
    HostToHostTransfer, PeerContent, QueryBatchCollectionRequest, QueryBatchRequest, QueryModifiedRequest,
};
use crate::auth::ClientAuthenticationToken;
use crate::crypto::EncryptedKeyHeader;
use crate::models::{ExternalFileIdentifier, IdentityId};
use crate::perimeter::PeerPerimeterService;

// =============================================================================
// Requests and replies
// =============================================================================

#[derive(Debug, Clone)]
pub enum PeerRequest {
    SendHostToHost(HostToHostTransfer),
    DeleteLinkedFile(DeleteRemoteFileRequest),
    QueryBatch(QueryBatchRequest),
    QueryBatchCollection(QueryBatchCollectionRequest),
    QueryModified(QueryModifiedRequest),
    GetFileHeader(ExternalFileIdentifier),
    GetPayload(GetPayloadRequest),
    GetThumbnail(GetThumbnailRequest),
    GetDrivesByType(GetDrivesByTypeRequest),
    GetSecurityContext,
}

impl PeerRequest {
    pub fn path(&self) -> &'static str {
        match self {
            PeerRequest::SendHostToHost(_) => wire::HOST_STREAM_PATH,
            PeerRequest::DeleteLinkedFile(_) => wire::HOST_DELETE_LINKED_FILE_PATH,
            PeerRequest::QueryBatch(_) => wire::QUERY_BATCH_PATH,
            PeerRequest::QueryBatchCollection(_) => wire::QUERY_BATCH_COLLECTION_PATH,
            PeerRequest::QueryModified(_) => wire::QUERY_MODIFIED_PATH,
            PeerRequest::GetFileHeader(_) => wire::FILE_HEADER_PATH,
            PeerRequest::GetPayload(_) => wire::PAYLOAD_PATH,
            PeerRequest::GetThumbnail(_) => wire::THUMBNAIL_PATH,
            PeerRequest::GetDrivesByType(_) => wire::DRIVES_BY_TYPE_PATH,
            PeerRequest::GetSecurityContext => wire::SECURITY_CONTEXT_PATH,
        }
    }

    fn streams_content(&self) -> bool {
        matches!(self, PeerRequest::GetPayload(_) | PeerRequest::GetThumbnail(_))
    }
}

#[derive(Debug, Clone)]
pub enum PeerReplyBody {
    Empty,
    Json(serde_json::Value),
    Content(PeerContent),
}

#[derive(Debug, Clone)]
pub struct PeerReply {
    pub status: StatusCode,
    /// The peer no longer honours this host's connection token.
    pub icr_issue: bool,
    pub body: PeerReplyBody,
}

impl PeerReply {
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            icr_issue: false,
            body: PeerReplyBody::Empty,
        }
    }

    pub fn json(status: StatusCode, value: serde_json::Value) -> Self {
        Self {
            status,
            icr_issue: false,
            body: PeerReplyBody::Json(value),
        }
    }

    pub fn content(content: PeerContent) -> Self {
        Self {
            status: StatusCode::OK,
            icr_issue: false,
            body: PeerReplyBody::Content(content),
        }
    }

    pub fn icr_issue() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            icr_issue: true,
            body: PeerReplyBody::Empty,
        }
    }

    /// Decode a JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PeerTransportError> {
        match &self.body {
            PeerReplyBody::Json(value) => {
                serde_json::from_value(value.clone()).map_err(|e| PeerTransportError::Decode(e.to_string()))
            }
            _ => Err(PeerTransportError::Decode("expected a JSON body".to_string())),
        }
    }

    pub fn into_content(self) -> Result<PeerContent, PeerTransportError> {
        match self.body {
            PeerReplyBody::Content(content) => Ok(content),
            _ => Err(PeerTransportError::Decode("expected streamed content".to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerTransportError {
    #[error("could not reach {identity}: {message}")]
    Unreachable { identity: IdentityId, message: String },

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("could not decode peer reply: {0}")]
    Decode(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send `request` from `sender` to `recipient`. `auth` is the token the
    /// recipient issued to the sender; `None` calls anonymously.
    async fn send(
        &self,
        sender: &IdentityId,
        recipient: &IdentityId,
        auth: Option<&ClientAuthenticationToken>,
        request: PeerRequest,
    ) -> Result<PeerReply, PeerTransportError>;
}

// =============================================================================
// HTTP
// =============================================================================

pub struct HttpPeerTransport {
    http: Client,
    overrides: HashMap<IdentityId, String>,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration, overrides: HashMap<IdentityId, String>) -> Result<Self, PeerTransportError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerTransportError::InvalidAddress(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, overrides })
    }

    fn base_url(&self, recipient: &IdentityId) -> Result<String, PeerTransportError> {
        match self.overrides.get(recipient) {
            Some(url) => {
                let parsed = url::Url::parse(url).map_err(|e| PeerTransportError::InvalidAddress(e.to_string()))?;
                if parsed.scheme() != "https" && !cfg!(feature = "dev") {
                    return Err(PeerTransportError::InvalidAddress(format!(
                        "{recipient} override must use https"
                    )));
                }
                Ok(url.trim_end_matches('/').to_string())
            }
            None => Ok(format!("https://{recipient}")),
        }
    }

    fn transfer_form(transfer: HostToHostTransfer) -> Result<Form, PeerTransportError> {
        let instructions =
            serde_json::to_string(&transfer.instructions).map_err(|e| PeerTransportError::Decode(e.to_string()))?;
        let metadata =
            serde_json::to_string(&transfer.metadata).map_err(|e| PeerTransportError::Decode(e.to_string()))?;
        let mut form = Form::new()
            .text(wire::INSTRUCTIONS_FIELD, instructions)
            .text(wire::METADATA_FIELD, metadata);
        for part in transfer.parts {
            form = form.part(part.name.clone(), Part::bytes(part.bytes).file_name(part.name));
        }
        Ok(form)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_from_headers(headers: &HeaderMap, bytes: Vec<u8>) -> Result<PeerContent, PeerTransportError> {
    let is_encrypted = header_str(headers, wire::PAYLOAD_ENCRYPTED_HEADER) == Some("true");
    let shared_secret_encrypted_key_header = match header_str(headers, wire::SHARED_SECRET_ENCRYPTED_HEADER) {
        Some(encoded) if is_encrypted => Some(
            EncryptedKeyHeader::from_base64(encoded).map_err(|e| PeerTransportError::Decode(e.to_string()))?,
        ),
        _ => None,
    };
    let content_type = header_str(headers, wire::DECRYPTED_CONTENT_TYPE_HEADER)
        .or_else(|| header_str(headers, "content-type"))
        .unwrap_or("application/octet-stream")
        .to_string();
    let last_modified = header_str(headers, wire::LAST_MODIFIED_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    Ok(PeerContent {
        bytes,
        content_type,
        is_encrypted,
        shared_secret_encrypted_key_header,
        last_modified,
    })
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn send(
        &self,
        sender: &IdentityId,
        recipient: &IdentityId,
        auth: Option<&ClientAuthenticationToken>,
        request: PeerRequest,
    ) -> Result<PeerReply, PeerTransportError> {
        let url = format!("{}{}{}", self.base_url(recipient)?, wire::PERIMETER_PREFIX, request.path());
        let streams_content = request.streams_content();

        let mut builder = match request {
            PeerRequest::GetSecurityContext => self.http.get(&url),
            PeerRequest::SendHostToHost(transfer) => self.http.post(&url).multipart(Self::transfer_form(transfer)?),
            PeerRequest::DeleteLinkedFile(body) => self.http.post(&url).json(&body),
            PeerRequest::QueryBatch(body) => self.http.post(&url).json(&body),
            PeerRequest::QueryBatchCollection(body) => self.http.post(&url).json(&body),
            PeerRequest::QueryModified(body) => self.http.post(&url).json(&body),
            PeerRequest::GetFileHeader(body) => self.http.post(&url).json(&body),
            PeerRequest::GetPayload(body) => self.http.post(&url).json(&body),
            PeerRequest::GetThumbnail(body) => self.http.post(&url).json(&body),
            PeerRequest::GetDrivesByType(body) => self.http.post(&url).json(&body),
        };
        builder = builder
            .header(wire::PEER_SENDER_HEADER, sender.as_str())
            .header(wire::PEER_RECIPIENT_HEADER, recipient.as_str());
        if let Some(token) = auth {
            builder = builder.bearer_auth(token.to_portable().as_str());
        }

        debug!(recipient = %recipient, url = %url, "calling peer");
        let response = builder.send().await.map_err(|e| PeerTransportError::Unreachable {
            identity: recipient.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let icr_issue = headers.contains_key(wire::ICR_ISSUE_HEADER);
        let bytes = response.bytes().await.map_err(|e| PeerTransportError::Unreachable {
            identity: recipient.clone(),
            message: e.to_string(),
        })?;

        let body = if status.is_success() && streams_content {
            PeerReplyBody::Content(content_from_headers(&headers, bytes.to_vec())?)
        } else if bytes.is_empty() {
            PeerReplyBody::Empty
        } else {
            serde_json::from_slice(&bytes).map_or(PeerReplyBody::Empty, PeerReplyBody::Json)
        };

        Ok(PeerReply { status, icr_issue, body })
    }
}

// =============================================================================
// In process
// =============================================================================

/// Perimeters of the identities hosted by this process.
#[derive(Default)]
pub struct HostedPerimeters {
    perimeters: RwLock<HashMap<IdentityId, Arc<PeerPerimeterService>>>,
}

impl HostedPerimeters {
    pub fn register(&self, identity: IdentityId, perimeter: Arc<PeerPerimeterService>) {
        if let Ok(mut perimeters) = self.perimeters.write() {
            perimeters.insert(identity, perimeter);
        }
    }

    pub fn get(&self, identity: &IdentityId) -> Option<Arc<PeerPerimeterService>> {
        self.perimeters.read().ok()?.get(identity).cloned()
    }
}

pub struct HostedPeerTransport {
    hosted: Arc<HostedPerimeters>,
    fallback: Option<Arc<dyn PeerTransport>>,
}

impl HostedPeerTransport {
    pub fn new(hosted: Arc<HostedPerimeters>, fallback: Option<Arc<dyn PeerTransport>>) -> Self {
        Self { hosted, fallback }
    }
}

#[async_trait]
impl PeerTransport for HostedPeerTransport {
    async fn send(
        &self,
        sender: &IdentityId,
        recipient: &IdentityId,
        auth: Option<&ClientAuthenticationToken>,
        request: PeerRequest,
    ) -> Result<PeerReply, PeerTransportError> {
        if let Some(perimeter) = self.hosted.get(recipient) {
            return Ok(perimeter.handle(Some(sender), auth, request).await);
        }
        match &self.fallback {
            Some(fallback) => fallback.send(sender, recipient, auth, request).await,
            None => Err(PeerTransportError::Unreachable {
                identity: recipient.clone(),
                message: "identity is not hosted here".to_string(),
            }),
        }
    }
}
