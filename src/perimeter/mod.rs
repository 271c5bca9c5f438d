// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Peer Perimeter
//!
//! The side of a hosted identity that other identities talk to.
//!
//! - `receive` - host-to-host transfers and linked file deletion
//! - `reads` - queries and content served to connected or anonymous peers
//!
//! Every peer request enters through [`PeerPerimeterService::handle`], used
//! both by the HTTP routes and by the in-process transport.

mod reads;
mod receive;

use std::sync::Arc;

use axum::http::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::{CallerContext, ClientAuthenticationToken};
use crate::drive::{DriveManager, DriveStorage, SecurityGroupType};
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::IdentityId;
use crate::transit::icr::ConnectionRegistry;
use crate::transit::transport::{PeerReply, PeerRequest};

pub struct PeerPerimeterService {
    tenant: IdentityId,
    drives: Arc<DriveManager>,
    storage: Arc<dyn DriveStorage>,
    connections: Arc<ConnectionRegistry>,
}

impl PeerPerimeterService {
    pub fn new(
        tenant: IdentityId,
        drives: Arc<DriveManager>,
        storage: Arc<dyn DriveStorage>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            tenant,
            drives,
            storage,
            connections,
        }
    }

    pub fn tenant(&self) -> &IdentityId {
        &self.tenant
    }

    /// Build the caller context of a peer request. A token without a sender
    /// cannot be checked and is refused; no token means anonymous.
    pub fn authenticate(
        &self,
        sender: Option<&IdentityId>,
        auth: Option<&ClientAuthenticationToken>,
    ) -> ServiceResult<CallerContext> {
        match (sender, auth) {
            (Some(sender), Some(token)) => self.connections.authenticate_incoming(sender, token),
            (None, Some(_)) => Err(ServiceError::security("token presented without a sender identity")),
            (_, None) => Ok(CallerContext::peer(
                self.tenant.clone(),
                None,
                SecurityGroupType::Anonymous,
                None,
            )),
        }
    }

    /// Dispatch one peer request and render the reply.
    pub async fn handle(
        &self,
        sender: Option<&IdentityId>,
        auth: Option<&ClientAuthenticationToken>,
        request: PeerRequest,
    ) -> PeerReply {
        let ctx = match self.authenticate(sender, auth) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(tenant = %self.tenant, sender = ?sender, error = %e, "peer authentication failed");
                return PeerReply::icr_issue();
            }
        };
        debug!(tenant = %self.tenant, path = request.path(), caller = ?ctx.caller_identity(), "peer request");

        let result = match request {
            PeerRequest::SendHostToHost(transfer) => self.accept_transfer(&ctx, transfer).await.and_then(|r| json(&r)),
            PeerRequest::DeleteLinkedFile(request) => {
                self.delete_linked_file(&ctx, request).await.and_then(|r| json(&r))
            }
            PeerRequest::QueryBatch(request) => self.query_batch(&ctx, request).await.and_then(|r| json_or_404(r)),
            PeerRequest::QueryBatchCollection(request) => {
                self.query_batch_collection(&ctx, request).await.and_then(|r| json(&r))
            }
            PeerRequest::QueryModified(request) => {
                self.query_modified(&ctx, request).await.and_then(|r| json_or_404(r))
            }
            PeerRequest::GetFileHeader(file) => self.get_file_header(&ctx, file).await.and_then(|r| json_or_404(r)),
            PeerRequest::GetPayload(request) => self
                .get_payload(&ctx, request)
                .await
                .map(|c| c.map_or_else(|| PeerReply::empty(StatusCode::NOT_FOUND), PeerReply::content)),
            PeerRequest::GetThumbnail(request) => self
                .get_thumbnail(&ctx, request)
                .await
                .map(|c| c.map_or_else(|| PeerReply::empty(StatusCode::NOT_FOUND), PeerReply::content)),
            PeerRequest::GetDrivesByType(request) => {
                self.get_drives_by_type(&ctx, request.drive_type).and_then(|r| json(&r))
            }
            PeerRequest::GetSecurityContext => json(&ctx.redacted()),
        };

        result.unwrap_or_else(|e| error_reply(&self.tenant, e))
    }
}

fn json<T: Serialize>(value: &T) -> ServiceResult<PeerReply> {
    serde_json::to_value(value)
        .map(|v| PeerReply::json(StatusCode::OK, v))
        .map_err(|e| ServiceError::system(e.to_string()))
}

fn json_or_404<T: Serialize>(value: Option<T>) -> ServiceResult<PeerReply> {
    match value {
        Some(value) => json(&value),
        None => Ok(PeerReply::empty(StatusCode::NOT_FOUND)),
    }
}

fn error_reply(tenant: &IdentityId, e: ServiceError) -> PeerReply {
    match e {
        ServiceError::Client {
            code: ClientErrorCode::FileNotFound,
            ..
        } => PeerReply::empty(StatusCode::NOT_FOUND),
        ServiceError::Client { code, message } => PeerReply::json(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": message, "errorCode": code.as_str() }),
        ),
        ServiceError::Security(message) => {
            debug!(tenant = %tenant, reason = %message, "peer request denied");
            PeerReply::empty(StatusCode::FORBIDDEN)
        }
        ServiceError::RemoteServer(message) | ServiceError::System(message) => {
            warn!(tenant = %tenant, error = %message, "peer request failed");
            PeerReply::empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frodo, sam, TestWorld};
    use crate::transit::wire::{GetDrivesByTypeRequest, PeerDriveInfo};

    #[tokio::test]
    async fn anonymous_callers_get_an_anonymous_context() {
        let world = TestWorld::new(&[frodo()]).await;
        let perimeter = world.tenant(&frodo()).perimeter.clone();
        let ctx = perimeter.authenticate(None, None).unwrap();
        assert_eq!(ctx.caller.security_level, SecurityGroupType::Anonymous);
        assert!(ctx.caller_identity().is_none());
    }

    #[tokio::test]
    async fn unknown_token_is_an_icr_issue() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        let perimeter = world.tenant(&frodo()).perimeter.clone();
        let token = ClientAuthenticationToken::new_random().unwrap();

        let reply = perimeter
            .handle(Some(&sam()), Some(&token), PeerRequest::GetSecurityContext)
            .await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert!(reply.icr_issue);
    }

    #[tokio::test]
    async fn connected_peer_sees_its_own_context() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let access = world.outgoing_access(&sam(), &frodo());

        let reply = world
            .tenant(&frodo())
            .perimeter
            .handle(Some(&sam()), Some(&access.token), PeerRequest::GetSecurityContext)
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        let context: crate::auth::RedactedCallerContext = reply.decode().unwrap();
        assert_eq!(context.security_level, SecurityGroupType::Connected);
    }

    #[tokio::test]
    async fn anonymous_drive_listing_only_shows_public_drives() {
        let world = TestWorld::new(&[frodo()]).await;
        let tenant = world.tenant(&frodo());
        let public = world.create_drive(&frodo(), false, true);
        let private = world.create_drive(&frodo(), false, false);
        assert_eq!(public.target_drive.drive_type, private.target_drive.drive_type);

        let reply = tenant
            .perimeter
            .handle(
                None,
                None,
                PeerRequest::GetDrivesByType(GetDrivesByTypeRequest {
                    drive_type: public.target_drive.drive_type,
                }),
            )
            .await;
        let drives: Vec<PeerDriveInfo> = reply.decode().unwrap();
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].target_drive, public.target_drive);
    }
}
