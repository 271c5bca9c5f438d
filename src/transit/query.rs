// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Reading files held by connected identities.
//!
//! Calls go out with the connection token when one exists and anonymously
//! otherwise. Key headers come back wrapped under the connection's shared
//! secret and are re-wrapped for the calling client before they are
//! returned.

use std::sync::Arc;

use axum::http::StatusCode;
use tracing::{debug, warn};
use uuid::Uuid;

use super::icr::ConnectionRegistry;
use super::retry::{try_retry, ImmediateRetry};
use super::transport::{PeerReply, PeerRequest, PeerTransport};
use super::wire::{
    GetDrivesByTypeRequest, GetPayloadRequest, GetThumbnailRequest, PeerContent, PeerDriveInfo,
    QueryBatchCollectionRequest, QueryBatchCollectionResponse, QueryBatchRequest, QueryBatchResponse,
    QueryModifiedRequest, QueryModifiedResponse, SharedSecretEncryptedFileHeader,
};
use crate::auth::{CallerContext, PermissionKey, RedactedCallerContext};
use crate::crypto::{EncryptedKeyHeader, SensitiveByteArray};
use crate::drive::query::{FileQueryParams, QueryBatchOptions};
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::{ExternalFileIdentifier, GlobalTransitIdFileIdentifier, IdentityId};

pub struct TransitQueryService {
    tenant: IdentityId,
    connections: Arc<ConnectionRegistry>,
    transport: Arc<dyn PeerTransport>,
    retry: ImmediateRetry,
}

/// A successful reply plus the secret its key headers are wrapped under.
struct RemoteReply {
    reply: PeerReply,
    secret: Option<SensitiveByteArray>,
}

impl TransitQueryService {
    pub fn new(
        tenant: IdentityId,
        connections: Arc<ConnectionRegistry>,
        transport: Arc<dyn PeerTransport>,
        retry: ImmediateRetry,
    ) -> Self {
        Self {
            tenant,
            connections,
            transport,
            retry,
        }
    }

    /// Send `request` and classify the reply. `Ok(None)` means the remote
    /// returned 404; queries turn that into an empty result.
    async fn call(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        request: PeerRequest,
    ) -> ServiceResult<Option<RemoteReply>> {
        let access = if self.connections.is_connected(recipient)? {
            self.connections.resolve_outgoing(recipient, ctx.icr_key()?)?
        } else {
            None
        };

        let reply = try_retry(
            self.retry,
            |_| true,
            || {
                self.transport.send(
                    &self.tenant,
                    recipient,
                    access.as_ref().map(|a| &a.token),
                    request.clone(),
                )
            },
        )
        .await
        .map_err(|e| {
            warn!(recipient = %recipient, error = %e, "remote identity unreachable");
            ServiceError::client(
                ClientErrorCode::RemoteServerUnreachable,
                "failed while calling remote identity",
            )
        })?;

        match reply.status {
            StatusCode::OK => Ok(Some(RemoteReply {
                reply,
                secret: access.map(|a| a.shared_secret),
            })),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN if reply.icr_issue => {
                warn!(recipient = %recipient, "remote identity rejected our connection; revoking it locally");
                self.connections.revoke_connection(recipient)?;
                Err(ServiceError::security(format!("{recipient} no longer accepts this connection")))
            }
            StatusCode::FORBIDDEN => Err(ServiceError::security(format!("{recipient} denied the request"))),
            status if status.is_server_error() => Err(ServiceError::RemoteServer(format!(
                "{recipient} returned {status}"
            ))),
            status => Err(ServiceError::system(format!("{recipient} returned unexpected {status}"))),
        }
    }

    fn rewrap(
        ctx: &CallerContext,
        key_header: &EncryptedKeyHeader,
        secret: Option<&SensitiveByteArray>,
    ) -> ServiceResult<EncryptedKeyHeader> {
        if key_header.is_empty() {
            return Ok(EncryptedKeyHeader::empty());
        }
        let secret = secret.ok_or_else(|| ServiceError::security("encrypted content arrived without a connection"))?;
        Ok(key_header.rewrap(secret, ctx.shared_secret_key()?)?)
    }

    fn rewrap_headers(
        ctx: &CallerContext,
        headers: &mut [SharedSecretEncryptedFileHeader],
        secret: Option<&SensitiveByteArray>,
    ) -> ServiceResult<()> {
        for header in headers {
            header.shared_secret_encrypted_key_header =
                Self::rewrap(ctx, &header.shared_secret_encrypted_key_header, secret)?;
        }
        Ok(())
    }

    fn rewrap_content(
        ctx: &CallerContext,
        mut content: PeerContent,
        secret: Option<&SensitiveByteArray>,
    ) -> ServiceResult<PeerContent> {
        if let Some(key_header) = &content.shared_secret_encrypted_key_header {
            content.shared_secret_encrypted_key_header = Some(Self::rewrap(ctx, key_header, secret)?);
        }
        Ok(content)
    }

    fn decode<T: serde::de::DeserializeOwned>(reply: &PeerReply) -> ServiceResult<T> {
        reply
            .decode()
            .map_err(|e| ServiceError::system(format!("remote identity sent an unreadable reply: {e}")))
    }

    // ========== Headers and queries ==========

    pub async fn get_file_header(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        file: ExternalFileIdentifier,
    ) -> ServiceResult<Option<SharedSecretEncryptedFileHeader>> {
        ctx.assert_has_permission(PermissionKey::UseTransitRead)?;
        let Some(remote) = self.call(ctx, recipient, PeerRequest::GetFileHeader(file)).await? else {
            return Ok(None);
        };
        let mut header: SharedSecretEncryptedFileHeader = Self::decode(&remote.reply)?;
        Self::rewrap_headers(ctx, std::slice::from_mut(&mut header), remote.secret.as_ref())?;
        Ok(Some(header))
    }

    pub async fn get_batch(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        request: QueryBatchRequest,
    ) -> ServiceResult<QueryBatchResponse> {
        ctx.assert_has_permission(PermissionKey::UseTransitRead)?;
        let cursor_state = request.result_options.cursor_state.clone().unwrap_or_default();
        let Some(remote) = self.call(ctx, recipient, PeerRequest::QueryBatch(request)).await? else {
            debug!(recipient = %recipient, "remote drive not found");
            return Ok(QueryBatchResponse {
                name: None,
                cursor_state,
                has_more: false,
                search_results: Vec::new(),
            });
        };
        let mut response: QueryBatchResponse = Self::decode(&remote.reply)?;
        Self::rewrap_headers(ctx, &mut response.search_results, remote.secret.as_ref())?;
        debug!(recipient = %recipient, results = response.search_results.len(), "remote batch query");
        Ok(response)
    }

    pub async fn get_batch_collection(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        request: QueryBatchCollectionRequest,
    ) -> ServiceResult<QueryBatchCollectionResponse> {
        ctx.assert_has_permission(PermissionKey::UseTransitRead)?;
        let Some(remote) = self.call(ctx, recipient, PeerRequest::QueryBatchCollection(request)).await? else {
            return Ok(QueryBatchCollectionResponse { results: Vec::new() });
        };
        let mut response: QueryBatchCollectionResponse = Self::decode(&remote.reply)?;
        for result in &mut response.results {
            Self::rewrap_headers(ctx, &mut result.search_results, remote.secret.as_ref())?;
        }
        Ok(response)
    }

    pub async fn get_modified(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        request: QueryModifiedRequest,
    ) -> ServiceResult<QueryModifiedResponse> {
        ctx.assert_has_permission(PermissionKey::UseTransitRead)?;
        let cursor = request.result_options.cursor.unwrap_or_default();
        let Some(remote) = self.call(ctx, recipient, PeerRequest::QueryModified(request)).await? else {
            return Ok(QueryModifiedResponse {
                cursor,
                has_more: false,
                search_results: Vec::new(),
            });
        };
        let mut response: QueryModifiedResponse = Self::decode(&remote.reply)?;
        Self::rewrap_headers(ctx, &mut response.search_results, remote.secret.as_ref())?;
        Ok(response)
    }

    // ========== Content ==========

    pub async fn get_payload(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        request: GetPayloadRequest,
    ) -> ServiceResult<Option<PeerContent>> {
        ctx.assert_has_permission(PermissionKey::UseTransitRead)?;
        let Some(remote) = self.call(ctx, recipient, PeerRequest::GetPayload(request)).await? else {
            return Ok(None);
        };
        let content = remote
            .reply
            .into_content()
            .map_err(|e| ServiceError::system(e.to_string()))?;
        Self::rewrap_content(ctx, content, remote.secret.as_ref()).map(Some)
    }

    pub async fn get_thumbnail(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        request: GetThumbnailRequest,
    ) -> ServiceResult<Option<PeerContent>> {
        ctx.assert_has_permission(PermissionKey::UseTransitRead)?;
        let Some(remote) = self.call(ctx, recipient, PeerRequest::GetThumbnail(request)).await? else {
            return Ok(None);
        };
        let content = remote
            .reply
            .into_content()
            .map_err(|e| ServiceError::system(e.to_string()))?;
        Self::rewrap_content(ctx, content, remote.secret.as_ref()).map(Some)
    }

    // ========== Drives and context ==========

    pub async fn get_drives_by_type(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        drive_type: Uuid,
    ) -> ServiceResult<Vec<PeerDriveInfo>> {
        ctx.assert_has_permission(PermissionKey::UseTransitRead)?;
        match self
            .call(ctx, recipient, PeerRequest::GetDrivesByType(GetDrivesByTypeRequest { drive_type }))
            .await?
        {
            Some(remote) => Self::decode(&remote.reply),
            None => Ok(Vec::new()),
        }
    }

    /// How `recipient` sees this identity.
    pub async fn get_remote_context(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
    ) -> ServiceResult<RedactedCallerContext> {
        ctx.assert_has_at_least_one_permission(&[PermissionKey::UseTransitRead, PermissionKey::UseTransitWrite])?;
        let remote = self
            .call(ctx, recipient, PeerRequest::GetSecurityContext)
            .await?
            .ok_or_else(|| ServiceError::system(format!("{recipient} has no security context endpoint")))?;
        Self::decode(&remote.reply)
    }

    // ========== By global transit id ==========

    pub async fn get_file_header_by_global_transit_id(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        file: &GlobalTransitIdFileIdentifier,
    ) -> ServiceResult<Option<SharedSecretEncryptedFileHeader>> {
        let mut query_params = FileQueryParams::for_drive(file.target_drive.clone());
        query_params.global_transit_id = vec![file.global_transit_id];
        let response = self
            .get_batch(
                ctx,
                recipient,
                QueryBatchRequest {
                    query_params,
                    result_options: QueryBatchOptions {
                        cursor_state: None,
                        max_records: 1,
                    },
                },
            )
            .await?;
        Ok(response.search_results.into_iter().next())
    }

    pub async fn get_payload_by_global_transit_id(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        file: &GlobalTransitIdFileIdentifier,
        key: &str,
    ) -> ServiceResult<Option<PeerContent>> {
        let Some(header) = self.get_file_header_by_global_transit_id(ctx, recipient, file).await? else {
            return Ok(None);
        };
        self.get_payload(
            ctx,
            recipient,
            GetPayloadRequest {
                file: ExternalFileIdentifier {
                    target_drive: file.target_drive.clone(),
                    file_id: header.file_id,
                },
                key: key.to_string(),
            },
        )
        .await
    }

    pub async fn get_thumbnail_by_global_transit_id(
        &self,
        ctx: &CallerContext,
        recipient: &IdentityId,
        file: &GlobalTransitIdFileIdentifier,
        payload_key: &str,
        width: u32,
        height: u32,
    ) -> ServiceResult<Option<PeerContent>> {
        let Some(header) = self.get_file_header_by_global_transit_id(ctx, recipient, file).await? else {
            return Ok(None);
        };
        self.get_thumbnail(
            ctx,
            recipient,
            GetThumbnailRequest {
                file: ExternalFileIdentifier {
                    target_drive: file.target_drive.clone(),
                    file_id: header.file_id,
                },
                payload_key: payload_key.to_string(),
                width,
                height,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frodo, sam, TestWorld, UploadFixture};
    use crate::upload::instruction_set::TransitOptions;

    fn batch_for(drive: &crate::drive::StorageDrive) -> QueryBatchRequest {
        QueryBatchRequest {
            query_params: FileQueryParams::for_drive(drive.target_drive.clone()),
            result_options: QueryBatchOptions::default(),
        }
    }

    #[tokio::test]
    async fn key_headers_are_rewrapped_for_the_caller() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&sam(), false, false);
        let sam_owner = world.owner(&sam());

        let mut fixture = UploadFixture::new(&drive);
        let key_header = fixture.encrypt(&sam_owner);
        fixture.add_payload("doc", &[]);
        fixture.upload(&world, &sam(), &sam_owner).await.unwrap();

        let frodo_owner = world.owner(&frodo());
        let response = world
            .tenant(&frodo())
            .queries
            .get_batch(&frodo_owner, &sam(), batch_for(&drive))
            .await
            .unwrap();
        assert_eq!(response.search_results.len(), 1);

        let unwrapped = response.search_results[0]
            .shared_secret_encrypted_key_header
            .unwrap(frodo_owner.shared_secret_key().unwrap())
            .unwrap();
        assert!(unwrapped.aes_key().ct_eq(key_header.aes_key().as_bytes()));
        assert_eq!(unwrapped.iv(), key_header.iv());
    }

    #[tokio::test]
    async fn strangers_query_anonymously() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        let drive = world.create_drive(&sam(), false, false);

        let err = world
            .tenant(&frodo())
            .queries
            .get_batch(&world.owner(&frodo()), &sam(), batch_for(&drive))
            .await
            .unwrap_err();
        assert!(err.is_security());
        assert!(!world.tenant(&frodo()).connections.is_connected(&sam()).unwrap());
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&sam(), false, false);
        world.set_unreachable(&sam(), true);

        let err = world
            .tenant(&frodo())
            .queries
            .get_batch(&world.owner(&frodo()), &sam(), batch_for(&drive))
            .await
            .unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::RemoteServerUnreachable));
    }

    #[tokio::test]
    async fn rejected_connection_is_revoked_locally() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&sam(), false, false);
        world.tenant(&sam()).connections.revoke_connection(&frodo()).unwrap();

        let err = world
            .tenant(&frodo())
            .queries
            .get_batch(&world.owner(&frodo()), &sam(), batch_for(&drive))
            .await
            .unwrap_err();
        assert!(err.is_security());
        assert!(!world.tenant(&frodo()).connections.is_connected(&sam()).unwrap());
    }

    #[tokio::test]
    async fn missing_remote_drive_reads_as_empty() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let elsewhere = world.create_drive(&frodo(), false, false);
        let queries = &world.tenant(&frodo()).queries;
        let owner = world.owner(&frodo());

        let batch = queries.get_batch(&owner, &sam(), batch_for(&elsewhere)).await.unwrap();
        assert!(batch.search_results.is_empty());
        assert!(!batch.has_more);

        let modified = queries
            .get_modified(
                &owner,
                &sam(),
                QueryModifiedRequest {
                    query_params: FileQueryParams::for_drive(elsewhere.target_drive.clone()),
                    result_options: Default::default(),
                },
            )
            .await
            .unwrap();
        assert!(modified.search_results.is_empty());

        let file = GlobalTransitIdFileIdentifier {
            target_drive: elsewhere.target_drive.clone(),
            global_transit_id: Uuid::new_v4(),
        };
        assert!(queries
            .get_file_header_by_global_transit_id(&owner, &sam(), &file)
            .await
            .unwrap()
            .is_none());
        assert!(queries
            .get_payload_by_global_transit_id(&owner, &sam(), &file, "doc")
            .await
            .unwrap()
            .is_none());
        assert!(queries
            .get_thumbnail_by_global_transit_id(&owner, &sam(), &file, "doc", 20, 20)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unknown_global_transit_id_on_existing_drive() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&sam(), false, false);
        let sam_owner = world.owner(&sam());
        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        fixture.upload(&world, &sam(), &sam_owner).await.unwrap();

        let file = GlobalTransitIdFileIdentifier {
            target_drive: drive.target_drive.clone(),
            global_transit_id: Uuid::new_v4(),
        };
        let queries = &world.tenant(&frodo()).queries;
        let owner = world.owner(&frodo());
        assert!(queries
            .get_file_header_by_global_transit_id(&owner, &sam(), &file)
            .await
            .unwrap()
            .is_none());
        assert!(queries
            .get_payload_by_global_transit_id(&owner, &sam(), &file, "doc")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn payload_by_global_transit_id() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&sam(), false, false);
        let sam_owner = world.owner(&sam());

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        fixture.instruction_set.transit_options = Some(TransitOptions {
            use_global_transit_id: true,
            ..TransitOptions::default()
        });
        let uploaded = fixture.upload(&world, &sam(), &sam_owner).await.unwrap();
        let file = GlobalTransitIdFileIdentifier {
            target_drive: drive.target_drive.clone(),
            global_transit_id: uploaded.global_transit_id.unwrap(),
        };

        let queries = &world.tenant(&frodo()).queries;
        let frodo_owner = world.owner(&frodo());
        let content = queries
            .get_payload_by_global_transit_id(&frodo_owner, &sam(), &file, "doc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.bytes, b"doc bytes");
        assert!(!content.is_encrypted);
        assert!(content.shared_secret_encrypted_key_header.is_none());

        let missing = queries
            .get_payload_by_global_transit_id(&frodo_owner, &sam(), &file, "nope")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
