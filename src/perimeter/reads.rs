// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Drive reads served to other identities.
//!
//! Connected peers may read every drive that is neither owner only nor a
//! system drive; anonymous callers only drives that allow anonymous reads.
//! Files are further filtered by their ACL, and key headers are wrapped
//! under the caller's connection secret.

use uuid::Uuid;

use super::PeerPerimeterService;
use crate::auth::CallerContext;
use crate::crypto::EncryptedKeyHeader;
use crate::drive::metadata::{PayloadDescriptor, ServerFileHeader};
use crate::drive::{SecurityGroupType, StorageDrive};
use crate::error::{ServiceError, ServiceResult};
use crate::models::{ExternalFileIdentifier, InternalDriveFileId, TargetDrive};
use crate::transit::wire::{
    GetPayloadRequest, GetThumbnailRequest, PeerContent, PeerDriveInfo, QueryBatchCollectionRequest,
    QueryBatchCollectionResponse, QueryBatchRequest, QueryBatchResponse, QueryModifiedRequest, QueryModifiedResponse,
    SharedSecretEncryptedFileHeader,
};

impl PeerPerimeterService {
    fn may_read(ctx: &CallerContext, drive: &StorageDrive) -> bool {
        if drive.is_system || drive.owner_only {
            return false;
        }
        match ctx.caller.security_level {
            SecurityGroupType::Anonymous | SecurityGroupType::Authenticated => drive.allow_anonymous_reads,
            SecurityGroupType::Connected | SecurityGroupType::Owner => true,
        }
    }

    /// `Ok(None)` when the drive does not exist; security error when the
    /// caller may not read it.
    fn readable_drive(&self, ctx: &CallerContext, target: &TargetDrive) -> ServiceResult<Option<StorageDrive>> {
        match self.drives.get_drive_by_target(target)? {
            None => Ok(None),
            Some(drive) if Self::may_read(ctx, &drive) => Ok(Some(drive)),
            Some(_) => Err(ServiceError::security("drive is not readable by this caller")),
        }
    }

    fn can_see(ctx: &CallerContext, header: &ServerFileHeader) -> bool {
        header.server_metadata.access_control_list.is_satisfied_by(
            ctx.caller.security_level,
            ctx.caller_identity(),
            &ctx.caller.circles,
        )
    }

    /// The stored key header re-wrapped under the caller's secret.
    fn key_header_for_caller(
        &self,
        ctx: &CallerContext,
        drive: &StorageDrive,
        header: &ServerFileHeader,
    ) -> ServiceResult<EncryptedKeyHeader> {
        if !header.file_metadata.is_encrypted || header.encrypted_key_header.is_empty() {
            return Ok(EncryptedKeyHeader::empty());
        }
        let storage_key = self.drives.storage_key(drive.id)?;
        Ok(header
            .encrypted_key_header
            .rewrap(&storage_key, ctx.shared_secret_key()?)?)
    }

    fn to_peer_header(
        &self,
        ctx: &CallerContext,
        drive: &StorageDrive,
        header: &ServerFileHeader,
    ) -> ServiceResult<SharedSecretEncryptedFileHeader> {
        let file = header
            .file()
            .ok_or_else(|| ServiceError::system("stored header has no file address"))?;
        Ok(SharedSecretEncryptedFileHeader {
            file_id: file.file_id,
            target_drive: drive.target_drive.clone(),
            file_metadata: header.file_metadata.redacted(),
            server_metadata: header.server_metadata.clone(),
            shared_secret_encrypted_key_header: self.key_header_for_caller(ctx, drive, header)?,
        })
    }

    fn to_peer_headers(
        &self,
        ctx: &CallerContext,
        drive: &StorageDrive,
        headers: Vec<ServerFileHeader>,
    ) -> ServiceResult<Vec<SharedSecretEncryptedFileHeader>> {
        headers
            .iter()
            .filter(|h| Self::can_see(ctx, h))
            .map(|h| self.to_peer_header(ctx, drive, h))
            .collect()
    }

    // ========== Queries ==========

    pub async fn query_batch(
        &self,
        ctx: &CallerContext,
        request: QueryBatchRequest,
    ) -> ServiceResult<Option<QueryBatchResponse>> {
        let Some(drive) = self.readable_drive(ctx, &request.query_params.target_drive)? else {
            return Ok(None);
        };
        let page = self
            .storage
            .query_batch(drive.id, &request.query_params, &request.result_options)
            .await?;
        Ok(Some(QueryBatchResponse {
            name: None,
            cursor_state: page.cursor_state,
            has_more: page.has_more,
            search_results: self.to_peer_headers(ctx, &drive, page.headers)?,
        }))
    }

    /// Run each named section; sections over missing drives come back empty.
    pub async fn query_batch_collection(
        &self,
        ctx: &CallerContext,
        request: QueryBatchCollectionRequest,
    ) -> ServiceResult<QueryBatchCollectionResponse> {
        let mut results = Vec::with_capacity(request.queries.len());
        for section in request.queries {
            let response = self
                .query_batch(
                    ctx,
                    QueryBatchRequest {
                        query_params: section.query_params,
                        result_options: section.result_options,
                    },
                )
                .await?;
            results.push(match response {
                Some(mut response) => {
                    response.name = Some(section.name);
                    response
                }
                None => QueryBatchResponse {
                    name: Some(section.name),
                    cursor_state: String::new(),
                    has_more: false,
                    search_results: Vec::new(),
                },
            });
        }
        Ok(QueryBatchCollectionResponse { results })
    }

    pub async fn query_modified(
        &self,
        ctx: &CallerContext,
        request: QueryModifiedRequest,
    ) -> ServiceResult<Option<QueryModifiedResponse>> {
        let Some(drive) = self.readable_drive(ctx, &request.query_params.target_drive)? else {
            return Ok(None);
        };
        let page = self
            .storage
            .query_modified(drive.id, &request.query_params, &request.result_options)
            .await?;
        Ok(Some(QueryModifiedResponse {
            cursor: page.cursor,
            has_more: page.has_more,
            search_results: self.to_peer_headers(ctx, &drive, page.headers)?,
        }))
    }

    // ========== Single files ==========

    /// A visible stored header plus the drive holding it. Files the caller
    /// may not see are reported as missing.
    async fn visible_file(
        &self,
        ctx: &CallerContext,
        file: &ExternalFileIdentifier,
    ) -> ServiceResult<Option<(StorageDrive, ServerFileHeader)>> {
        let Some(drive) = self.readable_drive(ctx, &file.target_drive)? else {
            return Ok(None);
        };
        let internal = InternalDriveFileId::new(drive.id, file.file_id);
        Ok(self
            .storage
            .get_server_file_header(&internal)
            .await?
            .filter(|h| Self::can_see(ctx, h))
            .map(|h| (drive, h)))
    }

    pub async fn get_file_header(
        &self,
        ctx: &CallerContext,
        file: ExternalFileIdentifier,
    ) -> ServiceResult<Option<SharedSecretEncryptedFileHeader>> {
        match self.visible_file(ctx, &file).await? {
            Some((drive, header)) => self.to_peer_header(ctx, &drive, &header).map(Some),
            None => Ok(None),
        }
    }

    fn content(
        &self,
        ctx: &CallerContext,
        drive: &StorageDrive,
        header: &ServerFileHeader,
        bytes: Vec<u8>,
        content_type: String,
        payload: &PayloadDescriptor,
    ) -> ServiceResult<PeerContent> {
        let is_encrypted = header.file_metadata.is_encrypted;
        Ok(PeerContent {
            bytes,
            content_type,
            is_encrypted,
            shared_secret_encrypted_key_header: if is_encrypted {
                Some(self.key_header_for_caller(ctx, drive, header)?)
            } else {
                None
            },
            last_modified: payload.last_modified,
        })
    }

    pub async fn get_payload(&self, ctx: &CallerContext, request: GetPayloadRequest) -> ServiceResult<Option<PeerContent>> {
        let Some((drive, header)) = self.visible_file(ctx, &request.file).await? else {
            return Ok(None);
        };
        let Some(payload) = header.file_metadata.get_payload(&request.key) else {
            return Ok(None);
        };
        let Some(file) = header.file() else {
            return Ok(None);
        };
        let bytes = self.storage.get_payload(&file, payload).await?;
        self.content(ctx, &drive, &header, bytes, payload.content_type.clone(), payload)
            .map(Some)
    }

    pub async fn get_thumbnail(
        &self,
        ctx: &CallerContext,
        request: GetThumbnailRequest,
    ) -> ServiceResult<Option<PeerContent>> {
        let Some((drive, header)) = self.visible_file(ctx, &request.file).await? else {
            return Ok(None);
        };
        let Some(payload) = header.file_metadata.get_payload(&request.payload_key) else {
            return Ok(None);
        };
        let Some(thumbnail) = payload
            .thumbnails
            .iter()
            .find(|t| t.pixel_width == request.width && t.pixel_height == request.height)
        else {
            return Ok(None);
        };
        let Some(file) = header.file() else {
            return Ok(None);
        };
        let bytes = self
            .storage
            .get_thumbnail(&file, payload, request.width, request.height)
            .await?;
        self.content(ctx, &drive, &header, bytes, thumbnail.content_type.clone(), payload)
            .map(Some)
    }

    pub fn get_drives_by_type(&self, ctx: &CallerContext, drive_type: Uuid) -> ServiceResult<Vec<PeerDriveInfo>> {
        Ok(self
            .drives
            .get_drives_by_type(drive_type)?
            .into_iter()
            .filter(|d| Self::may_read(ctx, d))
            .map(|d| PeerDriveInfo {
                target_drive: d.target_drive,
                name: d.name,
                allow_anonymous_reads: d.allow_anonymous_reads,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::AccessControlList;
    use crate::drive::query::FileQueryParams;
    use crate::test_support::{frodo, sam, sample_header, TestWorld};

    async fn store(world: &TestWorld, drive: &StorageDrive, acl: AccessControlList) -> InternalDriveFileId {
        let storage = &world.tenant(&frodo()).storage;
        let file = storage.create_file_id(drive.id);
        let mut header = sample_header(drive.id, 10);
        header.file_metadata.file = Some(file);
        header.server_metadata.access_control_list = acl;
        storage.commit_new_file(&file, &header).await.unwrap();
        file
    }

    #[tokio::test]
    async fn acl_filters_batch_results() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, true);
        store(&world, &drive, AccessControlList::with_group(SecurityGroupType::Anonymous)).await;
        store(&world, &drive, AccessControlList::with_group(SecurityGroupType::Connected)).await;
        store(&world, &drive, AccessControlList::owner_only()).await;
        let perimeter = world.tenant(&frodo()).perimeter.clone();

        let request = || QueryBatchRequest {
            query_params: FileQueryParams::for_drive(drive.target_drive.clone()),
            result_options: Default::default(),
        };

        let anonymous = perimeter.authenticate(None, None).unwrap();
        let seen = perimeter.query_batch(&anonymous, request()).await.unwrap().unwrap();
        assert_eq!(seen.search_results.len(), 1);

        let connected = world.peer_context(&frodo(), &sam());
        let seen = perimeter.query_batch(&connected, request()).await.unwrap().unwrap();
        assert_eq!(seen.search_results.len(), 2);
    }

    #[tokio::test]
    async fn private_drive_is_closed_to_anonymous_callers() {
        let world = TestWorld::new(&[frodo()]).await;
        let drive = world.create_drive(&frodo(), false, false);
        let perimeter = world.tenant(&frodo()).perimeter.clone();
        let anonymous = perimeter.authenticate(None, None).unwrap();

        let err = perimeter
            .query_batch(
                &anonymous,
                QueryBatchRequest {
                    query_params: FileQueryParams::for_drive(drive.target_drive.clone()),
                    result_options: Default::default(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_security());
    }

    #[tokio::test]
    async fn hidden_file_reads_as_missing() {
        let world = TestWorld::new(&[frodo(), sam()]).await;
        world.connect(&frodo(), &sam());
        let drive = world.create_drive(&frodo(), false, false);
        let file = store(&world, &drive, AccessControlList::owner_only()).await;

        let connected = world.peer_context(&frodo(), &sam());
        let header = world
            .tenant(&frodo())
            .perimeter
            .get_file_header(
                &connected,
                ExternalFileIdentifier {
                    target_drive: drive.target_drive.clone(),
                    file_id: file.file_id,
                },
            )
            .await
            .unwrap();
        assert!(header.is_none());
    }

    #[tokio::test]
    async fn collection_sections_keep_their_names() {
        let world = TestWorld::new(&[frodo()]).await;
        let drive = world.create_drive(&frodo(), false, true);
        store(&world, &drive, AccessControlList::with_group(SecurityGroupType::Anonymous)).await;
        let perimeter = world.tenant(&frodo()).perimeter.clone();
        let anonymous = perimeter.authenticate(None, None).unwrap();

        let response = perimeter
            .query_batch_collection(
                &anonymous,
                QueryBatchCollectionRequest {
                    queries: vec![
                        crate::transit::wire::CollectionQueryParamSection {
                            name: "posts".to_string(),
                            query_params: FileQueryParams::for_drive(drive.target_drive.clone()),
                            result_options: Default::default(),
                        },
                        crate::transit::wire::CollectionQueryParamSection {
                            name: "missing".to_string(),
                            query_params: FileQueryParams::for_drive(TargetDrive::new(Uuid::new_v4(), Uuid::new_v4())),
                            result_options: Default::default(),
                        },
                    ],
                },
            )
            .await
            .unwrap();
        assert_eq!(response.results[0].name.as_deref(), Some("posts"));
        assert_eq!(response.results[0].search_results.len(), 1);
        assert!(response.results[1].search_results.is_empty());
    }
}
