// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The drive storage contract used by the upload and transit pipelines.

use async_trait::async_trait;
use uuid::Uuid;

use super::metadata::{PayloadDescriptor, ServerFileHeader};
use super::query::{self, BatchPage, FileQueryParams, ModifiedPage, QueryBatchOptions, QueryModifiedOptions};
use crate::models::InternalDriveFileId;
use crate::storage::StorageResult;

/// Temp part holding the client-encrypted upload descriptor.
pub const METADATA_PART: &str = "metadata";

pub fn payload_part_name(key: &str, uid: u64) -> String {
    format!("{key}-{uid}.payload")
}

pub fn thumbnail_part_name(key: &str, uid: u64, width: u32, height: u32) -> String {
    format!("{key}-{uid}-{width}x{height}.thumb")
}

/// Every long-term part a header refers to.
pub fn referenced_parts(header: &ServerFileHeader) -> Vec<String> {
    header
        .file_metadata
        .payloads
        .iter()
        .flat_map(|p| {
            std::iter::once(payload_part_name(&p.key, p.uid)).chain(
                p.thumbnails
                    .iter()
                    .map(|t| thumbnail_part_name(&p.key, p.uid, t.pixel_width, t.pixel_height)),
            )
        })
        .collect()
}

/// Temp and long-term file persistence for one tenant.
///
/// Commit operations move whichever temp parts the header references into
/// long-term storage, write the header, then drop long-term parts the header
/// no longer references.
#[async_trait]
pub trait DriveStorage: Send + Sync {
    fn create_file_id(&self, drive_id: Uuid) -> InternalDriveFileId {
        InternalDriveFileId::new(drive_id, Uuid::new_v4())
    }

    /// Returns the number of bytes written.
    async fn write_temp_stream(&self, file: &InternalDriveFileId, part: &str, data: &[u8]) -> StorageResult<u64>;

    async fn get_temp_stream(&self, file: &InternalDriveFileId, part: &str) -> StorageResult<Vec<u8>>;

    async fn delete_temp_files(&self, file: &InternalDriveFileId) -> StorageResult<()>;

    /// Fails with `AlreadyExists` when the file is already stored.
    async fn commit_new_file(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()>;

    /// Replace a stored file. Fails with `NotFound` when it is not stored.
    async fn overwrite_file(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()>;

    /// Merge newly uploaded payloads into a stored file.
    async fn update_batch(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()>;

    async fn get_server_file_header(&self, file: &InternalDriveFileId) -> StorageResult<Option<ServerFileHeader>>;

    async fn file_exists(&self, file: &InternalDriveFileId) -> StorageResult<bool>;

    async fn get_payload(&self, file: &InternalDriveFileId, descriptor: &PayloadDescriptor) -> StorageResult<Vec<u8>>;

    async fn get_thumbnail(
        &self,
        file: &InternalDriveFileId,
        descriptor: &PayloadDescriptor,
        width: u32,
        height: u32,
    ) -> StorageResult<Vec<u8>>;

    async fn list_headers(&self, drive_id: Uuid) -> StorageResult<Vec<ServerFileHeader>>;

    async fn hard_delete(&self, file: &InternalDriveFileId) -> StorageResult<()>;

    async fn find_by_unique_id(&self, drive_id: Uuid, unique_id: Uuid) -> StorageResult<Option<ServerFileHeader>> {
        Ok(self
            .list_headers(drive_id)
            .await?
            .into_iter()
            .find(|h| h.file_metadata.app_data.unique_id == Some(unique_id)))
    }

    async fn find_by_global_transit_id(
        &self,
        drive_id: Uuid,
        global_transit_id: Uuid,
    ) -> StorageResult<Option<ServerFileHeader>> {
        Ok(self
            .list_headers(drive_id)
            .await?
            .into_iter()
            .find(|h| h.file_metadata.global_transit_id == Some(global_transit_id)))
    }

    async fn query_batch(
        &self,
        drive_id: Uuid,
        params: &FileQueryParams,
        options: &QueryBatchOptions,
    ) -> StorageResult<BatchPage> {
        Ok(query::batch(self.list_headers(drive_id).await?, params, options))
    }

    async fn query_modified(
        &self,
        drive_id: Uuid,
        params: &FileQueryParams,
        options: &QueryModifiedOptions,
    ) -> StorageResult<ModifiedPage> {
        Ok(query::modified(self.list_headers(drive_id).await?, params, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::metadata::ThumbnailDescriptor;
    use crate::test_support::{sample_header, sample_payload};

    #[test]
    fn part_names() {
        assert_eq!(payload_part_name("image", 42), "image-42.payload");
        assert_eq!(thumbnail_part_name("image", 42, 200, 100), "image-42-200x100.thumb");
    }

    #[test]
    fn referenced_parts_include_thumbnails() {
        let mut header = sample_header(Uuid::new_v4(), 1);
        let mut payload = sample_payload("image", 7);
        payload.thumbnails.push(ThumbnailDescriptor {
            pixel_width: 20,
            pixel_height: 10,
            content_type: "image/png".to_string(),
            bytes_written: 3,
        });
        header.file_metadata.payloads = vec![payload, sample_payload("doc", 8)];

        let parts = referenced_parts(&header);
        assert_eq!(
            parts,
            vec![
                "image-7.payload".to_string(),
                "image-7-20x10.thumb".to_string(),
                "doc-8.payload".to_string()
            ]
        );
    }
}
