// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Filesystem-backed [`DriveStorage`].

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::metadata::{PayloadDescriptor, ServerFileHeader};
use super::storage::{payload_part_name, referenced_parts, thumbnail_part_name, DriveStorage};
use crate::models::InternalDriveFileId;
use crate::storage::paths::HEADER_FILE;
use crate::storage::{FileStore, StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Existing {
    MustNotExist,
    MustExist,
}

#[derive(Debug, Clone)]
pub struct LocalDriveStorage {
    store: FileStore,
}

impl LocalDriveStorage {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    fn check_part_name(part: &str) -> StorageResult<()> {
        let valid = !part.is_empty()
            && part != HEADER_FILE
            && !part.contains(['/', '\\'])
            && !part.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(StorageError::InvalidPartName(part.to_string()))
        }
    }

    fn commit(&self, file: &InternalDriveFileId, header: &ServerFileHeader, existing: Existing) -> StorageResult<()> {
        let paths = self.store.paths();
        let header_path = paths.file_header(file);
        match (existing, self.store.exists(&header_path)) {
            (Existing::MustNotExist, true) => return Err(StorageError::AlreadyExists(file.to_string())),
            (Existing::MustExist, false) => return Err(StorageError::NotFound(file.to_string())),
            _ => {}
        }

        let parts = referenced_parts(header);
        for part in &parts {
            let temp = paths.temp_part(file, part);
            if self.store.exists(&temp) {
                self.store.move_file(&temp, paths.file_part(file, part))?;
            } else if !self.store.exists(paths.file_part(file, part)) {
                warn!(file = %file, part = %part, "header references a part that was never uploaded");
            }
        }

        self.store.write_json(&header_path, header)?;

        for name in self.store.list_file_names(paths.file_dir(file))? {
            if name != HEADER_FILE && !parts.contains(&name) {
                debug!(file = %file, part = %name, "removing unreferenced part");
                self.store.delete(paths.file_part(file, &name))?;
            }
        }

        if let Err(e) = self.store.delete_dir(paths.temp_dir(file)) {
            warn!(file = %file, error = %e, "failed to clean temp parts after commit");
        }
        Ok(())
    }
}

#[async_trait]
impl DriveStorage for LocalDriveStorage {
    async fn write_temp_stream(&self, file: &InternalDriveFileId, part: &str, data: &[u8]) -> StorageResult<u64> {
        Self::check_part_name(part)?;
        self.store.write_raw(self.store.paths().temp_part(file, part), data)
    }

    async fn get_temp_stream(&self, file: &InternalDriveFileId, part: &str) -> StorageResult<Vec<u8>> {
        Self::check_part_name(part)?;
        self.store.read_raw(self.store.paths().temp_part(file, part))
    }

    async fn delete_temp_files(&self, file: &InternalDriveFileId) -> StorageResult<()> {
        self.store.delete_dir(self.store.paths().temp_dir(file))
    }

    async fn commit_new_file(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()> {
        self.commit(file, header, Existing::MustNotExist)
    }

    async fn overwrite_file(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()> {
        self.commit(file, header, Existing::MustExist)
    }

    async fn update_batch(&self, file: &InternalDriveFileId, header: &ServerFileHeader) -> StorageResult<()> {
        self.commit(file, header, Existing::MustExist)
    }

    async fn get_server_file_header(&self, file: &InternalDriveFileId) -> StorageResult<Option<ServerFileHeader>> {
        self.store.try_read_json(self.store.paths().file_header(file))
    }

    async fn file_exists(&self, file: &InternalDriveFileId) -> StorageResult<bool> {
        Ok(self.store.exists(self.store.paths().file_header(file)))
    }

    async fn get_payload(&self, file: &InternalDriveFileId, descriptor: &PayloadDescriptor) -> StorageResult<Vec<u8>> {
        let part = payload_part_name(&descriptor.key, descriptor.uid);
        self.store.read_raw(self.store.paths().file_part(file, &part))
    }

    async fn get_thumbnail(
        &self,
        file: &InternalDriveFileId,
        descriptor: &PayloadDescriptor,
        width: u32,
        height: u32,
    ) -> StorageResult<Vec<u8>> {
        let part = thumbnail_part_name(&descriptor.key, descriptor.uid, width, height);
        self.store.read_raw(self.store.paths().file_part(file, &part))
    }

    async fn list_headers(&self, drive_id: Uuid) -> StorageResult<Vec<ServerFileHeader>> {
        let paths = self.store.paths();
        let mut headers = Vec::new();
        for name in self.store.list_dirs(paths.drive_files_dir(drive_id))? {
            let Ok(file_id) = name.parse::<Uuid>() else {
                continue;
            };
            let file = InternalDriveFileId::new(drive_id, file_id);
            if let Some(header) = self.store.try_read_json(paths.file_header(&file))? {
                headers.push(header);
            }
        }
        Ok(headers)
    }

    async fn hard_delete(&self, file: &InternalDriveFileId) -> StorageResult<()> {
        self.store.delete_dir(self.store.paths().file_dir(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TenantPaths;
    use crate::test_support::{sample_header, sample_payload};
    use tempfile::TempDir;

    fn storage() -> (TempDir, LocalDriveStorage) {
        let dir = TempDir::new().unwrap();
        let paths = TenantPaths::new(dir.path(), &"frodo.dotyou.cloud".parse().unwrap());
        (dir, LocalDriveStorage::new(FileStore::open(paths).unwrap()))
    }

    fn header_for(file: InternalDriveFileId) -> ServerFileHeader {
        let mut header = sample_header(file.drive_id, 1_000);
        header.file_metadata.file = Some(file);
        header
    }

    #[tokio::test]
    async fn commit_moves_temp_parts() {
        let (_dir, storage) = storage();
        let file = storage.create_file_id(Uuid::new_v4());
        let mut header = header_for(file);
        header.file_metadata.payloads = vec![sample_payload("doc", 1)];

        storage.write_temp_stream(&file, "doc-1.payload", b"hello").await.unwrap();
        storage.commit_new_file(&file, &header).await.unwrap();

        assert!(storage.file_exists(&file).await.unwrap());
        let payload = storage.get_payload(&file, &header.file_metadata.payloads[0]).await.unwrap();
        assert_eq!(payload, b"hello");
        assert!(storage.get_temp_stream(&file, "doc-1.payload").await.is_err());

        let err = storage.commit_new_file(&file, &header).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn overwrite_drops_unreferenced_parts() {
        let (_dir, storage) = storage();
        let file = storage.create_file_id(Uuid::new_v4());
        let mut header = header_for(file);
        header.file_metadata.payloads = vec![sample_payload("doc", 1), sample_payload("img", 2)];
        storage.write_temp_stream(&file, "doc-1.payload", b"v1").await.unwrap();
        storage.write_temp_stream(&file, "img-2.payload", b"pic").await.unwrap();
        storage.commit_new_file(&file, &header).await.unwrap();

        header.file_metadata.payloads = vec![sample_payload("doc", 3), sample_payload("img", 2)];
        storage.write_temp_stream(&file, "doc-3.payload", b"v2").await.unwrap();
        storage.overwrite_file(&file, &header).await.unwrap();

        let stored = storage.get_server_file_header(&file).await.unwrap().unwrap();
        assert_eq!(stored.file_metadata.payloads.len(), 2);
        assert_eq!(storage.get_payload(&file, &sample_payload("doc", 3)).await.unwrap(), b"v2");
        assert_eq!(storage.get_payload(&file, &sample_payload("img", 2)).await.unwrap(), b"pic");
        assert!(storage.get_payload(&file, &sample_payload("doc", 1)).await.is_err());
    }

    #[tokio::test]
    async fn overwrite_requires_existing_file() {
        let (_dir, storage) = storage();
        let file = storage.create_file_id(Uuid::new_v4());
        let err = storage.overwrite_file(&file, &header_for(file)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn lookups_by_unique_and_global_transit_id() {
        let (_dir, storage) = storage();
        let drive_id = Uuid::new_v4();
        let file = storage.create_file_id(drive_id);
        let mut header = header_for(file);
        let unique = Uuid::new_v4();
        let gtid = Uuid::new_v4();
        header.file_metadata.app_data.unique_id = Some(unique);
        header.file_metadata.global_transit_id = Some(gtid);
        storage.commit_new_file(&file, &header).await.unwrap();

        let by_unique = storage.find_by_unique_id(drive_id, unique).await.unwrap().unwrap();
        assert_eq!(by_unique.file(), Some(file));
        let by_gtid = storage.find_by_global_transit_id(drive_id, gtid).await.unwrap().unwrap();
        assert_eq!(by_gtid.file(), Some(file));
        assert!(storage.find_by_unique_id(drive_id, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_like_part_names() {
        let (_dir, storage) = storage();
        let file = storage.create_file_id(Uuid::new_v4());
        for bad in ["../escape", "header.json", ".hidden", ""] {
            let err = storage.write_temp_stream(&file, bad, b"x").await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidPartName(_)));
        }
    }

    #[tokio::test]
    async fn hard_delete_removes_file() {
        let (_dir, storage) = storage();
        let file = storage.create_file_id(Uuid::new_v4());
        storage.commit_new_file(&file, &header_for(file)).await.unwrap();
        storage.hard_delete(&file).await.unwrap();
        assert!(!storage.file_exists(&file).await.unwrap());
    }
}
