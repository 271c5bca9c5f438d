// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! File system variants.
//!
//! Every drive holds two logical file systems: standard files and comments
//! attached to another file. They share the whole upload pipeline and only
//! differ in the rules below, selected by [`FileSystemType`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::manager::DriveManager;
use super::metadata::FileMetadata;
use super::storage::DriveStorage;
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum FileSystemType {
    #[default]
    Standard,
    Comment,
}

impl FileSystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystemType::Standard => "standard",
            FileSystemType::Comment => "comment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" | "128" => Some(FileSystemType::Standard),
            "comment" | "32" => Some(FileSystemType::Comment),
            _ => None,
        }
    }
}

#[async_trait]
pub trait DriveFileSystem: Send + Sync {
    fn file_system_type(&self) -> FileSystemType;

    /// Structural checks on declared metadata.
    fn validate_metadata(&self, metadata: &FileMetadata) -> ServiceResult<()>;

    /// Checks that need to look at other stored files.
    async fn validate_references(
        &self,
        drives: &DriveManager,
        storage: &dyn DriveStorage,
        metadata: &FileMetadata,
    ) -> ServiceResult<()>;
}

pub struct StandardFileSystem;

pub struct CommentFileSystem;

static STANDARD: StandardFileSystem = StandardFileSystem;
static COMMENT: CommentFileSystem = CommentFileSystem;

pub fn file_system_for(kind: FileSystemType) -> &'static dyn DriveFileSystem {
    match kind {
        FileSystemType::Standard => &STANDARD,
        FileSystemType::Comment => &COMMENT,
    }
}

#[async_trait]
impl DriveFileSystem for StandardFileSystem {
    fn file_system_type(&self) -> FileSystemType {
        FileSystemType::Standard
    }

    fn validate_metadata(&self, metadata: &FileMetadata) -> ServiceResult<()> {
        if metadata.referenced_file.is_some() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidReferenceFile,
                "standard files cannot reference another file",
            ));
        }
        Ok(())
    }

    async fn validate_references(
        &self,
        _drives: &DriveManager,
        _storage: &dyn DriveStorage,
        _metadata: &FileMetadata,
    ) -> ServiceResult<()> {
        Ok(())
    }
}

#[async_trait]
impl DriveFileSystem for CommentFileSystem {
    fn file_system_type(&self) -> FileSystemType {
        FileSystemType::Comment
    }

    fn validate_metadata(&self, metadata: &FileMetadata) -> ServiceResult<()> {
        match &metadata.referenced_file {
            Some(reference) if reference.is_valid() => {}
            _ => {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidReferenceFile,
                    "comments must reference a file by global transit id",
                ))
            }
        }
        if metadata.payloads.len() > 1 {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidUpload,
                "comments carry at most one payload",
            ));
        }
        Ok(())
    }

    /// The referenced file must be stored here, unless it lives on a drive
    /// this identity does not host (comments on a peer's post).
    async fn validate_references(
        &self,
        drives: &DriveManager,
        storage: &dyn DriveStorage,
        metadata: &FileMetadata,
    ) -> ServiceResult<()> {
        let Some(reference) = &metadata.referenced_file else {
            return Ok(());
        };
        let Some(drive) = drives.get_drive_by_target(&reference.target_drive)? else {
            return Ok(());
        };
        match storage
            .find_by_global_transit_id(drive.id, reference.global_transit_id)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(ServiceError::client(
                ClientErrorCode::InvalidReferenceFile,
                "referenced file does not exist",
            )),
        }
    }
}
