// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-flight upload packages.
//!
//! Packages live in a bounded LRU keyed by an opaque package id. Entries
//! older than the TTL are treated as abandoned; whoever evicts them is
//! responsible for deleting their temp parts.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use uuid::Uuid;

use super::instruction_set::{FileUpdateInstructionSet, UploadInstructionSet, UploadManifest};
use crate::drive::metadata::ThumbnailContent;
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::InternalDriveFileId;

pub type PackageId = Uuid;

#[derive(Debug, Clone)]
pub enum PackageInstructions {
    Upload(UploadInstructionSet),
    Update(FileUpdateInstructionSet),
}

/// A payload whose bytes have reached temp storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagePayload {
    pub key: String,
    pub uid: u64,
    pub iv: Vec<u8>,
    pub content_type: String,
    pub bytes_written: u64,
    pub descriptor_content: Option<String>,
    pub preview_thumbnail: Option<ThumbnailContent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageThumbnail {
    pub payload_key: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
pub struct UploadPackage {
    pub id: PackageId,
    /// Where the parts are staged and, for local files, committed.
    pub file: InternalDriveFileId,
    pub instructions: PackageInstructions,
    pub is_update_operation: bool,
    pub has_metadata: bool,
    pub payloads: Vec<PackagePayload>,
    pub thumbnails: Vec<PackageThumbnail>,
}

impl UploadPackage {
    pub fn new(file: InternalDriveFileId, instructions: PackageInstructions, is_update_operation: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            file,
            instructions,
            is_update_operation,
            has_metadata: false,
            payloads: Vec::new(),
            thumbnails: Vec::new(),
        }
    }

    pub fn manifest(&self) -> &UploadManifest {
        match &self.instructions {
            PackageInstructions::Upload(set) => &set.manifest,
            PackageInstructions::Update(set) => &set.manifest,
        }
    }

    pub fn transfer_iv(&self) -> &[u8] {
        match &self.instructions {
            PackageInstructions::Upload(set) => &set.transfer_iv,
            PackageInstructions::Update(set) => &set.transfer_iv,
        }
    }

    pub fn has_payload(&self, key: &str) -> bool {
        self.payloads.iter().any(|p| p.key.eq_ignore_ascii_case(key))
    }

    pub fn thumbnails_for<'a>(&'a self, payload_key: &'a str) -> impl Iterator<Item = &'a PackageThumbnail> + 'a {
        self.thumbnails.iter().filter(move |t| t.payload_key == payload_key)
    }
}

struct PackageEntry {
    package: UploadPackage,
    created_at: Instant,
}

/// Bounded arena of open packages.
pub struct PackageRegistry {
    packages: Mutex<LruCache<PackageId, PackageEntry>>,
    ttl: Duration,
}

fn lock_poisoned() -> ServiceError {
    ServiceError::system("upload package registry lock poisoned")
}

fn unknown_package(id: PackageId) -> ServiceError {
    ServiceError::client(ClientErrorCode::InvalidPackage, format!("unknown upload package {id}"))
}

impl PackageRegistry {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            packages: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Store a package. Returns the least recently used package if the
    /// registry was full.
    pub fn insert(&self, package: UploadPackage) -> ServiceResult<Option<UploadPackage>> {
        let mut packages = self.packages.lock().map_err(|_| lock_poisoned())?;
        let id = package.id;
        let evicted = packages.push(
            id,
            PackageEntry {
                package,
                created_at: Instant::now(),
            },
        );
        Ok(evicted.filter(|(key, _)| *key != id).map(|(_, entry)| entry.package))
    }

    /// Snapshot of a live package.
    pub fn get(&self, id: PackageId) -> ServiceResult<UploadPackage> {
        let mut packages = self.packages.lock().map_err(|_| lock_poisoned())?;
        match packages.get(&id) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => Ok(entry.package.clone()),
            _ => Err(unknown_package(id)),
        }
    }

    /// Apply `f` to a live package in place.
    pub fn update<T>(&self, id: PackageId, f: impl FnOnce(&mut UploadPackage) -> ServiceResult<T>) -> ServiceResult<T> {
        let mut packages = self.packages.lock().map_err(|_| lock_poisoned())?;
        match packages.get_mut(&id) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => f(&mut entry.package),
            _ => Err(unknown_package(id)),
        }
    }

    /// Take a live package out of the registry. Expired packages stay put
    /// for [`Self::evict_expired`] to reclaim.
    pub fn remove(&self, id: PackageId) -> ServiceResult<Option<UploadPackage>> {
        let mut packages = self.packages.lock().map_err(|_| lock_poisoned())?;
        match packages.peek(&id) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                Ok(packages.pop(&id).map(|entry| entry.package))
            }
            _ => Ok(None),
        }
    }

    /// Drop every package older than the TTL and hand them back for cleanup.
    pub fn evict_expired(&self) -> ServiceResult<Vec<UploadPackage>> {
        let mut packages = self.packages.lock().map_err(|_| lock_poisoned())?;
        let expired: Vec<PackageId> = packages
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= self.ttl)
            .map(|(id, _)| *id)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|id| packages.pop(&id))
            .map(|entry| entry.package)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.packages.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
