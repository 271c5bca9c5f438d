// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Drive Module
//!
//! Drives, their files and the storage contract the pipelines commit to.
//!
//! - `acl` - security groups and access control lists
//! - `metadata` - persisted file headers
//! - `manager` - drive definitions and per-drive storage keys
//! - `storage` / `local` - the storage trait and its filesystem backend
//! - `file_system` - standard and comment file system rules
//! - `query` - batch and modified queries over headers

pub mod acl;
pub mod file_system;
pub mod local;
pub mod manager;
pub mod metadata;
pub mod query;
pub mod storage;

pub use acl::{AccessControlList, SecurityGroupType};
pub use file_system::{file_system_for, DriveFileSystem, FileSystemType};
pub use local::LocalDriveStorage;
pub use manager::{CreateDriveRequest, DriveManager, StorageDrive};
pub use metadata::{FileMetadata, PayloadDescriptor, ServerFileHeader, ServerMetadata};
pub use storage::DriveStorage;
