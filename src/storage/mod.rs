// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Tenant Storage Module
//!
//! Per-identity persistent storage. Each hosted identity gets its own
//! directory under the data root; nothing under one identity's root is ever
//! read on behalf of another.
//!
//! ## Storage Layout
//!
//! ```text
//! {DATA_DIR}/{identity}/
//!   drives/{drive_id}/
//!     drive.json                    # Drive definition + storage key
//!     files/{file_id}/
//!       header.json                 # ServerFileHeader
//!       {key}-{uid}.payload         # Payload bytes as uploaded
//!       {key}-{uid}-{w}x{h}.thumb   # Thumbnail bytes
//!   temp/{drive_id}/{file_id}/      # Upload parts before commit
//!   clients/{token_id}.json         # Registered local clients
//!   connections/{identity}.json     # Identity connection registrations
//!   outbox.redb                     # Pending peer deliveries
//! ```
//!
//! Drive storage keys and connection secrets are stored as-is, so `DATA_DIR`
//! must sit on an encrypted volume.

pub mod file_store;
pub mod paths;

pub use file_store::{FileStore, StorageError, StorageResult};
pub use paths::TenantPaths;
