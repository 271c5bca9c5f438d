// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! On-disk layout of one hosted identity.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::models::{IdentityId, InternalDriveFileId};

/// Default base directory for all tenant data.
pub const DATA_ROOT: &str = "/data";

/// Name of the header file inside a stored file's directory.
pub const HEADER_FILE: &str = "header.json";

/// Paths for a single tenant, rooted at `{data_root}/{identity}`.
#[derive(Debug, Clone)]
pub struct TenantPaths {
    root: PathBuf,
}

impl TenantPaths {
    pub fn new(data_root: impl AsRef<Path>, identity: &IdentityId) -> Self {
        Self {
            root: data_root.as_ref().join(identity.as_str()),
        }
    }

    /// Root directory for this tenant's data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========== Drive Paths ==========

    pub fn drives_dir(&self) -> PathBuf {
        self.root.join("drives")
    }

    pub fn drive_dir(&self, drive_id: Uuid) -> PathBuf {
        self.drives_dir().join(drive_id.to_string())
    }

    /// Drive definition and its storage key.
    pub fn drive_record(&self, drive_id: Uuid) -> PathBuf {
        self.drive_dir(drive_id).join("drive.json")
    }

    pub fn drive_files_dir(&self, drive_id: Uuid) -> PathBuf {
        self.drive_dir(drive_id).join("files")
    }

    // ========== File Paths ==========

    pub fn file_dir(&self, file: &InternalDriveFileId) -> PathBuf {
        self.drive_files_dir(file.drive_id).join(file.file_id.to_string())
    }

    pub fn file_header(&self, file: &InternalDriveFileId) -> PathBuf {
        self.file_dir(file).join(HEADER_FILE)
    }

    pub fn file_part(&self, file: &InternalDriveFileId, part: &str) -> PathBuf {
        self.file_dir(file).join(part)
    }

    // ========== Temp Upload Paths ==========

    pub fn temp_root(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn temp_dir(&self, file: &InternalDriveFileId) -> PathBuf {
        self.temp_root()
            .join(file.drive_id.to_string())
            .join(file.file_id.to_string())
    }

    pub fn temp_part(&self, file: &InternalDriveFileId, part: &str) -> PathBuf {
        self.temp_dir(file).join(part)
    }

    // ========== Client Paths ==========

    pub fn clients_dir(&self) -> PathBuf {
        self.root.join("clients")
    }

    pub fn client_record(&self, token_id: Uuid) -> PathBuf {
        self.clients_dir().join(format!("{token_id}.json"))
    }

    // ========== Connection Paths ==========

    pub fn connections_dir(&self) -> PathBuf {
        self.root.join("connections")
    }

    pub fn connection_record(&self, identity: &IdentityId) -> PathBuf {
        self.connections_dir().join(format!("{identity}.json"))
    }

    /// Server-held keys of the tenant itself.
    pub fn tenant_keys(&self) -> PathBuf {
        self.root.join("keys.json")
    }

    // ========== Outbox ==========

    pub fn outbox_db(&self) -> PathBuf {
        self.root.join("outbox.redb")
    }
}
