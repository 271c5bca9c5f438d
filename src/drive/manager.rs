// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Drive definitions and their storage keys.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::{secret::KEY_LENGTH, SensitiveByteArray};
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::models::TargetDrive;
use crate::storage::FileStore;

/// Alias of the per-tenant drive that holds files only while they are sent.
pub const TRANSIENT_TEMP_DRIVE_ALIAS: Uuid = Uuid::from_u128(0x90f5_e74a_b7f9_efda_0ac2_98373a32ad1b);
pub const TRANSIENT_TEMP_DRIVE_TYPE: Uuid = Uuid::from_u128(0x9f1d_7bce_6b1b_4f3a_9f11_7ce2_a3de_6a20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageDrive {
    pub id: Uuid,
    pub name: String,
    pub target_drive: TargetDrive,
    /// Only files with an owner ACL may be stored here.
    pub owner_only: bool,
    pub allow_anonymous_reads: bool,
    pub allow_subscriptions: bool,
    #[serde(default)]
    pub is_system: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDriveRequest {
    pub name: String,
    pub target_drive: TargetDrive,
    #[serde(default)]
    pub owner_only: bool,
    #[serde(default)]
    pub allow_anonymous_reads: bool,
    #[serde(default)]
    pub allow_subscriptions: bool,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveRecord {
    drive: StorageDrive,
    storage_key: SensitiveByteArray,
}

pub struct DriveManager {
    store: FileStore,
    drives: RwLock<HashMap<Uuid, DriveRecord>>,
}

fn lock_poisoned() -> ServiceError {
    ServiceError::system("drive registry lock poisoned")
}

fn unknown_drive(what: impl std::fmt::Display) -> ServiceError {
    ServiceError::client(ClientErrorCode::InvalidTargetDrive, format!("drive not found: {what}"))
}

impl DriveManager {
    /// Load every drive stored for the tenant and make sure the transient
    /// temp drive exists.
    pub fn open(store: FileStore) -> ServiceResult<Self> {
        let mut drives = HashMap::new();
        for name in store.list_dirs(store.paths().drives_dir())? {
            let Ok(id) = name.parse::<Uuid>() else {
                continue;
            };
            if let Some(record) = store.try_read_json::<DriveRecord>(store.paths().drive_record(id))? {
                drives.insert(id, record);
            }
        }

        let manager = Self {
            store,
            drives: RwLock::new(drives),
        };

        let transient = TargetDrive::new(TRANSIENT_TEMP_DRIVE_ALIAS, TRANSIENT_TEMP_DRIVE_TYPE);
        if manager.get_drive_by_target(&transient)?.is_none() {
            manager.insert(
                CreateDriveRequest {
                    name: "Transient temp drive".to_string(),
                    target_drive: transient,
                    owner_only: false,
                    allow_anonymous_reads: false,
                    allow_subscriptions: false,
                },
                true,
            )?;
        }
        Ok(manager)
    }

    pub fn create_drive(&self, request: CreateDriveRequest) -> ServiceResult<StorageDrive> {
        self.insert(request, false)
    }

    fn insert(&self, request: CreateDriveRequest, is_system: bool) -> ServiceResult<StorageDrive> {
        if !request.target_drive.is_valid() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidTargetDrive,
                "drive alias and type must be set",
            ));
        }

        let mut drives = self.drives.write().map_err(|_| lock_poisoned())?;
        if drives.values().any(|r| r.drive.target_drive == request.target_drive) {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidTargetDrive,
                "a drive with this alias and type already exists",
            ));
        }

        let drive = StorageDrive {
            id: Uuid::new_v4(),
            name: request.name,
            target_drive: request.target_drive,
            owner_only: request.owner_only,
            allow_anonymous_reads: request.allow_anonymous_reads,
            allow_subscriptions: request.allow_subscriptions,
            is_system,
        };
        let record = DriveRecord {
            drive: drive.clone(),
            storage_key: SensitiveByteArray::random(KEY_LENGTH)?,
        };
        self.store.write_json(self.store.paths().drive_record(drive.id), &record)?;
        drives.insert(drive.id, record);

        info!(drive_id = %drive.id, name = %drive.name, owner_only = drive.owner_only, "drive created");
        Ok(drive)
    }

    pub fn get_drive(&self, drive_id: Uuid) -> ServiceResult<StorageDrive> {
        let drives = self.drives.read().map_err(|_| lock_poisoned())?;
        drives
            .get(&drive_id)
            .map(|r| r.drive.clone())
            .ok_or_else(|| unknown_drive(drive_id))
    }

    pub fn get_drive_by_target(&self, target: &TargetDrive) -> ServiceResult<Option<StorageDrive>> {
        let drives = self.drives.read().map_err(|_| lock_poisoned())?;
        Ok(drives
            .values()
            .find(|r| &r.drive.target_drive == target)
            .map(|r| r.drive.clone()))
    }

    pub fn get_drive_id(&self, target: &TargetDrive) -> ServiceResult<Uuid> {
        self.get_drive_by_target(target)?
            .map(|d| d.id)
            .ok_or_else(|| unknown_drive(target.alias))
    }

    pub fn get_drives_by_type(&self, drive_type: Uuid) -> ServiceResult<Vec<StorageDrive>> {
        let drives = self.drives.read().map_err(|_| lock_poisoned())?;
        let mut found: Vec<StorageDrive> = drives
            .values()
            .filter(|r| r.drive.target_drive.drive_type == drive_type)
            .map(|r| r.drive.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    pub fn transient_temp_drive(&self) -> ServiceResult<StorageDrive> {
        self.get_drive_by_target(&TargetDrive::new(TRANSIENT_TEMP_DRIVE_ALIAS, TRANSIENT_TEMP_DRIVE_TYPE))?
            .ok_or_else(|| ServiceError::system("transient temp drive is missing"))
    }

    /// Server-held key that wraps key headers at rest on this drive.
    pub fn storage_key(&self, drive_id: Uuid) -> ServiceResult<SensitiveByteArray> {
        let drives = self.drives.read().map_err(|_| lock_poisoned())?;
        drives
            .get(&drive_id)
            .map(|r| r.storage_key.clone())
            .ok_or_else(|| unknown_drive(drive_id))
    }

    pub fn all_drives(&self) -> ServiceResult<Vec<StorageDrive>> {
        let drives = self.drives.read().map_err(|_| lock_poisoned())?;
        Ok(drives.values().map(|r| r.drive.clone()).collect())
    }
}
