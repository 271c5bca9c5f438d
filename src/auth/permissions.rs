// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Permission keys and drive grants.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::TargetDrive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum PermissionKey {
    UseTransitRead,
    UseTransitWrite,
    ReadConnections,
    SendPushNotifications,
}

impl PermissionKey {
    pub const ALL: [PermissionKey; 4] = [
        PermissionKey::UseTransitRead,
        PermissionKey::UseTransitWrite,
        PermissionKey::ReadConnections,
        PermissionKey::SendPushNotifications,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<PermissionKey>);

impl PermissionSet {
    pub fn new(keys: impl IntoIterator<Item = PermissionKey>) -> Self {
        Self(keys.into_iter().collect())
    }

    pub fn all() -> Self {
        Self::new(PermissionKey::ALL)
    }

    pub fn has(&self, key: PermissionKey) -> bool {
        self.0.contains(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = PermissionKey> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum DrivePermission {
    Read,
    Write,
    ReadWrite,
}

impl DrivePermission {
    pub fn allows_read(&self) -> bool {
        matches!(self, DrivePermission::Read | DrivePermission::ReadWrite)
    }

    pub fn allows_write(&self) -> bool {
        matches!(self, DrivePermission::Write | DrivePermission::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveGrant {
    pub drive_id: Uuid,
    pub target_drive: TargetDrive,
    pub permission: DrivePermission,
}
