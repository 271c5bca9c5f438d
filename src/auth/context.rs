// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Explicit per-request caller context.
//!
//! A [`CallerContext`] is built once per request (by the HTTP extractor or
//! the peer perimeter) and passed by reference to every operation that needs
//! to know who is calling. It is never stored in shared state.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::permissions::{DriveGrant, DrivePermission, PermissionKey, PermissionSet};
use crate::crypto::SensitiveByteArray;
use crate::drive::SecurityGroupType;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{IdentityId, TargetDrive};

#[derive(Debug, Clone)]
pub struct CallerIdentity {
    /// `None` for anonymous callers.
    pub identity: Option<IdentityId>,
    pub security_level: SecurityGroupType,
    /// Circles the caller belongs to, for ACL checks.
    pub circles: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct PermissionContext {
    pub permission_set: PermissionSet,
    pub drive_grants: Vec<DriveGrant>,
    /// Secret shared with the calling client. Wraps key headers handed out.
    pub shared_secret: Option<SensitiveByteArray>,
    /// Key that opens the outgoing access of identity connections. Owner only.
    pub icr_key: Option<SensitiveByteArray>,
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    /// The hosted identity handling the request.
    pub tenant: IdentityId,
    pub caller: CallerIdentity,
    pub permissions: PermissionContext,
}

impl CallerContext {
    /// The tenant's owner: every permission and every drive.
    pub fn owner(tenant: IdentityId, shared_secret: SensitiveByteArray, icr_key: SensitiveByteArray) -> Self {
        Self {
            caller: CallerIdentity {
                identity: Some(tenant.clone()),
                security_level: SecurityGroupType::Owner,
                circles: Vec::new(),
            },
            tenant,
            permissions: PermissionContext {
                permission_set: PermissionSet::all(),
                drive_grants: Vec::new(),
                shared_secret: Some(shared_secret),
                icr_key: Some(icr_key),
            },
        }
    }

    /// A remote identity calling the perimeter.
    pub fn peer(
        tenant: IdentityId,
        identity: Option<IdentityId>,
        security_level: SecurityGroupType,
        shared_secret: Option<SensitiveByteArray>,
    ) -> Self {
        Self {
            tenant,
            caller: CallerIdentity {
                identity,
                security_level,
                circles: Vec::new(),
            },
            permissions: PermissionContext {
                shared_secret,
                ..PermissionContext::default()
            },
        }
    }

    pub fn is_owner(&self) -> bool {
        self.caller.security_level == SecurityGroupType::Owner
    }

    pub fn caller_identity(&self) -> Option<&IdentityId> {
        self.caller.identity.as_ref()
    }

    pub fn has_permission(&self, key: PermissionKey) -> bool {
        self.is_owner() || self.permissions.permission_set.has(key)
    }

    pub fn assert_has_permission(&self, key: PermissionKey) -> ServiceResult<()> {
        if self.has_permission(key) {
            Ok(())
        } else {
            Err(ServiceError::security(format!("caller lacks permission {key:?}")))
        }
    }

    pub fn assert_has_at_least_one_permission(&self, keys: &[PermissionKey]) -> ServiceResult<()> {
        if keys.iter().any(|k| self.has_permission(*k)) {
            Ok(())
        } else {
            Err(ServiceError::security(format!("caller lacks all of {keys:?}")))
        }
    }

    fn drive_permission(&self, drive_id: Uuid) -> Option<DrivePermission> {
        self.permissions
            .drive_grants
            .iter()
            .find(|g| g.drive_id == drive_id)
            .map(|g| g.permission)
    }

    pub fn can_read_drive(&self, drive_id: Uuid) -> bool {
        self.is_owner() || self.drive_permission(drive_id).is_some_and(|p| p.allows_read())
    }

    pub fn can_write_to_drive(&self, drive_id: Uuid) -> bool {
        self.is_owner() || self.drive_permission(drive_id).is_some_and(|p| p.allows_write())
    }

    pub fn assert_can_read_drive(&self, drive_id: Uuid) -> ServiceResult<()> {
        if self.can_read_drive(drive_id) {
            Ok(())
        } else {
            Err(ServiceError::security(format!("caller cannot read drive {drive_id}")))
        }
    }

    pub fn assert_can_write_to_drive(&self, drive_id: Uuid) -> ServiceResult<()> {
        if self.can_write_to_drive(drive_id) {
            Ok(())
        } else {
            Err(ServiceError::security(format!("caller cannot write to drive {drive_id}")))
        }
    }

    pub fn shared_secret_key(&self) -> ServiceResult<&SensitiveByteArray> {
        self.permissions
            .shared_secret
            .as_ref()
            .ok_or_else(|| ServiceError::security("caller holds no shared secret"))
    }

    pub fn icr_key(&self) -> ServiceResult<&SensitiveByteArray> {
        self.permissions
            .icr_key
            .as_ref()
            .ok_or_else(|| ServiceError::security("caller cannot use identity connections"))
    }

    pub fn redacted(&self) -> RedactedCallerContext {
        RedactedCallerContext {
            caller: self.caller.identity.as_ref().map(|i| i.to_string()),
            security_level: self.caller.security_level,
            permissions: self.permissions.permission_set.keys().collect(),
            drive_grants: self
                .permissions
                .drive_grants
                .iter()
                .map(|g| RedactedDriveGrant {
                    target_drive: g.target_drive.clone(),
                    permission: g.permission,
                })
                .collect(),
        }
    }
}

/// What a caller may learn about how this host sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedactedCallerContext {
    pub caller: Option<String>,
    pub security_level: SecurityGroupType,
    pub permissions: Vec<PermissionKey>,
    pub drive_grants: Vec<RedactedDriveGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedactedDriveGrant {
    pub target_drive: TargetDrive,
    pub permission: DrivePermission,
}
