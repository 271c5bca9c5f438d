// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access control lists attached to every stored file.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::IdentityId;

/// Trust level of a caller, ordered from least to most trusted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum SecurityGroupType {
    #[default]
    Anonymous,
    Authenticated,
    Connected,
    Owner,
}

impl SecurityGroupType {
    /// Anonymous and authenticated readers hold no shared secret.
    pub fn holds_shared_secret(&self) -> bool {
        matches!(self, SecurityGroupType::Connected | SecurityGroupType::Owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlList {
    pub required_security_group: SecurityGroupType,
    #[serde(default)]
    pub circle_id_list: Vec<Uuid>,
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub identity_list: Vec<IdentityId>,
}

impl AccessControlList {
    pub fn owner_only() -> Self {
        Self::with_group(SecurityGroupType::Owner)
    }

    pub fn with_group(required_security_group: SecurityGroupType) -> Self {
        Self {
            required_security_group,
            circle_id_list: Vec::new(),
            identity_list: Vec::new(),
        }
    }

    /// Circles and explicit identities only narrow a `Connected` list.
    pub fn validate(&self) -> Result<(), String> {
        let narrows = !self.circle_id_list.is_empty() || !self.identity_list.is_empty();
        if narrows && self.required_security_group != SecurityGroupType::Connected {
            return Err(format!(
                "circles and identities require the connected security group, not {:?}",
                self.required_security_group
            ));
        }
        if self.circle_id_list.iter().any(Uuid::is_nil) {
            return Err("circle id list contains an empty id".to_string());
        }
        Ok(())
    }

    /// Whether a caller at `level`, optionally known as `identity` and a
    /// member of `circles`, may read a file carrying this list.
    pub fn is_satisfied_by(
        &self,
        level: SecurityGroupType,
        identity: Option<&IdentityId>,
        circles: &[Uuid],
    ) -> bool {
        if level == SecurityGroupType::Owner {
            return true;
        }
        if level < self.required_security_group {
            return false;
        }
        if self.required_security_group != SecurityGroupType::Connected {
            return true;
        }
        if self.circle_id_list.is_empty() && self.identity_list.is_empty() {
            return true;
        }
        let listed = identity.is_some_and(|id| self.identity_list.contains(id));
        let in_circle = self.circle_id_list.iter().any(|c| circles.contains(c));
        listed || in_circle
    }
}
