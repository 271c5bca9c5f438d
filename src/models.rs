// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identifiers shared by every layer: identities, drives and files.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ClientErrorCode, ServiceError, ServiceResult};

/// Milliseconds since the Unix epoch.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identity '{0}': expected a lowercase domain name")]
pub struct InvalidIdentity(pub String);

/// A hosted or remote identity, addressed by its domain name.
///
/// Always stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for IdentityId {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<&str> = name.split('.').collect();

        let valid = !name.is_empty()
            && name.len() <= 253
            && labels.len() >= 2
            && labels.iter().all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            });

        if valid {
            Ok(Self(name))
        } else {
            Err(InvalidIdentity(s.to_string()))
        }
    }
}

impl TryFrom<String> for IdentityId {
    type Error = InvalidIdentity;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IdentityId> for String {
    fn from(value: IdentityId) -> Self {
        value.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Drives and files
// =============================================================================

/// Public address of a drive: alias plus drive type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetDrive {
    pub alias: Uuid,
    #[serde(rename = "type")]
    pub drive_type: Uuid,
}

impl TargetDrive {
    pub fn new(alias: Uuid, drive_type: Uuid) -> Self {
        Self { alias, drive_type }
    }

    pub fn is_valid(&self) -> bool {
        !self.alias.is_nil() && !self.drive_type.is_nil()
    }
}

/// Server-side file address. Never leaves this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalDriveFileId {
    pub drive_id: Uuid,
    pub file_id: Uuid,
}

impl InternalDriveFileId {
    pub fn new(drive_id: Uuid, file_id: Uuid) -> Self {
        Self { drive_id, file_id }
    }
}

impl fmt::Display for InternalDriveFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.drive_id, self.file_id)
    }
}

/// Client-facing file address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalFileIdentifier {
    pub target_drive: TargetDrive,
    pub file_id: Uuid,
}

/// Address of a file that is the same across every identity holding a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTransitIdFileIdentifier {
    pub target_drive: TargetDrive,
    pub global_transit_id: Uuid,
}

impl GlobalTransitIdFileIdentifier {
    pub fn is_valid(&self) -> bool {
        self.target_drive.is_valid() && !self.global_transit_id.is_nil()
    }
}

/// Identifies a file by exactly one of its id, global transit id or client
/// unique id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIdentifier {
    pub target_drive: TargetDrive,
    #[serde(default)]
    pub file_id: Option<Uuid>,
    #[serde(default)]
    pub global_transit_id: Option<Uuid>,
    #[serde(default)]
    pub unique_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIdentifierKind {
    File(Uuid),
    GlobalTransitId(Uuid),
    UniqueId(Uuid),
}

impl FileIdentifier {
    pub fn kind(&self) -> ServiceResult<FileIdentifierKind> {
        let kind = match (self.file_id, self.global_transit_id, self.unique_id) {
            (Some(id), None, None) => FileIdentifierKind::File(id),
            (None, Some(id), None) => FileIdentifierKind::GlobalTransitId(id),
            (None, None, Some(id)) => FileIdentifierKind::UniqueId(id),
            _ => {
                return Err(ServiceError::client(
                    ClientErrorCode::InvalidFileIdentifier,
                    "exactly one of fileId, globalTransitId or uniqueId must be set",
                ))
            }
        };
        let id = match kind {
            FileIdentifierKind::File(id)
            | FileIdentifierKind::GlobalTransitId(id)
            | FileIdentifierKind::UniqueId(id) => id,
        };
        if id.is_nil() || !self.target_drive.is_valid() {
            return Err(ServiceError::client(
                ClientErrorCode::InvalidFileIdentifier,
                "file identifier is empty",
            ));
        }
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_normalised() {
        let id: IdentityId = " Frodo.Dotyou.Cloud. ".parse().unwrap();
        assert_eq!(id.as_str(), "frodo.dotyou.cloud");
    }

    #[test]
    fn identity_rejects_bad_names() {
        assert!("localhost".parse::<IdentityId>().is_err());
        assert!("".parse::<IdentityId>().is_err());
        assert!("bad_name.cloud".parse::<IdentityId>().is_err());
        assert!("-lead.cloud".parse::<IdentityId>().is_err());
        assert!("a..b".parse::<IdentityId>().is_err());
    }

    #[test]
    fn identity_serde_validates() {
        let ok: IdentityId = serde_json::from_str("\"sam.dotyou.cloud\"").unwrap();
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"sam.dotyou.cloud\"");
        assert!(serde_json::from_str::<IdentityId>("\"nope\"").is_err());
    }

    #[test]
    fn target_drive_serialises_type_field() {
        let drive = TargetDrive::new(Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_value(&drive).unwrap();
        assert!(json.get("type").is_some());
        assert!(json.get("alias").is_some());
    }

    #[test]
    fn file_identifier_requires_exactly_one_id() {
        let drive = TargetDrive::new(Uuid::new_v4(), Uuid::new_v4());
        let gtid = Uuid::new_v4();
        let ident = FileIdentifier {
            target_drive: drive.clone(),
            file_id: None,
            global_transit_id: Some(gtid),
            unique_id: None,
        };
        assert_eq!(ident.kind().unwrap(), FileIdentifierKind::GlobalTransitId(gtid));

        let both = FileIdentifier {
            file_id: Some(Uuid::new_v4()),
            ..ident.clone()
        };
        assert_eq!(
            both.kind().unwrap_err().client_code(),
            Some(ClientErrorCode::InvalidFileIdentifier)
        );

        let nil = FileIdentifier {
            global_transit_id: Some(Uuid::nil()),
            ..ident
        };
        assert!(nil.kind().is_err());
    }
}
