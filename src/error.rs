// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Service error taxonomy.
//!
//! | Class | Meaning | HTTP |
//! |-------|---------|------|
//! | `Client` | malformed or policy-violating request, carries a [`ClientErrorCode`] | 400 |
//! | `Security` | missing permission, bad or revoked token | 403 |
//! | `RemoteServer` | a peer answered with an internal error | 502 |
//! | `System` | local failure (storage, outbox, RNG) | 500 |
//!
//! None of these are retried by the caller-facing pipeline; per-recipient
//! transient failures are handled by the outbox instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::transit::outbox::OutboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ClientErrorCode {
    CannotOverwriteNonExistentFile,
    CannotUploadEncryptedFileForAnonymous,
    DriveSecurityAndAclMismatch,
    ExistingFileWithUniqueId,
    FileNotFound,
    InvalidAccessControlList,
    InvalidFile,
    InvalidFileIdentifier,
    InvalidInstructionSet,
    InvalidKeyHeader,
    InvalidPackage,
    InvalidRecipient,
    InvalidReferenceFile,
    InvalidTargetDrive,
    InvalidUpload,
    MalformedMetadata,
    MaxContentLengthExceeded,
    MissingUploadData,
    MissingVersionTag,
    NotAConnectedIdentity,
    RemoteServerUnreachable,
    VersionTagMismatch,
}

impl ClientErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientErrorCode::CannotOverwriteNonExistentFile => "cannotOverwriteNonExistentFile",
            ClientErrorCode::CannotUploadEncryptedFileForAnonymous => {
                "cannotUploadEncryptedFileForAnonymous"
            }
            ClientErrorCode::DriveSecurityAndAclMismatch => "driveSecurityAndAclMismatch",
            ClientErrorCode::ExistingFileWithUniqueId => "existingFileWithUniqueId",
            ClientErrorCode::FileNotFound => "fileNotFound",
            ClientErrorCode::InvalidAccessControlList => "invalidAccessControlList",
            ClientErrorCode::InvalidFile => "invalidFile",
            ClientErrorCode::InvalidFileIdentifier => "invalidFileIdentifier",
            ClientErrorCode::InvalidInstructionSet => "invalidInstructionSet",
            ClientErrorCode::InvalidKeyHeader => "invalidKeyHeader",
            ClientErrorCode::InvalidPackage => "invalidPackage",
            ClientErrorCode::InvalidRecipient => "invalidRecipient",
            ClientErrorCode::InvalidReferenceFile => "invalidReferenceFile",
            ClientErrorCode::InvalidTargetDrive => "invalidTargetDrive",
            ClientErrorCode::InvalidUpload => "invalidUpload",
            ClientErrorCode::MalformedMetadata => "malformedMetadata",
            ClientErrorCode::MaxContentLengthExceeded => "maxContentLengthExceeded",
            ClientErrorCode::MissingUploadData => "missingUploadData",
            ClientErrorCode::MissingVersionTag => "missingVersionTag",
            ClientErrorCode::NotAConnectedIdentity => "notAConnectedIdentity",
            ClientErrorCode::RemoteServerUnreachable => "remoteServerUnreachable",
            ClientErrorCode::VersionTagMismatch => "versionTagMismatch",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{message}")]
    Client {
        code: ClientErrorCode,
        message: String,
    },

    #[error("security violation: {0}")]
    Security(String),

    #[error("remote server returned an internal error: {0}")]
    RemoteServer(String),

    #[error("system error: {0}")]
    System(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    error_code: &'static str,
}

impl ServiceError {
    pub fn client(code: ClientErrorCode, message: impl Into<String>) -> Self {
        ServiceError::Client {
            code,
            message: message.into(),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        ServiceError::Security(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        ServiceError::System(message.into())
    }

    pub fn client_code(&self) -> Option<ClientErrorCode> {
        match self {
            ServiceError::Client { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_security(&self) -> bool {
        matches!(self, ServiceError::Security(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Client { code, .. } => code.as_str(),
            ServiceError::Security(_) => "securityError",
            ServiceError::RemoteServer(_) => "remoteServerReturnedInternalServerError",
            ServiceError::System(_) => "systemError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Client { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Security(_) => StatusCode::FORBIDDEN,
            ServiceError::RemoteServer(_) => StatusCode::BAD_GATEWAY,
            ServiceError::System(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CryptoError> for ServiceError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::RandomUnavailable => ServiceError::system(e.to_string()),
            _ => ServiceError::client(ClientErrorCode::InvalidKeyHeader, "invalid key header"),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => {
                ServiceError::client(ClientErrorCode::FileNotFound, format!("not found: {what}"))
            }
            other => ServiceError::system(other.to_string()),
        }
    }
}

impl From<OutboxError> for ServiceError {
    fn from(e: OutboxError) -> Self {
        ServiceError::system(e.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ServiceError::System(detail) => {
                error!(error = %detail, "request failed with a system error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(ErrorBody {
            error: message,
            error_code: self.error_code(),
        });
        (status, body).into_response()
    }
}
