// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Upload and update endpoints.
//!
//! Both take `multipart/form-data` whose first part is `instructions` (JSON),
//! followed by `metadata` (the sealed descriptor), then any number of
//! `payload` and `thumbnail` parts whose file names carry their keys.

use axum::{extract::Multipart, Json};
use serde::de::DeserializeOwned;
use tracing::info;

use crate::auth::TenantCaller;
use crate::error::{ClientErrorCode, ServiceError, ServiceResult};
use crate::transit::wire::{INSTRUCTIONS_FIELD, METADATA_FIELD};
use crate::upload::{
    FileUpdateInstructionSet, PackageId, UpdateResult, UploadInstructionSet, UploadPackageAssembler, UploadResult,
};

pub const PAYLOAD_FIELD: &str = "payload";
pub const THUMBNAIL_FIELD: &str = "thumbnail";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

fn invalid_upload(message: impl Into<String>) -> ServiceError {
    ServiceError::client(ClientErrorCode::InvalidUpload, message)
}

/// Read the leading `instructions` part.
async fn read_instructions<T: DeserializeOwned>(multipart: &mut Multipart) -> ServiceResult<T> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| invalid_upload(e.to_string()))?
        .ok_or_else(|| ServiceError::client(ClientErrorCode::MissingUploadData, "upload has no parts"))?;
    if field.name() != Some(INSTRUCTIONS_FIELD) {
        return Err(ServiceError::client(
            ClientErrorCode::InvalidInstructionSet,
            "the first part must be the instruction set",
        ));
    }
    let bytes = field.bytes().await.map_err(|e| invalid_upload(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ServiceError::client(
            ClientErrorCode::InvalidInstructionSet,
            format!("unreadable instruction set: {e}"),
        )
    })
}

/// Stream every remaining part into the package.
async fn receive_parts(
    uploads: &UploadPackageAssembler,
    package: PackageId,
    mut multipart: Multipart,
) -> ServiceResult<()> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid_upload(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let key = field.file_name().map(str::to_string);
        let content_type = field.content_type().unwrap_or(DEFAULT_CONTENT_TYPE).to_string();
        let bytes = field.bytes().await.map_err(|e| invalid_upload(e.to_string()))?;

        match (name.as_str(), key) {
            (METADATA_FIELD, _) => uploads.add_metadata(package, &bytes).await?,
            (PAYLOAD_FIELD, Some(key)) => uploads.add_payload(package, &key, &content_type, &bytes).await?,
            (THUMBNAIL_FIELD, Some(key)) => uploads.add_thumbnail(package, &key, &content_type, &bytes).await?,
            (PAYLOAD_FIELD | THUMBNAIL_FIELD, None) => {
                return Err(invalid_upload(format!("{name} part has no key in its file name")));
            }
            (other, _) => return Err(invalid_upload(format!("unexpected part '{other}'"))),
        }
    }
    Ok(())
}

/// Upload a new file or overwrite an existing one.
///
/// Recipients named in the transit options receive the committed file;
/// their outcome is reported per recipient.
#[utoipa::path(
    post,
    path = "/api/v1/drive/files/upload",
    tag = "Drive",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object), content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "File committed", body = UploadResult),
        (status = 400, description = "Invalid upload"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Caller may not write to the drive")
    )
)]
pub async fn upload_file(caller: TenantCaller, mut multipart: Multipart) -> Result<Json<UploadResult>, ServiceError> {
    let TenantCaller { tenant, ctx } = caller;
    let instruction_set: UploadInstructionSet = read_instructions(&mut multipart).await?;
    let package = tenant.uploads.create_package(&ctx, instruction_set).await?;

    if let Err(e) = receive_parts(&tenant.uploads, package, multipart).await {
        tenant.uploads.abandon(package).await;
        return Err(e);
    }

    let result = tenant.uploads.finalize_upload(&ctx, package).await?;
    info!(
        tenant = %tenant.identity,
        file_id = %result.file.file_id,
        recipients = result.recipient_status.len(),
        "upload finished"
    );
    Ok(Json(result))
}

/// Apply payload changes to an existing file, locally or on the
/// recipients' copies.
#[utoipa::path(
    patch,
    path = "/api/v1/drive/files/update",
    tag = "Drive",
    security(("bearer_auth" = [])),
    request_body(content = inline(Object), content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Update applied or enqueued", body = UpdateResult),
        (status = 400, description = "Invalid update"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn update_file(caller: TenantCaller, mut multipart: Multipart) -> Result<Json<UpdateResult>, ServiceError> {
    let TenantCaller { tenant, ctx } = caller;
    let instruction_set: FileUpdateInstructionSet = read_instructions(&mut multipart).await?;
    let package = tenant.updates.create_package(&ctx, instruction_set).await?;

    if let Err(e) = receive_parts(&tenant.uploads, package, multipart).await {
        tenant.uploads.abandon(package).await;
        return Err(e);
    }

    let result = tenant.updates.finalize_update(&ctx, package).await?;
    info!(
        tenant = %tenant.identity,
        new_version_tag = %result.new_version_tag,
        recipients = result.recipient_status.len(),
        "update finished"
    );
    Ok(Json(result))
}
