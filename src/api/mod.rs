// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth::{context::RedactedDriveGrant, RedactedCallerContext},
    drive::{AccessControlList, FileSystemType, SecurityGroupType},
    models::{ExternalFileIdentifier, TargetDrive},
    state::AppState,
    transit::{
        sender::OutboxSweepReport,
        types::{DeleteLinkedFileStatus, TransferStatus},
        wire,
    },
    upload::{UpdateResult, UploadResult},
};

pub mod drive;
pub mod health;
pub mod perimeter;
pub mod transit;

/// Largest multipart body accepted by the upload and transfer routes.
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let upload_routes = Router::new()
        .route("/drive/files/upload", post(drive::upload_file))
        .route("/drive/files/update", patch(drive::update_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES));

    let v1_routes = Router::new()
        .merge(upload_routes)
        .route("/transit/outbox/process", post(transit::process_outbox))
        .route("/transit/delete-linked-file", post(transit::delete_linked_file))
        .route("/transit/query/header", post(transit::get_file_header))
        .route("/transit/query/batch", post(transit::get_batch))
        .route("/transit/query/batch-collection", post(transit::get_batch_collection))
        .route("/transit/query/modified", post(transit::get_modified))
        .route("/transit/query/payload", post(transit::get_payload))
        .route("/transit/query/thumb", post(transit::get_thumbnail))
        .route("/transit/query/drives", post(transit::get_drives_by_type))
        .route("/transit/query/context", post(transit::get_remote_context))
        .route(
            "/transit/query/header-by-global-transit-id",
            post(transit::get_file_header_by_global_transit_id),
        )
        .route(
            "/transit/query/payload-by-global-transit-id",
            post(transit::get_payload_by_global_transit_id),
        )
        .route(
            "/transit/query/thumb-by-global-transit-id",
            post(transit::get_thumbnail_by_global_transit_id),
        );

    let perimeter_routes = Router::new()
        .route(
            wire::HOST_STREAM_PATH,
            post(perimeter::host_stream).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(wire::HOST_DELETE_LINKED_FILE_PATH, post(perimeter::delete_linked_file))
        .route(wire::QUERY_BATCH_PATH, post(perimeter::query_batch))
        .route(wire::QUERY_BATCH_COLLECTION_PATH, post(perimeter::query_batch_collection))
        .route(wire::QUERY_MODIFIED_PATH, post(perimeter::query_modified))
        .route(wire::FILE_HEADER_PATH, post(perimeter::file_header))
        .route(wire::PAYLOAD_PATH, post(perimeter::payload))
        .route(wire::THUMBNAIL_PATH, post(perimeter::thumbnail))
        .route(wire::DRIVES_BY_TYPE_PATH, post(perimeter::drives_by_type))
        .route(wire::SECURITY_CONTEXT_PATH, get(perimeter::security_context));

    Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/api/v1", v1_routes)
        .nest(wire::PERIMETER_PREFIX, perimeter_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::liveness,
        health::readiness,
        drive::upload_file,
        drive::update_file,
        transit::process_outbox,
        transit::delete_linked_file,
        transit::get_file_header,
        transit::get_batch,
        transit::get_batch_collection,
        transit::get_modified,
        transit::get_payload,
        transit::get_thumbnail,
        transit::get_drives_by_type,
        transit::get_remote_context,
        transit::get_file_header_by_global_transit_id,
        transit::get_payload_by_global_transit_id,
        transit::get_thumbnail_by_global_transit_id,
        perimeter::host_stream,
        perimeter::delete_linked_file,
        perimeter::query_batch,
        perimeter::query_batch_collection,
        perimeter::query_modified,
        perimeter::file_header,
        perimeter::payload,
        perimeter::thumbnail,
        perimeter::drives_by_type,
        perimeter::security_context
    ),
    components(
        schemas(
            health::HealthResponse,
            health::ReadyResponse,
            health::HealthChecks,
            UploadResult,
            UpdateResult,
            TransferStatus,
            OutboxSweepReport,
            DeleteLinkedFileStatus,
            transit::DeleteLinkedFileRequest,
            transit::DeleteLinkedFileResponse,
            transit::RemoteIdentity,
            RedactedCallerContext,
            RedactedDriveGrant,
            ExternalFileIdentifier,
            TargetDrive,
            AccessControlList,
            SecurityGroupType,
            FileSystemType
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Drive", description = "Uploads and updates of drive files"),
        (name = "Transit", description = "Sending to and reading from connected identities"),
        (name = "Perimeter", description = "Endpoints called by other identities' hosts")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::{Config, DATA_DIR_ENV, TENANTS_ENV};
    use crate::test_support::{frodo, TestWorld, UploadFixture};

    const BOUNDARY: &str = "x-test-boundary";

    fn app(world: &TestWorld, data_dir: &TempDir) -> Router {
        let dir = data_dir.path().to_string_lossy().to_string();
        let config = Config::from_lookup(|name| match name {
            TENANTS_ENV => Some(frodo().to_string()),
            DATA_DIR_ENV => Some(dir.clone()),
            _ => None,
        })
        .unwrap();
        router(AppState::new(world.registry.clone(), config))
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, bytes) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let world = TestWorld::new(&[frodo()]).await;
        let dir = TempDir::new().unwrap();
        let _ = app(&world, &dir).into_make_service();
    }

    #[tokio::test]
    async fn health_probes_report_tenants() {
        let world = TestWorld::new(&[frodo()]).await;
        let dir = TempDir::new().unwrap();

        let response = app(&world, &dir)
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&world, &dir)
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["checks"]["tenants"][frodo().to_string()], "ok");
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let world = TestWorld::new(&[frodo()]).await;
        let dir = TempDir::new().unwrap();

        let response = app(&world, &dir)
            .oneshot(
                Request::post("/api/v1/transit/outbox/process")
                    .header(header::HOST, "nobody.dotyou.cloud")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn local_routes_require_a_client_token() {
        let world = TestWorld::new(&[frodo()]).await;
        let dir = TempDir::new().unwrap();

        let response = app(&world, &dir)
            .oneshot(
                Request::post("/api/v1/transit/outbox/process")
                    .header(header::HOST, "frodo.dotyou.cloud:443")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn anonymous_peer_gets_anonymous_context() {
        let world = TestWorld::new(&[frodo()]).await;
        let dir = TempDir::new().unwrap();

        let response = app(&world, &dir)
            .oneshot(
                Request::get("/api/perimeter/security/context")
                    .header(wire::PEER_RECIPIENT_HEADER, "frodo.dotyou.cloud")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["securityLevel"], "anonymous");
    }

    #[tokio::test]
    async fn multipart_upload_commits_file() {
        let world = TestWorld::new(&[frodo()]).await;
        let dir = TempDir::new().unwrap();
        let tenant = world.tenant(&frodo());
        let drive = world.create_drive(&frodo(), false, false);
        let client = tenant.clients.register_owner("browser", tenant.icr_key()).unwrap();

        let mut fixture = UploadFixture::new(&drive);
        fixture.add_payload("doc", &[]);
        let instructions = serde_json::to_vec(&fixture.instruction_set).unwrap();
        let sealed = fixture
            .descriptor
            .seal(&client.shared_secret, &fixture.instruction_set.transfer_iv)
            .unwrap();
        let body = multipart_body(&[
            ("instructions", None, &instructions),
            ("metadata", Some("metadata"), &sealed),
            ("payload", Some("doc"), b"doc bytes"),
        ]);

        let response = app(&world, &dir)
            .oneshot(
                Request::post("/api/v1/drive/files/upload")
                    .header(header::HOST, "frodo.dotyou.cloud")
                    .header(header::AUTHORIZATION, format!("Bearer {}", client.token.to_portable().as_str()))
                    .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["newVersionTag"].is_string());

        let headers = tenant.storage.list_headers(drive.id).await.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].file_metadata.payloads[0].key, "doc");
        assert_eq!(tenant.uploads.pending(), 0);
    }

    #[tokio::test]
    async fn upload_with_undeclared_part_is_abandoned() {
        let world = TestWorld::new(&[frodo()]).await;
        let dir = TempDir::new().unwrap();
        let tenant = world.tenant(&frodo());
        let drive = world.create_drive(&frodo(), false, false);
        let client = tenant.clients.register_owner("browser", tenant.icr_key()).unwrap();

        let fixture = UploadFixture::new(&drive);
        let instructions = serde_json::to_vec(&fixture.instruction_set).unwrap();
        let body = multipart_body(&[
            ("instructions", None, &instructions),
            ("payload", Some("undeclared"), b"bytes"),
        ]);

        let response = app(&world, &dir)
            .oneshot(
                Request::post("/api/v1/drive/files/upload")
                    .header(header::HOST, "frodo.dotyou.cloud")
                    .header(header::AUTHORIZATION, format!("Bearer {}", client.token.to_portable().as_str()))
                    .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["errorCode"], "invalidUpload");
        assert_eq!(tenant.uploads.pending(), 0);
    }
}
