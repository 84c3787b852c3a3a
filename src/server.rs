//! HTTP gateway.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/spaces` | Create a knowledge space |
//! | `POST` | `/v1/spaces/{spaceId}/docs` | Upload a document (multipart `title`, `file`) |
//! | `PUT` | `/v1/spaces/{spaceId}/docs/{docId}` | Rename and/or replace a document |
//! | `DELETE` | `/v1/spaces/{spaceId}/docs/{docId}` | Delete a document |
//! | `GET` | `/v1/spaces/{spaceId}/docs/search?q=` | Search document titles |
//! | `POST` | `/v1/spaces/{spaceId}/qa/stream` | Ask a question, answer streamed as SSE |
//! | `GET` | `/health` | Health check |
//!
//! # Error Contract
//!
//! Business errors answer `200` with
//!
//! ```json
//! { "error": "document not found: 5f1c...", "code": "document_not_found" }
//! ```
//!
//! Unexpected faults answer `500` with a generic message; the cause is only
//! logged.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::error::GatewayError;
use crate::ingest::DocumentService;
use crate::mapping::MappingStore;
use crate::migrate;
use crate::models::{DocumentId, DocumentSummary, SpaceId, Upload};
use crate::object_store::{AwsCredentials, ObjectStore, S3ObjectStore};
use crate::relay::AnswerRelay;
use crate::remote::{DifyClient, RemoteIndex};
use crate::spaces::SpaceStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub spaces: SpaceStore,
    pub documents: Arc<DocumentService>,
    pub relay: AnswerRelay,
}

impl AppState {
    /// Wire the stores and clients around an open pool.
    pub fn new(
        pool: SqlitePool,
        objects: Arc<dyn ObjectStore>,
        remote: Arc<dyn RemoteIndex>,
        config: &Config,
    ) -> Self {
        let spaces = SpaceStore::new(pool.clone());
        let mappings = MappingStore::new(pool);
        let documents = DocumentService::new(
            spaces.clone(),
            mappings.clone(),
            objects.clone(),
            remote.clone(),
            config.extract.limits(),
        );
        let relay = AnswerRelay::new(
            remote,
            objects,
            mappings,
            config.relay.clone(),
            config.object_store.presign_ttl(),
        );
        Self {
            spaces,
            documents: Arc::new(documents),
            relay,
        }
    }

    /// Build the production clients (one shared HTTP client, one pool).
    pub async fn from_config(config: &Config) -> anyhow::Result<(Self, SqlitePool)> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("knowledge-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let creds = AwsCredentials::from_env()?;
        let objects = Arc::new(S3ObjectStore::new(
            http.clone(),
            config.object_store.clone(),
            creds,
        ));

        let (dataset_key, app_key) = config.remote.api_keys()?;
        let remote = Arc::new(DifyClient::new(http, &config.remote, dataset_key, app_key));

        Ok((Self::new(pool.clone(), objects, remote, config), pool))
    }
}

/// All routes with CORS and the upload size limit applied.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/spaces", post(handle_create_space))
        .route("/v1/spaces/{space_id}/docs", post(handle_create_document))
        .route(
            "/v1/spaces/{space_id}/docs/{doc_id}",
            put(handle_update_document).delete(handle_delete_document),
        )
        .route("/v1/spaces/{space_id}/docs/search", get(handle_search))
        .route("/v1/spaces/{space_id}/qa/stream", post(handle_qa_stream))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .with_state(state)
}

/// Starts the gateway and serves until Ctrl-C, then closes the pool.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let (state, pool) = AppState::from_config(config).await?;
    let app = router(state, config.server.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close().await;
    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if self.is_internal() {
            tracing::error!(error = %self, "request failed unexpectedly");
            let body = ErrorBody {
                error: "internal server error".to_string(),
                code: self.code(),
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }

        tracing::warn!(code = self.code(), error = %self, "request rejected");
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

// ============ POST /v1/spaces ============

#[derive(Deserialize)]
struct CreateSpaceRequest {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSpaceResponse {
    space_id: SpaceId,
}

async fn handle_create_space(
    State(state): State<AppState>,
    Json(req): Json<CreateSpaceRequest>,
) -> Result<Json<CreateSpaceResponse>, GatewayError> {
    let space = state.spaces.create(&req.name, &req.description).await?;
    Ok(Json(CreateSpaceResponse {
        space_id: space.space_id,
    }))
}

// ============ Multipart ============

#[derive(Default)]
struct DocumentForm {
    title: Option<String>,
    file: Option<Upload>,
}

async fn read_document_form(mut multipart: Multipart) -> Result<DocumentForm, GatewayError> {
    let bad = |e: axum::extract::multipart::MultipartError| {
        GatewayError::validation(format!("invalid multipart body: {}", e.body_text()))
    };

    let mut form = DocumentForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("title") => form.title = Some(field.text().await.map_err(bad)?),
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(bad)?;
                form.file = Some(Upload {
                    file_name,
                    content_type,
                    bytes,
                });
            }
            _ => {}
        }
    }
    Ok(form)
}

// ============ POST /v1/spaces/{spaceId}/docs ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDocumentResponse {
    doc_id: DocumentId,
    space_id: SpaceId,
}

async fn handle_create_document(
    State(state): State<AppState>,
    Path(space_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<CreateDocumentResponse>, GatewayError> {
    let form = read_document_form(multipart).await?;
    let title = form
        .title
        .ok_or_else(|| GatewayError::validation("title is required"))?;
    let file = form
        .file
        .ok_or_else(|| GatewayError::validation("file is required"))?;

    let created = state
        .documents
        .create_document(&SpaceId::new(space_id), &title, file)
        .await?;
    Ok(Json(CreateDocumentResponse {
        doc_id: created.doc_id,
        space_id: created.space_id,
    }))
}

// ============ PUT /v1/spaces/{spaceId}/docs/{docId} ============

async fn handle_update_document(
    State(state): State<AppState>,
    Path((space_id, doc_id)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<SuccessResponse>, GatewayError> {
    let form = read_document_form(multipart).await?;
    state
        .documents
        .update_document(
            &SpaceId::new(space_id),
            &DocumentId::new(doc_id),
            form.title.as_deref(),
            form.file,
        )
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============ DELETE /v1/spaces/{spaceId}/docs/{docId} ============

async fn handle_delete_document(
    State(state): State<AppState>,
    Path((space_id, doc_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, GatewayError> {
    state
        .documents
        .delete_document(&SpaceId::new(space_id), &DocumentId::new(doc_id))
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============ GET /v1/spaces/{spaceId}/docs/search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    items: Vec<DocumentSummary>,
}

async fn handle_search(
    State(state): State<AppState>,
    Path(space_id): Path<String>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, GatewayError> {
    let items = state
        .documents
        .search_documents(&SpaceId::new(space_id), params.q.as_deref())
        .await?;
    Ok(Json(SearchResponse { items }))
}

// ============ POST /v1/spaces/{spaceId}/qa/stream ============

#[derive(Deserialize)]
struct QaRequest {
    query: String,
    /// End-user identifier forwarded to the remote platform.
    #[serde(default, alias = "userId")]
    user_id: Option<serde_json::Value>,
}

async fn handle_qa_stream(
    State(state): State<AppState>,
    Path(space_id): Path<String>,
    Json(req): Json<QaRequest>,
) -> Result<Response, GatewayError> {
    let query = req.query.trim();
    if query.is_empty() {
        return Err(GatewayError::validation("query must not be empty"));
    }
    let user = req.user_id.and_then(|v| match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    tracing::info!(space_id = %space_id, query, "question received");
    let rx = state
        .relay
        .spawn(SpaceId::new(space_id), query.to_string(), user);

    let events = ReceiverStream::new(rx).map(|item| {
        item.and_then(|event| {
            Event::default()
                .json_data(&event)
                .map_err(|e| GatewayError::unknown(e.to_string()))
        })
    });
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    timestamp: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
