use std::hash::{Hash, Hasher};
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use chrono::{NaiveDate, Utc};
use clinic_core::models::{Document, NewQueueEntry, QueueEntry, QueueEntryUpdate, QueueStatus};
use clinic_core::sync::{PullBatch, PushRequest, PushResponse};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::store::ServerStore;

const DEFAULT_PULL_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: ServerStore,
    jwt_verifier: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, store: ServerStore) -> Self {
        Self {
            jwt_verifier: Arc::new(JwtVerifier::new(&config)),
            store,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/v1/replication/push", post(push))
        .route("/v1/replication/changes", get(changes))
        .route(
            "/v1/replication/documents/{collection}/{id}",
            get(fetch_document),
        )
        .route("/queue", get(list_queue).post(create_queue_entry))
        .route("/queue/{id}", put(update_queue_entry))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn push(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    if request.items.len() > state.config.max_batch {
        return Err(AppError::bad_request(format!(
            "push batch exceeds {} items",
            state.config.max_batch
        )));
    }

    let item_count = request.items.len();
    let results = state.store.push(request.items).await?;
    tracing::info!(
        endpoint = "replication_push",
        user = user_fingerprint(&user.user_id),
        items = item_count,
        "Applied push batch"
    );
    Ok(Json(PushResponse { results }))
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    collection: String,
    since: Option<String>,
    limit: Option<usize>,
}

async fn changes(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<PullBatch>, AppError> {
    let since = query
        .since
        .as_deref()
        .map(str::parse::<i64>)
        .transpose()
        .map_err(|_| AppError::bad_request("`since` must be a checkpoint returned by this server"))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PULL_LIMIT)
        .clamp(1, state.config.max_batch.max(DEFAULT_PULL_LIMIT));

    let batch = state.store.changes(&query.collection, since, limit).await?;
    Ok(Json(batch))
}

async fn fetch_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Document>, AppError> {
    state
        .store
        .get(&collection, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{collection}/{id}")))
}

#[derive(Debug, Deserialize)]
struct QueueQuery {
    status: Option<QueueStatus>,
    queue_date: Option<NaiveDate>,
}

async fn list_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Vec<QueueEntry>>, AppError> {
    let entries = state.store.list_queue(query.status, query.queue_date).await?;
    Ok(Json(entries))
}

async fn create_queue_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(entry): Json<NewQueueEntry>,
) -> Result<(StatusCode, Json<QueueEntry>), AppError> {
    if entry.patient_id.trim().is_empty() {
        return Err(AppError::bad_request("patientId must not be empty"));
    }
    let entry = state.store.create_queue_entry(entry).await?;
    tracing::info!(
        endpoint = "queue_create",
        user = user_fingerprint(&user.user_id),
        token = entry.token_number,
        "Created queue entry"
    );
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn update_queue_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<QueueEntryUpdate>,
) -> Result<Json<QueueEntry>, AppError> {
    let entry = state.store.update_queue_entry(&id, update).await?;
    Ok(Json(entry))
}

fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}
