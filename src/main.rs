mod external;
mod idempotency;
mod images;
mod jobs;
mod lifecycle;
mod metrics;
mod models;
mod moderation;
mod promotion;
mod search;
mod security;
mod store;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use external::{CheckoutGateway, MemoryBlobStore, RecordingModerationChannel, TraceNotifier};
use images::ImagePipeline;
use jobs::{JobContext, JobQueue};
use lifecycle::{decode_uploads, ImportReport, Lifecycle, LifecycleError, ListingOutcome};
use models::{
    ApiError, CatalogFilters, CatalogPage, CatalogQuery, Listing, ListingUpdate,
    ModerationDecision, NewListing, PromotionChoice, SortKey,
};
use moderation::ModerationQueue;
use promotion::PromotionLedger;
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};
use store::Store;
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "bazaar.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:bazaar.db".to_string());
    let store = Store::connect(&database_url).await?;
    store.ensure_schema().await?;

    let blob = Arc::new(MemoryBlobStore::new());
    let images = ImagePipeline::from_env(blob.clone());
    let moderation = ModerationQueue::new(Arc::new(RecordingModerationChannel::new()), blob);
    let ledger = PromotionLedger::new(
        store.clone(),
        Arc::new(CheckoutGateway),
        paid_listings_enabled_from_env(),
    );
    let (queue, _worker) = JobQueue::spawn(JobContext {
        store: store.clone(),
        images: images.clone(),
        moderation,
    });
    let lifecycle = Lifecycle::new(
        store,
        images,
        ledger,
        Arc::new(TraceNotifier),
        queue.clone(),
    );

    let auth_state = security::AuthState::from_env();
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        lifecycle,
        queue,
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/catalog", get(catalog))
        .route("/listings", post(create_listing))
        .route("/listings/import", post(import_listings))
        .route("/listings/{id}", get(get_listing))
        .route("/listings/{id}", put(edit_listing))
        .route("/listings/{id}", delete(delete_listing))
        .route("/listings/{id}/sold", post(mark_sold))
        .route("/listings/{id}/deactivate", post(deactivate))
        .route("/listings/{id}/reactivate", post(reactivate))
        .route("/listings/{id}/promote", post(promote))
        .route("/listings/{id}/favorite", post(favorite))
        .route("/listings/{id}/favorite", delete(unfavorite))
        .route("/sellers/{external_id}/listings", get(seller_profile))
        .route("/moderation/decision", post(moderation_decision))
        .route("/payments/confirm", post(confirm_payment))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(
            auth_state,
            security::require_api_auth,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "bazaar.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    lifecycle: Lifecycle,
    queue: JobQueue,
    idempotency: Arc<Mutex<HashMap<String, ListingOutcome>>>,
    redis: Option<redis::Client>,
}

fn paid_listings_enabled_from_env() -> bool {
    std::env::var("PAID_LISTINGS_ENABLED")
        .map(|value| !matches!(value.trim(), "0" | "false" | "off"))
        .unwrap_or(true)
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        // Images travel base64-encoded in the JSON body.
        .unwrap_or(48 * 1024 * 1024)
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "bazaar-api-rs",
    }))
}

#[derive(Debug, Deserialize)]
struct CatalogParams {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    subcategory: Option<String>,
    #[serde(default)]
    free_only: Option<bool>,
    /// Comma-separated city list.
    #[serde(default)]
    cities: Option<String>,
    #[serde(default)]
    sort: Option<SortKey>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

impl CatalogParams {
    fn into_query(self) -> CatalogQuery {
        let cities = self
            .cities
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|city| !city.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        CatalogQuery {
            filters: CatalogFilters {
                category: self.category.filter(|c| !c.is_empty()),
                subcategory: self.subcategory.filter(|c| !c.is_empty()),
                free_only: self.free_only.unwrap_or(false),
                cities,
                text: self.q.filter(|q| !q.trim().is_empty()),
            },
            sort: self.sort.unwrap_or_default(),
            offset: self.offset.unwrap_or(0).max(0),
            limit: self.limit.unwrap_or(0),
        }
    }
}

/// Ranked catalog search.
///
/// - Method: `GET`
/// - Path: `/catalog`
/// - Query: `q`, `category`, `subcategory`, `free_only`, `cities`, `sort`,
///   `offset`, `limit`
async fn catalog(
    State(state): State<AppState>,
    Query(params): Query<CatalogParams>,
) -> Result<Json<CatalogPage>, AppError> {
    metrics::inc_requests("/catalog");
    let page = state.lifecycle.catalog(&params.into_query()).await?;
    Ok(Json(page))
}

/// Create a listing and route it into moderation.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Headers: optional `Idempotency-Key` replays the cached outcome
/// - Body: `NewListing` with base64 image payloads
async fn create_listing(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<NewListing>,
) -> Result<Json<ListingOutcome>, AppError> {
    metrics::inc_requests("/listings");
    let start = std::time::Instant::now();
    let files = decode_uploads(&payload.images)?;

    let lifecycle = state.lifecycle.clone();
    let outcome = with_idempotency(&state, &headers, async move {
        lifecycle.create_listing(payload, files).await
    })
    .await?;

    metrics::stage_elapsed("create_listing", start.elapsed().as_millis());
    Ok(Json(outcome))
}

/// Replays the cached outcome when the request carries an `Idempotency-Key`.
/// The wrapped operation only runs on a cache miss.
async fn with_idempotency<F>(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    op: F,
) -> Result<ListingOutcome, AppError>
where
    F: Future<Output = Result<ListingOutcome, LifecycleError>>,
{
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let Some(key) = key else {
        return Ok(op.await?);
    };
    if let Some(client) = &state.redis {
        if let Some(existing) = idempotency::redis_get(client, &key).await {
            return Ok(existing);
        }
        let outcome = op.await?;
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);
        idempotency::redis_set(client, &key, &outcome, ttl).await;
        Ok(outcome)
    } else {
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(existing);
        }
        let outcome = op.await?;
        state.idempotency.lock().await.insert(key, outcome.clone());
        Ok(outcome)
    }
}

/// Bulk import. Batch-internal first-image duplicates and already-owned
/// titles are skipped rather than failed.
///
/// - Method: `POST`
/// - Path: `/listings/import`
/// - Body: array of `NewListing`
async fn import_listings(
    State(state): State<AppState>,
    Json(payload): Json<Vec<NewListing>>,
) -> Result<Json<ImportReport>, AppError> {
    metrics::inc_requests("/listings/import");
    let mut items = Vec::with_capacity(payload.len());
    for request in payload {
        let files = decode_uploads(&request.images)?;
        items.push((request, files));
    }
    let report = state.lifecycle.import_batch(items).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ViewerParams {
    #[serde(default)]
    viewer: Option<i64>,
}

/// Single listing read; counts a view unless the viewer owns it.
async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ViewerParams>,
) -> Result<Json<Listing>, AppError> {
    metrics::inc_requests("/listings/{id}");
    let listing = state.lifecycle.get_listing(id, params.viewer).await?;
    Ok(Json(listing))
}

/// Edit a listing; live listings return to moderation.
///
/// - Method: `PUT`
/// - Path: `/listings/{id}`
/// - Body: `ListingUpdate`
async fn edit_listing(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<ListingUpdate>,
) -> Result<Json<ListingOutcome>, AppError> {
    metrics::inc_requests("/listings/{id}");
    let files = decode_uploads(&payload.new_images)?;
    let outcome = state.lifecycle.edit_listing(id, payload, files).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct SellerAction {
    seller_external_id: i64,
}

async fn delete_listing(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<SellerAction>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/listings/{id}");
    state
        .lifecycle
        .delete_listing(id, payload.seller_external_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_sold(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<SellerAction>,
) -> Result<Json<Listing>, AppError> {
    metrics::inc_requests("/listings/{id}/sold");
    let listing = state
        .lifecycle
        .mark_sold(id, payload.seller_external_id)
        .await?;
    Ok(Json(listing))
}

async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<SellerAction>,
) -> Result<Json<Listing>, AppError> {
    metrics::inc_requests("/listings/{id}/deactivate");
    let listing = state
        .lifecycle
        .deactivate(id, payload.seller_external_id)
        .await?;
    Ok(Json(listing))
}

#[derive(Debug, Deserialize)]
struct ReactivateRequest {
    seller_external_id: i64,
    #[serde(default)]
    promotion: Option<PromotionChoice>,
}

/// Bring a sold, deactivated, rejected, or expired listing back through the
/// activation gate and into moderation.
async fn reactivate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<ReactivateRequest>,
) -> Result<Json<ListingOutcome>, AppError> {
    metrics::inc_requests("/listings/{id}/reactivate");
    let lifecycle = state.lifecycle.clone();
    let outcome = with_idempotency(&state, &headers, async move {
        lifecycle
            .reactivate(id, payload.seller_external_id, payload.promotion)
            .await
    })
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct PromoteRequest {
    seller_external_id: i64,
    #[serde(flatten)]
    choice: PromotionChoice,
}

async fn promote(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<PromoteRequest>,
) -> Result<Json<ListingOutcome>, AppError> {
    metrics::inc_requests("/listings/{id}/promote");
    let outcome = state
        .lifecycle
        .promote(id, payload.seller_external_id, payload.choice)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct FavoriteRequest {
    viewer_external_id: i64,
}

async fn favorite(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<FavoriteRequest>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/listings/{id}/favorite");
    state
        .lifecycle
        .favorite(id, payload.viewer_external_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unfavorite(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<FavoriteRequest>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/listings/{id}/favorite");
    state
        .lifecycle
        .unfavorite(id, payload.viewer_external_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// A seller's listings grouped live-first. Owners (`viewer` matching the
/// path) also see rejected and deactivated listings.
async fn seller_profile(
    State(state): State<AppState>,
    Path(external_id): Path<i64>,
    Query(params): Query<ViewerParams>,
) -> Result<Json<Vec<Listing>>, AppError> {
    metrics::inc_requests("/sellers/{external_id}/listings");
    let listings = state.lifecycle.profile(external_id, params.viewer).await?;
    Ok(Json(listings))
}

/// Moderator verdict webhook.
///
/// - Method: `POST`
/// - Path: `/moderation/decision`
/// - Body: `ModerationDecision`
async fn moderation_decision(
    State(state): State<AppState>,
    Json(payload): Json<ModerationDecision>,
) -> Result<Json<Listing>, AppError> {
    metrics::inc_requests("/moderation/decision");
    let listing = state.lifecycle.apply_decision(payload).await?;
    Ok(Json(listing))
}

#[derive(Debug, Deserialize)]
struct PaymentConfirmation {
    reference: String,
}

/// Payment-gateway confirmation callback. Replays are acknowledged without
/// effect.
async fn confirm_payment(
    State(state): State<AppState>,
    Json(payload): Json<PaymentConfirmation>,
) -> Result<Json<serde_json::Value>, AppError> {
    metrics::inc_requests("/payments/confirm");
    match state.lifecycle.confirm_payment(&payload.reference).await? {
        Some(listing) => Ok(Json(json!({ "status": "applied", "listing": listing }))),
        None => Ok(Json(json!({ "status": "ignored" }))),
    }
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    metrics::inc_requests("/jobs/{id}");
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError(LifecycleError::Validation(
            "invalid job id".into(),
        )));
    };
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError(LifecycleError::NotFound)),
    }
}

#[derive(Debug)]
struct AppError(LifecycleError);

impl From<LifecycleError> for AppError {
    fn from(value: LifecycleError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
            LifecycleError::NeedsPackage | LifecycleError::InsufficientBalance => {
                StatusCode::PAYMENT_REQUIRED
            }
            LifecycleError::IllegalTransition { .. } => StatusCode::CONFLICT,
            LifecycleError::NotFound => StatusCode::NOT_FOUND,
            LifecycleError::Forbidden => StatusCode::FORBIDDEN,
            LifecycleError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LifecycleError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let payload = ApiError {
            error: self.0.code().to_string(),
            detail: Some(self.0.to_string()),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
