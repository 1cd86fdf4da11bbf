//! Axum JSON API for vacsync: listing CRUD, the on-demand sync trigger and health.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use vacsync_core::{AppConfig, Listing, ListingFilter, ListingPayload};
use vacsync_storage::{ListingStore, PersistenceError};
use vacsync_sync::{SyncError, SyncScheduler};

pub const CRATE_NAME: &str = "vacsync-web";

const CORS_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ListingStore>,
    pub scheduler: Arc<SyncScheduler>,
}

impl AppState {
    pub fn new(store: Arc<dyn ListingStore>, scheduler: Arc<SyncScheduler>) -> Self {
        Self { store, scheduler }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(i64),
    Conflict(i64),
    Upstream(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::NotFound(id) => format!("vacancy {id} not found"),
            Self::Conflict(external_id) => {
                format!("a vacancy with external_id {external_id} already exists")
            }
            Self::Upstream(msg) | Self::Unavailable(msg) | Self::Internal(msg) => msg.clone(),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound(id) => Self::NotFound(id),
            PersistenceError::DuplicateExternalId(external_id) => Self::Conflict(external_id),
            PersistenceError::Closed => Self::Unavailable(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Source(_) => Self::Upstream(err.to_string()),
            SyncError::Persistence(_) => Self::Internal(err.to_string()),
            SyncError::Stopped => Self::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ParseResponse {
    created: usize,
}

pub fn app(state: AppState, config: &AppConfig) -> Router {
    let api = Router::new()
        .route("/vacancies", get(list_handler).post(create_handler))
        .route(
            "/vacancies/{id}",
            get(detail_handler).put(update_handler).delete(delete_handler),
        )
        .route("/parse/", post(parse_handler))
        .route("/healthz", get(health_handler));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

/// `*` allows any origin without credentials; an explicit list allows credentials.
pub fn cors_layer(config: &AppConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .max_age(CORS_MAX_AGE);

    if config.allows_any_origin() {
        return base.allow_origin(Any).allow_headers(Any);
    }

    let origins = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring unusable CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();

    base.allow_origin(AllowOrigin::list(origins))
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Binds `0.0.0.0:APP_PORT` and serves until `shutdown` resolves.
pub async fn serve<F>(state: AppState, config: &AppConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", config.app_port))
        .await
        .with_context(|| format!("binding port {}", config.app_port))?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state, config))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn list_handler(
    State(state): State<AppState>,
    Query(filter): Query<ListingFilter>,
) -> Result<Json<Vec<Listing>>, ApiError> {
    Ok(Json(state.store.list(&filter).await?))
}

async fn detail_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Listing>, ApiError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

async fn create_handler(
    State(state): State<AppState>,
    Json(payload): Json<ListingPayload>,
) -> Result<(StatusCode, Json<Listing>), ApiError> {
    let listing = state.store.create(&payload).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

/// A body without `external_id` keeps the stored one; the natural key is never cleared here.
async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut payload): Json<ListingPayload>,
) -> Result<Json<Listing>, ApiError> {
    if payload.external_id.is_none() {
        let current = state.store.get(id).await?.ok_or(ApiError::NotFound(id))?;
        payload.external_id = current.external_id;
    }
    Ok(Json(state.store.update(id, &payload).await?))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn parse_handler(State(state): State<AppState>) -> Result<Json<ParseResponse>, ApiError> {
    let summary = state.scheduler.trigger().await?;
    Ok(Json(ParseResponse {
        created: summary.created,
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let scheduler = state.scheduler.state().await;
    Json(json!({ "status": "ok", "scheduler": scheduler.to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vacsync_source::StaticSourceClient;
    use vacsync_storage::MemoryListingStore;
    use vacsync_sync::SyncPipeline;

    fn config(origins: &[&str]) -> AppConfig {
        AppConfig {
            database_url: "postgres://vacsync@localhost/vacsync".into(),
            app_port: 8000,
            log_level: "info".into(),
            debug: false,
            cors_origins: origins.iter().map(|o| o.to_string()).collect(),
            parse_schedule_minutes: 5,
            external_vacancies_api_url: "http://127.0.0.1:9/vacancies".into(),
            http_timeout_secs: 20,
            http_user_agent: "vacsync-test".into(),
        }
    }

    fn fixture(batch: Vec<ListingPayload>) -> (Router, MemoryListingStore, Arc<SyncScheduler>) {
        let store = MemoryListingStore::new();
        let pipeline = SyncPipeline::new(
            Arc::new(StaticSourceClient::new(batch)),
            Arc::new(store.clone()),
        );
        let scheduler = Arc::new(SyncScheduler::new(pipeline, Duration::from_secs(300)));
        let state = AppState::new(Arc::new(store.clone()), Arc::clone(&scheduler));
        (app(state, &config(&["*"])), store, scheduler)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn parse_endpoint_reports_created_count() {
        let (app, store, _) = fixture(vec![
            ListingPayload::keyed(1, "A"),
            ListingPayload::keyed(2, "B"),
        ]);

        let first = app.clone().oneshot(request("POST", "/api/v1/parse/", None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(json_body(first).await, json!({ "created": 2 }));

        let second = app.oneshot(request("POST", "/api/v1/parse/", None)).await.unwrap();
        assert_eq!(json_body(second).await, json!({ "created": 0 }));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn parse_after_shutdown_is_unavailable() {
        let (app, _, scheduler) = fixture(vec![]);
        scheduler.stop().await;

        let resp = app.oneshot(request("POST", "/api/v1/parse/", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(json_body(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn parse_maps_source_failure_to_bad_gateway() {
        let store = MemoryListingStore::new();
        let pipeline = SyncPipeline::new(
            Arc::new(StaticSourceClient::failing("upstream down")),
            Arc::new(store.clone()),
        );
        let scheduler = Arc::new(SyncScheduler::new(pipeline, Duration::from_secs(300)));
        let app = app(AppState::new(Arc::new(store), scheduler), &config(&["*"]));

        let resp = app.oneshot(request("POST", "/api/v1/parse/", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn vacancy_crud_round() {
        let (app, _, _) = fixture(vec![]);

        let created = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/vacancies",
                Some(json!({ "external_id": 77, "title": "Rust Engineer", "city_name": "Moscow" })),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = json_body(created).await;
        let id = created["id"].as_i64().unwrap();
        assert_eq!(created["external_id"], 77);

        let dup = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/vacancies",
                Some(json!({ "external_id": 77, "title": "Again" })),
            ))
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let updated = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/api/v1/vacancies/{id}"),
                Some(json!({ "external_id": 77, "title": "Senior Rust Engineer", "is_hot": true })),
            ))
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);
        assert_eq!(json_body(updated).await["title"], "Senior Rust Engineer");

        let deleted = app
            .clone()
            .oneshot(request("DELETE", &format!("/api/v1/vacancies/{id}"), None))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = app
            .oneshot(request("GET", &format!("/api/v1/vacancies/{id}"), None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_without_key_keeps_the_stored_key() {
        let (app, store, _) = fixture(vec![ListingPayload::keyed(5, "Synced")]);
        let existing = store.create(&ListingPayload::keyed(5, "Manual")).await.unwrap();

        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/api/v1/vacancies/{}", existing.id),
                Some(json!({ "title": "Edited" })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["external_id"], 5);
        assert_eq!(body["title"], "Edited");

        let parsed = app.oneshot(request("POST", "/api/v1/parse/", None)).await.unwrap();
        assert_eq!(json_body(parsed).await, json!({ "created": 0 }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn update_of_missing_vacancy_is_not_found() {
        let (app, _, _) = fixture(vec![]);
        let resp = app
            .oneshot(request("PUT", "/api/v1/vacancies/999", Some(json!({ "title": "Ghost" }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_filters_by_city_substring() {
        let (app, store, _) = fixture(vec![]);
        let mut moscow = ListingPayload::keyed(1, "A");
        moscow.fields.city_name = Some("Moscow".into());
        let mut spb = ListingPayload::keyed(2, "B");
        spb.fields.city_name = Some("Saint Petersburg".into());
        store.create(&moscow).await.unwrap();
        store.create(&spb).await.unwrap();

        let resp = app
            .oneshot(request("GET", "/api/v1/vacancies?city_name=PETERS", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let rows = json_body(resp).await;
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["external_id"], 2);
    }

    #[tokio::test]
    async fn health_reports_scheduler_state() {
        let (app, _, _) = fixture(vec![]);
        let resp = app.oneshot(request("GET", "/api/v1/healthz", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            json_body(resp).await,
            json!({ "status": "ok", "scheduler": "stopped" })
        );
    }

    #[tokio::test]
    async fn cors_preflight_echoes_listed_origin_with_credentials() {
        let store = MemoryListingStore::new();
        let pipeline = SyncPipeline::new(
            Arc::new(StaticSourceClient::new(vec![])),
            Arc::new(store.clone()),
        );
        let scheduler = Arc::new(SyncScheduler::new(pipeline, Duration::from_secs(300)));
        let app = app(
            AppState::new(Arc::new(store), scheduler),
            &config(&["https://jobs.example"]),
        );

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/vacancies")
            .header(header::ORIGIN, "https://jobs.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(preflight).await.unwrap();

        let headers = resp.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN].to_str().unwrap(),
            "https://jobs.example"
        );
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS].to_str().unwrap(),
            "true"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE].to_str().unwrap(), "600");
    }

    #[tokio::test]
    async fn wildcard_cors_allows_any_origin() {
        let (app, _, _) = fixture(vec![]);
        let req = Request::builder()
            .uri("/api/v1/vacancies")
            .header(header::ORIGIN, "https://anywhere.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .is_none());
    }
}
