// Card Analyzer - Web Server
// REST API over the analysis pipeline, the record store and the query gateway

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use card_analyzer::{
    init_tracing, write_query_csv, write_records_csv, AnalysisError, CardAnalyzer, CardStore,
    Config, LocalBlobStore, QueryError, SidecarExtractor,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    analyzer: Arc<CardAnalyzer>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn fail(error: impl ToString, data: Option<T>) -> Self {
        Self {
            success: false,
            data,
            error: Some(error.to_string()),
        }
    }
}

fn respond<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    error!("request failed: {}", e);
    respond::<()>(
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiResponse::fail("internal error", None),
    )
}

fn csv_download(body: Vec<u8>, filename: &str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

/// Run store work off the async executor
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, Response>
where
    F: FnOnce(&CardAnalyzer) -> T + Send + 'static,
    T: Send + 'static,
{
    let analyzer = Arc::clone(&state.analyzer);
    tokio::task::spawn_blocking(move || f(&analyzer))
        .await
        .map_err(internal)
}

#[derive(Deserialize)]
struct QueryRequest {
    sql: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/cards - All stored cards
async fn list_cards(State(state): State<AppState>) -> Response {
    match blocking(&state, |a| a.store().get_all()).await {
        Ok(Ok(records)) => respond(StatusCode::OK, ApiResponse::ok(records)),
        Ok(Err(e)) => internal(e),
        Err(resp) => resp,
    }
}

/// GET /api/cards.csv - All stored cards as CSV
async fn export_cards(State(state): State<AppState>) -> Response {
    let result = blocking(&state, |a| -> anyhow::Result<Vec<u8>> {
        let records = a.store().get_all()?;
        let mut out = Vec::new();
        write_records_csv(&records, &mut out)?;
        Ok(out)
    })
    .await;

    match result {
        Ok(Ok(body)) => csv_download(body, "all_cards_data.csv"),
        Ok(Err(e)) => internal(e),
        Err(resp) => resp,
    }
}

/// GET /api/cards/:key - Look up one card by number
async fn get_card(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    // Decode URL-encoded card number
    let decoded = urlencoding::decode(&key)
        .unwrap_or_else(|_| key.clone().into())
        .into_owned();
    let number = card_analyzer::normalizer::normalize_card_number(&decoded);

    match blocking(&state, move |a| a.store().get_by_card_number(&number)).await {
        Ok(Ok(Some(record))) => respond(StatusCode::OK, ApiResponse::ok(record)),
        Ok(Ok(None)) => respond::<()>(
            StatusCode::NOT_FOUND,
            ApiResponse::fail("card not found", None),
        ),
        Ok(Err(e)) => internal(e),
        Err(resp) => resp,
    }
}

/// POST /api/cards/:key - Analyze an uploaded image (raw body, key = filename)
async fn analyze_card(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let filename = urlencoding::decode(&key)
        .unwrap_or_else(|_| key.clone().into())
        .into_owned();

    let result = blocking(&state, move |a| a.analyze(&body, &filename)).await;

    match result {
        Ok(Ok(analysis)) => respond(StatusCode::OK, ApiResponse::ok(analysis)),
        Ok(Err(AnalysisError::Invalid { fields, verdict })) => respond(
            StatusCode::UNPROCESSABLE_ENTITY,
            ApiResponse::fail(
                "invalid card",
                Some(serde_json::json!({ "fields": fields, "verdict": verdict })),
            ),
        ),
        Ok(Err(e @ AnalysisError::Upload)) => {
            respond::<()>(StatusCode::BAD_GATEWAY, ApiResponse::fail(e, None))
        }
        Ok(Err(e @ AnalysisError::Extraction)) => {
            respond::<()>(StatusCode::UNPROCESSABLE_ENTITY, ApiResponse::fail(e, None))
        }
        Ok(Err(e)) => internal(e),
        Err(resp) => resp,
    }
}

fn query_error(e: QueryError) -> Response {
    let status = match e {
        QueryError::Validation(_) => StatusCode::BAD_REQUEST,
        QueryError::Execution(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    respond::<()>(status, ApiResponse::fail(e, None))
}

/// POST /api/query - Run a read-only SQL query
async fn run_query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Response {
    match blocking(&state, move |a| a.query_gateway().run(&req.sql)).await {
        Ok(Ok(result)) => respond(StatusCode::OK, ApiResponse::ok(result)),
        Ok(Err(e)) => query_error(e),
        Err(resp) => resp,
    }
}

/// POST /api/query.csv - Same as /api/query, as a CSV download
async fn export_query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Response {
    let result = blocking(&state, move |a| a.query_gateway().run(&req.sql)).await;

    match result {
        Ok(Ok(result)) => {
            let mut out = Vec::new();
            match write_query_csv(&result, &mut out) {
                Ok(()) => csv_download(out, "query_results.csv"),
                Err(e) => internal(e),
            }
        }
        Ok(Err(e)) => query_error(e),
        Err(resp) => resp,
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::var("CARD_ANALYZER_CONFIG")
        .unwrap_or_else(|_| card_analyzer::config::DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path)?;

    let store = Arc::new(
        CardStore::open(&config.db_path)
            .with_context(|| format!("Failed to open database {}", config.db_path))?,
    );

    let mut extractor = SidecarExtractor::new();
    if let Some(dir) = &config.fields_dir {
        extractor = extractor.with_fields_dir(dir);
    }

    let analyzer = CardAnalyzer::new(
        Box::new(LocalBlobStore::new(&config.blob_dir)),
        Box::new(extractor),
        store,
    )
    .with_name_policy(config.name_policy);

    // Create shared state
    let state = AppState {
        analyzer: Arc::new(analyzer),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/cards", get(list_cards))
        .route("/cards.csv", get(export_cards))
        .route("/cards/:key", get(get_card).post(analyze_card))
        .route("/query", post(run_query))
        .route("/query.csv", post(export_query))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server_addr))?;

    info!(addr = %config.server_addr, "card server listening");

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
