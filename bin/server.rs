// Registry Regularizer - Web Server
// JSON API over RegularizationEngine with Axum

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use registry_regularizer::{
    Assignment, Coupling, Dimension, EngineConfig, ExpansionOptions, MappingKey, QueryOptions,
    RegistrationFilter, RegularizationEngine, RegularizationError, RegularizationMapping,
    YearPartition,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<RegularizationEngine>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Engine failure mapped onto an HTTP status
struct ApiError(StatusCode, String);

impl From<RegularizationError> for ApiError {
    fn from(e: RegularizationError) -> Self {
        let status = match &e {
            RegularizationError::ConflictingMapping { .. }
            | RegularizationError::ConflictingPairTarget { .. } => StatusCode::CONFLICT,
            e if e.is_rejection() => StatusCode::UNPROCESSABLE_ENTITY,
            RegularizationError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", e);
        }
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ApiResponse::<()>::failed(self.1))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

/// Run a blocking engine call off the async executor
async fn blocking<T, F>(state: AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&RegularizationEngine) -> registry_regularizer::Result<T> + Send + 'static,
{
    let data = tokio::task::spawn_blocking(move || f(&state.engine))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("worker failed: {}", e)))??;
    Ok(Json(ApiResponse::ok(data)))
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct HierarchyParams {
    #[serde(default)]
    refresh: bool,
}

#[derive(Deserialize)]
struct PairParams {
    #[serde(default)]
    include_exact: bool,
}

#[derive(Deserialize)]
struct SuggestParams {
    #[serde(default = "default_suggestion_limit")]
    limit: usize,
}

fn default_suggestion_limit() -> usize {
    5
}

#[derive(Deserialize)]
struct TripletRequest {
    uncurated: (i64, i64),
    canonical: (i64, i64),
    /// model_year_id → fuel assignment
    fuel_types: BTreeMap<i64, Assignment>,
}

#[derive(Deserialize)]
struct ExpandRequest {
    dimension: Dimension,
    ids: BTreeSet<i64>,
    #[serde(default)]
    options: Option<ExpansionOptions>,
}

#[derive(Deserialize)]
struct SelectionRequest {
    #[serde(default)]
    makes: BTreeSet<i64>,
    #[serde(default)]
    models: BTreeSet<i64>,
    #[serde(default)]
    options: Option<ExpansionOptions>,
}

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    filter: RegistrationFilter,
    #[serde(default)]
    options: Option<QueryOptions>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ImportRequest {
    path: std::path::PathBuf,
}

#[derive(Serialize)]
struct CountResponse {
    count: i64,
    coupling: Coupling,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/hierarchy?refresh=true
async fn get_hierarchy(State(state): State<AppState>, Query(params): Query<HierarchyParams>) -> impl IntoResponse {
    blocking(state, move |engine| {
        engine
            .build_canonical_hierarchy(params.refresh)
            .map(|hierarchy| (*hierarchy).clone())
    })
    .await
}

/// GET /api/uncurated-pairs?include_exact=true
async fn get_uncurated_pairs(State(state): State<AppState>, Query(params): Query<PairParams>) -> impl IntoResponse {
    blocking(state, move |engine| engine.find_uncurated_pairs(params.include_exact)).await
}

/// GET /api/mappings
async fn get_mappings(State(state): State<AppState>) -> impl IntoResponse {
    blocking(state, |engine| engine.mappings()).await
}

/// POST /api/mappings - Save one wildcard or triplet mapping
async fn save_mapping(State(state): State<AppState>, Json(mapping): Json<RegularizationMapping>) -> impl IntoResponse {
    blocking(state, move |engine| {
        engine.save_mapping(&mapping)?;
        engine.pair_completeness(mapping.uncurated_make_id, mapping.uncurated_model_id)
    })
    .await
}

/// POST /api/mappings/triplets - Save per-model-year fuel assignments
async fn save_triplets(State(state): State<AppState>, Json(request): Json<TripletRequest>) -> impl IntoResponse {
    blocking(state, move |engine| {
        engine.save_year_triplets(request.uncurated, request.canonical, &request.fuel_types)
    })
    .await
}

/// POST /api/mappings/delete - Delete one mapping by key
async fn delete_mapping(State(state): State<AppState>, Json(key): Json<MappingKey>) -> impl IntoResponse {
    blocking(state, move |engine| engine.delete_mapping(&key)).await
}

/// GET /api/pairs/:make/:model/mappings
async fn get_pair_mappings(State(state): State<AppState>, Path((make, model)): Path<(i64, i64)>) -> impl IntoResponse {
    blocking(state, move |engine| engine.mappings_for_pair(make, model)).await
}

/// POST /api/pairs/:make/:model/delete - Delete every mapping of a pair
async fn delete_pair(State(state): State<AppState>, Path((make, model)): Path<(i64, i64)>) -> impl IntoResponse {
    blocking(state, move |engine| engine.delete_pair_mappings(make, model)).await
}

/// GET /api/pairs/:make/:model/completeness
async fn get_completeness(State(state): State<AppState>, Path((make, model)): Path<(i64, i64)>) -> impl IntoResponse {
    blocking(state, move |engine| engine.pair_completeness(make, model)).await
}

/// GET /api/pairs/:make/:model/suggestions?limit=5
async fn get_suggestions(
    State(state): State<AppState>,
    Path((make, model)): Path<(i64, i64)>,
    Query(params): Query<SuggestParams>,
) -> impl IntoResponse {
    blocking(state, move |engine| engine.suggest_canonical_pairs(make, model, params.limit)).await
}

/// GET /api/canonical/:make/:model/proposal - Fuel types per model year from curated data
async fn get_proposal(State(state): State<AppState>, Path((make, model)): Path<(i64, i64)>) -> impl IntoResponse {
    blocking(state, move |engine| engine.propose_year_triplets((make, model))).await
}

/// POST /api/auto-regularize
async fn auto_regularize(State(state): State<AppState>) -> impl IntoResponse {
    blocking(state, |engine| engine.auto_regularize()).await
}

/// POST /api/expand - Expand IDs of one dimension
async fn expand_ids(State(state): State<AppState>, Json(request): Json<ExpandRequest>) -> impl IntoResponse {
    blocking(state, move |engine| {
        let options = request.options.unwrap_or_else(|| engine.expansion_options());
        engine.expand_ids(request.dimension, &request.ids, options)
    })
    .await
}

/// POST /api/expand/selection - Expand a Make/Model selection
async fn expand_selection(State(state): State<AppState>, Json(request): Json<SelectionRequest>) -> impl IntoResponse {
    blocking(state, move |engine| {
        let options = request.options.unwrap_or_else(|| engine.expansion_options());
        engine.expand_selection(&request.makes, &request.models, options)
    })
    .await
}

/// POST /api/registrations/count
async fn count_registrations(State(state): State<AppState>, Json(request): Json<QueryRequest>) -> impl IntoResponse {
    blocking(state, move |engine| {
        let options = request.options.unwrap_or_else(|| engine.query_options());
        Ok(CountResponse {
            count: engine.count_registrations(&request.filter, &options)?,
            coupling: options.coupling,
        })
    })
    .await
}

/// POST /api/registrations/by-year
async fn count_by_year(State(state): State<AppState>, Json(request): Json<QueryRequest>) -> impl IntoResponse {
    blocking(state, move |engine| {
        let options = request.options.unwrap_or_else(|| engine.query_options());
        engine.count_registrations_by_year(&request.filter, &options)
    })
    .await
}

/// POST /api/registrations - Matching rows (bounded by `limit`)
async fn matching_registrations(State(state): State<AppState>, Json(request): Json<QueryRequest>) -> impl IntoResponse {
    blocking(state, move |engine| {
        let options = request.options.unwrap_or_else(|| engine.query_options());
        engine.matching_registrations(&request.filter, &options, request.limit.or(Some(1000)))
    })
    .await
}

/// GET /api/enums/:dimension
async fn get_enum(State(state): State<AppState>, Path(dimension): Path<String>) -> impl IntoResponse {
    blocking(state, move |engine| {
        let dimension = Dimension::parse(&dimension)
            .ok_or_else(|| RegularizationError::InvalidInput(format!("unknown dimension '{}'", dimension)))?;
        engine.enum_entries(dimension)
    })
    .await
}

/// GET /api/partition
async fn get_partition(State(state): State<AppState>) -> impl IntoResponse {
    blocking(state, |engine| Ok(engine.year_partition())).await
}

/// POST /api/partition - Replace the curated/uncurated split
async fn set_partition(State(state): State<AppState>, Json(partition): Json<YearPartition>) -> impl IntoResponse {
    blocking(state, move |engine| {
        engine.set_year_partition(partition)?;
        Ok(engine.year_partition())
    })
    .await
}

/// GET /api/cache
async fn get_cache_status(State(state): State<AppState>) -> impl IntoResponse {
    blocking(state, |engine| Ok(engine.cache_status())).await
}

/// POST /api/cache/invalidate
async fn invalidate_caches(State(state): State<AppState>) -> impl IntoResponse {
    blocking(state, |engine| {
        engine.invalidate_caches()?;
        Ok(engine.cache_status())
    })
    .await
}

/// GET /api/stats
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    blocking(state, |engine| engine.mapping_statistics()).await
}

/// POST /api/import - Load a CSV file readable by the server
async fn import_csv(State(state): State<AppState>, Json(request): Json<ImportRequest>) -> impl IntoResponse {
    blocking(state, move |engine| engine.import_csv(&request.path)).await
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    println!("🌐 Registry Regularizer - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = match std::env::var("REGULARIZER_CONFIG") {
        Ok(path) => match EngineConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("❌ {}", e);
                std::process::exit(1);
            }
        },
        Err(_) => EngineConfig::default(),
    };
    let addr = std::env::var("REGULARIZER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let engine = match RegularizationEngine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("❌ Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };
    println!("✓ Database opened: {:?}", engine.database().path());

    // Create shared state
    let state = AppState {
        engine: Arc::new(engine),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/hierarchy", get(get_hierarchy))
        .route("/uncurated-pairs", get(get_uncurated_pairs))
        .route("/mappings", get(get_mappings).post(save_mapping))
        .route("/mappings/triplets", post(save_triplets))
        .route("/mappings/delete", post(delete_mapping))
        .route("/pairs/:make/:model/mappings", get(get_pair_mappings))
        .route("/pairs/:make/:model/delete", post(delete_pair))
        .route("/pairs/:make/:model/completeness", get(get_completeness))
        .route("/pairs/:make/:model/suggestions", get(get_suggestions))
        .route("/canonical/:make/:model/proposal", get(get_proposal))
        .route("/auto-regularize", post(auto_regularize))
        .route("/expand", post(expand_ids))
        .route("/expand/selection", post(expand_selection))
        .route("/registrations", post(matching_registrations))
        .route("/registrations/count", post(count_registrations))
        .route("/registrations/by-year", post(count_by_year))
        .route("/enums/:dimension", get(get_enum))
        .route("/partition", get(get_partition).post(set_partition))
        .route("/cache", get(get_cache_status))
        .route("/cache/invalidate", post(invalidate_caches))
        .route("/stats", get(get_stats))
        .route("/import", post(import_csv))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("❌ Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Listening on {}", addr);
    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/hierarchy", addr);
    println!("\n   Press Ctrl+C to stop\n");

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("❌ Server error: {}", e);
        std::process::exit(1);
    }
}
