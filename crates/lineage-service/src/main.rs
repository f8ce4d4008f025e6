use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use lineage_api::{CreateLineageRequest, EngineConfig, LineageApi, API_CONTRACT_VERSION};
use lineage_core::{Genome, Identity, Lineage, LineageError, LineageSummary};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const ACCOUNT_ID_HEADER: &str = "x-account-id";
const ACCOUNT_EMAIL_HEADER: &str = "x-account-email";

#[derive(Debug, Clone)]
struct ServiceState {
    api: LineageApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AdvanceQuery {
    n: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SelectRequest {
    genome: Genome,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct LineageAck {
    lineage_id: String,
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "lineage-service")]
#[command(about = "Local HTTP service for evolutionary lineages")]
struct Args {
    #[arg(long, env = "LINEAGE_DB", default_value = "./lineage.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "LINEAGE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "LINEAGE_MAX_CONFLICT_RETRIES", default_value_t = 3)]
    max_conflict_retries: u32,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<LineageError> for ServiceError {
    fn from(err: LineageError) -> Self {
        let status = match &err {
            LineageError::NotFound(_) => StatusCode::NOT_FOUND,
            LineageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LineageError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            LineageError::Conflict(_) => StatusCode::CONFLICT,
            LineageError::Corrupt(_) | LineageError::Storage(_) | LineageError::Evolution(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error_kind = err.kind(), error = %err, "request failed");
        }
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind: err.kind(),
            error: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        LineageError::InvalidInput(rejection.body_text()).into()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Caller identity as forwarded by the fronting identity provider.
fn identity_from_headers(headers: &HeaderMap) -> Identity {
    let header = |name: &str| {
        headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
    };
    Identity {
        external_id: header(ACCOUNT_ID_HEADER),
        email: header(ACCOUNT_EMAIL_HEADER).unwrap_or_default(),
    }
}

async fn run_blocking<T, F>(operation: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, LineageError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(operation).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(err) => Err(LineageError::Storage(format!("lineage task failed: {err}")).into()),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/lineages", get(lineage_list).post(lineage_create))
        .route("/v1/lineages/:lineage_id", get(lineage_show).delete(lineage_delete))
        .route("/v1/lineages/:lineage_id/evolve", get(lineage_advance).post(lineage_select))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config =
        EngineConfig { max_conflict_retries: args.max_conflict_retries, ..EngineConfig::default() };
    let state = ServiceState { api: LineageApi::new(args.db.clone()).with_config(config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "lineage service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn lineage_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<LineageSummary>>>, ServiceError> {
    let identity = identity_from_headers(&headers);
    let summaries = run_blocking(move || state.api.list_lineages(&identity)).await?;
    Ok(Json(envelope(summaries)))
}

async fn lineage_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CreateLineageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Lineage>>), ServiceError> {
    let Json(request) = payload?;
    let identity = identity_from_headers(&headers);
    let lineage = run_blocking(move || state.api.create_lineage(&identity, request)).await?;
    Ok((StatusCode::CREATED, Json(envelope(lineage))))
}

async fn lineage_show(
    State(state): State<ServiceState>,
    Path(lineage_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Lineage>>, ServiceError> {
    let identity = identity_from_headers(&headers);
    let lineage = run_blocking(move || state.api.get_lineage(&identity, &lineage_id)).await?;
    Ok(Json(envelope(lineage)))
}

async fn lineage_delete(
    State(state): State<ServiceState>,
    Path(lineage_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<LineageAck>>, ServiceError> {
    let identity = identity_from_headers(&headers);
    let lineage_id = run_blocking(move || {
        state.api.delete_lineage(&identity, &lineage_id).map(|()| lineage_id)
    })
    .await?;
    Ok(Json(envelope(LineageAck { lineage_id, status: "deleted" })))
}

async fn lineage_advance(
    State(state): State<ServiceState>,
    Path(lineage_id): Path<String>,
    Query(query): Query<AdvanceQuery>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Genome>>>, ServiceError> {
    let identity = identity_from_headers(&headers);
    let candidates = run_blocking(move || {
        state.api.advance_generation(&identity, &lineage_id, query.n.as_deref())
    })
    .await?;
    Ok(Json(envelope(candidates)))
}

async fn lineage_select(
    State(state): State<ServiceState>,
    Path(lineage_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<SelectRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<LineageAck>>, ServiceError> {
    let Json(request) = payload?;
    let identity = identity_from_headers(&headers);
    let lineage_id = run_blocking(move || {
        state.api.select_survivor(&identity, &lineage_id, request.genome).map(|()| lineage_id)
    })
    .await?;
    Ok(Json(envelope(LineageAck { lineage_id, status: "selected" })))
}
