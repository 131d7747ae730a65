use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use rank_kernel_api::{
    CreatePostResult, ListPostsRequest, MigrateResult, PostScoreResult, PostVotesResult,
    RankingApi, VoteRequest, VoteStatusResult, API_CONTRACT_VERSION,
};
use rank_kernel_core::RankError;
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: RankingApi,
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
    kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatePostRequest {
    group_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct VoteStatusQuery {
    user_id: u64,
    post_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct VoteStatusBatchRequest {
    user_id: u64,
    post_ids: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct VoteCountsBatchRequest {
    post_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "rank-kernel-service")]
#[command(about = "Local HTTP service for the rank kernel")]
struct Args {
    #[arg(long, default_value = "./rank_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Node id embedded in allocated post ids; must differ per instance.
    #[arg(long, default_value_t = 1)]
    machine_id: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "post_not_found" => StatusCode::NOT_FOUND,
        "vote_window_expired" => StatusCode::UNPROCESSABLE_ENTITY,
        "vote_repeated" => StatusCode::CONFLICT,
        "validation" => StatusCode::BAD_REQUEST,
        "store_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn service_error(err: &anyhow::Error) -> ServiceError {
    let kind = err.downcast_ref::<RankError>().map_or("internal", RankError::kind);
    ServiceError {
        status: status_for(kind),
        service_contract_version: SERVICE_CONTRACT_VERSION,
        kind,
        error: err.to_string(),
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/post", post(create_post))
        .route("/v1/posts", get(list_posts))
        .route("/v1/post/:post_id/votes", get(post_votes))
        .route("/v1/post/:post_id/score", get(post_score))
        .route("/v1/vote", post(cast_vote))
        .route("/v1/vote/status", get(vote_status).post(vote_status_batch))
        .route("/v1/votes/counts", post(vote_counts_batch))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { api: RankingApi::new(args.db, args.machine_id)? };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "rank kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<rank_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn create_post(
    State(state): State<ServiceState>,
    Json(request): Json<CreatePostRequest>,
) -> Result<Json<ServiceEnvelope<CreatePostResult>>, ServiceError> {
    let created = state.api.create_post(request.group_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(created)))
}

async fn cast_vote(
    State(state): State<ServiceState>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<ServiceEnvelope<VoteRequest>>, ServiceError> {
    state.api.cast_vote(&request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(request)))
}

async fn list_posts(
    State(state): State<ServiceState>,
    Query(request): Query<ListPostsRequest>,
) -> Result<Json<ServiceEnvelope<Vec<u64>>>, ServiceError> {
    let ids = state.api.list_posts(&request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(ids)))
}

async fn post_votes(
    State(state): State<ServiceState>,
    Path(post_id): Path<u64>,
) -> Result<Json<ServiceEnvelope<PostVotesResult>>, ServiceError> {
    let votes = state.api.post_votes(post_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(votes)))
}

async fn post_score(
    State(state): State<ServiceState>,
    Path(post_id): Path<u64>,
) -> Result<Json<ServiceEnvelope<PostScoreResult>>, ServiceError> {
    let score = state.api.post_score(post_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(score)))
}

async fn vote_status(
    State(state): State<ServiceState>,
    Query(query): Query<VoteStatusQuery>,
) -> Result<Json<ServiceEnvelope<VoteStatusResult>>, ServiceError> {
    let status =
        state.api.vote_status(query.user_id, query.post_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn vote_status_batch(
    State(state): State<ServiceState>,
    Json(request): Json<VoteStatusBatchRequest>,
) -> Result<Json<ServiceEnvelope<Vec<VoteStatusResult>>>, ServiceError> {
    let statuses = state
        .api
        .vote_status_batch(request.user_id, &request.post_ids)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(statuses)))
}

async fn vote_counts_batch(
    State(state): State<ServiceState>,
    Json(request): Json<VoteCountsBatchRequest>,
) -> Result<Json<ServiceEnvelope<Vec<u64>>>, ServiceError> {
    let counts =
        state.api.post_votes_batch(&request.post_ids).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(counts)))
}
