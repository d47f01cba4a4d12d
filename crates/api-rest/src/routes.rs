//! HTTP routes and the OpenAPI document.

use axum::{
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use leaf_core::constants::{FEDERATED_COUNT_PATH, ISSUER_HEADER};
use leaf_core::executor::ExecutionErrorKind;
use leaf_core::hashing;
use leaf_core::model::QueryDefinition;
use leaf_core::shrine::wire::{ResultProgressDto, RunQueryForResultDto, ShrineQueryDto};
use leaf_core::shrine::{HubMessage, ShrineHubClient, ShrineQueryConverter, ShrineResultCache};
use leaf_core::wire::v1::{
    CountResponseDto, EndpointUpdateDto, FederatedCountDto, FederatedTotalDto,
    IdentityUpdateDto, NetworkEndpointDraftDto, NetworkEndpointDto, NetworkIdentityDto,
    PatientCountDto, PreflightCheckDto, PreflightDto, QueryDefinitionDto, SiteResultDto,
    SiteStatusDto,
};
use leaf_core::{
    CohortService, CoreConfig, LeafError, NetworkIdentity, NetworkRegistry, TokenBlacklistCache,
    UserContext,
};

use crate::auth::{authenticate, require_admin, Rejection};

/// SHRINE hub access, present when the node is joined to a SHRINE network.
#[derive(Clone)]
pub struct ShrineState {
    pub hub: Arc<ShrineHubClient>,
    pub results: Arc<ShrineResultCache>,
    pub node_id: i64,
}

/// Application state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoreConfig>,
    pub service: Arc<CohortService>,
    pub registry: Arc<NetworkRegistry>,
    pub blacklist: Arc<TokenBlacklistCache>,
    pub shrine: Option<ShrineState>,
    pub api_key: Option<Arc<str>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShrineSubmissionRes {
    pub query_id: i64,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        count,
        federated_count,
        list_endpoints,
        create_endpoint,
        update_endpoint,
        delete_endpoint,
        get_identity,
        update_identity,
        shrine_query,
        shrine_count,
        shrine_results,
    ),
    components(schemas(
        HealthRes,
        ShrineSubmissionRes,
        QueryDefinitionDto,
        CountResponseDto,
        PreflightDto,
        PreflightCheckDto,
        PatientCountDto,
        FederatedCountDto,
        FederatedTotalDto,
        SiteResultDto,
        SiteStatusDto,
        NetworkEndpointDraftDto,
        NetworkEndpointDto,
        EndpointUpdateDto,
        NetworkIdentityDto,
        IdentityUpdateDto,
    ))
)]
pub struct ApiDoc;

/// Build the REST router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(FEDERATED_COUNT_PATH, post(count))
        .route("/api/cohort/count/federated", post(federated_count))
        .route(
            "/api/admin/network/endpoints",
            get(list_endpoints).post(create_endpoint),
        )
        .route(
            "/api/admin/network/endpoints/:id",
            put(update_endpoint).delete(delete_endpoint),
        )
        .route(
            "/api/admin/network/identity",
            get(get_identity).put(update_identity),
        )
        .route("/api/integration/shrine/query", post(shrine_query))
        .route("/api/integration/shrine/count", post(shrine_count))
        .route(
            "/api/integration/shrine/cohort/:query_id/count",
            get(shrine_results),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a core error onto a status and a client-safe message. Detail stays in the log.
fn reject(error: LeafError) -> Rejection {
    match &error {
        LeafError::InvalidInput(_)
        | LeafError::Validation(_)
        | LeafError::Dialect(_)
        | LeafError::Text(_)
        | LeafError::Certificate(_)
        | LeafError::Deserialization(_) => {
            tracing::warn!("rejected request: {}", error);
            (StatusCode::BAD_REQUEST, "Invalid request")
        }
        LeafError::NotFederatable(_) => {
            tracing::warn!("rejected request: {}", error);
            (StatusCode::BAD_REQUEST, "Query cannot be federated")
        }
        LeafError::Shrine(_) => {
            tracing::warn!("rejected request: {}", error);
            (StatusCode::BAD_REQUEST, "Query cannot be expressed in SHRINE")
        }
        LeafError::Execution(e) => match e.kind() {
            ExecutionErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Query timed out"),
            ExecutionErrorKind::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "Query cancelled"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Query execution failed"),
        },
        _ => {
            tracing::error!("request failed: {}", error);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

/// Stable SHRINE researcher id for a user.
fn researcher_id(user: &UserContext) -> i64 {
    let digest = hashing::digest([user.issuer(), user.name()]);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes) & i64::MAX
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
#[axum::debug_handler]
async fn health(State(state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: format!("Leaf node {} is alive", state.registry.identity().name),
    })
}

#[utoipa::path(
    post,
    path = "/api/cohort/count",
    request_body = QueryDefinitionDto,
    responses(
        (status = 200, description = "Local count, or a failed preflight", body = CountResponseDto),
        (status = 400, description = "Invalid query"),
        (status = 401, description = "Missing or revoked credentials"),
        (status = 504, description = "Query timed out")
    )
)]
/// Compile and count a query against this node's data
///
/// Answers both local users and peer nodes. The response carries this node's issuer so
/// peers can check who answered.
///
/// # Errors
/// Returns `400 Bad Request` for malformed or uncompilable queries and `504 Gateway
/// Timeout` when execution exceeds the configured limit.
#[axum::debug_handler]
async fn count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryDefinitionDto>,
) -> Result<impl IntoResponse, Rejection> {
    let user = authenticate(&state, &headers)?;
    let definition = QueryDefinition::try_from(req).map_err(reject)?;
    let response = state
        .service
        .compile_and_count(&user, definition)
        .await
        .map_err(reject)?;
    Ok((
        [(ISSUER_HEADER, state.config.issuer().to_owned())],
        Json(CountResponseDto::from(&response)),
    ))
}

#[utoipa::path(
    post,
    path = "/api/cohort/count/federated",
    request_body = QueryDefinitionDto,
    responses(
        (status = 200, description = "Local, per-site and merged counts", body = FederatedCountDto),
        (status = 400, description = "Invalid or non-federatable query"),
        (status = 403, description = "Peers cannot fan out")
    )
)]
/// Count locally and at every responder peer
#[axum::debug_handler]
async fn federated_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryDefinitionDto>,
) -> Result<Json<FederatedCountDto>, Rejection> {
    let user = authenticate(&state, &headers)?;
    if user.is_federated() {
        return Err((StatusCode::FORBIDDEN, "Peers cannot fan out"));
    }
    let definition = QueryDefinition::try_from(req).map_err(reject)?;
    let federated = state
        .service
        .federated_count(&user, definition)
        .await
        .map_err(reject)?;
    Ok(Json(FederatedCountDto::from(&federated)))
}

#[utoipa::path(
    get,
    path = "/api/admin/network/endpoints",
    responses(
        (status = 200, description = "Registered peers", body = [NetworkEndpointDto]),
        (status = 401, description = "Invalid API key")
    )
)]
#[axum::debug_handler]
async fn list_endpoints(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<NetworkEndpointDto>>, Rejection> {
    require_admin(&state, &headers)?;
    let endpoints = state.registry.endpoints().await.map_err(reject)?;
    Ok(Json(endpoints.iter().map(NetworkEndpointDto::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/admin/network/endpoints",
    request_body = NetworkEndpointDraftDto,
    responses(
        (status = 201, description = "Endpoint created", body = NetworkEndpointDto),
        (status = 400, description = "Invalid address or certificate"),
        (status = 401, description = "Invalid API key")
    )
)]
/// Register a peer
///
/// # Errors
/// Returns `400 Bad Request` if the address, names or certificate fail validation; nothing
/// is stored in that case.
#[axum::debug_handler]
async fn create_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NetworkEndpointDraftDto>,
) -> Result<(StatusCode, Json<NetworkEndpointDto>), Rejection> {
    require_admin(&state, &headers)?;
    let created = state
        .registry
        .create(&req.into())
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(NetworkEndpointDto::from(&created))))
}

#[utoipa::path(
    put,
    path = "/api/admin/network/endpoints/{id}",
    params(("id" = Uuid, Path, description = "Endpoint id")),
    request_body = NetworkEndpointDraftDto,
    responses(
        (status = 200, description = "Previous and new endpoint", body = EndpointUpdateDto),
        (status = 400, description = "Invalid address or certificate"),
        (status = 404, description = "No such endpoint")
    )
)]
#[axum::debug_handler]
async fn update_endpoint(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    headers: HeaderMap,
    Json(req): Json<NetworkEndpointDraftDto>,
) -> Result<Json<EndpointUpdateDto>, Rejection> {
    require_admin(&state, &headers)?;
    match state.registry.update(id, &req.into()).await.map_err(reject)? {
        Some(updated) => Ok(Json(EndpointUpdateDto::from(&updated))),
        None => Err((StatusCode::NOT_FOUND, "Endpoint not found")),
    }
}

#[utoipa::path(
    delete,
    path = "/api/admin/network/endpoints/{id}",
    params(("id" = Uuid, Path, description = "Endpoint id")),
    responses(
        (status = 200, description = "Deleted endpoint", body = NetworkEndpointDto),
        (status = 204, description = "No such endpoint; nothing to delete")
    )
)]
/// Remove a peer. Deleting an unknown id succeeds with no content.
#[axum::debug_handler]
async fn delete_endpoint(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    headers: HeaderMap,
) -> Result<Response, Rejection> {
    require_admin(&state, &headers)?;
    Ok(match state.registry.delete(id).await.map_err(reject)? {
        Some(deleted) => Json(NetworkEndpointDto::from(&deleted)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[utoipa::path(
    get,
    path = "/api/admin/network/identity",
    responses(
        (status = 200, description = "This node's identity", body = NetworkIdentityDto)
    )
)]
#[axum::debug_handler]
async fn get_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<NetworkIdentityDto>, Rejection> {
    require_admin(&state, &headers)?;
    Ok(Json(NetworkIdentityDto::from(
        state.registry.identity().as_ref(),
    )))
}

#[utoipa::path(
    put,
    path = "/api/admin/network/identity",
    request_body = NetworkIdentityDto,
    responses(
        (status = 200, description = "Previous and new identity", body = IdentityUpdateDto),
        (status = 400, description = "Blank name")
    )
)]
#[axum::debug_handler]
async fn update_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NetworkIdentityDto>,
) -> Result<Json<IdentityUpdateDto>, Rejection> {
    require_admin(&state, &headers)?;
    let identity = NetworkIdentity::try_from(req).map_err(reject)?;
    let updated = state
        .registry
        .update_identity(identity)
        .await
        .map_err(reject)?;
    Ok(Json(IdentityUpdateDto::from(&updated)))
}

/// Resolve a local query and wrap it as a SHRINE query from this node.
async fn to_shrine(
    state: &AppState,
    user: &UserContext,
    req: QueryDefinitionDto,
) -> Result<ShrineQueryDto, Rejection> {
    let definition = QueryDefinition::try_from(req).map_err(reject)?;
    let portable = match state
        .service
        .portable(user, definition)
        .await
        .map_err(reject)?
    {
        Ok(portable) => portable,
        Err(_) => return Err((StatusCode::BAD_REQUEST, "Preflight failed")),
    };
    let node_id = state.shrine.as_ref().map_or(0, |s| s.node_id);
    ShrineQueryConverter::new(node_id, researcher_id(user))
        .to_shrine_query(&portable, Utc::now())
        .map_err(|e| reject(e.into()))
}

#[utoipa::path(
    post,
    path = "/api/integration/shrine/query",
    request_body = QueryDefinitionDto,
    responses(
        (status = 200, description = "The query as SHRINE JSON"),
        (status = 400, description = "Preflight failed or not expressible in SHRINE")
    )
)]
/// Convert a query to SHRINE JSON without sending it anywhere
#[axum::debug_handler]
async fn shrine_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryDefinitionDto>,
) -> Result<Json<ShrineQueryDto>, Rejection> {
    let user = authenticate(&state, &headers)?;
    Ok(Json(to_shrine(&state, &user, req).await?))
}

#[utoipa::path(
    post,
    path = "/api/integration/shrine/count",
    request_body = QueryDefinitionDto,
    responses(
        (status = 202, description = "Sent to the SHRINE hub", body = ShrineSubmissionRes),
        (status = 400, description = "Preflight failed or not expressible in SHRINE"),
        (status = 404, description = "SHRINE integration is disabled"),
        (status = 502, description = "SHRINE hub unavailable")
    )
)]
/// Send a query to the SHRINE network
///
/// Results arrive asynchronously through the hub and are read back with
/// `GET /api/integration/shrine/cohort/{query_id}/count`.
#[axum::debug_handler]
async fn shrine_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryDefinitionDto>,
) -> Result<(StatusCode, Json<ShrineSubmissionRes>), Rejection> {
    let Some(shrine) = state.shrine.clone() else {
        return Err((StatusCode::NOT_FOUND, "SHRINE integration is disabled"));
    };
    let user = authenticate(&state, &headers)?;
    if user.is_federated() {
        return Err((StatusCode::FORBIDDEN, "Peers cannot submit SHRINE queries"));
    }

    let query = to_shrine(&state, &user, req).await?;
    let query_id = query.id;
    shrine.results.submitted(query_id, user.name());
    let message = HubMessage::RunQueryForResult(RunQueryForResultDto {
        query,
        node_id: Some(shrine.node_id),
        topic_name: None,
    });
    if let Err(e) = shrine.hub.send(&message).await {
        tracing::error!(query_id, "failed to send SHRINE query: {}", e);
        shrine.results.remove(query_id);
        return Err((StatusCode::BAD_GATEWAY, "SHRINE hub unavailable"));
    }
    tracing::info!(query_id, user = user.name(), "sent SHRINE query");
    Ok((StatusCode::ACCEPTED, Json(ShrineSubmissionRes { query_id })))
}

#[utoipa::path(
    get,
    path = "/api/integration/shrine/cohort/{query_id}/count",
    params(("query_id" = i64, Path, description = "SHRINE query id")),
    responses(
        (status = 200, description = "Result progress per SHRINE node"),
        (status = 404, description = "Unknown query, or submitted by someone else")
    )
)]
#[axum::debug_handler]
async fn shrine_results(
    State(state): State<AppState>,
    AxumPath(query_id): AxumPath<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<ResultProgressDto>>, Rejection> {
    let Some(shrine) = state.shrine.as_ref() else {
        return Err((StatusCode::NOT_FOUND, "SHRINE integration is disabled"));
    };
    let user = authenticate(&state, &headers)?;
    shrine
        .results
        .results_for(query_id, user.name())
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "Query not found"))
}
