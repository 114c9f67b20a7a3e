//! # API REST
//!
//! REST API for the Leaf cohort aggregator.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - Mapping `CohortError` onto HTTP status codes
//!
//! The binary that serves this router lives in the workspace root package.

#![warn(rust_2018_idioms)]

pub mod dto;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use leaf_core::{CohortAggregator, CohortError, ResourceKind, ResponderId};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use dto::{
    AggregateSummaryRes, CohortRes, DispatchRes, ErrorRes, FailAggregateReq, GateRes, GatesRes,
    HealthRes, ListRespondersRes, QuerySessionRes, RecordResponseReq, RecordResponseRes,
    ResponderCohortRes, ResponderRes, StartQueryReq,
};

/// Application state shared across REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<CohortAggregator>,
}

type ApiError = (StatusCode, Json<ErrorRes>);

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        list_responders,
        toggle_responder,
        start_query,
        end_query,
        start_resource,
        fail_aggregate,
        record_response,
        cohort,
    ),
    components(schemas(
        HealthRes,
        ErrorRes,
        ResponderRes,
        ListRespondersRes,
        StartQueryReq,
        QuerySessionRes,
        DispatchRes,
        RecordResponseReq,
        RecordResponseRes,
        FailAggregateReq,
        AggregateSummaryRes,
        GateRes,
        GatesRes,
        ResponderCohortRes,
        CohortRes,
    ))
)]
pub struct ApiDoc;

/// Build the REST router, including Swagger UI and a permissive CORS layer.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/responders", get(list_responders))
        .route("/responders/:id/toggle", post(toggle_responder))
        .route("/queries", post(start_query))
        .route("/queries/:session", delete(end_query))
        .route("/queries/:session/resources/:kind", post(start_resource))
        .route("/queries/:session/resources/:kind/fail", post(fail_aggregate))
        .route(
            "/queries/:session/responders/:id/resources/:kind",
            post(record_response),
        )
        .route("/cohort", get(cohort))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a core error to a status code and JSON body.
///
/// Unknown responders are 404. Requests that conflict with the current session or toggle rules
/// are 409. Malformed payloads are 400. Anything else is a server fault.
fn api_error(err: CohortError) -> ApiError {
    let status = match &err {
        CohortError::UnknownResponder(_) => StatusCode::NOT_FOUND,
        CohortError::ToggleRejected(_)
        | CohortError::StaleSession(_)
        | CohortError::NoActiveSession
        | CohortError::NoEnabledResponders
        | CohortError::CountNotLoaded(_)
        | CohortError::ResponderDisabled(_) => StatusCode::CONFLICT,
        CohortError::PayloadMismatch(_) | CohortError::InvalidTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        CohortError::InvalidConfig(_)
        | CohortError::ConfigRead(_)
        | CohortError::ConfigParse { .. }
        | CohortError::DuplicateResponder(_) => {
            tracing::error!("Cohort aggregator error: {:?}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(ErrorRes {
            error: err.to_string(),
        }),
    )
}

fn parse_kind(kind: &str) -> Result<ResourceKind, ApiError> {
    kind.parse()
        .map_err(|error| (StatusCode::BAD_REQUEST, Json(ErrorRes { error })))
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
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "Leaf REST API is alive".into(),
    })
}

#[utoipa::path(
    get,
    path = "/responders",
    responses(
        (status = 200, description = "Known responders ordered by id", body = ListRespondersRes)
    )
)]
#[axum::debug_handler]
async fn list_responders(State(state): State<AppState>) -> Json<ListRespondersRes> {
    Json(ListRespondersRes {
        responders: state
            .aggregator
            .responders()
            .into_iter()
            .map(Into::into)
            .collect(),
    })
}

#[utoipa::path(
    post,
    path = "/responders/{id}/toggle",
    params(("id" = u32, Path, description = "Responder id")),
    responses(
        (status = 200, description = "Responder toggled", body = ResponderRes),
        (status = 404, description = "Unknown responder", body = ErrorRes),
        (status = 409, description = "Toggle rejected", body = ErrorRes)
    )
)]
/// Enable or disable a responder
///
/// Rejected with `409 Conflict` when the responder is the last enabled one or has a request in
/// flight. The error message is suitable for showing to the user.
#[axum::debug_handler]
async fn toggle_responder(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u32>,
) -> Result<Json<ResponderRes>, ApiError> {
    state
        .aggregator
        .toggle_responder(ResponderId::new(id))
        .map(|identity| Json(identity.into()))
        .map_err(api_error)
}

#[utoipa::path(
    post,
    path = "/queries",
    request_body = StartQueryReq,
    responses(
        (status = 201, description = "Query session started", body = QuerySessionRes)
    )
)]
/// Start a query session
///
/// Replaces any current session and marks the count `REQUESTING` for every enabled responder.
#[axum::debug_handler]
async fn start_query(
    State(state): State<AppState>,
    Json(req): Json<StartQueryReq>,
) -> Result<(StatusCode, Json<QuerySessionRes>), ApiError> {
    let session = state.aggregator.start_query(&req.panels).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

#[utoipa::path(
    delete,
    path = "/queries/{session}",
    params(("session" = String, Path, description = "Query session id")),
    responses(
        (status = 204, description = "Session ended"),
        (status = 409, description = "Not the current session", body = ErrorRes)
    )
)]
#[axum::debug_handler]
async fn end_query(
    State(state): State<AppState>,
    AxumPath(session): AxumPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.aggregator.end_query(session).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/queries/{session}/resources/{kind}",
    params(
        ("session" = String, Path, description = "Query session id"),
        ("kind" = String, Path, description = "count, patient_list, visualization or note_search")
    ),
    responses(
        (status = 200, description = "Resource dispatched", body = DispatchRes),
        (status = 400, description = "Unknown resource kind", body = ErrorRes),
        (status = 409, description = "Not the current session", body = ErrorRes)
    )
)]
/// Dispatch a resource to every enabled responder
#[axum::debug_handler]
async fn start_resource(
    State(state): State<AppState>,
    AxumPath((session, kind)): AxumPath<(Uuid, String)>,
) -> Result<Json<DispatchRes>, ApiError> {
    let kind = parse_kind(&kind)?;
    let responders = state
        .aggregator
        .start_resource(session, kind)
        .map_err(api_error)?;
    Ok(Json(DispatchRes::new(kind, responders)))
}

#[utoipa::path(
    post,
    path = "/queries/{session}/resources/{kind}/fail",
    params(
        ("session" = String, Path, description = "Query session id"),
        ("kind" = String, Path, description = "Resource kind")
    ),
    request_body = FailAggregateReq,
    responses(
        (status = 200, description = "Aggregate marked failed", body = AggregateSummaryRes),
        (status = 409, description = "Not the current session", body = ErrorRes)
    )
)]
#[axum::debug_handler]
async fn fail_aggregate(
    State(state): State<AppState>,
    AxumPath((session, kind)): AxumPath<(Uuid, String)>,
    Json(req): Json<FailAggregateReq>,
) -> Result<Json<AggregateSummaryRes>, ApiError> {
    let kind = parse_kind(&kind)?;
    state
        .aggregator
        .fail_aggregate(session, kind, req.message)
        .map(|summary| Json(summary.into()))
        .map_err(api_error)
}

#[utoipa::path(
    post,
    path = "/queries/{session}/responders/{id}/resources/{kind}",
    params(
        ("session" = String, Path, description = "Query session id"),
        ("id" = u32, Path, description = "Responder id"),
        ("kind" = String, Path, description = "Resource kind")
    ),
    request_body = RecordResponseReq,
    responses(
        (status = 200, description = "Response applied or ignored", body = RecordResponseRes),
        (status = 400, description = "Payload does not match the resource kind", body = ErrorRes),
        (status = 404, description = "Unknown responder", body = ErrorRes)
    )
)]
/// Record one responder's answer
///
/// Late answers (stale session, disabled responder, resource no longer requesting) are
/// acknowledged with `applied: false` rather than rejected.
#[axum::debug_handler]
async fn record_response(
    State(state): State<AppState>,
    AxumPath((session, id, kind)): AxumPath<(Uuid, u32, String)>,
    Json(req): Json<RecordResponseReq>,
) -> Result<Json<RecordResponseRes>, ApiError> {
    let kind = parse_kind(&kind)?;
    state
        .aggregator
        .record_response(session, ResponderId::new(id), kind, req.outcome)
        .map(|recorded| Json(recorded.into()))
        .map_err(api_error)
}

#[utoipa::path(
    get,
    path = "/cohort",
    responses(
        (status = 200, description = "Current responder states, totals and view gates", body = CohortRes)
    )
)]
#[axum::debug_handler]
async fn cohort(State(state): State<AppState>) -> Json<CohortRes> {
    Json(state.aggregator.snapshot().into())
}
