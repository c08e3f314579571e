#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use medshare_adapter::{
    bearer_from_authorization, AccessConsentAdapterRequest, AdapterError, AdapterRuntime,
    ConsentHistoryQuery, ConsentTokenAdapterRequest, IntegrityVerifyAdapterRequest,
    IssueConsentAdapterRequest, RecordUpsertAdapterRequest,
};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONSENT_TOKEN_HEADER: &str = "x-consent-token";

type SharedRuntime = Arc<AdapterRuntime>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let bind = env::var("MEDSHARE_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;
    let runtime: SharedRuntime = Arc::new(AdapterRuntime::from_env()?);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/consent/issue", post(issue_consent))
        .route("/v1/consent/validate", post(validate_consent))
        .route("/v1/consent/access", post(access_consent))
        .route("/v1/consent/revoke", post(revoke_consent))
        .route("/v1/consent/history", get(consent_history))
        .route("/v1/consent/:token/events", get(consent_events))
        .route("/v1/records", post(upsert_record))
        .route("/v1/records/:record_id/verify", post(verify_record))
        .route("/v1/integrity/verify", post(verify_integrity))
        .route("/v1/shared/insights", post(shared_insights))
        .with_state(runtime.clone());

    info!(%addr, "medshare_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    runtime.flush_ledger_audit().await;
    info!("medshare_adapter_http stopped");
    Ok(())
}

fn init_tracing() {
    let filter = env::var("MEDSHARE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

fn respond<T: Serialize>(result: Result<T, AdapterError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                error!(error = %err, "request failed");
            }
            (status, Json(err.to_response())).into_response()
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AdapterError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| AdapterError::Invalid(rejection.body_text()))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    bearer_from_authorization(headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()))
}

fn consent_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CONSENT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Response {
    (StatusCode::OK, Json(runtime.health_report().await)).into_response()
}

async fn issue_consent(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    payload: Result<Json<IssueConsentAdapterRequest>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(err) => return respond::<()>(Err(err)),
    };
    respond(runtime.issue_consent(None, bearer(&headers), request).await)
}

async fn validate_consent(
    State(runtime): State<SharedRuntime>,
    payload: Result<Json<ConsentTokenAdapterRequest>, JsonRejection>,
) -> Response {
    respond(body(payload).and_then(|r| runtime.validate_consent(None, r)))
}

async fn access_consent(
    State(runtime): State<SharedRuntime>,
    payload: Result<Json<AccessConsentAdapterRequest>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(err) => return respond::<()>(Err(err)),
    };
    respond(runtime.access_consent(None, request).await)
}

async fn revoke_consent(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    payload: Result<Json<ConsentTokenAdapterRequest>, JsonRejection>,
) -> Response {
    respond(body(payload).and_then(|r| runtime.revoke_consent(None, bearer(&headers), r)))
}

async fn consent_history(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    query: Result<Query<ConsentHistoryQuery>, QueryRejection>,
) -> Response {
    let query = match query {
        Ok(Query(q)) => q,
        Err(rejection) => return respond::<()>(Err(AdapterError::Invalid(rejection.body_text()))),
    };
    respond(runtime.consent_history(None, bearer(&headers), query))
}

async fn consent_events(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    respond(runtime.consent_events(None, bearer(&headers), &token))
}

async fn upsert_record(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    payload: Result<Json<RecordUpsertAdapterRequest>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(err) => return respond::<()>(Err(err)),
    };
    respond(runtime.upsert_record(None, bearer(&headers), request).await)
}

async fn verify_record(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
) -> Response {
    respond(runtime.verify_record(None, bearer(&headers), &record_id).await)
}

async fn verify_integrity(
    State(runtime): State<SharedRuntime>,
    payload: Result<Json<IntegrityVerifyAdapterRequest>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(err) => return respond::<()>(Err(err)),
    };
    respond(runtime.verify_integrity(request).await)
}

async fn shared_insights(State(runtime): State<SharedRuntime>, headers: HeaderMap) -> Response {
    respond(
        runtime
            .shared_insights(None, bearer(&headers), consent_header(&headers))
            .await,
    )
}
