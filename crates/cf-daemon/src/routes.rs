//! Axum router and all HTTP handlers for cf-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so integration tests in
//! `tests/` can compose the bare router directly.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::WebSocketUpgrade,
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cf_schemas::{ApplicationUpdateEvent, Country};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api_types::{
    ApplicationResponse, AuditLogEntryResponse, BreakerSnapshotEntry, BreakerSnapshotResponse,
    CreateApplicationRequest, CreateApplicationResponse, ErrorResponse, HealthResponse,
};
use crate::state::AppState;

/// The bank-confirmation endpoint is single-provider; attribution in the
/// audit trail reads `changed_by = "webhook:bank"`.
const WEBHOOK_PROVIDER: &str = "bank";

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/applications", post(create_application))
        .route("/applications/:id", get(get_application))
        .route("/applications/:id/audit", get(get_application_audit))
        .route("/webhooks/bank-confirmation", post(bank_confirmation_webhook))
        .route("/ws", get(ws_upgrade))
        .route("/admin/circuit-breakers", get(admin_breaker_snapshot))
        .route(
            "/admin/circuit-breakers/:country/:provider/reset",
            post(admin_breaker_reset),
        )
        .with_state(state)
}

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /applications
// ---------------------------------------------------------------------------

async fn create_application(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateApplicationRequest>,
) -> Response {
    if body.currency != body.country.canonical_currency() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!(
                    "currency {} does not match {}'s canonical currency {}",
                    body.currency,
                    body.country.code(),
                    body.country.canonical_currency()
                ),
            }),
        )
            .into_response();
    }

    let new = cf_db::NewApplication {
        country: body.country,
        full_name: body.full_name,
        identity_document: body.identity_document,
        requested_amount: body.requested_amount,
        monthly_income: body.monthly_income,
        currency: body.currency,
        idempotency_key: body.idempotency_key,
        country_specific_data: body.country_specific_data.unwrap_or_else(|| serde_json::json!({})),
        created_by: "api".to_string(),
        source: "api".to_string(),
    };

    match cf_db::insert_application(&st.pool, &st.encryption_key, new).await {
        Ok(app) => {
            info!(application_id = %app.id, "application created");
            (
                StatusCode::CREATED,
                Json(CreateApplicationResponse {
                    id: app.id,
                    status: app.status,
                }),
            )
                .into_response()
        }
        // §7 taxonomy (IdempotencyHit): resolve by returning the prior
        // record, not by failing the request.
        Err(cf_db::InsertApplicationError::IdempotencyConflict { existing_id }) => {
            match cf_db::get_application(&st.pool, existing_id).await {
                Ok(Some(existing)) => (
                    StatusCode::CREATED,
                    Json(CreateApplicationResponse {
                        id: existing.id,
                        status: existing.status,
                    }),
                )
                    .into_response(),
                _ => (
                    StatusCode::CONFLICT,
                    Json(ErrorResponse {
                        error: "idempotency key in use but existing record could not be read back".to_string(),
                    }),
                )
                    .into_response(),
            }
        }
        Err(cf_db::InsertApplicationError::DuplicateActiveApplication) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "an active application already exists for this country and identity document".to_string(),
            }),
        )
            .into_response(),
        Err(cf_db::InsertApplicationError::Other(e)) => {
            warn!(error = %e, "insert_application failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to create application".to_string(),
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /applications/:id
// ---------------------------------------------------------------------------

async fn get_application(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match cf_db::get_application(&st.pool, id).await {
        Ok(Some(app)) => match cf_db::decrypt_pii(&st.encryption_key, &app) {
            Ok(pii) => (
                StatusCode::OK,
                Json(ApplicationResponse {
                    id: app.id,
                    country: app.country,
                    full_name: pii.full_name,
                    identity_document: pii.identity_document,
                    requested_amount: app.requested_amount,
                    monthly_income: app.monthly_income,
                    currency: app.currency,
                    status: app.status,
                    banking_data: app.banking_data,
                    risk_score: app.risk_score,
                    validation_errors: app.validation_errors,
                    created_at: app.created_at,
                    updated_at: app.updated_at,
                }),
            )
                .into_response(),
            Err(e) => {
                warn!(application_id = %id, error = %e, "failed to decrypt application PII");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "failed to decrypt application".to_string(),
                    }),
                )
                    .into_response()
            }
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "application not found".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(application_id = %id, error = %e, "get_application failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to load application".to_string(),
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /applications/:id/audit
// ---------------------------------------------------------------------------

async fn get_application_audit(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match cf_db::list_audit_logs(&st.pool, id).await {
        Ok(entries) => {
            let body: Vec<AuditLogEntryResponse> = entries
                .into_iter()
                .map(|e| AuditLogEntryResponse {
                    old_status: e.old_status,
                    new_status: e.new_status,
                    changed_by: e.changed_by,
                    change_reason: e.change_reason,
                    created_at: e.created_at,
                })
                .collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            warn!(application_id = %id, error = %e, "list_audit_logs failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to load audit trail".to_string(),
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /webhooks/bank-confirmation
// ---------------------------------------------------------------------------

async fn bank_confirmation_webhook(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = cf_webhook::check_payload_size(&body) {
        return (StatusCode::PAYLOAD_TOO_LARGE, Json(ErrorResponse { error: e.to_string() })).into_response();
    }

    let Some(signature) = headers.get("X-Webhook-Signature").and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "missing X-Webhook-Signature header".to_string(),
            }),
        )
            .into_response();
    };

    if let Err(e) = cf_webhook::verify_signature(&st.webhook_secret, &body, signature) {
        return (StatusCode::UNAUTHORIZED, Json(ErrorResponse { error: e.to_string() })).into_response();
    }

    match cf_webhook::handle_webhook(&st.pool, &st.updates, WEBHOOK_PROVIDER, &body).await {
        Ok(_outcome) => StatusCode::OK.into_response(),
        Err(e @ cf_webhook::WebhookError::InvalidTransition(_)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
        Err(e @ cf_webhook::WebhookError::MalformedPayload(_)) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "bank confirmation webhook failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /ws
// ---------------------------------------------------------------------------

async fn ws_upgrade(State(st): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let receiver = st.updates.subscribe();
    ws.on_upgrade(move |socket| run_realtime_session(socket, receiver))
}

async fn run_realtime_session(
    socket: axum::extract::ws::WebSocket,
    receiver: tokio::sync::broadcast::Receiver<ApplicationUpdateEvent>,
) {
    cf_realtime::run_session(socket, receiver).await;
}

// ---------------------------------------------------------------------------
// GET /admin/circuit-breakers, POST /admin/circuit-breakers/:country/:provider/reset
// ---------------------------------------------------------------------------

async fn admin_breaker_snapshot(State(st): State<Arc<AppState>>) -> Response {
    let snapshot = st.breakers.snapshot_all().await;
    let breakers = snapshot
        .into_iter()
        .map(|(country, provider, state)| BreakerSnapshotEntry {
            country,
            provider,
            phase: phase_name(state.phase),
            consecutive_failure_count: state.consecutive_failure_count,
        })
        .collect();

    (StatusCode::OK, Json(BreakerSnapshotResponse { breakers })).into_response()
}

async fn admin_breaker_reset(
    State(st): State<Arc<AppState>>,
    Path((country, provider)): Path<(String, String)>,
) -> Response {
    let Some(country) = Country::from_code(&country) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unknown country code: {country}"),
            }),
        )
            .into_response();
    };

    st.breakers.force_close(country, &provider).await;
    info!(?country, %provider, "circuit breaker force-closed by operator");
    StatusCode::OK.into_response()
}

fn phase_name(phase: cf_breaker::BreakerPhase) -> &'static str {
    match phase {
        cf_breaker::BreakerPhase::Closed => "closed",
        cf_breaker::BreakerPhase::Open => "open",
        cf_breaker::BreakerPhase::HalfOpen => "half_open",
    }
}
