//! Webhook handler (C8, §4.8): verifies a bank's confirmation callback and
//! advances the application state machine attributed to the provider.
//!
//! Verification and idempotency live here as pure/DB functions so the HTTP
//! layer (`cf-daemon`) only has to wire a request body and a header into
//! `verify_signature` and `handle_webhook`.

use cf_schemas::{ApplicationStatus, ApplicationUpdateEvent};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub enum WebhookError {
    PayloadTooLarge,
    SignatureMismatch,
    MalformedPayload(String),
    InvalidTransition(String),
    Database(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::PayloadTooLarge => write!(f, "payload exceeds {MAX_PAYLOAD_BYTES} bytes"),
            WebhookError::SignatureMismatch => write!(f, "signature mismatch"),
            WebhookError::MalformedPayload(msg) => write!(f, "malformed payload: {msg}"),
            WebhookError::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            WebhookError::Database(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for WebhookError {}

/// What the HTTP layer should answer with. Mirrors §4.8's status codes so
/// `cf-daemon`'s route handler is a thin match on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
}

#[derive(Debug, Deserialize)]
pub struct BankConfirmationPayload {
    pub provider_reference: String,
    pub application_id: Uuid,
    pub outcome: BankOutcome,
    pub credit_score: Option<i32>,
    pub banking_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankOutcome {
    Approved,
    Rejected,
    UnderReview,
}

impl BankOutcome {
    fn target_status(self) -> ApplicationStatus {
        match self {
            BankOutcome::Approved => ApplicationStatus::Approved,
            BankOutcome::Rejected => ApplicationStatus::Rejected,
            BankOutcome::UnderReview => ApplicationStatus::UnderReview,
        }
    }
}

/// Reject oversize bodies before touching the signature or JSON (§4.8:
/// "Payload size and signature are enforced here").
pub fn check_payload_size(body: &[u8]) -> Result<(), WebhookError> {
    if body.len() > MAX_PAYLOAD_BYTES {
        return Err(WebhookError::PayloadTooLarge);
    }
    Ok(())
}

/// Verify `X-Webhook-Signature` = lowercase hex of `HMAC-SHA256(secret,
/// raw_body)`, constant-time to avoid leaking comparison timing.
pub fn verify_signature(secret: &[u8], raw_body: &[u8], signature_header: &str) -> Result<(), WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex::encode(expected);

    let provided = signature_header.trim().to_lowercase();
    if expected_hex.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
        return Err(WebhookError::SignatureMismatch);
    }
    Ok(())
}

/// Run the five-step algorithm (§4.8) once signature + size have already
/// been verified by the caller.
pub async fn handle_webhook(
    pool: &PgPool,
    updates: &tokio::sync::broadcast::Sender<ApplicationUpdateEvent>,
    provider: &str,
    raw_body: &[u8],
) -> Result<WebhookOutcome, WebhookError> {
    let payload: BankConfirmationPayload = serde_json::from_slice(raw_body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
    let payload_value: serde_json::Value = serde_json::from_slice(raw_body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    // Step 1: idempotent insert keyed by provider_reference.
    let inserted = cf_db::insert_webhook_event(
        pool,
        &payload.provider_reference,
        payload.application_id,
        &payload_value,
    )
    .await
    .map_err(|e| WebhookError::Database(e.to_string()))?;

    let event = match inserted {
        Some(event) => event,
        None => {
            info!(provider_reference = %payload.provider_reference, "duplicate webhook, no reprocessing");
            return Ok(WebhookOutcome::Duplicate);
        }
    };

    // Step 2: load application, check the transition is reachable.
    let application = cf_db::get_application(pool, payload.application_id)
        .await
        .map_err(|e| WebhookError::Database(e.to_string()))?;

    let Some(application) = application else {
        let reason = "application not found".to_string();
        cf_db::mark_webhook_event_failed(pool, event.id, &reason)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;
        return Err(WebhookError::InvalidTransition(reason));
    };

    let target_status = payload.outcome.target_status();
    if cf_statemachine::validate_transition(application.status, target_status).is_err() {
        let reason = format!("invalid transition: {} -> {target_status}", application.status);
        cf_db::mark_webhook_event_failed(pool, event.id, &reason)
            .await
            .map_err(|e| WebhookError::Database(e.to_string()))?;
        return Err(WebhookError::InvalidTransition(reason));
    }

    // Step 3: transition, attributed to the provider.
    let risk_score = payload
        .credit_score
        .and_then(|s| cf_schemas::Money::from_decimal(rust_decimal::Decimal::from(s) / rust_decimal::Decimal::from(10)).ok());
    let patch = cf_db::StatusUpdatePatch {
        risk_score,
        banking_data: payload.banking_data.clone(),
        ..Default::default()
    };

    let advanced = cf_db::advance_application_status(
        pool,
        payload.application_id,
        application.status,
        target_status,
        &cf_statemachine::TransitionAttribution::webhook(provider, "bank confirmation webhook"),
        patch,
    )
    .await
    .map_err(|e| WebhookError::Database(e.to_string()))?;

    if !advanced {
        // Lost a race with a worker or another webhook delivery between the
        // read above and the guarded update; the replay that eventually
        // lands will see the already-advanced state and short-circuit.
        warn!(application_id = %payload.application_id, "webhook lost transition race; treating as already-applied");
    }

    // Step 4: mark the webhook event processed.
    cf_db::mark_webhook_event_processed(pool, event.id)
        .await
        .map_err(|e| WebhookError::Database(e.to_string()))?;

    // Step 5: best-effort fan-out; a missing subscriber is not an error.
    let _ = updates.send(ApplicationUpdateEvent {
        id: payload.application_id,
        status: target_status,
        risk_score,
        updated_at: chrono::Utc::now(),
    });

    Ok(WebhookOutcome::Processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_signature_verifies() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let body = br#"{"provider_reference":"r1"}"#;
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(secret, body, &sig).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let body = br#"{"provider_reference":"r1"}"#;
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        let tampered = br#"{"provider_reference":"r2"}"#;
        assert!(matches!(
            verify_signature(secret, tampered, &sig),
            Err(WebhookError::SignatureMismatch)
        ));
    }

    #[test]
    fn signature_is_case_insensitive_hex() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let body = br#"{"a":1}"#;
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes()).to_uppercase();
        assert!(verify_signature(secret, body, &sig).is_ok());
    }

    #[test]
    fn oversize_payload_rejected_before_verification() {
        let body = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(check_payload_size(&body), Err(WebhookError::PayloadTooLarge)));
    }

    #[test]
    fn undersize_payload_accepted() {
        let body = vec![0u8; MAX_PAYLOAD_BYTES];
        assert!(check_payload_size(&body).is_ok());
    }
}
