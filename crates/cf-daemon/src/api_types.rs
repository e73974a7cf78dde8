//! Request and response types for all cf-daemon HTTP endpoints.
//!
//! Plain `Serialize`/`Deserialize` structs; no business logic lives here.

use cf_schemas::{ApplicationStatus, Country, Money};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct CreateApplicationRequest {
    pub country: Country,
    pub full_name: String,
    pub identity_document: String,
    pub requested_amount: Money,
    pub monthly_income: Money,
    pub currency: String,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub country_specific_data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateApplicationResponse {
    pub id: Uuid,
    pub status: ApplicationStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// PII is decrypted only at this read boundary (§4.1).
#[derive(Debug, Serialize)]
pub struct ApplicationResponse {
    pub id: Uuid,
    pub country: Country,
    pub full_name: String,
    pub identity_document: String,
    pub requested_amount: Money,
    pub monthly_income: Money,
    pub currency: String,
    pub status: ApplicationStatus,
    pub banking_data: Value,
    pub risk_score: Option<Money>,
    pub validation_errors: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct AuditLogEntryResponse {
    pub old_status: Option<ApplicationStatus>,
    pub new_status: ApplicationStatus,
    pub changed_by: String,
    pub change_reason: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct BreakerSnapshotEntry {
    pub country: Country,
    pub provider: String,
    pub phase: &'static str,
    pub consecutive_failure_count: u32,
}

#[derive(Debug, Serialize)]
pub struct BreakerSnapshotResponse {
    pub breakers: Vec<BreakerSnapshotEntry>,
}
