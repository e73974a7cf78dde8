//! Domain types shared across the credit-application processing core.
//!
//! Plain serde structs with no I/O, mirroring the shape of a schemas crate
//! that every other crate in the workspace depends on and nothing else.

pub mod money;

pub use money::{Money, MoneyError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The six countries this deployment services. Unknown codes are a
/// permanent error at the registry boundary (cf-countries), not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Country {
    #[serde(rename = "ES")]
    Spain,
    #[serde(rename = "MX")]
    Mexico,
    #[serde(rename = "CO")]
    Colombia,
    #[serde(rename = "PE")]
    Peru,
    #[serde(rename = "CL")]
    Chile,
    #[serde(rename = "BR")]
    Brazil,
}

impl Country {
    pub const ALL: [Country; 6] = [
        Country::Spain,
        Country::Mexico,
        Country::Colombia,
        Country::Peru,
        Country::Chile,
        Country::Brazil,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Country::Spain => "ES",
            Country::Mexico => "MX",
            Country::Colombia => "CO",
            Country::Peru => "PE",
            Country::Chile => "CL",
            Country::Brazil => "BR",
        }
    }

    /// ISO-4217 currency canonical to this country.
    pub fn canonical_currency(self) -> &'static str {
        match self {
            Country::Spain => "EUR",
            Country::Mexico => "MXN",
            Country::Colombia => "COP",
            Country::Peru => "PEN",
            Country::Chile => "CLP",
            Country::Brazil => "BRL",
        }
    }

    pub fn from_code(code: &str) -> Option<Country> {
        Country::ALL.into_iter().find(|c| c.code() == code)
    }
}

impl std::fmt::Display for Country {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Application lifecycle status (§4.5). Terminal variants admit no further
/// transition — see `cf-statemachine` for the authoritative transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Pending,
    Validating,
    UnderReview,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

impl ApplicationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Approved
                | ApplicationStatus::Rejected
                | ApplicationStatus::Cancelled
                | ApplicationStatus::Completed
        )
    }

    /// "Active" per the Application invariant in §3: not cancelled, rejected,
    /// or completed (deleted_at is tracked separately on the row).
    pub fn is_active_eligible(self) -> bool {
        !matches!(
            self,
            ApplicationStatus::Cancelled
                | ApplicationStatus::Rejected
                | ApplicationStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "PENDING",
            ApplicationStatus::Validating => "VALIDATING",
            ApplicationStatus::UnderReview => "UNDER_REVIEW",
            ApplicationStatus::Approved => "APPROVED",
            ApplicationStatus::Rejected => "REJECTED",
            ApplicationStatus::Cancelled => "CANCELLED",
            ApplicationStatus::Completed => "COMPLETED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<ApplicationStatus> {
        Some(match s {
            "PENDING" => ApplicationStatus::Pending,
            "VALIDATING" => ApplicationStatus::Validating,
            "UNDER_REVIEW" => ApplicationStatus::UnderReview,
            "APPROVED" => ApplicationStatus::Approved,
            "REJECTED" => ApplicationStatus::Rejected,
            "CANCELLED" => ApplicationStatus::Cancelled,
            "COMPLETED" => ApplicationStatus::Completed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A credit application row. `full_name` / `identity_document` are opaque
/// ciphertext here — decryption happens only at the API response boundary
/// (see `cf-crypto` and `cf-daemon`'s read handlers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub country: Country,
    pub full_name_ciphertext: Vec<u8>,
    pub identity_document_ciphertext: Vec<u8>,
    pub requested_amount: Money,
    pub monthly_income: Money,
    pub currency: String,
    pub idempotency_key: Option<String>,
    pub status: ApplicationStatus,
    pub country_specific_data: Value,
    pub banking_data: Value,
    pub risk_score: Option<Money>,
    pub validation_errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One row of the automatically-written audit trail (§3 AuditLog).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub application_id: Uuid,
    pub old_status: Option<ApplicationStatus>,
    pub new_status: ApplicationStatus,
    pub changed_by: String,
    pub change_reason: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Status of a row in the `pending_jobs` visibility table (§3 PendingJob).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingJobStatus {
    Pending,
    Enqueued,
    Processing,
    Completed,
    Failed,
}

impl PendingJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingJobStatus::Pending => "pending",
            PendingJobStatus::Enqueued => "enqueued",
            PendingJobStatus::Processing => "processing",
            PendingJobStatus::Completed => "completed",
            PendingJobStatus::Failed => "failed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<PendingJobStatus> {
        Some(match s {
            "pending" => PendingJobStatus::Pending,
            "enqueued" => PendingJobStatus::Enqueued,
            "processing" => PendingJobStatus::Processing,
            "completed" => PendingJobStatus::Completed,
            "failed" => PendingJobStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingJob {
    pub id: Uuid,
    pub application_id: Uuid,
    pub task_name: String,
    pub job_args: Value,
    pub job_kwargs: Value,
    pub status: PendingJobStatus,
    pub queue_handle: Option<String>,
    pub dispatcher_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Processing,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub idempotency_key: String,
    pub application_id: Uuid,
    pub payload: Value,
    pub status: WebhookEventStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedJobStatus {
    Pending,
    Reviewed,
    Reprocessed,
    Ignored,
    Retried,
}

impl FailedJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FailedJobStatus::Pending => "pending",
            FailedJobStatus::Reviewed => "reviewed",
            FailedJobStatus::Reprocessed => "reprocessed",
            FailedJobStatus::Ignored => "ignored",
            FailedJobStatus::Retried => "retried",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_id: Uuid,
    pub task_name: String,
    pub job_args: Value,
    pub job_kwargs: Value,
    pub error_type: String,
    pub error_message: String,
    pub error_traceback: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub status: FailedJobStatus,
    pub is_retryable: bool,
    pub pending_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recommendation returned by a country strategy's `evaluate` (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    Approve,
    Reject,
    Review,
}

/// Result of a country strategy's pure `validate_document` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Banking data returned by a provider adapter (real or circuit-breaker
/// fallback, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankingData {
    pub provider_name: String,
    pub credit_score: i32,
    pub total_debt: Money,
    pub monthly_obligations: Money,
    pub has_defaults: bool,
    pub additional_data: Value,
}

impl BankingData {
    pub fn is_fallback(&self) -> bool {
        self.additional_data
            .get("fallback")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Pub/sub wire payload for an `application_update` message (§6). Workers
/// broadcast one of these after every persisted status change; the
/// real-time fan-out (C9) forwards it verbatim to subscribed WebSocket
/// sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationUpdateEvent {
    pub id: Uuid,
    pub status: ApplicationStatus,
    pub risk_score: Option<Money>,
    pub updated_at: DateTime<Utc>,
}
