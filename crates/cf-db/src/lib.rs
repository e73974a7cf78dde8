//! Persistence layer (C1, §4.1): the exclusive owner of every row write.
//!
//! Operations mirror the outbox claim/release discipline from the teacher's
//! job-queue module (`FOR UPDATE SKIP LOCKED`, explicit mark-* transitions)
//! generalized to this domain's five tables. Every function takes a `&PgPool`
//! and runs raw `sqlx::query`/`query_as` — no compile-time `query!` macros,
//! since this workspace has no `DATABASE_URL` available at build time.

use anyhow::{Context, Result};
use cf_crypto::EncryptionKey;
use cf_schemas::{
    AuditLogEntry, Country, Money, PendingJob, PendingJobStatus, WebhookEvent, WebhookEventStatus,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub use cf_schemas::{Application, ApplicationStatus, FailedJob, FailedJobStatus};

/// Connect to Postgres. Callers resolve `database_url` from `cf_config::Config`
/// themselves — this crate never reads the environment directly.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("cf-db migrate failed")?;
    Ok(())
}

/// Deterministic digest used for the active-application uniqueness check;
/// the ciphertext column can't be compared directly since AES-GCM uses a
/// fresh random nonce on every encryption.
fn hash_identity_document(document: &str) -> Vec<u8> {
    Sha256::digest(document.as_bytes()).to_vec()
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewApplication {
    pub country: Country,
    pub full_name: String,
    pub identity_document: String,
    pub requested_amount: Money,
    pub monthly_income: Money,
    pub currency: String,
    pub idempotency_key: Option<String>,
    pub country_specific_data: Value,
    pub created_by: String,
    pub source: String,
}

/// Typed conflict error (§4.1: "any constraint violation surfaces as a typed
/// conflict error ... distinguishable from a generic data error").
#[derive(Debug, thiserror::Error)]
pub enum InsertApplicationError {
    #[error("idempotency key already in use by application {existing_id}")]
    IdempotencyConflict { existing_id: Uuid },
    #[error("an active application already exists for this country and identity document")]
    DuplicateActiveApplication,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub async fn insert_application(
    pool: &PgPool,
    key: &EncryptionKey,
    new: NewApplication,
) -> Result<Application, InsertApplicationError> {
    let full_name_ciphertext = key
        .encrypt_str(&new.full_name)
        .map_err(|e| InsertApplicationError::Other(anyhow::anyhow!(e)))?;
    let identity_document_ciphertext = key
        .encrypt_str(&new.identity_document)
        .map_err(|e| InsertApplicationError::Other(anyhow::anyhow!(e)))?;
    let identity_document_hash = hash_identity_document(&new.identity_document);

    let result = sqlx::query(
        r#"
        insert into applications (
            country, full_name_ciphertext, identity_document_ciphertext, identity_document_hash,
            requested_amount, monthly_income, currency, idempotency_key, country_specific_data,
            created_by, source
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        returning id, country, full_name_ciphertext, identity_document_ciphertext,
                  requested_amount, monthly_income, currency, idempotency_key, status,
                  country_specific_data, banking_data, risk_score, validation_errors,
                  created_at, updated_at, deleted_at
        "#,
    )
    .bind(new.country.code())
    .bind(&full_name_ciphertext)
    .bind(&identity_document_ciphertext)
    .bind(&identity_document_hash)
    .bind(new.requested_amount.as_decimal())
    .bind(new.monthly_income.as_decimal())
    .bind(&new.currency)
    .bind(&new.idempotency_key)
    .bind(&new.country_specific_data)
    .bind(&new.created_by)
    .bind(&new.source)
    .fetch_one(pool)
    .await;

    match result {
        Ok(row) => row_to_application(row).map_err(InsertApplicationError::Other),
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
            match db_err.constraint() {
                Some("uq_applications_idempotency_key") => {
                    let existing = new
                        .idempotency_key
                        .as_deref()
                        .map(|k| find_application_by_idempotency_key(pool, k));
                    match existing {
                        Some(fut) => {
                            let existing_app = fut
                                .await
                                .map_err(InsertApplicationError::Other)?
                                .ok_or_else(|| {
                                    InsertApplicationError::Other(anyhow::anyhow!(
                                        "idempotency conflict but no existing row found"
                                    ))
                                })?;
                            Err(InsertApplicationError::IdempotencyConflict {
                                existing_id: existing_app.id,
                            })
                        }
                        None => Err(InsertApplicationError::Other(anyhow::anyhow!(
                            "idempotency conflict without an idempotency_key on the new row"
                        ))),
                    }
                }
                Some("uq_applications_active_identity") => {
                    Err(InsertApplicationError::DuplicateActiveApplication)
                }
                _ => Err(InsertApplicationError::Other(anyhow::anyhow!(db_err))),
            }
        }
        Err(e) => Err(InsertApplicationError::Other(anyhow::Error::new(e).context("insert_application failed"))),
    }
}

pub async fn find_application_by_idempotency_key(pool: &PgPool, key: &str) -> Result<Option<Application>> {
    let row = sqlx::query(
        r#"
        select id, country, full_name_ciphertext, identity_document_ciphertext,
               requested_amount, monthly_income, currency, idempotency_key, status,
               country_specific_data, banking_data, risk_score, validation_errors,
               created_at, updated_at, deleted_at
        from applications
        where idempotency_key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("find_application_by_idempotency_key failed")?;

    row.map(row_to_application).transpose()
}

pub async fn get_application(pool: &PgPool, id: Uuid) -> Result<Option<Application>> {
    let row = sqlx::query(
        r#"
        select id, country, full_name_ciphertext, identity_document_ciphertext,
               requested_amount, monthly_income, currency, idempotency_key, status,
               country_specific_data, banking_data, risk_score, validation_errors,
               created_at, updated_at, deleted_at
        from applications
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("get_application failed")?;

    row.map(row_to_application).transpose()
}

pub struct DecryptedPii {
    pub full_name: String,
    pub identity_document: String,
}

/// Decrypt PII at the API response boundary (§4.1: "Decryption happens only
/// when the row is surfaced through the API response helper").
pub fn decrypt_pii(key: &EncryptionKey, app: &Application) -> Result<DecryptedPii> {
    Ok(DecryptedPii {
        full_name: key
            .decrypt_to_string(&app.full_name_ciphertext)
            .context("failed to decrypt full_name")?,
        identity_document: key
            .decrypt_to_string(&app.identity_document_ciphertext)
            .context("failed to decrypt identity_document")?,
    })
}

/// Patch applied atomically alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdatePatch {
    pub banking_data: Option<Value>,
    pub risk_score: Option<Money>,
    pub validation_errors: Option<Vec<String>>,
}

/// Execute a validated transition atomically with the persistence update
/// (§4.5), attributing the change via session variables the audit trigger
/// reads. Returns `false` if `id`'s current status no longer matches
/// `expected_from` (another worker already moved it) rather than erroring —
/// callers treat this as "someone else got there first", not a bug.
pub async fn advance_application_status(
    pool: &PgPool,
    id: Uuid,
    expected_from: ApplicationStatus,
    to: ApplicationStatus,
    attribution: &cf_statemachine::TransitionAttribution,
    patch: StatusUpdatePatch,
) -> Result<bool> {
    cf_statemachine::validate_transition(expected_from, to).context("illegal transition requested")?;

    let mut tx = pool.begin().await.context("begin transition tx failed")?;

    sqlx::query("select set_config('app.changed_by', $1, true)")
        .bind(&attribution.changed_by)
        .execute(&mut *tx)
        .await
        .context("set_config app.changed_by failed")?;

    sqlx::query("select set_config('app.change_reason', $1, true)")
        .bind(attribution.change_reason.as_deref().unwrap_or(""))
        .execute(&mut *tx)
        .await
        .context("set_config app.change_reason failed")?;

    let result = sqlx::query(
        r#"
        update applications
           set status             = $1,
               banking_data       = coalesce($2, banking_data),
               risk_score         = coalesce($3, risk_score),
               validation_errors  = coalesce($4, validation_errors)
         where id = $5 and status = $6
        returning id
        "#,
    )
    .bind(to.as_str())
    .bind(patch.banking_data)
    .bind(patch.risk_score.map(Money::as_decimal))
    .bind(patch.validation_errors.map(Value::from))
    .bind(id)
    .bind(expected_from.as_str())
    .fetch_optional(&mut *tx)
    .await
    .context("advance_application_status update failed")?;

    tx.commit().await.context("commit transition tx failed")?;

    Ok(result.is_some())
}

/// Soft-cancel a PENDING application past its auto-cancel timeout (§6 open
/// question resolution). Returns the ids cancelled.
pub async fn cancel_stale_pending_applications(pool: &PgPool, older_than: std::time::Duration) -> Result<Vec<Uuid>> {
    let mut tx = pool.begin().await.context("begin stale-cancel tx failed")?;
    sqlx::query("select set_config('app.changed_by', 'maintenance:stale_pending_sweep', true)")
        .execute(&mut *tx)
        .await
        .context("set_config failed")?;

    let rows = sqlx::query(
        r#"
        update applications
           set status = 'CANCELLED'
         where status = 'PENDING' and created_at < now() - make_interval(secs => $1)
        returning id
        "#,
    )
    .bind(older_than.as_secs() as f64)
    .fetch_all(&mut *tx)
    .await
    .context("cancel_stale_pending_applications failed")?;

    tx.commit().await.context("commit stale-cancel tx failed")?;

    rows.into_iter().map(|r| r.try_get::<Uuid, _>("id").context("id")).collect()
}

pub async fn list_audit_logs(pool: &PgPool, application_id: Uuid) -> Result<Vec<AuditLogEntry>> {
    let rows = sqlx::query(
        r#"
        select id, application_id, old_status, new_status, changed_by, change_reason, metadata, created_at
        from audit_logs
        where application_id = $1
        order by created_at asc
        "#,
    )
    .bind(application_id)
    .fetch_all(pool)
    .await
    .context("list_audit_logs failed")?;

    rows.into_iter()
        .map(|row| {
            let old_status: Option<String> = row.try_get("old_status")?;
            let new_status: String = row.try_get("new_status")?;
            Ok(AuditLogEntry {
                id: row.try_get("id")?,
                application_id: row.try_get("application_id")?,
                old_status: old_status.and_then(|s| ApplicationStatus::from_str_opt(&s)),
                new_status: ApplicationStatus::from_str_opt(&new_status)
                    .context("unrecognized new_status in audit_logs")?,
                changed_by: row.try_get("changed_by")?,
                change_reason: row.try_get("change_reason")?,
                metadata: row.try_get("metadata")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

fn row_to_application(row: sqlx::postgres::PgRow) -> Result<Application> {
    let country: String = row.try_get("country")?;
    let status: String = row.try_get("status")?;
    let requested_amount: rust_decimal::Decimal = row.try_get("requested_amount")?;
    let monthly_income: rust_decimal::Decimal = row.try_get("monthly_income")?;
    let risk_score: Option<rust_decimal::Decimal> = row.try_get("risk_score")?;
    let validation_errors: Value = row.try_get("validation_errors")?;

    Ok(Application {
        id: row.try_get("id")?,
        country: Country::from_code(&country).context("unrecognized country code in applications row")?,
        full_name_ciphertext: row.try_get("full_name_ciphertext")?,
        identity_document_ciphertext: row.try_get("identity_document_ciphertext")?,
        requested_amount: Money::from_decimal(requested_amount)?,
        monthly_income: Money::from_decimal(monthly_income)?,
        currency: row.try_get("currency")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: ApplicationStatus::from_str_opt(&status).context("unrecognized status in applications row")?,
        country_specific_data: row.try_get("country_specific_data")?,
        banking_data: row.try_get("banking_data")?,
        risk_score: risk_score.map(Money::from_decimal).transpose()?,
        validation_errors: serde_json::from_value(validation_errors).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

// ---------------------------------------------------------------------------
// Pending jobs (outbox-style claim/release)
// ---------------------------------------------------------------------------

/// Directly enqueue a new `pending_jobs` row. Unlike the normal insert path
/// (§4.1: the enqueue trigger fires on `applications` INSERT), this is the
/// explicit re-enqueue the DLQ auto-retry sweep (§4.10) performs for a
/// `failed_jobs` row it is retrying — there is no application insert to
/// trigger off of, so the maintenance job enqueues directly.
pub async fn insert_pending_job(pool: &PgPool, application_id: Uuid, task_name: &str, job_args: Value) -> Result<PendingJob> {
    let row = sqlx::query(
        r#"
        insert into pending_jobs (application_id, task_name, job_args, job_kwargs, status)
        values ($1, $2, $3, '{}'::jsonb, 'pending')
        returning id, application_id, task_name, job_args, job_kwargs, status, queue_handle,
                  dispatcher_id, created_at, enqueued_at, processed_at, updated_at, error_message, retry_count
        "#,
    )
    .bind(application_id)
    .bind(task_name)
    .bind(job_args)
    .fetch_one(pool)
    .await
    .context("insert_pending_job failed")?;

    row_to_pending_job(row)
}

/// Atomically claim up to `batch_size` `pending` rows and mark them
/// `enqueued` (§4.1: "claim-pending-jobs ... mark-pending-job-enqueued" are
/// the same atomic step). Uses `FOR UPDATE SKIP LOCKED` so concurrent queue
/// bridge instances never claim the same row twice.
pub async fn claim_pending_jobs(pool: &PgPool, batch_size: i64, dispatcher_id: &str) -> Result<Vec<PendingJob>> {
    let rows = sqlx::query(
        r#"
        with to_claim as (
            select id
            from pending_jobs
            where status = 'pending'
            order by created_at asc
            limit $1
            for update skip locked
        )
        update pending_jobs
           set status        = 'enqueued',
               enqueued_at   = now(),
               dispatcher_id = $2
         where id in (select id from to_claim)
        returning id, application_id, task_name, job_args, job_kwargs, status, queue_handle,
                  dispatcher_id, created_at, enqueued_at, processed_at, updated_at, error_message, retry_count
        "#,
    )
    .bind(batch_size)
    .bind(dispatcher_id)
    .fetch_all(pool)
    .await
    .context("claim_pending_jobs failed")?;

    rows.into_iter().map(row_to_pending_job).collect()
}

/// Transition an `enqueued` row to `processing`, the point at which a
/// worker has actually picked the job off the in-process queue.
pub async fn mark_pending_job_processing(pool: &PgPool, id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update pending_jobs
           set status = 'processing'
         where id = $1 and status = 'enqueued'
        returning id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("mark_pending_job_processing failed")?;
    Ok(row.is_some())
}

pub async fn mark_pending_job_completed(pool: &PgPool, id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update pending_jobs
           set status = 'completed', processed_at = now()
         where id = $1 and status = 'processing'
        returning id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("mark_pending_job_completed failed")?;
    Ok(row.is_some())
}

/// Terminal like `mark_pending_job_completed`, but for a job a worker never
/// actually ran because another holder already had the application's lock
/// (§4.7 step 2). `error_message` records why, so a `completed` row is
/// never ambiguous between "processed" and "skipped on contention".
pub async fn mark_pending_job_skipped(pool: &PgPool, id: Uuid, note: &str) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update pending_jobs
           set status = 'completed', processed_at = now(), error_message = $2
         where id = $1 and status = 'processing'
        returning id
        "#,
    )
    .bind(id)
    .bind(note)
    .fetch_optional(pool)
    .await
    .context("mark_pending_job_skipped failed")?;
    Ok(row.is_some())
}

pub async fn mark_pending_job_failed(pool: &PgPool, id: Uuid, error_message: &str) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update pending_jobs
           set status = 'failed', processed_at = now(), error_message = $2,
               retry_count = retry_count + 1
         where id = $1 and status = 'processing'
        returning id
        "#,
    )
    .bind(id)
    .bind(error_message)
    .fetch_optional(pool)
    .await
    .context("mark_pending_job_failed failed")?;
    Ok(row.is_some())
}

/// Return a `processing` row to `pending` after a transient failure so the
/// queue bridge re-claims it on its next tick (§4.7 retry path). Distinct
/// from `mark_pending_job_failed`, which is terminal.
pub async fn requeue_pending_job(pool: &PgPool, id: Uuid, error_message: &str) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update pending_jobs
           set status = 'pending', error_message = $2, retry_count = retry_count + 1,
               enqueued_at = null, dispatcher_id = null
         where id = $1 and status = 'processing'
        returning id
        "#,
    )
    .bind(id)
    .bind(error_message)
    .fetch_optional(pool)
    .await
    .context("requeue_pending_job failed")?;
    Ok(row.is_some())
}

/// Reclaim rows stuck in `processing` past `older_than` (worker crashed
/// mid-task) back to `pending` so the queue bridge re-claims them (§6 open
/// question resolution: orphan sweep).
pub async fn reclaim_orphan_processing_jobs(pool: &PgPool, older_than: std::time::Duration) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        update pending_jobs
           set status = 'pending', dispatcher_id = null, enqueued_at = null
         where status = 'processing' and updated_at < now() - make_interval(secs => $1)
        returning id
        "#,
    )
    .bind(older_than.as_secs() as f64)
    .fetch_all(pool)
    .await
    .context("reclaim_orphan_processing_jobs failed")?;

    rows.into_iter().map(|r| r.try_get::<Uuid, _>("id").context("id")).collect()
}

fn row_to_pending_job(row: sqlx::postgres::PgRow) -> Result<PendingJob> {
    let status: String = row.try_get("status")?;
    Ok(PendingJob {
        id: row.try_get("id")?,
        application_id: row.try_get("application_id")?,
        task_name: row.try_get("task_name")?,
        job_args: row.try_get("job_args")?,
        job_kwargs: row.try_get("job_kwargs")?,
        status: PendingJobStatus::from_str_opt(&status).context("unrecognized pending_jobs.status")?,
        queue_handle: row.try_get("queue_handle")?,
        dispatcher_id: row.try_get("dispatcher_id")?,
        created_at: row.try_get("created_at")?,
        enqueued_at: row.try_get("enqueued_at")?,
        processed_at: row.try_get("processed_at")?,
        updated_at: row.try_get("updated_at")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
    })
}

// ---------------------------------------------------------------------------
// Webhook events
// ---------------------------------------------------------------------------

pub async fn find_webhook_event_by_idempotency_key(pool: &PgPool, key: &str) -> Result<Option<WebhookEvent>> {
    let row = sqlx::query(
        r#"
        select id, idempotency_key, application_id, payload, status, error_message, processed_at, created_at
        from webhook_events
        where idempotency_key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("find_webhook_event_by_idempotency_key failed")?;

    row.map(row_to_webhook_event).transpose()
}

/// Insert a new `processing` webhook event row. Returns `None` if
/// `idempotency_key` already exists (caller should look the existing row up
/// via `find_webhook_event_by_idempotency_key` and treat this as a replay).
pub async fn insert_webhook_event(
    pool: &PgPool,
    idempotency_key: &str,
    application_id: Uuid,
    payload: &Value,
) -> Result<Option<WebhookEvent>> {
    let row = sqlx::query(
        r#"
        insert into webhook_events (idempotency_key, application_id, payload, status)
        values ($1, $2, $3, 'processing')
        on conflict (idempotency_key) do nothing
        returning id, idempotency_key, application_id, payload, status, error_message, processed_at, created_at
        "#,
    )
    .bind(idempotency_key)
    .bind(application_id)
    .bind(payload)
    .fetch_optional(pool)
    .await
    .context("insert_webhook_event failed")?;

    row.map(row_to_webhook_event).transpose()
}

pub async fn mark_webhook_event_processed(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("update webhook_events set status = 'processed', processed_at = now() where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("mark_webhook_event_processed failed")?;
    Ok(())
}

pub async fn mark_webhook_event_failed(pool: &PgPool, id: Uuid, error_message: &str) -> Result<()> {
    sqlx::query("update webhook_events set status = 'failed', processed_at = now(), error_message = $2 where id = $1")
        .bind(id)
        .bind(error_message)
        .execute(pool)
        .await
        .context("mark_webhook_event_failed failed")?;
    Ok(())
}

/// §4.10/3: 30-day retention on webhook_events.
pub async fn delete_expired_webhook_events(pool: &PgPool, ttl_days: i64) -> Result<u64> {
    let result = sqlx::query("delete from webhook_events where created_at < now() - make_interval(days => $1)")
        .bind(ttl_days as i32)
        .execute(pool)
        .await
        .context("delete_expired_webhook_events failed")?;
    Ok(result.rows_affected())
}

fn row_to_webhook_event(row: sqlx::postgres::PgRow) -> Result<WebhookEvent> {
    let status: String = row.try_get("status")?;
    Ok(WebhookEvent {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        application_id: row.try_get("application_id")?,
        payload: row.try_get("payload")?,
        status: match status.as_str() {
            "processing" => WebhookEventStatus::Processing,
            "processed" => WebhookEventStatus::Processed,
            "failed" => WebhookEventStatus::Failed,
            other => anyhow::bail!("unrecognized webhook_events.status: {other}"),
        },
        error_message: row.try_get("error_message")?,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Failed jobs (dead-letter queue)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewFailedJob {
    pub task_name: String,
    pub job_args: Value,
    pub job_kwargs: Value,
    pub error_type: String,
    pub error_message: String,
    pub error_traceback: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub is_retryable: bool,
    pub pending_job_id: Option<Uuid>,
}

pub async fn insert_failed_job(pool: &PgPool, new: NewFailedJob) -> Result<FailedJob> {
    let row = sqlx::query(
        r#"
        insert into failed_jobs (
            task_name, job_args, job_kwargs, error_type, error_message, error_traceback,
            retry_count, max_retries, is_retryable, pending_job_id
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        returning job_id, task_name, job_args, job_kwargs, error_type, error_message, error_traceback,
                  retry_count, max_retries, status, is_retryable, pending_job_id, created_at, updated_at
        "#,
    )
    .bind(&new.task_name)
    .bind(&new.job_args)
    .bind(&new.job_kwargs)
    .bind(&new.error_type)
    .bind(&new.error_message)
    .bind(&new.error_traceback)
    .bind(new.retry_count)
    .bind(new.max_retries)
    .bind(new.is_retryable)
    .bind(new.pending_job_id)
    .fetch_one(pool)
    .await
    .context("insert_failed_job failed")?;

    row_to_failed_job(row)
}

/// Rows the DLQ auto-retry sweep (§4.10) should attempt again.
pub async fn list_retryable_failed_jobs(pool: &PgPool, limit: i64) -> Result<Vec<FailedJob>> {
    let rows = sqlx::query(
        r#"
        select job_id, task_name, job_args, job_kwargs, error_type, error_message, error_traceback,
               retry_count, max_retries, status, is_retryable, pending_job_id, created_at, updated_at
        from failed_jobs
        where status = 'pending' and is_retryable and retry_count < max_retries
        order by created_at asc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_retryable_failed_jobs failed")?;

    rows.into_iter().map(row_to_failed_job).collect()
}

pub async fn mark_failed_job_retried(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query("update failed_jobs set status = 'retried', retry_count = retry_count + 1 where job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("mark_failed_job_retried failed")?;
    Ok(())
}

pub async fn mark_failed_job_ignored(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query("update failed_jobs set status = 'ignored' where job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("mark_failed_job_ignored failed")?;
    Ok(())
}

fn row_to_failed_job(row: sqlx::postgres::PgRow) -> Result<FailedJob> {
    let status: String = row.try_get("status")?;
    Ok(FailedJob {
        job_id: row.try_get("job_id")?,
        task_name: row.try_get("task_name")?,
        job_args: row.try_get("job_args")?,
        job_kwargs: row.try_get("job_kwargs")?,
        error_type: row.try_get("error_type")?,
        error_message: row.try_get("error_message")?,
        error_traceback: row.try_get("error_traceback")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        status: match status.as_str() {
            "pending" => FailedJobStatus::Pending,
            "reviewed" => FailedJobStatus::Reviewed,
            "reprocessed" => FailedJobStatus::Reprocessed,
            "ignored" => FailedJobStatus::Ignored,
            "retried" => FailedJobStatus::Retried,
            other => anyhow::bail!("unrecognized failed_jobs.status: {other}"),
        },
        is_retryable: row.try_get("is_retryable")?,
        pending_job_id: row.try_get("pending_job_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_identity_document_is_deterministic() {
        let a = hash_identity_document("12345678Z");
        let b = hash_identity_document("12345678Z");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_identity_document_differs_by_input() {
        let a = hash_identity_document("12345678Z");
        let b = hash_identity_document("87654321X");
        assert_ne!(a, b);
    }

    // The remaining operations require a live Postgres instance; these are
    // covered by `cf-testkit`-backed scenario tests at the daemon level
    // rather than re-asserted here with a mocked pool.
}
