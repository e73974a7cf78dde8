//! Worker pool (C7, §4.7): consumes jobs from the in-process work queue
//! (`cf-queue`) and drives `process_credit_application` to completion,
//! retrying transient failures with backoff and routing permanent ones
//! (and retry-exhausted transient ones) to the DLQ (`failed_jobs`).
//!
//! Mirrors the heartbeat-loop shape used by the queue bridge: a spawned
//! task per worker slot, `tokio::select!` against a shutdown signal, no
//! ambient process state beyond what is passed in at construction.

use anyhow::Result;
use cf_queue::WorkQueueReceiver;
use cf_schemas::{
    ApplicationStatus, ApplicationUpdateEvent, Country, PendingJob, Recommendation,
};
use cf_statemachine::TransitionAttribution;
use rand::Rng;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Classification driving retry behaviour (§7). Permanent errors never
/// retry; transient ones retry up to `max_retries` with backoff.
#[derive(Debug, Clone)]
pub enum ProcessingError {
    InvalidApplicationId,
    ApplicationNotFound,
    ValidationError(Vec<String>),
    StateTransitionError(String),
    UnsupportedCountry(Country),
    DatabaseUnavailable(String),
    ProviderUnavailable(String),
    NetworkTimeout,
    ConnectionError(String),
    RecoverableError(String),
    /// A country strategy reported `StrategyError::Permanent` — the
    /// provider rejected the request in a way a retry cannot fix.
    PermanentProviderError(String),
}

impl ProcessingError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessingError::DatabaseUnavailable(_)
                | ProcessingError::ProviderUnavailable(_)
                | ProcessingError::NetworkTimeout
                | ProcessingError::ConnectionError(_)
                | ProcessingError::RecoverableError(_)
        )
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProcessingError::InvalidApplicationId => "InvalidApplicationId",
            ProcessingError::ApplicationNotFound => "ApplicationNotFound",
            ProcessingError::ValidationError(_) => "ValidationError",
            ProcessingError::StateTransitionError(_) => "StateTransitionError",
            ProcessingError::UnsupportedCountry(_) => "UnsupportedCountry",
            ProcessingError::DatabaseUnavailable(_) => "DatabaseUnavailable",
            ProcessingError::ProviderUnavailable(_) => "ProviderUnavailable",
            ProcessingError::NetworkTimeout => "NetworkTimeout",
            ProcessingError::ConnectionError(_) => "ConnectionError",
            ProcessingError::RecoverableError(_) => "RecoverableError",
            ProcessingError::PermanentProviderError(_) => "PermanentProviderError",
        }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingError::ValidationError(errs) => write!(f, "validation failed: {}", errs.join("; ")),
            ProcessingError::StateTransitionError(msg) => write!(f, "{msg}"),
            ProcessingError::UnsupportedCountry(c) => write!(f, "unsupported country: {c:?}"),
            ProcessingError::DatabaseUnavailable(msg) => write!(f, "database unavailable: {msg}"),
            ProcessingError::ProviderUnavailable(msg) => write!(f, "provider unavailable: {msg}"),
            ProcessingError::ConnectionError(msg) => write!(f, "connection error: {msg}"),
            ProcessingError::RecoverableError(msg) => write!(f, "recoverable error: {msg}"),
            ProcessingError::InvalidApplicationId => write!(f, "invalid application id"),
            ProcessingError::ApplicationNotFound => write!(f, "application not found"),
            ProcessingError::NetworkTimeout => write!(f, "network timeout"),
            ProcessingError::PermanentProviderError(msg) => write!(f, "permanent provider error: {msg}"),
        }
    }
}

impl std::error::Error for ProcessingError {}

/// How a job run ended, when it didn't error. Distinguishes "did the work"
/// from "another worker already held the application's lock" so the
/// `pending_jobs` row left behind is never ambiguous between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    SkippedLockContention,
    RequeuedOnShutdown,
}

/// Fixed configuration for a worker pool instance (§4.7, §3.3 tunables).
#[derive(Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub task_timeout: Duration,
    pub lock_ttl: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// How long an in-flight task is given to finish after shutdown is
    /// signaled (§5) before this pool forces its lock release and requeues
    /// the underlying `pending_jobs` row for the next process to pick up.
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            task_timeout: Duration::from_secs(5 * 60),
            lock_ttl: Duration::from_secs(5 * 60),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Everything `process_credit_application` needs, shared read-only (or
/// internally synchronized) across every worker task.
#[derive(Clone)]
pub struct WorkerPool {
    pool: PgPool,
    encryption_key: Arc<cf_crypto::EncryptionKey>,
    countries: Arc<cf_countries::CountryRegistry>,
    breakers: cf_breaker::BreakerRegistry,
    updates: broadcast::Sender<ApplicationUpdateEvent>,
    cfg: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        pool: PgPool,
        encryption_key: Arc<cf_crypto::EncryptionKey>,
        countries: cf_countries::CountryRegistry,
        breakers: cf_breaker::BreakerRegistry,
        updates: broadcast::Sender<ApplicationUpdateEvent>,
        cfg: WorkerPoolConfig,
    ) -> Self {
        Self {
            pool,
            encryption_key,
            countries: Arc::new(countries),
            breakers,
            updates,
            cfg,
        }
    }

    /// Spawn `cfg.concurrency` consumer tasks pulling from `receiver`,
    /// running until `shutdown` fires. The receiver is wrapped so every
    /// spawned task can take turns calling `recv()`; `tokio::mpsc`
    /// guarantees each job is delivered to exactly one of them.
    pub async fn run(self, receiver: WorkQueueReceiver, shutdown: tokio::sync::watch::Receiver<bool>) {
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(self.cfg.concurrency);

        for slot in 0..self.cfg.concurrency {
            let worker = self.clone();
            let receiver = Arc::clone(&receiver);
            let mut shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        job = async {
                            let mut rx = receiver.lock().await;
                            rx.recv().await
                        } => job,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!(slot, "worker slot shutting down");
                                return;
                            }
                            continue;
                        }
                    };

                    let Some(job) = job else {
                        info!(slot, "work queue closed; worker slot exiting");
                        return;
                    };

                    worker.handle_job(job, shutdown.clone()).await;
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn handle_job(&self, job: PendingJob, shutdown: tokio::sync::watch::Receiver<bool>) {
        let job_id = job.id;
        if let Err(e) = cf_db::mark_pending_job_processing(&self.pool, job_id).await {
            error!(job_id = %job_id, error = %e, "failed to mark pending job processing");
            return;
        }

        let application_id = job.application_id;
        let result = match tokio::time::timeout(
            self.cfg.task_timeout,
            self.process_credit_application(application_id, job_id, shutdown),
        )
        .await
        {
            Ok(r) => r,
            Err(_elapsed) => Err(ProcessingError::RecoverableError(
                "task timed out".to_string(),
            )),
        };

        match result {
            Ok(JobOutcome::Completed) => {
                if let Err(e) = cf_db::mark_pending_job_completed(&self.pool, job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to mark pending job completed");
                }
            }
            Ok(JobOutcome::SkippedLockContention) => {
                if let Err(e) =
                    cf_db::mark_pending_job_skipped(&self.pool, job_id, "skipped: application already locked by another worker").await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark pending job skipped");
                }
            }
            Ok(JobOutcome::RequeuedOnShutdown) => {
                info!(job_id = %job_id, "pending job requeued after shutdown grace period expired mid-task");
            }
            Err(e) => self.handle_failure(job, e).await,
        }
    }

    async fn handle_failure(&self, job: PendingJob, err: ProcessingError) {
        let job_id = job.id;
        let retryable = err.is_retryable();
        let attempt = job.retry_count;

        if retryable && (attempt as u32) < self.cfg.max_retries {
            let delay = backoff_delay(self.cfg.retry_base_delay, attempt as u32);
            warn!(job_id = %job_id, attempt, ?delay, error = %err, "transient failure, scheduling retry");
            tokio::time::sleep(delay).await;
            if let Err(e) = cf_db::requeue_pending_job(&self.pool, job_id, &err.to_string()).await {
                error!(job_id = %job_id, error = %e, "failed to requeue job for retry");
            }
            return;
        }

        error!(job_id = %job_id, error = %err, retryable, "routing job to dead letter queue");

        let new_failed = cf_db::NewFailedJob {
            task_name: job.task_name.clone(),
            job_args: job.job_args.clone(),
            job_kwargs: job.job_kwargs.clone(),
            error_type: err.error_type().to_string(),
            error_message: err.to_string(),
            error_traceback: None,
            retry_count: attempt,
            max_retries: self.cfg.max_retries as i32,
            is_retryable: retryable,
            pending_job_id: Some(job_id),
        };

        if let Err(e) = cf_db::insert_failed_job(&self.pool, new_failed).await {
            error!(job_id = %job_id, error = %e, "failed to insert failed_jobs row");
        }
        if let Err(e) = cf_db::mark_pending_job_failed(&self.pool, job_id, &err.to_string()).await {
            error!(job_id = %job_id, error = %e, "failed to mark pending job failed");
        }
    }

    /// The nine-step algorithm (§4.7). Every exit path — success, early
    /// return, or error — releases the lock it acquired; there is no path
    /// that leaves a lease held past this function's return.
    async fn process_credit_application(
        &self,
        application_id: Uuid,
        job_id: Uuid,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<JobOutcome, ProcessingError> {
        let task_id = Uuid::new_v4();
        let holder_id = cf_lock::holder_id(task_id);
        let lock_key = format!("application:{application_id}");

        let lease = cf_lock::acquire(&self.pool, &lock_key, &holder_id, self.cfg.lock_ttl)
            .await
            .map_err(|e| ProcessingError::DatabaseUnavailable(e.to_string()))?;

        let Some(_lease) = lease else {
            // Someone else is already processing this application; treat it
            // as already handled rather than contending further (§4.7 step 2).
            info!(%application_id, "application already locked; skipping");
            return Ok(JobOutcome::SkippedLockContention);
        };

        tokio::select! {
            outcome = self.process_locked(application_id) => {
                if let Err(e) = cf_lock::release(&self.pool, &lock_key, &holder_id).await {
                    warn!(%application_id, error = %e, "failed to release application lock");
                }
                outcome.map(|()| JobOutcome::Completed)
            }
            _ = wait_for_shutdown_grace(shutdown, self.cfg.shutdown_grace) => {
                warn!(%application_id, "shutdown grace period expired mid-task; forcing lock release and requeue");
                if let Err(e) = cf_lock::release(&self.pool, &lock_key, &holder_id).await {
                    warn!(%application_id, error = %e, "failed to release application lock on forced shutdown");
                }
                if let Err(e) = cf_db::requeue_pending_job(&self.pool, job_id, "worker shutdown grace period expired").await {
                    error!(%application_id, error = %e, "failed to requeue job on forced shutdown");
                }
                Ok(JobOutcome::RequeuedOnShutdown)
            }
        }
    }

    async fn process_locked(&self, application_id: Uuid) -> Result<(), ProcessingError> {
        let application = cf_db::get_application(&self.pool, application_id)
            .await
            .map_err(|e| ProcessingError::DatabaseUnavailable(e.to_string()))?
            .ok_or(ProcessingError::ApplicationNotFound)?;

        // Already past VALIDATING (another worker raced us, or a webhook
        // already resolved it) — nothing left for this task to do.
        if application.status != ApplicationStatus::Pending {
            info!(%application_id, status = %application.status, "application no longer pending; skipping");
            return Ok(());
        }

        // §9 open question, resolved: a country with no registered strategy
        // (inserted, then the registry loses support before pickup) is not a
        // worker failure — it routes through VALIDATING straight to
        // UNDER_REVIEW for a human, respecting the legal transition table.
        let unsupported_country = self.countries.lookup(application.country).is_none();

        let transition_ok = cf_db::advance_application_status(
            &self.pool,
            application_id,
            ApplicationStatus::Pending,
            ApplicationStatus::Validating,
            &TransitionAttribution::worker("begin processing"),
            cf_db::StatusUpdatePatch::default(),
        )
        .await
        .map_err(|e| ProcessingError::StateTransitionError(e.to_string()))?;

        if !transition_ok {
            info!(%application_id, "lost the PENDING -> VALIDATING race; skipping");
            return Ok(());
        }
        self.emit_update(application_id, ApplicationStatus::Validating, None);

        if unsupported_country {
            cf_db::advance_application_status(
                &self.pool,
                application_id,
                ApplicationStatus::Validating,
                ApplicationStatus::UnderReview,
                &TransitionAttribution::worker("unsupported country"),
                cf_db::StatusUpdatePatch {
                    validation_errors: Some(vec![format!("unsupported country: {}", application.country.code())]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProcessingError::StateTransitionError(e.to_string()))?;
            self.emit_update(application_id, ApplicationStatus::UnderReview, None);
            return Ok(());
        }

        let strategy = self
            .countries
            .lookup(application.country)
            .expect("unsupported_country already handled above");

        // PII decryption for the country strategy's document check is a
        // seam into cf-crypto; see `decrypt_pii`'s doc comment for why it
        // is only ever called at a read boundary like this one.
        let decrypted = cf_db::decrypt_pii(&self.encryption_key, &application)
            .map_err(|e| ProcessingError::RecoverableError(e.to_string()))?;
        let identity_document = decrypted.identity_document;
        let full_name = decrypted.full_name;

        let validation = strategy.validate_document(&identity_document);
        if !validation.valid {
            cf_db::advance_application_status(
                &self.pool,
                application_id,
                ApplicationStatus::Validating,
                ApplicationStatus::Rejected,
                &TransitionAttribution::worker("document validation failed"),
                cf_db::StatusUpdatePatch {
                    validation_errors: Some(validation.errors.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProcessingError::StateTransitionError(e.to_string()))?;
            self.emit_update(application_id, ApplicationStatus::Rejected, None);
            return Ok(());
        }

        let provider_name = format!("{:?}", application.country).to_lowercase();
        let country = application.country;
        let countries = Arc::clone(&self.countries);

        let banking_data = self
            .breakers
            .call(
                country,
                &provider_name,
                move || {
                    let result = countries
                        .lookup(country)
                        .expect("country already validated above")
                        .fetch_banking_data(&identity_document, &full_name);
                    std::future::ready(result)
                },
                cf_breaker::fallback_artifact,
            )
            .await
            .map_err(|e: cf_countries::StrategyError| match e {
                cf_countries::StrategyError::Transient(msg) => ProcessingError::ProviderUnavailable(msg),
                cf_countries::StrategyError::Permanent(msg) => ProcessingError::PermanentProviderError(msg),
            })?;

        let (recommendation, risk_score, notes) = strategy.evaluate(&application, &banking_data);
        let target_status = cf_statemachine::status_for_recommendation(recommendation);
        let final_status = if banking_data.is_fallback() && recommendation == Recommendation::Approve {
            // §7: a provider outage never auto-approves; fallback data can
            // only ever land on UNDER_REVIEW or REJECTED.
            ApplicationStatus::UnderReview
        } else {
            target_status
        };

        let banking_json = serde_json::to_value(&banking_data)
            .map_err(|e| ProcessingError::RecoverableError(e.to_string()))?;

        cf_db::advance_application_status(
            &self.pool,
            application_id,
            ApplicationStatus::Validating,
            final_status,
            &TransitionAttribution::worker(notes.join("; ")),
            cf_db::StatusUpdatePatch {
                banking_data: Some(banking_json),
                risk_score: Some(risk_score),
                validation_errors: Some(Vec::new()),
            },
        )
        .await
        .map_err(|e| ProcessingError::StateTransitionError(e.to_string()))?;

        self.emit_update(application_id, final_status, Some(risk_score));
        Ok(())
    }

    fn emit_update(&self, id: Uuid, status: ApplicationStatus, risk_score: Option<cf_schemas::Money>) {
        let event = ApplicationUpdateEvent {
            id,
            status,
            risk_score,
            updated_at: chrono::Utc::now(),
        };
        // Broadcast is best-effort (§7 BroadcastFailure: log and continue);
        // `send` only errors when there are no subscribers, which is the
        // common case when nobody has an open WebSocket for this id.
        let _ = self.updates.send(event);
    }
}

/// Resolves `grace` after `shutdown` first flips to `true`; never resolves
/// if shutdown never fires. Lets an in-flight task keep its own pace while
/// idle, and only starts the countdown once the process actually asked to
/// stop (§5: a fixed grace window measured from the shutdown signal, not
/// from task start).
async fn wait_for_shutdown_grace(mut shutdown: tokio::sync::watch::Receiver<bool>, grace: Duration) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
    tokio::time::sleep(grace).await;
}

/// Exponential backoff with jitter: `base * 2^attempt`, +/- 20%.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(16));
    let jitter_frac = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((exp as f64 * jitter_frac) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let base = Duration::from_secs(1);
        for attempt in 0..4 {
            let d = backoff_delay(base, attempt);
            let expected = base.as_millis() as u64 * (1u64 << attempt);
            let lower = (expected as f64 * 0.79) as u64;
            let upper = (expected as f64 * 1.21) as u64;
            assert!(
                d.as_millis() as u64 >= lower && d.as_millis() as u64 <= upper,
                "attempt {attempt}: {d:?} not within [{lower}, {upper}]ms"
            );
        }
    }

    #[test]
    fn transient_kinds_are_retryable_permanent_are_not() {
        assert!(ProcessingError::DatabaseUnavailable("x".into()).is_retryable());
        assert!(ProcessingError::ProviderUnavailable("x".into()).is_retryable());
        assert!(ProcessingError::NetworkTimeout.is_retryable());
        assert!(ProcessingError::ConnectionError("x".into()).is_retryable());
        assert!(ProcessingError::RecoverableError("x".into()).is_retryable());

        assert!(!ProcessingError::InvalidApplicationId.is_retryable());
        assert!(!ProcessingError::ApplicationNotFound.is_retryable());
        assert!(!ProcessingError::ValidationError(vec![]).is_retryable());
        assert!(!ProcessingError::StateTransitionError("x".into()).is_retryable());
        assert!(!ProcessingError::UnsupportedCountry(Country::Spain).is_retryable());
        assert!(!ProcessingError::PermanentProviderError("x".into()).is_retryable());
    }
}
