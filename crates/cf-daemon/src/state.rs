//! Shared runtime state for cf-daemon.
//!
//! Every handler receives `State<Arc<AppState>>`; this module owns nothing
//! async itself beyond the broadcast sender all producers publish through.

use cf_config::Config;
use cf_schemas::ApplicationUpdateEvent;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc-backed) handle shared across all Axum handlers.
///
/// `updates` is the single `broadcast::Sender` constructed here and cloned
/// into the worker pool and webhook handler as producers; `cf-realtime`
/// subscribes a fresh receiver per WebSocket session independently, so
/// neither producer crate depends on cf-realtime.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub encryption_key: Arc<cf_crypto::EncryptionKey>,
    pub webhook_secret: Arc<Vec<u8>>,
    pub countries: Arc<cf_countries::CountryRegistry>,
    pub breakers: cf_breaker::BreakerRegistry,
    pub updates: broadcast::Sender<ApplicationUpdateEvent>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(config: &Config, pool: PgPool, updates: broadcast::Sender<ApplicationUpdateEvent>) -> anyhow::Result<Self> {
        let encryption_key = cf_crypto::EncryptionKey::from_bytes(config.encryption_key())?;
        let breakers = cf_breaker::BreakerRegistry::new(cf_breaker::BreakerConfig {
            failure_threshold: config.tunables.breaker_failure_threshold,
            recovery_timeout: config.tunables.breaker_recovery_timeout,
        });

        Ok(Self {
            pool,
            encryption_key: Arc::new(encryption_key),
            webhook_secret: Arc::new(config.webhook_secret().to_vec()),
            countries: Arc::new(cf_countries::CountryRegistry::standard()),
            breakers,
            updates,
            build: BuildInfo {
                service: "cf-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        })
    }
}
