//! Per-(country, provider) circuit breaker registry (§4.3).
//!
//! Pure state-transition logic lives in [`decide`]; [`BreakerRegistry`] wraps
//! it behind a mutex-guarded concurrent map, one breaker instance per key,
//! exactly as the spec requires ("Circuit-breaker state is exclusively owned
//! by the C3 registry", §3). State is per-process in-memory by design (§9
//! design notes): a cluster-wide breaker would add its own coordination
//! failure mode for no benefit, since the failure it protects against
//! (provider outage) is itself cluster-wide and independent local detection
//! converges quickly.

use cf_schemas::{BankingData, Country, Money};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerPhase {
    /// Metric encoding per §4.3: 0/1/2 for closed/open/half-open.
    pub fn as_metric(self) -> u8 {
        match self {
            BreakerPhase::Closed => 0,
            BreakerPhase::Open => 1,
            BreakerPhase::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerState {
    pub phase: BreakerPhase,
    pub consecutive_failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// True while a half-open probe call is in flight; prevents two
    /// concurrent callers from both being admitted as "the" probe.
    probe_in_flight: bool,
    pub circuit_open_count: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            consecutive_failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
            circuit_open_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// What the caller should do, decided purely from config + state + now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the real call.
    Admit,
    /// Proceed with the real call as the exclusive half-open probe.
    AdmitProbe,
    /// Do not call the provider; use the fallback artifact.
    ShortCircuit,
}

/// Decide whether a call should be admitted, transitioning `state` in place
/// for the `Open -> HalfOpen` case (admitting the probe is itself a state
/// change per §4.3's table). Pure aside from the `now` input.
fn decide_admission(cfg: &BreakerConfig, state: &mut BreakerState, now: DateTime<Utc>) -> Admission {
    match state.phase {
        BreakerPhase::Closed => Admission::Admit,
        BreakerPhase::HalfOpen => {
            if state.probe_in_flight {
                // Another caller already holds the single admitted probe;
                // treat as still-open until it resolves.
                state.circuit_open_count += 1;
                Admission::ShortCircuit
            } else {
                state.probe_in_flight = true;
                Admission::AdmitProbe
            }
        }
        BreakerPhase::Open => {
            let opened_at = state.opened_at.unwrap_or(now);
            let elapsed = now.signed_duration_since(opened_at);
            let recovery = chrono::Duration::from_std(cfg.recovery_timeout).unwrap_or_default();
            if elapsed >= recovery {
                state.phase = BreakerPhase::HalfOpen;
                state.probe_in_flight = true;
                Admission::AdmitProbe
            } else {
                state.circuit_open_count += 1;
                Admission::ShortCircuit
            }
        }
    }
}

/// Apply the outcome of an admitted call, per §4.3's transition table.
fn record_outcome(cfg: &BreakerConfig, state: &mut BreakerState, success: bool, now: DateTime<Utc>) {
    state.probe_in_flight = false;
    match (state.phase, success) {
        (BreakerPhase::Closed, true) => {
            state.consecutive_failure_count = 0;
        }
        (BreakerPhase::Closed, false) => {
            state.consecutive_failure_count += 1;
            if state.consecutive_failure_count >= cfg.failure_threshold {
                state.phase = BreakerPhase::Open;
                state.opened_at = Some(now);
            }
        }
        (BreakerPhase::HalfOpen, true) => {
            state.phase = BreakerPhase::Closed;
            state.consecutive_failure_count = 0;
            state.opened_at = None;
        }
        (BreakerPhase::HalfOpen, false) => {
            state.phase = BreakerPhase::Open;
            state.opened_at = Some(now);
        }
        (BreakerPhase::Open, _) => {
            // Only reachable if a caller records an outcome for a call that
            // was never admitted; ignore rather than corrupt state.
        }
    }
}

/// The conservative fallback artifact returned when the breaker is open
/// (§4.3). Downstream evaluation must tend toward UNDER_REVIEW.
pub fn fallback_artifact() -> BankingData {
    BankingData {
        provider_name: "(FALLBACK — Circuit Open)".to_string(),
        credit_score: 500,
        total_debt: Money::parse("50000.00").expect("valid literal"),
        monthly_obligations: Money::parse("2000.00").expect("valid literal"),
        has_defaults: false,
        additional_data: json!({ "fallback": true }),
    }
}

type BreakerKey = (Country, String);

/// Concurrent map of breaker instances, one per (country, provider).
#[derive(Clone)]
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: Arc<Mutex<HashMap<BreakerKey, BreakerState>>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wrap a provider call. `fallback` is invoked only when the breaker
    /// short-circuits; `call` is invoked when admitted (normal or probe).
    /// Bounded short-circuit latency (§8: <= 5ms) falls out naturally since
    /// the short-circuit path never awaits I/O.
    pub async fn call<F, Fut, E>(
        &self,
        country: Country,
        provider: &str,
        call: F,
        fallback: impl FnOnce() -> BankingData,
    ) -> Result<BankingData, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BankingData, E>>,
    {
        let key = (country, provider.to_string());
        let now = Utc::now();

        let admission = {
            let mut map = self.breakers.lock().await;
            let state = map.entry(key.clone()).or_default();
            decide_admission(&self.cfg, state, now)
        };

        match admission {
            Admission::ShortCircuit => Ok(fallback()),
            Admission::Admit | Admission::AdmitProbe => {
                let result = call().await;
                let mut map = self.breakers.lock().await;
                let state = map.entry(key).or_default();
                record_outcome(&self.cfg, state, result.is_ok(), Utc::now());
                result
            }
        }
    }

    pub async fn snapshot(&self, country: Country, provider: &str) -> BreakerState {
        let map = self.breakers.lock().await;
        map.get(&(country, provider.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot_all(&self) -> Vec<(Country, String, BreakerState)> {
        let map = self.breakers.lock().await;
        map.iter()
            .map(|((c, p), s)| (*c, p.clone(), s.clone()))
            .collect()
    }

    pub async fn force_close(&self, country: Country, provider: &str) {
        let mut map = self.breakers.lock().await;
        map.insert((country, provider.to_string()), BreakerState::default());
    }

    pub async fn force_open(&self, country: Country, provider: &str) {
        let mut map = self.breakers.lock().await;
        let state = map.entry((country, provider.to_string())).or_default();
        state.phase = BreakerPhase::Open;
        state.opened_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_schemas::Country;

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    async fn always_fail() -> Result<BankingData, &'static str> {
        Err("provider down")
    }

    async fn always_ok() -> Result<BankingData, &'static str> {
        Ok(BankingData {
            provider_name: "real".to_string(),
            credit_score: 720,
            total_debt: Money::zero(),
            monthly_obligations: Money::zero(),
            has_defaults: false,
            additional_data: json!({}),
        })
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let reg = BreakerRegistry::new(cfg());
        for _ in 0..3 {
            let _ = reg
                .call(Country::Spain, "scorer", || always_fail(), fallback_artifact)
                .await;
        }
        let snap = reg.snapshot(Country::Spain, "scorer").await;
        assert_eq!(snap.phase, BreakerPhase::Open);
    }

    #[tokio::test]
    async fn short_circuits_without_calling_provider_while_open() {
        let reg = BreakerRegistry::new(cfg());
        for _ in 0..3 {
            let _ = reg
                .call(Country::Spain, "scorer", || always_fail(), fallback_artifact)
                .await;
        }
        let result = reg
            .call(Country::Spain, "scorer", || always_ok(), fallback_artifact)
            .await
            .unwrap();
        assert!(result.is_fallback());
        let snap = reg.snapshot(Country::Spain, "scorer").await;
        assert_eq!(snap.circuit_open_count, 1);
    }

    #[tokio::test]
    async fn admits_single_probe_after_recovery_timeout() {
        let reg = BreakerRegistry::new(cfg());
        for _ in 0..3 {
            let _ = reg
                .call(Country::Spain, "scorer", || always_fail(), fallback_artifact)
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = reg
            .call(Country::Spain, "scorer", || always_ok(), fallback_artifact)
            .await
            .unwrap();
        assert!(!result.is_fallback(), "probe call should reach the provider");
        let snap = reg.snapshot(Country::Spain, "scorer").await;
        assert_eq!(snap.phase, BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let reg = BreakerRegistry::new(cfg());
        for _ in 0..3 {
            let _ = reg
                .call(Country::Spain, "scorer", || always_fail(), fallback_artifact)
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = reg
            .call(Country::Spain, "scorer", || always_fail(), fallback_artifact)
            .await;
        let snap = reg.snapshot(Country::Spain, "scorer").await;
        assert_eq!(snap.phase, BreakerPhase::Open);
    }

    #[tokio::test]
    async fn distinct_providers_are_isolated() {
        let reg = BreakerRegistry::new(cfg());
        for _ in 0..3 {
            let _ = reg
                .call(Country::Spain, "scorer", || always_fail(), fallback_artifact)
                .await;
        }
        let other = reg.snapshot(Country::Mexico, "scorer").await;
        assert_eq!(other.phase, BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn force_close_resets_state() {
        let reg = BreakerRegistry::new(cfg());
        reg.force_open(Country::Spain, "scorer").await;
        reg.force_close(Country::Spain, "scorer").await;
        let snap = reg.snapshot(Country::Spain, "scorer").await;
        assert_eq!(snap.phase, BreakerPhase::Closed);
    }
}
