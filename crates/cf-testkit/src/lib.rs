//! Postgres-backed fixtures for scenario and integration tests.
//!
//! Mirrors the teacher's testkit shape: plain loader/factory functions
//! rather than a builder framework, each named after the row it produces.
//! Tests that need a live database read `CF_TEST_DATABASE_URL` themselves
//! via [`connect`] — this crate never falls back to a default connection
//! string, so a missing env var fails the test loudly instead of silently
//! pointing at a developer's local database.

use anyhow::{Context, Result};
use cf_crypto::EncryptionKey;
use cf_db::NewApplication;
use cf_schemas::{Country, Money};
use sqlx::PgPool;
use uuid::Uuid;

pub const ENV_TEST_DATABASE_URL: &str = "CF_TEST_DATABASE_URL";

/// Connect to the scenario database and run migrations. Panics with a
/// clear message if `CF_TEST_DATABASE_URL` is unset — scenario tests are
/// expected to be skipped or run under a harness that sets it, not to
/// degrade to an in-memory stand-in.
pub async fn connect() -> Result<PgPool> {
    let url = std::env::var(ENV_TEST_DATABASE_URL)
        .with_context(|| format!("missing {ENV_TEST_DATABASE_URL}; scenario tests need a scratch Postgres database"))?;
    let pool = cf_db::connect(&url, 5).await?;
    cf_db::migrate(&pool).await?;
    cf_lock::migrate(&pool).await?;
    Ok(pool)
}

/// A fixed, valid 32-byte test key. Never used outside test binaries.
pub fn test_encryption_key() -> EncryptionKey {
    EncryptionKey::from_bytes(&[7u8; 32]).expect("32 bytes satisfies the minimum key length")
}

/// A `NewApplication` with sane defaults for Spain, overridable field by
/// field by the caller before insertion.
pub fn new_application_fixture() -> NewApplication {
    NewApplication {
        country: Country::Spain,
        full_name: "Test Applicant".to_string(),
        identity_document: format!("TESTDOC-{}", Uuid::new_v4()),
        requested_amount: Money::parse("15000.00").expect("valid literal"),
        monthly_income: Money::parse("3500.00").expect("valid literal"),
        currency: "EUR".to_string(),
        idempotency_key: None,
        country_specific_data: serde_json::json!({}),
        created_by: "testkit".to_string(),
        source: "testkit".to_string(),
    }
}

/// Insert a fixture application with the fixed test key, returning the
/// persisted row.
pub async fn insert_test_application(
    pool: &PgPool,
    key: &EncryptionKey,
    new: NewApplication,
) -> Result<cf_db::Application> {
    cf_db::insert_application(pool, key, new)
        .await
        .map_err(|e| anyhow::anyhow!(e))
}

/// Insert a fixture application for each of the six supported countries,
/// useful for scenario tests that exercise the country registry end to end.
pub async fn insert_one_application_per_country(
    pool: &PgPool,
    key: &EncryptionKey,
) -> Result<Vec<cf_db::Application>> {
    let mut out = Vec::with_capacity(Country::ALL.len());
    for country in Country::ALL {
        let mut fixture = new_application_fixture();
        fixture.country = country;
        fixture.currency = country.canonical_currency().to_string();
        out.push(insert_test_application(pool, key, fixture).await?);
    }
    Ok(out)
}

/// Truncate every domain table, leaving schema and sequences intact.
/// Scenario tests call this between cases instead of standing up a fresh
/// database per test.
pub async fn truncate_all(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "truncate table applications, audit_logs, pending_jobs, webhook_events, failed_jobs, distributed_locks restart identity cascade",
    )
    .execute(pool)
    .await
    .context("truncate_all failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_application_parses_with_valid_money_literals() {
        let fixture = new_application_fixture();
        assert_eq!(fixture.country, Country::Spain);
        assert_eq!(fixture.currency, "EUR");
    }

    #[test]
    fn test_encryption_key_round_trips() {
        let key = test_encryption_key();
        let ciphertext = key.encrypt_str("hello").unwrap();
        assert_eq!(key.decrypt_to_string(&ciphertext).unwrap(), "hello");
    }
}
