//! Country strategy registry (§4.2): one [`CountryStrategy`] per [`Country`],
//! resolved by table lookup at process start (`CountryRegistry::standard`).
//! Mirrors the provider trait-object boundary pattern (object-safe,
//! `Send + Sync`, `Box<dyn Trait>` held by callers) without the async I/O
//! shape, since `fetch_banking_data` here is wrapped by the breaker rather
//! than called directly.

use cf_schemas::{Application, BankingData, Country, Money, Recommendation, ValidationResult};
use std::collections::HashMap;
use std::fmt;

/// Error from a document validation or banking-data fetch that callers must
/// not retry automatically — only `StrategyError::Transient` participates in
/// the circuit breaker's failure counting as a "failure".
#[derive(Debug)]
pub enum StrategyError {
    Transient(String),
    Permanent(String),
}

impl fmt::Display for StrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyError::Transient(msg) => write!(f, "transient provider error: {msg}"),
            StrategyError::Permanent(msg) => write!(f, "permanent provider error: {msg}"),
        }
    }
}

impl std::error::Error for StrategyError {}

/// Per-country evaluation capability (§4.2). Implementations must be
/// `Send + Sync` so a single registry instance can be shared across worker
/// tasks.
pub trait CountryStrategy: Send + Sync {
    fn country(&self) -> Country;

    /// Synchronous, pure, no I/O.
    fn validate_document(&self, document: &str) -> ValidationResult;

    /// May call a remote provider in a real deployment; the worker wraps
    /// this call with the circuit breaker (§4.3), so implementations should
    /// propagate failures rather than swallow them.
    fn fetch_banking_data(
        &self,
        document: &str,
        full_name: &str,
    ) -> Result<BankingData, StrategyError>;

    /// Pure. Returns a recommendation, a fixed-point score in [0, 100], and
    /// human-readable notes for the audit trail.
    fn evaluate(
        &self,
        application: &Application,
        banking: &BankingData,
    ) -> (Recommendation, Money, Vec<String>);
}

/// Scoring shared by every concrete strategy (§4.2 does not distinguish
/// evaluation logic per country, only document validation and the data
/// source). Credit score is mapped linearly to the [0, 100] risk_score
/// scale; defaults and a debt-to-income ratio above 50% force REJECT/REVIEW
/// regardless of score.
fn standard_evaluate(
    application: &Application,
    banking: &BankingData,
) -> (Recommendation, Money, Vec<String>) {
    let mut notes = Vec::new();
    let score = Money::from_decimal(rust_decimal::Decimal::from(banking.credit_score) / rust_decimal::Decimal::from(10))
        .expect("credit_score / 10 always fits the declared precision");

    if banking.has_defaults {
        notes.push("applicant has recorded defaults".to_string());
        return (Recommendation::Reject, score, notes);
    }

    let monthly_income = application.monthly_income.as_decimal();
    let debt_to_income = if monthly_income.is_zero() {
        rust_decimal::Decimal::MAX
    } else {
        (banking.monthly_obligations.as_decimal()) / monthly_income
    };

    if banking.is_fallback() {
        notes.push("evaluated against fallback banking data (circuit open)".to_string());
        return (Recommendation::Review, score, notes);
    }

    if banking.credit_score >= 600 && debt_to_income <= rust_decimal::Decimal::new(50, 2) {
        notes.push(format!("credit_score={} meets approval threshold", banking.credit_score));
        (Recommendation::Approve, score, notes)
    } else if banking.credit_score < 450 {
        notes.push(format!("credit_score={} below rejection threshold", banking.credit_score));
        (Recommendation::Reject, score, notes)
    } else {
        notes.push("borderline score or elevated debt-to-income ratio".to_string());
        (Recommendation::Review, score, notes)
    }
}

/// Spain. Document format: 8 digits followed by one control letter (DNI),
/// or one leading X/Y/Z followed by 7 digits and a control letter (NIE).
pub struct SpainStrategy;

impl CountryStrategy for SpainStrategy {
    fn country(&self) -> Country {
        Country::Spain
    }

    fn validate_document(&self, document: &str) -> ValidationResult {
        let doc = document.trim().to_uppercase();
        let chars: Vec<char> = doc.chars().collect();
        if chars.len() != 9 {
            return ValidationResult::invalid(vec!["document must be 9 characters (DNI/NIE)".to_string()]);
        }
        let (digits, letter) = if chars[0].is_ascii_digit() {
            (&chars[0..8], chars[8])
        } else if matches!(chars[0], 'X' | 'Y' | 'Z') {
            (&chars[1..8], chars[8])
        } else {
            return ValidationResult::invalid(vec!["document must start with a digit or X/Y/Z".to_string()]);
        };
        if !digits.iter().all(|c| c.is_ascii_digit()) {
            return ValidationResult::invalid(vec!["document body must be numeric".to_string()]);
        }
        if !letter.is_ascii_alphabetic() {
            return ValidationResult::invalid(vec!["document must end with a control letter".to_string()]);
        }
        ValidationResult::ok()
    }

    fn fetch_banking_data(&self, _document: &str, _full_name: &str) -> Result<BankingData, StrategyError> {
        // Real deployment calls out to a scoring bureau; test doubles and
        // the worker's provider client substitute for this at the seam.
        Err(StrategyError::Transient(
            "no banking provider configured".to_string(),
        ))
    }

    fn evaluate(&self, application: &Application, banking: &BankingData) -> (Recommendation, Money, Vec<String>) {
        standard_evaluate(application, banking)
    }
}

macro_rules! digits_only_strategy {
    ($name:ident, $country:expr, $expected_len:expr, $label:expr) => {
        pub struct $name;

        impl CountryStrategy for $name {
            fn country(&self) -> Country {
                $country
            }

            fn validate_document(&self, document: &str) -> ValidationResult {
                let doc = document.trim();
                if doc.len() != $expected_len || !doc.chars().all(|c| c.is_ascii_digit()) {
                    return ValidationResult::invalid(vec![format!(
                        "{} must be exactly {} digits",
                        $label, $expected_len
                    )]);
                }
                ValidationResult::ok()
            }

            fn fetch_banking_data(&self, _document: &str, _full_name: &str) -> Result<BankingData, StrategyError> {
                Err(StrategyError::Transient(
                    "no banking provider configured".to_string(),
                ))
            }

            fn evaluate(&self, application: &Application, banking: &BankingData) -> (Recommendation, Money, Vec<String>) {
                standard_evaluate(application, banking)
            }
        }
    };
}

digits_only_strategy!(MexicoStrategy, Country::Mexico, 18, "CURP");
digits_only_strategy!(ColombiaStrategy, Country::Colombia, 10, "cedula");
digits_only_strategy!(PeruStrategy, Country::Peru, 8, "DNI");
digits_only_strategy!(ChileStrategy, Country::Chile, 9, "RUT");
digits_only_strategy!(BrazilStrategy, Country::Brazil, 11, "CPF");

/// Table-lookup registry (§4.2: "Registration is by table lookup at process
/// start"). Unknown country lookups are the caller's responsibility to
/// reject as a permanent error.
pub struct CountryRegistry {
    strategies: HashMap<Country, Box<dyn CountryStrategy>>,
}

impl CountryRegistry {
    pub fn standard() -> Self {
        let mut strategies: HashMap<Country, Box<dyn CountryStrategy>> = HashMap::new();
        strategies.insert(Country::Spain, Box::new(SpainStrategy));
        strategies.insert(Country::Mexico, Box::new(MexicoStrategy));
        strategies.insert(Country::Colombia, Box::new(ColombiaStrategy));
        strategies.insert(Country::Peru, Box::new(PeruStrategy));
        strategies.insert(Country::Chile, Box::new(ChileStrategy));
        strategies.insert(Country::Brazil, Box::new(BrazilStrategy));
        Self { strategies }
    }

    pub fn lookup(&self, country: Country) -> Option<&dyn CountryStrategy> {
        self.strategies.get(&country).map(|b| b.as_ref())
    }
}

impl Default for CountryRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_schemas::ApplicationStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_application(monthly_income: &str) -> Application {
        Application {
            id: Uuid::new_v4(),
            country: Country::Spain,
            full_name_ciphertext: vec![],
            identity_document_ciphertext: vec![],
            requested_amount: Money::parse("15000.00").unwrap(),
            monthly_income: Money::parse(monthly_income).unwrap(),
            currency: "EUR".to_string(),
            idempotency_key: None,
            status: ApplicationStatus::Validating,
            country_specific_data: json!({}),
            banking_data: json!({}),
            risk_score: None,
            validation_errors: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn banking(credit_score: i32, has_defaults: bool) -> BankingData {
        BankingData {
            provider_name: "test-provider".to_string(),
            credit_score,
            total_debt: Money::parse("1000.00").unwrap(),
            monthly_obligations: Money::parse("500.00").unwrap(),
            has_defaults,
            additional_data: json!({}),
        }
    }

    #[test]
    fn spain_valid_dni_passes() {
        assert!(SpainStrategy.validate_document("12345678Z").valid);
    }

    #[test]
    fn spain_valid_nie_passes() {
        assert!(SpainStrategy.validate_document("X1234567L").valid);
    }

    #[test]
    fn spain_rejects_wrong_length() {
        assert!(!SpainStrategy.validate_document("1234567Z").valid);
    }

    #[test]
    fn registry_resolves_spain() {
        let registry = CountryRegistry::standard();
        assert!(registry.lookup(Country::Spain).is_some());
    }

    #[test]
    fn registry_has_no_entry_for_unmapped_country() {
        // All six spec countries are mapped; this asserts the map is
        // exactly that size rather than silently wider.
        let registry = CountryRegistry::standard();
        assert_eq!(registry.strategies.len(), 6);
    }

    #[test]
    fn high_credit_score_low_dti_recommends_approve() {
        let app = sample_application("3500.00");
        let (rec, _, _) = standard_evaluate(&app, &banking(720, false));
        assert_eq!(rec, Recommendation::Approve);
    }

    #[test]
    fn low_credit_score_recommends_reject() {
        let app = sample_application("3500.00");
        let (rec, _, _) = standard_evaluate(&app, &banking(400, false));
        assert_eq!(rec, Recommendation::Reject);
    }

    #[test]
    fn defaults_force_reject_regardless_of_score() {
        let app = sample_application("3500.00");
        let (rec, _, _) = standard_evaluate(&app, &banking(800, true));
        assert_eq!(rec, Recommendation::Reject);
    }

    #[test]
    fn fallback_banking_data_forces_review() {
        let app = sample_application("3500.00");
        let mut b = banking(720, false);
        b.additional_data = json!({ "fallback": true });
        let (rec, _, _) = standard_evaluate(&app, &b);
        assert_eq!(rec, Recommendation::Review);
    }

    #[test]
    fn borderline_score_recommends_review() {
        let app = sample_application("3500.00");
        let (rec, _, _) = standard_evaluate(&app, &banking(520, false));
        assert_eq!(rec, Recommendation::Review);
    }
}
