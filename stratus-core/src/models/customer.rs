use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The slice of a customer account the billing core reads: tax region and
/// the running credit balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub country: Option<String>,
    pub state: Option<String>,
    pub currency: String,
    pub credit: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(email: &str, country: Option<&str>, state: Option<&str>, currency: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            country: country.map(str::to_string),
            state: state.map(str::to_string),
            currency: currency.to_string(),
            credit: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }
}
