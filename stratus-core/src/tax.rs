use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stratus_shared::money::{percent_of, round_money};
use uuid::Uuid;

use crate::repository::{CustomerRepository, TaxRuleRepository};
use crate::{CoreError, CoreResult};

/// A region-scoped tax rate. Matching rules are combined additively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxRule {
    pub id: i64,
    pub name: String,
    pub country: String,
    /// None applies to every state of the country.
    pub state: Option<String>,
    pub rate: Decimal,
    pub priority: i32,
    pub inclusive: bool,
    pub is_active: bool,
}

impl TaxRule {
    /// Whether the rule applies to an already normalized region.
    pub fn matches(&self, country: &str, state: &str) -> bool {
        if !self.is_active || !self.country.eq_ignore_ascii_case(country) {
            return false;
        }
        match self.state.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(rule_state) => rule_state.eq_ignore_ascii_case(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxBreakdown {
    pub amount: Decimal,
    pub rate: Decimal,
    pub inclusive: bool,
    pub rule_ids: Vec<i64>,
}

impl TaxBreakdown {
    pub fn none() -> Self {
        Self {
            amount: Decimal::ZERO,
            rate: Decimal::ZERO,
            inclusive: false,
            rule_ids: Vec::new(),
        }
    }
}

/// Upper-case country, trimmed state.
pub fn normalize_region(country: Option<&str>, state: Option<&str>) -> (String, String) {
    (
        country.unwrap_or_default().trim().to_uppercase(),
        state.unwrap_or_default().trim().to_string(),
    )
}

/// Tax owed on `amount` under the given matching rules. If any rule is
/// inclusive the amount is treated as tax-inclusive and the tax is backed out
/// of it; otherwise the tax is added on top.
pub fn compute_tax(amount: Decimal, rules: &[TaxRule]) -> TaxBreakdown {
    if amount <= Decimal::ZERO || rules.is_empty() {
        return TaxBreakdown::none();
    }

    let rate: Decimal = rules.iter().map(|r| r.rate).sum();
    if rate <= Decimal::ZERO {
        return TaxBreakdown::none();
    }
    let inclusive = rules.iter().any(|r| r.inclusive);

    let tax = if inclusive {
        amount - amount / (Decimal::ONE + rate / Decimal::ONE_HUNDRED)
    } else {
        percent_of(amount, rate)
    };

    TaxBreakdown {
        amount: round_money(tax),
        rate,
        inclusive,
        rule_ids: rules.iter().map(|r| r.id).collect(),
    }
}

/// Resolves a customer's region to tax rules and computes tax.
#[derive(Clone)]
pub struct TaxCalculator {
    customers: Arc<dyn CustomerRepository>,
    rules: Arc<dyn TaxRuleRepository>,
}

impl TaxCalculator {
    pub fn new(customers: Arc<dyn CustomerRepository>, rules: Arc<dyn TaxRuleRepository>) -> Self {
        Self { customers, rules }
    }

    /// Rules that apply to the customer; empty when the customer has no
    /// country on file.
    pub async fn rules_for_customer(&self, customer_id: Uuid) -> CoreResult<Vec<TaxRule>> {
        let customer = self
            .customers
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| CoreError::not_found("customer", customer_id))?;

        let (country, state) = normalize_region(customer.country.as_deref(), customer.state.as_deref());
        if country.is_empty() {
            return Ok(Vec::new());
        }
        self.rules.list_active_tax_rules(&country, &state).await
    }

    pub async fn calculate_for_customer(&self, customer_id: Uuid, amount: Decimal) -> CoreResult<Decimal> {
        Ok(self.breakdown_for_customer(customer_id, amount).await?.amount)
    }

    pub async fn breakdown_for_customer(&self, customer_id: Uuid, amount: Decimal) -> CoreResult<TaxBreakdown> {
        if amount <= Decimal::ZERO {
            return Ok(TaxBreakdown::none());
        }
        let rules = self.rules_for_customer(customer_id).await?;
        Ok(compute_tax(amount, &rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::Customer;

    fn rule(id: i64, country: &str, state: Option<&str>, rate: i64, inclusive: bool) -> TaxRule {
        TaxRule {
            id,
            name: format!("rule-{}", id),
            country: country.to_string(),
            state: state.map(str::to_string),
            rate: Decimal::new(rate, 0),
            priority: 0,
            inclusive,
            is_active: true,
        }
    }

    async fn calculator_with(customer: Customer, rules: Vec<TaxRule>) -> TaxCalculator {
        let store = Arc::new(MemoryStore::new());
        store.insert_customer(customer).await;
        for r in rules {
            store.insert_tax_rule(r).await;
        }
        TaxCalculator::new(store.clone(), store)
    }

    #[test]
    fn test_inclusive_backs_tax_out() {
        let tax = compute_tax(Decimal::new(110, 0), &[rule(1, "DE", None, 10, true)]);
        assert_eq!(tax.amount, Decimal::new(10, 0));
        assert!(tax.inclusive);
    }

    #[test]
    fn test_additive_tax() {
        let tax = compute_tax(Decimal::new(100, 0), &[rule(1, "DE", None, 10, false)]);
        assert_eq!(tax.amount, Decimal::new(10, 0));

        let tax = compute_tax(Decimal::new(55, 0), &[rule(1, "US", None, 10, false)]);
        assert_eq!(tax.amount, Decimal::new(550, 2));
    }

    #[test]
    fn test_rates_combine_and_round() {
        let rules = vec![rule(1, "US", None, 6, false), rule(2, "US", Some("CA"), 1, false)];
        let tax = compute_tax(Decimal::new(1999, 2), &rules);
        // 19.99 * 7% = 1.3993
        assert_eq!(tax.amount, Decimal::new(140, 2));
        assert_eq!(tax.rule_ids, vec![1, 2]);
    }

    #[test]
    fn test_zero_rate_and_non_positive_amount() {
        assert_eq!(compute_tax(Decimal::new(100, 0), &[rule(1, "US", None, 0, false)]).amount, Decimal::ZERO);
        assert_eq!(compute_tax(Decimal::ZERO, &[rule(1, "US", None, 10, false)]).amount, Decimal::ZERO);
        assert_eq!(compute_tax(Decimal::new(100, 0), &[]).amount, Decimal::ZERO);
    }

    #[test]
    fn test_rule_matching() {
        let statewide = rule(1, "US", None, 5, false);
        let california = rule(2, "us", Some("CA"), 1, false);
        assert!(statewide.matches("US", "NY"));
        assert!(california.matches("US", "ca"));
        assert!(!california.matches("US", "NY"));
        assert!(!statewide.matches("CA", ""));
    }

    #[tokio::test]
    async fn test_customer_region_is_normalized() {
        let customer = Customer::new("a@example.com", Some(" us "), Some(" CA "), "USD");
        let id = customer.id;
        let calculator = calculator_with(
            customer,
            vec![rule(1, "US", Some("CA"), 10, false), rule(2, "US", Some("NY"), 50, false)],
        )
        .await;

        let tax = calculator.calculate_for_customer(id, Decimal::new(100, 0)).await.unwrap();
        assert_eq!(tax, Decimal::new(10, 0));
    }

    #[tokio::test]
    async fn test_no_country_means_no_tax() {
        let customer = Customer::new("a@example.com", None, None, "USD");
        let id = customer.id;
        let calculator = calculator_with(customer, vec![rule(1, "US", None, 10, false)]).await;

        let tax = calculator.calculate_for_customer(id, Decimal::new(100, 0)).await.unwrap();
        assert_eq!(tax, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_non_positive_amount_skips_lookup() {
        let store = Arc::new(MemoryStore::new());
        let calculator = TaxCalculator::new(store.clone(), store);
        let tax = calculator.calculate_for_customer(Uuid::new_v4(), Decimal::ZERO).await.unwrap();
        assert_eq!(tax, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_customer_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let calculator = TaxCalculator::new(store.clone(), store);
        let err = calculator
            .calculate_for_customer(Uuid::new_v4(), Decimal::new(10, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "customer", .. }));
    }
}
