use async_trait::async_trait;
use stratus_core::models::Customer;
use stratus_core::repository::{CustomerRepository, TaxRuleRepository};
use stratus_core::tax::TaxRule;
use stratus_core::CoreResult;
use uuid::Uuid;

use crate::database::{db_err, PgStore};
use crate::rows::{CustomerRow, TaxRuleRow};

pub(crate) const CUSTOMER_COLUMNS: &str = "id, email, country, state, currency, credit, created_at";

#[async_trait]
impl CustomerRepository for PgStore {
    async fn get_customer(&self, id: Uuid) -> CoreResult<Option<Customer>> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {} FROM customers WHERE id = $1",
            CUSTOMER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Customer::from))
    }
}

#[async_trait]
impl TaxRuleRepository for PgStore {
    async fn list_active_tax_rules(&self, country: &str, state: &str) -> CoreResult<Vec<TaxRule>> {
        let rows = sqlx::query_as::<_, TaxRuleRow>(
            r#"
            SELECT id, name, country, state, rate, priority, inclusive, is_active
            FROM tax_rules
            WHERE is_active
              AND upper(country) = upper($1)
              AND (state IS NULL OR trim(state) = '' OR upper(trim(state)) = upper($2))
            ORDER BY priority DESC, id ASC
            "#,
        )
        .bind(country)
        .bind(state)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(TaxRule::from).collect())
    }
}
