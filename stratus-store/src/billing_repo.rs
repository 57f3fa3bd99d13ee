use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgConnection;
use stratus_core::models::{
    CreditAdjustment, Customer, Gateway, GatewayWebhookLog, Invoice, PaymentRequest,
    PaymentRequestStatus, PaymentSubscription, Transaction, TransactionStatus,
};
use stratus_core::repository::{
    BillingRepository, CreditFn, CreditPayment, CreditPaymentFn, RefundFn, Settlement, SettlementFn,
};
use stratus_core::{CoreError, CoreResult};
use uuid::Uuid;

use crate::customer_repo::CUSTOMER_COLUMNS;
use crate::database::{db_err, PgStore};
use crate::rows::{
    CreditAdjustmentRow, CustomerRow, GatewayRow, InvoiceRow, PaymentRequestRow, SubscriptionRow,
    TransactionRow,
};

const INVOICE_COLUMNS: &str = "id, customer_id, order_id, currency, total, amount_paid, balance, status, \
     due_date, paid_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, customer_id, invoice_id, gateway_id, parent_transaction_id, \
     transaction_type, status, amount, fee, refunded_amount, currency, gateway_reference, description, \
     staff_id, created_at";

const ADJUSTMENT_COLUMNS: &str = "id, customer_id, amount, balance_before, balance_after, currency, reason, \
     invoice_id, transaction_id, staff_id, created_at";

const REQUEST_COLUMNS: &str = "id, customer_id, invoice_id, gateway_id, amount, currency, payment_token, \
     status, transaction_id, gateway_reference, error_message, expires_at, created_at, updated_at";

const GATEWAY_COLUMNS: &str = "id, name, slug, is_active, supports_recurring, settings, created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, customer_id, gateway_id, service_id, gateway_subscription_id, \
     amount, currency, billing_cycle, status, cancel_at_period_end, current_period_end, ended_at, \
     created_at, updated_at";

pub(crate) async fn insert_invoice(conn: &mut PgConnection, invoice: &Invoice) -> CoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO invoices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        INVOICE_COLUMNS
    ))
    .bind(invoice.id)
    .bind(invoice.customer_id)
    .bind(invoice.order_id)
    .bind(&invoice.currency)
    .bind(invoice.total)
    .bind(invoice.amount_paid)
    .bind(invoice.balance)
    .bind(invoice.status.as_str())
    .bind(invoice.due_date)
    .bind(invoice.paid_at)
    .bind(invoice.created_at)
    .bind(invoice.updated_at)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(crate) async fn write_invoice(conn: &mut PgConnection, invoice: &Invoice) -> CoreResult<()> {
    let updated = sqlx::query(
        r#"
        UPDATE invoices
        SET amount_paid = $2, balance = $3, status = $4, paid_at = $5, updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.amount_paid)
    .bind(invoice.balance)
    .bind(invoice.status.as_str())
    .bind(invoice.paid_at)
    .bind(invoice.updated_at)
    .execute(conn)
    .await
    .map_err(db_err)?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::not_found("invoice", invoice.id));
    }
    Ok(())
}

async fn insert_transaction(conn: &mut PgConnection, tx: &Transaction) -> CoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        TRANSACTION_COLUMNS
    ))
    .bind(tx.id)
    .bind(tx.customer_id)
    .bind(tx.invoice_id)
    .bind(tx.gateway_id)
    .bind(tx.parent_transaction_id)
    .bind(tx.transaction_type.as_str())
    .bind(tx.status.as_str())
    .bind(tx.amount)
    .bind(tx.fee)
    .bind(tx.refunded_amount)
    .bind(&tx.currency)
    .bind(&tx.gateway_reference)
    .bind(&tx.description)
    .bind(tx.staff_id)
    .bind(tx.created_at)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Adjustment row plus the customer's new balance.
async fn apply_adjustment(conn: &mut PgConnection, adjustment: &CreditAdjustment) -> CoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO credit_adjustments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        ADJUSTMENT_COLUMNS
    ))
    .bind(adjustment.id)
    .bind(adjustment.customer_id)
    .bind(adjustment.amount)
    .bind(adjustment.balance_before)
    .bind(adjustment.balance_after)
    .bind(&adjustment.currency)
    .bind(&adjustment.reason)
    .bind(adjustment.invoice_id)
    .bind(adjustment.transaction_id)
    .bind(adjustment.staff_id)
    .bind(adjustment.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    sqlx::query("UPDATE customers SET credit = $2 WHERE id = $1")
        .bind(adjustment.customer_id)
        .bind(adjustment.balance_after)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn lock_customer(conn: &mut PgConnection, id: Uuid) -> CoreResult<Customer> {
    let row = sqlx::query_as::<_, CustomerRow>(&format!(
        "SELECT {} FROM customers WHERE id = $1 FOR UPDATE",
        CUSTOMER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(db_err)?;

    row.map(Customer::from).ok_or_else(|| CoreError::not_found("customer", id))
}

pub(crate) async fn lock_invoice(conn: &mut PgConnection, id: Uuid) -> CoreResult<Option<Invoice>> {
    let row = sqlx::query_as::<_, InvoiceRow>(&format!(
        "SELECT {} FROM invoices WHERE id = $1 FOR UPDATE",
        INVOICE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(db_err)?;

    row.map(Invoice::try_from).transpose()
}

async fn lock_transaction(conn: &mut PgConnection, id: Uuid) -> CoreResult<Transaction> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {} FROM transactions WHERE id = $1 FOR UPDATE",
        TRANSACTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(db_err)?;

    row.map(Transaction::try_from)
        .transpose()?
        .ok_or_else(|| CoreError::not_found("transaction", id))
}

async fn lock_pending_refund(conn: &mut PgConnection, id: Uuid) -> CoreResult<Transaction> {
    let refund = lock_transaction(conn, id).await?;
    if refund.status != TransactionStatus::Pending {
        return Err(CoreError::InvalidTransition {
            from: refund.status.to_string(),
            to: TransactionStatus::Completed.to_string(),
        });
    }
    Ok(refund)
}

/// Conditional status change on a payment request; NotFound when the row is
/// missing, false when it was not in `from`.
async fn move_payment_request(
    pool: &sqlx::PgPool,
    id: Uuid,
    from: PaymentRequestStatus,
    to: PaymentRequestStatus,
    error_message: Option<&str>,
) -> CoreResult<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE payment_requests
        SET status = $2, error_message = COALESCE($3, error_message), updated_at = $4
        WHERE id = $1 AND status = $5
        "#,
    )
    .bind(id)
    .bind(to.as_str())
    .bind(error_message)
    .bind(Utc::now())
    .bind(from.as_str())
    .execute(pool)
    .await
    .map_err(db_err)?;
    if updated.rows_affected() > 0 {
        return Ok(true);
    }

    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM payment_requests WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    match exists {
        Some(_) => Ok(false),
        None => Err(CoreError::not_found("payment request", id)),
    }
}

#[async_trait]
impl BillingRepository for PgStore {
    async fn get_invoice(&self, id: Uuid) -> CoreResult<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Invoice::try_from).transpose()
    }

    async fn get_transaction(&self, id: Uuid) -> CoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Transaction::try_from).transpose()
    }

    async fn list_credit_adjustments(&self, customer_id: Uuid) -> CoreResult<Vec<CreditAdjustment>> {
        let rows = sqlx::query_as::<_, CreditAdjustmentRow>(&format!(
            "SELECT {} FROM credit_adjustments WHERE customer_id = $1 ORDER BY created_at DESC, id",
            ADJUSTMENT_COLUMNS
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(CreditAdjustment::from).collect())
    }

    async fn adjust_credit(&self, customer_id: Uuid, plan: CreditFn) -> CoreResult<CreditAdjustment> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let customer = lock_customer(&mut tx, customer_id).await?;

        let adjustment = plan(&customer)?;

        apply_adjustment(&mut tx, &adjustment).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(adjustment)
    }

    async fn pay_invoice_with_credit(
        &self,
        customer_id: Uuid,
        invoice_id: Uuid,
        plan: CreditPaymentFn,
    ) -> CoreResult<CreditPayment> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        // Customer before invoice, as everywhere else that takes both locks.
        let customer = lock_customer(&mut tx, customer_id).await?;
        let invoice = lock_invoice(&mut tx, invoice_id)
            .await?
            .ok_or_else(|| CoreError::not_found("invoice", invoice_id))?;

        let payment = plan(&customer, invoice)?;

        insert_transaction(&mut tx, &payment.transaction).await?;
        apply_adjustment(&mut tx, &payment.adjustment).await?;
        write_invoice(&mut tx, &payment.invoice).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(payment)
    }

    async fn record_refund(&self, original_id: Uuid, plan: RefundFn) -> CoreResult<Transaction> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let original = lock_transaction(&mut tx, original_id).await?;

        let refund = plan(&original)?;

        insert_transaction(&mut tx, &refund).await?;
        sqlx::query("UPDATE transactions SET refunded_amount = refunded_amount + $2 WHERE id = $1")
            .bind(original_id)
            .bind(refund.amount.abs())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(refund)
    }

    async fn complete_refund(&self, refund_id: Uuid, gateway_reference: &str) -> CoreResult<Transaction> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut refund = lock_pending_refund(&mut tx, refund_id).await?;

        refund.status = TransactionStatus::Completed;
        refund.gateway_reference = Some(gateway_reference.to_string());
        sqlx::query("UPDATE transactions SET status = $2, gateway_reference = $3 WHERE id = $1")
            .bind(refund.id)
            .bind(refund.status.as_str())
            .bind(&refund.gateway_reference)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(refund)
    }

    async fn release_refund(&self, refund_id: Uuid) -> CoreResult<Transaction> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        // Original before refund, the order record_refund takes them in.
        let parent_id: Option<(Option<Uuid>,)> =
            sqlx::query_as("SELECT parent_transaction_id FROM transactions WHERE id = $1")
                .bind(refund_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let parent_id = parent_id
            .ok_or_else(|| CoreError::not_found("transaction", refund_id))?
            .0;
        if let Some(parent_id) = parent_id {
            lock_transaction(&mut tx, parent_id).await?;
        }
        let mut refund = lock_pending_refund(&mut tx, refund_id).await?;

        refund.status = TransactionStatus::Failed;
        sqlx::query("UPDATE transactions SET status = $2 WHERE id = $1")
            .bind(refund.id)
            .bind(refund.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if let Some(parent_id) = parent_id {
            sqlx::query("UPDATE transactions SET refunded_amount = refunded_amount - $2 WHERE id = $1")
                .bind(parent_id)
                .bind(refund.amount.abs())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(refund)
    }

    async fn create_payment_request(&self, request: &PaymentRequest) -> CoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO payment_requests ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            REQUEST_COLUMNS
        ))
        .bind(request.id)
        .bind(request.customer_id)
        .bind(request.invoice_id)
        .bind(request.gateway_id)
        .bind(request.amount)
        .bind(&request.currency)
        .bind(&request.payment_token)
        .bind(request.status.as_str())
        .bind(request.transaction_id)
        .bind(&request.gateway_reference)
        .bind(&request.error_message)
        .bind(request.expires_at)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_payment_request(&self, id: Uuid) -> CoreResult<Option<PaymentRequest>> {
        let row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            "SELECT {} FROM payment_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(PaymentRequest::try_from).transpose()
    }

    async fn claim_payment_request(&self, id: Uuid) -> CoreResult<bool> {
        move_payment_request(
            &self.pool,
            id,
            PaymentRequestStatus::Pending,
            PaymentRequestStatus::Processing,
            None,
        )
        .await
    }

    async fn close_payment_request(
        &self,
        id: Uuid,
        from: PaymentRequestStatus,
        status: PaymentRequestStatus,
        error_message: Option<&str>,
    ) -> CoreResult<bool> {
        move_payment_request(&self.pool, id, from, status, error_message).await
    }

    async fn settle_payment_request(&self, id: Uuid, plan: SettlementFn) -> CoreResult<Settlement> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            "SELECT {} FROM payment_requests WHERE id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let request = row
            .map(PaymentRequest::try_from)
            .transpose()?
            .ok_or_else(|| CoreError::not_found("payment request", id))?;
        let invoice = match request.invoice_id {
            Some(invoice_id) => lock_invoice(&mut tx, invoice_id).await?,
            None => None,
        };

        let settlement = plan(request, invoice)?;

        insert_transaction(&mut tx, &settlement.transaction).await?;
        let req = &settlement.request;
        sqlx::query(
            r#"
            UPDATE payment_requests
            SET status = $2, transaction_id = $3, gateway_reference = $4, error_message = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(req.id)
        .bind(req.status.as_str())
        .bind(req.transaction_id)
        .bind(&req.gateway_reference)
        .bind(&req.error_message)
        .bind(req.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if let Some(invoice) = &settlement.invoice {
            write_invoice(&mut tx, invoice).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(settlement)
    }

    async fn get_gateway(&self, id: Uuid) -> CoreResult<Option<Gateway>> {
        let row = sqlx::query_as::<_, GatewayRow>(&format!("SELECT {} FROM gateways WHERE id = $1", GATEWAY_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(Gateway::from))
    }

    async fn get_gateway_by_slug(&self, slug: &str) -> CoreResult<Option<Gateway>> {
        let row = sqlx::query_as::<_, GatewayRow>(&format!("SELECT {} FROM gateways WHERE slug = $1", GATEWAY_COLUMNS))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(Gateway::from))
    }

    async fn create_subscription(&self, subscription: &PaymentSubscription) -> CoreResult<()> {
        let s = subscription;
        sqlx::query(&format!(
            "INSERT INTO payment_subscriptions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(s.id)
        .bind(s.customer_id)
        .bind(s.gateway_id)
        .bind(s.service_id)
        .bind(&s.gateway_subscription_id)
        .bind(s.amount)
        .bind(&s.currency)
        .bind(s.billing_cycle.as_str())
        .bind(s.status.as_str())
        .bind(s.cancel_at_period_end)
        .bind(s.current_period_end)
        .bind(s.ended_at)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> CoreResult<Option<PaymentSubscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM payment_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(PaymentSubscription::try_from).transpose()
    }

    async fn update_subscription(&self, subscription: &PaymentSubscription) -> CoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE payment_subscriptions
            SET status = $2, cancel_at_period_end = $3, current_period_end = $4, ended_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.status.as_str())
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.current_period_end)
        .bind(subscription.ended_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(CoreError::not_found("subscription", subscription.id));
        }
        Ok(())
    }

    async fn record_gateway_webhook(&self, log: &GatewayWebhookLog) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO gateway_webhook_logs (id, gateway_id, payload, status, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(log.id)
        .bind(log.gateway_id)
        .bind(&log.payload)
        .bind(&log.status)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
