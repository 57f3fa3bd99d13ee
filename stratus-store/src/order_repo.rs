use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor};
use std::collections::HashMap;
use stratus_core::models::{Order, OrderItem, Service};
use stratus_core::repository::{
    Activation, ActivationFn, CancelFn, Cancellation, CheckoutFn, Checkout, OrderRepository, ServiceFn,
};
use stratus_core::{CoreError, CoreResult};
use tracing::info;
use uuid::Uuid;

use crate::billing_repo::{insert_invoice, lock_invoice, write_invoice};
use crate::cart_repo::lock_cart;
use crate::database::{db_err, PgStore};
use crate::rows::{OrderItemRow, OrderRow, ServiceRow};

const ORDER_COLUMNS: &str = "id, order_number, customer_id, invoice_id, currency, subtotal, discount, \
     tax_amount, total, coupon_code, ip_address, status, created_at, updated_at";

const ORDER_ITEM_COLUMNS: &str = "id, order_id, product_id, product_name, billing_cycle, quantity, \
     setup_fee, recurring_fee, discount, total, domain, hostname, config_options, service_id, created_at";

const SERVICE_COLUMNS: &str = "id, customer_id, order_id, order_item_id, product_id, product_name, \
     billing_cycle, quantity, recurring_amount, domain, hostname, config_options, status, \
     registration_date, next_due_date, terminated_at, created_at, updated_at";

async fn fetch_order_items<'e, E: PgExecutor<'e>>(exec: E, order_ids: &[Uuid]) -> CoreResult<Vec<OrderItem>> {
    let rows = sqlx::query_as::<_, OrderItemRow>(&format!(
        "SELECT {} FROM order_items WHERE order_id = ANY($1) ORDER BY seq",
        ORDER_ITEM_COLUMNS
    ))
    .bind(order_ids)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    Ok(rows.into_iter().map(OrderItem::from).collect())
}

async fn lock_order(conn: &mut PgConnection, id: Uuid) -> CoreResult<Option<Order>> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {} FROM orders WHERE id = $1 FOR UPDATE",
        ORDER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    match row {
        Some(row) => {
            let items = fetch_order_items(&mut *conn, &[id]).await?;
            row.into_order(items).map(Some)
        }
        None => Ok(None),
    }
}

async fn insert_order(conn: &mut PgConnection, order: &Order) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO orders (id, order_number, customer_id, invoice_id, currency, subtotal, discount,
                            tax_amount, total, coupon_code, ip_address, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(order.id)
    .bind(&order.order_number)
    .bind(order.customer_id)
    .bind(order.invoice_id)
    .bind(&order.currency)
    .bind(order.subtotal)
    .bind(order.discount)
    .bind(order.tax_amount)
    .bind(order.total)
    .bind(&order.coupon_code)
    .bind(&order.ip_address)
    .bind(order.status.as_str())
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    for item in &order.items {
        sqlx::query(
            r#"
            INSERT INTO order_items (id, order_id, product_id, product_name, billing_cycle, quantity,
                                     setup_fee, recurring_fee, discount, total, domain, hostname,
                                     config_options, service_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(item.id)
        .bind(item.order_id)
        .bind(item.product_id)
        .bind(&item.product_name)
        .bind(item.billing_cycle.as_str())
        .bind(item.quantity)
        .bind(item.setup_fee)
        .bind(item.recurring_fee)
        .bind(item.discount)
        .bind(item.total)
        .bind(&item.domain)
        .bind(&item.hostname)
        .bind(Json(&item.config_options))
        .bind(item.service_id)
        .bind(item.created_at)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn insert_service(conn: &mut PgConnection, service: &Service) -> CoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO services ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        SERVICE_COLUMNS
    ))
    .bind(service.id)
    .bind(service.customer_id)
    .bind(service.order_id)
    .bind(service.order_item_id)
    .bind(service.product_id)
    .bind(&service.product_name)
    .bind(service.billing_cycle.as_str())
    .bind(service.quantity)
    .bind(service.recurring_amount)
    .bind(&service.domain)
    .bind(&service.hostname)
    .bind(Json(&service.config_options))
    .bind(service.status.as_str())
    .bind(service.registration_date)
    .bind(service.next_due_date)
    .bind(service.terminated_at)
    .bind(service.created_at)
    .bind(service.updated_at)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn checkout(&self, cart_id: Uuid, build: CheckoutFn) -> CoreResult<Checkout> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let cart = lock_cart(&mut tx, cart_id)
            .await?
            .ok_or_else(|| CoreError::not_found("cart", cart_id))?;

        let checkout = build(cart)?;

        // Invoice first: the order row references it.
        insert_invoice(&mut tx, &checkout.invoice).await?;
        insert_order(&mut tx, &checkout.order).await?;

        if let Some(code) = checkout.order.coupon_code.as_deref() {
            let consumed = sqlx::query(
                "UPDATE coupons SET uses = uses + 1 WHERE code = upper($1) AND (max_uses IS NULL OR uses < max_uses)",
            )
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            if consumed.rows_affected() == 0 {
                return Err(CoreError::InvalidCoupon(format!("{} has no uses left", code)));
            }
        }

        sqlx::query("DELETE FROM carts WHERE id = $1")
            .bind(cart_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        info!(order_id = %checkout.order.id, order_number = %checkout.order.order_number, "Checkout committed");
        Ok(checkout)
    }

    async fn get_order(&self, id: Uuid) -> CoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => {
                let items = fetch_order_items(&self.pool, &[id]).await?;
                row.into_order(items).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list_orders(&self, customer_id: Uuid) -> CoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE customer_id = $1 ORDER BY created_at DESC",
            ORDER_COLUMNS
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for item in fetch_order_items(&self.pool, &ids).await? {
            items_by_order.entry(item.order_id).or_default().push(item);
        }

        rows.into_iter()
            .map(|row| {
                let items = items_by_order.remove(&row.id).unwrap_or_default();
                row.into_order(items)
            })
            .collect()
    }

    async fn activate_order(&self, order_id: Uuid, activate: ActivationFn) -> CoreResult<Activation> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let order = lock_order(&mut tx, order_id)
            .await?
            .ok_or_else(|| CoreError::not_found("order", order_id))?;

        let activation = activate(order)?;

        for service in &activation.services {
            insert_service(&mut tx, service).await?;
        }
        for item in &activation.order.items {
            if let Some(service_id) = item.service_id {
                sqlx::query("UPDATE order_items SET service_id = $2 WHERE id = $1")
                    .bind(item.id)
                    .bind(service_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }
        sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(order_id)
            .bind(activation.order.status.as_str())
            .bind(activation.order.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(activation)
    }

    async fn cancel_order(&self, order_id: Uuid, cancel: CancelFn) -> CoreResult<Cancellation> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Order before invoice; payments only ever lock the invoice.
        let order = lock_order(&mut tx, order_id)
            .await?
            .ok_or_else(|| CoreError::not_found("order", order_id))?;
        let invoice = match order.invoice_id {
            Some(invoice_id) => lock_invoice(&mut tx, invoice_id).await?,
            None => None,
        };

        let cancellation = cancel(order, invoice)?;

        sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(order_id)
            .bind(cancellation.order.status.as_str())
            .bind(cancellation.order.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if let Some(invoice) = &cancellation.invoice {
            write_invoice(&mut tx, invoice).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(cancellation)
    }

    async fn get_service(&self, id: Uuid) -> CoreResult<Option<Service>> {
        let row = sqlx::query_as::<_, ServiceRow>(&format!("SELECT {} FROM services WHERE id = $1", SERVICE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Service::try_from).transpose()
    }

    async fn update_service(&self, id: Uuid, change: ServiceFn) -> CoreResult<Service> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {} FROM services WHERE id = $1 FOR UPDATE",
            SERVICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let current = row
            .map(Service::try_from)
            .transpose()?
            .ok_or_else(|| CoreError::not_found("service", id))?;

        let service = change(current)?;

        sqlx::query(
            r#"
            UPDATE services
            SET status = $2, next_due_date = $3, terminated_at = $4, recurring_amount = $5,
                billing_cycle = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(service.status.as_str())
        .bind(service.next_due_date)
        .bind(service.terminated_at)
        .bind(service.recurring_amount)
        .bind(service.billing_cycle.as_str())
        .bind(service.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(service)
    }
}
