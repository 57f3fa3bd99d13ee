use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor};
use stratus_core::models::{Cart, CartItem, CartOwner};
use stratus_core::repository::CartRepository;
use stratus_core::{CoreError, CoreResult};
use uuid::Uuid;

use crate::database::{db_err, PgStore};
use crate::rows::{CartItemRow, CartRow};

const CART_COLUMNS: &str = "id, customer_id, session_id, currency, coupon_code, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, cart_id, product_id, product_name, billing_cycle, quantity, setup_fee, \
     recurring_fee, discount, total, domain, hostname, config_options, created_at";

pub(crate) async fn fetch_cart_items<'e, E: PgExecutor<'e>>(exec: E, cart_id: Uuid) -> CoreResult<Vec<CartItem>> {
    let rows = sqlx::query_as::<_, CartItemRow>(&format!(
        "SELECT {} FROM cart_items WHERE cart_id = $1 ORDER BY seq",
        ITEM_COLUMNS
    ))
    .bind(cart_id)
    .fetch_all(exec)
    .await
    .map_err(db_err)?;

    Ok(rows.into_iter().map(CartItem::from).collect())
}

/// Loads the cart row `FOR UPDATE` plus its items inside `conn`'s transaction.
pub(crate) async fn lock_cart(conn: &mut PgConnection, cart_id: Uuid) -> CoreResult<Option<Cart>> {
    let row = sqlx::query_as::<_, CartRow>(&format!(
        "SELECT {} FROM carts WHERE id = $1 FOR UPDATE",
        CART_COLUMNS
    ))
    .bind(cart_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    match row {
        Some(row) => {
            let items = fetch_cart_items(&mut *conn, cart_id).await?;
            row.into_cart(items).map(Some)
        }
        None => Ok(None),
    }
}

async fn touch_cart(conn: &mut PgConnection, cart_id: Uuid) -> CoreResult<()> {
    sqlx::query("UPDATE carts SET updated_at = $2 WHERE id = $1")
        .bind(cart_id)
        .bind(Utc::now())
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn write_item_pricing(conn: &mut PgConnection, item: &CartItem) -> CoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE cart_items
        SET product_name = $2, billing_cycle = $3, quantity = $4, setup_fee = $5,
            recurring_fee = $6, discount = $7, total = $8, domain = $9, hostname = $10,
            config_options = $11
        WHERE id = $1
        "#,
    )
    .bind(item.id)
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
    .execute(conn)
    .await
    .map_err(db_err)?;

    Ok(result.rows_affected())
}

#[async_trait]
impl CartRepository for PgStore {
    async fn create_cart(&self, cart: &Cart) -> CoreResult<()> {
        let (customer_id, session_id) = match &cart.owner {
            CartOwner::Customer(id) => (Some(*id), None),
            CartOwner::Session(session) => (None, Some(session.as_str())),
        };

        sqlx::query(
            r#"
            INSERT INTO carts (id, customer_id, session_id, currency, coupon_code, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(cart.id)
        .bind(customer_id)
        .bind(session_id)
        .bind(&cart.currency)
        .bind(&cart.coupon_code)
        .bind(cart.created_at)
        .bind(cart.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_cart(&self, id: Uuid) -> CoreResult<Option<Cart>> {
        let row = sqlx::query_as::<_, CartRow>(&format!("SELECT {} FROM carts WHERE id = $1", CART_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => {
                let items = fetch_cart_items(&self.pool, id).await?;
                row.into_cart(items).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn get_cart_item(&self, item_id: Uuid) -> CoreResult<Option<CartItem>> {
        let row = sqlx::query_as::<_, CartItemRow>(&format!("SELECT {} FROM cart_items WHERE id = $1", ITEM_COLUMNS))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(CartItem::from))
    }

    async fn add_cart_item(&self, item: &CartItem) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM carts WHERE id = $1 FOR UPDATE")
            .bind(item.cart_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if locked.is_none() {
            return Err(CoreError::not_found("cart", item.cart_id));
        }

        sqlx::query(
            r#"
            INSERT INTO cart_items (id, cart_id, product_id, product_name, billing_cycle, quantity,
                                    setup_fee, recurring_fee, discount, total, domain, hostname,
                                    config_options, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(item.id)
        .bind(item.cart_id)
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
        .bind(item.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        touch_cart(&mut tx, item.cart_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn update_cart_item(&self, item: &CartItem) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if write_item_pricing(&mut tx, item).await? == 0 {
            return Err(CoreError::not_found("cart item", item.id));
        }
        touch_cart(&mut tx, item.cart_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn remove_cart_item(&self, item_id: Uuid) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let removed: Option<(Uuid,)> = sqlx::query_as("DELETE FROM cart_items WHERE id = $1 RETURNING cart_id")
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let (cart_id,) = removed.ok_or_else(|| CoreError::not_found("cart item", item_id))?;

        touch_cart(&mut tx, cart_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn save_cart_pricing(&self, cart_id: Uuid, coupon_code: Option<&str>, items: &[CartItem]) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query("UPDATE carts SET coupon_code = $2, updated_at = $3 WHERE id = $1")
            .bind(cart_id)
            .bind(coupon_code)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::not_found("cart", cart_id));
        }

        for item in items {
            write_item_pricing(&mut tx, item).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
