//! Coupon eligibility and per-line discount rules.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use stratus_core::models::{CartItem, Coupon, DiscountType};
use stratus_core::{CoreError, CoreResult};
use stratus_shared::money::{clamp_non_negative, percent_of, round_money};

/// Checks a looked-up coupon is usable at `now`.
pub fn validate_coupon(coupon: Option<Coupon>, code: &str, now: DateTime<Utc>) -> CoreResult<Coupon> {
    let coupon = coupon.ok_or_else(|| CoreError::InvalidCoupon(format!("{} does not exist", code)))?;

    if !coupon.is_active {
        return Err(CoreError::InvalidCoupon(format!("{} is not active", coupon.code)));
    }
    if matches!(coupon.starts_at, Some(start) if now < start) {
        return Err(CoreError::InvalidCoupon(format!("{} is not valid yet", coupon.code)));
    }
    if matches!(coupon.expires_at, Some(end) if now >= end) {
        return Err(CoreError::InvalidCoupon(format!("{} has expired", coupon.code)));
    }
    if coupon.is_exhausted() {
        return Err(CoreError::InvalidCoupon(format!("{} has no uses left", coupon.code)));
    }
    Ok(coupon)
}

/// Discount the coupon gives one line. Never exceeds the line's gross.
pub fn item_discount(coupon: &Coupon, item: &CartItem) -> Decimal {
    if !coupon.applies_to(item.product_id) {
        return Decimal::ZERO;
    }
    let gross = item.gross();
    let raw = match coupon.discount_type {
        DiscountType::Percentage => percent_of(gross, coupon.value),
        DiscountType::FixedAmount => coupon.value * Decimal::from(item.quantity),
    };
    clamp_non_negative(round_money(raw), gross)
}

/// Re-prices every line against the coupon, or clears discounts when None.
pub fn apply_coupon(coupon: Option<&Coupon>, items: &mut [CartItem]) {
    for item in items.iter_mut() {
        let discount = coupon.map(|c| item_discount(c, item)).unwrap_or(Decimal::ZERO);
        item.set_discount(discount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use stratus_core::BillingCycle;
    use uuid::Uuid;

    fn line(product_id: Uuid, quantity: i32, setup: i64, recurring: i64) -> CartItem {
        CartItem::new(
            Uuid::new_v4(),
            product_id,
            "Hosting".into(),
            BillingCycle::Monthly,
            quantity,
            Decimal::new(setup, 0),
            Decimal::new(recurring, 0),
            vec![],
        )
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let mut coupon = Coupon::new("spring", DiscountType::Percentage, Decimal::new(10, 0));
        assert_eq!(coupon.code, "SPRING");
        assert!(validate_coupon(Some(coupon.clone()), "SPRING", now).is_ok());

        coupon.starts_at = Some(now + Duration::days(1));
        assert!(matches!(validate_coupon(Some(coupon.clone()), "SPRING", now), Err(CoreError::InvalidCoupon(_))));

        coupon.starts_at = None;
        coupon.expires_at = Some(now - Duration::seconds(1));
        assert!(validate_coupon(Some(coupon.clone()), "SPRING", now).is_err());

        coupon.expires_at = None;
        coupon.max_uses = Some(2);
        coupon.uses = 2;
        assert!(validate_coupon(Some(coupon.clone()), "SPRING", now).is_err());

        coupon.uses = 0;
        coupon.is_active = false;
        assert!(validate_coupon(Some(coupon), "SPRING", now).is_err());

        assert!(validate_coupon(None, "NOPE", now).is_err());
    }

    #[test]
    fn test_percentage_discount() {
        let coupon = Coupon::new("TEN", DiscountType::Percentage, Decimal::new(10, 0));
        let item = line(Uuid::new_v4(), 2, 5, 20);
        // 10% of 50
        assert_eq!(item_discount(&coupon, &item), Decimal::new(5, 0));
    }

    #[test]
    fn test_fixed_discount_is_per_unit_and_capped() {
        let coupon = Coupon::new("FIVE", DiscountType::FixedAmount, Decimal::new(5, 0));
        assert_eq!(item_discount(&coupon, &line(Uuid::new_v4(), 3, 0, 10)), Decimal::new(15, 0));

        let big = Coupon::new("HUGE", DiscountType::FixedAmount, Decimal::new(500, 0));
        assert_eq!(item_discount(&big, &line(Uuid::new_v4(), 1, 0, 10)), Decimal::new(10, 0));
    }

    #[test]
    fn test_product_scope() {
        let scoped_to = Uuid::new_v4();
        let mut coupon = Coupon::new("VPS", DiscountType::Percentage, Decimal::new(50, 0));
        coupon.product_ids = vec![scoped_to];

        let mut items = vec![line(scoped_to, 1, 0, 10), line(Uuid::new_v4(), 1, 0, 10)];
        apply_coupon(Some(&coupon), &mut items);
        assert_eq!(items[0].discount, Decimal::new(5, 0));
        assert_eq!(items[0].total, Decimal::new(5, 0));
        assert_eq!(items[1].discount, Decimal::ZERO);

        apply_coupon(None, &mut items);
        assert_eq!(items[0].total, Decimal::new(10, 0));
    }
}
