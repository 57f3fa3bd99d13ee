use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;
use crate::billing_cycle::BillingCycle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Unpaid,
    Paid,
    Cancelled,
}

text_enum!(InvoiceStatus {
    Unpaid => "unpaid",
    Paid => "paid",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub order_id: Option<Uuid>,
    pub currency: String,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub balance: Decimal,
    pub status: InvoiceStatus,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn new(customer_id: Uuid, order_id: Option<Uuid>, currency: &str, total: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            order_id,
            currency: currency.to_string(),
            total,
            amount_paid: Decimal::ZERO,
            balance: total,
            status: InvoiceStatus::Unpaid,
            due_date: now,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a payment against the invoice. Once the balance reaches zero the
    /// invoice is paid and the balance is pinned at exactly zero. Returns true
    /// when this payment flipped the invoice to paid.
    pub fn apply_payment(&mut self, amount: Decimal, at: DateTime<Utc>) -> bool {
        self.amount_paid += amount;
        self.balance = self.total - self.amount_paid;
        self.updated_at = at;

        if self.balance <= Decimal::ZERO && self.status != InvoiceStatus::Paid {
            self.balance = Decimal::ZERO;
            self.status = InvoiceStatus::Paid;
            self.paid_at = Some(at);
            return true;
        }
        if self.balance < Decimal::ZERO {
            self.balance = Decimal::ZERO;
        }
        false
    }

    pub fn is_payable(&self) -> bool {
        self.status == InvoiceStatus::Unpaid
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Payment,
    Credit,
    Refund,
}

text_enum!(TransactionType {
    Payment => "payment",
    Credit => "credit",
    Refund => "refund",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

text_enum!(TransactionStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

/// Append-only ledger entry. Refunds carry a negative amount and point at the
/// transaction they refund; the original tracks the running refunded total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub gateway_id: Option<Uuid>,
    pub parent_transaction_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub fee: Decimal,
    pub refunded_amount: Decimal,
    pub currency: String,
    pub gateway_reference: Option<String>,
    pub description: Option<String>,
    pub staff_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn payment(customer_id: Uuid, amount: Decimal, currency: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            invoice_id: None,
            gateway_id: None,
            parent_transaction_id: None,
            transaction_type: TransactionType::Payment,
            status: TransactionStatus::Completed,
            amount,
            fee: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            currency: currency.to_string(),
            gateway_reference: None,
            description: None,
            staff_id: None,
            created_at: Utc::now(),
        }
    }

    /// Only completed, positive payments can be refunded.
    pub fn is_refundable(&self) -> bool {
        self.transaction_type == TransactionType::Payment
            && self.status == TransactionStatus::Completed
            && self.amount > Decimal::ZERO
    }

    pub fn remaining_refundable(&self) -> Decimal {
        (self.amount - self.refunded_amount).max(Decimal::ZERO)
    }
}

/// Audit row for every change to a customer's credit balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAdjustment {
    pub id: Uuid,
    pub customer_id: Uuid,
    /// Signed: positive adds credit, negative spends it.
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub currency: String,
    pub reason: String,
    pub invoice_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub staff_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CreditAdjustment {
    pub fn new(customer_id: Uuid, balance_before: Decimal, amount: Decimal, currency: &str, reason: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            amount,
            balance_before,
            balance_after: balance_before + amount,
            currency: currency.to_string(),
            reason: reason.to_string(),
            invoice_id: None,
            transaction_id: None,
            staff_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentRequestStatus {
    Pending,
    Processing,
    RequiresAction,
    Succeeded,
    Failed,
    Expired,
}

text_enum!(PaymentRequestStatus {
    Pending => "pending",
    Processing => "processing",
    RequiresAction => "requires_action",
    Succeeded => "succeeded",
    Failed => "failed",
    Expired => "expired",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub gateway_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_token: Option<String>,
    pub status: PaymentRequestStatus,
    pub transaction_id: Option<Uuid>,
    pub gateway_reference: Option<String>,
    pub error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Stored gateway record; `slug` selects the registered processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    pub supports_recurring: bool,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Gateway {
    pub fn new(name: &str, slug: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug: slug.to_string(),
            is_active: true,
            supports_recurring: false,
            settings: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

text_enum!(SubscriptionStatus {
    Active => "active",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSubscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub gateway_id: Uuid,
    pub service_id: Option<Uuid>,
    pub gateway_subscription_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw inbound gateway notification, kept for asynchronous processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayWebhookLog {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_partial_then_full_payment() {
        let mut invoice = Invoice::new(Uuid::new_v4(), None, "USD", Decimal::new(100, 0));
        assert!(!invoice.apply_payment(Decimal::new(40, 0), Utc::now()));
        assert_eq!(invoice.balance, Decimal::new(60, 0));
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);

        assert!(invoice.apply_payment(Decimal::new(75, 0), Utc::now()));
        assert_eq!(invoice.balance, Decimal::ZERO);
        assert_eq!(invoice.amount_paid, Decimal::new(115, 0));
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert!(invoice.paid_at.is_some());
    }

    #[test]
    fn test_refundable_rules() {
        let mut tx = Transaction::payment(Uuid::new_v4(), Decimal::new(50, 0), "USD");
        assert!(tx.is_refundable());
        tx.refunded_amount = Decimal::new(20, 0);
        assert_eq!(tx.remaining_refundable(), Decimal::new(30, 0));

        tx.transaction_type = TransactionType::Credit;
        assert!(!tx.is_refundable());
    }

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!("requires_action".parse::<PaymentRequestStatus>().unwrap(), PaymentRequestStatus::RequiresAction);
        assert!("bogus".parse::<InvoiceStatus>().is_err());
    }
}
