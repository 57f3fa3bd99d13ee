use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use stratus_core::events::EventPublisher;
use stratus_core::models::{
    CreditAdjustment, Customer, Gateway, GatewayWebhookLog, Invoice, InvoiceStatus, PaymentRequest, PaymentRequestStatus,
    PaymentSubscription, SubscriptionStatus, Transaction, TransactionStatus, TransactionType,
};
use stratus_core::payment::{CardDetails, ChargeResult, GatewayRegistry, PaymentGateway, PaymentStatus, SubscriptionRequest};
use stratus_core::repository::{BillingRepository, CreditPayment, Settlement};
use stratus_core::{ensure_positive, CoreError, CoreResult};
use stratus_shared::models::events::event_types;
use stratus_shared::{round_money, DomainEvent};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{NewPaymentRequest, NewSubscription};

/// Gateway orchestration and the customer ledger: payment requests,
/// credit, refunds, subscriptions and inbound gateway notifications.
pub struct PaymentService {
    billing: Arc<dyn BillingRepository>,
    gateways: GatewayRegistry,
    events: Arc<dyn EventPublisher>,
    request_ttl: Duration,
}

impl PaymentService {
    pub fn new(billing: Arc<dyn BillingRepository>, gateways: GatewayRegistry, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            billing,
            gateways,
            events,
            request_ttl: Duration::hours(1),
        }
    }

    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    async fn gateway(&self, gateway_id: Uuid) -> CoreResult<Gateway> {
        self.billing
            .get_gateway(gateway_id)
            .await?
            .ok_or_else(|| CoreError::not_found("gateway", gateway_id))
    }

    async fn processor_for(&self, gateway_id: Uuid) -> CoreResult<(Gateway, Arc<dyn PaymentGateway>)> {
        let gateway = self.gateway(gateway_id).await?;
        let processor = self.gateways.resolve(&gateway)?;
        Ok((gateway, processor))
    }

    pub async fn get_payment_request(&self, request_id: Uuid) -> CoreResult<PaymentRequest> {
        self.billing
            .get_payment_request(request_id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment request", request_id))
    }

    pub async fn create_payment_request(&self, new: NewPaymentRequest) -> CoreResult<PaymentRequest> {
        self.processor_for(new.gateway_id).await?;

        let (amount, currency) = match new.invoice_id {
            Some(invoice_id) => {
                let invoice = self.customer_invoice(new.customer_id, invoice_id).await?;
                if !invoice.is_payable() {
                    return Err(CoreError::InvalidTransition {
                        from: invoice.status.to_string(),
                        to: InvoiceStatus::Paid.to_string(),
                    });
                }
                (new.amount.unwrap_or(invoice.balance), invoice.currency)
            }
            None => {
                let amount = new
                    .amount
                    .ok_or_else(|| CoreError::ValidationError("amount is required without an invoice".into()))?;
                let currency = new
                    .currency
                    .ok_or_else(|| CoreError::ValidationError("currency is required without an invoice".into()))?;
                (amount, currency)
            }
        };
        ensure_positive(amount, "payment amount")?;

        let now = Utc::now();
        let request = PaymentRequest {
            id: Uuid::new_v4(),
            customer_id: new.customer_id,
            invoice_id: new.invoice_id,
            gateway_id: new.gateway_id,
            amount: round_money(amount),
            currency: currency.trim().to_uppercase(),
            payment_token: new.payment_token,
            status: PaymentRequestStatus::Pending,
            transaction_id: None,
            gateway_reference: None,
            error_message: None,
            expires_at: now + self.request_ttl,
            created_at: now,
            updated_at: now,
        };
        self.billing.create_payment_request(&request).await?;
        info!(request_id = %request.id, amount = %request.amount, "Payment request created");
        Ok(request)
    }

    /// Charge a pending request through its gateway. Expiry is checked before
    /// the processor is called, and the request is claimed (pending to
    /// processing) so only one caller ever charges it. A processor failure
    /// marks the request failed and records no transaction.
    pub async fn process_payment(&self, request_id: Uuid) -> CoreResult<Settlement> {
        let request = self.get_payment_request(request_id).await?;
        if request.status != PaymentRequestStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: request.status.to_string(),
                to: PaymentRequestStatus::Processing.to_string(),
            });
        }
        if request.is_expired(Utc::now()) {
            self.billing
                .close_payment_request(
                    request_id,
                    PaymentRequestStatus::Pending,
                    PaymentRequestStatus::Expired,
                    Some("payment request expired"),
                )
                .await?;
            return Err(CoreError::PaymentRequestExpired(request_id));
        }

        let (gateway, processor) = self.processor_for(request.gateway_id).await?;
        if !self.billing.claim_payment_request(request_id).await? {
            let current = self.get_payment_request(request_id).await?;
            return Err(CoreError::InvalidTransition {
                from: current.status.to_string(),
                to: PaymentRequestStatus::Processing.to_string(),
            });
        }

        let charge = match processor.process_payment(&gateway, &request).await {
            Ok(charge) => charge,
            Err(e) => {
                let message = e.to_string();
                error!(request_id = %request_id, gateway = %gateway.slug, error = %message, "Payment failed");
                self.billing
                    .close_payment_request(
                        request_id,
                        PaymentRequestStatus::Processing,
                        PaymentRequestStatus::Failed,
                        Some(&message),
                    )
                    .await?;
                self.events.publish(DomainEvent::new(
                    event_types::PAYMENT_FAILED,
                    Some(request.customer_id),
                    json!({ "payment_request_id": request_id, "error": message }),
                ));
                return Err(e.into());
            }
        };
        if charge.amount != request.amount {
            warn!(
                request_id = %request_id,
                requested = %request.amount,
                captured = %charge.amount,
                "Gateway captured a different amount"
            );
        }

        let gateway_id = gateway.id;
        let reference = charge.gateway_reference.clone();
        let settlement = self
            .billing
            .settle_payment_request(
                request_id,
                Box::new(move |request, invoice| settle(request, invoice, gateway_id, charge)),
            )
            .await
            .inspect_err(|e| {
                // The processor already took the money; the request stays processing.
                error!(request_id = %request_id, gateway_reference = %reference, error = %e, "Charge not recorded");
            })?;

        info!(
            request_id = %request_id,
            transaction_id = %settlement.transaction.id,
            status = %settlement.request.status,
            "Payment processed"
        );
        if settlement.transaction.status == TransactionStatus::Completed {
            self.publish_payment(&settlement.transaction, settlement.invoice.as_ref());
        }
        Ok(settlement)
    }

    pub async fn get_payment_url(&self, request_id: Uuid) -> CoreResult<Option<String>> {
        let request = self.get_payment_request(request_id).await?;
        let (gateway, processor) = self.processor_for(request.gateway_id).await?;
        Ok(processor.get_payment_url(&gateway, &request).await?)
    }

    pub async fn tokenize_card(&self, gateway_id: Uuid, card: &CardDetails) -> CoreResult<String> {
        let (gateway, processor) = self.processor_for(gateway_id).await?;
        Ok(processor.tokenize_card(&gateway, card).await?)
    }

    /// Pay (part of) an invoice from the customer's credit balance.
    pub async fn pay_with_credit(&self, customer_id: Uuid, invoice_id: Uuid, amount: Decimal) -> CoreResult<CreditPayment> {
        ensure_positive(amount, "credit amount")?;
        let amount = round_money(amount);

        let payment = self
            .billing
            .pay_invoice_with_credit(
                customer_id,
                invoice_id,
                Box::new(move |customer: &Customer, mut invoice: Invoice| {
                    if invoice.customer_id != customer.id {
                        return Err(CoreError::not_found("invoice", invoice.id));
                    }
                    if !invoice.is_payable() {
                        return Err(CoreError::InvalidTransition {
                            from: invoice.status.to_string(),
                            to: InvoiceStatus::Paid.to_string(),
                        });
                    }
                    if customer.credit < amount {
                        return Err(CoreError::InsufficientBalance {
                            available: customer.credit,
                            requested: amount,
                        });
                    }

                    let now = Utc::now();
                    let mut transaction = Transaction::payment(customer.id, amount, &invoice.currency);
                    transaction.transaction_type = TransactionType::Credit;
                    transaction.invoice_id = Some(invoice.id);
                    transaction.description = Some("Credit applied".to_string());

                    let mut adjustment = CreditAdjustment::new(
                        customer.id,
                        customer.credit,
                        -amount,
                        &invoice.currency,
                        &format!("Applied to invoice {}", invoice.id),
                    );
                    adjustment.invoice_id = Some(invoice.id);
                    adjustment.transaction_id = Some(transaction.id);

                    invoice.apply_payment(amount, now);
                    Ok(CreditPayment {
                        adjustment,
                        transaction,
                        invoice,
                    })
                }),
            )
            .await?;

        info!(
            customer_id = %customer_id,
            invoice_id = %invoice_id,
            amount = %amount,
            balance_after = %payment.adjustment.balance_after,
            "Invoice paid from credit"
        );
        self.publish_payment(&payment.transaction, Some(&payment.invoice));
        Ok(payment)
    }

    pub async fn add_credit(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        currency: &str,
        reason: &str,
        staff_id: Option<Uuid>,
    ) -> CoreResult<CreditAdjustment> {
        ensure_positive(amount, "credit amount")?;
        let amount = round_money(amount);
        let currency = currency.trim().to_uppercase();
        let reason = reason.to_string();

        let adjustment = self
            .billing
            .adjust_credit(
                customer_id,
                Box::new(move |customer: &Customer| {
                    let mut adjustment = CreditAdjustment::new(customer.id, customer.credit, amount, &currency, &reason);
                    adjustment.staff_id = staff_id;
                    Ok(adjustment)
                }),
            )
            .await?;

        info!(
            customer_id = %customer_id,
            amount = %amount,
            balance_after = %adjustment.balance_after,
            "Credit added"
        );
        self.events.publish(DomainEvent::new(
            event_types::CREDIT_ADDED,
            Some(customer_id),
            json!({
                "adjustment_id": adjustment.id,
                "amount": adjustment.amount,
                "balance": adjustment.balance_after,
            }),
        ));
        Ok(adjustment)
    }

    /// Newest first.
    pub async fn get_credit_history(&self, customer_id: Uuid) -> CoreResult<Vec<CreditAdjustment>> {
        self.billing.list_credit_adjustments(customer_id).await
    }

    pub async fn remaining_refundable(&self, transaction_id: Uuid) -> CoreResult<Decimal> {
        let transaction = self.transaction(transaction_id).await?;
        if !transaction.is_refundable() {
            return Ok(Decimal::ZERO);
        }
        Ok(transaction.remaining_refundable())
    }

    /// Refund part or all of a completed payment. The refund is recorded
    /// first, re-checking the remaining amount under lock, so concurrent
    /// refunds can never reserve more than the original. Gateway refunds are
    /// recorded pending, completed once the processor accepts them and
    /// released if it refuses.
    pub async fn process_refund(
        &self,
        transaction_id: Uuid,
        amount: Decimal,
        reason: &str,
        staff_id: Option<Uuid>,
    ) -> CoreResult<Transaction> {
        ensure_positive(amount, "refund amount")?;
        let amount = round_money(amount);

        let original = self.transaction(transaction_id).await?;
        check_refundable(&original, amount)?;
        let processor = match original.gateway_id {
            Some(gateway_id) => Some(self.processor_for(gateway_id).await?),
            None => None,
        };

        let status = if processor.is_some() {
            TransactionStatus::Pending
        } else {
            TransactionStatus::Completed
        };
        let description = reason.to_string();
        let reserved = self
            .billing
            .record_refund(
                transaction_id,
                Box::new(move |original: &Transaction| {
                    check_refundable(original, amount)?;
                    Ok(Transaction {
                        id: Uuid::new_v4(),
                        customer_id: original.customer_id,
                        invoice_id: original.invoice_id,
                        gateway_id: original.gateway_id,
                        parent_transaction_id: Some(original.id),
                        transaction_type: TransactionType::Refund,
                        status,
                        amount: -amount,
                        fee: Decimal::ZERO,
                        refunded_amount: Decimal::ZERO,
                        currency: original.currency.clone(),
                        gateway_reference: None,
                        description: Some(description),
                        staff_id,
                        created_at: Utc::now(),
                    })
                }),
            )
            .await?;

        let refund = match processor {
            Some((gateway, processor)) => match processor.process_refund(&gateway, &original, amount).await {
                Ok(result) => self.billing.complete_refund(reserved.id, &result.gateway_reference).await?,
                Err(e) => {
                    warn!(
                        transaction_id = %transaction_id,
                        refund_id = %reserved.id,
                        gateway = %gateway.slug,
                        error = %e,
                        "Gateway refused refund"
                    );
                    self.billing.release_refund(reserved.id).await?;
                    return Err(e.into());
                }
            },
            None => reserved,
        };

        info!(
            transaction_id = %transaction_id,
            refund_id = %refund.id,
            amount = %amount,
            "Refund issued"
        );
        self.events.publish(DomainEvent::new(
            event_types::REFUND_ISSUED,
            Some(refund.customer_id),
            json!({
                "transaction_id": transaction_id,
                "refund_id": refund.id,
                "amount": amount,
            }),
        ));
        Ok(refund)
    }

    pub async fn create_subscription(&self, new: NewSubscription) -> CoreResult<PaymentSubscription> {
        ensure_positive(new.amount, "subscription amount")?;
        let (gateway, processor) = self.processor_for(new.gateway_id).await?;
        if !gateway.supports_recurring {
            return Err(CoreError::ConfigurationError(format!(
                "gateway '{}' does not support recurring payments",
                gateway.slug
            )));
        }

        let request = SubscriptionRequest {
            customer_id: new.customer_id,
            amount: round_money(new.amount),
            currency: new.currency.trim().to_uppercase(),
            billing_cycle: new.billing_cycle,
            payment_token: new.payment_token,
        };
        let result = processor.create_subscription(&gateway, &request).await?;

        let now = Utc::now();
        let subscription = PaymentSubscription {
            id: Uuid::new_v4(),
            customer_id: new.customer_id,
            gateway_id: gateway.id,
            service_id: new.service_id,
            gateway_subscription_id: result.gateway_subscription_id,
            amount: request.amount,
            currency: request.currency,
            billing_cycle: request.billing_cycle,
            status: SubscriptionStatus::Active,
            cancel_at_period_end: false,
            current_period_end: result
                .current_period_end
                .or_else(|| Some(request.billing_cycle.advance(now))),
            ended_at: None,
            created_at: now,
            updated_at: now,
        };
        self.billing.create_subscription(&subscription).await?;

        info!(subscription_id = %subscription.id, gateway = %gateway.slug, "Subscription created");
        self.events.publish(DomainEvent::new(
            event_types::SUBSCRIPTION_CREATED,
            Some(subscription.customer_id),
            json!({ "subscription_id": subscription.id, "amount": subscription.amount }),
        ));
        Ok(subscription)
    }

    /// Immediate cancellation ends the subscription now; otherwise it only
    /// stops renewing at the end of the current period.
    pub async fn cancel_subscription(&self, subscription_id: Uuid, immediately: bool) -> CoreResult<PaymentSubscription> {
        let mut subscription = self
            .billing
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| CoreError::not_found("subscription", subscription_id))?;
        if subscription.status == SubscriptionStatus::Cancelled {
            return Err(CoreError::InvalidTransition {
                from: subscription.status.to_string(),
                to: SubscriptionStatus::Cancelled.to_string(),
            });
        }

        let (gateway, processor) = self.processor_for(subscription.gateway_id).await?;
        processor.cancel_subscription(&gateway, &subscription, immediately).await?;

        let now = Utc::now();
        if immediately {
            subscription.status = SubscriptionStatus::Cancelled;
            subscription.ended_at = Some(now);
        } else {
            subscription.cancel_at_period_end = true;
        }
        subscription.updated_at = now;
        self.billing.update_subscription(&subscription).await?;

        info!(subscription_id = %subscription_id, immediately, "Subscription cancelled");
        self.events.publish(DomainEvent::new(
            event_types::SUBSCRIPTION_CANCELLED,
            Some(subscription.customer_id),
            json!({ "subscription_id": subscription_id, "immediately": immediately }),
        ));
        Ok(subscription)
    }

    /// Authenticate an inbound gateway notification and store it for
    /// processing. Nothing is written when the signature is rejected.
    pub async fn process_webhook(&self, gateway_slug: &str, payload: &[u8], signature: &str) -> CoreResult<GatewayWebhookLog> {
        let gateway = self
            .billing
            .get_gateway_by_slug(gateway_slug)
            .await?
            .ok_or_else(|| CoreError::not_found("gateway", gateway_slug))?;
        let processor = self.gateways.resolve(&gateway)?;

        if !processor.validate_webhook(&gateway, payload, signature) {
            warn!(gateway = %gateway_slug, "Rejected gateway webhook with invalid signature");
            return Err(CoreError::AuthenticationError(format!(
                "invalid signature for gateway '{}'",
                gateway_slug
            )));
        }

        let payload_text = std::str::from_utf8(payload)
            .map_err(|e| CoreError::ValidationError(format!("webhook payload is not valid UTF-8: {}", e)))?
            .to_string();
        let log = GatewayWebhookLog {
            id: Uuid::new_v4(),
            gateway_id: gateway.id,
            payload: payload_text,
            status: "received".to_string(),
            created_at: Utc::now(),
        };
        self.billing.record_gateway_webhook(&log).await?;
        info!(gateway = %gateway_slug, log_id = %log.id, "Gateway webhook received");
        Ok(log)
    }

    async fn transaction(&self, transaction_id: Uuid) -> CoreResult<Transaction> {
        self.billing
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| CoreError::not_found("transaction", transaction_id))
    }

    async fn customer_invoice(&self, customer_id: Uuid, invoice_id: Uuid) -> CoreResult<Invoice> {
        match self.billing.get_invoice(invoice_id).await? {
            Some(invoice) if invoice.customer_id == customer_id => Ok(invoice),
            _ => Err(CoreError::not_found("invoice", invoice_id)),
        }
    }

    fn publish_payment(&self, transaction: &Transaction, invoice: Option<&Invoice>) {
        self.events.publish(DomainEvent::new(
            event_types::PAYMENT_COMPLETED,
            Some(transaction.customer_id),
            json!({
                "transaction_id": transaction.id,
                "invoice_id": transaction.invoice_id,
                "amount": transaction.amount,
                "currency": transaction.currency,
            }),
        ));
        if let Some(invoice) = invoice.filter(|i| i.status == InvoiceStatus::Paid) {
            self.events.publish(DomainEvent::new(
                event_types::INVOICE_PAID,
                Some(invoice.customer_id),
                json!({ "invoice_id": invoice.id, "total": invoice.total }),
            ));
        }
    }
}

fn check_refundable(original: &Transaction, amount: Decimal) -> CoreResult<()> {
    if !original.is_refundable() {
        return Err(CoreError::NotRefundable(original.id));
    }
    let remaining = original.remaining_refundable();
    if amount > remaining {
        return Err(CoreError::RefundExceedsRemaining {
            remaining,
            requested: amount,
        });
    }
    Ok(())
}

/// Ledger effects of an accepted charge, computed against the locked request.
/// The amount recorded is what the gateway captured.
fn settle(
    mut request: PaymentRequest,
    invoice: Option<Invoice>,
    gateway_id: Uuid,
    charge: ChargeResult,
) -> CoreResult<Settlement> {
    if request.status != PaymentRequestStatus::Processing || request.transaction_id.is_some() {
        return Err(CoreError::Conflict(format!(
            "payment request {} is already {}",
            request.id, request.status
        )));
    }

    let now = Utc::now();
    let completed = charge.status == PaymentStatus::Succeeded;

    let mut transaction = Transaction::payment(request.customer_id, charge.amount, &request.currency);
    transaction.invoice_id = request.invoice_id;
    transaction.gateway_id = Some(gateway_id);
    transaction.fee = charge.fee;
    transaction.gateway_reference = Some(charge.gateway_reference.clone());
    transaction.status = if completed {
        TransactionStatus::Completed
    } else {
        TransactionStatus::Pending
    };

    request.status = match charge.status {
        PaymentStatus::Succeeded => PaymentRequestStatus::Succeeded,
        PaymentStatus::Processing => PaymentRequestStatus::Processing,
        PaymentStatus::RequiresAction => PaymentRequestStatus::RequiresAction,
    };
    request.transaction_id = Some(transaction.id);
    request.gateway_reference = Some(charge.gateway_reference);
    request.updated_at = now;

    let invoice = match invoice {
        Some(mut invoice) if completed && invoice.is_payable() => {
            invoice.apply_payment(charge.amount, now);
            Some(invoice)
        }
        _ => None,
    };

    Ok(Settlement {
        request,
        transaction,
        invoice,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stratus_core::events::RecordingPublisher;
    use stratus_core::payment::{GatewayError, GatewayResult, RefundResult, SubscriptionResult};
    use stratus_core::repository::CustomerRepository;
    use stratus_core::{BillingCycle, ErrorKind, MemoryStore};
    use stratus_webhook::sign_payload;

    use crate::manual::{ManualGateway, MANUAL_SLUG};

    /// Processor whose charges and refunds fail on demand, which can answer
    /// slowly, capture less than requested, and counts every call.
    #[derive(Default)]
    struct CardGateway {
        decline: bool,
        refuse_refunds: bool,
        capture: Option<Decimal>,
        latency: std::time::Duration,
        charges: AtomicUsize,
        refunds: AtomicUsize,
    }

    impl CardGateway {
        async fn wait(&self) {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for CardGateway {
        async fn process_payment(&self, _: &Gateway, request: &PaymentRequest) -> GatewayResult<ChargeResult> {
            self.charges.fetch_add(1, Ordering::SeqCst);
            self.wait().await;
            if self.decline {
                return Err(GatewayError::Declined("insufficient funds".into()));
            }
            Ok(ChargeResult {
                gateway_reference: format!("ch_{}", request.id.simple()),
                amount: self.capture.unwrap_or(request.amount),
                fee: Decimal::new(30, 2),
                status: PaymentStatus::Succeeded,
            })
        }

        async fn process_refund(&self, _: &Gateway, _: &Transaction, _: Decimal) -> GatewayResult<RefundResult> {
            self.refunds.fetch_add(1, Ordering::SeqCst);
            self.wait().await;
            if self.refuse_refunds {
                return Err(GatewayError::Declined("charge is disputed".into()));
            }
            Ok(RefundResult {
                gateway_reference: "re_1".into(),
            })
        }

        async fn create_subscription(&self, _: &Gateway, _: &SubscriptionRequest) -> GatewayResult<SubscriptionResult> {
            Ok(SubscriptionResult {
                gateway_subscription_id: "sub_1".into(),
                current_period_end: None,
            })
        }

        async fn cancel_subscription(&self, _: &Gateway, _: &PaymentSubscription, _: bool) -> GatewayResult<()> {
            Ok(())
        }

        fn validate_webhook(&self, _: &Gateway, _: &[u8], signature: &str) -> bool {
            signature == "valid"
        }

        async fn tokenize_card(&self, _: &Gateway, card: &CardDetails) -> GatewayResult<String> {
            let number = card.number.expose();
            Ok(format!("tok_{}", &number[number.len().saturating_sub(4)..]))
        }

        async fn get_payment_url(&self, _: &Gateway, request: &PaymentRequest) -> GatewayResult<Option<String>> {
            Ok(Some(format!("https://pay.example.com/{}", request.id)))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        events: Arc<RecordingPublisher>,
        service: PaymentService,
        customer_id: Uuid,
        card: Gateway,
        manual: Gateway,
        card_processor: Arc<CardGateway>,
    }

    async fn fixture_with(card_processor: CardGateway) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let customer = Customer::new("payer@example.com", Some("DE"), None, "EUR");
        let customer_id = customer.id;
        store.insert_customer(customer).await;

        let mut card = Gateway::new("Cards", "card");
        card.supports_recurring = true;
        store.insert_gateway(card.clone()).await;
        let mut manual = Gateway::new("Bank transfer", MANUAL_SLUG);
        manual.settings = json!({ "webhook_secret": "bank-secret" });
        store.insert_gateway(manual.clone()).await;

        let card_processor = Arc::new(card_processor);
        let registry = GatewayRegistry::new()
            .with("card", card_processor.clone())
            .with(MANUAL_SLUG, Arc::new(ManualGateway));
        let events = Arc::new(RecordingPublisher::new());
        let service = PaymentService::new(store.clone(), registry, events.clone());

        Fixture {
            store,
            events,
            service,
            customer_id,
            card,
            manual,
            card_processor,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(CardGateway::default()).await
    }

    async fn invoice(f: &Fixture, total: i64) -> Invoice {
        let invoice = Invoice::new(f.customer_id, None, "EUR", Decimal::new(total, 0));
        f.store.insert_invoice(invoice.clone()).await;
        invoice
    }

    fn charge_for(f: &Fixture, gateway: &Gateway, invoice: &Invoice) -> NewPaymentRequest {
        NewPaymentRequest {
            customer_id: f.customer_id,
            invoice_id: Some(invoice.id),
            gateway_id: gateway.id,
            amount: None,
            currency: None,
            payment_token: None,
        }
    }

    #[tokio::test]
    async fn test_card_payment_settles_invoice() {
        let f = fixture().await;
        let inv = invoice(&f, 100).await;
        let request = f.service.create_payment_request(charge_for(&f, &f.card, &inv)).await.unwrap();
        assert_eq!(request.amount, Decimal::new(100, 0));
        assert_eq!(request.currency, "EUR");

        let settlement = f.service.process_payment(request.id).await.unwrap();
        assert_eq!(settlement.request.status, PaymentRequestStatus::Succeeded);
        assert_eq!(settlement.request.transaction_id, Some(settlement.transaction.id));
        assert_eq!(settlement.transaction.status, TransactionStatus::Completed);
        assert_eq!(settlement.transaction.fee, Decimal::new(30, 2));

        let stored = f.store.get_invoice(inv.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);
        assert_eq!(stored.balance, Decimal::ZERO);
        assert_eq!(
            f.events.event_types(),
            vec![event_types::PAYMENT_COMPLETED, event_types::INVOICE_PAID]
        );

        let err = f.service.process_payment(request.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_declined_payment_marks_request_failed() {
        let f = fixture_with(CardGateway {
            decline: true,
            ..Default::default()
        })
        .await;
        let inv = invoice(&f, 40).await;
        let request = f.service.create_payment_request(charge_for(&f, &f.card, &inv)).await.unwrap();

        let err = f.service.process_payment(request.id).await.unwrap_err();
        assert!(matches!(err, CoreError::GatewayError(_)));

        let stored = f.service.get_payment_request(request.id).await.unwrap();
        assert_eq!(stored.status, PaymentRequestStatus::Failed);
        assert!(stored.error_message.unwrap().contains("insufficient funds"));
        assert!(stored.transaction_id.is_none());
        assert_eq!(f.events.event_types(), vec![event_types::PAYMENT_FAILED]);
        assert_eq!(f.store.get_invoice(inv.id).await.unwrap().unwrap().status, InvoiceStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_expired_request_is_not_charged() {
        let f = fixture().await;
        let service = PaymentService::new(
            f.store.clone(),
            GatewayRegistry::new().with("card", f.card_processor.clone()),
            f.events.clone(),
        )
        .with_request_ttl(Duration::seconds(-1));
        let inv = invoice(&f, 10).await;
        let request = service.create_payment_request(charge_for(&f, &f.card, &inv)).await.unwrap();

        let err = service.process_payment(request.id).await.unwrap_err();
        assert!(matches!(err, CoreError::PaymentRequestExpired(id) if id == request.id));
        let stored = service.get_payment_request(request.id).await.unwrap();
        assert_eq!(stored.status, PaymentRequestStatus::Expired);
    }

    #[tokio::test]
    async fn test_unregistered_gateway_is_configuration_error() {
        let f = fixture().await;
        let orphan = Gateway::new("Legacy", "legacy");
        f.store.insert_gateway(orphan.clone()).await;
        let inv = invoice(&f, 10).await;

        let err = f
            .service
            .create_payment_request(charge_for(&f, &orphan, &inv))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = f
            .service
            .create_payment_request(charge_for(&f, &Gateway::new("Ghost", "ghost"), &inv))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_credit_ledger_chains() {
        let f = fixture().await;
        let first = f.service.add_credit(f.customer_id, Decimal::new(50, 0), "eur", "goodwill", None).await.unwrap();
        let staff = Uuid::new_v4();
        let second = f
            .service
            .add_credit(f.customer_id, Decimal::new(2550, 2), "EUR", "overpayment", Some(staff))
            .await
            .unwrap();

        assert_eq!(first.balance_before, Decimal::ZERO);
        assert_eq!(first.balance_after, Decimal::new(50, 0));
        assert_eq!(second.balance_before, first.balance_after);
        assert_eq!(second.balance_after, Decimal::new(7550, 2));
        assert_eq!(second.staff_id, Some(staff));

        let customer = f.store.get_customer(f.customer_id).await.unwrap().unwrap();
        let history = f.service.get_credit_history(f.customer_id).await.unwrap();
        assert_eq!(customer.credit, history[0].balance_after);

        let err = f
            .service
            .add_credit(f.customer_id, Decimal::ZERO, "EUR", "nothing", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_pay_with_credit() {
        let f = fixture().await;
        let inv = invoice(&f, 60).await;
        f.service.add_credit(f.customer_id, Decimal::new(100, 0), "EUR", "top up", None).await.unwrap();

        let partial = f.service.pay_with_credit(f.customer_id, inv.id, Decimal::new(25, 0)).await.unwrap();
        assert_eq!(partial.invoice.balance, Decimal::new(35, 0));
        assert_eq!(partial.invoice.status, InvoiceStatus::Unpaid);
        assert_eq!(partial.adjustment.balance_after, Decimal::new(75, 0));
        assert_eq!(partial.adjustment.transaction_id, Some(partial.transaction.id));

        let rest = f.service.pay_with_credit(f.customer_id, inv.id, Decimal::new(35, 0)).await.unwrap();
        assert_eq!(rest.invoice.status, InvoiceStatus::Paid);
        assert_eq!(rest.invoice.balance, Decimal::ZERO);

        let customer = f.store.get_customer(f.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.credit, Decimal::new(40, 0));
        assert_eq!(f.service.get_credit_history(f.customer_id).await.unwrap()[0].balance_after, customer.credit);

        let err = f
            .service
            .pay_with_credit(f.customer_id, inv.id, Decimal::new(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_credit_changes_nothing() {
        let f = fixture().await;
        let inv = invoice(&f, 60).await;
        f.service.add_credit(f.customer_id, Decimal::new(10, 0), "EUR", "top up", None).await.unwrap();

        let err = f
            .service
            .pay_with_credit(f.customer_id, inv.id, Decimal::new(20, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::InsufficientBalance { available, requested }
                if available == Decimal::new(10, 0) && requested == Decimal::new(20, 0)
        ));

        let customer = f.store.get_customer(f.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.credit, Decimal::new(10, 0));
        assert_eq!(f.service.get_credit_history(f.customer_id).await.unwrap().len(), 1);
        assert_eq!(f.store.get_invoice(inv.id).await.unwrap().unwrap().balance, Decimal::new(60, 0));
    }

    #[tokio::test]
    async fn test_refunds_never_exceed_original() {
        let f = fixture().await;
        let inv = invoice(&f, 100).await;
        let request = f.service.create_payment_request(charge_for(&f, &f.card, &inv)).await.unwrap();
        let payment = f.service.process_payment(request.id).await.unwrap().transaction;

        let refund = f
            .service
            .process_refund(payment.id, Decimal::new(40, 0), "partial", None)
            .await
            .unwrap();
        assert_eq!(refund.amount, Decimal::new(-40, 0));
        assert_eq!(refund.parent_transaction_id, Some(payment.id));
        assert_eq!(refund.transaction_type, TransactionType::Refund);
        assert_eq!(refund.gateway_reference.as_deref(), Some("re_1"));
        assert_eq!(f.service.remaining_refundable(payment.id).await.unwrap(), Decimal::new(60, 0));

        let err = f
            .service
            .process_refund(payment.id, Decimal::new(61, 0), "too much", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::RefundExceedsRemaining { remaining, .. } if remaining == Decimal::new(60, 0)
        ));

        f.service.process_refund(payment.id, Decimal::new(60, 0), "rest", None).await.unwrap();
        assert_eq!(f.service.remaining_refundable(payment.id).await.unwrap(), Decimal::ZERO);
        assert_eq!(f.card_processor.refunds.load(Ordering::SeqCst), 2);

        let original = f.store.get_transaction(payment.id).await.unwrap().unwrap();
        assert_eq!(original.refunded_amount, original.amount);
    }

    #[tokio::test]
    async fn test_refund_of_refund_is_rejected() {
        let f = fixture().await;
        let mut payment = Transaction::payment(f.customer_id, Decimal::new(20, 0), "EUR");
        f.store.insert_transaction(payment.clone()).await;
        let refund = f.service.process_refund(payment.id, Decimal::new(5, 0), "r", None).await.unwrap();
        assert!(refund.gateway_reference.is_none());

        let err = f.service.process_refund(refund.id, Decimal::new(1, 0), "again", None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotRefundable(id) if id == refund.id));

        payment.id = Uuid::new_v4();
        payment.status = TransactionStatus::Pending;
        f.store.insert_transaction(payment.clone()).await;
        let err = f.service.process_refund(payment.id, Decimal::new(1, 0), "pending", None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotRefundable(_)));
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let f = fixture().await;
        let new = NewSubscription {
            customer_id: f.customer_id,
            gateway_id: f.card.id,
            service_id: None,
            amount: Decimal::new(999, 2),
            currency: "eur".into(),
            billing_cycle: BillingCycle::Monthly,
            payment_token: Some("tok_4242".into()),
        };
        let subscription = f.service.create_subscription(new.clone()).await.unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert!(subscription.current_period_end.is_some());

        let at_period_end = f.service.cancel_subscription(subscription.id, false).await.unwrap();
        assert_eq!(at_period_end.status, SubscriptionStatus::Active);
        assert!(at_period_end.cancel_at_period_end);
        assert!(at_period_end.ended_at.is_none());

        let ended = f.service.cancel_subscription(subscription.id, true).await.unwrap();
        assert_eq!(ended.status, SubscriptionStatus::Cancelled);
        assert!(ended.ended_at.is_some());
        assert!(f.service.cancel_subscription(subscription.id, true).await.is_err());

        let manual = NewSubscription {
            gateway_id: f.manual.id,
            ..new
        };
        let err = f.service.create_subscription(manual).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_gateway_webhook_authentication() {
        let f = fixture().await;
        let payload = br#"{"reference":"MAN-42","status":"settled"}"#;

        let err = f.service.process_webhook(MANUAL_SLUG, payload, "bogus").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(f.store.gateway_webhook_logs().await.is_empty());

        let signature = sign_payload("bank-secret", payload).unwrap();
        let log = f.service.process_webhook(MANUAL_SLUG, payload, &signature).await.unwrap();
        assert_eq!(log.status, "received");
        assert_eq!(log.gateway_id, f.manual.id);
        assert_eq!(f.store.gateway_webhook_logs().await.len(), 1);

        let err = f.service.process_webhook("nope", payload, &signature).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_payment_url_and_tokenize() {
        let f = fixture().await;
        let request = f
            .service
            .create_payment_request(NewPaymentRequest {
                customer_id: f.customer_id,
                invoice_id: None,
                gateway_id: f.card.id,
                amount: Some(Decimal::new(15, 0)),
                currency: Some("eur".into()),
                payment_token: None,
            })
            .await
            .unwrap();
        let url = f.service.get_payment_url(request.id).await.unwrap();
        assert_eq!(url, Some(format!("https://pay.example.com/{}", request.id)));

        let card = CardDetails {
            number: "4242424242424242".to_string().into(),
            exp_month: 12,
            exp_year: 2030,
            cvc: "123".to_string().into(),
            holder_name: "A Payer".into(),
        };
        assert_eq!(f.service.tokenize_card(f.card.id, &card).await.unwrap(), "tok_4242");
        let err = f.service.tokenize_card(f.manual.id, &card).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    async fn paid_by_card(f: &Fixture, total: i64) -> Transaction {
        let inv = invoice(f, total).await;
        let request = f.service.create_payment_request(charge_for(f, &f.card, &inv)).await.unwrap();
        f.service.process_payment(request.id).await.unwrap().transaction
    }

    #[tokio::test]
    async fn test_concurrent_processing_charges_once() {
        let f = fixture_with(CardGateway {
            latency: std::time::Duration::from_millis(20),
            ..Default::default()
        })
        .await;
        let inv = invoice(&f, 100).await;
        let request = f.service.create_payment_request(charge_for(&f, &f.card, &inv)).await.unwrap();

        let (first, second) = tokio::join!(f.service.process_payment(request.id), f.service.process_payment(request.id));
        let (settled, rejected) = match (first, second) {
            (Ok(settled), Err(e)) | (Err(e), Ok(settled)) => (settled, e),
            other => panic!("expected exactly one settlement, got {:?}", other),
        };
        assert!(matches!(rejected, CoreError::InvalidTransition { .. }));
        assert_eq!(settled.request.status, PaymentRequestStatus::Succeeded);
        assert_eq!(f.card_processor.charges.load(Ordering::SeqCst), 1);

        let stored = f.store.get_invoice(inv.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_paid, Decimal::new(100, 0));
        assert_eq!(stored.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn test_declined_claim_cannot_be_retried() {
        let f = fixture_with(CardGateway {
            decline: true,
            ..Default::default()
        })
        .await;
        let inv = invoice(&f, 40).await;
        let request = f.service.create_payment_request(charge_for(&f, &f.card, &inv)).await.unwrap();

        f.service.process_payment(request.id).await.unwrap_err();
        let err = f.service.process_payment(request.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(f.card_processor.charges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_capture_records_captured_amount() {
        let f = fixture_with(CardGateway {
            capture: Some(Decimal::new(60, 0)),
            ..Default::default()
        })
        .await;
        let inv = invoice(&f, 100).await;
        let request = f.service.create_payment_request(charge_for(&f, &f.card, &inv)).await.unwrap();

        let settlement = f.service.process_payment(request.id).await.unwrap();
        assert_eq!(settlement.transaction.amount, Decimal::new(60, 0));
        assert_eq!(settlement.request.amount, Decimal::new(100, 0));

        let stored = f.store.get_invoice(inv.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_paid, Decimal::new(60, 0));
        assert_eq!(stored.balance, Decimal::new(40, 0));
        assert_eq!(stored.status, InvoiceStatus::Unpaid);
        assert_eq!(f.events.event_types(), vec![event_types::PAYMENT_COMPLETED]);
        assert_eq!(
            f.service.remaining_refundable(settlement.transaction.id).await.unwrap(),
            Decimal::new(60, 0)
        );
    }

    #[tokio::test]
    async fn test_concurrent_full_refunds_hit_gateway_once() {
        let f = fixture_with(CardGateway {
            latency: std::time::Duration::from_millis(20),
            ..Default::default()
        })
        .await;
        let payment = paid_by_card(&f, 100).await;
        let full = Decimal::new(100, 0);

        let (first, second) = tokio::join!(
            f.service.process_refund(payment.id, full, "duplicate click", None),
            f.service.process_refund(payment.id, full, "duplicate click", None)
        );
        let (refund, rejected) = match (first, second) {
            (Ok(refund), Err(e)) | (Err(e), Ok(refund)) => (refund, e),
            other => panic!("expected exactly one refund, got {:?}", other),
        };
        assert!(matches!(rejected, CoreError::RefundExceedsRemaining { .. }));
        assert_eq!(refund.status, TransactionStatus::Completed);
        assert_eq!(refund.gateway_reference.as_deref(), Some("re_1"));
        assert_eq!(f.card_processor.refunds.load(Ordering::SeqCst), 1);

        let original = f.store.get_transaction(payment.id).await.unwrap().unwrap();
        assert_eq!(original.refunded_amount, full);
    }

    #[tokio::test]
    async fn test_refused_gateway_refund_is_released() {
        let f = fixture_with(CardGateway {
            refuse_refunds: true,
            ..Default::default()
        })
        .await;
        let payment = paid_by_card(&f, 80).await;

        let err = f
            .service
            .process_refund(payment.id, Decimal::new(30, 0), "dispute", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::GatewayError(_)));

        assert_eq!(f.service.remaining_refundable(payment.id).await.unwrap(), Decimal::new(80, 0));
        let original = f.store.get_transaction(payment.id).await.unwrap().unwrap();
        assert_eq!(original.refunded_amount, Decimal::ZERO);
        assert!(!f.events.event_types().contains(&event_types::REFUND_ISSUED.to_string()));
    }

    #[tokio::test]
    async fn test_credit_top_up_racing_payment_keeps_chain() {
        let f = fixture().await;
        let inv = invoice(&f, 30).await;
        f.service.add_credit(f.customer_id, Decimal::new(30, 0), "EUR", "opening", None).await.unwrap();

        let (top_up, payment) = tokio::join!(
            f.service.add_credit(f.customer_id, Decimal::new(50, 0), "EUR", "top up", None),
            f.service.pay_with_credit(f.customer_id, inv.id, Decimal::new(30, 0))
        );
        top_up.unwrap();
        payment.unwrap();

        let customer = f.store.get_customer(f.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.credit, Decimal::new(50, 0));

        let mut history = f.service.get_credit_history(f.customer_id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].balance_after, customer.credit);
        history.reverse();
        for pair in history.windows(2) {
            assert_eq!(pair[1].balance_before, pair[0].balance_after);
            assert_eq!(pair[1].balance_after, pair[1].balance_before + pair[1].amount);
        }
    }

    #[tokio::test]
    async fn test_non_utf8_webhook_is_rejected() {
        let f = fixture().await;
        let payload: &[u8] = &[0x7b, 0xff, 0xfe, 0x7d];
        let signature = sign_payload("bank-secret", payload).unwrap();

        let err = f.service.process_webhook(MANUAL_SLUG, payload, &signature).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
        assert!(f.store.gateway_webhook_logs().await.is_empty());
    }
}
