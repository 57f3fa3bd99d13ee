use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use stratus_api::{app, AppSettings, AppState};
use stratus_core::events::RecordingPublisher;
use stratus_core::models::{Customer, Gateway, Product, ProductPricing};
use stratus_core::payment::GatewayRegistry;
use stratus_core::tax::TaxRule;
use stratus_core::{BillingCycle, MemoryStore};
use stratus_payment::manual::{ManualGateway, MANUAL_SLUG};
use stratus_webhook::signing::SIGNATURE_HEADER;
use tower::ServiceExt;
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_test";

struct TestApp {
    router: Router,
    events: Arc<RecordingPublisher>,
    customer_id: Uuid,
    product_id: Uuid,
    gateway_id: Uuid,
}

async fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());

    let customer = Customer::new("ops@example.com", Some("US"), Some("CA"), "USD");
    let customer_id = customer.id;
    store.insert_customer(customer).await;
    store
        .insert_tax_rule(TaxRule {
            id: 1,
            name: "Sales tax".into(),
            country: "US".into(),
            state: None,
            rate: Decimal::new(10, 0),
            priority: 0,
            inclusive: false,
            is_active: true,
        })
        .await;

    let product = Product::new("Cloud VPS");
    let product_id = product.id;
    store.insert_product(product).await;
    store
        .insert_pricing(ProductPricing {
            product_id,
            currency: "USD".into(),
            billing_cycle: BillingCycle::Monthly,
            setup_fee: Decimal::new(5, 0),
            recurring_fee: Decimal::new(10, 0),
            enabled: true,
        })
        .await;

    let mut gateway = Gateway::new("Bank Transfer", MANUAL_SLUG);
    gateway.settings = json!({ "webhook_secret": WEBHOOK_SECRET });
    let gateway_id = gateway.id;
    store.insert_gateway(gateway).await;

    let events = Arc::new(RecordingPublisher::new());
    let registry = GatewayRegistry::new().with(MANUAL_SLUG, Arc::new(ManualGateway));
    let state = AppState::new(store, registry, events.clone(), AppSettings::default());

    TestApp {
        router: app(state),
        events,
        customer_id,
        product_id,
        gateway_id,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn money(value: &Value) -> Decimal {
    serde_json::from_value(value.clone()).unwrap()
}

fn id(value: &Value) -> String {
    value.as_str().unwrap().to_string()
}

/// Cart with two monthly VPS lines checked out into an order. Subtotal 30,
/// tax 3, total 33.
async fn place_order(t: &TestApp) -> Value {
    let (status, cart) = send(
        &t.router,
        "POST",
        "/v1/carts",
        Some(json!({ "customer_id": t.customer_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let cart_id = id(&cart["id"]);

    let (status, _) = send(
        &t.router,
        "POST",
        &format!("/v1/carts/{}/items", cart_id),
        Some(json!({ "product_id": t.product_id, "quantity": 2, "billing_cycle": "monthly" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, summary) = send(&t.router, "GET", &format!("/v1/carts/{}", cart_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(money(&summary["subtotal"]), Decimal::new(30, 0));
    assert_eq!(money(&summary["tax"]), Decimal::new(3, 0));
    assert_eq!(money(&summary["total"]), Decimal::new(33, 0));

    let (status, order) = send(
        &t.router,
        "POST",
        "/v1/orders",
        Some(json!({ "customer_id": t.customer_id, "cart_id": cart_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    order
}

#[tokio::test]
async fn test_health() {
    let t = test_app().await;
    let (status, body) = send(&t.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_checkout_then_pay_with_credit() {
    let t = test_app().await;
    let order = place_order(&t).await;
    assert_eq!(money(&order["total"]), Decimal::new(33, 0));
    assert_eq!(order["status"], "PENDING");
    let invoice_id = id(&order["invoice_id"]);

    let (status, adjustment) = send(
        &t.router,
        "POST",
        &format!("/v1/customers/{}/credit", t.customer_id),
        Some(json!({ "amount": "50.00", "reason": "Goodwill" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(money(&adjustment["balance_after"]), Decimal::new(50, 0));

    let (status, paid) = send(
        &t.router,
        "POST",
        &format!("/v1/invoices/{}/pay-with-credit", invoice_id),
        Some(json!({ "customer_id": t.customer_id, "amount": "33.00" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["invoice"]["status"], "PAID");
    assert_eq!(money(&paid["adjustment"]["balance_after"]), Decimal::new(17, 0));

    let (status, history) = send(&t.router, "GET", &format!("/v1/customers/{}/credit", t.customer_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(money(&history[0]["amount"]), Decimal::new(-33, 0));

    let (status, again) = send(
        &t.router,
        "POST",
        &format!("/v1/invoices/{}/pay-with-credit", invoice_id),
        Some(json!({ "customer_id": t.customer_id, "amount": "1.00" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(again["error"].is_string());

    let types = t.events.event_types();
    assert!(types.contains(&"order.created".to_string()));
    assert!(types.contains(&"credit.added".to_string()));
    assert!(types.contains(&"invoice.paid".to_string()));
}

#[tokio::test]
async fn test_gateway_payment_and_partial_refund() {
    let t = test_app().await;
    let order = place_order(&t).await;

    let (status, request) = send(
        &t.router,
        "POST",
        "/v1/payment-requests",
        Some(json!({
            "customer_id": t.customer_id,
            "invoice_id": order["invoice_id"],
            "gateway_id": t.gateway_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(money(&request["amount"]), Decimal::new(33, 0));
    assert_eq!(request["status"], "PENDING");

    let (status, settlement) = send(
        &t.router,
        "POST",
        &format!("/v1/payment-requests/{}/process", id(&request["id"])),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settlement["request"]["status"], "SUCCEEDED");
    assert_eq!(settlement["transaction"]["status"], "COMPLETED");
    assert_eq!(settlement["invoice"]["status"], "PAID");
    let transaction_id = id(&settlement["transaction"]["id"]);

    let (status, refund) = send(
        &t.router,
        "POST",
        &format!("/v1/transactions/{}/refunds", transaction_id),
        Some(json!({ "amount": "10.00", "reason": "Downgrade" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(refund["transaction_type"], "REFUND");
    assert_eq!(money(&refund["amount"]), Decimal::new(-10, 0));

    let (status, remaining) = send(
        &t.router,
        "GET",
        &format!("/v1/transactions/{}/refundable", transaction_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(money(&remaining["remaining"]), Decimal::new(23, 0));

    let (status, _) = send(
        &t.router,
        "POST",
        &format!("/v1/transactions/{}/refunds", transaction_id),
        Some(json!({ "amount": "30.00", "reason": "Too much" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_activation_and_service_lifecycle() {
    let t = test_app().await;
    let order = place_order(&t).await;
    let order_id = id(&order["id"]);

    let (status, activation) = send(&t.router, "POST", &format!("/v1/orders/{}/activate", order_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(activation["order"]["status"], "ACTIVE");
    let services = activation["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    let service_id = id(&services[0]["id"]);

    let (status, service) = send(&t.router, "POST", &format!("/v1/services/{}/activate", service_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(service["status"], "ACTIVE");

    let (status, service) = send(&t.router, "POST", &format!("/v1/services/{}/suspend", service_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(service["status"], "SUSPENDED");

    let (status, _) = send(&t.router, "POST", &format!("/v1/services/{}/suspend", service_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&t.router, "POST", &format!("/v1/orders/{}/activate", order_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_error_statuses() {
    let t = test_app().await;

    let (status, body) = send(&t.router, "GET", &format!("/v1/orders/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("order"));

    let (status, _) = send(&t.router, "POST", "/v1/carts", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, cart) = send(
        &t.router,
        "POST",
        "/v1/carts",
        Some(json!({ "customer_id": t.customer_id })),
    )
    .await;
    let (status, _) = send(
        &t.router,
        "POST",
        "/v1/orders",
        Some(json!({ "customer_id": t.customer_id, "cart_id": cart["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &t.router,
        "POST",
        "/v1/subscriptions",
        Some(json!({
            "customer_id": t.customer_id,
            "gateway_id": t.gateway_id,
            "amount": "10.00",
            "currency": "USD",
            "billing_cycle": "monthly",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_gateway_webhook_signature() {
    let t = test_app().await;
    let payload = r#"{"type":"transfer.received","reference":"MAN-1"}"#;

    let forged = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/gateways/manual")
        .header(SIGNATURE_HEADER, "deadbeef")
        .body(Body::from(payload))
        .unwrap();
    let response = t.router.clone().oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let signature = stratus_webhook::sign_payload(WEBHOOK_SECRET, payload.as_bytes()).unwrap();
    let signed = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/gateways/manual")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(payload))
        .unwrap();
    let response = t.router.clone().oneshot(signed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let log: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(log["status"], "received");

    let (status, _) = send(&t.router, "POST", "/v1/webhooks/gateways/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_item_added_during_checkout_is_ordered_or_refused() {
    let t = test_app().await;
    let (_, cart) = send(
        &t.router,
        "POST",
        "/v1/carts",
        Some(json!({ "customer_id": t.customer_id })),
    )
    .await;
    let cart_id = id(&cart["id"]);
    let items_uri = format!("/v1/carts/{}/items", cart_id);
    let line = json!({ "product_id": t.product_id, "quantity": 1, "billing_cycle": "monthly" });
    let (status, _) = send(&t.router, "POST", &items_uri, Some(line.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let ((added, _), (ordered, order)) = tokio::join!(
        send(&t.router, "POST", &items_uri, Some(line)),
        send(
            &t.router,
            "POST",
            "/v1/orders",
            Some(json!({ "customer_id": t.customer_id, "cart_id": cart_id })),
        )
    );
    assert_eq!(ordered, StatusCode::CREATED);

    let items = order["items"].as_array().unwrap().len();
    match added {
        StatusCode::CREATED => assert_eq!(items, 2),
        StatusCode::NOT_FOUND => assert_eq!(items, 1),
        other => panic!("unexpected add status {}", other),
    }
    let (status, _) = send(&t.router, "GET", &format!("/v1/carts/{}", cart_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_racing_credit_payment_has_one_winner() {
    let t = test_app().await;
    let order = place_order(&t).await;
    let order_id = id(&order["id"]);
    let invoice_id = id(&order["invoice_id"]);
    let credit_uri = format!("/v1/customers/{}/credit", t.customer_id);
    let (status, _) = send(
        &t.router,
        "POST",
        &credit_uri,
        Some(json!({ "amount": "50.00", "reason": "Prepaid" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let cancel_uri = format!("/v1/orders/{}/cancel", order_id);
    let pay_uri = format!("/v1/invoices/{}/pay-with-credit", invoice_id);
    let ((cancelled, _), (paid, _)) = tokio::join!(
        send(&t.router, "POST", &cancel_uri, None),
        send(
            &t.router,
            "POST",
            &pay_uri,
            Some(json!({ "customer_id": t.customer_id, "amount": "33.00" })),
        )
    );

    let (_, stored) = send(&t.router, "GET", &format!("/v1/orders/{}", order_id), None).await;
    let (_, history) = send(&t.router, "GET", &credit_uri, None).await;
    let balance = money(&history[0]["balance_after"]);
    match (cancelled, paid) {
        (StatusCode::OK, StatusCode::CONFLICT) => {
            assert_eq!(stored["status"], "CANCELLED");
            assert_eq!(balance, Decimal::new(50, 0));
        }
        (StatusCode::CONFLICT, StatusCode::OK) => {
            assert_eq!(stored["status"], "PENDING");
            assert_eq!(balance, Decimal::new(17, 0));
        }
        other => panic!("expected exactly one winner, got {:?}", other),
    }
}
