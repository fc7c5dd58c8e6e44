//! Shared helpers for the HTTP-level tests
//!
//! Every test gets its own `InMemoryStore`, so tests are independent and need
//! no database. The dispatch receiver is held but never drained: payouts that
//! get enqueued stay `pending` until a test dispatches them explicitly.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use commissions_rs::providers::{MockPayoutProvider, PayoutProvider, ProviderRegistry};
use commissions_rs::repos::{InMemoryStore, Store};
use commissions_rs::services::dispatcher::DispatchReceiver;
use commissions_rs::webhooks::signature::{
    sign_hex, sign_timestamped, COINGATE_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER,
    YOOKASSA_SIGNATURE_HEADER,
};
use commissions_rs::webhooks::WebhookSecrets;
use commissions_rs::{routes, AppState, ServiceSettings};

pub const COINGATE_SECRET: &str = "cg_test_secret";
pub const STRIPE_SECRET: &str = "whsec_test_secret";
pub const YOOKASSA_SECRET: &str = "yk_test_secret";

pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: InMemoryStore,
    pub router: Router,
    _receiver: DispatchReceiver,
}

pub fn test_settings() -> ServiceSettings {
    ServiceSettings {
        webhook_secrets: WebhookSecrets {
            coingate: COINGATE_SECRET.to_string(),
            stripe: STRIPE_SECRET.to_string(),
            yookassa: YOOKASSA_SECRET.to_string(),
        },
        ..ServiceSettings::default()
    }
}

/// App wired with the mock payout provider and default settings
pub fn spawn_app() -> TestApp {
    spawn_app_with(Arc::new(MockPayoutProvider::new()), test_settings())
}

pub fn spawn_app_with(provider: Arc<dyn PayoutProvider>, settings: ServiceSettings) -> TestApp {
    let store = InMemoryStore::new();
    spawn_app_on(Arc::new(store.clone()), store, provider, settings)
}

/// App wired to `backend`, which must share its state with `store` so tests
/// can inspect what the services wrote
pub fn spawn_app_on(
    backend: Arc<dyn Store>,
    store: InMemoryStore,
    provider: Arc<dyn PayoutProvider>,
    settings: ServiceSettings,
) -> TestApp {
    let (state, receiver) = AppState::build(backend, ProviderRegistry::uniform(provider), settings);
    TestApp {
        router: routes::router(state.clone()),
        state,
        store,
        _receiver: receiver,
    }
}

impl TestApp {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> Response<Body> {
        self.request(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn post_empty(&self, uri: &str) -> Response<Body> {
        self.request(Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Deliver a correctly signed webhook for `provider`
    pub async fn send_webhook(&self, provider: &str, payload: &Value) -> Response<Body> {
        let body = serde_json::to_string(payload).unwrap();
        let (header, signature) = sign_for(provider, &body);
        self.send_raw_webhook(provider, &body, Some((header, signature))).await
    }

    pub async fn send_raw_webhook(
        &self,
        provider: &str,
        body: &str,
        signature: Option<(&str, String)>,
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/webhooks/{}", provider))
            .header("content-type", "application/json");
        if let Some((header, value)) = signature {
            builder = builder.header(header, value);
        }
        self.request(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Create a pending USD payment through the checkout endpoint
    pub async fn create_payment(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        amount: &str,
        provider: &str,
        referral_code: Option<&str>,
    ) -> Value {
        self.create_payment_in(user_id, product_id, amount, "USD", provider, referral_code)
            .await
    }

    pub async fn create_payment_in(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        amount: &str,
        currency: &str,
        provider: &str,
        referral_code: Option<&str>,
    ) -> Value {
        let response = self
            .post_json(
                "/api/payments",
                &json!({
                    "user_id": user_id,
                    "product_id": product_id,
                    "amount": amount,
                    "currency": currency,
                    "provider": provider,
                    "referral_code": referral_code,
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    pub async fn create_referral(
        &self,
        referrer_id: Uuid,
        product_id: Uuid,
        percent: &str,
        code: &str,
    ) -> Value {
        let response = self
            .post_json(
                "/api/referrals",
                &json!({
                    "referrer_id": referrer_id,
                    "product_id": product_id,
                    "commission_percent": percent,
                    "code": code,
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    /// Referral + referred USD purchase confirmed via a CoinGate `paid`
    /// callback. Returns the payment id.
    pub async fn referred_purchase(&self, referrer_id: Uuid, amount: &str, percent: &str) -> Uuid {
        self.referred_purchase_in(referrer_id, amount, "USD", percent).await
    }

    pub async fn referred_purchase_in(
        &self,
        referrer_id: Uuid,
        amount: &str,
        currency: &str,
        percent: &str,
    ) -> Uuid {
        let product_id = Uuid::new_v4();
        let code = format!("ref-{}", Uuid::new_v4().simple());
        self.create_referral(referrer_id, product_id, percent, &code).await;
        let payment = self
            .create_payment_in(Uuid::new_v4(), product_id, amount, currency, "coingate", Some(&code))
            .await;
        let payment_id = payment_id(&payment);

        let response = self
            .send_webhook("coingate", &coingate_callback(payment_id, "paid"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        payment_id
    }
}

pub fn sign_for(provider: &str, body: &str) -> (&'static str, String) {
    match provider {
        "coingate" => (COINGATE_SIGNATURE_HEADER, sign_hex(COINGATE_SECRET, body.as_bytes()).unwrap()),
        "yookassa" => (YOOKASSA_SIGNATURE_HEADER, sign_hex(YOOKASSA_SECRET, body.as_bytes()).unwrap()),
        "stripe" => (
            STRIPE_SIGNATURE_HEADER,
            sign_timestamped(STRIPE_SECRET, body.as_bytes(), Utc::now().timestamp()).unwrap(),
        ),
        other => panic!("no signing scheme for {}", other),
    }
}

/// Read response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn payment_id(payment: &Value) -> Uuid {
    payment["id"].as_str().unwrap().parse().unwrap()
}

pub fn coingate_callback(order_id: Uuid, status: &str) -> Value {
    json!({
        "id": 3456789,
        "order_id": order_id.to_string(),
        "status": status,
        "price_amount": "250.00",
        "price_currency": "USD",
        "receive_currency": "BTC"
    })
}

pub fn stripe_event(event_id: &str, event_type: &str, order_id: Uuid) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "data": {
            "object": {
                "id": "ch_test_123",
                "payment_intent": "pi_test_123",
                "amount": 25000,
                "currency": "usd",
                "metadata": { "order_id": order_id.to_string() }
            }
        }
    })
}

pub fn yookassa_notification(event: &str, object_id: &str, order_id: Uuid) -> Value {
    json!({
        "type": "notification",
        "event": event,
        "object": {
            "id": object_id,
            "status": "succeeded",
            "amount": { "value": "250.00", "currency": "RUB" },
            "metadata": { "order_id": order_id.to_string() }
        }
    })
}

/// A period that contains every conversion created during the test
pub fn current_period() -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    (now - Duration::days(1), now + Duration::days(1))
}
