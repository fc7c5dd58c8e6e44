mod common;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use commissions_rs::models::{NewWebhookLogEntry, NotificationKind, Provider};
use commissions_rs::repos::{AccessRepo, NotificationRepo, ReferralRepo, WebhookRepo};
use commissions_rs::webhooks::signature::{sign_timestamped, STRIPE_SIGNATURE_HEADER};

use common::{body_json, coingate_callback, payment_id, spawn_app, stripe_event, yookassa_notification};

#[tokio::test]
async fn test_duplicate_webhook_grants_access_and_commission_once() {
    let app = spawn_app();
    let referrer_id = Uuid::new_v4();
    let product_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    app.create_referral(referrer_id, product_id, "10", "SPRING10").await;
    let payment = app
        .create_payment(user_id, product_id, "250.00", "coingate", Some("SPRING10"))
        .await;
    let order_id = payment_id(&payment);

    let callback = coingate_callback(order_id, "paid");
    for _ in 0..2 {
        let response = app.send_webhook("coingate", &callback).await;
        assert_eq!(response.status(), StatusCode::OK);
        let receipt = body_json(response).await;
        assert_eq!(receipt["received"], true);
        assert_eq!(receipt["orderId"], order_id.to_string());
    }

    let response = app.get(&format!("/api/payments/{}", order_id)).await;
    let payment = body_json(response).await;
    assert_eq!(payment["status"], "succeeded");
    assert_eq!(payment["provider_payment_id"], "3456789");

    let grants = app.store.grants_for_purchase(order_id).await.unwrap();
    assert_eq!(grants.len(), 1, "exactly one access grant per purchase");
    assert_eq!(grants[0].user_id, user_id);

    let conversions = app.store.conversions_for_purchase(order_id).await.unwrap();
    assert_eq!(conversions.len(), 1, "exactly one commission per purchase");
    assert_eq!(conversions[0].commission_amount.to_string(), "25.00");

    let notifications = app.store.notifications_for_user(user_id).await.unwrap();
    let purchase_notes = notifications
        .iter()
        .filter(|n| n.kind == NotificationKind::PurchaseCompleted)
        .count();
    assert_eq!(purchase_notes, 1, "duplicate delivery must not notify twice");
}

#[tokio::test]
async fn test_coingate_status_sequence_reaches_succeeded() {
    let app = spawn_app();
    let payment = app
        .create_payment(Uuid::new_v4(), Uuid::new_v4(), "19.99", "coingate", None)
        .await;
    let order_id = payment_id(&payment);

    for status in ["pending", "confirming", "paid"] {
        let response = app.send_webhook("coingate", &coingate_callback(order_id, status)).await;
        assert_eq!(response.status(), StatusCode::OK, "status {}", status);
    }

    let payment = body_json(app.get(&format!("/api/payments/{}", order_id)).await).await;
    assert_eq!(payment["status"], "succeeded");

    // Late out-of-order delivery is acknowledged and ignored
    let response = app.send_webhook("coingate", &coingate_callback(order_id, "expired")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let payment = body_json(app.get(&format!("/api/payments/{}", order_id)).await).await;
    assert_eq!(payment["status"], "succeeded");
}

#[tokio::test]
async fn test_unhandled_status_is_acknowledged() {
    let app = spawn_app();
    let payment = app
        .create_payment(Uuid::new_v4(), Uuid::new_v4(), "19.99", "coingate", None)
        .await;
    let order_id = payment_id(&payment);

    let response = app.send_webhook("coingate", &coingate_callback(order_id, "new")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let payment = body_json(app.get(&format!("/api/payments/{}", order_id)).await).await;
    assert_eq!(payment["status"], "pending");
}

#[tokio::test]
async fn test_stripe_event_without_order_is_acknowledged() {
    let app = spawn_app();
    let payload = json!({
        "id": "evt_customer",
        "type": "customer.created",
        "data": { "object": { "id": "cus_1" } }
    });

    let response = app.send_webhook("stripe", &payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = body_json(response).await;
    assert_eq!(receipt["received"], true);
    assert!(receipt.get("orderId").is_none());

    // Logged as processed, so the provider stops retrying it
    assert!(app.store.failed_webhooks(10).await.unwrap().is_empty());
    let response = app.send_webhook("stripe", &payload).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_invalid_signature_is_rejected_and_logged() {
    let app = spawn_app();
    let payment = app
        .create_payment(Uuid::new_v4(), Uuid::new_v4(), "10.00", "coingate", None)
        .await;
    let order_id = payment_id(&payment);
    let body = serde_json::to_string(&coingate_callback(order_id, "paid")).unwrap();

    let response = app
        .send_raw_webhook(
            "coingate",
            &body,
            Some(("x-coingate-signature", "deadbeef".repeat(8))),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error = body_json(response).await;
    assert_eq!(error["error"], "signature_error");

    let payment = body_json(app.get(&format!("/api/payments/{}", order_id)).await).await;
    assert_eq!(payment["status"], "pending", "unsigned callback must not change state");

    let failed = body_json(app.get("/api/admin/webhooks/failed").await).await;
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["event_type"], "signature_rejected");
}

#[tokio::test]
async fn test_missing_signature_is_bad_request() {
    let app = spawn_app();
    let body = serde_json::to_string(&coingate_callback(Uuid::new_v4(), "paid")).unwrap();

    let response = app.send_raw_webhook("coingate", &body, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stale_stripe_timestamp_is_rejected() {
    let app = spawn_app();
    let payment = app
        .create_payment(Uuid::new_v4(), Uuid::new_v4(), "10.00", "stripe", None)
        .await;
    let body = serde_json::to_string(&stripe_event(
        "evt_stale",
        "payment_intent.succeeded",
        payment_id(&payment),
    ))
    .unwrap();
    let an_hour_ago = Utc::now().timestamp() - 3600;
    let header = sign_timestamped(common::STRIPE_SECRET, body.as_bytes(), an_hour_ago).unwrap();

    let response = app
        .send_raw_webhook("stripe", &body, Some((STRIPE_SIGNATURE_HEADER, header)))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let app = spawn_app();
    let response = app
        .send_raw_webhook("paypal", "{}", Some(("x-signature", "abc".to_string())))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error = body_json(response).await;
    assert_eq!(error["error"], "unknown_provider");
}

#[tokio::test]
async fn test_unknown_order_is_bad_request_and_marked_failed() {
    let app = spawn_app();
    let response = app
        .send_webhook("coingate", &coingate_callback(Uuid::new_v4(), "paid"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let failed = app.store.failed_webhooks(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].provider, Provider::Coingate);
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("not found"));
}

#[tokio::test]
async fn test_non_uuid_order_reference_is_bad_request() {
    let app = spawn_app();
    let payload = json!({ "id": 1, "order_id": "order-42", "status": "paid" });
    let response = app.send_webhook("coingate", &payload).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_payload_is_bad_request() {
    let app = spawn_app();
    let payload = json!({ "id": "evt_1", "type": "payment_intent.succeeded", "data": { "object": { "id": "pi_1" } } });
    let response = app.send_webhook("stripe", &payload).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let failed = app.store.failed_webhooks(10).await.unwrap();
    assert_eq!(failed[0].event_type.as_deref(), Some("unparseable"));
}

#[tokio::test]
async fn test_stripe_refund_revokes_access_and_voids_commission() {
    let app = spawn_app();
    let referrer_id = Uuid::new_v4();
    let product_id = Uuid::new_v4();
    app.create_referral(referrer_id, product_id, "20", "STRIPE20").await;
    let payment = app
        .create_payment(Uuid::new_v4(), product_id, "50.00", "stripe", Some("STRIPE20"))
        .await;
    let order_id = payment_id(&payment);

    let response = app
        .send_webhook("stripe", &stripe_event("evt_paid", "payment_intent.succeeded", order_id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let balance = body_json(app.get(&format!("/api/partners/{}/balance", referrer_id)).await).await;
    assert_eq!(balance["total_earned"], "10.00");

    let response = app
        .send_webhook("stripe", &stripe_event("evt_refund", "charge.refunded", order_id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let payment = body_json(app.get(&format!("/api/payments/{}", order_id)).await).await;
    assert_eq!(payment["status"], "refunded");

    let grants = app.store.grants_for_purchase(order_id).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert!(grants[0].revoked_at.is_some());

    let balance = body_json(app.get(&format!("/api/partners/{}/balance", referrer_id)).await).await;
    assert_eq!(balance["available"], "0");
}

#[tokio::test]
async fn test_yookassa_success_grants_access() {
    let app = spawn_app();
    let payment = app
        .create_payment(Uuid::new_v4(), Uuid::new_v4(), "990.00", "yookassa", None)
        .await;
    let order_id = payment_id(&payment);

    let response = app
        .send_webhook(
            "yookassa",
            &yookassa_notification("payment.succeeded", "2d1e5f3a-000f-5000-9000-1b2c3d4e5f60", order_id),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let grants = body_json(app.get(&format!("/api/payments/{}/access", order_id)).await).await;
    let grants = grants.as_array().unwrap();
    assert_eq!(grants.len(), 1);

    let grant_id = grants[0]["id"].as_str().unwrap();
    let response = app.post_empty(&format!("/api/access/{}/downloads", grant_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["download_count"], 1);
}

#[tokio::test]
async fn test_replay_reprocesses_failed_delivery() {
    let app = spawn_app();
    let payment = app
        .create_payment(Uuid::new_v4(), Uuid::new_v4(), "15.00", "coingate", None)
        .await;
    let order_id = payment_id(&payment);

    // A delivery that failed after logging, e.g. on a transient storage error
    let entry = app
        .store
        .record_webhook(NewWebhookLogEntry {
            provider: Provider::Coingate,
            event_id: Some("3456789:paid".to_string()),
            event_type: Some("paid".to_string()),
            order_ref: Some(order_id.to_string()),
            payload: coingate_callback(order_id, "paid"),
        })
        .await
        .unwrap();
    app.store
        .mark_webhook_failed(entry.id, "connection reset")
        .await
        .unwrap();

    let response = app
        .post_empty(&format!("/api/admin/webhooks/{}/replay", entry.id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let payment = body_json(app.get(&format!("/api/payments/{}", order_id)).await).await;
    assert_eq!(payment["status"], "succeeded");
    assert!(app.store.failed_webhooks(10).await.unwrap().is_empty());

    // Processed entries cannot be replayed again
    let response = app
        .post_empty(&format!("/api/admin/webhooks/{}/replay", entry.id))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_replay_refuses_signature_rejected_delivery() {
    let app = spawn_app();
    let body = serde_json::to_string(&coingate_callback(Uuid::new_v4(), "paid")).unwrap();
    let response = app
        .send_raw_webhook("coingate", &body, Some(("x-coingate-signature", "00".repeat(32))))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let failed = app.store.failed_webhooks(10).await.unwrap();
    let response = app
        .post_empty(&format!("/api/admin/webhooks/{}/replay", failed[0].id))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
