//! PgStore against a real database
//!
//! Set `DATABASE_URL` to run; without it every test returns early.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

use commissions_rs::db::{init_pool, run_migrations};
use commissions_rs::models::{
    NewConversion, NewPayment, NewPayout, NewReferral, NewWebhookLogEntry, PaymentMethod,
    PaymentStatus, PayoutStatus, PayoutUpdate, Provider, WebhookStatus,
};
use commissions_rs::repos::{
    AccessRepo, PaymentRepo, PayoutGuard, PayoutInsert, PayoutRepo, PgStore, ReferralRepo,
    WebhookRepo,
};

async fn setup_store() -> Option<PgStore> {
    dotenvy::dotenv().ok();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping Postgres store test");
        return None;
    };
    let pool = init_pool(&database_url)
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool).await.expect("Failed to run migrations");
    Some(PgStore::new(pool))
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// Referral plus one verified USD conversion worth `commission`
async fn seed_commission(store: &PgStore, referrer_id: Uuid, commission: &str) -> Uuid {
    seed_commission_in(store, referrer_id, commission, "USD").await
}

async fn seed_commission_in(
    store: &PgStore,
    referrer_id: Uuid,
    commission: &str,
    currency: &str,
) -> Uuid {
    let product_id = Uuid::new_v4();
    let referral = store
        .insert_referral(NewReferral {
            referrer_id,
            product_id: Some(product_id),
            shop_id: None,
            commission_percent: d("10"),
            code: format!("pg-{}", Uuid::new_v4().simple()),
        })
        .await
        .unwrap();
    let purchase_id = Uuid::new_v4();
    store
        .insert_conversion_if_absent(NewConversion {
            referral_id: referral.id,
            referrer_id,
            purchase_id,
            purchase_amount: d(commission) * d("10"),
            commission_amount: d(commission),
            currency: currency.to_string(),
        })
        .await
        .unwrap();
    purchase_id
}

fn new_payout(referrer_id: Uuid, total: &str) -> NewPayout {
    let now = Utc::now();
    NewPayout {
        referrer_id,
        period_start: now - Duration::days(30),
        period_end: now,
        currency: "USD".to_string(),
        total_amount: d(total),
        fee_amount: Decimal::ZERO,
        net_amount: d(total),
        payment_method: PaymentMethod::Crypto,
        payment_details: json!({ "wallet": "bc1qtest" }),
        notes: None,
        requeued_from: None,
    }
}

#[tokio::test]
#[serial]
async fn test_payment_status_compare_and_set() {
    let Some(store) = setup_store().await else { return };

    let payment = store
        .insert_payment(NewPayment {
            user_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            shop_id: None,
            amount: d("49.99"),
            currency: "USD".to_string(),
            provider: Provider::Stripe,
            referral_code: None,
        })
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    let updated = store
        .update_payment_status(
            payment.id,
            PaymentStatus::Pending,
            PaymentStatus::Succeeded,
            Some("pi_123".to_string()),
            json!({ "stripe_event_type": "payment_intent.succeeded" }),
        )
        .await
        .unwrap()
        .expect("first transition applies");
    assert_eq!(updated.status, PaymentStatus::Succeeded);
    assert_eq!(updated.metadata["stripe_event_type"], "payment_intent.succeeded");

    // Stale expectation loses
    let stale = store
        .update_payment_status(
            payment.id,
            PaymentStatus::Pending,
            PaymentStatus::Cancelled,
            None,
            json!({}),
        )
        .await
        .unwrap();
    assert!(stale.is_none());
}

#[tokio::test]
#[serial]
async fn test_grant_insert_is_idempotent() {
    let Some(store) = setup_store().await else { return };
    let (user_id, product_id, purchase_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let first = store
        .insert_grant_if_absent(user_id, product_id, purchase_id, None)
        .await
        .unwrap();
    let second = store
        .insert_grant_if_absent(user_id, product_id, purchase_id, None)
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.value.id, second.value.id);
    assert_eq!(store.revoke_grants_for_purchase(purchase_id).await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn test_duplicate_period_and_balance_guards() {
    let Some(store) = setup_store().await else { return };
    let referrer_id = Uuid::new_v4();
    seed_commission(&store, referrer_id, "100.00").await;

    let new = new_payout(referrer_id, "100.00");
    let created = match store.insert_payout(new.clone(), PayoutGuard::UniquePeriod).await.unwrap() {
        PayoutInsert::Created(payout) => payout,
        other => panic!("expected created, got {:?}", other),
    };

    match store.insert_payout(new, PayoutGuard::UniquePeriod).await.unwrap() {
        PayoutInsert::DuplicatePeriod { existing_id } => assert_eq!(existing_id, created.id),
        other => panic!("expected duplicate, got {:?}", other),
    }

    let mut other_period = new_payout(referrer_id, "0.01");
    other_period.period_start = other_period.period_start - Duration::days(60);
    match store.insert_payout(other_period, PayoutGuard::UniquePeriod).await.unwrap() {
        PayoutInsert::InsufficientBalance { available } => assert_eq!(available, Decimal::ZERO),
        other => panic!("expected insufficient balance, got {:?}", other),
    }
}

#[tokio::test]
#[serial]
async fn test_concurrent_inserts_for_one_period_create_one_payout() {
    let Some(store) = setup_store().await else { return };
    let referrer_id = Uuid::new_v4();
    seed_commission(&store, referrer_id, "100.00").await;

    let new = new_payout(referrer_id, "100.00");
    let (left, right) = (store.clone(), store.clone());
    let (first, second) = tokio::join!(
        left.insert_payout(new.clone(), PayoutGuard::UniquePeriod),
        right.insert_payout(new, PayoutGuard::UniquePeriod),
    );

    let (created, other) = match (first.unwrap(), second.unwrap()) {
        (PayoutInsert::Created(payout), other) | (other, PayoutInsert::Created(payout)) => (payout, other),
        (a, b) => panic!("expected one created payout, got {:?} and {:?}", a, b),
    };
    match other {
        PayoutInsert::DuplicatePeriod { existing_id } => assert_eq!(existing_id, created.id),
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(store.payouts_for_referrer(referrer_id).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_payouts_and_balances_are_kept_per_currency() {
    let Some(store) = setup_store().await else { return };
    let referrer_id = Uuid::new_v4();
    seed_commission(&store, referrer_id, "100.00").await;

    let mut btc = new_payout(referrer_id, "10.00000000");
    btc.currency = "BTC".to_string();
    match store.insert_payout(btc.clone(), PayoutGuard::UniquePeriod).await.unwrap() {
        PayoutInsert::InsufficientBalance { available } => assert_eq!(available, Decimal::ZERO),
        other => panic!("USD earnings must not fund a BTC payout, got {:?}", other),
    }

    seed_commission_in(&store, referrer_id, "50.00000000", "BTC").await;
    let usd = new_payout(referrer_id, "100.00");
    btc.period_start = usd.period_start;
    btc.period_end = usd.period_end;
    btc.total_amount = d("50.00000000");
    btc.net_amount = d("50.00000000");

    let PayoutInsert::Created(usd_payout) = store
        .insert_payout(usd, PayoutGuard::UniquePeriod)
        .await
        .unwrap()
    else {
        panic!("USD payout should be created");
    };
    let PayoutInsert::Created(btc_payout) = store
        .insert_payout(btc, PayoutGuard::UniquePeriod)
        .await
        .unwrap()
    else {
        panic!("BTC payout for the same period should be created");
    };
    assert_eq!(usd_payout.currency, "USD");
    assert_eq!(btc_payout.currency, "BTC");

    let balance = store.partner_balance(referrer_id, "BTC").await.unwrap();
    assert_eq!(balance.total_earned, d("50"));
    assert_eq!(balance.requested, d("50"));
    let total = store
        .verified_commission_total(referrer_id, "USD", Utc::now() - Duration::days(1), Utc::now())
        .await
        .unwrap();
    assert_eq!(total, d("100"));
}

#[tokio::test]
#[serial]
async fn test_payout_transitions_are_forward_only() {
    let Some(store) = setup_store().await else { return };
    let referrer_id = Uuid::new_v4();
    seed_commission(&store, referrer_id, "80.00").await;

    let PayoutInsert::Created(payout) = store
        .insert_payout(new_payout(referrer_id, "80.00"), PayoutGuard::NoOpenPayout)
        .await
        .unwrap()
    else {
        panic!("payout should be created");
    };

    let processing = store
        .transition_payout(payout.id, PayoutStatus::Pending, PayoutStatus::Processing, PayoutUpdate::default())
        .await
        .unwrap();
    assert!(processing.is_some());

    let paid = store
        .transition_payout(
            payout.id,
            PayoutStatus::Processing,
            PayoutStatus::Paid,
            PayoutUpdate {
                external_transaction_id: Some("tx_1".to_string()),
                failure_reason: None,
            },
        )
        .await
        .unwrap()
        .expect("processing -> paid applies");
    assert_eq!(paid.external_transaction_id.as_deref(), Some("tx_1"));

    let again = store
        .transition_payout(payout.id, PayoutStatus::Pending, PayoutStatus::Processing, PayoutUpdate::default())
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
#[serial]
async fn test_webhook_redelivery_bumps_attempt_count() {
    let Some(store) = setup_store().await else { return };
    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let entry = || NewWebhookLogEntry {
        provider: Provider::Stripe,
        event_id: Some(event_id.clone()),
        event_type: Some("payment_intent.succeeded".to_string()),
        order_ref: Some(Uuid::new_v4().to_string()),
        payload: json!({ "id": event_id }),
    };

    let first = store.record_webhook(entry()).await.unwrap();
    store.mark_webhook_processed(first.id).await.unwrap();
    let second = store.record_webhook(entry()).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.attempt_count, 2);
    assert_eq!(second.status, WebhookStatus::Processed);
}
