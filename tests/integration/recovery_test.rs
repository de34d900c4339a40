//! Controller behaviour when the store, the ledger or the offer data misbehave.

use crate::support::*;
use purchasekit::{
    models::{
        common::IAPPlatform,
        purchase::{CompletionOutcome, PurchaseEvent, PurchaseStatus, RestoreOutcome},
        subscription::{IntroductoryPriceInfo, SubscriptionPeriodUnit, SubscriptionState},
    },
    services::{EntitlementLedger, StoreEvent},
    PurchaseError,
};
use std::sync::Arc;

fn monthly_receipt(transaction_id: &str) -> purchasekit::models::receipt::Receipt {
    let mut transaction = app_store_transaction(MONTHLY, transaction_id);
    transaction.expires_date = Some(now_millis() + 30 * 86_400_000);
    sign_app_store(SECRET, MONTHLY, &transaction)
}

#[tokio::test]
async fn test_unrepresentable_intro_offer_keeps_event_loop_alive() {
    let mut gateway = RecordingGateway::new(IAPPlatform::AppStore);
    gateway.intro_prices.insert(
        MONTHLY.to_string(),
        IntroductoryPriceInfo::free_trial(20_000, SubscriptionPeriodUnit::Year),
    );
    let harness = Harness::new(gateway);
    harness.controller.initialize().await.unwrap();
    let mut events = harness.controller.subscribe();

    harness.controller.purchase(MONTHLY).await.unwrap();
    harness
        .gateway
        .send(StoreEvent::PurchaseCompleted(monthly_receipt("8000")));
    let event = wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(_))).await;
    let PurchaseEvent::Entitled(entitlement) = event else {
        unreachable!()
    };
    let status = entitlement.subscription.unwrap();
    assert!(!status.is_free_trial);
    assert_eq!(status.state, SubscriptionState::Active);

    // The same event loop still serves later purchases
    harness.controller.purchase(POTION).await.unwrap();
    harness
        .gateway
        .send(StoreEvent::PurchaseCompleted(app_store_receipt(POTION, "8001")));
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(en) if en.product_id == POTION)).await;

    assert_eq!(harness.ledger.grant_count().await, 2);
    assert!(harness.controller.in_flight(MONTHLY).await.is_none());
    assert!(harness.controller.in_flight(POTION).await.is_none());
}

#[tokio::test]
async fn test_store_intro_offer_marks_free_trial() {
    let mut gateway = RecordingGateway::new(IAPPlatform::AppStore);
    gateway.intro_prices.insert(
        MONTHLY.to_string(),
        IntroductoryPriceInfo::free_trial(1, SubscriptionPeriodUnit::Month),
    );
    let harness = Harness::new(gateway);
    harness.controller.initialize().await.unwrap();

    let outcome = harness
        .controller
        .on_purchase_completed(monthly_receipt("8100"))
        .await
        .unwrap();
    let CompletionOutcome::Entitled(entitlement) = outcome else {
        panic!("expected entitlement")
    };
    let status = entitlement.subscription.unwrap();
    assert!(status.is_free_trial);
    assert!(status.is_subscribed());
}

#[tokio::test]
async fn test_failed_grant_waits_for_redelivery() {
    let sink = Arc::new(FlakySink::failing(1));
    let harness = Harness::with_parts(
        Arc::new(RecordingGateway::new(IAPPlatform::AppStore)),
        validator(),
        sink.clone(),
        sink.ledger.clone(),
    );
    harness.controller.initialize().await.unwrap();

    let request_id = harness.controller.purchase(HELM).await.unwrap();
    let receipt = app_store_receipt(HELM, "8200");

    let error = harness
        .controller
        .on_purchase_completed(receipt.clone())
        .await
        .unwrap_err();
    assert!(matches!(error, PurchaseError::EntitlementGrant(_)));
    assert_eq!(error.code(), "ENTITLEMENT_GRANT_FAILED");

    let request = harness.controller.request(request_id).await.unwrap();
    assert_eq!(request.status, PurchaseStatus::Pending);
    assert!(harness.gateway.finished().is_empty());
    assert!(!harness.controller.is_entitled(HELM).await);
    assert_eq!(harness.ledger.grant_count().await, 0);

    // The store re-delivers the unacknowledged transaction
    let outcome = harness.controller.on_purchase_completed(receipt).await.unwrap();
    assert!(matches!(outcome, CompletionOutcome::Entitled(ref e) if e.request_id == Some(request_id)));
    assert_eq!(harness.gateway.finished(), vec!["8200"]);
    assert_eq!(harness.ledger.grant_count().await, 1);
    assert!(harness.controller.is_entitled(HELM).await);
}

#[tokio::test]
async fn test_grant_recorded_by_earlier_session_is_acknowledged() {
    let ledger = Arc::new(EntitlementLedger::new());
    let session = || {
        Harness::with_parts(
            Arc::new(RecordingGateway::new(IAPPlatform::AppStore)),
            validator(),
            ledger.clone(),
            ledger.clone(),
        )
    };

    let earlier = session();
    earlier.controller.initialize().await.unwrap();
    let first = earlier
        .controller
        .on_purchase_completed(app_store_receipt(HELM, "8300"))
        .await
        .unwrap();
    assert!(matches!(first, CompletionOutcome::Entitled(_)));

    // A fresh controller knows nothing, but the ledger already holds the grant
    let later = session();
    later.controller.initialize().await.unwrap();
    let outcome = later
        .controller
        .on_purchase_completed(app_store_receipt(HELM, "8300"))
        .await
        .unwrap();

    assert!(matches!(outcome, CompletionOutcome::AlreadyEntitled { ref transaction_id } if transaction_id == "8300"));
    assert_eq!(later.gateway.finished(), vec!["8300"]);
    assert!(later.controller.is_entitled(HELM).await);
    assert!(later
        .controller
        .entitlement(IAPPlatform::AppStore, "8300")
        .await
        .is_some());
    assert_eq!(ledger.grant_count().await, 1);
}

#[tokio::test]
async fn test_second_restore_refused_while_first_outstanding() {
    let mut gateway = RecordingGateway::new(IAPPlatform::AppStore);
    gateway.hold_restores = true;
    let harness = Harness::new(gateway);
    harness.controller.initialize().await.unwrap();
    let mut events = harness.controller.subscribe();

    assert_eq!(
        harness.controller.restore().await.unwrap(),
        RestoreOutcome::Requested
    );
    assert!(harness.controller.is_restoring().await);

    let second = harness.controller.restore().await;
    assert!(matches!(second, Err(PurchaseError::RestoreInProgress)));

    harness.gateway.release_restore();
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::RestoreFinished { accepted: true })).await;
    assert!(!harness.controller.is_restoring().await);

    // Allowed again once the first has finished
    assert_eq!(
        harness.controller.restore().await.unwrap(),
        RestoreOutcome::Requested
    );
    harness.gateway.release_restore();
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::RestoreFinished { .. })).await;
    assert_eq!(harness.gateway.restores(), 2);
}
