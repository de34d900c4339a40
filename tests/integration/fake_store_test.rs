//! End to end through the simulated store, wired from configuration.

use crate::support::{wait_for, HELM, MONTHLY, POTION, SECRET};
use purchasekit::{
    models::purchase::{PurchaseEvent, RestoreOutcome},
    AppState, Config, PurchaseError,
};

fn config(platform: &str, extra_store: &str) -> Config {
    let yaml = format!(
        r#"
store:
  platform: {platform}
  app_identifier: com.example.game
  signing_secret: {SECRET}
{extra_store}
validation:
  app_identifier: com.example.game
  apple:
    algorithm: HS256
    secret: {SECRET}
  google:
    algorithm: HS256
    secret: {SECRET}
catalog:
  - id: {POTION}
    kind: consumable
    payout:
      payout_type: resource
      subtype: health
      quantity: 50
  - id: {HELM}
    kind: non_consumable
    payout:
      payout_type: item
      subtype: gold_helm
      quantity: 1
  - id: {MONTHLY}
    kind: subscription
    platform_ids:
      google_play: monthly_access
"#
    );
    Config::from_yaml(&yaml).expect("valid config")
}

#[tokio::test]
async fn test_app_store_purchase_and_restore() {
    let state = AppState::new(config("app_store", "")).unwrap();
    let controller = &state.controller;
    let mut events = controller.subscribe();

    controller.initialize().await.unwrap();

    controller.purchase(POTION).await.unwrap();
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(en) if en.product_id == POTION)).await;

    controller.purchase(HELM).await.unwrap();
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(en) if en.product_id == HELM)).await;

    controller.purchase(MONTHLY).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(en) if en.product_id == MONTHLY)).await;
    let PurchaseEvent::Entitled(subscription) = event else {
        unreachable!()
    };
    assert!(subscription.subscription.unwrap().is_subscribed());

    assert_eq!(state.ledger.grant_count().await, 3);
    assert_eq!(state.ledger.balance("health").await, 50.0);
    assert_eq!(state.store.finished_transactions().await.len(), 3);

    // Restore re-delivers the helm and the subscription; neither is granted twice
    assert_eq!(controller.restore().await.unwrap(), RestoreOutcome::Requested);
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::RestoreFinished { accepted: true })).await;
    // Re-deliveries are queued ahead of any later event
    controller.purchase(POTION).await.unwrap();
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(en) if en.product_id == POTION)).await;

    assert_eq!(state.ledger.grant_count().await, 4);
    assert_eq!(state.ledger.balance("health").await, 100.0);
    assert!(controller.is_entitled(HELM).await);
}

#[tokio::test]
async fn test_declined_purchase_on_google_play() {
    let state = AppState::new(config(
        "google_play",
        "  declined_products:\n    - gold_helm_rare\n",
    ))
    .unwrap();
    let controller = &state.controller;
    let mut events = controller.subscribe();
    controller.initialize().await.unwrap();

    let request_id = controller.purchase(HELM).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, PurchaseEvent::Failed { .. })).await;
    assert!(matches!(event, PurchaseEvent::Failed { request_id: Some(id), .. } if id == request_id));
    assert!(!controller.is_entitled(HELM).await);

    controller.purchase(MONTHLY).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(_))).await;
    let PurchaseEvent::Entitled(entitlement) = event else {
        unreachable!()
    };
    assert_eq!(entitlement.product_id, MONTHLY);
    assert!(entitlement.subscription.unwrap().is_auto_renewing);

    assert_eq!(
        controller.restore().await.unwrap(),
        RestoreOutcome::HandledAutomatically
    );
}

#[tokio::test]
async fn test_deferred_purchase_approved_later() {
    let state = AppState::new(config(
        "app_store",
        "  deferred_products:\n    - gold_helm_rare\n",
    ))
    .unwrap();
    let controller = &state.controller;
    let mut events = controller.subscribe();
    controller.initialize().await.unwrap();

    controller.purchase(HELM).await.unwrap();
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::Deferred { .. })).await;
    assert!(controller.in_flight(HELM).await.unwrap().deferred);

    state.store.approve_deferred(HELM).await.unwrap();
    wait_for(&mut events, |e| matches!(e, PurchaseEvent::Entitled(_))).await;
    assert!(controller.in_flight(HELM).await.is_none());
    assert!(controller.is_entitled(HELM).await);
}

#[tokio::test]
async fn test_store_refusing_to_initialize() {
    let state = AppState::new(config(
        "app_store",
        "  fail_initialization: service_unavailable\n",
    ))
    .unwrap();

    let error = state.controller.initialize().await.unwrap_err();
    assert!(matches!(error, PurchaseError::Initialization(_)));
    assert!(matches!(
        state.controller.purchase(POTION).await,
        Err(PurchaseError::NotReady)
    ));
}

#[test]
fn test_unknown_platform_rejected() {
    let result = AppState::new(config("amiga_store", ""));
    assert!(result.is_err());
}
