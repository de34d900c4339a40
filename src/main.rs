use purchasekit::{
    models::purchase::{PurchaseEvent, RestoreOutcome},
    AppState, Config, PurchaseError,
};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the sandbox waits for more store events before moving on
const QUIET_PERIOD: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,purchasekit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting purchasekit sandbox");

    // Load configuration
    let config = Config::load()?;

    tracing::info!(
        "Loaded configuration - Store: {}, {} catalog entries",
        config.store.platform,
        config.catalog.len()
    );

    // Initialize application state
    let state = AppState::new(config)?;
    let controller = &state.controller;
    let mut events = controller.subscribe();

    controller.initialize().await?;
    drain(&mut events).await;

    // Buy everything once, in catalog order
    for entry in &state.config.catalog {
        match controller.purchase(&entry.id).await {
            Ok(request_id) => tracing::debug!(product_id = %entry.id, %request_id, "Requested purchase"),
            Err(e) => tracing::warn!(product_id = %entry.id, code = e.code(), "Purchase refused: {}", e),
        }
    }
    drain(&mut events).await;

    for product_id in &state.config.store.deferred_products {
        tracing::info!(%product_id, "Approving deferred purchase");
        state.store.approve_deferred(product_id).await?;
    }
    drain(&mut events).await;

    match controller.restore().await {
        Ok(RestoreOutcome::Requested) => drain(&mut events).await,
        Ok(RestoreOutcome::HandledAutomatically) => {
            tracing::info!("Store restores purchases on its own")
        }
        Err(e @ PurchaseError::RestoreNotSupported { .. }) => tracing::info!("{}", e),
        Err(e) => return Err(e.into()),
    }

    for entry in state.ledger.entries().await {
        tracing::info!(
            product_id = %entry.entitlement.product_id,
            transaction_id = %entry.entitlement.transaction_id,
            recorded_at = %entry.recorded_at,
            "Ledger entry"
        );
    }
    for entry in &state.config.catalog {
        if let Some(payout) = &entry.payout {
            tracing::info!(
                subtype = %payout.subtype,
                balance = state.ledger.balance(&payout.subtype).await,
                "Payout balance"
            );
        }
    }

    Ok(())
}

/// Log controller events until the store goes quiet
async fn drain(events: &mut broadcast::Receiver<PurchaseEvent>) {
    loop {
        match tokio::time::timeout(QUIET_PERIOD, events.recv()).await {
            Ok(Ok(event)) => log_event(&event),
            Ok(Err(RecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "Event log fell behind")
            }
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        }
    }
}

fn log_event(event: &PurchaseEvent) {
    match event {
        PurchaseEvent::Initialized => tracing::info!("Store ready"),
        PurchaseEvent::InitializationFailed(e) => tracing::error!("{}", e),
        PurchaseEvent::PurchaseStarted { product_id, .. } => {
            tracing::info!(%product_id, "Purchasing")
        }
        PurchaseEvent::Deferred { product_id } => {
            tracing::info!(%product_id, "Waiting for approval")
        }
        PurchaseEvent::Entitled(entitlement) => tracing::info!(
            product_id = %entitlement.product_id,
            payout = ?entitlement.payout,
            subscription = ?entitlement.subscription,
            "Granted"
        ),
        PurchaseEvent::Rejected {
            product_id, error, ..
        } => tracing::warn!(%product_id, "Rejected: {}", error),
        PurchaseEvent::Failed {
            product_id, reason, ..
        } => tracing::warn!(%product_id, reason = reason.as_str(), "Failed"),
        PurchaseEvent::RestoreFinished { accepted } => {
            tracing::info!(accepted, "Restore finished")
        }
    }
}
