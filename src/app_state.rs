use crate::{
    config::Config,
    services::{
        Catalog, EntitlementLedger, FakeStoreGateway, PurchaseController, ReceiptValidator,
        SubscriptionEvaluator,
    },
};
use std::sync::Arc;

/// Services wired together from configuration
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub store: Arc<FakeStoreGateway>,
    pub ledger: Arc<EntitlementLedger>,
    pub controller: PurchaseController,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, anyhow::Error> {
        // Catalog is fixed for the lifetime of the process
        let catalog = Arc::new(Catalog::from_definitions(config.product_definitions()?)?);

        // Initialize services
        let validator = Arc::new(ReceiptValidator::from_config(&config.validation)?);
        let evaluator = SubscriptionEvaluator::new(&config.subscription);
        let store = Arc::new(FakeStoreGateway::from_config(&config.store)?);
        let ledger = Arc::new(EntitlementLedger::new());

        let controller = PurchaseController::new(
            catalog.clone(),
            validator,
            evaluator,
            store.clone(),
            ledger.clone(),
        );

        Ok(Self {
            catalog,
            store,
            ledger,
            controller,
            config: Arc::new(config),
        })
    }
}
