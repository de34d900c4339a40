// Service modules
pub mod catalog;
pub mod fake_store;
pub mod ledger;
pub mod purchase_controller;
pub mod receipt_validator;
pub mod store_gateway;
pub mod subscription_evaluator;

pub use catalog::Catalog;
pub use fake_store::{FakeStoreBehavior, FakeStoreGateway, ReceiptSigner};
pub use ledger::{EntitlementLedger, EntitlementSink, GrantResult};
pub use purchase_controller::PurchaseController;
pub use receipt_validator::{ReceiptValidator, ReceiptVerifier, TrustBundle};
pub use store_gateway::{StoreEvent, StoreEventReceiver, StoreEventSender, StoreGateway};
pub use subscription_evaluator::SubscriptionEvaluator;
