pub mod access;
pub mod adapters;
pub mod api;
pub mod gateway;
pub mod models;
pub mod plans;
pub mod reconciliation;
pub mod scheduler;
pub mod service;

pub use access::check_access;
pub use adapters::{
    BillingCommands, BillingProviderResolver, CheckoutOptions, CheckoutResult,
    EntitlementQueries, ProcessorAdapter, ProviderCapabilities, ProviderCredentials, ProviderKind,
    ProviderSettings,
};
pub use models::{
    AccessDecision, PaymentEvent, PaymentEventType, PlanType, Subscription, SubscriptionAttrs,
    SubscriptionStatus, UsageLogEntry, UsageOptions, UsageStats, UsageTrackResult,
};
pub use plans::{BillingInterval, PlanCatalog, PlanDefinition};
pub use reconciliation::{
    start_reconciliation_worker, ProcessorEnvelope, ReconcileOutcome, Reconciler,
    ReconciliationHandle, ReconciliationJob,
};
pub use scheduler::{process_tick as run_usage_reset_tick, spawn as spawn_usage_reset_scheduler};
pub use service::BillingService;
