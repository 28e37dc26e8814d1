pub mod analytics;
pub mod audit;
pub mod billing;
pub mod config;
pub mod connect;
pub mod error;
pub mod extractor;
pub mod routes;
pub mod store;
pub mod webhooks;
