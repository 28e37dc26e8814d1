pub mod api;
pub mod fees;
pub mod gateway;
pub mod models;
pub mod service;
pub mod status;

pub use fees::{application_fee_for, calculate_fee, ApplicationFee, FeeSplit};
pub use gateway::{ConnectGateway, StripeConnectGateway};
pub use models::{
    AccountSnapshot, AccountStatus, ClientPayment, ClientProduct, ConnectedAccount, PaymentStatus,
    ProductInterval,
};
pub use service::{ConnectService, ConnectSettings};
pub use status::derive_status;
