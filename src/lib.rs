pub mod admin;
pub mod authn;
pub mod authz;
pub mod chain;
pub mod config;
pub mod errors;
pub mod filters;
pub mod gateway;
pub mod metrics;
pub mod mqtt;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod sse;

pub use config::Config;
pub use errors::GatewayError;
pub use gateway::{AppState, Gateway};
