pub mod config;
pub mod conversation;
pub mod effects;
pub mod error;
pub mod ledger;
pub mod messages;
pub mod model;
pub mod registry;
pub mod reviews;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod utils;
pub mod verification;

pub use config::{EngineConfig, StoreConfig};
pub use error::{DealError, Result};
pub use service::SwapService;
pub use store::Store;
