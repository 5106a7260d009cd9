pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod server;

pub use config::AppConfig;
pub use engine::{Engine, LocalEngine, StubEngine};
pub use error::{EngineError, ServiceError, StorageError};
pub use hub::{HubRegistry, ModelCard, ModelFile};
pub use server::build_router;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const API_VERSION: &str = "1.0.0";
