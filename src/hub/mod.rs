mod registry;
mod types;

pub use registry::HubRegistry;
pub use types::{ModelCard, ModelFile};
