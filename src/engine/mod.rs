//! Boundary to the inference backend.

mod local;
#[cfg(feature = "remote-engine")]
mod remote;
mod stub;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{config::AppConfig, error::EngineError};

pub use local::LocalEngine;
#[cfg(feature = "remote-engine")]
pub use remote::RemoteEngine;
pub use stub::StubEngine;
pub use types::{
    Generation, GenerationRequest, LoadRequest, LoadedModel, Parameters, StreamEvent,
    StreamPayload,
};

/// Chunks buffered between a producer and a slow client before the producer waits.
pub const STREAM_BUFFER: usize = 16;

/// Receiving half of a streamed generation. Dropping it cancels the producer.
pub type EventStream = mpsc::Receiver<StreamEvent>;

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError>;

    /// Starts a generation whose chunks are pushed in order, ending with a
    /// single `Done` or `Error` event.
    async fn generate_stream(&self, request: GenerationRequest)
    -> Result<EventStream, EngineError>;

    async fn load_model(&self, request: LoadRequest) -> Result<LoadedModel, EngineError>;

    async fn unload_model(&self, model_id: &str) -> Result<(), EngineError>;

    async fn list_models(&self) -> Result<Vec<LoadedModel>, EngineError>;

    /// Bytes held by loaded models, when the backend can tell.
    async fn memory_used(&self) -> u64 {
        0
    }
}

/// Pushes `events` in order onto a fresh stream from a spawned task.
///
/// The task stops at the first send that fails, which happens once the
/// receiver is dropped, and reports how many events were delivered.
pub(crate) fn push_events<I>(events: I) -> (EventStream, JoinHandle<usize>)
where
    I: IntoIterator<Item = StreamEvent>,
    I::IntoIter: Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let events = events.into_iter();
    let producer = tokio::spawn(async move {
        let mut delivered = 0;
        for event in events {
            if tx.send(event).await.is_err() {
                debug!(delivered, "stream receiver dropped");
                break;
            }
            delivered += 1;
        }
        delivered
    });
    (rx, producer)
}

/// Picks the backend named by the configuration.
pub fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn Engine>> {
    match config.engine_url.as_deref() {
        #[cfg(feature = "remote-engine")]
        Some(url) => Ok(Arc::new(RemoteEngine::new(url, config.request_timeout)?)),
        #[cfg(not(feature = "remote-engine"))]
        Some(url) => anyhow::bail!("ENGINE_URL={url} requires the remote-engine feature"),
        None => Ok(Arc::new(LocalEngine::new(&config.device, config.threads))),
    }
}
