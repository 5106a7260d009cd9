use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    engine::{
        Engine, EventStream, Generation, GenerationRequest, LoadRequest, LoadedModel,
        StreamEvent, push_events,
    },
    error::EngineError,
};

/// Deterministic backend for tests. Records every call it receives.
pub struct StubEngine {
    chunks: Vec<String>,
    fail_with: Option<String>,
    calls: AtomicUsize,
    last_request: Mutex<Option<GenerationRequest>>,
    models: Mutex<Vec<LoadedModel>>,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::with_chunks(["stub ", "reply"])
    }
}

impl StubEngine {
    pub fn with_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            fail_with: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            models: Mutex::new(Vec::new()),
        }
    }

    /// Every generation fails with `EngineError::Failed(message)`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }

    /// Number of engine calls of any kind.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_request.lock().as_ref().map(|r| r.prompt.clone())
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().clone()
    }

    fn record(&self, request: &GenerationRequest) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
        match &self.fail_with {
            Some(message) => Err(EngineError::Failed(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Engine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        self.record(&request)?;
        Ok(Generation {
            text: self.chunks.concat(),
            tokens: self.chunks.len(),
        })
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<EventStream, EngineError> {
        let events: Vec<StreamEvent> = match self.record(&request) {
            Ok(()) => self
                .chunks
                .iter()
                .map(|text| StreamEvent::Chunk { text: text.clone() })
                .chain(std::iter::once(StreamEvent::Done {
                    tokens: self.chunks.len(),
                }))
                .collect(),
            Err(err) => vec![StreamEvent::Error {
                message: err.to_string(),
            }],
        };

        let (rx, _producer) = push_events(events);
        Ok(rx)
    }

    async fn load_model(&self, request: LoadRequest) -> Result<LoadedModel, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let model = LoadedModel {
            id: LoadedModel::id_for_path(&request.path),
            path: request.path,
            format: request.format,
            quantization: request.quantization,
            size_bytes: None,
            loaded: true,
        };
        self.models.lock().push(model.clone());
        Ok(model)
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut models = self.models.lock();
        let before = models.len();
        models.retain(|m| m.id != model_id);
        if models.len() == before {
            return Err(EngineError::ModelNotLoaded(model_id.to_string()));
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<LoadedModel>, EngineError> {
        Ok(self.models.lock().clone())
    }
}
