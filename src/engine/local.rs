use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task;
use tracing::info;

use crate::{
    engine::{
        Engine, EventStream, Generation, GenerationRequest, LoadRequest, LoadedModel,
        StreamEvent, push_events,
    },
    error::EngineError,
};

const PLACEHOLDER_TEXT: &str = "Generated text response";

/// In-process backend.
///
/// Tracks which model artifacts are loaded and answers generations with
/// placeholder text; token-level decoding lives outside the gateway.
pub struct LocalEngine {
    models: RwLock<Vec<LoadedModel>>,
}

impl LocalEngine {
    pub fn new(device: &str, threads: usize) -> Self {
        info!(device, threads, "using in-process engine");
        Self {
            models: RwLock::new(Vec::new()),
        }
    }
}

fn render(max_tokens: usize) -> Vec<String> {
    PLACEHOLDER_TEXT
        .split_whitespace()
        .take(max_tokens)
        .map(|word| format!("{word} "))
        .collect()
}

#[async_trait]
impl Engine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        let max_tokens = request.max_tokens;
        let words = task::spawn_blocking(move || render(max_tokens))
            .await
            .map_err(|err| EngineError::Failed(format!("inference task failed: {err}")))?;

        Ok(Generation {
            text: words.concat().trim_end().to_string(),
            tokens: words.len(),
        })
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<EventStream, EngineError> {
        let words = render(request.max_tokens);
        let tokens = words.len();
        let events = words
            .into_iter()
            .map(|text| StreamEvent::Chunk { text })
            .chain(std::iter::once(StreamEvent::Done { tokens }));

        let (rx, _producer) = push_events(events);
        Ok(rx)
    }

    async fn load_model(&self, request: LoadRequest) -> Result<LoadedModel, EngineError> {
        let size_bytes = match tokio::fs::metadata(&request.path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                return Err(EngineError::InvalidRequest(format!(
                    "model artifact missing: {}",
                    request.path
                )));
            }
        };

        let model = LoadedModel {
            id: LoadedModel::id_for_path(&request.path),
            path: request.path,
            format: request.format,
            quantization: request.quantization,
            size_bytes: Some(size_bytes),
            loaded: true,
        };

        let mut models = self.models.write();
        match models.iter_mut().find(|m| m.id == model.id) {
            Some(existing) => *existing = model.clone(),
            None => models.push(model.clone()),
        }
        info!(model = %model.id, size_bytes, "model loaded");
        Ok(model)
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), EngineError> {
        let mut models = self.models.write();
        let before = models.len();
        models.retain(|m| m.id != model_id);
        if models.len() == before {
            return Err(EngineError::ModelNotLoaded(model_id.to_string()));
        }
        info!(model = model_id, "model unloaded");
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<LoadedModel>, EngineError> {
        Ok(self.models.read().clone())
    }

    async fn memory_used(&self) -> u64 {
        self.models
            .read()
            .iter()
            .filter_map(|m| m.size_bytes)
            .sum()
    }
}
