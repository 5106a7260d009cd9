use std::time::Instant;

use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    API_VERSION, VERSION,
    engine::{GenerationRequest, LoadRequest, LoadedModel, Parameters},
    error::ServiceError,
    server::{AppState, extract::ApiJson, streaming},
};

#[derive(Debug, Deserialize)]
pub struct InferenceRequest {
    #[serde(default)]
    pub model: String,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub id: String,
    pub text: String,
    pub tokens: usize,
    pub latency_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    memory: MemoryReport,
}

#[derive(Serialize)]
pub struct MemoryReport {
    used_bytes: u64,
    available_bytes: u64,
    total_bytes: u64,
}

#[derive(Serialize)]
pub struct InfoResponse {
    version: &'static str,
    device: String,
    threads: usize,
    memory_limit: u64,
    api_version: &'static str,
    engine: &'static str,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    models: Vec<LoadedModel>,
    count: usize,
}

#[derive(Serialize)]
pub struct LoadResponse {
    status: &'static str,
    model: String,
    format: String,
}

#[derive(Serialize)]
pub struct UnloadResponse {
    status: &'static str,
    model: String,
}

/// Flattens chat messages into one prompt, one `[role]: content` line per message.
pub fn format_chat_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|msg| format!("[{}]: {}\n", msg.role, msg.content))
        .collect()
}

fn engine_request(
    model: String,
    prompt: String,
    max_tokens: Option<usize>,
    parameters: Parameters,
    default_max_tokens: usize,
) -> Result<GenerationRequest, ServiceError> {
    if model.trim().is_empty() {
        return Err(ServiceError::BadRequest("model is required".into()));
    }
    let max_tokens = match max_tokens {
        Some(0) => {
            return Err(ServiceError::BadRequest(
                "max_tokens must be greater than zero".into(),
            ));
        }
        Some(n) => n,
        None => default_max_tokens,
    };
    Ok(GenerationRequest {
        model,
        prompt,
        max_tokens,
        parameters,
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let limit = state.config.memory_limit;
    let used = state.engine.memory_used().await;

    Json(HealthResponse {
        status: "healthy",
        version: VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        memory: MemoryReport {
            used_bytes: used,
            available_bytes: limit.saturating_sub(used),
            total_bytes: limit,
        },
    })
}

pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: VERSION,
        device: state.config.device.clone(),
        threads: state.config.threads,
        memory_limit: state.config.memory_limit,
        api_version: API_VERSION,
        engine: state.engine.name(),
    })
}

pub async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<ModelsResponse>, ServiceError> {
    let models = state.engine.list_models().await?;
    Ok(Json(ModelsResponse {
        count: models.len(),
        models,
    }))
}

pub async fn load_model(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoadRequest>,
) -> Result<Json<LoadResponse>, ServiceError> {
    if request.path.trim().is_empty() {
        return Err(ServiceError::BadRequest("path is required".into()));
    }
    let loaded = state.engine.load_model(request).await?;
    Ok(Json(LoadResponse {
        status: "loaded",
        model: loaded.id,
        format: loaded.format,
    }))
}

pub async fn unload_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<UnloadResponse>, ServiceError> {
    state.engine.unload_model(&model_id).await?;
    Ok(Json(UnloadResponse {
        status: "unloaded",
        model: model_id,
    }))
}

/// Also serves `/completions`, which shares the request shape.
pub async fn generate(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<InferenceRequest>,
) -> Result<Response, ServiceError> {
    let request = engine_request(
        body.model,
        body.prompt,
        body.max_tokens,
        body.parameters,
        state.config.default_max_tokens,
    )?;
    dispatch(&state, request, body.stream).await
}

pub async fn chat_completions(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ChatRequest>,
) -> Result<Response, ServiceError> {
    if body.messages.is_empty() {
        return Err(ServiceError::BadRequest("messages must not be empty".into()));
    }
    let prompt = format_chat_messages(&body.messages);
    let request = engine_request(
        body.model,
        prompt,
        body.max_tokens,
        body.parameters,
        state.config.default_max_tokens,
    )?;
    dispatch(&state, request, body.stream).await
}

pub async fn generate_stream(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<InferenceRequest>,
) -> Result<Response, ServiceError> {
    let request = engine_request(
        body.model,
        body.prompt,
        body.max_tokens,
        body.parameters,
        state.config.default_max_tokens,
    )?;
    dispatch(&state, request, true).await
}

async fn dispatch(
    state: &AppState,
    request: GenerationRequest,
    stream: bool,
) -> Result<Response, ServiceError> {
    if stream {
        return streaming::sse_response(state.engine.as_ref(), request).await;
    }

    let model = request.model.clone();
    let start = Instant::now();
    let generation = state.engine.generate(request).await?;
    let latency_ms = start.elapsed().as_millis() as u64;
    info!(%model, tokens = generation.tokens, latency_ms, "generation finished");

    Ok(Json(InferenceResponse {
        id: format!("gen-{}", uuid::Uuid::new_v4().simple()),
        text: generation.text,
        tokens: generation.tokens,
        latency_ms,
    })
    .into_response())
}

pub async fn route_not_found() -> ServiceError {
    ServiceError::NotFound("route not found".into())
}
