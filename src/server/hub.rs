use axum::{
    Json,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header::CONTENT_DISPOSITION},
    response::{IntoResponse, Response},
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{info, warn};

use crate::{
    error::ServiceError,
    hub::ModelCard,
    server::{AppState, extract::ApiJson},
};

/// Characters RFC 5987 allows unescaped in an extended header parameter.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

#[derive(Serialize)]
pub struct HubListResponse {
    models: Vec<ModelCard>,
    count: usize,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    file: Option<String>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<HubListResponse> {
    let models = state.registry.list();
    Json(HubListResponse {
        count: models.len(),
        models,
    })
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelCard>, ServiceError> {
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound("model not found".into()))
}

pub async fn register_model(
    State(state): State<AppState>,
    ApiJson(card): ApiJson<ModelCard>,
) -> Result<(StatusCode, Json<ModelCard>), ServiceError> {
    card.validate().map_err(ServiceError::BadRequest)?;
    let stored = state.registry.upsert(card).await?;
    info!(id = %stored.id, name = %stored.name, "model card registered");
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Streams one of the card's files as an attachment. Range requests are honored.
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
    request: Request,
) -> Result<Response, ServiceError> {
    let card = state
        .registry
        .get(&id)
        .ok_or_else(|| ServiceError::NotFound("model not found".into()))?;
    let file = card
        .resolve_file(query.file.as_deref())
        .ok_or_else(|| ServiceError::NotFound("file not found".into()))?;

    match tokio::fs::metadata(&file.path).await {
        Ok(meta) if meta.is_file() => {}
        _ => {
            warn!(model = %id, path = %file.path.display(), "registered file is missing on disk");
            return Err(ServiceError::NotFound("file not found".into()));
        }
    }

    let response = ServeFile::new(&file.path)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    let mut response = response.map(Body::new);

    if response.status().is_success() {
        response
            .headers_mut()
            .insert(CONTENT_DISPOSITION, content_disposition(&file.filename));
    }

    Ok(response.into_response())
}

/// Plain `filename` for old clients plus an RFC 5987 `filename*` carrying the exact UTF-8 name.
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let encoded = utf8_percent_encode(filename, ATTR_CHAR);
    let value = format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}");
    // Only visible ASCII is left at this point.
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_names_appear_in_both_parameters() {
        assert_eq!(
            content_disposition("m.gguf"),
            "attachment; filename=\"m.gguf\"; filename*=UTF-8''m.gguf"
        );
    }

    #[test]
    fn non_ascii_names_keep_their_exact_form() {
        assert_eq!(
            content_disposition("modèle \"v2\".gguf"),
            "attachment; filename=\"mod_le _v2_.gguf\"; \
             filename*=UTF-8''mod%C3%A8le%20%22v2%22.gguf"
        );
    }
}
