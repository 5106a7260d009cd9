use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    engine::{
        Engine, EventStream, Generation, GenerationRequest, LoadRequest, LoadedModel,
        STREAM_BUFFER, StreamEvent, StreamPayload,
    },
    error::EngineError,
};

/// Backend reached over HTTP. Speaks the same `/api/v1` surface this gateway serves.
pub struct RemoteEngine {
    base_url: String,
    client: Client,
    idle_timeout: Duration,
}

#[derive(Deserialize)]
struct ModelsBody {
    models: Vec<LoadedModel>,
}

#[derive(Deserialize)]
struct LoadBody {
    model: String,
    #[serde(default)]
    format: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl RemoteEngine {
    /// `timeout` bounds connecting and each wait for the next piece of a streamed body.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        info!(%base_url, "using remote engine");
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            idle_timeout: timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }
}

fn transport(err: reqwest::Error) -> EngineError {
    EngineError::Unavailable(err.to_string())
}

/// Converts a non-success upstream reply into an engine error.
async fn upstream_error(response: Response, model: &str) -> EngineError {
    let status = response.status();
    let message = response
        .json::<ErrorBody>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());
    match status {
        StatusCode::NOT_FOUND => EngineError::ModelNotLoaded(model.to_string()),
        StatusCode::BAD_REQUEST => EngineError::InvalidRequest(message),
        _ => EngineError::Unavailable(format!("upstream returned {status}: {message}")),
    }
}

async fn checked(response: Response, model: &str) -> Result<Response, EngineError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(upstream_error(response, model).await)
    }
}

/// Pulls complete `data:` payloads out of a server-sent event buffer.
///
/// Bytes stay raw until a whole event has arrived, so characters split across
/// network reads decode intact.
fn drain_events(buffer: &mut Vec<u8>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(end) = buffer.windows(2).position(|pair| pair == b"\n\n") {
        let raw: Vec<u8> = buffer.drain(..end + 2).collect();
        let block = match String::from_utf8(raw) {
            Ok(block) => block,
            Err(err) => {
                warn!(error = %err, "skipping upstream event that is not UTF-8");
                continue;
            }
        };
        for line in block.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            match serde_json::from_str::<StreamPayload>(data.trim()) {
                Ok(payload) => events.push(payload.into()),
                Err(err) => warn!(error = %err, "skipping undecodable upstream event"),
            }
        }
    }
    events
}

#[async_trait]
impl Engine for RemoteEngine {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        let response = self
            .client
            .post(self.url("/generate"))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        checked(response, &request.model)
            .await?
            .json::<Generation>()
            .await
            .map_err(transport)
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<EventStream, EngineError> {
        let response = self
            .client
            .post(self.url("/generate/stream"))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        let response = checked(response, &request.model).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = Vec::new();
            loop {
                let next = match tokio::time::timeout(idle_timeout, body.next()).await {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    Err(_) => {
                        warn!(?idle_timeout, "upstream stream stalled");
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: format!("upstream sent nothing for {idle_timeout:?}"),
                            })
                            .await;
                        return;
                    }
                };
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: err.to_string(),
                            })
                            .await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);
                for event in drain_events(&mut buffer) {
                    let terminal = event.is_terminal();
                    if tx.send(event).await.is_err() {
                        debug!("stream receiver dropped, closing upstream");
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
            }
            let _ = tx
                .send(StreamEvent::Error {
                    message: "upstream stream ended without completion".into(),
                })
                .await;
        });
        Ok(rx)
    }

    async fn load_model(&self, request: LoadRequest) -> Result<LoadedModel, EngineError> {
        let response = self
            .client
            .post(self.url("/models/load"))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        let body: LoadBody = checked(response, &request.path)
            .await?
            .json()
            .await
            .map_err(transport)?;

        Ok(LoadedModel {
            id: body.model,
            path: request.path,
            format: if body.format.is_empty() {
                request.format
            } else {
                body.format
            },
            quantization: request.quantization,
            size_bytes: None,
            loaded: true,
        })
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), EngineError> {
        let response = self
            .client
            .delete(self.url(&format!("/models/{model_id}/unload")))
            .send()
            .await
            .map_err(transport)?;
        checked(response, model_id).await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<LoadedModel>, EngineError> {
        let response = self
            .client
            .get(self.url("/models"))
            .send()
            .await
            .map_err(transport)?;
        let body: ModelsBody = checked(response, "")
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(body.models)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// Answers one request with a chunked event stream, one HTTP chunk per
    /// entry, then optionally goes quiet without finishing the body.
    async fn upstream(chunks: Vec<Vec<u8>>, stall: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 8192];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                      transfer-encoding: chunked\r\n\r\n",
                )
                .await;
            for chunk in chunks {
                let mut frame = format!("{:x}\r\n", chunk.len()).into_bytes();
                frame.extend_from_slice(&chunk);
                frame.extend_from_slice(b"\r\n");
                let _ = socket.write_all(&frame).await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if stall {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });
        format!("http://{addr}")
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "m".into(),
            prompt: "p".into(),
            max_tokens: 8,
            parameters: Default::default(),
        }
    }

    async fn collect(mut events: EventStream) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    #[test]
    fn drains_only_complete_events() {
        let mut buffer =
            b"data: {\"text\":\"a \"}\n\ndata: {\"text\":\"b\"}\n\ndata: {\"text\":\"".to_vec();
        let events = drain_events(&mut buffer);
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk { text: "a ".into() },
                StreamEvent::Chunk { text: "b".into() },
            ]
        );
        assert_eq!(buffer, b"data: {\"text\":\"");

        buffer.extend_from_slice(b"\",\"done\":true,\"tokens\":2}\n\n");
        assert_eq!(drain_events(&mut buffer), vec![StreamEvent::Done { tokens: 2 }]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn characters_split_across_reads_decode_intact() {
        let event = "data: {\"text\":\"café\"}\n\n".as_bytes();
        let split = event.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut buffer = event[..split].to_vec();
        assert!(drain_events(&mut buffer).is_empty());
        buffer.extend_from_slice(&event[split..]);
        assert_eq!(
            drain_events(&mut buffer),
            vec![StreamEvent::Chunk {
                text: "café".into()
            }]
        );
    }

    #[tokio::test]
    async fn streamed_text_survives_chunk_boundaries() {
        let body = concat!(
            "data: {\"text\":\"café\"}\n\n",
            "data: {\"text\":\"\",\"done\":true,\"tokens\":1}\n\n",
        )
        .as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let url = upstream(vec![body[..split].to_vec(), body[split..].to_vec()], false).await;

        let engine = RemoteEngine::new(&url, Duration::from_secs(5)).unwrap();
        let events = collect(engine.generate_stream(request()).await.unwrap()).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk {
                    text: "café".into()
                },
                StreamEvent::Done { tokens: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn stalled_upstream_ends_the_stream_with_an_error() {
        let url = upstream(vec![b"data: {\"text\":\"hi\"}\n\n".to_vec()], true).await;

        let engine = RemoteEngine::new(&url, Duration::from_millis(200)).unwrap();
        let events = tokio::time::timeout(
            Duration::from_secs(5),
            collect(engine.generate_stream(request()).await.unwrap()),
        )
        .await
        .expect("stream never ended");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Chunk { text: "hi".into() });
        assert!(matches!(events[1], StreamEvent::Error { .. }));
    }

    #[test]
    fn builds_versioned_urls() {
        let engine = RemoteEngine::new("http://engine:7000/", Duration::from_secs(1)).unwrap();
        assert_eq!(engine.url("/generate"), "http://engine:7000/api/v1/generate");
    }
}
