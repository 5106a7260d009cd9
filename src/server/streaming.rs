use std::convert::Infallible;

use axum::response::{
    IntoResponse, Response,
    sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    engine::{Engine, EventStream, GenerationRequest, StreamPayload},
    error::ServiceError,
};

/// Starts a streamed generation and answers with server-sent events.
///
/// Failures before the first chunk become a regular error response; later
/// failures arrive as a terminal `error` event.
pub async fn sse_response(
    engine: &dyn Engine,
    request: GenerationRequest,
) -> Result<Response, ServiceError> {
    let events = engine.generate_stream(request).await?;
    Ok(event_stream(events).into_response())
}

/// Each event's data is a JSON object with at least a `text` field.
/// Dropping the response body drops the receiver, which stops the producer.
pub fn event_stream(events: EventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = ReceiverStream::new(events).map(|event| {
        let data = serde_json::to_string(&StreamPayload::from(event)).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
