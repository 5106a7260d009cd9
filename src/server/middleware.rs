use std::time::Duration;

use axum::{
    Router,
    extract::{OriginalUri, Request, State},
    http::{
        Method, StatusCode,
        header::{ALLOW, AUTHORIZATION, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};

use crate::{error::ServiceError, server::AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Permissive cross-origin headers, preflight answered here.
    Cors,
    /// One event per request with method, path, status and latency.
    Logging,
    /// `Authorization: Bearer <key>` check when auth is enabled.
    Auth,
    /// Re-encodes bodiless framework errors (405, 408) as JSON envelopes.
    Envelope,
    /// Upper bound on how long a handler may take to produce a response.
    Timeout,
}

/// Outermost first. CORS and logging wrap auth, so 401s carry CORS headers and get logged.
pub const DEFAULT_ORDER: [Policy; 5] = [
    Policy::Cors,
    Policy::Logging,
    Policy::Auth,
    Policy::Envelope,
    Policy::Timeout,
];

#[derive(Debug, Clone)]
pub struct MiddlewareChain {
    order: Vec<Policy>,
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER)
    }
}

impl MiddlewareChain {
    /// Builds a chain from policies listed outermost first. Repeats are dropped.
    pub fn new(order: impl IntoIterator<Item = Policy>) -> Self {
        let mut deduped = Vec::new();
        for policy in order {
            if !deduped.contains(&policy) {
                deduped.push(policy);
            }
        }
        Self { order: deduped }
    }

    pub fn order(&self) -> &[Policy] {
        &self.order
    }

    /// Wraps every route and the fallback of `router` with the chain.
    pub fn apply(&self, router: Router<AppState>, state: &AppState) -> Router<AppState> {
        // Each `layer` call wraps what is already there, so build from the inside out.
        self.order
            .iter()
            .rev()
            .fold(router, |router, policy| match policy {
                Policy::Cors => router.layer(cors_layer()),
                Policy::Logging => router.layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &Request| {
                            let path = request
                                .extensions()
                                .get::<OriginalUri>()
                                .map(|uri| uri.path().to_string())
                                .unwrap_or_else(|| request.uri().path().to_string());
                            info_span!("request", method = %request.method(), %path)
                        })
                        .on_response(|response: &Response, latency: Duration, _span: &Span| {
                            info!(
                                status = response.status().as_u16(),
                                latency_ms = latency.as_millis() as u64,
                                "request completed"
                            );
                        }),
                ),
                Policy::Auth => {
                    router.layer(middleware::from_fn_with_state(state.clone(), require_api_key))
                }
                Policy::Envelope => router.layer(middleware::map_response(uniform_envelope)),
                Policy::Timeout => {
                    router.layer(TimeoutLayer::new(state.config.request_timeout))
                }
            })
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.config.enable_auth {
        return next.run(request).await;
    }

    let expected = format!("Bearer {}", state.config.api_key);
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if presented != Some(expected.as_str()) {
        warn!(method = %request.method(), "rejected request with missing or invalid API key");
        return ServiceError::Unauthorized.into_response();
    }

    next.run(request).await
}

async fn uniform_envelope(response: Response) -> Response {
    if response.headers().contains_key(CONTENT_TYPE) {
        return response;
    }
    let error = match response.status() {
        StatusCode::METHOD_NOT_ALLOWED => ServiceError::MethodNotAllowed,
        StatusCode::REQUEST_TIMEOUT => ServiceError::Timeout,
        _ => return response,
    };

    let allow = response.headers().get(ALLOW).cloned();
    let mut encoded = error.into_response();
    if let Some(allow) = allow {
        encoded.headers_mut().insert(ALLOW, allow);
    }
    encoded
}
