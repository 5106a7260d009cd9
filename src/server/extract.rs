use axum::extract::FromRequest;

use crate::error::ServiceError;

/// JSON body extractor whose rejections use the gateway's error envelope.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ServiceError))]
pub struct ApiJson<T>(pub T);
