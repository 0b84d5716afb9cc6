//! Webhook error type and axum `IntoResponse` implementation.
//!
//! Failures are reported to the event source as a structured JSON body,
//! never as a silent success; redelivery is the source's decision.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use twinsync_core::Error as ReconcileError;

/// An error returned by a webhook handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("invalid API key")]
  InvalidApiKey,

  #[error(transparent)]
  Reconcile(#[from] ReconcileError),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::InvalidApiKey => (StatusCode::UNAUTHORIZED, self.to_string()),
      ApiError::Reconcile(e) => (status_for(e), e.to_string()),
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}

fn status_for(e: &ReconcileError) -> StatusCode {
  match e {
    // A collaborator misbehaved; this service relayed the failure.
    ReconcileError::UpstreamFetch { .. } => StatusCode::BAD_GATEWAY,
    ReconcileError::InvalidPolicyIndex(_) => StatusCode::BAD_GATEWAY,
    // Outbound auth has not completed; the event can be redelivered later.
    ReconcileError::Unauthenticated(_) => StatusCode::SERVICE_UNAVAILABLE,
    ReconcileError::ConcurrentModification { .. } => StatusCode::CONFLICT,
    ReconcileError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
  }
}
