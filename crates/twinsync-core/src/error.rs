//! Error types for `twinsync-core`.
//!
//! Every variant is local to a single reconciliation; a failure processing one
//! device's event never affects another device. None of these are retried
//! internally — redelivery is the event source's responsibility.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// An upstream read did not succeed: non-2xx status, empty body, or a body
  /// that does not match the expected schema.
  #[error("upstream fetch failed for {endpoint}: {reason}")]
  UpstreamFetch { endpoint: String, reason: String },

  #[error("update-policy ordinal {0} is outside the known policy table")]
  InvalidPolicyIndex(i64),

  #[error("not authenticated: {0}")]
  Unauthenticated(String),

  /// The conditional twin write was rejected because the ETag went stale
  /// between read and write.
  #[error("twin for device {device_id} was modified concurrently")]
  ConcurrentModification { device_id: String },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Convenience constructor for upstream-read failures.
  pub fn upstream(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
    Error::UpstreamFetch {
      endpoint: endpoint.into(),
      reason:   reason.into(),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
