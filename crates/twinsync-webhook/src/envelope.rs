//! Event-grid envelope parsing.
//!
//! The inbound POST body is a JSON array of event envelopes. Two shapes
//! matter: the subscription-validation handshake (echo the code back,
//! nothing else), and device telemetry carrying the device id in the system
//! properties and the signal as a property name inside the event body.

use serde_json::Value;
use twinsync_core::event::{EventKind, TriggerEvent};

use crate::error::ApiError;

/// A successfully parsed inbound payload.
#[derive(Debug)]
pub enum Inbound {
  /// Subscription validation: respond with the code, perform no other work.
  Validation { code: String },
  /// A device event to reconcile.
  Event(TriggerEvent),
}

/// Parse the raw envelope array.
pub fn parse(payload: &Value) -> Result<Inbound, ApiError> {
  let first = payload
    .as_array()
    .and_then(|events| events.first())
    .ok_or_else(|| ApiError::BadRequest("expected a non-empty event array".into()))?;
  let data = first
    .get("data")
    .ok_or_else(|| ApiError::BadRequest("event envelope has no data object".into()))?;

  if let Some(code) = data.get("validationCode").and_then(Value::as_str) {
    return Ok(Inbound::Validation { code: code.to_string() });
  }

  let device_id = data
    .get("systemProperties")
    .and_then(|props| props.get("iothub-connection-device-id"))
    .and_then(Value::as_str)
    .filter(|id| !id.is_empty())
    .ok_or_else(|| ApiError::BadRequest("event carries no device id".into()))?
    .to_string();

  Ok(Inbound::Event(TriggerEvent {
    device_id,
    kind: body_kind(data.get("body")),
  }))
}

/// Classify the telemetry body. The producer names the signal as a property;
/// match by name fragment, the way it is emitted. A missing or non-object
/// body is simply not a trigger.
fn body_kind(body: Option<&Value>) -> EventKind {
  let Some(body) = body else { return EventKind::Other };

  // The body arrives either inline or as a JSON-encoded string.
  let decoded;
  let object = match body {
    Value::String(raw) => {
      decoded = serde_json::from_str::<Value>(raw).ok();
      decoded.as_ref().and_then(Value::as_object)
    }
    other => other.as_object(),
  };
  let Some(object) = object else { return EventKind::Other };

  if object.keys().any(|k| k.contains("NoUpdateAvailable")) {
    EventKind::NoUpdateAvailable
  } else if object.keys().any(|k| k.contains("AppRestart")) {
    EventKind::AppRestart
  } else {
    EventKind::Other
  }
}
