//! Twin-store client.
//!
//! Implements [`twinsync_core::client::TwinStore`] against the IoT Hub REST
//! surface: `GET /twins/{id}` for the current desired document plus its ETag,
//! and a conditional `PATCH /twins/{id}` for writes. The ETag condition is
//! the sole correctness mechanism when two reconciliations race on one
//! device; a stale tag is surfaced, never retried here.

pub mod sas;

use std::{str::FromStr, time::Duration};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use reqwest::{StatusCode, header};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error as ThisError;
use twinsync_core::{
  Error, Result,
  client::TwinStore,
  twin::{DesiredTwinState, TwinSnapshot},
};

const TWIN_API_VERSION: &str = "2021-04-12";

/// SAS tokens are minted per request with a short lifetime.
const SAS_TTL_SECS: i64 = 300;

// ─── Connection string ───────────────────────────────────────────────────────

/// A parsed `HostName=…;SharedAccessKeyName=…;SharedAccessKey=…` string.
///
/// The shared access key is base64-decoded at parse time so a malformed
/// secret fails at startup, not on the first twin write.
#[derive(Debug, Clone)]
pub struct ConnectionString {
  pub host_name: String,
  pub key_name:  String,
  key:           Vec<u8>,
}

#[derive(Debug, ThisError)]
pub enum ConnectionStringError {
  #[error("connection string is missing the {0} field")]
  MissingField(&'static str),

  #[error("shared access key is not valid base64: {0}")]
  BadKey(#[from] base64::DecodeError),
}

impl FromStr for ConnectionString {
  type Err = ConnectionStringError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut host_name = None;
    let mut key_name = None;
    let mut key = None;

    for pair in s.split(';') {
      // split_once keeps the base64 padding in the key's value intact.
      let Some((name, value)) = pair.split_once('=') else { continue };
      match name.trim() {
        "HostName" => host_name = Some(value.to_string()),
        "SharedAccessKeyName" => key_name = Some(value.to_string()),
        "SharedAccessKey" => key = Some(value.to_string()),
        _ => {}
      }
    }

    let host_name = host_name.ok_or(ConnectionStringError::MissingField("HostName"))?;
    let key_name =
      key_name.ok_or(ConnectionStringError::MissingField("SharedAccessKeyName"))?;
    let key = key.ok_or(ConnectionStringError::MissingField("SharedAccessKey"))?;

    Ok(Self {
      host_name,
      key_name,
      key: B64.decode(key)?,
    })
  }
}

// ─── Wire schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TwinDocument {
  etag:       String,
  #[serde(default)]
  properties: TwinProperties,
}

#[derive(Debug, Default, Deserialize)]
struct TwinProperties {
  #[serde(default)]
  desired: Value,
}

/// `If-Match` requires the quoted form; twin documents carry the bare tag.
fn quote_etag(etag: &str) -> String {
  format!("\"{}\"", etag.trim_matches('"'))
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Async client for the twin store.
///
/// Cheap to clone — the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct HubClient {
  http:       reqwest::Client,
  base_url:   String,
  connection: ConnectionString,
}

impl HubClient {
  pub fn new(connection: ConnectionString) -> Result<Self> {
    let base_url = format!("https://{}", connection.host_name);
    Self::with_base_url(connection, base_url)
  }

  /// Point the client at a non-default endpoint (loopback tests).
  pub fn with_base_url(connection: ConnectionString, base_url: impl Into<String>) -> Result<Self> {
    let base_url = base_url.into();
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| Error::upstream(&base_url, format!("building HTTP client: {e}")))?;
    Ok(Self { http, base_url, connection })
  }

  fn sas(&self) -> String {
    sas::sign(
      &self.connection.host_name,
      &self.connection.key,
      &self.connection.key_name,
      Utc::now().timestamp() + SAS_TTL_SECS,
    )
  }

  fn twin_url(&self, device_id: &str) -> String {
    format!("{}/twins/{device_id}", self.base_url.trim_end_matches('/'))
  }
}

impl TwinStore for HubClient {
  async fn twin(&self, device_id: &str) -> Result<TwinSnapshot> {
    let url = self.twin_url(device_id);
    let resp = self
      .http
      .get(&url)
      .query(&[("api-version", TWIN_API_VERSION)])
      .header(header::AUTHORIZATION, self.sas())
      .send()
      .await
      .map_err(|e| Error::upstream(&url, e.to_string()))?;

    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
      return Err(Error::Unauthenticated(format!("twin store returned {status}")));
    }
    if !status.is_success() {
      return Err(Error::upstream(&url, format!("status {status}")));
    }

    let doc: TwinDocument = resp
      .json()
      .await
      .map_err(|e| Error::upstream(&url, format!("schema mismatch: {e}")))?;

    Ok(TwinSnapshot {
      etag:    doc.etag,
      desired: doc.properties.desired,
    })
  }

  async fn update_desired(
    &self,
    device_id: &str,
    state: &DesiredTwinState,
    etag: &str,
  ) -> Result<()> {
    let url = self.twin_url(device_id);
    let patch = json!({ "properties": { "desired": state } });

    let resp = self
      .http
      .patch(&url)
      .query(&[("api-version", TWIN_API_VERSION)])
      .header(header::AUTHORIZATION, self.sas())
      .header(header::IF_MATCH, quote_etag(etag))
      .json(&patch)
      .send()
      .await
      .map_err(|e| Error::upstream(&url, e.to_string()))?;

    let status = resp.status();
    if status == StatusCode::PRECONDITION_FAILED {
      return Err(Error::ConcurrentModification { device_id: device_id.to_string() });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
      return Err(Error::Unauthenticated(format!("twin store returned {status}")));
    }
    if !status.is_success() {
      return Err(Error::upstream(&url, format!("status {status}")));
    }

    tracing::debug!(device_id, "desired twin document updated");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode},
    routing::{get, patch},
  };
  use serde_json::json;
  use twinsync_core::client::TwinStore as _;

  use super::*;

  const CONN: &str = "HostName=hub.example.net;SharedAccessKeyName=iothubowner;SharedAccessKey=c2VjcmV0LWtleQ==";

  // ── Connection strings ────────────────────────────────────────────────────

  #[test]
  fn parses_a_full_connection_string() {
    let conn: ConnectionString = CONN.parse().unwrap();
    assert_eq!(conn.host_name, "hub.example.net");
    assert_eq!(conn.key_name, "iothubowner");
    assert_eq!(conn.key, b"secret-key");
  }

  #[test]
  fn missing_fields_are_reported_by_name() {
    let err = "HostName=hub.example.net;SharedAccessKey=c2VjcmV0LWtleQ=="
      .parse::<ConnectionString>()
      .unwrap_err();
    assert!(matches!(
      err,
      ConnectionStringError::MissingField("SharedAccessKeyName")
    ));
  }

  #[test]
  fn invalid_key_base64_fails_at_parse_time() {
    let err = "HostName=h;SharedAccessKeyName=n;SharedAccessKey=!!!"
      .parse::<ConnectionString>()
      .unwrap_err();
    assert!(matches!(err, ConnectionStringError::BadKey(_)));
  }

  #[test]
  fn etag_quoting_accepts_both_forms() {
    assert_eq!(quote_etag("AAAA"), "\"AAAA\"");
    assert_eq!(quote_etag("\"AAAA\""), "\"AAAA\"");
  }

  // ── Loopback twin store ───────────────────────────────────────────────────

  async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
  }

  fn hub_router() -> Router {
    Router::new()
      .route(
        "/twins/dev1",
        get(|headers: HeaderMap| async move {
          let authed = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("SharedAccessSignature sr="));
          if !authed {
            return (StatusCode::UNAUTHORIZED, Json(json!({})));
          }
          (
            StatusCode::OK,
            Json(json!({
              "deviceId": "dev1",
              "etag":     "AAAA",
              "properties": {
                "desired":  { "OSVersion": "21.01" },
                "reported": {},
              },
            })),
          )
        }),
      )
      .route(
        "/twins/dev1",
        patch(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
          if headers.get("if-match").and_then(|v| v.to_str().ok()) != Some("\"AAAA\"") {
            return (StatusCode::PRECONDITION_FAILED, Json(json!({})));
          }
          assert!(body["properties"]["desired"].is_object());
          (StatusCode::OK, Json(json!({})))
        }),
      )
  }

  fn state() -> DesiredTwinState {
    DesiredTwinState {
      os_version:        "21.01".into(),
      product:           "Oven".into(),
      device_group:      "Kitchens".into(),
      retail_eval:       false,
      app_update_policy: "Update All".into(),
    }
  }

  #[tokio::test]
  async fn twin_read_returns_etag_and_desired_properties() {
    let base = serve(hub_router()).await;
    let client =
      HubClient::with_base_url(CONN.parse().unwrap(), base).unwrap();

    let snapshot = client.twin("dev1").await.unwrap();
    assert_eq!(snapshot.etag, "AAAA");
    assert_eq!(snapshot.desired["OSVersion"], "21.01");
  }

  #[tokio::test]
  async fn conditional_update_succeeds_with_the_current_etag() {
    let base = serve(hub_router()).await;
    let client =
      HubClient::with_base_url(CONN.parse().unwrap(), base).unwrap();

    client.update_desired("dev1", &state(), "AAAA").await.unwrap();
  }

  #[tokio::test]
  async fn stale_etag_maps_to_concurrent_modification() {
    let base = serve(hub_router()).await;
    let client =
      HubClient::with_base_url(CONN.parse().unwrap(), base).unwrap();

    let err = client.update_desired("dev1", &state(), "BBBB").await.unwrap_err();
    assert!(matches!(err, Error::ConcurrentModification { .. }), "{err}");
  }

  #[tokio::test]
  async fn missing_twin_is_an_upstream_fetch_error() {
    let base = serve(hub_router()).await;
    let client =
      HubClient::with_base_url(CONN.parse().unwrap(), base).unwrap();

    let err = client.twin("no-such-device").await.unwrap_err();
    assert!(matches!(err, Error::UpstreamFetch { .. }), "{err}");
  }
}
