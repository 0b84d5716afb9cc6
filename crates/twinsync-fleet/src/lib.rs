//! Fleet-management API client.
//!
//! Implements [`twinsync_core::client::FleetApi`] against the Azure Sphere
//! public API (`GET /v2/tenants/{tenant}/…`). Every endpoint has an explicit
//! wire schema and is deserialized strictly — a missing or mistyped field is
//! an upstream-fetch error, never a silent null.

pub mod auth;
pub mod osver;

use std::time::Duration;

use serde::Deserialize;
use twinsync_core::{
  Error, Result,
  client::FleetApi,
  facts::{DeviceFacts, DeviceGroupFacts, ProductFacts},
};

/// Default base URL of the fleet-management API.
pub const DEFAULT_API_BASE: &str = "https://prod.core.sphere.azure.net";

// ─── Configuration ───────────────────────────────────────────────────────────

/// Connection settings for the fleet API.
#[derive(Debug, Clone)]
pub struct FleetConfig {
  pub base_url:     String,
  /// The fleet tenant all device/group/product reads are scoped to.
  pub tenant_id:    String,
  /// Published OS-version list endpoint (see [`osver`]).
  pub versions_url: String,
}

impl FleetConfig {
  pub fn new(tenant_id: impl Into<String>) -> Self {
    Self {
      base_url:     DEFAULT_API_BASE.to_string(),
      tenant_id:    tenant_id.into(),
      versions_url: osver::DEFAULT_VERSIONS_URL.to_string(),
    }
  }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Async client for the fleet-management read API.
///
/// Cheap to clone — the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct FleetClient {
  http:   reqwest::Client,
  config: FleetConfig,
}

impl FleetClient {
  pub fn new(config: FleetConfig) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| Error::upstream(&config.base_url, format!("building HTTP client: {e}")))?;
    Ok(Self { http, config })
  }

  pub fn config(&self) -> &FleetConfig { &self.config }

  fn url(&self, relative: &str) -> String {
    format!("{}/v2/{relative}", self.config.base_url.trim_end_matches('/'))
  }

  /// GET an absolute URL (optionally bearer-authenticated) and deserialize
  /// the body against `T`'s schema.
  pub(crate) async fn fetch_url<T>(&self, url: &str, token: Option<&str>) -> Result<T>
  where
    T: serde::de::DeserializeOwned,
  {
    let mut req = self.http.get(url);
    if let Some(token) = token {
      req = req.bearer_auth(token);
    }
    let resp = req
      .send()
      .await
      .map_err(|e| Error::upstream(url, e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
      return Err(Error::upstream(url, format!("status {status}")));
    }

    let body = resp
      .bytes()
      .await
      .map_err(|e| Error::upstream(url, format!("reading body: {e}")))?;
    if body.is_empty() {
      return Err(Error::upstream(url, "empty body"));
    }
    serde_json::from_slice(&body)
      .map_err(|e| Error::upstream(url, format!("schema mismatch: {e}")))
  }

  /// GET a `/v2/`-relative fleet endpoint with bearer auth.
  pub(crate) async fn fetch<T>(&self, token: &str, relative: &str) -> Result<T>
  where
    T: serde::de::DeserializeOwned,
  {
    self.fetch_url(&self.url(relative), Some(token)).await
  }

  // ── Listings (used by the operator CLI) ───────────────────────────────────

  /// All fleet tenants the token's identity can read.
  pub async fn tenants(&self, token: &str) -> Result<Vec<TenantRecord>> {
    self.fetch(token, "tenants").await
  }

  /// All devices claimed into one tenant.
  // TODO: follow ContinuationToken once fleets exceed one page.
  pub async fn tenant_devices(
    &self,
    token: &str,
    tenant_id: &str,
  ) -> Result<Vec<DeviceListEntry>> {
    let page: Paged<DeviceListEntry> =
      self.fetch(token, &format!("tenants/{tenant_id}/devices")).await?;
    Ok(page.items)
  }
}

// ─── Wire schemas ────────────────────────────────────────────────────────────
// The fleet API serializes with PascalCase member names.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceRecord {
  device_id:       String,
  product_id:      String,
  device_group_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceGroupRecord {
  name:          String,
  os_feed_type:  i64,
  update_policy: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProductRecord {
  name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Paged<T> {
  pub items: Vec<T>,
}

/// One tenant the signed-in identity can read.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TenantRecord {
  pub id:   String,
  pub name: String,
}

/// Device list entry. Unclaimed devices carry no product or device group.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceListEntry {
  pub device_id:       String,
  pub product_id:      Option<String>,
  pub device_group_id: Option<String>,
}

// ─── FleetApi ────────────────────────────────────────────────────────────────

impl FleetApi for FleetClient {
  async fn device(&self, token: &str, device_id: &str) -> Result<DeviceFacts> {
    let tenant = &self.config.tenant_id;
    let record: DeviceRecord = self
      .fetch(token, &format!("tenants/{tenant}/devices/{device_id}"))
      .await?;

    // Best effort: a device without a resolvable version derives the "None"
    // literal downstream instead of failing the reconciliation.
    let os_version = self.resolve_os_version(token, device_id).await;

    Ok(DeviceFacts {
      device_id:       record.device_id,
      product_id:      record.product_id,
      device_group_id: record.device_group_id,
      last_installed_os_version: os_version,
    })
  }

  async fn device_group(&self, token: &str, group_id: &str) -> Result<DeviceGroupFacts> {
    let tenant = &self.config.tenant_id;
    let record: DeviceGroupRecord = self
      .fetch(token, &format!("tenants/{tenant}/devicegroups/{group_id}"))
      .await?;
    Ok(DeviceGroupFacts {
      name:          record.name,
      os_feed_type:  record.os_feed_type,
      update_policy: record.update_policy,
    })
  }

  async fn product(&self, token: &str, product_id: &str) -> Result<ProductFacts> {
    let tenant = &self.config.tenant_id;
    let record: ProductRecord = self
      .fetch(token, &format!("tenants/{tenant}/products/{product_id}"))
      .await?;
    Ok(ProductFacts { name: record.name })
  }
}

#[cfg(test)]
pub(crate) mod testutil {
  /// Serve `router` on a loopback port and return its base URL.
  pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
  }
}
