//! Resolve the OS version a device is running.
//!
//! The published-version list pairs each released OS version with the image
//! ids it ships; the device's targeted image list names what the device
//! actually carries. Matching the first targeted image id against the
//! published list, newest version first, yields the version name.

use serde::Deserialize;
use twinsync_core::Result;

use crate::FleetClient;

/// Default published OS-version list for MT3620-class devices.
pub const DEFAULT_VERSIONS_URL: &str =
  "https://prod.releases.sphere.azure.net/versions/mt3620an.json";

// ─── Wire schemas ────────────────────────────────────────────────────────────
// The releases endpoint uses lowercase keys, unlike the fleet API proper.

#[derive(Debug, Deserialize)]
pub struct PublishedVersions {
  pub versions: Vec<OsVersion>,
}

#[derive(Debug, Deserialize)]
pub struct OsVersion {
  pub name:   String,
  pub images: Vec<OsImage>,
}

/// One OS image: component id plus image id.
#[derive(Debug, Deserialize)]
pub struct OsImage {
  pub cid: String,
  pub iid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageList {
  items: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageEntry {
  id: String,
}

// ─── Matching ────────────────────────────────────────────────────────────────

/// Match a targeted image id against the published list, newest entry first.
pub fn match_version<'a>(versions: &'a [OsVersion], image_id: &str) -> Option<&'a str> {
  versions
    .iter()
    .rev()
    .find(|v| v.images.iter().any(|img| img.iid == image_id))
    .map(|v| v.name.as_str())
}

// ─── Resolution ──────────────────────────────────────────────────────────────

impl FleetClient {
  /// Best-effort resolution of the OS version `device_id` is running.
  ///
  /// Returns `None` (with a warning logged) when either list cannot be
  /// fetched or the image id is not in the published list — an unresolved
  /// version is not a reconciliation failure.
  pub async fn resolve_os_version(&self, token: &str, device_id: &str) -> Option<String> {
    match self.try_resolve_os_version(token, device_id).await {
      Ok(found) => found,
      Err(e) => {
        tracing::warn!(device_id, error = %e, "OS-version resolution failed");
        None
      }
    }
  }

  async fn try_resolve_os_version(
    &self,
    token: &str,
    device_id: &str,
  ) -> Result<Option<String>> {
    let published: PublishedVersions =
      self.fetch_url(&self.config().versions_url, None).await?;
    if published.versions.is_empty() {
      return Ok(None);
    }

    let tenant = &self.config().tenant_id;
    let images: ImageList = self
      .fetch(token, &format!("tenants/{tenant}/devices/{device_id}/images"))
      .await?;
    let Some(first) = images.items.first() else {
      return Ok(None);
    };

    Ok(match_version(&published.versions, &first.id).map(String::from))
  }
}
