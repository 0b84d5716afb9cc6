//! Capability traits implemented by the transport crates.
//!
//! `twinsync-core` stays free of HTTP concerns. `twinsync-fleet` and
//! `twinsync-hub` implement these seams against the real collaborators;
//! tests substitute in-memory fakes.
//!
//! All methods return `Send` futures so the traits can be used in
//! multi-threaded async runtimes (e.g. tokio with `axum`).

use std::future::Future;

use crate::{
  Result,
  facts::{DeviceFacts, DeviceGroupFacts, ProductFacts},
  twin::{DesiredTwinState, TwinSnapshot},
};

// ─── Identity ────────────────────────────────────────────────────────────────

/// Produces bearer tokens scoped to the fleet-management API audience.
///
/// Implementations must be non-interactive on this path: a cached or silently
/// refreshed token, or [`Error::Unauthenticated`](crate::Error::Unauthenticated).
/// Interactive sign-in (device-code grants) is a separate one-time bootstrap
/// and never blocks a reconciliation.
pub trait TokenProvider: Send + Sync {
  fn token(&self) -> impl Future<Output = Result<String>> + Send + '_;
}

// ─── Fleet-management reads ──────────────────────────────────────────────────

/// Read-side client for the fleet-management API.
///
/// Every method fails with
/// [`Error::UpstreamFetch`](crate::Error::UpstreamFetch) on a non-success
/// response, an empty body, or a body that does not match the expected schema.
pub trait FleetApi: Send + Sync {
  /// Fetch [`DeviceFacts`] for one device.
  fn device<'a>(
    &'a self,
    token: &'a str,
    device_id: &'a str,
  ) -> impl Future<Output = Result<DeviceFacts>> + Send + 'a;

  /// Fetch [`DeviceGroupFacts`] for one device group.
  fn device_group<'a>(
    &'a self,
    token: &'a str,
    group_id: &'a str,
  ) -> impl Future<Output = Result<DeviceGroupFacts>> + Send + 'a;

  /// Fetch [`ProductFacts`] for one product.
  fn product<'a>(
    &'a self,
    token: &'a str,
    product_id: &'a str,
  ) -> impl Future<Output = Result<ProductFacts>> + Send + 'a;
}

// ─── Twin store ──────────────────────────────────────────────────────────────

/// The twin store: read the current desired document, conditionally replace it.
pub trait TwinStore: Send + Sync {
  /// Fetch the twin's current desired properties and its ETag.
  fn twin<'a>(
    &'a self,
    device_id: &'a str,
  ) -> impl Future<Output = Result<TwinSnapshot>> + Send + 'a;

  /// Write `state` as the new desired document, conditioned on `etag`.
  ///
  /// A stale tag fails with
  /// [`Error::ConcurrentModification`](crate::Error::ConcurrentModification)
  /// and is never retried here; the event source redelivers.
  fn update_desired<'a>(
    &'a self,
    device_id: &'a str,
    state: &'a DesiredTwinState,
    etag: &'a str,
  ) -> impl Future<Output = Result<()>> + Send + 'a;
}
