//! Fact snapshots fetched from the fleet-management API.
//!
//! All three are read fresh on every reconciliation and discarded as soon as
//! the desired twin state has been derived. Nothing here is cached or
//! persisted; the twin store owns all durable state.

use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of one device's fleet-management record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFacts {
  pub device_id:       String,
  pub product_id:      String,
  pub device_group_id: String,
  /// The OS version the device is currently running, where the fleet API
  /// could resolve one. Absent or empty derives the literal `"None"`.
  pub last_installed_os_version: Option<String>,
}

/// Facts about the device group a device belongs to.
///
/// `os_feed_type` and `update_policy` are kept as the raw ordinals the
/// upstream API returned rather than eagerly-validated enums: the policy
/// ordinal is checked against the policy table at derivation time so an
/// out-of-range value fails with a dedicated error instead of a parse error,
/// and any feed type other than `1` derives a non-eval device group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroupFacts {
  pub name:          String,
  /// 0 = Retail, 1 = Retail Eval.
  pub os_feed_type:  i64,
  /// Index into [`crate::twin::APP_UPDATE_POLICIES`].
  pub update_policy: i64,
}

/// Facts about the product a device belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductFacts {
  pub name: String,
}
