//! The desired twin document: derivation and change detection.
//!
//! [`DesiredTwinState`] is the only entity this service ever writes. It is
//! immutable once constructed and compared field-by-field against the twin's
//! current desired properties; a field that is absent from the current
//! document counts the same as a mismatched one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  Error, Result,
  facts::{DeviceFacts, DeviceGroupFacts, ProductFacts},
};

// ─── Policy table ────────────────────────────────────────────────────────────

/// App-update policy names, indexed by the device group's raw policy ordinal.
pub const APP_UPDATE_POLICIES: [&str; 3] =
  ["Update All", "No 3rd Party App Updates", "No Updates"];

/// Literal written when a device has no resolvable OS version.
pub const OS_VERSION_NONE: &str = "None";

/// Resolve a raw update-policy ordinal to its policy name.
///
/// Ordinals outside the table are an upstream contract violation and fail
/// with [`Error::InvalidPolicyIndex`]; they are never defaulted.
pub fn app_update_policy(ordinal: i64) -> Result<&'static str> {
  usize::try_from(ordinal)
    .ok()
    .and_then(|i| APP_UPDATE_POLICIES.get(i).copied())
    .ok_or(Error::InvalidPolicyIndex(ordinal))
}

// ─── Desired state ───────────────────────────────────────────────────────────

/// The derived target document written to a twin's desired properties.
///
/// The serde renames are the wire keys the twin store observes; the
/// comparison below reads the current document by these exact names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTwinState {
  #[serde(rename = "OSVersion")]
  pub os_version:        String,
  #[serde(rename = "Product")]
  pub product:           String,
  #[serde(rename = "DeviceGroup")]
  pub device_group:      String,
  #[serde(rename = "RetailEval")]
  pub retail_eval:       bool,
  #[serde(rename = "AppUpdatePolicy")]
  pub app_update_policy: String,
}

impl DesiredTwinState {
  /// Derive the target state from freshly-fetched facts.
  ///
  /// Pure and deterministic: identical facts always derive an identical
  /// state. The only failure mode is an out-of-range policy ordinal.
  pub fn derive(
    device: &DeviceFacts,
    group: &DeviceGroupFacts,
    product: &ProductFacts,
  ) -> Result<Self> {
    let os_version = match device.last_installed_os_version.as_deref() {
      Some(v) if !v.is_empty() => v.to_string(),
      _ => OS_VERSION_NONE.to_string(),
    };
    Ok(Self {
      os_version,
      product: product.name.clone(),
      device_group: group.name.clone(),
      retail_eval: group.os_feed_type == 1,
      app_update_policy: app_update_policy(group.update_policy)?.to_string(),
    })
  }
}

// ─── Twin snapshot ───────────────────────────────────────────────────────────

/// One twin read: the current desired properties plus the
/// optimistic-concurrency token that must accompany any write.
#[derive(Debug, Clone)]
pub struct TwinSnapshot {
  pub etag:    String,
  pub desired: Value,
}

// ─── Change detection ────────────────────────────────────────────────────────

/// Return the first compared field on which `current` diverges from
/// `candidate`, or `None` if all five are present and equal.
///
/// Comparison order is fixed (`OSVersion`, `Product`, `DeviceGroup`,
/// `RetailEval`, `AppUpdatePolicy`). The order only determines which field is
/// reported in diagnostics; it cannot change the overall verdict.
pub fn first_changed_field(
  current: &Value,
  candidate: &DesiredTwinState,
) -> Option<&'static str> {
  fn differs_str(current: Option<&Value>, want: &str) -> bool {
    current.and_then(Value::as_str) != Some(want)
  }

  if differs_str(current.get("OSVersion"), &candidate.os_version) {
    return Some("OSVersion");
  }
  if differs_str(current.get("Product"), &candidate.product) {
    return Some("Product");
  }
  if differs_str(current.get("DeviceGroup"), &candidate.device_group) {
    return Some("DeviceGroup");
  }
  if current.get("RetailEval").and_then(Value::as_bool)
    != Some(candidate.retail_eval)
  {
    return Some("RetailEval");
  }
  if differs_str(current.get("AppUpdatePolicy"), &candidate.app_update_policy) {
    return Some("AppUpdatePolicy");
  }
  None
}

/// `false` only when every compared field is present in `current` and equal
/// to the candidate's value.
pub fn is_update_needed(current: &Value, candidate: &DesiredTwinState) -> bool {
  first_changed_field(current, candidate).is_some()
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn facts(os: Option<&str>, feed: i64, policy: i64) -> (DeviceFacts, DeviceGroupFacts, ProductFacts) {
    (
      DeviceFacts {
        device_id:       "dev-1".into(),
        product_id:      "prod-1".into(),
        device_group_id: "group-1".into(),
        last_installed_os_version: os.map(String::from),
      },
      DeviceGroupFacts {
        name:          "Kitchens".into(),
        os_feed_type:  feed,
        update_policy: policy,
      },
      ProductFacts { name: "Oven".into() },
    )
  }

  // ── Policy table ──────────────────────────────────────────────────────────

  #[test]
  fn policy_ordinals_map_to_fixed_names() {
    assert_eq!(app_update_policy(0).unwrap(), "Update All");
    assert_eq!(app_update_policy(1).unwrap(), "No 3rd Party App Updates");
    assert_eq!(app_update_policy(2).unwrap(), "No Updates");
  }

  #[test]
  fn policy_ordinal_out_of_range_is_an_error() {
    assert!(matches!(app_update_policy(3), Err(Error::InvalidPolicyIndex(3))));
    assert!(matches!(app_update_policy(-1), Err(Error::InvalidPolicyIndex(-1))));
  }

  // ── Derivation ────────────────────────────────────────────────────────────

  #[test]
  fn derives_full_state_from_facts() {
    let (device, group, product) = facts(Some("21.01"), 1, 0);
    let state = DesiredTwinState::derive(&device, &group, &product).unwrap();
    assert_eq!(state, DesiredTwinState {
      os_version:        "21.01".into(),
      product:           "Oven".into(),
      device_group:      "Kitchens".into(),
      retail_eval:       true,
      app_update_policy: "Update All".into(),
    });
  }

  #[test]
  fn missing_or_empty_os_version_derives_none_literal() {
    let (device, group, product) = facts(None, 0, 0);
    let state = DesiredTwinState::derive(&device, &group, &product).unwrap();
    assert_eq!(state.os_version, "None");

    let (device, group, product) = facts(Some(""), 0, 0);
    let state = DesiredTwinState::derive(&device, &group, &product).unwrap();
    assert_eq!(state.os_version, "None");
  }

  #[test]
  fn retail_eval_only_for_feed_type_one() {
    for (feed, expected) in [(0, false), (1, true), (2, false), (-1, false)] {
      let (device, group, product) = facts(Some("21.01"), feed, 0);
      let state = DesiredTwinState::derive(&device, &group, &product).unwrap();
      assert_eq!(state.retail_eval, expected, "feed type {feed}");
    }
  }

  #[test]
  fn invalid_policy_fails_derivation() {
    let (device, group, product) = facts(Some("21.01"), 0, 3);
    assert!(matches!(
      DesiredTwinState::derive(&device, &group, &product),
      Err(Error::InvalidPolicyIndex(3))
    ));
  }

  #[test]
  fn serializes_with_wire_key_names() {
    let (device, group, product) = facts(Some("21.01"), 1, 2);
    let state = DesiredTwinState::derive(&device, &group, &product).unwrap();
    let value = serde_json::to_value(&state).unwrap();
    assert_eq!(value, json!({
      "OSVersion":       "21.01",
      "Product":         "Oven",
      "DeviceGroup":     "Kitchens",
      "RetailEval":      true,
      "AppUpdatePolicy": "No Updates",
    }));
  }

  // ── Change detection ──────────────────────────────────────────────────────

  fn candidate() -> DesiredTwinState {
    DesiredTwinState {
      os_version:        "21.01".into(),
      product:           "Oven".into(),
      device_group:      "Kitchens".into(),
      retail_eval:       true,
      app_update_policy: "Update All".into(),
    }
  }

  fn matching_current() -> Value {
    json!({
      "OSVersion":       "21.01",
      "Product":         "Oven",
      "DeviceGroup":     "Kitchens",
      "RetailEval":      true,
      "AppUpdatePolicy": "Update All",
    })
  }

  #[test]
  fn all_fields_equal_means_no_update() {
    assert_eq!(first_changed_field(&matching_current(), &candidate()), None);
    assert!(!is_update_needed(&matching_current(), &candidate()));
  }

  #[test]
  fn reapplying_the_written_candidate_is_stable() {
    // The second reconciliation sees exactly what the first one wrote.
    let written = serde_json::to_value(candidate()).unwrap();
    assert!(!is_update_needed(&written, &candidate()));
  }

  #[test]
  fn absent_retail_eval_key_forces_update() {
    let mut current = matching_current();
    current.as_object_mut().unwrap().remove("RetailEval");
    assert_eq!(first_changed_field(&current, &candidate()), Some("RetailEval"));
  }

  #[test]
  fn empty_current_reports_first_field_in_order() {
    assert_eq!(
      first_changed_field(&json!({}), &candidate()),
      Some("OSVersion")
    );
  }

  #[test]
  fn divergence_reported_in_fixed_order() {
    let mut current = matching_current();
    current["Product"] = json!("Fridge");
    current["AppUpdatePolicy"] = json!("No Updates");
    // Product comes before AppUpdatePolicy in the comparison order.
    assert_eq!(first_changed_field(&current, &candidate()), Some("Product"));
  }

  #[test]
  fn mistyped_field_counts_as_changed() {
    let mut current = matching_current();
    current["RetailEval"] = json!("true");
    assert_eq!(first_changed_field(&current, &candidate()), Some("RetailEval"));
  }
}
