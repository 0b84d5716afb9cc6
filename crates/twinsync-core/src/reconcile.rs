//! Per-event reconciliation: derive the target state, compare, conditionally
//! write.
//!
//! Every event is reconciled independently and idempotently — there is no
//! persisted reconciliation state, and re-running against identical upstream
//! facts and an unchanged twin is always a no-op. For a single device, the
//! twin write's ETag condition is the sole correctness mechanism when two
//! attempts race; no lock is held across the read-compare-write sequence.

use std::sync::Arc;

use crate::{
  Result,
  client::{FleetApi, TokenProvider, TwinStore},
  event::TriggerEvent,
  twin::{self, DesiredTwinState},
};

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// What one reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// The event kind does not trigger reconciliation; no upstream call made.
  Skipped,
  /// The twin's desired document already matches the derived state.
  Unchanged,
  /// A new desired document was written.
  Updated,
}

// ─── Reconciler ──────────────────────────────────────────────────────────────

/// Stateless reconciliation entry point over the three capability seams.
///
/// Cheap to clone; holds only `Arc`s.
pub struct Reconciler<P, F, T> {
  tokens: Arc<P>,
  fleet:  Arc<F>,
  twins:  Arc<T>,
}

impl<P, F, T> Clone for Reconciler<P, F, T> {
  fn clone(&self) -> Self {
    Self {
      tokens: Arc::clone(&self.tokens),
      fleet:  Arc::clone(&self.fleet),
      twins:  Arc::clone(&self.twins),
    }
  }
}

impl<P, F, T> Reconciler<P, F, T>
where
  P: TokenProvider,
  F: FleetApi,
  T: TwinStore,
{
  pub fn new(tokens: Arc<P>, fleet: Arc<F>, twins: Arc<T>) -> Self {
    Self { tokens, fleet, twins }
  }

  /// Fetch device, device-group, and product facts and derive the target
  /// desired state.
  ///
  /// The three reads are sequential — they are independent of each other, but
  /// cheap enough that serial latency is acceptable. The result is fully
  /// populated or an error; there is no partial state.
  pub async fn derive_desired_state(
    &self,
    token: &str,
    device_id: &str,
  ) -> Result<DesiredTwinState> {
    let device  = self.fleet.device(token, device_id).await?;
    let group   = self.fleet.device_group(token, &device.device_group_id).await?;
    let product = self.fleet.product(token, &device.product_id).await?;
    DesiredTwinState::derive(&device, &group, &product)
  }

  /// Reconcile one inbound event.
  ///
  /// Unrecognized event kinds are skipped without touching any collaborator.
  /// For recognized kinds: token → derive → read twin → compare →
  /// conditional write. Errors abort this reconciliation only.
  pub async fn reconcile(&self, event: &TriggerEvent) -> Result<Outcome> {
    if !event.kind.triggers_reconciliation() {
      tracing::debug!(
        device_id = %event.device_id,
        kind = ?event.kind,
        "event does not trigger reconciliation",
      );
      return Ok(Outcome::Skipped);
    }

    let token     = self.tokens.token().await?;
    let candidate = self.derive_desired_state(&token, &event.device_id).await?;
    let snapshot  = self.twins.twin(&event.device_id).await?;

    match twin::first_changed_field(&snapshot.desired, &candidate) {
      None => {
        tracing::debug!(device_id = %event.device_id, "twin already up to date");
        Ok(Outcome::Unchanged)
      }
      Some(field) => {
        tracing::info!(
          device_id = %event.device_id,
          field,
          "desired state diverged; updating twin",
        );
        self
          .twins
          .update_desired(&event.device_id, &candidate, &snapshot.etag)
          .await?;
        Ok(Outcome::Updated)
      }
    }
  }
}
