//! HTTP surface for the twin reconciler.
//!
//! | Method | Path       | Notes |
//! |--------|------------|-------|
//! | `GET`  | `/`        | Liveness plus outbound-auth status |
//! | `GET`  | `/webhook` | API-key-gated interactive-login bootstrap |
//! | `POST` | `/webhook` | Event intake: validation handshake or reconciliation |
//!
//! Exposes an axum [`Router`] over any [`FleetApi`] + [`TwinStore`] pair;
//! the binary wires the real clients in, tests substitute fakes.

pub mod envelope;
pub mod error;
pub mod secrets;

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::{Query, State},
  routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use twinsync_core::{
  client::{FleetApi, TwinStore},
  reconcile::{Outcome, Reconciler},
};
use twinsync_fleet::auth::AuthProvider;

pub use error::ApiError;
pub use secrets::Settings;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` layered
/// with the `TWINSYNC_*` environment.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,

  /// Token acquisition for the fleet API.
  #[serde(default)]
  pub auth: AuthMode,

  /// Where the startup secrets come from.
  #[serde(default)]
  pub secrets: SecretsMode,
  /// Key Vault base URL; required when `secrets = "key_vault"`.
  #[serde(default)]
  pub key_vault_url: Option<String>,

  /// Fleet API endpoint overrides; the public endpoints by default.
  #[serde(default)]
  pub fleet_api_base: Option<String>,
  #[serde(default)]
  pub versions_url: Option<String>,

  // Inline secrets, read when `secrets = "config"`.
  #[serde(default)]
  pub api_key: Option<String>,
  #[serde(default)]
  pub tenant_id: Option<String>,
  #[serde(default)]
  pub iothub_connection_string: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
  #[default]
  DeviceCode,
  ManagedIdentity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsMode {
  #[default]
  Config,
  KeyVault,
}

// ─── Application state ───────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<F, T> {
  pub reconciler: Arc<Reconciler<AuthProvider, F, T>>,
  pub auth:       Arc<AuthProvider>,
  pub settings:   Arc<Settings>,
}

impl<F, T> Clone for AppState<F, T> {
  fn clone(&self) -> Self {
    Self {
      reconciler: Arc::clone(&self.reconciler),
      auth:       Arc::clone(&self.auth),
      settings:   Arc::clone(&self.settings),
    }
  }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build the axum [`Router`] for the reconciler service.
pub fn router<F, T>(state: AppState<F, T>) -> Router
where
  F: FleetApi + 'static,
  T: TwinStore + 'static,
{
  Router::new()
    .route("/", get(root_status::<F, T>))
    .route(
      "/webhook",
      get(begin_login::<F, T>).post(receive_events::<F, T>),
    )
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// `GET /` — liveness plus whether outbound auth has completed.
async fn root_status<F, T>(State(state): State<AppState<F, T>>) -> String
where
  F: FleetApi + 'static,
  T: TwinStore + 'static,
{
  let auth = if state.auth.is_authenticated().await {
    "auth is complete"
  } else {
    "auth has not completed"
  };
  format!("API service is running; {auth}")
}

#[derive(Debug, Deserialize)]
struct LoginParams {
  #[serde(default)]
  api_key: String,
}

/// `GET /webhook?api_key=…` — one-time interactive sign-in bootstrap.
///
/// Returns the sign-in instructions immediately; the grant is redeemed on a
/// background task, so event processing never waits on a human.
async fn begin_login<F, T>(
  State(state): State<AppState<F, T>>,
  Query(params): Query<LoginParams>,
) -> Result<Json<Value>, ApiError>
where
  F: FleetApi + 'static,
  T: TwinStore + 'static,
{
  if params.api_key.is_empty() || params.api_key != state.settings.api_key {
    return Err(ApiError::InvalidApiKey);
  }

  match state.auth.begin_login().await? {
    None => Ok(Json(json!({ "status": "no interactive sign-in required" }))),
    Some(grant) => {
      let instructions = grant.instructions();
      let auth = Arc::clone(&state.auth);
      tokio::spawn(async move {
        if let Err(e) = auth.complete_login(grant).await {
          tracing::error!(error = %e, "interactive sign-in failed");
        }
      });
      Ok(Json(json!({
        "status":       "sign-in started",
        "instructions": instructions,
      })))
    }
  }
}

/// `POST /webhook` — event intake.
async fn receive_events<F, T>(
  State(state): State<AppState<F, T>>,
  Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError>
where
  F: FleetApi + 'static,
  T: TwinStore + 'static,
{
  match envelope::parse(&payload)? {
    envelope::Inbound::Validation { code } => {
      tracing::info!("answering subscription-validation handshake");
      Ok(Json(json!({ "validationResponse": code })))
    }
    envelope::Inbound::Event(event) => {
      let outcome = state.reconciler.reconcile(&event).await?;
      let outcome = match outcome {
        Outcome::Skipped => "skipped",
        Outcome::Unchanged => "unchanged",
        Outcome::Updated => "updated",
      };
      Ok(Json(json!({ "deviceId": event.device_id, "outcome": outcome })))
    }
  }
}

// ─── Integration tests ───────────────────────────────────────────────────────
