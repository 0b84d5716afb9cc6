//! Secret resolution at startup.
//!
//! The reconciler needs three secrets before it can serve: the inbound API
//! key, the twin-store connection string, and the fleet tenant id. They are
//! resolved exactly once into an immutable [`Settings`] that is injected by
//! reference — nothing re-fetches per call, and nothing is globally mutable.

use std::{future::Future, time::Duration};

use serde::Deserialize;
use twinsync_core::{Error, Result};
use twinsync_fleet::auth::{DEFAULT_IMDS_URL, ManagedIdentityAuth};

/// Resource (audience) for Key Vault tokens.
pub const VAULT_RESOURCE: &str = "https://vault.azure.net";

/// Secret names, matching the entries provisioned in the vault.
pub const API_KEY_SECRET: &str = "APIKey";
pub const HUB_CONNECTION_SECRET: &str = "IoTHubConnectionString";
pub const TENANT_ID_SECRET: &str = "tenantId";

// ─── Settings ────────────────────────────────────────────────────────────────

/// Secrets and identifiers resolved once at process start.
#[derive(Debug, Clone)]
pub struct Settings {
  pub api_key:               String,
  pub tenant_id:             String,
  pub hub_connection_string: String,
}

impl Settings {
  pub async fn resolve<S: SecretStore>(store: &S) -> Result<Self> {
    Ok(Self {
      api_key:               store.secret(API_KEY_SECRET).await?,
      tenant_id:             store.secret(TENANT_ID_SECRET).await?,
      hub_connection_string: store.secret(HUB_CONNECTION_SECRET).await?,
    })
  }
}

// ─── Seam ────────────────────────────────────────────────────────────────────

/// Resolves named secrets. An empty value counts as missing.
pub trait SecretStore: Send + Sync {
  fn secret<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<String>> + Send + 'a;
}

// ─── Inline configuration ────────────────────────────────────────────────────

/// Secrets read straight from the server configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSecrets {
  pub api_key:               Option<String>,
  pub tenant_id:             Option<String>,
  pub hub_connection_string: Option<String>,
}

impl SecretStore for ConfigSecrets {
  async fn secret(&self, name: &str) -> Result<String> {
    let value = match name {
      API_KEY_SECRET => self.api_key.clone(),
      TENANT_ID_SECRET => self.tenant_id.clone(),
      HUB_CONNECTION_SECRET => self.hub_connection_string.clone(),
      _ => None,
    };
    value
      .filter(|v| !v.is_empty())
      .ok_or_else(|| Error::upstream("config", format!("secret {name} is not configured")))
  }
}

// ─── Key Vault ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SecretBundle {
  value: String,
}

/// Secrets fetched from a Key Vault, authenticated via managed identity.
pub struct KeyVaultSecrets {
  http:      reqwest::Client,
  vault_url: String,
  auth:      ManagedIdentityAuth,
}

impl KeyVaultSecrets {
  pub fn new(vault_url: impl Into<String>) -> Result<Self> {
    let auth = ManagedIdentityAuth::with_endpoint(DEFAULT_IMDS_URL, VAULT_RESOURCE)?;
    Self::with_auth(vault_url, auth)
  }

  /// Inject a non-default identity endpoint (loopback tests).
  pub fn with_auth(vault_url: impl Into<String>, auth: ManagedIdentityAuth) -> Result<Self> {
    let vault_url = vault_url.into();
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| Error::upstream(&vault_url, format!("building HTTP client: {e}")))?;
    Ok(Self { http, vault_url, auth })
  }
}

impl SecretStore for KeyVaultSecrets {
  async fn secret(&self, name: &str) -> Result<String> {
    let token = self.auth.token().await?;
    let url = format!("{}/secrets/{name}", self.vault_url.trim_end_matches('/'));

    let resp = self
      .http
      .get(&url)
      .query(&[("api-version", "7.4")])
      .bearer_auth(token)
      .send()
      .await
      .map_err(|e| Error::upstream(&url, e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
      return Err(Error::upstream(&url, format!("status {status}")));
    }
    let bundle: SecretBundle = resp
      .json()
      .await
      .map_err(|e| Error::upstream(&url, format!("schema mismatch: {e}")))?;

    if bundle.value.is_empty() {
      return Err(Error::upstream(&url, "secret value is empty"));
    }
    Ok(bundle.value)
  }
}

#[cfg(test)]
mod tests {
  use axum::{Json, Router, routing::get};
  use serde_json::json;

  use super::*;

  #[tokio::test]
  async fn config_secrets_resolve_by_well_known_name() {
    let store = ConfigSecrets {
      api_key:               Some("key-1".into()),
      tenant_id:             Some("t1".into()),
      hub_connection_string: Some("HostName=h;…".into()),
    };
    let settings = Settings::resolve(&store).await.unwrap();
    assert_eq!(settings.api_key, "key-1");
    assert_eq!(settings.tenant_id, "t1");
  }

  #[tokio::test]
  async fn missing_or_empty_config_secret_fails_resolution() {
    let store = ConfigSecrets {
      api_key:               Some(String::new()),
      tenant_id:             Some("t1".into()),
      hub_connection_string: Some("conn".into()),
    };
    let err = Settings::resolve(&store).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamFetch { .. }), "{err}");
  }

  #[tokio::test]
  async fn key_vault_store_fetches_with_a_managed_identity_token() {
    let router = Router::new()
      .route(
        "/metadata/identity/oauth2/token",
        get(|| async { Json(json!({ "access_token": "mi-1", "expires_in": "3599" })) }),
      )
      .route(
        "/secrets/APIKey",
        get(|| async { Json(json!({ "value": "vault-key-1" })) }),
      );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router).await.unwrap();
    });
    let base = format!("http://{addr}");

    let auth = ManagedIdentityAuth::with_endpoint(
      format!("{base}/metadata/identity/oauth2/token"),
      VAULT_RESOURCE,
    )
    .unwrap();
    let store = KeyVaultSecrets::with_auth(base, auth).unwrap();

    assert_eq!(store.secret(API_KEY_SECRET).await.unwrap(), "vault-key-1");
    assert!(store.secret("missing").await.is_err());
  }
}
