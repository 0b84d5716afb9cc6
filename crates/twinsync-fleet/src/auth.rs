//! Token acquisition for the fleet-management API audience.
//!
//! Two non-interactive grant paths — cached device-code tokens with silent
//! refresh, and managed identity via IMDS — plus a static-token variant for
//! tests and local runs. Interactive sign-in is a one-time bootstrap:
//! [`AuthProvider::begin_login`] returns the human instructions immediately
//! and the grant completes on a background task, so event processing never
//! waits on a person.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use twinsync_core::{Error, Result, client::TokenProvider};

// ─── Well-known constants ────────────────────────────────────────────────────

/// Client application id of the Azure Sphere public API.
pub const CLIENT_APP_ID: &str = "0B1C8F7E-28D2-4378-97E2-7D7D63F7C87F";

/// AAD tenant that issues Azure Sphere API tokens.
pub const SPHERE_AAD_TENANT: &str = "7d71c83c-ccdf-45b7-b3c9-9c41b94406d9";

/// Delegated scope for fleet API calls.
pub const SPHERE_SCOPE: &str = "https://sphere.azure.net/api/user_impersonation";

/// Resource (audience) requested from the managed-identity endpoint.
pub const SPHERE_RESOURCE: &str = "https://sphere.azure.net/";

/// IMDS token endpoint used by the managed-identity grant.
pub const DEFAULT_IMDS_URL: &str =
  "http://169.254.169.254/metadata/identity/oauth2/token";

/// Authority issuing Azure Sphere tokens.
pub fn default_authority() -> String {
  format!("https://login.microsoftonline.com/{SPHERE_AAD_TENANT}")
}

// ─── Token cache ─────────────────────────────────────────────────────────────

/// Renew this many seconds before nominal expiry so a token never goes stale
/// mid-call.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct TokenSet {
  access_token:  String,
  refresh_token: Option<String>,
  expires_at:    DateTime<Utc>,
}

impl TokenSet {
  fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    self.expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECS) > now
  }
}

// ─── Wire schemas ────────────────────────────────────────────────────────────

fn default_poll_interval() -> u64 { 5 }

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
  device_code:      String,
  user_code:        String,
  verification_uri: String,
  expires_in:       i64,
  #[serde(default = "default_poll_interval")]
  interval:         u64,
  #[serde(default)]
  message:          String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token:  String,
  #[serde(default)]
  refresh_token: Option<String>,
  expires_in:    i64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
  #[serde(default)]
  error: String,
}

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
  access_token: String,
  /// IMDS reports the lifetime as a decimal string.
  expires_in:   String,
}

// ─── Device-code grant ───────────────────────────────────────────────────────

/// The user-facing half of a device-code grant: what to show the human, plus
/// the opaque code the poll loop redeems.
#[derive(Debug, Clone)]
pub struct DeviceCodeGrant {
  pub user_code:        String,
  pub verification_uri: String,
  /// The authority's ready-made sign-in instruction line.
  pub message:          String,
  device_code:          String,
  interval:             Duration,
  expires_at:           DateTime<Utc>,
}

impl DeviceCodeGrant {
  /// Human-readable sign-in instructions.
  pub fn instructions(&self) -> String {
    if self.message.is_empty() {
      format!(
        "To sign in, open {} and enter the code {}",
        self.verification_uri, self.user_code
      )
    } else {
      self.message.clone()
    }
  }
}

/// Interactive device-code flow with a cached, silently-refreshed token set.
pub struct DeviceCodeAuth {
  http:      reqwest::Client,
  authority: String,
  cache:     RwLock<Option<TokenSet>>,
}

impl DeviceCodeAuth {
  pub fn new(authority: impl Into<String>) -> Result<Self> {
    let authority = authority.into();
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| Error::Unauthenticated(format!("building HTTP client: {e}")))?;
    Ok(Self { http, authority, cache: RwLock::new(None) })
  }

  /// Start a device-code grant and return the sign-in instructions.
  ///
  /// Does not wait for the human; pass the grant to [`complete_login`]
  /// (typically on a spawned task) to redeem it.
  ///
  /// [`complete_login`]: DeviceCodeAuth::complete_login
  pub async fn begin_login(&self) -> Result<DeviceCodeGrant> {
    let url = format!("{}/oauth2/v2.0/devicecode", self.authority);
    let scope = format!("{SPHERE_SCOPE} offline_access");
    let resp = self
      .http
      .post(&url)
      .form(&[("client_id", CLIENT_APP_ID), ("scope", scope.as_str())])
      .send()
      .await
      .map_err(|e| Error::Unauthenticated(format!("device-code request failed: {e}")))?;

    if !resp.status().is_success() {
      return Err(Error::Unauthenticated(format!(
        "device-code request returned {}",
        resp.status()
      )));
    }
    let dc: DeviceCodeResponse = resp
      .json()
      .await
      .map_err(|e| Error::Unauthenticated(format!("device-code response: {e}")))?;

    Ok(DeviceCodeGrant {
      user_code:        dc.user_code,
      verification_uri: dc.verification_uri,
      message:          dc.message,
      device_code:      dc.device_code,
      interval:         Duration::from_secs(dc.interval),
      expires_at:       Utc::now() + chrono::Duration::seconds(dc.expires_in),
    })
  }

  /// Poll the token endpoint until the human completes sign-in, the grant
  /// expires, or the authority rejects it. On success the token set is
  /// cached and all subsequent [`token`](DeviceCodeAuth::token) calls are
  /// non-interactive.
  pub async fn complete_login(&self, grant: DeviceCodeGrant) -> Result<()> {
    let url = format!("{}/oauth2/v2.0/token", self.authority);
    let mut interval = grant.interval;

    loop {
      if Utc::now() >= grant.expires_at {
        return Err(Error::Unauthenticated(
          "device-code grant expired before sign-in completed".into(),
        ));
      }
      tokio::time::sleep(interval).await;

      let resp = self
        .http
        .post(&url)
        .form(&[
          ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
          ("client_id", CLIENT_APP_ID),
          ("device_code", grant.device_code.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Unauthenticated(format!("token request failed: {e}")))?;

      if resp.status().is_success() {
        let token: TokenResponse = resp
          .json()
          .await
          .map_err(|e| Error::Unauthenticated(format!("token response: {e}")))?;
        self.store(token, None).await?;
        tracing::info!("device-code sign-in complete");
        return Ok(());
      }

      let rejection: TokenErrorResponse = resp.json().await.unwrap_or_default();
      match rejection.error.as_str() {
        "authorization_pending" => {}
        "slow_down" => interval += Duration::from_secs(5),
        other => {
          return Err(Error::Unauthenticated(format!(
            "device-code grant rejected: {other}"
          )));
        }
      }
    }
  }

  pub async fn has_cached_token(&self) -> bool {
    self.cache.read().await.is_some()
  }

  /// Return a cached token, silently refreshing it when near expiry.
  /// Never interactive: without a completed sign-in this is
  /// [`Error::Unauthenticated`].
  pub async fn token(&self) -> Result<String> {
    {
      let cache = self.cache.read().await;
      if let Some(set) = cache.as_ref()
        && set.is_fresh(Utc::now())
      {
        return Ok(set.access_token.clone());
      }
    }
    self.refresh().await
  }

  async fn refresh(&self) -> Result<String> {
    let refresh_token = {
      let cache = self.cache.read().await;
      match cache.as_ref().and_then(|s| s.refresh_token.clone()) {
        Some(rt) => rt,
        None => {
          return Err(Error::Unauthenticated(
            "no usable cached token; interactive sign-in has not completed".into(),
          ));
        }
      }
    };

    let url = format!("{}/oauth2/v2.0/token", self.authority);
    let scope = format!("{SPHERE_SCOPE} offline_access");
    let resp = self
      .http
      .post(&url)
      .form(&[
        ("grant_type", "refresh_token"),
        ("client_id", CLIENT_APP_ID),
        ("scope", scope.as_str()),
        ("refresh_token", refresh_token.as_str()),
      ])
      .send()
      .await
      .map_err(|e| Error::Unauthenticated(format!("token refresh failed: {e}")))?;

    if !resp.status().is_success() {
      return Err(Error::Unauthenticated(format!(
        "token refresh returned {}",
        resp.status()
      )));
    }
    let token: TokenResponse = resp
      .json()
      .await
      .map_err(|e| Error::Unauthenticated(format!("token refresh response: {e}")))?;

    let access = token.access_token.clone();
    // The authority may omit the rotated refresh token; keep the old one.
    self.store(token, Some(refresh_token)).await?;
    Ok(access)
  }

  async fn store(&self, token: TokenResponse, previous_refresh: Option<String>) -> Result<()> {
    if token.access_token.is_empty() {
      return Err(Error::Unauthenticated(
        "token endpoint returned an empty access token".into(),
      ));
    }
    let set = TokenSet {
      access_token:  token.access_token,
      refresh_token: token.refresh_token.or(previous_refresh),
      expires_at:    Utc::now() + chrono::Duration::seconds(token.expires_in),
    };
    *self.cache.write().await = Some(set);
    Ok(())
  }
}

// ─── Managed identity ────────────────────────────────────────────────────────

/// Non-interactive tokens from the instance-metadata service.
pub struct ManagedIdentityAuth {
  http:     reqwest::Client,
  endpoint: String,
  resource: String,
  cache:    RwLock<Option<TokenSet>>,
}

impl ManagedIdentityAuth {
  pub fn new() -> Result<Self> {
    Self::with_endpoint(DEFAULT_IMDS_URL, SPHERE_RESOURCE)
  }

  pub fn with_endpoint(endpoint: impl Into<String>, resource: impl Into<String>) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| Error::Unauthenticated(format!("building HTTP client: {e}")))?;
    Ok(Self {
      http,
      endpoint: endpoint.into(),
      resource: resource.into(),
      cache: RwLock::new(None),
    })
  }

  pub async fn token(&self) -> Result<String> {
    {
      let cache = self.cache.read().await;
      if let Some(set) = cache.as_ref()
        && set.is_fresh(Utc::now())
      {
        return Ok(set.access_token.clone());
      }
    }

    let resp = self
      .http
      .get(&self.endpoint)
      .query(&[("api-version", "2018-02-01"), ("resource", self.resource.as_str())])
      .header("Metadata", "true")
      .send()
      .await
      .map_err(|e| Error::Unauthenticated(format!("IMDS request failed: {e}")))?;

    if !resp.status().is_success() {
      return Err(Error::Unauthenticated(format!(
        "IMDS returned {}",
        resp.status()
      )));
    }
    let token: ImdsTokenResponse = resp
      .json()
      .await
      .map_err(|e| Error::Unauthenticated(format!("IMDS response: {e}")))?;
    if token.access_token.is_empty() {
      return Err(Error::Unauthenticated("IMDS returned an empty access token".into()));
    }

    let expires_in: i64 = token
      .expires_in
      .parse()
      .map_err(|_| Error::Unauthenticated(format!("IMDS expiry {:?} unparsable", token.expires_in)))?;
    let set = TokenSet {
      access_token:  token.access_token.clone(),
      refresh_token: None,
      expires_at:    Utc::now() + chrono::Duration::seconds(expires_in),
    };
    *self.cache.write().await = Some(set);
    Ok(token.access_token)
  }
}

// ─── Provider selection ──────────────────────────────────────────────────────

/// Configuration-selected token source.
pub enum AuthProvider {
  DeviceCode(DeviceCodeAuth),
  ManagedIdentity(ManagedIdentityAuth),
  /// A fixed token, for tests and local development.
  Static(String),
}

impl AuthProvider {
  /// Device-code flow against the public authority.
  pub fn device_code() -> Result<Self> {
    Ok(Self::DeviceCode(DeviceCodeAuth::new(default_authority())?))
  }

  pub fn managed_identity() -> Result<Self> {
    Ok(Self::ManagedIdentity(ManagedIdentityAuth::new()?))
  }

  /// Start an interactive sign-in, when this provider has one.
  /// `None` means no login step is required.
  pub async fn begin_login(&self) -> Result<Option<DeviceCodeGrant>> {
    match self {
      Self::DeviceCode(auth) => auth.begin_login().await.map(Some),
      Self::ManagedIdentity(_) | Self::Static(_) => Ok(None),
    }
  }

  /// Redeem a previously started grant. Blocks until sign-in or expiry, so
  /// run it on a spawned task.
  pub async fn complete_login(&self, grant: DeviceCodeGrant) -> Result<()> {
    match self {
      Self::DeviceCode(auth) => auth.complete_login(grant).await,
      Self::ManagedIdentity(_) | Self::Static(_) => Ok(()),
    }
  }

  /// Whether the non-interactive token path is currently usable.
  pub async fn is_authenticated(&self) -> bool {
    match self {
      Self::DeviceCode(auth) => auth.has_cached_token().await,
      Self::ManagedIdentity(_) => true,
      Self::Static(token) => !token.is_empty(),
    }
  }
}

impl TokenProvider for AuthProvider {
  async fn token(&self) -> Result<String> {
    match self {
      Self::DeviceCode(auth) => auth.token().await,
      Self::ManagedIdentity(auth) => auth.token().await,
      Self::Static(token) if token.is_empty() => {
        Err(Error::Unauthenticated("static token is empty".into()))
      }
      Self::Static(token) => Ok(token.clone()),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
  };
  use serde_json::json;

  use super::*;
  use crate::testutil::serve;

  #[test]
  fn token_freshness_respects_the_skew_margin() {
    let now = Utc::now();
    let set = |secs: i64| TokenSet {
      access_token:  "t".into(),
      refresh_token: None,
      expires_at:    now + chrono::Duration::seconds(secs),
    };
    assert!(set(300).is_fresh(now));
    assert!(!set(30).is_fresh(now));
    assert!(!set(-10).is_fresh(now));
  }

  #[tokio::test]
  async fn token_without_completed_login_is_unauthenticated() {
    let auth = DeviceCodeAuth::new("http://127.0.0.1:9").unwrap();
    let err = auth.token().await.unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));
  }

  #[tokio::test]
  async fn device_code_flow_caches_a_token_after_sign_in() {
    // Fake authority: one "authorization_pending" poll, then success.
    let polls = Arc::new(AtomicUsize::new(0));
    let polls_route = Arc::clone(&polls);
    let router = Router::new()
      .route(
        "/oauth2/v2.0/devicecode",
        post(|| async {
          Json(json!({
            "device_code":      "dc-1",
            "user_code":        "ABCD1234",
            "verification_uri": "https://example.com/devicelogin",
            "expires_in":       900,
            "interval":         0,
            "message":          "go sign in",
          }))
        }),
      )
      .route(
        "/oauth2/v2.0/token",
        post(move || {
          let polls = Arc::clone(&polls_route);
          async move {
            if polls.fetch_add(1, Ordering::SeqCst) == 0 {
              (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "authorization_pending" })),
              )
            } else {
              (
                StatusCode::OK,
                Json(json!({
                  "access_token":  "at-1",
                  "refresh_token": "rt-1",
                  "expires_in":    3600,
                })),
              )
            }
          }
        }),
      );
    let base = serve(router).await;

    let auth = DeviceCodeAuth::new(base).unwrap();
    assert!(!auth.has_cached_token().await);

    let grant = auth.begin_login().await.unwrap();
    assert_eq!(grant.user_code, "ABCD1234");
    assert_eq!(grant.instructions(), "go sign in");

    auth.complete_login(grant).await.unwrap();
    assert!(auth.has_cached_token().await);
    assert_eq!(auth.token().await.unwrap(), "at-1");
    assert_eq!(polls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn rejected_grant_is_unauthenticated() {
    let router = Router::new()
      .route(
        "/oauth2/v2.0/devicecode",
        post(|| async {
          Json(json!({
            "device_code":      "dc-1",
            "user_code":        "ABCD1234",
            "verification_uri": "https://example.com/devicelogin",
            "expires_in":       900,
            "interval":         0,
          }))
        }),
      )
      .route(
        "/oauth2/v2.0/token",
        post(|| async {
          (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "access_denied" })),
          )
        }),
      );
    let base = serve(router).await;

    let auth = DeviceCodeAuth::new(base).unwrap();
    let grant = auth.begin_login().await.unwrap();
    let err = auth.complete_login(grant).await.unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)), "{err}");
  }

  #[tokio::test]
  async fn managed_identity_parses_and_caches_imds_tokens() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_route = Arc::clone(&calls);
    let router = Router::new().route(
      "/metadata/identity/oauth2/token",
      get(move || {
        let calls = Arc::clone(&calls_route);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          // IMDS reports expires_in as a string.
          Json(json!({ "access_token": "mi-1", "expires_in": "3599" }))
        }
      }),
    );
    let base = serve(router).await;

    let auth = ManagedIdentityAuth::with_endpoint(
      format!("{base}/metadata/identity/oauth2/token"),
      SPHERE_RESOURCE,
    )
    .unwrap();

    assert_eq!(auth.token().await.unwrap(), "mi-1");
    assert_eq!(auth.token().await.unwrap(), "mi-1");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second call should hit the cache");
  }

  #[tokio::test]
  async fn static_provider_rejects_an_empty_token() {
    let err = AuthProvider::Static(String::new()).token().await.unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));
    assert_eq!(
      AuthProvider::Static("t".into()).token().await.unwrap(),
      "t"
    );
  }
}
