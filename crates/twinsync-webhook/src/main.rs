//! twinsync webhook server binary.
//!
//! Reads `config.toml` (or the path given with `--config`), resolves the
//! startup secrets, wires the fleet and twin-store clients, and serves the
//! webhook over HTTP.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use twinsync_core::reconcile::Reconciler;
use twinsync_fleet::{FleetClient, FleetConfig, auth::AuthProvider};
use twinsync_hub::{ConnectionString, HubClient};
use twinsync_webhook::{
  AppState, AuthMode, SecretsMode, ServerConfig, Settings,
  secrets::{ConfigSecrets, KeyVaultSecrets},
};

#[derive(Parser)]
#[command(author, version, about = "Device-twin reconciliation webhook")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let sources = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("TWINSYNC"))
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = sources
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  // Resolve the startup secrets once, into an immutable Settings.
  let settings = match server_cfg.secrets {
    SecretsMode::Config => {
      let store = ConfigSecrets {
        api_key:               server_cfg.api_key.clone(),
        tenant_id:             server_cfg.tenant_id.clone(),
        hub_connection_string: server_cfg.iothub_connection_string.clone(),
      };
      Settings::resolve(&store).await
    }
    SecretsMode::KeyVault => {
      let vault_url = server_cfg
        .key_vault_url
        .clone()
        .context("secrets = \"key_vault\" requires key_vault_url")?;
      let store = KeyVaultSecrets::new(vault_url).context("building Key Vault client")?;
      Settings::resolve(&store).await
    }
  }
  .context("resolving startup secrets")?;

  // Outbound auth.
  let auth = Arc::new(
    match server_cfg.auth {
      AuthMode::DeviceCode => AuthProvider::device_code(),
      AuthMode::ManagedIdentity => AuthProvider::managed_identity(),
    }
    .context("building token provider")?,
  );

  // Fleet client.
  let mut fleet_cfg = FleetConfig::new(settings.tenant_id.clone());
  if let Some(base) = &server_cfg.fleet_api_base {
    fleet_cfg.base_url = base.clone();
  }
  if let Some(url) = &server_cfg.versions_url {
    fleet_cfg.versions_url = url.clone();
  }
  let fleet = Arc::new(FleetClient::new(fleet_cfg).context("building fleet client")?);

  // Twin store.
  let connection: ConnectionString = settings
    .hub_connection_string
    .parse()
    .context("parsing twin-store connection string")?;
  let twins = Arc::new(HubClient::new(connection).context("building twin-store client")?);

  // Build application state.
  let settings = Arc::new(settings);
  let state = AppState {
    reconciler: Arc::new(Reconciler::new(Arc::clone(&auth), fleet, twins)),
    auth,
    settings,
  };

  let app = twinsync_webhook::router(state);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}
