//! `twinsync` — operator lookups against the fleet-management API.
//!
//! # Usage
//!
//! ```
//! twinsync find-tenant <DEVICE_ID>
//! twinsync os-version --tenant <TENANT_ID> <DEVICE_ID>
//! ```
//!
//! Both commands sign in interactively with a device-code grant and print
//! the instructions to stderr before waiting.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use twinsync_core::client::TokenProvider as _;
use twinsync_fleet::{FleetClient, FleetConfig, auth::AuthProvider};

/// Device ids are fixed-length; catch typos before any network call.
const DEVICE_ID_LEN: usize = 128;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "twinsync", about = "Operator lookups against the fleet-management API")]
struct Cli {
  #[command(subcommand)]
  command: Command,

  /// Fleet API base URL.
  #[arg(long, env = "TWINSYNC_FLEET_API_BASE")]
  api_base: Option<String>,
}

#[derive(Subcommand)]
enum Command {
  /// Find which tenant a device is claimed into.
  FindTenant {
    /// The 128-character device id.
    device_id: String,
  },
  /// Look up the OS version a device is running.
  OsVersion {
    /// Fleet tenant the device belongs to.
    #[arg(long, env = "TWINSYNC_TENANT_ID")]
    tenant: String,

    /// The 128-character device id.
    device_id: String,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  match &cli.command {
    Command::FindTenant { device_id } => {
      ensure_device_id(device_id)?;
      let (client, token) = connect(cli.api_base.clone(), String::new()).await?;
      find_tenant(&client, &token, device_id).await
    }
    Command::OsVersion { tenant, device_id } => {
      ensure_device_id(device_id)?;
      let (client, token) = connect(cli.api_base.clone(), tenant.clone()).await?;
      match client.resolve_os_version(&token, device_id).await {
        Some(version) => {
          println!("OS version: {version}");
          Ok(())
        }
        None => bail!("could not resolve an OS version for this device"),
      }
    }
  }
}

fn ensure_device_id(device_id: &str) -> Result<()> {
  if device_id.len() != DEVICE_ID_LEN {
    bail!(
      "device ids are {DEVICE_ID_LEN} characters; got {}",
      device_id.len()
    );
  }
  Ok(())
}

/// Sign in interactively and build a fleet client.
async fn connect(api_base: Option<String>, tenant: String) -> Result<(FleetClient, String)> {
  let auth = AuthProvider::device_code().context("building token provider")?;
  if let Some(grant) = auth.begin_login().await? {
    eprintln!("{}", grant.instructions());
    auth.complete_login(grant).await.context("completing sign-in")?;
  }
  let token = auth.token().await.context("acquiring token")?;

  let mut config = FleetConfig::new(tenant);
  if let Some(base) = api_base {
    config.base_url = base;
  }
  let client = FleetClient::new(config).context("building fleet client")?;
  Ok((client, token))
}

// ─── find-tenant ──────────────────────────────────────────────────────────────

async fn find_tenant(client: &FleetClient, token: &str, device_id: &str) -> Result<()> {
  let tenants = client.tenants(token).await?;
  if tenants.is_empty() {
    bail!("no tenants visible to this identity");
  }
  println!("Found {} tenant(s)", tenants.len());

  for tenant in &tenants {
    let devices = client.tenant_devices(token, &tenant.id).await?;
    if let Some(device) = devices.iter().find(|d| d.device_id == device_id) {
      println!("Device found   : {device_id}");
      println!("Tenant id      : {}", tenant.id);
      println!("Tenant name    : {}", tenant.name);
      println!("Product id     : {}", device.product_id.as_deref().unwrap_or("None"));
      println!("Device group id: {}", device.device_group_id.as_deref().unwrap_or("None"));
      return Ok(());
    }
  }
  bail!("device id not found in any visible tenant")
}
