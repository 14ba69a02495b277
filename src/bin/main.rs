//! HNS proxy CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use clap::{Parser, Subcommand};
use hns_proxy::hns::HnsClient;
use hns_proxy::reconciler::{DesiredState, ServiceState};
use hns_proxy::{ProxyConfig, Reconciler, Result};

#[derive(Parser)]
#[command(name = "hns-proxy")]
#[command(about = "Reconcile service load balancers into the Windows Host Networking Service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a desired-state snapshot
    Sync {
        /// Proxy configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Desired-state snapshot (JSON)
        #[arg(short, long)]
        snapshot: PathBuf,
        /// Re-read the snapshot every N seconds instead of exiting
        #[arg(short, long)]
        watch: Option<u64>,
    },
    /// Show an HNS network and its remote subnet routes
    Networks {
        /// Network name
        name: String,
    },
    /// List HNS load balancers
    LoadBalancers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hns_proxy=info")),
        )
        .init();

    let cli = Cli::parse();
    let client = control_plane();

    match cli.command {
        Commands::Sync { config, snapshot, watch } => {
            cmd_sync(client, &config, &snapshot, watch).await?;
        }
        Commands::Networks { name } => {
            cmd_network(client.as_ref(), &name).await?;
        }
        Commands::LoadBalancers => {
            cmd_load_balancers(client.as_ref()).await?;
        }
    }

    Ok(())
}

#[cfg(windows)]
fn control_plane() -> Arc<dyn HnsClient> {
    Arc::new(hns_proxy::hns::windows::HcnClient::new())
}

#[cfg(not(windows))]
fn control_plane() -> Arc<dyn HnsClient> {
    tracing::warn!("HCN is only available on Windows; using an in-memory control plane");
    let hns = hns_proxy::hns::MemoryHns::new();
    hns.add_network("vxlan0", "Overlay");
    hns.add_network("nat", "NAT");
    Arc::new(hns)
}

async fn cmd_sync(
    client: Arc<dyn HnsClient>,
    config: &Path,
    snapshot: &Path,
    watch: Option<u64>,
) -> Result<()> {
    let config = ProxyConfig::from_file(config)?;
    let settle = config.call_timeout;
    let reconciler = Reconciler::new(client, config)?;

    reconciler.apply_snapshot(DesiredState::from_file(snapshot)?);

    let Some(interval) = watch else {
        wait_settled(&reconciler, settle).await;
        print_statuses(&reconciler);
        reconciler.shutdown().await;
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        match DesiredState::from_file(snapshot) {
            Ok(state) => {
                reconciler.apply_snapshot(state);
                reconciler.resync();
            }
            Err(e) => tracing::error!(error = %e, "Failed to reload snapshot, keeping previous state"),
        }
        print_statuses(&reconciler);
    }

    reconciler.shutdown().await;
    Ok(())
}

/// Poll until no key is pending, bounded by `limit`
async fn wait_settled(reconciler: &Reconciler, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        let pending = reconciler
            .statuses()
            .iter()
            .any(|(_, status)| status.state == ServiceState::Pending);
        if !pending {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn print_statuses(reconciler: &Reconciler) {
    let statuses = reconciler.statuses();
    if statuses.is_empty() {
        println!("No services.");
        return;
    }

    println!("{:<40} {:<10} {:<38} {}", "SERVICE", "STATE", "LOAD BALANCER", "ERROR");
    println!("{}", "-".repeat(100));
    for (key, status) in statuses {
        println!(
            "{:<40} {:<10} {:<38} {}",
            key.to_string(),
            status.state.to_string(),
            status
                .load_balancer
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status.last_error.as_deref().unwrap_or("-")
        );
    }
}

async fn cmd_network(client: &dyn HnsClient, name: &str) -> Result<()> {
    let network = client.get_network_by_name(name).await?;
    println!("Network: {}", network.name);
    println!("  ID:   {}", network.id);
    println!("  Type: {}", network.network_type);

    if network.remote_subnets.is_empty() {
        println!("  No remote subnets.");
        return Ok(());
    }
    println!("\n{:<20} {:<16} {:<10} {}", "PREFIX", "PROVIDER", "VSID", "DR MAC");
    println!("{}", "-".repeat(70));
    for route in &network.remote_subnets {
        println!(
            "{:<20} {:<16} {:<10} {}",
            route.destination_prefix.to_string(),
            route.provider_address.to_string(),
            route.isolation_id,
            route.dr_mac_address
        );
    }
    Ok(())
}

async fn cmd_load_balancers(client: &dyn HnsClient) -> Result<()> {
    let lbs = client.list_load_balancers().await?;
    if lbs.is_empty() {
        println!("No load balancers found.");
        return Ok(());
    }

    println!("{:<38} {:<16} {:<8} {:<12} {}", "ID", "VIP", "PROTO", "PORTS", "ENDPOINTS");
    println!("{}", "-".repeat(90));
    for lb in lbs {
        let vip = lb
            .frontend_vips
            .first()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        let (proto, ports) = match lb.port_mappings.first() {
            Some(m) => (
                hns_proxy::hns::Protocol::from_number(m.protocol)
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| m.protocol.to_string()),
                format!("{}->{}", m.external_port, m.internal_port),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!("{:<38} {:<16} {:<8} {:<12} {}", lb.id.to_string(), vip, proto, ports, lb.endpoint_ids.len());
    }
    Ok(())
}
