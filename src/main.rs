use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpsvc::db::LeaseFile;
use dhcpsvc::{Clock, LeaseDb, Result, ServerConfig, Service, SystemClock};

#[derive(Parser)]
#[command(name = "dhcpsvc")]
#[command(author, version, about = "DHCP service for home gateways", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "dhcpsvc.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for workers to stop on shutdown.
    #[arg(long, default_value_t = 5)]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListLeases,
    CleanupLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = ServerConfig::load_or_create(&cli.config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP service with config: {:?}", cli.config);
            let service = Service::new(config, clock).await?;
            serve(&service).await?;

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping service...");
            service
                .shutdown(Duration::from_secs(cli.shutdown_timeout))
                .await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let db = LeaseDb::open(&config, Arc::clone(&clock)).await?;
            let leases = db.leases().await;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<10} {:<18} {:<40} {:<20} {:<10}",
                    "Interface", "MAC Address", "IP Address", "Hostname", "Remaining"
                );
                println!("{}", "-".repeat(100));

                let now = clock.now();
                for lease in leases {
                    let remaining = match lease.remaining_seconds(now) {
                        None => "static".to_string(),
                        Some(0) => "expired".to_string(),
                        Some(seconds) => format!("{}s", seconds),
                    };

                    println!(
                        "{:<10} {:<18} {:<40} {:<20} {:<10}",
                        lease.interface,
                        lease.hw_addr.to_string(),
                        lease.ip_address.to_string(),
                        lease.hostname.as_deref().unwrap_or("-"),
                        remaining
                    );
                }
            }

            Ok(())
        }
        Commands::CleanupLeases => {
            let now = clock.now();
            let count = LeaseFile::read(&config.leases_file)
                .await?
                .iter()
                .filter(|lease| lease.is_expired(now))
                .count();

            // Expired records are dropped on open; saving rewrites the file without them.
            let db = LeaseDb::open(&config, clock).await?;
            db.sweep_expired().await;
            db.persist().await?;
            println!("Cleaned up {} expired lease(s).", count);
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
async fn serve(service: &Service) -> Result<()> {
    service.start(&dhcpsvc::RawSocketProvider).await
}

#[cfg(not(target_os = "linux"))]
async fn serve(_service: &Service) -> Result<()> {
    Err(dhcpsvc::Error::Socket(
        "raw frame transport is only available on Linux".to_string(),
    ))
}
