//! Sentinel Certs - Main entry point
//!
//! Obtains, renews and distributes ACME certificates for the hostnames served
//! by the edge.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sentinel_certs::{secret, App};
use sentinel_certs_common::init_tracing;
use sentinel_certs_config::Config;

/// Default configuration file location
const DEFAULT_CONFIG_PATH: &str = "/etc/sentinel-certs/certs.kdl";

/// Exit code for runtime failures
const EXIT_FAILURE: u8 = 255;

/// Sentinel Certs - ACME certificate lifecycle for the edge
#[derive(Parser, Debug)]
#[command(name = "sentinel-certs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "SENTINEL_CERTS_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        global = true
    )]
    config: PathBuf,

    /// Base64 key used to seal the ACME account key
    #[arg(long = "seal-key", env = "SENTINEL_CERTS_SEAL_KEY", hide_env_values = true, global = true)]
    seal_key: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prove control of individual domains
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Manage certificates
    Certificates {
        #[command(subcommand)]
        command: CertificateCommands,
    },
    /// Serve HTTP-01 challenge responses
    Listen {
        /// Listen address (defaults to the configured one)
        addr: Option<SocketAddr>,
    },
    /// Print a freshly generated seal key
    Newkey,
    /// Validate configuration file and exit
    Test,
}

#[derive(Subcommand, Debug)]
enum AuthCommands {
    /// Request a challenge and complete it
    Authorize(DomainArg),
    /// Request a challenge and print it
    Begin(DomainArg),
    /// Complete a challenge started by `auth begin`
    Complete {
        /// Challenge URI printed by `auth begin`
        uri: String,
    },
}

#[derive(Args, Debug)]
struct DomainArg {
    /// Domain name
    domain: String,
}

#[derive(Subcommand, Debug)]
enum CertificateCommands {
    /// Issue certificates for domains and sync them
    Add {
        /// Domain names; names sharing a registrable domain share a certificate
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// Renew certificates close to expiry and sync them
    Renew {
        /// Renew certificates expiring within this many days
        #[arg(long = "renew-before-days")]
        renew_before_days: Option<u32>,
    },
    /// Push every stored certificate to the external system
    Sync,
    /// Run the renewal loop until interrupted
    Watch {
        /// Also serve challenge responses on this address
        #[arg(long = "listen")]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sentinel-certs: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Newkey = cli.command {
        println!("{}", secret::generate_key_string());
        return Ok(());
    }

    let config = Config::from_file(&cli.config).context("Failed to load configuration file")?;
    config.validate().context("Configuration validation failed")?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_tracing(level, config.logging.format).context("Failed to initialize logging")?;

    if let Commands::Test = cli.command {
        return test_config(&cli.config, &config);
    }

    let app = App::build(config, cli.seal_key.as_deref()).await?;

    match cli.command {
        Commands::Auth { command } => run_auth(&app, command).await,
        Commands::Certificates { command } => run_certificates(&app, command).await,
        Commands::Listen { addr } => {
            let addr = match addr {
                Some(addr) => addr,
                None => app.config().challenges.listen_addr()?,
            };
            app.listen(addr, shutdown_on_signal()).await
        }
        Commands::Newkey | Commands::Test => Ok(()),
    }
}

async fn run_auth(app: &App, command: AuthCommands) -> Result<()> {
    app.bootstrap().await.context("Failed to initialize ACME account")?;
    let authz = app.authorization();

    match command {
        AuthCommands::Authorize(DomainArg { domain }) => {
            authz
                .authorize(&domain)
                .await
                .with_context(|| format!("Failed to authorize {}", domain))?;
            println!("{}: {}", domain, authz.state(&domain));
        }
        AuthCommands::Begin(DomainArg { domain }) => {
            match authz
                .begin_authorize(&domain)
                .await
                .with_context(|| format!("Failed to begin authorization for {}", domain))?
            {
                Some(challenge) => {
                    println!("uri: {}", challenge.uri);
                    println!("path: {}", challenge.path);
                    println!("response: {}", challenge.response);
                }
                None => println!("{}: already authorized", domain),
            }
        }
        AuthCommands::Complete { uri } => {
            authz
                .complete_authorize_by_uri(&uri)
                .await
                .with_context(|| format!("Failed to complete challenge {}", uri))?;
            println!("{}: completed", uri);
        }
    }

    Ok(())
}

async fn run_certificates(app: &App, command: CertificateCommands) -> Result<()> {
    match command {
        CertificateCommands::Add { domains } => {
            app.bootstrap().await.context("Failed to initialize ACME account")?;
            let issued = app
                .add_certificates(&domains)
                .await
                .context("Failed to issue certificates")?;
            for cert in issued {
                println!("{}: expires {}", cert.all_domains().join(", "), cert.expires);
            }
        }
        CertificateCommands::Renew { renew_before_days } => {
            app.bootstrap().await.context("Failed to initialize ACME account")?;
            let days = renew_before_days.unwrap_or(app.config().renewal.renew_before_days);
            let outcome = app
                .renew(std::time::Duration::from_secs(u64::from(days) * 86_400))
                .await
                .context("Renewal check failed")?;

            for cert in &outcome.renewed {
                println!("renewed {}: expires {}", cert.domain, cert.expires);
            }
            for failure in &outcome.failed {
                println!("failed {}: {}", failure.domain, failure.error);
            }
            if !outcome.failed.is_empty() {
                anyhow::bail!("{} certificate(s) failed to renew", outcome.failed.len());
            }
        }
        CertificateCommands::Sync => match app.sync_all().await.context("Sync failed")? {
            Some(report) => println!("pushed {}, up to date {}", report.pushed, report.skipped),
            None => println!("no external system configured"),
        },
        CertificateCommands::Watch { listen } => {
            app.bootstrap().await.context("Failed to initialize ACME account")?;
            app.watch(listen, shutdown_on_signal()).await?;
        }
    }

    Ok(())
}

/// Test configuration file and exit
fn test_config(path: &std::path::Path, config: &Config) -> Result<()> {
    info!("Configuration test successful:");
    info!("  - account {}", config.account.email);
    info!("  - directory {}", config.account.directory);
    info!("  - store {}", config.store.path.display());
    info!("  - challenges on {}", config.challenges.listen);

    if !config.account.accept_tos {
        warn!("accept-tos is not set; registering a new account will fail");
    }
    if config.sync.vulcand.is_none() {
        warn!("No sync target configured; certificates will only be stored locally");
    }

    println!(
        "sentinel-certs: configuration file {} test is successful",
        path.display()
    );
    Ok(())
}

/// Token cancelled on Ctrl-C or SIGTERM
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        cancel.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
