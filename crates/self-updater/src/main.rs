//! self-update CLI entry point

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use self_updater::{
    AppVersion, EventSink, FileVerifier, Server, UpdateConfig, UpdateEvent, UpdateManager,
    UpdateResolution,
};

#[derive(Parser, Debug)]
#[command(name = "self-update")]
#[command(version, about = "Check for, download and install application updates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "SELF_UPDATE_CONFIG")]
    config: Option<PathBuf>,

    /// Upgrade server base address; repeat for failover order
    #[arg(long = "server", global = true)]
    servers: Vec<String>,

    /// Full manifest URL, replacing the server list
    #[arg(long, global = true)]
    manifest_url: Option<String>,

    /// Application root to update
    #[arg(long, global = true)]
    app_dir: Option<PathBuf>,

    /// Version of the installed application
    #[arg(long, global = true)]
    current_version: Option<AppVersion>,

    /// Reuse this session directory, resuming an interrupted run
    #[arg(long, global = true)]
    session_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report whether an update is available
    Check,
    /// Check, download and install the latest version
    Update,
    /// Compare a local file against a declared hash and size
    Verify {
        file: PathBuf,
        #[arg(long)]
        hash: Option<String>,
        #[arg(long)]
        size: Option<u64>,
    },
    /// Write a default configuration file
    InitConfig { path: PathBuf },
}

impl Cli {
    fn load_config(&self) -> Result<UpdateConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
            }
            None => UpdateConfig::default(),
        };

        if !self.servers.is_empty() {
            config.servers = self
                .servers
                .iter()
                .map(|address| Server::new(address.as_str(), "update.json"))
                .collect();
        }
        if self.manifest_url.is_some() {
            config.manifest_url = self.manifest_url.clone();
        }
        if self.app_dir.is_some() {
            config.app_dir = self.app_dir.clone();
        }
        if self.current_version.is_some() {
            config.current_version = self.current_version;
        }
        if self.session_dir.is_some() {
            config.session_root = self.session_dir.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<std::process::ExitCode> {
    match &cli.command {
        Commands::InitConfig { path } => {
            UpdateConfig::default().save_to_file(path)?;
            println!("Wrote {}", path.display());
            Ok(std::process::ExitCode::SUCCESS)
        }
        Commands::Verify { file, hash, size } => {
            let verifier = FileVerifier::new();
            if hash.is_none() && size.is_none() {
                println!("{}", verifier.compute_hash(file)?);
                return Ok(std::process::ExitCode::SUCCESS);
            }
            if let Some(size) = size {
                verifier.verify_size(file, *size)?;
            }
            if let Some(hash) = hash {
                verifier.verify_hash(file, hash)?;
            }
            println!("OK");
            Ok(std::process::ExitCode::SUCCESS)
        }
        Commands::Check => {
            let manager = UpdateManager::from_config(cli.load_config()?)?;
            match manager.check_for_updates().await? {
                Some(candidate) => {
                    println!(
                        "Update available: {} -> {} ({} package(s))",
                        manager.session().current_version(),
                        candidate.manifest.app_version,
                        candidate.packages.len()
                    );
                    for package in &candidate.packages {
                        println!("  {}", package.name);
                    }
                }
                None => println!("Up to date"),
            }
            Ok(std::process::ExitCode::SUCCESS)
        }
        Commands::Update => {
            let config = cli.load_config()?;
            if config.servers.is_empty() && config.manifest_url.is_none() {
                bail!("no update server configured; pass --server or --manifest-url");
            }
            let (events, mut rx) = EventSink::channel();
            let manager = UpdateManager::builder(config.clone(), session_for(&config)?)
                .events(events)
                .build()?;

            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    print_event(&event);
                }
            });

            let result = manager.run_update().await;
            let session_root = manager.session().paths().root().to_path_buf();
            drop(manager);
            let _ = printer.await;

            if result.is_err() {
                eprintln!("Session files: {}", session_root.display());
            }

            match result? {
                UpdateResolution::Installed => println!("Update installed"),
                _ => println!("Up to date"),
            }
            Ok(std::process::ExitCode::SUCCESS)
        }
    }
}

fn session_for(config: &UpdateConfig) -> Result<self_updater::UpdateSession> {
    Ok(self_updater::UpdateSession::new(
        config.session_paths(),
        config.resolve_app_dir()?,
        config.resolve_current_version()?,
    ))
}

fn print_event(event: &UpdateEvent) {
    match event {
        UpdateEvent::ManifestFetching { server_index, url } => {
            println!("[{server_index}] fetching {url}")
        }
        UpdateEvent::ServerFailover { from_index, reason } => {
            println!("[{from_index}] {reason}; trying next server")
        }
        UpdateEvent::UpdateFound { version, packages } => {
            println!("Found version {version} ({packages} package(s))")
        }
        UpdateEvent::PackageRetried {
            name,
            retry_count,
            error,
        } => println!("{name}: retry {retry_count} after {error}"),
        UpdateEvent::PackageDownloaded { name } => println!("{name}: downloaded"),
        UpdateEvent::InstallProgress {
            phase,
            index,
            total,
            path,
        } => println!("{phase} {index}/{total} {path}"),
        UpdateEvent::Failed { message } => eprintln!("Failed: {message}"),
        _ => {}
    }
}
