// src/main.rs

mod cli;

use anyhow::{Context, Result};
use armnas::backup::BackupManager;
use armnas::config::ArmnasConfig;
use armnas::installer::Installer;
use armnas::system::{ServiceController, SystemExecutor};
use armnas::version::{compare_versions, read_version_file};
use clap::Parser;
use cli::{BackupCommands, Cli, Commands, VersionCommands};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::info;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn backup_manager(config: &ArmnasConfig) -> Result<BackupManager> {
    let executor = Arc::new(SystemExecutor::new(config.command_timeout()?));
    Ok(BackupManager::new(&config.paths.backup_dir, &config.paths.install_dir)
        .with_excludes(&config.backup.exclude)?
        .with_paused_services(ServiceController::new(executor), config.backup.pause_services.clone()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Version comparison needs no configuration
    if let Commands::Version(VersionCommands::Compare { ref a, ref b }) = cli.command {
        let symbol = match compare_versions(a, b) {
            Ordering::Less => "<",
            Ordering::Equal => "=",
            Ordering::Greater => ">",
        };
        println!("{} {} {}", a, symbol, b);
        return Ok(());
    }

    let config = ArmnasConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve => runtime()?.block_on(armnas::api::run_server(config)),
        Commands::Updater => runtime()?.block_on(armnas::updater::run_updater(config)),
        Commands::Apply {
            payload,
            auto,
            package,
        } => {
            let payload = payload
                .canonicalize()
                .with_context(|| format!("Payload directory {}", payload.display()))?;
            let mut installer = Installer::from_config(&config, &payload, auto)?;
            if let Some(package) = package {
                installer = installer.with_package_name(package);
            }

            let report = installer.run();
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            if let Some(ref error) = report.error {
                eprintln!("Update failed: {}", error);
            }
            std::process::exit(report.exit_code);
        }
        Commands::Backup(command) => {
            let backups = backup_manager(&config)?;
            match command {
                BackupCommands::List => {
                    let records = backups.list()?;
                    if records.is_empty() {
                        println!("No backups in {}", backups.backup_dir().display());
                    }
                    for record in records {
                        println!(
                            "{}  {:>9.2} MB  {}",
                            record.created.format("%Y-%m-%d %H:%M:%S"),
                            record.size_mb,
                            record.filename
                        );
                    }
                }
                BackupCommands::Create { reason } => {
                    let version = read_version_file(&config.paths.version_file());
                    let record = backups.create_backup(reason.as_deref(), Some(&version))?;
                    println!("Created {} ({:.2} MB)", record.filename, record.size_mb);
                }
                BackupCommands::Rotate { keep } => {
                    let keep = keep.unwrap_or(config.backup.max_backups);
                    let removed = backups.rotate(keep)?;
                    info!("Kept the newest {} backup(s)", keep);
                    for name in &removed {
                        println!("Removed {}", name);
                    }
                }
                BackupCommands::Delete { filename } => {
                    backups.delete(&filename)?;
                    println!("Deleted {}", filename);
                }
            }
            Ok(())
        }
        Commands::Version(VersionCommands::Current) => {
            println!("{}", read_version_file(&config.paths.version_file()));
            Ok(())
        }
        Commands::Version(VersionCommands::Compare { .. }) => Ok(()),
    }
}
