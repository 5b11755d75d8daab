//! dutlab - Entry Point
//!
//! Reserves devices under test, switches their boot mode and flashes them,
//! either on the lab controller they are wired to or from a front end
//! driving a fleet of lab controllers.

use std::env;
use std::path::PathBuf;

use colored::Colorize;
use dutlab::app::fleet::{run_fleet, FleetContext};
use dutlab::app::options::{CliArgs, Command};
use dutlab::app::run::{run_cutter, run_flash, run_query, LabContext};
use dutlab::errors::LabError;
use dutlab::logs::{init_logging, LogLevel, LogOptions};
use dutlab::storage::layout::StorageLayout;
use dutlab::storage::settings::{FleetSettings, LabSettings};
use dutlab::utils::version_info;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli_args = CliArgs::parse(env::args());
    let command = match Command::from_args(&cli_args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            eprintln!("usage: dutlab [flash] <machine> [image] [--flash-retries=N] [--record] [--noflash] [--emulate-usb] [--boot=test_mode|service_mode] [--save-ip] [--timeout=S] [--catalog=PATH] [--testplan=PATH]");
            eprintln!("       dutlab fleet <device> [image] [--record] [--noflash] [--emulate-usb] [--boot] [--save-ip] [--no-blacklisting] [--timeout=S]");
            eprintln!("       dutlab query <device> <results.json> [--timeout=S]");
            eprintln!("       dutlab cutter <device> on|off");
            std::process::exit(e.exit_code());
        }
    };

    // Print version and exit
    let version = version_info();
    if let Command::Version = command {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let layout = StorageLayout::default();
    let debug = cli_args.flag(&["debug", "verbose"]);

    // Retrieve the settings file of the tier we run as
    let (log_level, log_file) = match &command {
        Command::Fleet(_) => match layout.fleet_settings_file().read_json_or_default::<FleetSettings>().await {
            Ok(settings) => (settings.log_level.clone(), settings.log_file.clone()),
            Err(e) => exit_early(e),
        },
        _ => match layout.settings_file().read_json_or_default::<LabSettings>().await {
            Ok(settings) => (settings.log_level.clone(), settings.log_file.clone()),
            Err(e) => exit_early(e),
        },
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: if debug { LogLevel::Debug } else { log_level },
        log_file: Some(PathBuf::from(log_file)),
        ..Default::default()
    };
    let log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        await_shutdown_signal().await;
        signal_token.cancel();
    });

    info!("dutlab {} ({})", version.version, version.git_hash);
    let result = run(&layout, command, &cancel).await;

    let code = match &result {
        Ok(()) => {
            println!("{}", "dutlab finished successfully".green());
            0
        }
        Err(e) => {
            error!("{}: {}", e.kind(), e);
            if let Some(output) = e.output() {
                error!("Command output:\n{}", output);
            }
            println!("{} {}", e.kind().red().bold(), e);
            e.exit_code()
        }
    };

    drop(log_guard);
    std::process::exit(code);
}

async fn run(layout: &StorageLayout, command: Command, cancel: &CancellationToken) -> Result<(), LabError> {
    match command {
        Command::Flash(options) => {
            let settings = layout.settings_file().read_json_or_default::<LabSettings>().await?;
            let ctx = LabContext::load(layout, settings, options.catalog.as_deref()).await?;
            run_flash(&ctx, options, cancel).await
        }
        Command::Query(options) => {
            let settings = layout.settings_file().read_json_or_default::<LabSettings>().await?;
            let ctx = LabContext::load(layout, settings, options.catalog.as_deref()).await?;
            run_query(&ctx, options, cancel).await.map(|_| ())
        }
        Command::Cutter(options) => {
            let settings = layout.settings_file().read_json_or_default::<LabSettings>().await?;
            let ctx = LabContext::load(layout, settings, options.catalog.as_deref()).await?;
            run_cutter(&ctx, options).await
        }
        Command::Fleet(options) => {
            let settings = layout
                .fleet_settings_file()
                .read_json_or_default::<FleetSettings>()
                .await?;
            let ctx = FleetContext::load(layout, settings).await?;
            run_fleet(&ctx, options, cancel).await
        }
        Command::Version => Ok(()),
    }
}

fn exit_early(e: LabError) -> ! {
    eprintln!("Unable to read settings file: {}", e);
    std::process::exit(e.exit_code());
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl+C received, interrupting...");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, interrupting...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, interrupting...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, interrupting...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, interrupting...");
    }
}
