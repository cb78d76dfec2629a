//! Multiplexed entry point: one binary, one subcommand per component.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use locsrv::config::Config;
use locsrv::{collector, ocid, rectifier, sendcmd, storage, termconfig, wsgateway, Result};

#[derive(Parser)]
#[command(
    name = "locsrv",
    version,
    about = "Server for zx303 and beesure GPS tracker terminals"
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", default_value = "/etc/locsrv.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// TCP collector owning the terminal connections
    Collector,
    /// Event and report persistence
    Storage,
    /// Cell/Wi-Fi hint to coordinate resolution
    Rectifier,
    /// Externally-computed terminal configuration replies
    Termconfig,
    /// Browser-facing websocket gateway
    Wsgateway,
    /// Download the OpenCellID cell database
    #[command(name = "ocid_download")]
    OcidDownload,
    /// Send a command to a terminal
    Send {
        imei: String,
        cmd: String,
        /// key=value command parameters
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let dflt_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(dflt_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let conf = match Config::from_file(&args.config) {
        Ok(conf) => conf,
        Err(e) => {
            error!("cannot load configuration from {}: {e}", args.config);
            return ExitCode::FAILURE;
        }
    };

    let served = match &args.command {
        Command::OcidDownload => return finish(ocid::run(&conf).await),
        Command::Send { imei, cmd, args } => {
            return finish(sendcmd::run(&conf, imei, cmd, args).await)
        }
        Command::Collector => serve(collector::run(&conf)).await,
        Command::Storage => serve(storage::run(&conf)).await,
        Command::Rectifier => serve(rectifier::run(&conf)).await,
        Command::Termconfig => serve(termconfig::run(&conf)).await,
        Command::Wsgateway => serve(wsgateway::run(&conf)).await,
    };
    finish(served)
}

/// Run a component until it fails or the process is interrupted.
async fn serve(component: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        result = component => result,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(locsrv::LocSrvError::Io)?;
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

fn finish(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
