//! `rokudebug`: remote debugger for Roku devices.
//!
//! Two front-ends over the same protocol engine: an interactive CLI
//! (default) and a Debug Adapter Protocol bridge on stdio (`--dap`).

mod installer;
mod launch_support;
mod repl;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use installer::AppInstallerClient;
use launch_support::PrebuiltChannelSupport;
use repl::{Repl, ResponseQueue};
use roku_client::{ClientConfig, DebuggerClient};
use roku_dap::DapBridge;

/// Remote debugger for Roku devices
#[derive(Parser, Debug)]
#[command(name = "rokudebug", version, about, long_about = None)]
struct Args {
    /// IP address of the Roku device (developer mode enabled)
    #[arg(long = "targetip", value_name = "ADDR")]
    target_ip: Option<String>,

    /// Developer-mode password of the device
    #[arg(long, default_value = "aaaa")]
    password: String,

    /// Channel archive (.zip) to sideload and debug
    #[arg(value_name = "CHANNEL_ZIP")]
    channel: Option<PathBuf>,

    /// Serve the Debug Adapter Protocol on stdio instead of the
    /// interactive CLI
    #[arg(long)]
    dap: bool,

    /// Logging level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout belongs to the DAP transport and the REPL; log to stderr.
    fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.dap {
        return run_dap(args);
    }
    run_cli(args)
}

fn run_dap(args: Args) -> anyhow::Result<()> {
    tracing::info!("serving Debug Adapter Protocol on stdio");
    let support = PrebuiltChannelSupport::new(args.channel);
    let bridge = DapBridge::new(io::stdout(), Box::new(support));
    bridge.run(io::stdin())?;
    Ok(())
}

fn run_cli(args: Args) -> anyhow::Result<()> {
    let target_ip = args.target_ip.context("--targetip is required (or use --dap)")?;
    let channel = args.channel.context("a channel archive is required (or use --dap)")?;
    anyhow::ensure!(channel.is_file(), "channel archive not found: {}", channel.display());

    // Sideload with remote debug enabled, then attach to the control
    // port the device opens.
    let installer = AppInstallerClient::new(target_ip.clone(), args.password);
    installer.remove()?;
    installer.install(&channel, true)?;

    let queue = Arc::new(ResponseQueue::default());
    let handler = repl::update_handler(Arc::clone(&queue));
    let client =
        DebuggerClient::connect(ClientConfig::new(target_ip), handler, Box::new(io::stdout()))?;

    Repl::new(client, queue).run()
}
