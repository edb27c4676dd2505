//! vmtd - VMware guest tools daemon.
//!
//! Runs inside a VMware guest, typically as (or alongside) PID 1.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use vmtd::Config;
use vmtd::utils::{netinfo, system};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VMware guest tools daemon.
#[derive(Parser)]
#[command(name = "vmtd")]
#[command(version = VERSION)]
#[command(about = "VMware guest tools daemon for MicroVMs")]
struct Args {
    /// Number of eth* interfaces to report (default: probe eth0..)
    #[arg(long)]
    cards: Option<u32>,

    /// Hostname to report (default: kernel hostname)
    #[arg(long)]
    hostname: Option<String>,
}

fn main() -> Result<()> {
    let is_pid1 = std::process::id() == 1;

    // Land log output on the VM console when running as init
    if is_pid1 {
        system::setup_console();
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    info!("vmtd v{} starting", VERSION);

    // Parse CLI args (only in non-PID1 mode)
    let args = if is_pid1 {
        Args {
            cards: None,
            hostname: None,
        }
    } else {
        Args::parse()
    };

    if !nix::unistd::Uid::effective().is_root() {
        warn!("not running as root; backdoor port access will likely be refused");
    }

    let interface_count = args.cards.unwrap_or_else(netinfo::interface_count);
    let hostname = match args.hostname {
        Some(name) => name,
        None => hostname::get()?.to_string_lossy().into_owned(),
    };

    vmtd::start(
        Config {
            interface_count,
            hostname,
        },
        system::LinuxGuestOs,
    )?;

    // The worker owns all tools state; this thread only keeps the process
    // alive when running standalone.
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
