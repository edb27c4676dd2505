//! vmtd - VMware guest tools daemon for MicroVMs.
//!
//! Speaks the VMware backdoor protocol from inside a guest: keeps a Tools
//! Command Loop (TCLO) channel open to the hypervisor, answers host
//! commands (power lifecycle, capability registration, pings), and pushes
//! guest metadata (hostname, OS label, uptime, per-NIC addressing) over
//! transient RPCI channels.
//!
//! ## Architecture
//!
//! - **Backdoor**: register-frame port-I/O primitive (x86-64 only)
//! - **RPC transport**: open/send/receive/close on logical channels
//! - **TCLO service**: dispatcher loop, command table, host command handlers
//! - **Guest info**: NIC payload built from kernel interface queries
//!
//! The embedding program supplies the host-OS actions through [`GuestOs`];
//! [`start`] spawns the detached worker thread that owns all channel state.

pub mod backdoor;
pub mod error;
pub mod rpc;
pub mod services;
pub mod test_util;
pub mod utils;

pub use crate::error::{Error, Result};
pub use crate::services::tclo::TcloDispatcher;

/// Guest identity reported to the host.
pub struct Config {
    /// Number of `eth*` interfaces reported to the host.
    pub interface_count: u32,
    /// DNS name reported to the host.
    pub hostname: String,
}

/// Host-OS actions the embedding program supplies.
pub trait GuestOs {
    /// Seconds since boot.
    fn uptime(&self) -> i64;

    /// Initiate a system halt; may not return.
    fn shutdown(&self);

    /// Initiate a reboot; may not return.
    fn reboot(&self);
}

/// Spawn the detached tools worker.
///
/// Raises I/O privilege, verifies the hypervisor answers the backdoor
/// handshake, then hands the channel state to a dedicated thread that runs
/// the TCLO loop until process exit.
#[cfg(target_arch = "x86_64")]
pub fn start<O>(config: Config, ops: O) -> Result<()>
where
    O: GuestOs + Send + 'static,
{
    use log::info;

    let bd = backdoor::PortBackdoor::open()?;

    info!(
        "starting tools worker: {} interface(s), hostname {:?}",
        config.interface_count, config.hostname
    );

    std::thread::Builder::new()
        .name("vmtd-tclo".into())
        .spawn(move || {
            TcloDispatcher::new(bd, ops, config.interface_count, config.hostname).run();
        })
        .map_err(Error::Spawn)?;

    Ok(())
}

/// Spawn the detached tools worker.
///
/// Stub for non-x86-64 targets: the backdoor is bound to x86 port I/O, so
/// the daemon cannot run here.
#[cfg(not(target_arch = "x86_64"))]
pub fn start<O>(_config: Config, _ops: O) -> Result<()>
where
    O: GuestOs + Send + 'static,
{
    Err(Error::UnsupportedPlatform)
}
