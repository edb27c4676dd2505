//! Host-OS glue: the Linux [`GuestOs`] implementation and PID-1 console
//! setup.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

use log::error;
use nix::sys::reboot::{RebootMode, reboot};

use crate::GuestOs;

/// Console device for diagnostics when running as the init process.
const CONSOLE_PATH: &str = "/dev/vtty";

/// [`GuestOs`] backed by the running Linux kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxGuestOs;

impl GuestOs for LinuxGuestOs {
    fn uptime(&self) -> i64 {
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        match unsafe { libc::sysinfo(&mut info) } {
            0 => info.uptime as i64,
            _ => 0,
        }
    }

    fn shutdown(&self) {
        unsafe { libc::sync() };
        if let Err(e) = reboot(RebootMode::RB_POWER_OFF) {
            error!("power off failed: {e}");
        }
    }

    fn reboot(&self) {
        unsafe { libc::sync() };
        if let Err(e) = reboot(RebootMode::RB_AUTOBOOT) {
            error!("reboot failed: {e}");
        }
    }
}

/// Redirect stdio to the console device so log output lands on the VM
/// console. Only useful when running as PID 1.
pub fn setup_console() {
    if let Ok(console) = OpenOptions::new().read(true).write(true).open(CONSOLE_PATH) {
        let fd = console.as_raw_fd();
        unsafe {
            libc::dup2(fd, 0); // stdin
            libc::dup2(fd, 1); // stdout
            libc::dup2(fd, 2); // stderr
        }
        // console handle dropped here, but fd 0/1/2 keep it open
    }
}
