//! Host command handlers and the RPCI push helpers they share.

use std::net::Ipv4Addr;

use log::{error, warn};

use super::HostCommand;
use super::dispatcher::{MAX_DELAY_MS, REPLY_OK, RESET_REPLY, RPC_BUF_LEN, TcloDispatcher};
use crate::GuestOs;
use crate::backdoor::Backdoor;
use crate::error::{Error, Result};
use crate::rpc::{Channel, ChannelKind};
use crate::services::guestinfo;
use crate::utils::netinfo;

// Guest info keys.
const INFO_DNS_NAME: u32 = 1;
const INFO_OS_NAME_FULL: u32 = 5;
const INFO_OS_NAME: u32 = 6;
const INFO_UPTIME: u32 = 7;

// State codes for tools.os.statechange.status.
const STATE_HALT: u32 = 1;
const STATE_REBOOT: u32 = 2;
const STATE_POWERON: u32 = 3;
const STATE_RESUME: u32 = 4;
const STATE_SUSPEND: u32 = 5;

/// Version reported to the host; unmanaged tools never trigger an upgrade
/// prompt.
const VERSION_UNMANAGED: u32 = 0x7fff_ffff;

impl<B: Backdoor, O: GuestOs> TcloDispatcher<B, O> {
    pub(crate) fn handle(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::CapabilitiesRegister => self.capabilities_register(),
            HostCommand::Halt => self.halt(),
            HostCommand::PowerOn => self.power_on(),
            HostCommand::Reboot => self.reboot(),
            HostCommand::BroadcastIp => self.broadcast_ip(),
            HostCommand::Ping => self.ping(),
            HostCommand::Reset => self.reset(),
            HostCommand::Resume => self.resume(),
            HostCommand::Suspend => self.suspend(),
        }
    }

    fn reply_ok(&mut self, what: &str) {
        if let Err(e) = self.chan.send(&mut self.bd, REPLY_OK) {
            error!("error sending {what} response: {e}");
            self.rpc_error = true;
        }
    }

    /// Push one formatted RPCI command; the host reply replaces it in the
    /// scratch buffer for [`Self::rpci_ok`].
    pub(crate) fn send_rpci(&mut self, cmd: &str) -> Result<()> {
        self.send_rpci_raw(cmd.as_bytes())
    }

    /// Push an already-assembled RPCI payload.
    pub(crate) fn send_rpci_raw(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() >= RPC_BUF_LEN {
            warn!("rpci command does not fit the channel buffer");
            return Err(Error::CommandTooLong(payload.len(), RPC_BUF_LEN));
        }
        self.buf[..payload.len()].copy_from_slice(payload);
        self.rpci_exchange(payload.len())
    }

    /// One-shot exchange over a fresh RPCI channel: send the buffered
    /// command, read the reply (truncated to the buffer) back over the same
    /// scratch buffer, close.
    fn rpci_exchange(&mut self, len: usize) -> Result<()> {
        let mut rpci = match Channel::open(&mut self.bd, ChannelKind::Rpci) {
            Ok(chan) => chan,
            Err(e) => {
                error!("rpci channel open failed: {e}");
                return Err(e);
            }
        };

        let result = self.rpci_transfer(&rpci, len);

        rpci.close(&mut self.bd);
        result
    }

    fn rpci_transfer(&mut self, rpci: &Channel, len: usize) -> Result<()> {
        rpci.send(&mut self.bd, &self.buf[..len])?;

        let (mut rlen, dataid) = rpci.incoming(&mut self.bd)?;
        if rlen > 0 {
            if rlen as usize >= RPC_BUF_LEN {
                rlen = (RPC_BUF_LEN - 1) as u32;
            }
            rpci.receive(&mut self.bd, rlen, dataid, &mut self.buf[..])?;
        }

        Ok(())
    }

    /// Host convention: a reply starting `"1 "` is an acknowledgement.
    pub(crate) fn rpci_ok(&self) -> bool {
        self.buf[0] == b'1' && self.buf[1] == b' '
    }

    fn capabilities_register(&mut self) {
        if let Err(e) = self.send_rpci("vmx.capability.unified_loop toolbox") {
            error!("unable to set unified loop: {e}");
            self.rpc_error = true;
        }
        if !self.rpci_ok() {
            warn!("host rejected unified loop setting");
        }

        // The trailing space is part of the capability name.
        if let Err(e) = self.send_rpci("tools.capability.statechange ") {
            error!("unable to send statechange capability: {e}");
            self.rpc_error = true;
        }
        if !self.rpci_ok() {
            warn!("host rejected statechange capability");
        }

        if let Err(e) = self.send_rpci(&format!("tools.set.version {VERSION_UNMANAGED}")) {
            error!("unable to set tools version: {e}");
            self.rpc_error = true;
        }

        self.reply_ok("capabilities_register");
    }

    fn state_change(&mut self, state: u32) {
        if let Err(e) = self.send_rpci(&format!("tools.os.statechange.status 1 {state}")) {
            error!("unable to send state change result: {e}");
            self.rpc_error = true;
        }
    }

    fn halt(&mut self) {
        self.state_change(STATE_HALT);
        self.reply_ok("halt");
        self.ops.shutdown();
    }

    fn power_on(&mut self) {
        self.state_change(STATE_POWERON);

        // The host is up; the loop can relax immediately.
        self.delay_ms = MAX_DELAY_MS;

        self.reply_ok("poweron");
    }

    fn reboot(&mut self) {
        self.state_change(STATE_REBOOT);
        self.reply_ok("reboot");
        self.ops.reboot();
    }

    fn resume(&mut self) {
        self.update_guest_info();
        self.state_change(STATE_RESUME);
        self.reply_ok("resume");
    }

    fn suspend(&mut self) {
        self.state_change(STATE_SUSPEND);
        self.reply_ok("suspend");
    }

    fn ping(&mut self) {
        self.update_guest_uptime();
        self.update_guest_info();
        self.reply_ok("ping");
    }

    fn reset(&mut self) {
        if self.rpc_error {
            warn!("resetting rpc");
            // Reopen and announce on the next iteration.
            self.recycle();
            return;
        }

        if let Err(e) = self.chan.send(&mut self.bd, RESET_REPLY) {
            error!("failed to send reset reply: {e}");
            self.rpc_error = true;
        }
    }

    /// `Set_Option broadcastIP 1`: report eth0's address. No reply when the
    /// address is unavailable; the host asks again later.
    fn broadcast_ip(&mut self) {
        let Ok(addr) = netinfo::address("eth0") else {
            return;
        };
        let ip = Ipv4Addr::from(addr);

        if let Err(e) = self.send_rpci(&format!("info-set guestinfo.ip {ip}")) {
            error!("unable to send guest IP address: {e}");
            self.rpc_error = true;
        }

        self.reply_ok("broadcastIP");
    }

    /// Report hostname and per-NIC addressing; the OS identification
    /// strings go out once per process lifetime.
    fn update_guest_info(&mut self) {
        if let Err(e) = self.send_rpci(&format!("SetGuestInfo  {INFO_DNS_NAME} {}", self.hostname))
        {
            error!("unable to set hostname: {e}");
            self.rpc_error = true;
        }

        let blob = guestinfo::build(self.interface_count);
        if let Err(e) = self.send_rpci_raw(&blob) {
            warn!("unable to push interface info: {e}");
        }

        if !self.os_info_sent {
            if let Err(e) = self.send_rpci(&format!(
                "SetGuestInfo  {INFO_OS_NAME_FULL} vorteil.io 1.0 amd64_x86"
            )) {
                error!("unable to set full guest OS name: {e}");
                self.rpc_error = true;
            }

            if let Err(e) = self.send_rpci(&format!("SetGuestInfo  {INFO_OS_NAME} other-64")) {
                error!("unable to set guest OS name: {e}");
                self.rpc_error = true;
            }

            self.os_info_sent = true;
        }
    }

    /// The host wants centiseconds; the embedder reports whole seconds.
    fn update_guest_uptime(&mut self) {
        let uptime = self.ops.uptime();
        if let Err(e) = self.send_rpci(&format!("SetGuestInfo  {INFO_UPTIME} {uptime}00")) {
            error!("unable to set guest uptime: {e}");
            self.rpc_error = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeGuestOs, FakeHypervisor};

    fn dispatcher() -> (TcloDispatcher<FakeHypervisor, FakeGuestOs>, FakeHypervisor) {
        let host = FakeHypervisor::new();
        let d = TcloDispatcher::new(host.clone(), FakeGuestOs::default(), 1, "vm");
        (d, host)
    }

    #[test]
    fn rpci_reply_lands_in_shared_buffer() {
        let (mut d, host) = dispatcher();
        host.set_echo_rpci(true);

        d.send_rpci("1 hello there").unwrap();
        assert!(d.rpci_ok());
        assert_eq!(&d.buf[..13], b"1 hello there");
        assert_eq!(host.rpci_requests(), vec![b"1 hello there".to_vec()]);
    }

    #[test]
    fn rpci_rejection_is_visible_but_not_an_error() {
        let (mut d, host) = dispatcher();
        host.set_rpci_reply(b"0 no");

        d.send_rpci("tools.capability.statechange ").unwrap();
        assert!(!d.rpci_ok());
        assert!(!d.rpc_error);
    }

    #[test]
    fn oversized_rpci_command_is_refused() {
        let (mut d, host) = dispatcher();
        let cmd = "x".repeat(RPC_BUF_LEN);
        assert!(matches!(
            d.send_rpci(&cmd),
            Err(Error::CommandTooLong(_, RPC_BUF_LEN))
        ));
        assert!(host.rpci_requests().is_empty());
    }

    #[test]
    fn oversized_rpci_reply_is_truncated() {
        let (mut d, host) = dispatcher();
        let mut reply = vec![b'1', b' '];
        reply.resize(RPC_BUF_LEN + 500, b'x');
        host.set_rpci_reply(&reply);

        d.send_rpci("query").unwrap();
        assert!(d.rpci_ok());
        // Last buffer byte is the terminator for the truncated payload
        assert_eq!(d.buf[RPC_BUF_LEN - 1], 0);
        assert_eq!(d.buf[RPC_BUF_LEN - 2], b'x');
    }

    #[test]
    fn rpci_channels_are_transient() {
        let (mut d, host) = dispatcher();
        d.send_rpci("a").unwrap();
        d.send_rpci("b").unwrap();
        assert_eq!(host.open_channels(), 0);
        assert_eq!(host.rpci_requests().len(), 2);
    }
}
