//! TCLO dispatcher - keeps the host channel open and routes commands.

use std::thread;
use std::time::Duration;

use log::{error, info};

use super::HostCommand;
use crate::GuestOs;
use crate::backdoor::Backdoor;
use crate::rpc::{Channel, ChannelKind};

/// Scratch buffer shared by outgoing command formatting, incoming payloads
/// and RPCI replies. Callers must consume a reply before formatting again.
pub(crate) const RPC_BUF_LEN: usize = 4096;

/// Ceiling for the adaptive poll delay.
pub(crate) const MAX_DELAY_MS: u64 = 5000;
/// Increment applied each iteration until the ceiling.
const DELAY_STEP_MS: u64 = 5;

/// Reply announcing the guest after (re)opening and for the host `reset`.
pub(crate) const RESET_REPLY: &[u8] = b"OK ATR toolbox";
/// Reply for a message matching no table entry.
const UNKNOWN_REPLY: &[u8] = b"ERROR Unknown command";
/// Plain acknowledgement.
pub(crate) const REPLY_OK: &[u8] = b"OK ";

/// TCLO dispatcher.
///
/// Owns the channel handle, the shared scratch buffer and the host-OS
/// callbacks. One instance runs per process, on its own thread; nothing
/// else touches the channel.
pub struct TcloDispatcher<B, O> {
    pub(crate) bd: B,
    pub(crate) ops: O,
    pub(crate) chan: Channel,
    pub(crate) buf: Box<[u8; RPC_BUF_LEN]>,
    pub(crate) rpc_error: bool,
    ping_pending: bool,
    pub(crate) os_info_sent: bool,
    pub(crate) delay_ms: u64,
    pub(crate) interface_count: u32,
    pub(crate) hostname: String,
}

impl<B: Backdoor, O: GuestOs> TcloDispatcher<B, O> {
    pub fn new(bd: B, ops: O, interface_count: u32, hostname: impl Into<String>) -> Self {
        Self {
            bd,
            ops,
            chan: Channel::default(),
            buf: Box::new([0u8; RPC_BUF_LEN]),
            rpc_error: false,
            ping_pending: false,
            os_info_sent: false,
            delay_ms: 0,
            interface_count,
            hostname: hostname.into(),
        }
    }

    /// Run the command loop until process exit.
    pub fn run(mut self) -> ! {
        info!("TcloDispatcher: entering host command loop");
        loop {
            let delay = self.poll_once();
            thread::sleep(Duration::from_millis(delay));
        }
    }

    /// Drive one iteration of the command loop and return the delay in
    /// milliseconds to sleep before the next one. Public so single-threaded
    /// embedders can pace the loop themselves.
    pub fn poll_once(&mut self) -> u64 {
        let mut delay = self.delay_ms;
        // Creeping delay keeps a quiet channel from spinning the CPU.
        if self.delay_ms < MAX_DELAY_MS {
            self.delay_ms += DELAY_STEP_MS;
        }

        if self.chan.is_closed() {
            self.delay_ms = 0;
            delay = 0;

            match Channel::open(&mut self.bd, ChannelKind::Tclo) {
                Ok(chan) => self.chan = chan,
                Err(e) => {
                    error!("unable to reopen TCLO channel: {e}");
                    self.delay_ms = 15;
                    return self.finish(delay);
                }
            }

            if let Err(e) = self.chan.send(&mut self.bd, RESET_REPLY) {
                error!("failed to send reset reply: {e}");
                self.rpc_error = true;
                return self.finish(delay);
            }
            self.rpc_error = false;
        }

        if self.ping_pending {
            if let Err(e) = self.chan.send(&mut self.bd, &[]) {
                error!("failed to send TCLO keepalive: {e}");
                self.rpc_error = true;
                return self.finish(delay);
            }
            self.ping_pending = false;
        }

        let (mut len, dataid) = match self.chan.incoming(&mut self.bd) {
            Ok(pending) => pending,
            Err(e) => {
                error!("failed to get length of incoming TCLO data: {e}");
                self.rpc_error = true;
                return self.finish(delay);
            }
        };

        if len == 0 {
            self.ping_pending = true;
            return self.finish(delay);
        }

        if len as usize >= RPC_BUF_LEN {
            len = (RPC_BUF_LEN - 1) as u32;
        }

        if let Err(e) = self.chan.receive(&mut self.bd, len, dataid, &mut self.buf[..]) {
            error!("failed to get incoming TCLO data: {e}");
            self.rpc_error = true;
            return self.finish(delay);
        }

        self.dispatch(len as usize);

        self.finish(delay)
    }

    fn dispatch(&mut self, len: usize) {
        match HostCommand::parse(&self.buf[..len]) {
            Some(cmd) => self.handle(cmd),
            None => {
                if let Err(e) = self.chan.send(&mut self.bd, UNKNOWN_REPLY) {
                    error!("error sending unknown command reply: {e}");
                    self.rpc_error = true;
                }
            }
        }
    }

    fn finish(&mut self, delay: u64) -> u64 {
        if self.rpc_error {
            self.recycle();
        }
        delay
    }

    /// Close the channel and clear the loop state; the next iteration
    /// reopens from scratch.
    pub(crate) fn recycle(&mut self) {
        self.chan.close(&mut self.bd);
        self.ping_pending = false;
        self.rpc_error = false;
    }

    /// Adaptive delay the next iteration will start from (test hook).
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Current channel handle.
    pub fn channel(&self) -> &Channel {
        &self.chan
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
    fn reopen_resets_backoff_and_announces_guest() {
        let (mut d, host) = dispatcher();
        assert!(d.channel().is_closed());

        let delay = d.poll_once();
        assert_eq!(delay, 0);
        assert!(!d.channel().is_closed());
        assert_eq!(host.tclo_sent(), vec![RESET_REPLY.to_vec()]);
    }

    #[test]
    fn backoff_creeps_to_ceiling_by_five() {
        let (mut d, _host) = dispatcher();

        let mut last = d.poll_once();
        for _ in 0..1200 {
            let delay = d.poll_once();
            assert!(delay >= last, "backoff went backwards");
            assert!(delay <= MAX_DELAY_MS);
            assert!(delay - last <= 5, "backoff stepped by more than 5");
            last = delay;
        }
        assert_eq!(last, MAX_DELAY_MS);
    }

    #[test]
    fn open_failure_retries_with_short_delay() {
        let (mut d, host) = dispatcher();
        host.fail_next_opens(1);

        let delay = d.poll_once();
        assert_eq!(delay, 0);
        assert!(d.channel().is_closed());
        assert_eq!(d.delay_ms(), 15);

        // Next iteration reopens
        d.poll_once();
        assert!(!d.channel().is_closed());
        assert_eq!(host.tclo_sent(), vec![RESET_REPLY.to_vec()]);
    }

    #[test]
    fn handle_invariant_holds_across_operations() {
        let (mut d, _host) = dispatcher();
        for _ in 0..4 {
            d.poll_once();
            let chan = d.channel();
            let zero_id = chan.id() == 0;
            assert_eq!(zero_id, chan.is_closed());
        }
    }

    #[test]
    fn recycle_zeroes_handle_and_flags() {
        let (mut d, _host) = dispatcher();
        d.poll_once();
        assert!(!d.channel().is_closed());

        d.rpc_error = true;
        d.recycle();
        assert!(d.channel().is_closed());
        assert!(!d.rpc_error);
    }

    #[test]
    fn quiet_host_gets_keepalives() {
        let (mut d, host) = dispatcher();
        d.poll_once(); // reopen; nothing pending arms the keepalive
        d.poll_once(); // keepalive goes out
        let sent = host.tclo_sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].is_empty());
    }
}
