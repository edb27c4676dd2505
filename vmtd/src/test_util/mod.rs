//! Test doubles for exercising the agent without a hypervisor.
//!
//! [`FakeHypervisor`] implements the backdoor register protocol in-process:
//! it enforces the magic/port/cookie discipline on every call, serves
//! queued host→guest messages on the TCLO channel and records everything
//! the agent pushes on either flavor. Handles are cheap clones sharing one
//! host state, so tests keep a handle for assertions while the dispatcher
//! owns another.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::GuestOs;
use crate::backdoor::{Backdoor, Frame, PORT_CMD, PORT_ENH, VM_MAGIC};
use crate::rpc::channel::{
    CMD_RPC, REPLY_DORECV, REPLY_SUCCESS, RPC_CLOSE, RPC_ENH_DATA, RPC_FLAG_COOKIE, RPC_GET_END,
    RPC_GET_LENGTH, RPC_OPEN, RPC_SET_LENGTH, TCLO_MAGIC,
};

#[derive(Debug, Default)]
struct FakeChannel {
    proto: u32,
    cookie_hi: u32,
    cookie_lo: u32,
    /// Length announced by SET_LENGTH, consumed by the data transfer.
    pending_send: Option<u32>,
    /// Replies waiting to be read back (RPCI flavor only).
    inbox: VecDeque<Vec<u8>>,
}

#[derive(Debug)]
struct HostState {
    channels: HashMap<u16, FakeChannel>,
    next_id: u16,
    next_cookie: u32,
    dataid_seq: u16,
    fail_opens: u32,
    /// Host→guest messages served on the TCLO channel.
    tclo_queue: VecDeque<Vec<u8>>,
    /// Everything the agent sent on the TCLO channel, keepalives included.
    tclo_sent: Vec<Vec<u8>>,
    /// Complete requests received on RPCI channels, in arrival order.
    rpci_requests: Vec<Vec<u8>>,
    /// Reply served for each RPCI request.
    rpci_reply: Vec<u8>,
    /// Echo each RPCI request back instead of `rpci_reply`.
    echo_rpci: bool,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            next_id: 7,
            next_cookie: 0xA,
            dataid_seq: 0,
            fail_opens: 0,
            tclo_queue: VecDeque::new(),
            tclo_sent: Vec::new(),
            rpci_requests: Vec::new(),
            rpci_reply: b"1 ".to_vec(),
            echo_rpci: false,
        }
    }
}

impl HostState {
    fn command(&mut self, frame: &mut Frame) {
        assert_eq!(frame.eax.word(), VM_MAGIC, "backdoor call without magic");
        assert_eq!(frame.edx.low(), PORT_CMD, "rpc command on wrong port");
        assert_eq!(frame.ecx.low(), CMD_RPC, "unexpected backdoor command");

        match frame.ecx.high() {
            RPC_OPEN => self.open(frame),
            RPC_SET_LENGTH => self.set_length(frame),
            RPC_GET_LENGTH => self.get_length(frame),
            RPC_GET_END => self.get_end(frame),
            RPC_CLOSE => self.close(frame),
            sub => panic!("unknown rpc subcommand {sub:#x}"),
        }
    }

    fn open(&mut self, frame: &mut Frame) {
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            frame.ecx.set_high(0);
            return;
        }

        assert_ne!(
            frame.ebx.word() & RPC_FLAG_COOKIE,
            0,
            "open without cookie flag"
        );
        let proto = frame.ebx.word() & !RPC_FLAG_COOKIE;

        let id = self.next_id;
        self.next_id += 1;
        let cookie_hi = self.next_cookie;
        let cookie_lo = self.next_cookie + 1;
        self.next_cookie += 0x10;

        self.channels.insert(
            id,
            FakeChannel {
                proto,
                cookie_hi,
                cookie_lo,
                ..FakeChannel::default()
            },
        );

        frame.ecx.set_high(1);
        frame.edx.set_low(0);
        frame.edx.set_high(id);
        frame.esi.set_word(cookie_hi);
        frame.edi.set_word(cookie_lo);
    }

    fn checked_channel(&mut self, frame: &Frame) -> u16 {
        let id = frame.edx.high();
        let ch = self
            .channels
            .get(&id)
            .unwrap_or_else(|| panic!("command on unknown channel {id}"));
        assert_eq!(frame.esi.word(), ch.cookie_hi, "cookie mismatch");
        assert_eq!(frame.edi.word(), ch.cookie_lo, "cookie mismatch");
        id
    }

    fn set_length(&mut self, frame: &mut Frame) {
        let id = self.checked_channel(frame);
        let len = frame.ebx.word();

        if len == 0 {
            self.deliver(id, Vec::new());
        } else {
            self.channels.get_mut(&id).unwrap().pending_send = Some(len);
        }

        frame.ecx.set_high(REPLY_SUCCESS);
    }

    fn get_length(&mut self, frame: &mut Frame) {
        let id = self.checked_channel(frame);
        let ch = &self.channels[&id];

        let pending = if ch.proto == TCLO_MAGIC {
            self.tclo_queue.front()
        } else {
            ch.inbox.front()
        };

        match pending {
            None => frame.ecx.set_high(REPLY_SUCCESS),
            Some(msg) => {
                self.dataid_seq = self.dataid_seq.wrapping_add(1);
                frame.ecx.set_high(REPLY_SUCCESS | REPLY_DORECV);
                frame.ebx.set_word(msg.len() as u32);
                frame.edx.set_high(self.dataid_seq);
            }
        }
    }

    fn get_end(&mut self, frame: &mut Frame) {
        let id = self.checked_channel(frame);
        assert_eq!(
            frame.ebx.word(),
            u32::from(self.dataid_seq),
            "acknowledged wrong data id"
        );

        let ch = self.channels.get_mut(&id).unwrap();
        let consumed = if ch.proto == TCLO_MAGIC {
            self.tclo_queue.pop_front()
        } else {
            ch.inbox.pop_front()
        };
        assert!(consumed.is_some(), "acknowledge with nothing pending");

        frame.ecx.set_high(1);
    }

    fn close(&mut self, frame: &mut Frame) {
        let id = self.checked_channel(frame);
        self.channels.remove(&id);
        frame.ecx.set_high(1);
        frame.ecx.set_low(0);
    }

    fn outs(&mut self, frame: &mut Frame, data: &[u8]) {
        assert_eq!(frame.eax.word(), VM_MAGIC, "enhanced send without magic");
        assert_eq!(
            frame.ebx.word(),
            RPC_ENH_DATA,
            "enhanced send without data marker"
        );
        assert_eq!(frame.edx.low(), PORT_ENH, "enhanced send on wrong port");

        let id = frame.edx.high();
        {
            let ch = self
                .channels
                .get_mut(&id)
                .unwrap_or_else(|| panic!("send on unknown channel {id}"));
            assert_eq!(frame.ebp.word(), ch.cookie_hi, "cookie mismatch on send");
            assert_eq!(frame.edi.word(), ch.cookie_lo, "cookie mismatch on send");

            let announced = ch
                .pending_send
                .take()
                .expect("enhanced send without length announcement");
            assert_eq!(announced as usize, data.len(), "send length mismatch");
            assert_eq!(frame.ecx.word() as usize, data.len());
        }

        self.deliver(id, data.to_vec());
    }

    fn ins(&mut self, frame: &mut Frame, into: &mut [u8]) {
        assert_eq!(frame.eax.word(), VM_MAGIC, "enhanced receive without magic");
        assert_eq!(
            frame.ebx.word(),
            RPC_ENH_DATA,
            "enhanced receive without data marker"
        );
        assert_eq!(frame.edx.low(), PORT_ENH, "enhanced receive on wrong port");

        let id = frame.edx.high();
        let ch = self
            .channels
            .get(&id)
            .unwrap_or_else(|| panic!("receive on unknown channel {id}"));
        assert_eq!(frame.esi.word(), ch.cookie_hi, "cookie mismatch on receive");
        assert_eq!(frame.ebp.word(), ch.cookie_lo, "cookie mismatch on receive");

        let msg = if ch.proto == TCLO_MAGIC {
            self.tclo_queue.front()
        } else {
            ch.inbox.front()
        };
        let msg = msg.expect("receive with nothing pending");

        let len = frame.ecx.word() as usize;
        into[..len].copy_from_slice(&msg[..len]);
    }

    /// A complete message arrived from the guest.
    fn deliver(&mut self, id: u16, msg: Vec<u8>) {
        let ch = self.channels.get_mut(&id).unwrap();
        if ch.proto == TCLO_MAGIC {
            self.tclo_sent.push(msg);
        } else {
            let reply = if self.echo_rpci {
                msg.clone()
            } else {
                self.rpci_reply.clone()
            };
            ch.inbox.push_back(reply);
            self.rpci_requests.push(msg);
        }
    }
}

/// Scripted in-process hypervisor.
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    state: Rc<RefCell<HostState>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a host→guest command on the TCLO channel.
    pub fn push_host_command(&self, msg: &[u8]) {
        self.state.borrow_mut().tclo_queue.push_back(msg.to_vec());
    }

    /// Everything the agent sent on the TCLO channel so far, keepalives
    /// included.
    pub fn tclo_sent(&self) -> Vec<Vec<u8>> {
        self.state.borrow().tclo_sent.clone()
    }

    /// Complete RPCI requests in arrival order.
    pub fn rpci_requests(&self) -> Vec<Vec<u8>> {
        self.state.borrow().rpci_requests.clone()
    }

    /// RPCI requests rendered as text, for readable assertions.
    pub fn rpci_request_texts(&self) -> Vec<String> {
        self.state
            .borrow()
            .rpci_requests
            .iter()
            .map(|req| String::from_utf8_lossy(req).into_owned())
            .collect()
    }

    /// Serve `reply` for subsequent RPCI requests (default `"1 "`).
    pub fn set_rpci_reply(&self, reply: &[u8]) {
        self.state.borrow_mut().rpci_reply = reply.to_vec();
    }

    /// Echo each RPCI request back as its own reply.
    pub fn set_echo_rpci(&self, on: bool) {
        self.state.borrow_mut().echo_rpci = on;
    }

    /// Refuse the next `n` channel opens.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.borrow_mut().fail_opens = n;
    }

    /// Channels currently open on the host side.
    pub fn open_channels(&self) -> usize {
        self.state.borrow().channels.len()
    }

    /// Host→guest commands not yet consumed.
    pub fn pending_host_commands(&self) -> usize {
        self.state.borrow().tclo_queue.len()
    }
}

impl Backdoor for FakeHypervisor {
    fn command(&mut self, frame: &mut Frame) {
        self.state.borrow_mut().command(frame);
    }

    fn outs(&mut self, frame: &mut Frame, data: &[u8]) {
        self.state.borrow_mut().outs(frame, data);
    }

    fn ins(&mut self, frame: &mut Frame, into: &mut [u8]) {
        self.state.borrow_mut().ins(frame, into);
    }
}

/// Recording [`GuestOs`] double.
#[derive(Clone, Default)]
pub struct FakeGuestOs {
    uptime_secs: Rc<Cell<i64>>,
    shutdowns: Rc<Cell<u32>>,
    reboots: Rc<Cell<u32>>,
}

impl FakeGuestOs {
    pub fn with_uptime(secs: i64) -> Self {
        let ops = Self::default();
        ops.uptime_secs.set(secs);
        ops
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.shutdowns.get()
    }

    pub fn reboot_calls(&self) -> u32 {
        self.reboots.get()
    }
}

impl GuestOs for FakeGuestOs {
    fn uptime(&self) -> i64 {
        self.uptime_secs.get()
    }

    fn shutdown(&self) {
        self.shutdowns.set(self.shutdowns.get() + 1);
    }

    fn reboot(&self) {
        self.reboots.set(self.reboots.get() + 1);
    }
}
