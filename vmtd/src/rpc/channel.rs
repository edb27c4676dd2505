//! RPC channel transport.
//!
//! Implements the open/send/receive/close command set shared by the two
//! channel flavors: TCLO (host pushes commands to the guest) and RPCI
//! (guest pushes requests to the host). The host assigns a channel id and a
//! cookie pair on open and expects both on every subsequent command.

use log::warn;

use crate::backdoor::{Backdoor, Frame, PORT_CMD, PORT_ENH, VM_MAGIC};
use crate::error::{Error, Result};

/// Backdoor command id for the RPC command set, carried in ECX.low.
pub(crate) const CMD_RPC: u16 = 0x1e;

// RPC subcommands, carried in ECX.high.
pub(crate) const RPC_OPEN: u16 = 0x00;
pub(crate) const RPC_SET_LENGTH: u16 = 0x01;
pub(crate) const RPC_GET_LENGTH: u16 = 0x03;
pub(crate) const RPC_GET_END: u16 = 0x05;
pub(crate) const RPC_CLOSE: u16 = 0x06;

/// Asks the host for a cookie pair on open.
pub(crate) const RPC_FLAG_COOKIE: u32 = 0x8000_0000;

/// EBX marker for enhanced data transfers, echoed back on success.
pub(crate) const RPC_ENH_DATA: u32 = 0x0001_0000;

// Reply bits in ECX.high.
pub(crate) const REPLY_SUCCESS: u16 = 0x0001;
pub(crate) const REPLY_DORECV: u16 = 0x0002;

/// Protocol magic ("TCLO") announcing the tools command loop flavor.
pub(crate) const TCLO_MAGIC: u32 = 0x4F4C_4354;
/// Protocol magic ("RPCI") announcing the guest-to-host request flavor.
pub(crate) const RPCI_MAGIC: u32 = 0x4943_5052;

/// Channel flavor requested on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Tools Command Loop: the host drives the guest.
    Tclo,
    /// Remote Procedure Call Interface: the guest pushes information.
    Rpci,
}

impl ChannelKind {
    fn magic(self) -> u32 {
        match self {
            ChannelKind::Tclo => TCLO_MAGIC,
            ChannelKind::Rpci => RPCI_MAGIC,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ChannelKind::Tclo => "TCLO",
            ChannelKind::Rpci => "RPCI",
        }
    }
}

/// Handle for one logical RPC channel.
///
/// A default handle (zero id, zero cookies) is closed; only a successful
/// [`Channel::open`] produces a live one, and [`Channel::close`] always
/// returns the handle to the closed state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Channel {
    id: u16,
    cookie_hi: u32,
    cookie_lo: u32,
}

impl Channel {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.id == 0 && self.cookie_hi == 0 && self.cookie_lo == 0
    }

    /// Command frame with this channel's id and cookies filled in.
    fn cmd_frame(&self, sub: u16) -> Frame {
        let mut frame = Frame::default();
        frame.eax.set_word(VM_MAGIC);
        frame.ecx.set_low(CMD_RPC);
        frame.ecx.set_high(sub);
        frame.edx.set_low(PORT_CMD);
        frame.edx.set_high(self.id);
        frame.esi.set_word(self.cookie_hi);
        frame.edi.set_word(self.cookie_lo);
        frame
    }

    /// Open a fresh channel of the given flavor.
    pub fn open<B: Backdoor>(bd: &mut B, kind: ChannelKind) -> Result<Channel> {
        let mut frame = Channel::default().cmd_frame(RPC_OPEN);
        frame.ebx.set_word(kind.magic() | RPC_FLAG_COOKIE);

        bd.command(&mut frame);

        if frame.ecx.high() != 1 || frame.edx.low() != 0 {
            return Err(Error::ChannelOpen(kind.name()));
        }

        Ok(Channel {
            id: frame.edx.high(),
            cookie_hi: frame.esi.word(),
            cookie_lo: frame.edi.word(),
        })
    }

    /// Announce and stream one outgoing message. A zero-length send is the
    /// TCLO keepalive and skips the data phase.
    pub fn send<B: Backdoor>(&self, bd: &mut B, data: &[u8]) -> Result<()> {
        let mut frame = self.cmd_frame(RPC_SET_LENGTH);
        frame.ebx.set_word(data.len() as u32);

        bd.command(&mut frame);

        if frame.ecx.high() & REPLY_SUCCESS == 0 {
            return Err(Error::SendLength);
        }

        if data.is_empty() {
            return Ok(());
        }

        let mut frame = Frame::default();
        frame.eax.set_word(VM_MAGIC);
        frame.ebx.set_word(RPC_ENH_DATA);
        frame.ecx.set_word(data.len() as u32);
        frame.edx.set_low(PORT_ENH);
        frame.edx.set_high(self.id);
        frame.ebp.set_word(self.cookie_hi);
        frame.edi.set_word(self.cookie_lo);

        bd.outs(&mut frame, data);

        if frame.ebx.word() != RPC_ENH_DATA {
            return Err(Error::SendData);
        }

        Ok(())
    }

    /// Ask the host whether a message is pending. Returns `(length, data
    /// id)`, both zero when there is nothing to read.
    pub fn incoming<B: Backdoor>(&self, bd: &mut B) -> Result<(u32, u16)> {
        let mut frame = self.cmd_frame(RPC_GET_LENGTH);

        bd.command(&mut frame);

        if frame.ecx.high() & REPLY_SUCCESS == 0 {
            return Err(Error::RecvLength);
        }
        if frame.ecx.high() & REPLY_DORECV == 0 {
            return Ok((0, 0));
        }

        Ok((frame.ebx.word(), frame.edx.high()))
    }

    /// Read `len` bytes into `into` and acknowledge them with the data id
    /// from [`Channel::incoming`]. `into` must have room for `len + 1`
    /// bytes; the payload is NUL-terminated in place.
    pub fn receive<B: Backdoor>(
        &self,
        bd: &mut B,
        len: u32,
        dataid: u16,
        into: &mut [u8],
    ) -> Result<()> {
        let mut frame = Frame::default();
        frame.eax.set_word(VM_MAGIC);
        frame.ebx.set_word(RPC_ENH_DATA);
        frame.ecx.set_word(len);
        frame.edx.set_low(PORT_ENH);
        frame.edx.set_high(self.id);
        frame.esi.set_word(self.cookie_hi);
        frame.ebp.set_word(self.cookie_lo);

        bd.ins(&mut frame, into);
        into[len as usize] = 0;

        if frame.ebx.word() != RPC_ENH_DATA {
            return Err(Error::RecvData);
        }

        let mut frame = self.cmd_frame(RPC_GET_END);
        frame.ebx.set_word(u32::from(dataid));

        bd.command(&mut frame);

        if frame.ecx.high() == 0 {
            return Err(Error::RecvAck);
        }

        Ok(())
    }

    /// Close the channel. The handle is zeroed regardless of what the host
    /// answers; a wire-level refusal is only logged.
    pub fn close<B: Backdoor>(&mut self, bd: &mut B) {
        let mut frame = self.cmd_frame(RPC_CLOSE);

        bd.command(&mut frame);

        if frame.ecx.high() == 0 || frame.ecx.low() != 0 {
            warn!("hypervisor refused channel close");
        }

        *self = Channel::default();
    }
}
