//! VMware backdoor port-I/O primitive.
//!
//! The hypervisor intercepts `in`/`out` instructions on ports 0x5658/0x5659
//! when EAX holds the magic value, turning them into guest→host calls. All
//! RPC traffic goes through the three operations defined here: a single
//! command trap, and the two string-I/O transfers used for bulk payloads.
//!
//! Higher layers never touch CPU registers directly; they fill a [`Frame`]
//! and hand it to a [`Backdoor`] implementation.

/// Magic value expected in EAX on every backdoor call.
pub const VM_MAGIC: u32 = 0x564D_5868;

/// Command port for single-register calls.
pub const PORT_CMD: u16 = 0x5658;

/// Enhanced-data port for `rep insb`/`rep outsb` bulk transfers.
pub const PORT_ENH: u16 = 0x5659;

/// Version handshake command used to detect the hypervisor.
#[cfg(target_arch = "x86_64")]
const CMD_GETVERSION: u32 = 10;

/// One general-purpose register slot of the backdoor frame.
///
/// The protocol addresses registers at different widths per command, so a
/// slot is viewable as the full 64-bit quad, the 32-bit word, or the two
/// 16-bit halves of the word. Partial writes leave the remaining bits
/// untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Reg(u64);

impl Reg {
    pub fn quad(self) -> u64 {
        self.0
    }

    pub fn set_quad(&mut self, v: u64) {
        self.0 = v;
    }

    pub fn word(self) -> u32 {
        self.0 as u32
    }

    pub fn set_word(&mut self, v: u32) {
        self.0 = (self.0 & 0xffff_ffff_0000_0000) | u64::from(v);
    }

    pub fn low(self) -> u16 {
        self.0 as u16
    }

    pub fn set_low(&mut self, v: u16) {
        self.0 = (self.0 & !0xffff) | u64::from(v);
    }

    pub fn high(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn set_high(&mut self, v: u16) {
        self.0 = (self.0 & !0xffff_0000) | (u64::from(v) << 16);
    }
}

/// Register frame passed to every backdoor call.
///
/// Field order matches the order the registers are loaded and stored; the
/// frame is value-semantic and mutated in place by each call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Frame {
    pub eax: Reg,
    pub ebx: Reg,
    pub ecx: Reg,
    pub edx: Reg,
    pub esi: Reg,
    pub edi: Reg,
    pub ebp: Reg,
}

/// The three backdoor operations.
///
/// Implemented by [`PortBackdoor`] with real port I/O and by the scripted
/// hypervisor in `test_util` for driving the dispatcher in tests.
pub trait Backdoor {
    /// Execute a single command trap (`in eax, dx` on the port in DX).
    fn command(&mut self, frame: &mut Frame);

    /// Stream `data` to the enhanced-data port (`rep outsb`). The
    /// implementation loads ESI with the buffer address; ECX must already
    /// hold the byte count.
    fn outs(&mut self, frame: &mut Frame, data: &[u8]);

    /// Fill `into` from the enhanced-data port (`rep insb`). The
    /// implementation loads EDI with the buffer address; ECX must already
    /// hold the byte count.
    fn ins(&mut self, frame: &mut Frame, into: &mut [u8]);
}

#[cfg(target_arch = "x86_64")]
pub use hw::PortBackdoor;

#[cfg(target_arch = "x86_64")]
mod hw {
    use std::io;

    use super::{Backdoor, CMD_GETVERSION, Frame, PORT_CMD, VM_MAGIC};
    use crate::error::{Error, Result};

    /// Moves a whole [`Frame`] through one backdoor instruction sequence.
    ///
    /// RBX and RBP are reserved by the compiler, so they are swapped in and
    /// out through scratch registers instead of being named as operands.
    macro_rules! backdoor_call {
        ($frame:expr $(, $op:literal)+) => {{
            let frame: &mut Frame = $frame;
            let mut rax = frame.eax.quad();
            let mut rbx = frame.ebx.quad();
            let mut rcx = frame.ecx.quad();
            let mut rdx = frame.edx.quad();
            let mut rsi = frame.esi.quad();
            let mut rdi = frame.edi.quad();
            let mut rbp = frame.ebp.quad();
            unsafe {
                core::arch::asm!(
                    "xchg rbx, {b}",
                    "xchg rbp, {p}",
                    $($op,)+
                    "xchg rbx, {b}",
                    "xchg rbp, {p}",
                    b = inout(reg) rbx,
                    p = inout(reg) rbp,
                    inout("rax") rax,
                    inout("rcx") rcx,
                    inout("rdx") rdx,
                    inout("rsi") rsi,
                    inout("rdi") rdi,
                );
            }
            frame.eax.set_quad(rax);
            frame.ebx.set_quad(rbx);
            frame.ecx.set_quad(rcx);
            frame.edx.set_quad(rdx);
            frame.esi.set_quad(rsi);
            frame.edi.set_quad(rdi);
            frame.ebp.set_quad(rbp);
        }};
    }

    /// Backdoor implementation issuing real port I/O.
    ///
    /// Only constructible through [`PortBackdoor::open`], which raises the
    /// I/O privilege level and verifies the hypervisor answers the version
    /// handshake.
    pub struct PortBackdoor(());

    impl PortBackdoor {
        pub fn open() -> Result<Self> {
            raise_io_privilege().map_err(Error::IoPrivilege)?;
            let mut bd = PortBackdoor(());
            if !bd.probe() {
                return Err(Error::BackdoorAbsent);
            }
            Ok(bd)
        }

        /// Issue the version handshake; the hypervisor echoes the magic
        /// into EBX when the backdoor is present.
        pub fn probe(&mut self) -> bool {
            let mut frame = Frame::default();
            frame.eax.set_word(VM_MAGIC);
            frame.ebx.set_word(!VM_MAGIC);
            frame.ecx.set_word(CMD_GETVERSION);
            frame.edx.set_low(PORT_CMD);
            self.command(&mut frame);
            frame.ebx.word() == VM_MAGIC
        }
    }

    impl Backdoor for PortBackdoor {
        fn command(&mut self, frame: &mut Frame) {
            backdoor_call!(frame, "in eax, dx");
        }

        fn outs(&mut self, frame: &mut Frame, data: &[u8]) {
            debug_assert!(data.len() >= frame.ecx.word() as usize);
            frame.esi.set_quad(data.as_ptr() as u64);
            backdoor_call!(frame, "cld", "rep outsb");
        }

        fn ins(&mut self, frame: &mut Frame, into: &mut [u8]) {
            debug_assert!(into.len() >= frame.ecx.word() as usize);
            frame.edi.set_quad(into.as_mut_ptr() as u64);
            backdoor_call!(frame, "cld", "rep insb");
        }
    }

    /// Ring-3 processes need IOPL 3 before touching the backdoor ports.
    #[cfg(target_os = "linux")]
    fn raise_io_privilege() -> io::Result<()> {
        if unsafe { libc::iopl(3) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn raise_io_privilege() -> io::Result<()> {
        Ok(())
    }
}
