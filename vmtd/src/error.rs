//! Error types for vmtd.

use std::io;
use thiserror::Error;

/// Errors raised by the tools agent.
///
/// Transport variants are recoverable: the dispatcher reacts by closing and
/// reopening the channel on its next iteration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("the hypervisor backdoor requires an x86_64 guest")]
    UnsupportedPlatform,

    #[error("hypervisor did not answer the backdoor handshake")]
    BackdoorAbsent,

    #[error("failed to raise I/O privilege level: {0}")]
    IoPrivilege(io::Error),

    #[error("hypervisor refused to open {0} channel")]
    ChannelOpen(&'static str),

    #[error("hypervisor rejected outgoing message length")]
    SendLength,

    #[error("enhanced data send was not acknowledged")]
    SendData,

    #[error("failed to query length of incoming data")]
    RecvLength,

    #[error("enhanced data receive was not acknowledged")]
    RecvData,

    #[error("hypervisor rejected receive acknowledgement")]
    RecvAck,

    #[error("rpc command of {0} bytes does not fit the {1}-byte channel buffer")]
    CommandTooLong(usize, usize),

    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
