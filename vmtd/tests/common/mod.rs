//! Shared helpers for dispatcher scenario tests.

use vmtd::TcloDispatcher;
use vmtd::test_util::{FakeGuestOs, FakeHypervisor};

pub type TestDispatcher = TcloDispatcher<FakeHypervisor, FakeGuestOs>;

/// Dispatcher wired to a scripted hypervisor and a recording guest OS.
/// Returned handles share state with the dispatcher for assertions.
pub fn scenario(
    cards: u32,
    hostname: &str,
    uptime: i64,
) -> (TestDispatcher, FakeHypervisor, FakeGuestOs) {
    let host = FakeHypervisor::new();
    let ops = FakeGuestOs::with_uptime(uptime);
    let dispatcher = TcloDispatcher::new(host.clone(), ops.clone(), cards, hostname);
    (dispatcher, host, ops)
}
