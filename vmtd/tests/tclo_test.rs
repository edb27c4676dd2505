//! End-to-end dispatcher scenarios against the scripted hypervisor.
//!
//! Each test drives `poll_once` by hand and asserts on the exact messages
//! the host side observed: TCLO replies, RPCI requests, and guest OS
//! callback invocations.

mod common;

use common::scenario;

const RESET_REPLY: &[u8] = b"OK ATR toolbox";

#[test]
fn cold_start_opens_channel_and_announces_guest() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 0);

    dispatcher.poll_once();

    assert_eq!(dispatcher.channel().id(), 7);
    assert!(!dispatcher.channel().is_closed());
    assert_eq!(host.tclo_sent(), vec![RESET_REPLY.to_vec()]);
}

#[test]
fn unknown_command_gets_error_reply() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 0);
    host.push_host_command(b"hello");

    dispatcher.poll_once();

    assert_eq!(
        host.tclo_sent(),
        vec![RESET_REPLY.to_vec(), b"ERROR Unknown command".to_vec()]
    );
    assert_eq!(host.pending_host_commands(), 0);
}

#[test]
fn ping_reports_uptime_hostname_nics_and_os_identity() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 42);
    host.push_host_command(b"ping");

    dispatcher.poll_once();

    let requests = host.rpci_requests();
    assert_eq!(requests.len(), 5);

    let texts = host.rpci_request_texts();
    assert_eq!(texts[0], "SetGuestInfo  7 4200");
    assert_eq!(texts[1], "SetGuestInfo  1 vm1");
    assert_eq!(requests[2].len(), 120);
    assert!(requests[2].starts_with(b"SetGuestInfo  9 "));
    assert_eq!(texts[3], "SetGuestInfo  5 vorteil.io 1.0 amd64_x86");
    assert_eq!(texts[4], "SetGuestInfo  6 other-64");

    assert_eq!(host.tclo_sent().last().unwrap(), b"OK ");
}

#[test]
fn os_identity_goes_out_once_per_process() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 42);

    host.push_host_command(b"ping");
    dispatcher.poll_once();
    host.push_host_command(b"ping");
    dispatcher.poll_once();

    let texts = host.rpci_request_texts();
    // Second ping: uptime, hostname, NIC blob only
    assert_eq!(texts.len(), 8);
    assert_eq!(texts[5], "SetGuestInfo  7 4200");
    assert_eq!(texts[6], "SetGuestInfo  1 vm1");
    assert!(texts[7].starts_with("SetGuestInfo  9 "));

    let identity_sends = texts
        .iter()
        .filter(|t| t.starts_with("SetGuestInfo  5") || t.starts_with("SetGuestInfo  6"))
        .count();
    assert_eq!(identity_sends, 2);
}

#[test]
fn nic_payload_size_follows_interface_count() {
    for (cards, expected) in [(1, 120), (2, 192), (3, 264), (4, 336), (5, 120), (9, 120)] {
        let (mut dispatcher, host, _) = scenario(cards, "vm1", 0);
        host.push_host_command(b"ping");

        dispatcher.poll_once();

        let requests = host.rpci_requests();
        let blob = &requests[2];
        assert!(blob.starts_with(b"SetGuestInfo  9 "));
        assert_eq!(blob.len(), expected, "wrong blob size for {cards} cards");
    }
}

#[test]
fn capabilities_register_sends_three_rpcis_then_acknowledges() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 0);
    host.push_host_command(b"Capabilities_Register");

    dispatcher.poll_once();

    assert_eq!(
        host.rpci_request_texts(),
        vec![
            "vmx.capability.unified_loop toolbox".to_string(),
            "tools.capability.statechange ".to_string(),
            "tools.set.version 2147483647".to_string(),
        ]
    );
    assert_eq!(host.tclo_sent().last().unwrap(), b"OK ");
}

#[test]
fn capabilities_survive_host_rejection() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 0);
    host.set_rpci_reply(b"0 unknown capability");
    host.push_host_command(b"Capabilities_Register");

    dispatcher.poll_once();

    // Rejections are logged, not treated as transport errors
    assert_eq!(host.rpci_requests().len(), 3);
    assert_eq!(host.tclo_sent().last().unwrap(), b"OK ");
    assert!(!dispatcher.channel().is_closed());
}

#[test]
fn os_reboot_reports_state_change_then_invokes_callback() {
    let (mut dispatcher, host, ops) = scenario(1, "vm1", 0);
    host.push_host_command(b"OS_Reboot");

    dispatcher.poll_once();

    assert_eq!(
        host.rpci_request_texts(),
        vec!["tools.os.statechange.status 1 2".to_string()]
    );
    assert_eq!(host.tclo_sent().last().unwrap(), b"OK ");
    assert_eq!(ops.reboot_calls(), 1);
    assert_eq!(ops.shutdown_calls(), 0);
}

#[test]
fn os_halt_reports_state_change_then_invokes_callback() {
    let (mut dispatcher, host, ops) = scenario(1, "vm1", 0);
    host.push_host_command(b"OS_Halt");

    dispatcher.poll_once();

    assert_eq!(
        host.rpci_request_texts(),
        vec!["tools.os.statechange.status 1 1".to_string()]
    );
    assert_eq!(host.tclo_sent().last().unwrap(), b"OK ");
    assert_eq!(ops.shutdown_calls(), 1);
}

#[test]
fn os_suspend_and_resume_report_state_codes() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 7);

    host.push_host_command(b"OS_Suspend");
    dispatcher.poll_once();
    assert_eq!(
        host.rpci_request_texts().last().unwrap(),
        "tools.os.statechange.status 1 5"
    );

    host.push_host_command(b"OS_Resume");
    dispatcher.poll_once();
    // Resume refreshes guest info before acknowledging
    let texts = host.rpci_request_texts();
    assert!(texts.contains(&"tools.os.statechange.status 1 4".to_string()));
    assert_eq!(host.tclo_sent().last().unwrap(), b"OK ");
}

#[test]
fn os_poweron_relaxes_the_poll_cadence() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 0);
    host.push_host_command(b"OS_PowerOn");

    dispatcher.poll_once();

    assert_eq!(
        host.rpci_request_texts(),
        vec!["tools.os.statechange.status 1 3".to_string()]
    );
    assert_eq!(host.tclo_sent().last().unwrap(), b"OK ");
    assert_eq!(dispatcher.delay_ms(), 5000);
    assert_eq!(dispatcher.poll_once(), 5000);
}

#[test]
fn host_reset_gets_the_announce_reply() {
    let (mut dispatcher, host, _) = scenario(1, "vm1", 0);
    host.push_host_command(b"reset");

    dispatcher.poll_once();

    // Once for the reopen, once as the command reply
    assert_eq!(
        host.tclo_sent(),
        vec![RESET_REPLY.to_vec(), RESET_REPLY.to_vec()]
    );
}

#[test]
fn commands_are_served_strictly_in_order() {
    let (mut dispatcher, host, ops) = scenario(1, "vm1", 3);

    host.push_host_command(b"Capabilities_Register");
    host.push_host_command(b"ping");
    host.push_host_command(b"OS_Reboot");

    // One command per iteration
    dispatcher.poll_once();
    assert_eq!(host.pending_host_commands(), 2);
    dispatcher.poll_once();
    assert_eq!(host.pending_host_commands(), 1);
    assert_eq!(ops.reboot_calls(), 0);
    dispatcher.poll_once();
    assert_eq!(host.pending_host_commands(), 0);
    assert_eq!(ops.reboot_calls(), 1);

    let texts = host.rpci_request_texts();
    assert_eq!(texts[0], "vmx.capability.unified_loop toolbox");
    assert_eq!(texts[3], "SetGuestInfo  7 300");
    assert_eq!(texts.last().unwrap(), "tools.os.statechange.status 1 2");
}
