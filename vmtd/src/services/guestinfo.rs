//! `SetGuestInfo` NIC payload (info key 9, `IP_ADDRESS_V2`).
//!
//! The host consumes a fixed-layout record blob rather than real XDR. The
//! scaffold is generated here and the per-interface value slots are patched
//! in place from live interface queries; the bytes on the wire are the
//! contract.

use crate::utils::netinfo;

/// Payload header; the double space and the trailing space are part of the
/// wire format.
const HEADER: &[u8; 16] = b"SetGuestInfo  9 ";

/// Bytes per interface record.
const RECORD_LEN: usize = 72;
/// First record starts after the header and three framing words.
const RECORDS_START: usize = 28;
/// Zero tail after the last record.
const TRAILER_LEN: usize = 20;

/// MAC text slot of record `k` (17 ASCII bytes).
pub fn mac_offset(k: usize) -> usize {
    32 + RECORD_LEN * k
}

/// IPv4 address slot of record `k` (4 bytes, network order).
pub fn ip_offset(k: usize) -> usize {
    64 + RECORD_LEN * k
}

/// Prefix-length slot of record `k` (little-endian u32).
pub fn prefix_offset(k: usize) -> usize {
    71 + RECORD_LEN * k
}

/// Number of records reported for a configured interface count. Five or
/// more interfaces fall back to reporting the first one.
pub fn record_count(interface_count: u32) -> usize {
    match interface_count {
        2..=4 => interface_count as usize,
        _ => 1,
    }
}

/// Scaffold for `records` interfaces: header, three framing words, one
/// 72-byte record per interface with zeroed value slots, and the zero tail.
pub fn scaffold(records: usize) -> Vec<u8> {
    let mut blob = Vec::with_capacity(RECORDS_START + records * RECORD_LEN + TRAILER_LEN);
    blob.extend_from_slice(HEADER);
    blob.extend_from_slice(&3u32.to_be_bytes());
    blob.extend_from_slice(&1u32.to_be_bytes());
    blob.extend_from_slice(&(records as u32).to_be_bytes());
    for _ in 0..records {
        blob.extend_from_slice(&17u32.to_be_bytes()); // MAC text length
        blob.extend_from_slice(&[0u8; 20]); // MAC slot + 3 pad bytes
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(&4u32.to_be_bytes()); // address length
        blob.extend_from_slice(&[0u8; 12]); // address + prefix slots
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(&[0u8; 16]);
    }
    blob.extend_from_slice(&[0u8; TRAILER_LEN]);
    blob
}

/// Write one interface's values into record `k`.
fn patch_record(blob: &mut [u8], k: usize, mac: &[u8; 17], addr: [u8; 4], prefix: u32) {
    let m = mac_offset(k);
    blob[m..m + 17].copy_from_slice(mac);
    let a = ip_offset(k);
    blob[a..a + 4].copy_from_slice(&addr);
    let p = prefix_offset(k);
    blob[p..p + 4].copy_from_slice(&prefix.to_le_bytes());
}

/// Fill record `k` from `eth{k}`. The zeroed slots stay untouched when any
/// of the interface queries fails.
fn fill_record(blob: &mut [u8], k: usize) {
    let name = format!("eth{k}");
    let Ok(mac) = netinfo::hardware_address(&name) else {
        return;
    };
    let Ok(mask) = netinfo::netmask(&name) else {
        return;
    };
    let Ok(addr) = netinfo::address(&name) else {
        return;
    };
    patch_record(
        blob,
        k,
        &netinfo::format_mac(mac),
        addr,
        netinfo::prefix_len(mask),
    );
}

/// Build the complete payload for the configured interface count.
pub fn build(interface_count: u32) -> Vec<u8> {
    let records = record_count(interface_count);
    let mut blob = scaffold(records);
    for k in 0..records {
        fill_record(&mut blob, k);
    }
    blob
}
