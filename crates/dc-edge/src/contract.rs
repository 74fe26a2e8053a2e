// SPDX-License-Identifier: AGPL-3.0-only

//! Storage-Schlüssel der On-Chain-Verträge. Ein Mapping-Eintrag liegt bei
//! keccak256(pad32(schlüssel) ‖ pad32(slot-index)).

use dc_crypto::Hash32;
use dc_types::Address;

/// BNS-Registry (DNS-Vertrag).
pub fn dns_contract() -> Address {
    Address([
        0xaf, 0x60, 0xfa, 0xa5, 0xcd, 0x84, 0x0b, 0x72, 0x47, 0x42, 0xf1, 0xaf, 0x11, 0x61,
        0x68, 0x27, 0x61, 0x12, 0xd6, 0xa6,
    ])
}

/// Fleet-Vertrag, wenn der Store keinen eigenen kennt.
pub fn default_fleet() -> Address {
    let mut raw = [0u8; 20];
    raw[0] = 0x60;
    Address(raw)
}

// Slot-Indizes der Vertrags-Layouts.
const BNS_ENTRY_INDEX: u64 = 1;
const DEVICE_ALLOWLIST_INDEX: u64 = 4;

fn pad32(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let offset = 32usize.saturating_sub(data.len());
    for (dst, src) in out.iter_mut().skip(offset).zip(data.iter()) {
        *dst = *src;
    }
    out
}

/// Schlüssel eines Mapping-Eintrags: keccak256(pad32(data) ‖ pad32(index)).
pub fn storage_key(index: u64, data: &[u8]) -> Hash32 {
    let mut buf = [0u8; 64];
    let padded = pad32(data);
    for (dst, src) in buf.iter_mut().take(32).zip(padded.iter()) {
        *dst = *src;
    }
    let idx = pad32(&index.to_be_bytes());
    for (dst, src) in buf.iter_mut().skip(32).zip(idx.iter()) {
        *dst = *src;
    }
    dc_crypto::keccak256(&buf)
}

/// Eintrag eines BNS-Namens im DNS-Vertrag.
pub fn bns_entry_key(name: &str) -> Hash32 {
    storage_key(BNS_ENTRY_INDEX, &dc_crypto::keccak256(name.as_bytes()))
}

/// Allowlist-Eintrag eines Geräts im Fleet-Vertrag.
pub fn allowlist_key(device: &Address) -> Hash32 {
    storage_key(DEVICE_ALLOWLIST_INDEX, device.as_bytes())
}

/// ABI-Calldata für `register(string,address)` auf dem DNS-Vertrag.
pub fn bns_register_calldata(name: &str, destination: &Address) -> Vec<u8> {
    let selector = dc_crypto::keccak256(b"register(string,address)");
    let mut out = Vec::with_capacity(4 + 32 * 4 + name.len());
    out.extend_from_slice(&selector[..4]);
    // Head: Offset des Strings, dann die Adresse
    out.extend_from_slice(&pad32(&[0x40]));
    out.extend_from_slice(&pad32(destination.as_bytes()));
    // Tail: Länge + Daten, rechts auf 32 Bytes aufgefüllt
    out.extend_from_slice(&pad32(&(name.len() as u64).to_be_bytes()));
    out.extend_from_slice(name.as_bytes());
    let slack = (32 - name.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(slack));
    out
}

/// Gültiger BNS-Name: 7–32 Zeichen aus [0-9A-Za-z-].
pub fn is_valid_bns(name: &str) -> bool {
    if name.len() < 7 || name.len() > 32 {
        return false;
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
