//! CRC16/XMODEM key-to-slot mapping, bit-exact with Redis Cluster hashing.
//!
//! Grounded on `rustis::network::cluster::Cluster::hash_slot`, generalized to
//! operate on byte slices (rather than `&str`) since keys are arbitrary
//! binary data, not necessarily UTF-8.

pub const SLOT_COUNT: u16 = 16384;

/// `key -> slot in [0, 16383]` (spec.md §4.1).
pub fn slot_for(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// Extracts the hash-tag bytes from `key` if it contains a non-empty
/// `{tag}` substring; otherwise returns `key` unchanged.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close_rel != 0 {
                return &key[open + 1..open + 1 + close_rel];
            }
        }
    }
    key
}

fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}
