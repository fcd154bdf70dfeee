//! Stage-1 single-bit forward error correction over CRC-32 syndromes.
//!
//! For a fixed payload length `L`, a single-bit error pattern `E` (an all-zero L-byte buffer
//! with exactly one bit set) has a syndrome `compute_raw(E)` that is unique to its bit
//! position. Linearity of the CRC over GF(2) means `compute(payload) ^ trailer ==
//! compute_raw(E)` whenever `payload` differs from the original message by exactly that one
//! bit, so the received CRC trailer never needs to be recomputed from scratch to find it.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::crc;

fn bit_mask(bit_in_byte: usize) -> u8 {
    0x80 >> bit_in_byte
}

fn build_table(len: usize) -> HashMap<u32, usize> {
    let mut table = HashMap::with_capacity(len * 8);
    let mut buf = vec![0u8; len];
    for bit_pos in 0..(len * 8) {
        let byte_idx = bit_pos / 8;
        buf[byte_idx] = bit_mask(bit_pos % 8);
        let syndrome = crc::compute_raw(&buf);
        buf[byte_idx] = 0;
        table.insert(syndrome, bit_pos);
    }
    table
}

static TABLES: OnceLock<Mutex<HashMap<usize, HashMap<u32, usize>>>> = OnceLock::new();

fn with_table<R>(len: usize, f: impl FnOnce(&HashMap<u32, usize>) -> R) -> R {
    let tables = TABLES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = tables.lock().expect("syndrome table cache poisoned");
    let table = guard.entry(len).or_insert_with(|| build_table(len));
    f(table)
}

/// Attempt a single-bit repair of `payload` against the received CRC `trailer`.
/// Returns `Some((corrected_payload, bit_position))` on a recoverable single-bit error,
/// `None` if the CRC already matches or the corruption is not a single bit.
pub fn correct(payload: &[u8], trailer: u32) -> Option<(Vec<u8>, usize)> {
    let computed = crc::compute(payload);
    let syndrome = computed ^ trailer;
    if syndrome == 0 {
        return None;
    }

    with_table(payload.len(), |table| {
        table.get(&syndrome).map(|&bit_pos| {
            let mut corrected = payload.to_vec();
            corrected[bit_pos / 8] ^= bit_mask(bit_pos % 8);
            (corrected, bit_pos)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flip_bit(data: &[u8], bit_pos: usize) -> Vec<u8> {
        let mut out = data.to_vec();
        out[bit_pos / 8] ^= bit_mask(bit_pos % 8);
        out
    }

    #[test]
    fn recovers_every_single_bit_flip_for_each_declared_length() {
        for &len in &[15usize, 8, 5] {
            let original = vec![0x5A; len];
            let trailer = crc::compute(&original);
            for bit_pos in 0..(len * 8) {
                let corrupted = flip_bit(&original, bit_pos);
                let (corrected, found_pos) = correct(&corrupted, trailer)
                    .unwrap_or_else(|| panic!("len {len} bit {bit_pos}: repair failed"));
                assert_eq!(found_pos, bit_pos, "len {len}: wrong bit position reported");
                assert_eq!(corrected, original, "len {len} bit {bit_pos}: wrong repair");
            }
        }
    }

    #[test]
    fn two_bit_corruption_is_not_repaired() {
        let original = vec![0xAAu8; 15];
        let trailer = crc::compute(&original);
        let corrupted = flip_bit(&flip_bit(&original, 3), 100);
        assert_eq!(correct(&corrupted, trailer), None);
    }

    #[test]
    fn matching_crc_needs_no_correction() {
        let original = vec![0x11u8; 8];
        let trailer = crc::compute(&original);
        assert_eq!(correct(&original, trailer), None);
    }
}
