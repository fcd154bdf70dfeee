//! Stage-1 single-bit repair exercised against realistic wire-shaped packets rather than
//! uniform filler bytes, through the public `corrector`/`crc` API.

use groundstation_core::{corrector, crc};

#[test]
fn repairs_a_single_bit_flip_in_a_realistic_fc_fast_body() {
    // 16-byte FC_FAST body (id, status, alt, vel, quat, time, batt, seq) before its CRC trailer.
    let body: Vec<u8> = vec![0x01, 0x01, 0x10, 100, 0, 50, 0, 0x12, 0x34, 0x56, 0x78, 0x9A, 10, 0, 150, 7];
    let trailer = crc::compute(&body);

    for bit_pos in 0..(body.len() * 8) {
        let mut corrupted = body.clone();
        corrupted[bit_pos / 8] ^= 0x80 >> (bit_pos % 8);
        let (fixed, found) = corrector::correct(&corrupted, trailer)
            .unwrap_or_else(|| panic!("bit {bit_pos} should have been repairable"));
        assert_eq!(found, bit_pos);
        assert_eq!(fixed, body);
    }
}

#[test]
fn different_length_classes_get_independent_syndrome_tables() {
    let short_body = vec![0xAAu8; 7]; // FC_EVENT-shaped
    let long_body = vec![0xAAu8; 20]; // FC_FAST-shaped

    let short_trailer = crc::compute(&short_body);
    let long_trailer = crc::compute(&long_body);

    let mut short_corrupt = short_body.clone();
    short_corrupt[0] ^= 0x01;
    let mut long_corrupt = long_body.clone();
    long_corrupt[0] ^= 0x01;

    let (short_fixed, _) = corrector::correct(&short_corrupt, short_trailer).unwrap();
    let (long_fixed, _) = corrector::correct(&long_corrupt, long_trailer).unwrap();

    assert_eq!(short_fixed, short_body);
    assert_eq!(long_fixed, long_body);
}

#[test]
fn an_already_valid_packet_needs_no_repair() {
    let body = vec![0x02u8; 13]; // FC_GPS-shaped
    let trailer = crc::compute(&body);
    assert_eq!(corrector::correct(&body, trailer), None);
}
