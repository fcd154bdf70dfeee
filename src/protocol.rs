//! The wire codec: a closed tagged-union parser for everything the ground station receives,
//! and builders for everything it sends (`CMD_ARM`, `CMD_FIRE`, `CONFIRM`, `ABORT`).

use rand::Rng;
use thiserror::Error;

use crate::crc;
use crate::derived;
use crate::quaternion::{self, StatusBitmap};

const STALE_THRESHOLD_MS: u16 = 500;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty input")]
    EmptyInput,
    #[error("packet for msg-id 0x{msg_id:02X} too short: need at least {expected} bytes, got {actual}")]
    TooShort {
        msg_id: u8,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FcFast {
    pub status: StatusBitmap,
    pub alt_m: f32,
    pub vel_mps: f32,
    pub quat: [f32; 4],
    pub time_s: f32,
    pub batt_v: f32,
    pub seq: u8,
    pub mach: f32,
    pub qbar_pa: f32,
    pub euler: derived::Euler,
    pub crc_ok: bool,
    pub corrected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FcGps {
    pub dlat_m: f32,
    pub dlon_m: f32,
    pub alt_msl_m: f32,
    pub fix: u8,
    pub sats: u8,
    pub range_saturated: bool,
    pub crc_ok: bool,
    pub corrected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FcEvent {
    pub event_type: u8,
    pub event_data: u16,
    pub time_s: f32,
    pub crc_ok: bool,
    pub corrected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GsTelem {
    pub status: StatusBitmap,
    pub alt_m: f32,
    pub vel_mps: f32,
    pub quat: [f32; 4],
    pub time_s: f32,
    pub batt_v: f32,
    pub seq: u8,
    pub rssi_dbm: f32,
    pub snr_db: f32,
    pub freq_err_hz: i16,
    pub data_age_ms: u16,
    pub recovered: bool,
    pub recovery_method: u8,
    pub recovery_confidence: u8,
    pub mach: f32,
    pub qbar_pa: f32,
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    pub stale: bool,
    pub crc_ok: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AckArm {
    pub nonce: u16,
    pub echo_channel: u8,
    pub echo_action: u8,
    pub arm_state: u8,
    pub cont_state: u8,
    pub crc_ok: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AckFire {
    pub nonce: u16,
    pub echo_channel: u8,
    pub echo_duration: u8,
    pub test_mode: bool,
    pub armed: bool,
    pub cont_state: u8,
    pub crc_ok: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Nack {
    pub nonce: u16,
    pub error_code: u8,
    pub crc_ok: bool,
}

/// A message class this core doesn't interpret: GS relay's `GS_GPS`/`GS_EVENT`/`GS_STATUS`/
/// `GS_CORRUPT`, the variable-length `HANDSHAKE`, and `ACK_CONFIG` (whose field layout is not
/// specified anywhere this crate could source it from). Carried verbatim for a caller that
/// understands the format, with no CRC verification performed here.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPassthrough {
    pub msg_id: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    FcFast(FcFast),
    FcGps(FcGps),
    FcEvent(FcEvent),
    GsTelem(GsTelem),
    GsGps(RawPassthrough),
    GsEvent(RawPassthrough),
    GsStatus(RawPassthrough),
    GsCorrupt(RawPassthrough),
    AckArm(AckArm),
    AckFire(AckFire),
    AckConfig(RawPassthrough),
    Nack(Nack),
    Handshake(RawPassthrough),
    Unknown { msg_id: u8, bytes: Vec<u8> },
}

fn require_len(msg_id: u8, bytes: &[u8], expected: usize) -> Result<(), ParseError> {
    if bytes.len() < expected {
        Err(ParseError::TooShort {
            msg_id,
            expected,
            actual: bytes.len(),
        })
    } else {
        Ok(())
    }
}

fn trailing_crc(bytes: &[u8]) -> u32 {
    let n = bytes.len();
    u32::from_le_bytes([bytes[n - 4], bytes[n - 3], bytes[n - 2], bytes[n - 1]])
}

fn crc_ok(bytes: &[u8]) -> bool {
    let n = bytes.len();
    crc::verify(&bytes[..n - 4], trailing_crc(bytes)).valid
}

fn parse_fc_fast(bytes: &[u8]) -> Result<Message, ParseError> {
    require_len(0x01, bytes, 20)?;
    let status = quaternion::decode_status(u16::from_le_bytes([bytes[1], bytes[2]]));
    let alt_raw = i16::from_le_bytes([bytes[3], bytes[4]]);
    let vel_raw = i16::from_le_bytes([bytes[5], bytes[6]]);
    let quat = quaternion::unpack(&bytes[7..12]);
    let time_raw = u16::from_le_bytes([bytes[12], bytes[13]]);
    let batt_raw = bytes[14];
    let seq = bytes[15];

    let alt_m = alt_raw as f32;
    let vel_mps = vel_raw as f32 * 0.1;
    let time_s = time_raw as f32 * 0.1;
    let batt_v = 6.0 + batt_raw as f32 * 0.012;
    let mach = derived::mach(vel_mps, alt_m);
    let qbar_pa = derived::dynamic_pressure(vel_mps, alt_m);
    let euler = derived::quaternion_to_euler(quat);

    Ok(Message::FcFast(FcFast {
        status,
        alt_m,
        vel_mps,
        quat,
        time_s,
        batt_v,
        seq,
        mach,
        qbar_pa,
        euler,
        crc_ok: crc_ok(bytes),
        corrected: false,
    }))
}

fn parse_fc_gps(bytes: &[u8]) -> Result<Message, ParseError> {
    require_len(0x02, bytes, 17)?;
    let dlat_raw = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let dlon_raw = i32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    let alt_raw = u16::from_le_bytes([bytes[9], bytes[10]]);
    let fix = bytes[11];
    let sats = bytes[12];

    Ok(Message::FcGps(FcGps {
        dlat_m: dlat_raw as f32 / 1000.0,
        dlon_m: dlon_raw as f32 / 1000.0,
        alt_msl_m: alt_raw as f32 * 10.0,
        fix,
        sats,
        range_saturated: dlat_raw == i32::MIN || dlat_raw == i32::MAX || dlon_raw == i32::MIN || dlon_raw == i32::MAX,
        crc_ok: crc_ok(bytes),
        corrected: false,
    }))
}

fn parse_fc_event(bytes: &[u8]) -> Result<Message, ParseError> {
    require_len(0x03, bytes, 11)?;
    let event_type = bytes[1];
    let event_data = u16::from_le_bytes([bytes[2], bytes[3]]);
    let time_raw = u16::from_le_bytes([bytes[4], bytes[5]]);

    Ok(Message::FcEvent(FcEvent {
        event_type,
        event_data,
        time_s: time_raw as f32 * 0.1,
        crc_ok: crc_ok(bytes),
        corrected: false,
    }))
}

fn parse_gs_telem(bytes: &[u8]) -> Result<Message, ParseError> {
    require_len(0x10, bytes, 38)?;
    let status = quaternion::decode_status(u16::from_le_bytes([bytes[1], bytes[2]]));
    let alt_raw = i16::from_le_bytes([bytes[3], bytes[4]]);
    let vel_raw = i16::from_le_bytes([bytes[5], bytes[6]]);
    let quat = quaternion::unpack(&bytes[7..12]);
    let time_raw = u16::from_le_bytes([bytes[12], bytes[13]]);
    let batt_raw = bytes[14];
    let seq = bytes[15];
    let rssi_raw = i16::from_le_bytes([bytes[16], bytes[17]]);
    let snr_raw = bytes[18] as i8;
    let freq_err_hz = i16::from_le_bytes([bytes[19], bytes[20]]);
    let data_age_ms = u16::from_le_bytes([bytes[21], bytes[22]]);
    let recovery = bytes[23];
    let mach_raw = u16::from_le_bytes([bytes[24], bytes[25]]);
    let qbar_raw = u16::from_le_bytes([bytes[26], bytes[27]]);
    let roll_raw = i16::from_le_bytes([bytes[28], bytes[29]]);
    let pitch_raw = i16::from_le_bytes([bytes[30], bytes[31]]);
    let yaw_raw = i16::from_le_bytes([bytes[32], bytes[33]]);

    Ok(Message::GsTelem(GsTelem {
        status,
        alt_m: alt_raw as f32,
        vel_mps: vel_raw as f32 * 0.1,
        quat,
        time_s: time_raw as f32 * 0.1,
        batt_v: 6.0 + batt_raw as f32 * 0.012,
        seq,
        rssi_dbm: rssi_raw as f32 * 0.1,
        snr_db: snr_raw as f32 * 0.25,
        freq_err_hz,
        data_age_ms,
        recovered: recovery & 0b1000_0000 != 0,
        recovery_method: (recovery >> 4) & 0b0111,
        recovery_confidence: recovery & 0b0000_1111,
        mach: mach_raw as f32 * 0.001,
        qbar_pa: qbar_raw as f32,
        roll_deg: roll_raw as f32 * 0.1,
        pitch_deg: pitch_raw as f32 * 0.1,
        yaw_deg: yaw_raw as f32 * 0.1,
        stale: data_age_ms > STALE_THRESHOLD_MS,
        crc_ok: crc_ok(bytes),
    }))
}

fn parse_ack_arm(bytes: &[u8]) -> Result<Message, ParseError> {
    require_len(0xA0, bytes, 12)?;
    Ok(Message::AckArm(AckArm {
        nonce: u16::from_le_bytes([bytes[1], bytes[2]]),
        echo_channel: bytes[3],
        echo_action: bytes[4],
        arm_state: bytes[5],
        cont_state: bytes[6],
        crc_ok: crc_ok(bytes),
    }))
}

fn parse_ack_fire(bytes: &[u8]) -> Result<Message, ParseError> {
    require_len(0xA1, bytes, 13)?;
    let flags = bytes[5];
    Ok(Message::AckFire(AckFire {
        nonce: u16::from_le_bytes([bytes[1], bytes[2]]),
        echo_channel: bytes[3],
        echo_duration: bytes[4],
        test_mode: flags & 0b01 != 0,
        armed: flags & 0b10 != 0,
        cont_state: bytes[6],
        crc_ok: crc_ok(bytes),
    }))
}

fn parse_nack(bytes: &[u8]) -> Result<Message, ParseError> {
    require_len(0xE0, bytes, 10)?;
    Ok(Message::Nack(Nack {
        nonce: u16::from_le_bytes([bytes[1], bytes[2]]),
        error_code: bytes[3],
        crc_ok: crc_ok(bytes),
    }))
}

fn passthrough(msg_id: u8, bytes: &[u8]) -> RawPassthrough {
    RawPassthrough {
        msg_id,
        bytes: bytes[1..].to_vec(),
    }
}

/// Parse a deframed, CRC-trailer-intact payload. Unknown msg-ids are never an error: they
/// come back as [`Message::Unknown`] carrying the raw bytes after the id.
pub fn parse(bytes: &[u8]) -> Result<Message, ParseError> {
    let msg_id = *bytes.first().ok_or(ParseError::EmptyInput)?;
    match msg_id {
        0x01 => parse_fc_fast(bytes),
        0x02 => parse_fc_gps(bytes),
        0x03 => parse_fc_event(bytes),
        0x10 => parse_gs_telem(bytes),
        0x11 => Ok(Message::GsGps(passthrough(msg_id, bytes))),
        0x12 => Ok(Message::GsEvent(passthrough(msg_id, bytes))),
        0x13 => Ok(Message::GsStatus(passthrough(msg_id, bytes))),
        0x14 => Ok(Message::GsCorrupt(passthrough(msg_id, bytes))),
        0xA0 => parse_ack_arm(bytes),
        0xA1 => parse_ack_fire(bytes),
        0xA3 => Ok(Message::AckConfig(passthrough(msg_id, bytes))),
        0xE0 => parse_nack(bytes),
        0xC0 => Ok(Message::Handshake(passthrough(msg_id, bytes))),
        other => Ok(Message::Unknown {
            msg_id: other,
            bytes: bytes[1..].to_vec(),
        }),
    }
}

/// Human-readable text for a `NACK` error code, for surfacing in CAC failure messages.
pub fn nack_code_text(code: u8) -> &'static str {
    match code {
        0x01 => "CRC fail",
        0x02 => "bad state",
        0x03 => "not armed",
        0x04 => "no test mode",
        0x05 => "nonce reuse",
        0x06 => "no continuity",
        0x07 => "low battery",
        0x08 => "self-test",
        0x09 => "config too large",
        0x0A => "flash fail",
        _ => "unknown",
    }
}

const ARM_MAGIC: [u8; 2] = [0xCA, 0x5A];

fn with_crc(mut buf: Vec<u8>) -> Vec<u8> {
    let crc = crc::compute(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Draw a 16-bit nonce from the process's cryptographically strong RNG.
pub fn generate_nonce() -> u16 {
    rand::thread_rng().gen()
}

/// `CMD_ARM` (0x80, 12 B): id | magic(2) | nonce(2) | channel | action | !channel | CRC.
pub fn build_cmd_arm(nonce: u16, channel: u8, arm: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.push(0x80);
    buf.extend_from_slice(&ARM_MAGIC);
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf.push(channel);
    buf.push(if arm { 1 } else { 0 });
    buf.push(!channel);
    with_crc(buf)
}

/// `CMD_FIRE` (0x81, 13 B): id | magic(2) | nonce(2) | channel | duration | !channel | !duration | CRC.
/// `duration_ms` is clamped to the byte range before encoding.
pub fn build_cmd_fire(nonce: u16, channel: u8, duration_ms: u32) -> Vec<u8> {
    let duration = duration_ms.min(255) as u8;
    let mut buf = Vec::with_capacity(13);
    buf.push(0x81);
    buf.extend_from_slice(&ARM_MAGIC);
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf.push(channel);
    buf.push(duration);
    buf.push(!channel);
    buf.push(!duration);
    with_crc(buf)
}

fn build_nonce_only(msg_id: u8, nonce: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(msg_id);
    buf.extend_from_slice(&ARM_MAGIC);
    buf.extend_from_slice(&nonce.to_le_bytes());
    with_crc(buf)
}

/// `CONFIRM` (0xF0, 9 B): id | magic(2) | nonce(2) | CRC.
pub fn build_confirm(nonce: u16) -> Vec<u8> {
    build_nonce_only(0xF0, nonce)
}

/// `ABORT` (0xF1, 9 B): id | magic(2) | nonce(2) | CRC.
pub fn build_abort(nonce: u16) -> Vec<u8> {
    build_nonce_only(0xF1, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fc_fast_fixture(status: u16, alt_raw: i16, vel_raw: i16, batt_raw: u8) -> Vec<u8> {
        let mut buf = vec![0x01];
        buf.extend_from_slice(&status.to_le_bytes());
        buf.extend_from_slice(&alt_raw.to_le_bytes());
        buf.extend_from_slice(&vel_raw.to_le_bytes());
        buf.extend_from_slice(&quaternion::pack(quaternion::IDENTITY));
        buf.extend_from_slice(&0u16.to_le_bytes()); // time raw
        buf.push(batt_raw);
        buf.push(7); // seq
        with_crc(buf)
    }

    #[test]
    fn known_fixture_fc_fast_matches_scenario() {
        // status: BOOST (0x1) in high nibble of high byte -> 0x10, CNT1 set in low byte -> 0x01
        let bytes = fc_fast_fixture(0x1001, 100, 500, 100);
        assert_eq!(bytes.len(), 20);
        let msg = parse(&bytes).unwrap();
        match msg {
            Message::FcFast(fast) => {
                assert!(fast.crc_ok);
                assert_eq!(fast.status.fsm_state, quaternion::FsmState::Boost);
                assert!(fast.status.continuity[0]);
                assert_eq!(fast.alt_m, 100.0);
                assert_eq!(fast.vel_mps, 50.0);
                assert!((fast.batt_v - 7.2).abs() < 1e-4);
                assert_eq!(fast.seq, 7);
            }
            other => panic!("expected FcFast, got {other:?}"),
        }
    }

    #[test]
    fn too_short_reports_msg_id_and_lengths() {
        let err = parse(&[0x01, 0x00, 0x00]).unwrap_err();
        assert_eq!(
            err,
            ParseError::TooShort {
                msg_id: 0x01,
                expected: 20,
                actual: 3,
            }
        );
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(parse(&[]), Err(ParseError::EmptyInput));
    }

    #[test]
    fn unknown_msg_id_is_never_an_error() {
        let msg = parse(&[0xFE, 1, 2, 3]).unwrap();
        assert_eq!(
            msg,
            Message::Unknown {
                msg_id: 0xFE,
                bytes: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn corrupted_packet_still_decodes_with_crc_ok_false() {
        let mut bytes = fc_fast_fixture(0x1001, 100, 500, 100);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let msg = parse(&bytes).unwrap();
        match msg {
            Message::FcFast(fast) => assert!(!fast.crc_ok),
            other => panic!("expected FcFast, got {other:?}"),
        }
    }

    #[test]
    fn gps_range_saturated_on_i32_extremes() {
        let mut buf = vec![0x02];
        buf.extend_from_slice(&i32::MAX.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.push(3);
        buf.push(9);
        let bytes = with_crc(buf);
        match parse(&bytes).unwrap() {
            Message::FcGps(gps) => assert!(gps.range_saturated),
            other => panic!("expected FcGps, got {other:?}"),
        }
    }

    #[test]
    fn cmd_arm_wire_layout() {
        let bytes = build_cmd_arm(0x1234, 2, true);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(&bytes[1..3], &ARM_MAGIC);
        assert_eq!(u16::from_le_bytes([bytes[3], bytes[4]]), 0x1234);
        assert_eq!(bytes[5], 2);
        assert_eq!(bytes[6], 1);
        assert_eq!(bytes[7], !2u8);
        assert!(crc::verify(&bytes[..8], u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]])).valid);
    }

    #[test]
    fn cmd_fire_clamps_duration_to_byte_range() {
        let bytes = build_cmd_fire(1, 0, 9000);
        assert_eq!(bytes[6], 255);
        assert_eq!(bytes[8], !255u8);
    }

    #[test]
    fn confirm_and_abort_are_nine_bytes_with_distinct_ids() {
        let confirm = build_confirm(7);
        let abort = build_abort(7);
        assert_eq!(confirm.len(), 9);
        assert_eq!(abort.len(), 9);
        assert_eq!(confirm[0], 0xF0);
        assert_eq!(abort[0], 0xF1);
    }

    #[test]
    fn nack_code_text_covers_known_and_unknown_codes() {
        assert_eq!(nack_code_text(0x03), "not armed");
        assert_eq!(nack_code_text(0xFF), "unknown");
    }
}
