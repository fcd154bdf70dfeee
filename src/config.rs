//! Binary flight-config serialiser: the layout the flight computer accepts over the
//! `CONFIG`/`ACK_CONFIG` exchange. `config_hash` is the CRC-32 of the payload excluding its
//! own trailer, matching the trailer embedded in the serialised bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crc;

const CHANNEL_RECORD_LEN: usize = 32;
const HEADER_LEN: usize = 1 + 2; // version + total_length
const TAIL_LEN: usize = 4 * 7; // seven f32 scalars
const CRC_LEN: usize = 4;
pub const CONFIG_LEN: usize =
    HEADER_LEN + 4 * CHANNEL_RECORD_LEN + TAIL_LEN + CRC_LEN;

pub const CONFIG_VERSION: u8 = 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("buffer too short: need at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u8),
    #[error("declared total_length {declared} does not match buffer length {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("CRC mismatch: computed 0x{computed:08X}, trailer 0x{trailer:08X}")]
    CrcMismatch { computed: u32, trailer: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PyroRole {
    Drogue = 0,
    Main = 1,
    Backup = 2,
    Custom = 3,
}

impl PyroRole {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PyroRole::Drogue,
            1 => PyroRole::Main,
            2 => PyroRole::Backup,
            _ => PyroRole::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AltitudeSource {
    Barometric = 0,
    Gps = 1,
    Fused = 2,
}

impl AltitudeSource {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AltitudeSource::Barometric,
            1 => AltitudeSource::Gps,
            _ => AltitudeSource::Fused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PyroChannelConfig {
    pub role: PyroRole,
    pub altitude_source: AltitudeSource,
    pub early_deploy: bool,
    pub backup_mode_is_height: bool,
    pub fire_duration_ms: f32,
    pub deploy_altitude_m: f32,
    pub time_after_apogee_s: f32,
    pub early_deploy_velocity_mps: f32,
    pub backup_value: f32,
    pub motor_number: u8,
    pub angle_cap_primary_deg: u8,
    pub angle_cap_secondary_deg: u8,
    pub min_velocity_mps: f32,
    pub min_altitude_m: f32,
    pub fire_delay_s: f32,
}

impl PyroChannelConfig {
    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.role as u8);
        out.push(self.altitude_source as u8);
        let flags = (self.early_deploy as u8) | ((self.backup_mode_is_height as u8) << 1);
        out.push(flags);
        out.extend_from_slice(&self.fire_duration_ms.to_le_bytes());
        out.extend_from_slice(&self.deploy_altitude_m.to_le_bytes());
        out.extend_from_slice(&self.time_after_apogee_s.to_le_bytes());
        out.extend_from_slice(&self.early_deploy_velocity_mps.to_le_bytes());
        out.extend_from_slice(&self.backup_value.to_le_bytes());
        out.push(self.motor_number);
        out.push(self.angle_cap_primary_deg);
        out.push(self.angle_cap_secondary_deg);
        out.extend_from_slice(&((self.min_velocity_mps * 10.0).round() as i16).to_le_bytes());
        out.extend_from_slice(&(self.min_altitude_m.round() as i16).to_le_bytes());
        out.push((self.fire_delay_s * 10.0).round() as u8);
        out.push(0); // reserved pad byte to round the record to 32 bytes
    }

    fn read(bytes: &[u8]) -> Self {
        let flags = bytes[2];
        let min_velocity_raw = i16::from_le_bytes([bytes[23], bytes[24]]);
        let min_altitude_raw = i16::from_le_bytes([bytes[25], bytes[26]]);
        Self {
            role: PyroRole::from_u8(bytes[0]),
            altitude_source: AltitudeSource::from_u8(bytes[1]),
            early_deploy: flags & 0b01 != 0,
            backup_mode_is_height: flags & 0b10 != 0,
            fire_duration_ms: f32::from_le_bytes(bytes[3..7].try_into().unwrap()),
            deploy_altitude_m: f32::from_le_bytes(bytes[7..11].try_into().unwrap()),
            time_after_apogee_s: f32::from_le_bytes(bytes[11..15].try_into().unwrap()),
            early_deploy_velocity_mps: f32::from_le_bytes(bytes[15..19].try_into().unwrap()),
            backup_value: f32::from_le_bytes(bytes[19..23].try_into().unwrap()),
            motor_number: bytes[27],
            angle_cap_primary_deg: bytes[28],
            angle_cap_secondary_deg: bytes[29],
            min_velocity_mps: min_velocity_raw as f32 / 10.0,
            min_altitude_m: min_altitude_raw as f32,
            fire_delay_s: bytes[30] as f32 / 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlightConfig {
    pub channels: [PyroChannelConfig; 4],
    pub pad_lat: f32,
    pub pad_lon: f32,
    pub pad_alt_msl_m: f32,
    pub sf_alt_threshold_m: f32,
    pub sf_vel_threshold_mps: f32,
    pub min_batt_v: f32,
    pub min_integrity_pct: f32,
}

impl FlightConfig {
    /// Serialise to the wire layout, appending the CRC-32 trailer over everything before it.
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(CONFIG_LEN - CRC_LEN);
        body.push(CONFIG_VERSION);
        body.extend_from_slice(&(CONFIG_LEN as u16).to_le_bytes());
        for channel in &self.channels {
            channel.write(&mut body);
        }
        body.extend_from_slice(&self.pad_lat.to_le_bytes());
        body.extend_from_slice(&self.pad_lon.to_le_bytes());
        body.extend_from_slice(&self.pad_alt_msl_m.to_le_bytes());
        body.extend_from_slice(&self.sf_alt_threshold_m.to_le_bytes());
        body.extend_from_slice(&self.sf_vel_threshold_mps.to_le_bytes());
        body.extend_from_slice(&self.min_batt_v.to_le_bytes());
        body.extend_from_slice(&self.min_integrity_pct.to_le_bytes());

        let crc = crc::compute(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    /// `config_hash`: the CRC-32 of the payload excluding its own trailer.
    pub fn config_hash(&self) -> u32 {
        let serialized = self.serialize();
        let n = serialized.len();
        crc::compute(&serialized[..n - CRC_LEN])
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() < HEADER_LEN {
            return Err(ConfigError::TooShort {
                expected: CONFIG_LEN,
                actual: bytes.len(),
            });
        }
        let version = bytes[0];
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }
        let declared = u16::from_le_bytes([bytes[1], bytes[2]]);
        if bytes.len() != declared as usize || bytes.len() != CONFIG_LEN {
            return Err(ConfigError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        let trailer = u32::from_le_bytes(
            bytes[CONFIG_LEN - CRC_LEN..].try_into().unwrap(),
        );
        let computed = crc::compute(&bytes[..CONFIG_LEN - CRC_LEN]);
        if computed != trailer {
            return Err(ConfigError::CrcMismatch { computed, trailer });
        }

        let mut offset = HEADER_LEN;
        let mut channels = Vec::with_capacity(4);
        for _ in 0..4 {
            channels.push(PyroChannelConfig::read(&bytes[offset..offset + CHANNEL_RECORD_LEN]));
            offset += CHANNEL_RECORD_LEN;
        }
        let f32_at = |o: usize| f32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());

        Ok(FlightConfig {
            channels: channels.try_into().unwrap_or_else(|_| unreachable!()),
            pad_lat: f32_at(offset),
            pad_lon: f32_at(offset + 4),
            pad_alt_msl_m: f32_at(offset + 8),
            sf_alt_threshold_m: f32_at(offset + 12),
            sf_vel_threshold_mps: f32_at(offset + 16),
            min_batt_v: f32_at(offset + 20),
            min_integrity_pct: f32_at(offset + 24),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel() -> PyroChannelConfig {
        PyroChannelConfig {
            role: PyroRole::Main,
            altitude_source: AltitudeSource::Fused,
            early_deploy: true,
            backup_mode_is_height: false,
            fire_duration_ms: 250.0,
            deploy_altitude_m: 300.0,
            time_after_apogee_s: 1.5,
            early_deploy_velocity_mps: 12.0,
            backup_value: 450.0,
            motor_number: 2,
            angle_cap_primary_deg: 20,
            angle_cap_secondary_deg: 35,
            min_velocity_mps: 5.5,
            min_altitude_m: 100.0,
            fire_delay_s: 0.5,
        }
    }

    fn sample_config() -> FlightConfig {
        FlightConfig {
            channels: [sample_channel(), sample_channel(), sample_channel(), sample_channel()],
            pad_lat: 35.347,
            pad_lon: -117.808,
            pad_alt_msl_m: 620.0,
            sf_alt_threshold_m: 50.0,
            sf_vel_threshold_mps: 20.0,
            min_batt_v: 7.0,
            min_integrity_pct: 90.0,
        }
    }

    #[test]
    fn serialized_length_matches_declared_and_constant() {
        let bytes = sample_config().serialize();
        assert_eq!(bytes.len(), CONFIG_LEN);
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]) as usize, CONFIG_LEN);
    }

    #[test]
    fn config_hash_matches_embedded_trailer() {
        let config = sample_config();
        let bytes = config.serialize();
        let trailer = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(config.config_hash(), trailer);
    }

    #[test]
    fn round_trip_preserves_channel_fields() {
        let config = sample_config();
        let bytes = config.serialize();
        let decoded = FlightConfig::deserialize(&bytes).unwrap();
        assert_eq!(decoded.channels[0].role, PyroRole::Main);
        assert_eq!(decoded.channels[0].motor_number, 2);
        assert!((decoded.channels[0].fire_duration_ms - 250.0).abs() < 1e-3);
        assert!((decoded.min_velocity_mps - 5.5).abs() < 0.05);
        assert_eq!(decoded.pad_alt_msl_m, 620.0);
    }

    #[test]
    fn deserialize_rejects_corrupted_crc() {
        let mut bytes = sample_config().serialize();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            FlightConfig::deserialize(&bytes),
            Err(ConfigError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn deserialize_rejects_unsupported_version() {
        let mut bytes = sample_config().serialize();
        bytes[0] = 0xFF;
        assert_eq!(
            FlightConfig::deserialize(&bytes),
            Err(ConfigError::UnsupportedVersion(0xFF))
        );
    }
}
