//! Diagnostic binary: serialises a sample flight config to the wire layout, prints its
//! size, and verifies the embedded CRC trailer matches `config_hash`. Also loads an
//! optional JSON config file via `serde_json` when a path is given on the command line.

use groundstation_core::config::{AltitudeSource, FlightConfig, PyroChannelConfig, PyroRole, CONFIG_LEN};
use std::env;
use std::fs;

fn sample_channel(role: PyroRole) -> PyroChannelConfig {
    PyroChannelConfig {
        role,
        altitude_source: AltitudeSource::Fused,
        early_deploy: false,
        backup_mode_is_height: true,
        fire_duration_ms: 250.0,
        deploy_altitude_m: 300.0,
        time_after_apogee_s: 1.0,
        early_deploy_velocity_mps: 0.0,
        backup_value: 10.0,
        motor_number: 1,
        angle_cap_primary_deg: 20,
        angle_cap_secondary_deg: 35,
        min_velocity_mps: 5.0,
        min_altitude_m: 50.0,
        fire_delay_s: 0.0,
    }
}

fn sample_config() -> FlightConfig {
    FlightConfig {
        channels: [
            sample_channel(PyroRole::Drogue),
            sample_channel(PyroRole::Main),
            sample_channel(PyroRole::Backup),
            sample_channel(PyroRole::Custom),
        ],
        pad_lat: 35.347,
        pad_lon: -117.808,
        pad_alt_msl_m: 620.0,
        sf_alt_threshold_m: 50.0,
        sf_vel_threshold_mps: 20.0,
        min_batt_v: 7.0,
        min_integrity_pct: 90.0,
    }
}

fn main() {
    println!("Flight config serialiser");
    println!("=========================");

    let config = match env::args().nth(1) {
        Some(path) => match fs::read_to_string(&path).and_then(|s| {
            serde_json::from_str::<FlightConfig>(&s)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }) {
            Ok(cfg) => {
                println!("loaded config from {path}");
                cfg
            }
            Err(e) => {
                eprintln!("failed to load {path}: {e}, using a sample config instead");
                sample_config()
            }
        },
        None => {
            println!("no config path given, using a sample config");
            sample_config()
        }
    };

    let bytes = config.serialize();
    let hash = config.config_hash();

    println!("serialized length: {} bytes (CONFIG_LEN = {})", bytes.len(), CONFIG_LEN);
    println!("config_hash: 0x{hash:08X}");

    let trailer = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    if hash == trailer {
        println!("config_hash matches embedded CRC trailer");
    } else {
        println!("MISMATCH: config_hash 0x{hash:08X} != trailer 0x{trailer:08X}");
        std::process::exit(1);
    }

    match FlightConfig::deserialize(&bytes) {
        Ok(_) => println!("round-trip deserialize succeeded"),
        Err(e) => {
            eprintln!("round-trip deserialize failed: {e}");
            std::process::exit(1);
        }
    }
}
