//! # Ground-station core
//!
//! The ground-station core of a model/amateur rocketry mission-control system: the
//! subsystem that bridges raw bytes on a serial link to a reactive telemetry snapshot and
//! orchestrates pyrotechnic commands through a three-phase Command-Acknowledge-Confirm
//! (CAC) handshake with the flight computer.
//!
//! ## Data flow
//!
//! On ingress: `serial bytes -> COBS deframer -> parser -> (Stage-1 CRC repair on failure)
//! -> TelemetryStore -> subscribers`, with telemetry status feeding the CAC machine as a
//! parallel acknowledgement path. On egress: `CacMachine::cmd_* -> CommandBuilder -> COBS
//! encoder -> serial bytes`.
//!
//! ## Modules
//!
//! - [`crc`] - CRC-32/ISO-HDLC engine, reused (init=0, no final XOR) by [`corrector`] for
//!   syndrome-table generation.
//! - [`cobs`] - Consistent Overhead Byte Stuffing framing and the stream [`cobs::Deframer`].
//! - [`quaternion`] - Smallest-three quaternion pack/unpack and the status bitmap decode.
//! - [`derived`] - ISA Mach number, exponential-density dynamic pressure, quaternion-Euler.
//! - [`protocol`] - The closed tagged-union packet parser and command builder.
//! - [`corrector`] - Stage-1 single-bit forward error correction over CRC-32 syndromes.
//! - [`telemetry`] - `TelemetryStore`, the fused `Snapshot`, ring buffers, event log.
//! - [`cac`] - The Command-Acknowledge-Confirm state machine.
//! - [`config`] - The binary flight-config serialiser the FC accepts.
//! - [`gs_core`] - The glue: wires a byte transport to the deframer, parser, corrector,
//!   store, and CAC machine, and owns the ~10 Hz stale ticker.
//! - [`settings`] - Runtime-tunable ground-station settings (CAC timeouts, stale
//!   thresholds, transport endpoints), promoted from spec.md's fixed constants.

pub mod cac;
pub mod cobs;
pub mod config;
pub mod corrector;
pub mod crc;
pub mod derived;
pub mod gs_core;
pub mod protocol;
pub mod quaternion;
pub mod settings;
pub mod telemetry;

// Re-export the main public types for convenience.
pub use cac::{CacMachine, CacTimeouts, Phase as CacPhase};
pub use gs_core::{GroundStationCore, LinkSource};
pub use protocol::Message;
pub use settings::GroundStationConfig;
pub use telemetry::{Snapshot, TelemetryStore};
