//! Runtime-tunable ground-station settings: the timeouts and thresholds spec.md treats as
//! fixed constants (CAC leg/overall/confirm, stale threshold, the audio-grade stale
//! threshold consumed by the out-of-scope TTS callout layer) plus the FC/GS transport
//! endpoints, promoted to a struct a ground-station operator can load from a file instead
//! of recompiling. Mirrors the teacher's pattern of promoting `agent.rs`'s rate-limit window
//! constants into named, overridable values.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cac::CacTimeouts;

/// Matches spec.md §6's "stale threshold 500 ms".
pub const STALE_THRESHOLD_MS: u64 = 500;

/// Matches spec.md §6's "audio-grade stale 2 000 ms". The core itself never reads this
/// value — it exists so the out-of-scope audio/TTS callout layer can be handed one number
/// out of the same config file rather than hardcoding its own.
pub const AUDIO_STALE_THRESHOLD_MS: u64 = 2_000;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundStationConfig {
    /// Host:port the FC direct link is reached at.
    pub fc_endpoint: String,
    /// Host:port the GS relay link is reached at, if this ground station also bridges a
    /// relay hop rather than talking to the FC directly.
    pub gs_endpoint: Option<String>,
    pub cac_leg_ms: u64,
    pub cac_overall_ms: u64,
    pub cac_confirm_ms: u64,
    pub cac_retry_cap: u8,
    pub stale_threshold_ms: u64,
    pub audio_stale_threshold_ms: u64,
}

impl Default for GroundStationConfig {
    fn default() -> Self {
        let cac = CacTimeouts::default();
        Self {
            fc_endpoint: "127.0.0.1:8090".to_string(),
            gs_endpoint: None,
            cac_leg_ms: cac.leg.as_millis() as u64,
            cac_overall_ms: cac.overall.as_millis() as u64,
            cac_confirm_ms: cac.confirm.as_millis() as u64,
            cac_retry_cap: cac.retry_cap,
            stale_threshold_ms: STALE_THRESHOLD_MS,
            audio_stale_threshold_ms: AUDIO_STALE_THRESHOLD_MS,
        }
    }
}

impl GroundStationConfig {
    /// Load settings from a JSON file, falling back to nothing (the caller decides whether
    /// to use [`Default::default`] instead) on any I/O or parse failure.
    pub fn load_from_file(path: &str) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn cac_timeouts(&self) -> CacTimeouts {
        CacTimeouts {
            leg: Duration::from_millis(self.cac_leg_ms),
            overall: Duration::from_millis(self.cac_overall_ms),
            confirm: Duration::from_millis(self.cac_confirm_ms),
            retry_cap: self.cac_retry_cap,
        }
    }
}
