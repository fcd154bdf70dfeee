//! Fuses parsed messages into a single reactive telemetry snapshot: ring buffers, an event
//! log, staleness tracking, and an isolated-copy subscription feed for any number of UI
//! observers.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::{FcFast, FcGps, GsTelem};
use crate::quaternion::FsmState;

pub const RING_BUFFER_CAP: usize = 150;
pub const STALE_THRESHOLD_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    Fc,
    Gs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyroState {
    pub channel: u8,
    pub armed: bool,
    pub continuity: bool,
    pub fired: bool,
    pub role: String,
    pub cont_v: f32,
}

impl PyroState {
    fn new(channel: u8) -> Self {
        Self {
            channel,
            armed: false,
            continuity: false,
            fired: false,
            role: String::new(),
            cont_v: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsState {
    pub dlat_m: f32,
    pub dlon_m: f32,
    pub alt_msl_m: f32,
    pub alt_agl_m: f32,
    pub fix: u8,
    pub sats: u8,
    pub pdop: f32,
    pub range_saturated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkQuality {
    pub rssi_dbm: f32,
    pub snr_db: f32,
    pub freq_err_hz: i16,
    pub data_age_ms: u64,
    pub stale: bool,
    pub stale_since_ms: u64,
    pub recovered: bool,
    pub recovery_method: u8,
    pub recovery_confidence: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketStats {
    pub rx_count: u64,
    pub lost_count: u64,
    pub integrity_pct: f32,
    pub gs_batt_v: f32,
    pub gs_temp_c: f32,
    pub radio_profile: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub type_name: String,
    pub event_type: u8,
    pub event_data: u16,
    pub time_s: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fc_connected: bool,
    pub gs_connected: bool,
    pub protocol_ok: bool,
    pub fw_version: Option<String>,
    pub config_hash: Option<u32>,

    pub alt_m: f32,
    pub vel_mps: f32,
    pub quat: [f32; 4],
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    pub mach: f32,
    pub qbar_pa: f32,
    pub batt_v: f32,
    pub fsm_state: FsmState,
    pub flight_time_s: f32,
    pub seq: u8,
    pub apogee_alt_m: f32,

    pub pyros: [PyroState; 4],
    pub gps: GpsState,
    pub link: LinkQuality,
    pub stats: PacketStats,

    pub altitude_history: VecDeque<f32>,
    pub velocity_history: VecDeque<f32>,
    pub qbar_history: VecDeque<f32>,
    pub events: Vec<Event>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            fc_connected: false,
            gs_connected: false,
            protocol_ok: false,
            fw_version: None,
            config_hash: None,
            alt_m: 0.0,
            vel_mps: 0.0,
            quat: crate::quaternion::IDENTITY,
            roll_deg: 0.0,
            pitch_deg: 0.0,
            yaw_deg: 0.0,
            mach: 0.0,
            qbar_pa: 0.0,
            batt_v: 0.0,
            fsm_state: FsmState::Pad,
            flight_time_s: 0.0,
            seq: 0,
            apogee_alt_m: 0.0,
            pyros: [
                PyroState::new(1),
                PyroState::new(2),
                PyroState::new(3),
                PyroState::new(4),
            ],
            gps: GpsState::default(),
            link: LinkQuality::default(),
            stats: PacketStats::default(),
            altitude_history: VecDeque::with_capacity(RING_BUFFER_CAP),
            velocity_history: VecDeque::with_capacity(RING_BUFFER_CAP),
            qbar_history: VecDeque::with_capacity(RING_BUFFER_CAP),
            events: Vec::new(),
        }
    }
}

fn push_ring(buf: &mut VecDeque<f32>, value: f32) {
    if buf.len() >= RING_BUFFER_CAP {
        buf.pop_front();
    }
    buf.push_back(value);
}

/// The twelve-code event taxonomy behind spec's `type_name` format list. No canonical
/// numeric code table was available alongside the format strings, so the discriminant here
/// is assigned by the order the formats are listed in; an out-of-range code is never an
/// error — it becomes [`EventKind::Other`] and formats generically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    State,
    PyroFired,
    Apogee,
    Error,
    PadOrigin,
    Burnout,
    Stage,
    ChannelArmed,
    ChannelDisarmed,
    Other(u8),
}

impl From<u8> for EventKind {
    fn from(code: u8) -> Self {
        match code {
            0 => EventKind::State,
            1 => EventKind::PyroFired,
            2 => EventKind::Apogee,
            3 => EventKind::Error,
            4 => EventKind::PadOrigin,
            5 => EventKind::Burnout,
            6 => EventKind::Stage,
            7 => EventKind::ChannelArmed,
            8 => EventKind::ChannelDisarmed,
            other => EventKind::Other(other),
        }
    }
}

fn format_event(kind: EventKind, data: u16) -> String {
    match kind {
        EventKind::State => format!("STATE \u{2192} {:?}", FsmState::from((data & 0x0F) as u8)).to_uppercase(),
        EventKind::PyroFired => {
            let channel = (data >> 8) as u8;
            let duration = (data & 0xFF) as u8;
            format!("PYRO CH{channel} FIRED {duration}ms")
        }
        EventKind::Apogee => format!("APOGEE {}m", data as f32 * 10.0),
        EventKind::Error => format!("ERROR: 0x{data:04X}"),
        EventKind::PadOrigin => format!("PAD ORIGIN ({data} sats)"),
        EventKind::Burnout => format!("BURNOUT (peak {data}mg)"),
        EventKind::Stage => format!("STAGE {data}"),
        EventKind::ChannelArmed => format!("CH{data} ARMED"),
        EventKind::ChannelDisarmed => format!("CH{data} DISARMED"),
        EventKind::Other(code) => format!("EVENT 0x{code:02X} data={data}"),
    }
}

/// Single mutable, subscribable telemetry snapshot. All mutation happens on the owning task;
/// subscribers receive isolated copies through a `tokio::sync::watch` channel.
pub struct TelemetryStore {
    snapshot: Snapshot,
    sender: watch::Sender<Snapshot>,
    last_valid_ms: u64,
}

impl TelemetryStore {
    pub fn new() -> Self {
        let snapshot = Snapshot::default();
        let (sender, _receiver) = watch::channel(snapshot.clone());
        Self {
            snapshot,
            sender,
            last_valid_ms: 0,
        }
    }

    /// Subscribe to the snapshot feed. Dropping the returned receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> &Snapshot {
        &self.snapshot
    }

    fn publish(&mut self) {
        // `send` only fails when every receiver has been dropped; nothing to act on.
        let _ = self.sender.send(self.snapshot.clone());
    }

    fn apply_status(&mut self, status: &crate::quaternion::StatusBitmap) {
        for i in 0..4 {
            self.snapshot.pyros[i].armed = status.armed[i];
            self.snapshot.pyros[i].continuity = status.continuity[i];
        }
    }

    pub fn update_from_fc_fast(&mut self, msg: &FcFast, now_ms: u64) {
        self.snapshot.alt_m = msg.alt_m;
        self.snapshot.vel_mps = msg.vel_mps;
        self.snapshot.quat = msg.quat;
        self.snapshot.roll_deg = msg.euler.roll_deg;
        self.snapshot.pitch_deg = msg.euler.pitch_deg;
        self.snapshot.yaw_deg = msg.euler.yaw_deg;
        self.snapshot.mach = msg.mach;
        self.snapshot.qbar_pa = msg.qbar_pa;
        self.snapshot.batt_v = msg.batt_v;
        self.snapshot.fsm_state = status_fsm(&msg.status);
        self.snapshot.flight_time_s = msg.time_s;
        self.snapshot.seq = msg.seq;
        self.apply_status(&msg.status);

        push_ring(&mut self.snapshot.altitude_history, msg.alt_m);
        push_ring(&mut self.snapshot.velocity_history, msg.vel_mps);
        push_ring(&mut self.snapshot.qbar_history, msg.qbar_pa);

        self.snapshot.link.stale = false;
        self.last_valid_ms = now_ms;
        self.publish();
    }

    pub fn update_from_gs_telem(&mut self, msg: &GsTelem, now_ms: u64) {
        self.snapshot.alt_m = msg.alt_m;
        self.snapshot.vel_mps = msg.vel_mps;
        self.snapshot.quat = msg.quat;
        self.snapshot.roll_deg = msg.roll_deg;
        self.snapshot.pitch_deg = msg.pitch_deg;
        self.snapshot.yaw_deg = msg.yaw_deg;
        self.snapshot.mach = msg.mach;
        self.snapshot.qbar_pa = msg.qbar_pa;
        self.snapshot.batt_v = msg.batt_v;
        self.snapshot.fsm_state = status_fsm(&msg.status);
        self.snapshot.flight_time_s = msg.time_s;
        self.snapshot.seq = msg.seq;
        self.apply_status(&msg.status);

        self.snapshot.link.rssi_dbm = msg.rssi_dbm;
        self.snapshot.link.snr_db = msg.snr_db;
        self.snapshot.link.freq_err_hz = msg.freq_err_hz;
        self.snapshot.link.data_age_ms = msg.data_age_ms as u64;
        self.snapshot.link.recovered = msg.recovered;
        self.snapshot.link.recovery_method = msg.recovery_method;
        self.snapshot.link.recovery_confidence = msg.recovery_confidence;

        push_ring(&mut self.snapshot.altitude_history, msg.alt_m);
        push_ring(&mut self.snapshot.velocity_history, msg.vel_mps);
        push_ring(&mut self.snapshot.qbar_history, msg.qbar_pa);

        self.snapshot.link.stale = false;
        self.last_valid_ms = now_ms;
        self.publish();
    }

    pub fn update_from_gps(&mut self, msg: &FcGps) {
        self.snapshot.gps.dlat_m = msg.dlat_m;
        self.snapshot.gps.dlon_m = msg.dlon_m;
        self.snapshot.gps.alt_msl_m = msg.alt_msl_m;
        self.snapshot.gps.fix = msg.fix;
        self.snapshot.gps.sats = msg.sats;
        self.snapshot.gps.range_saturated = msg.range_saturated;
        self.publish();
    }

    pub fn update_from_event(&mut self, event_type: u8, event_data: u16, time_s: f32) {
        let kind = EventKind::from(event_type);
        let type_name = format_event(kind, event_data);

        if kind == EventKind::Apogee {
            self.snapshot.apogee_alt_m = event_data as f32 * 10.0;
        }
        if kind == EventKind::State {
            self.snapshot.fsm_state = FsmState::from((event_data & 0x0F) as u8);
        }
        if kind == EventKind::PyroFired {
            // channel is 1-indexed in the FC_EVENT pyro record; an e-match that has fired
            // has opened its circuit, so continuity reads false from here until reset.
            let channel = (event_data >> 8) as usize;
            if channel >= 1 && channel <= 4 {
                self.snapshot.pyros[channel - 1].fired = true;
                self.snapshot.pyros[channel - 1].continuity = false;
            }
        }

        self.snapshot.events.push(Event {
            type_name,
            event_type,
            event_data,
            time_s,
        });
        self.publish();
    }

    pub fn set_connection(&mut self, link: Link, connected: bool) {
        match link {
            Link::Fc => self.snapshot.fc_connected = connected,
            Link::Gs => self.snapshot.gs_connected = connected,
        }
        if !connected {
            let preserved_events = std::mem::take(&mut self.snapshot.events);
            let (fc, gs) = (self.snapshot.fc_connected, self.snapshot.gs_connected);
            self.snapshot = Snapshot {
                fc_connected: fc,
                gs_connected: gs,
                events: preserved_events,
                ..Snapshot::default()
            };
        }
        self.publish();
    }

    pub fn set_protocol_ok(&mut self, ok: bool, fw_version: Option<String>, config_hash: Option<u32>) {
        self.snapshot.protocol_ok = ok;
        if fw_version.is_some() {
            self.snapshot.fw_version = fw_version;
        }
        if config_hash.is_some() {
            self.snapshot.config_hash = config_hash;
        }
        self.publish();
    }

    /// Called at ~10 Hz. Marks the snapshot stale once more than [`STALE_THRESHOLD_MS`] has
    /// elapsed since the last valid packet; idempotent once stale beyond refreshing the
    /// elapsed-time counters.
    pub fn tick_stale(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_valid_ms);
        if elapsed > STALE_THRESHOLD_MS {
            self.snapshot.link.stale = true;
            self.snapshot.link.stale_since_ms = elapsed;
            self.snapshot.link.data_age_ms = elapsed;
            self.publish();
        }
    }

    pub fn reset(&mut self) {
        self.snapshot = Snapshot::default();
        self.last_valid_ms = 0;
        self.publish();
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn status_fsm(status: &crate::quaternion::StatusBitmap) -> FsmState {
    status.fsm_state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived;
    use crate::quaternion;

    fn fc_fast(alt_m: f32, vel_mps: f32) -> FcFast {
        FcFast {
            status: quaternion::decode_status(0x1001),
            alt_m,
            vel_mps,
            quat: quaternion::IDENTITY,
            time_s: 1.0,
            batt_v: 7.2,
            seq: 1,
            mach: derived::mach(vel_mps, alt_m),
            qbar_pa: derived::dynamic_pressure(vel_mps, alt_m),
            euler: derived::quaternion_to_euler(quaternion::IDENTITY),
            crc_ok: true,
            corrected: false,
        }
    }

    #[test]
    fn known_fixture_populates_single_ring_sample() {
        let mut store = TelemetryStore::new();
        store.update_from_fc_fast(&fc_fast(100.0, 50.0), 1000);
        assert_eq!(store.current().altitude_history.len(), 1);
        assert_eq!(store.current().altitude_history[0], 100.0);
        assert_eq!(store.current().fsm_state, FsmState::Boost);
    }

    #[test]
    fn ring_buffer_caps_at_150_and_drops_oldest() {
        let mut store = TelemetryStore::new();
        for i in 0..(RING_BUFFER_CAP + 10) {
            store.update_from_fc_fast(&fc_fast(i as f32, 0.0), i as u64);
        }
        assert_eq!(store.current().altitude_history.len(), RING_BUFFER_CAP);
        assert_eq!(*store.current().altitude_history.front().unwrap(), 10.0);
    }

    #[test]
    fn pyro_fired_event_opens_continuity_for_that_channel() {
        let mut store = TelemetryStore::new();
        store.update_from_fc_fast(&fc_fast(100.0, 10.0), 0);
        store.apply_status(&quaternion::decode_status(0x0003)); // CNT1 + CNT2 set
        assert!(store.current().pyros[0].continuity);

        // channel 1 fired for 250ms: high byte = channel, low byte = duration
        store.update_from_event(1, (1u16 << 8) | 250, 5.0);

        assert!(store.current().pyros[0].fired);
        assert!(!store.current().pyros[0].continuity);
        assert!(store.current().pyros[1].continuity, "other channel untouched");
        assert_eq!(store.current().events[0].type_name, "PYRO CH1 FIRED 250ms");
    }

    #[test]
    fn apogee_event_sets_apogee_alt_scaled_by_ten() {
        let mut store = TelemetryStore::new();
        store.update_from_event(2, 150, 12.0);
        assert_eq!(store.current().apogee_alt_m, 1500.0);
        assert_eq!(store.current().events.len(), 1);
        assert_eq!(store.current().events[0].type_name, "APOGEE 1500m");
    }

    #[test]
    fn disconnect_resets_telemetry_but_preserves_events_and_other_link() {
        let mut store = TelemetryStore::new();
        store.update_from_event(3, 0xBEEF, 1.0);
        store.set_connection(Link::Gs, true);
        store.update_from_fc_fast(&fc_fast(500.0, 10.0), 2000);
        store.set_connection(Link::Fc, false);

        assert_eq!(store.current().events.len(), 1);
        assert!(!store.current().fc_connected);
        assert!(store.current().gs_connected);
        assert_eq!(store.current().alt_m, 0.0);
    }

    #[test]
    fn explicit_reset_clears_everything_including_events() {
        let mut store = TelemetryStore::new();
        store.update_from_event(3, 0xBEEF, 1.0);
        store.reset();
        assert!(store.current().events.is_empty());
    }

    #[test]
    fn tick_stale_marks_stale_after_threshold() {
        let mut store = TelemetryStore::new();
        store.update_from_fc_fast(&fc_fast(0.0, 0.0), 0);
        assert!(!store.current().link.stale);
        store.tick_stale(STALE_THRESHOLD_MS + 1);
        assert!(store.current().link.stale);
        assert_eq!(store.current().link.stale_since_ms, STALE_THRESHOLD_MS + 1);
    }

    #[test]
    fn subscribers_receive_isolated_copies() {
        let mut store = TelemetryStore::new();
        let rx = store.subscribe();
        store.update_from_fc_fast(&fc_fast(42.0, 1.0), 10);
        let snap = rx.borrow().clone();
        assert_eq!(snap.alt_m, 42.0);
    }
}
