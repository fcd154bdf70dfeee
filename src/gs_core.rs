//! The glue: wires a byte transport (FC direct link, GS relay link) through the COBS
//! deframer, parser, Stage-1 corrector, [`TelemetryStore`], and [`CacMachine`]. Owns the
//! ~10 Hz stale ticker. This is the only place in the crate that knows about both a
//! transport and the store/CAC machine at once; the parser and store stay pure.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cac::{CacMachine, CacTimeouts, UiState};
use crate::cobs::{self, Deframer};
use crate::corrector;
use crate::protocol::{self, Message};
use crate::telemetry::{Link, Snapshot, TelemetryStore};

/// ~10 Hz, matching spec's "best-effort 10 Hz processing".
pub const STALE_TICK_PERIOD: Duration = Duration::from_millis(100);

/// One day. Used as a timer's deadline when the owning [`CacMachine`] reports no pending
/// timer, so a single `tokio::select!` arm can always be raced without an `Option` branch.
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// Which serial link a chunk of bytes arrived on. FC direct carries the `FC_FAST`/`FC_GPS`/
/// `FC_EVENT` classes eligible for Stage-1 repair; GS relay carries the pre-fused `GS_*`
/// classes, which spec treats as a trusted, already-recovered radio hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    Fc,
    Gs,
}

fn message_crc_ok(msg: &Message) -> bool {
    match msg {
        Message::FcFast(m) => m.crc_ok,
        Message::FcGps(m) => m.crc_ok,
        Message::FcEvent(m) => m.crc_ok,
        _ => true,
    }
}

fn mark_corrected(msg: Message) -> Message {
    match msg {
        Message::FcFast(mut m) => {
            m.crc_ok = true;
            m.corrected = true;
            Message::FcFast(m)
        }
        Message::FcGps(mut m) => {
            m.crc_ok = true;
            m.corrected = true;
            Message::FcGps(m)
        }
        Message::FcEvent(mut m) => {
            m.crc_ok = true;
            m.corrected = true;
            Message::FcEvent(m)
        }
        other => other,
    }
}

/// Flip the one bit Stage-1 believes is wrong and return the repaired frame (payload plus
/// its original trailer), or `None` if the corruption isn't a single bit.
fn try_stage1_repair(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 4 {
        return None;
    }
    let n = payload.len();
    let body = &payload[..n - 4];
    let trailer = u32::from_le_bytes([payload[n - 4], payload[n - 3], payload[n - 2], payload[n - 1]]);
    corrector::correct(body, trailer).map(|(fixed_body, _bit_pos)| {
        let mut out = fixed_body;
        out.extend_from_slice(&trailer.to_le_bytes());
        out
    })
}

pub struct GroundStationCore<F>
where
    F: FnMut(Vec<u8>) + Send + 'static,
{
    fc_deframer: Deframer,
    gs_deframer: Deframer,
    store: TelemetryStore,
    cac: CacMachine<F>,
    epoch: Instant,
}

impl<F> GroundStationCore<F>
where
    F: FnMut(Vec<u8>) + Send + 'static,
{
    pub fn new(send: F, timeouts: CacTimeouts) -> (Self, watch::Receiver<UiState>) {
        let (cac, ui_rx) = CacMachine::new(send, timeouts);
        (
            Self {
                fc_deframer: Deframer::new(),
                gs_deframer: Deframer::new(),
                store: TelemetryStore::new(),
                cac,
                epoch: Instant::now(),
            },
            ui_rx,
        )
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.store.subscribe()
    }

    pub fn cac_mut(&mut self) -> &mut CacMachine<F> {
        &mut self.cac
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Feed raw bytes that arrived on `source`, decoding every complete COBS frame found
    /// within them and routing each to the parser, Stage-1 corrector, store, and CAC
    /// machine in arrival order.
    pub fn feed_bytes(&mut self, source: LinkSource, bytes: &[u8]) {
        let frames = match source {
            LinkSource::Fc => self.fc_deframer.push_bytes(bytes),
            LinkSource::Gs => self.gs_deframer.push_bytes(bytes),
        };
        for stuffed in frames {
            self.handle_frame(source, &stuffed);
        }
    }

    fn handle_frame(&mut self, source: LinkSource, stuffed: &[u8]) {
        let payload = match cobs::decode(stuffed) {
            Ok(p) => p,
            Err(e) => {
                warn!(?source, error = %e, "COBS decode failed, resetting link buffer");
                match source {
                    LinkSource::Fc => self.fc_deframer.reset(),
                    LinkSource::Gs => self.gs_deframer.reset(),
                }
                return;
            }
        };
        self.dispatch(source, payload);
    }

    fn dispatch(&mut self, source: LinkSource, payload: Vec<u8>) {
        let now = self.now_ms();
        let msg_id = match payload.first() {
            Some(&id) => id,
            None => return,
        };

        let mut msg = match protocol::parse(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(msg_id, error = %e, "structurally malformed packet, dropping");
                return;
            }
        };

        if source == LinkSource::Fc && !message_crc_ok(&msg) {
            match try_stage1_repair(&payload) {
                Some(repaired) => match protocol::parse(&repaired) {
                    Ok(fixed) => {
                        info!(msg_id, "stage-1 repaired a single-bit corruption");
                        msg = mark_corrected(fixed);
                    }
                    Err(_) => {
                        debug!(msg_id, "stage-1 repair produced an unparsable packet, dropping");
                        return;
                    }
                },
                None => {
                    debug!(msg_id, "crc mismatch and stage-1 repair failed, dropping packet");
                    return;
                }
            }
        }

        self.route_message(msg, now);
    }

    fn route_message(&mut self, msg: Message, now_ms: u64) {
        match msg {
            Message::FcFast(fast) => {
                self.cac.on_telemetry_status(&fast.status);
                self.store.update_from_fc_fast(&fast, now_ms);
            }
            Message::FcGps(gps) => self.store.update_from_gps(&gps),
            Message::FcEvent(ev) => {
                self.store.update_from_event(ev.event_type, ev.event_data, ev.time_s)
            }
            Message::GsTelem(telem) => {
                self.cac.on_telemetry_status(&telem.status);
                self.store.update_from_gs_telem(&telem, now_ms);
            }
            Message::AckArm(ack) => self.cac.on_ack_arm(&ack),
            Message::AckFire(ack) => self.cac.on_ack_fire(&ack),
            Message::Nack(nack) => self.cac.on_nack(&nack),
            Message::GsGps(_)
            | Message::GsEvent(_)
            | Message::GsStatus(_)
            | Message::GsCorrupt(_)
            | Message::AckConfig(_)
            | Message::Handshake(_) => {
                debug!("opaque pass-through message received, no local interpretation");
            }
            Message::Unknown { msg_id, bytes } => {
                debug!(msg_id, len = bytes.len(), "unknown msg-id, carried for forensic logging");
            }
        }
    }

    pub fn set_connection(&mut self, link: Link, connected: bool) {
        self.store.set_connection(link, connected);
    }

    fn timer_future(deadline: Option<Instant>) -> tokio::time::Sleep {
        tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE))
    }

    /// Drive the core's event loop: reads off both transports, ticks the stale timer at
    /// [`STALE_TICK_PERIOD`], and races the CAC machine's leg/overall/confirm timers. Runs
    /// until a transport read returns an error or is cancelled by the caller.
    pub async fn run<R1, R2>(&mut self, mut fc_reader: R1, mut gs_reader: R2) -> std::io::Result<()>
    where
        R1: AsyncRead + Unpin,
        R2: AsyncRead + Unpin,
    {
        let mut stale_ticker = tokio::time::interval(STALE_TICK_PERIOD);
        let mut fc_buf = [0u8; 4096];
        let mut gs_buf = [0u8; 4096];

        loop {
            let leg_sleep = Self::timer_future(self.cac.next_leg_deadline());
            let overall_sleep = Self::timer_future(self.cac.next_overall_deadline());
            let confirm_sleep = Self::timer_future(self.cac.next_confirm_deadline());

            tokio::select! {
                _ = stale_ticker.tick() => {
                    let now = self.now_ms();
                    self.store.tick_stale(now);
                }
                result = fc_reader.read(&mut fc_buf) => {
                    match result? {
                        0 => {
                            warn!("FC link closed");
                            self.store.set_connection(Link::Fc, false);
                        }
                        n => self.feed_bytes(LinkSource::Fc, &fc_buf[..n]),
                    }
                }
                result = gs_reader.read(&mut gs_buf) => {
                    match result? {
                        0 => {
                            warn!("GS relay link closed");
                            self.store.set_connection(Link::Gs, false);
                        }
                        n => self.feed_bytes(LinkSource::Gs, &gs_buf[..n]),
                    }
                }
                _ = leg_sleep => self.cac.on_leg_timeout(),
                _ = overall_sleep => self.cac.on_overall_timeout(),
                _ = confirm_sleep => self.cac.on_confirm_elapsed(),
            }
        }
    }
}
