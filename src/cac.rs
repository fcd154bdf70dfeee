//! The Command-Acknowledge-Confirm state machine: enforces at-most-one in-flight pyro
//! command, verifies the FC's echoed fields, retransmits on a leg timer, and treats a
//! telemetry status update that already reflects the requested change as a parallel ACK.

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

use crate::protocol::{self, AckArm, AckFire, Nack};
use crate::quaternion::StatusBitmap;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacError {
    #[error("a command is already in flight")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SendingCmd,
    AwaitingAck,
    VerifyingAck,
    SendingConfirm,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Arm { channel: u8, arm: bool },
    Fire { channel: u8, duration_ms: u8 },
}

#[derive(Debug, Clone)]
struct Request {
    nonce: u16,
    kind: CommandKind,
    bytes: Vec<u8>,
    retry_count: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UiState {
    pub busy: bool,
    pub command_type: Option<&'static str>,
    pub target_channel: Option<u8>,
    pub error: Option<String>,
    pub nack_code: Option<u8>,
    pub retry_count: u8,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            busy: false,
            command_type: None,
            target_channel: None,
            error: None,
            nack_code: None,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacEvent {
    PhaseChange(Phase),
    Complete,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct CacTimeouts {
    pub leg: Duration,
    pub overall: Duration,
    pub confirm: Duration,
    pub retry_cap: u8,
}

impl Default for CacTimeouts {
    fn default() -> Self {
        Self {
            leg: Duration::from_millis(2_000),
            overall: Duration::from_millis(10_000),
            confirm: Duration::from_millis(1_000),
            retry_cap: 10,
        }
    }
}

/// Owns exactly one in-flight command at a time. `send` is the single writer to the
/// transport; parsers stay pure and never call it.
pub struct CacMachine<F>
where
    F: FnMut(Vec<u8>) + Send + 'static,
{
    phase: Phase,
    request: Option<Request>,
    send: F,
    timeouts: CacTimeouts,
    leg_deadline: Option<Instant>,
    overall_deadline: Option<Instant>,
    confirm_deadline: Option<Instant>,
    ui_tx: watch::Sender<UiState>,
    event_tx: Option<mpsc::UnboundedSender<CacEvent>>,
}

impl<F> CacMachine<F>
where
    F: FnMut(Vec<u8>) + Send + 'static,
{
    pub fn new(send: F, timeouts: CacTimeouts) -> (Self, watch::Receiver<UiState>) {
        let (ui_tx, ui_rx) = watch::channel(UiState::default());
        (
            Self {
                phase: Phase::Idle,
                request: None,
                send,
                timeouts,
                leg_deadline: None,
                overall_deadline: None,
                confirm_deadline: None,
                ui_tx,
                event_tx: None,
            },
            ui_rx,
        )
    }

    pub fn with_events(mut self) -> (Self, mpsc::UnboundedReceiver<CacEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        (self, rx)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ui_state(&self) -> UiState {
        self.ui_tx.borrow().clone()
    }

    pub fn next_leg_deadline(&self) -> Option<Instant> {
        self.leg_deadline
    }

    pub fn next_overall_deadline(&self) -> Option<Instant> {
        self.overall_deadline
    }

    pub fn next_confirm_deadline(&self) -> Option<Instant> {
        self.confirm_deadline
    }

    fn is_available(&self) -> bool {
        matches!(self.phase, Phase::Idle | Phase::Complete | Phase::Failed)
    }

    fn emit(&mut self, event: CacEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.emit(CacEvent::PhaseChange(phase));
    }

    fn push_ui(&mut self, error: Option<String>, nack_code: Option<u8>) {
        let (command_type, target_channel, retry_count) = match (&self.request, self.phase) {
            (Some(req), _) => {
                let (ct, ch) = match req.kind {
                    CommandKind::Arm { channel, arm } => {
                        (if arm { "arm" } else { "disarm" }, channel)
                    }
                    CommandKind::Fire { channel, .. } => ("fire", channel),
                };
                (Some(ct), Some(ch), req.retry_count)
            }
            (None, _) => (None, None, 0),
        };
        let busy = !self.is_available();
        let _ = self.ui_tx.send(UiState {
            busy,
            command_type,
            target_channel,
            error,
            nack_code,
            retry_count,
        });
    }

    fn clear_timers(&mut self) {
        self.leg_deadline = None;
        self.overall_deadline = None;
        self.confirm_deadline = None;
    }

    fn fail(&mut self, message: impl Into<String>, nack_code: Option<u8>) {
        self.clear_timers();
        self.set_phase(Phase::Failed);
        let message = message.into();
        self.push_ui(Some(message.clone()), nack_code);
        self.emit(CacEvent::Failed(message));
    }

    fn start(&mut self, nonce: u16, kind: CommandKind, bytes: Vec<u8>) {
        (self.send)(bytes.clone());
        self.request = Some(Request {
            nonce,
            kind,
            bytes,
            retry_count: 0,
        });
        self.set_phase(Phase::SendingCmd);
        let now = Instant::now();
        self.leg_deadline = Some(now + self.timeouts.leg);
        self.overall_deadline = Some(now + self.timeouts.overall);
        self.set_phase(Phase::AwaitingAck);
        self.push_ui(None, None);
    }

    pub fn cmd_arm(&mut self, channel: u8, arm: bool) -> Result<(), CacError> {
        if !self.is_available() {
            return Err(CacError::Busy);
        }
        let channel0 = channel.saturating_sub(1);
        let nonce = protocol::generate_nonce();
        let bytes = protocol::build_cmd_arm(nonce, channel0, arm);
        self.start(nonce, CommandKind::Arm { channel: channel0, arm }, bytes);
        Ok(())
    }

    pub fn cmd_fire(&mut self, channel: u8, duration_ms: u32) -> Result<(), CacError> {
        if !self.is_available() {
            return Err(CacError::Busy);
        }
        let channel0 = channel.saturating_sub(1);
        let clamped_duration = duration_ms.min(255) as u8;
        let nonce = protocol::generate_nonce();
        let bytes = protocol::build_cmd_fire(nonce, channel0, duration_ms);
        self.start(
            nonce,
            CommandKind::Fire {
                channel: channel0,
                duration_ms: clamped_duration,
            },
            bytes,
        );
        Ok(())
    }

    fn advance_to_verifying(&mut self) {
        self.leg_deadline = None;
        self.confirm_deadline = Some(Instant::now() + self.timeouts.confirm);
        self.set_phase(Phase::VerifyingAck);
        self.push_ui(None, None);
    }

    pub fn on_ack_arm(&mut self, ack: &AckArm) {
        if self.phase != Phase::AwaitingAck {
            return;
        }
        let Some(request) = self.request.clone() else { return };
        if ack.nonce != request.nonce {
            return;
        }
        let CommandKind::Arm { channel, arm } = request.kind else {
            return;
        };
        let expected_action = if arm { 1 } else { 0 };
        if ack.echo_channel == channel && ack.echo_action == expected_action {
            self.advance_to_verifying();
        } else {
            self.fail(
                format!(
                    "echo mismatch: expected channel={channel} action={expected_action}, got channel={} action={}",
                    ack.echo_channel, ack.echo_action
                ),
                None,
            );
            (self.send)(protocol::build_abort(request.nonce));
        }
    }

    pub fn on_ack_fire(&mut self, ack: &AckFire) {
        if self.phase != Phase::AwaitingAck {
            return;
        }
        let Some(request) = self.request.clone() else { return };
        if ack.nonce != request.nonce {
            return;
        }
        let CommandKind::Fire { channel, duration_ms } = request.kind else {
            return;
        };
        if ack.echo_channel == channel && ack.echo_duration == duration_ms {
            self.advance_to_verifying();
        } else {
            self.fail(
                format!(
                    "echo mismatch: expected channel={channel} duration={duration_ms}, got channel={} duration={}",
                    ack.echo_channel, ack.echo_duration
                ),
                None,
            );
            (self.send)(protocol::build_abort(request.nonce));
        }
    }

    pub fn on_nack(&mut self, nack: &Nack) {
        if self.phase != Phase::AwaitingAck {
            return;
        }
        let Some(request) = &self.request else { return };
        if nack.nonce != request.nonce {
            return;
        }
        let code = nack.error_code;
        self.fail(
            format!("NACK: {} (0x{code:02X})", protocol::nack_code_text(code)),
            Some(code),
        );
    }

    /// Telemetry-as-parallel-ACK: an ARM/DISARM command can be confirmed by the periodic
    /// status bitmap alone, absorbing a lost ACK packet.
    pub fn on_telemetry_status(&mut self, status: &StatusBitmap) {
        if self.phase != Phase::AwaitingAck {
            return;
        }
        let Some(request) = &self.request else { return };
        if let CommandKind::Arm { channel, arm } = request.kind {
            if status.armed[channel as usize] == arm {
                self.advance_to_verifying();
            }
        }
    }

    pub fn on_leg_timeout(&mut self) {
        if self.phase != Phase::AwaitingAck {
            return;
        }
        let Some(request) = &mut self.request else { return };
        if request.retry_count >= self.timeouts.retry_cap {
            self.fail(
                format!("no ACK after {} retries", self.timeouts.retry_cap),
                None,
            );
            return;
        }
        request.retry_count += 1;
        let bytes = request.bytes.clone();
        (self.send)(bytes);
        self.leg_deadline = Some(Instant::now() + self.timeouts.leg);
        self.push_ui(None, None);
    }

    pub fn on_overall_timeout(&mut self) {
        if matches!(self.phase, Phase::Idle | Phase::Complete | Phase::Failed) {
            return;
        }
        self.fail("overall timeout", None);
    }

    pub fn on_confirm_elapsed(&mut self) {
        if self.phase != Phase::VerifyingAck {
            return;
        }
        let Some(request) = &self.request else { return };
        (self.send)(protocol::build_confirm(request.nonce));
        self.set_phase(Phase::SendingConfirm);
        self.clear_timers();
        self.set_phase(Phase::Complete);
        self.emit(CacEvent::Complete);
        self.push_ui(None, None);
        self.request = None;
        self.set_phase(Phase::Idle);
        self.push_ui(None, None);
    }

    /// Idempotent; valid from every non-idle state.
    pub fn abort(&mut self) {
        if self.phase == Phase::Idle {
            return;
        }
        if let Some(request) = &self.request {
            (self.send)(protocol::build_abort(request.nonce));
        }
        self.fail("aborted by operator", None);
    }

    pub fn reset(&mut self) {
        self.clear_timers();
        self.request = None;
        self.phase = Phase::Idle;
        self.push_ui(None, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn harness() -> (CacMachine<impl FnMut(Vec<u8>) + Send + 'static>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let (machine, _ui_rx) = CacMachine::new(
            move |bytes| sent_clone.lock().unwrap().push(bytes),
            CacTimeouts::default(),
        );
        (machine, sent)
    }

    fn ack_arm_for(bytes: &[u8], echo_channel: u8, echo_action: u8) -> AckArm {
        let nonce = u16::from_le_bytes([bytes[3], bytes[4]]);
        AckArm {
            nonce,
            echo_channel,
            echo_action,
            arm_state: echo_action,
            cont_state: 1,
            crc_ok: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn arm_happy_path_sends_confirm_after_one_second() {
        let (mut machine, sent) = harness();
        machine.cmd_arm(2, true).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(sent.lock().unwrap()[0].len(), 12);

        let cmd_bytes = sent.lock().unwrap()[0].clone();
        let ack = ack_arm_for(&cmd_bytes, 1, 1);
        machine.on_ack_arm(&ack);
        assert_eq!(machine.phase(), Phase::VerifyingAck);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        machine.on_confirm_elapsed();

        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(sent.lock().unwrap()[1][0], 0xF0);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_failure_carries_structured_error() {
        let (mut machine, sent) = harness();
        machine.cmd_arm(1, true).unwrap();
        let cmd_bytes = sent.lock().unwrap()[0].clone();
        let nonce = u16::from_le_bytes([cmd_bytes[3], cmd_bytes[4]]);

        machine.on_nack(&Nack {
            nonce,
            error_code: 0x03,
            crc_ok: true,
        });

        assert_eq!(machine.phase(), Phase::Failed);
        let ui = machine.ui_state();
        assert_eq!(ui.nack_code, Some(3));
        assert!(ui.error.unwrap().contains("not armed"));
    }

    #[tokio::test(start_paused = true)]
    async fn echo_mismatch_sends_abort_and_fails() {
        let (mut machine, sent) = harness();
        machine.cmd_arm(1, true).unwrap();
        let cmd_bytes = sent.lock().unwrap()[0].clone();
        let ack = ack_arm_for(&cmd_bytes, 1, 1); // wrong channel, should be 0
        machine.on_ack_arm(&ack);

        assert_eq!(machine.phase(), Phase::Failed);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1][0], 0xF1);
    }

    #[tokio::test(start_paused = true)]
    async fn leg_timeout_retransmits_then_succeeds() {
        let (mut machine, sent) = harness();
        machine.cmd_arm(1, true).unwrap();
        let cmd_bytes = sent.lock().unwrap()[0].clone();

        tokio::time::advance(Duration::from_millis(2_000)).await;
        machine.on_leg_timeout();
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(sent.lock().unwrap()[1], cmd_bytes);

        let ack = ack_arm_for(&cmd_bytes, 0, 1);
        machine.on_ack_arm(&ack);
        assert_eq!(machine.phase(), Phase::VerifyingAck);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        machine.on_confirm_elapsed();
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_as_parallel_ack_advances_without_ack_packet() {
        let (mut machine, _sent) = harness();
        machine.cmd_arm(1, true).unwrap();

        let status = crate::quaternion::StatusBitmap {
            continuity: [false; 4],
            armed: [true, false, false, false],
            fsm_state: crate::quaternion::FsmState::Pad,
            fired: false,
            error: false,
        };
        machine.on_telemetry_status(&status);
        assert_eq!(machine.phase(), Phase::VerifyingAck);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        machine.on_confirm_elapsed();
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_rejects_new_command_while_in_flight() {
        let (mut machine, _sent) = harness();
        machine.cmd_arm(1, true).unwrap();
        assert_eq!(machine.cmd_fire(2, 100), Err(CacError::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_fails_regardless_of_leg_progress() {
        let (mut machine, _sent) = harness();
        machine.cmd_arm(1, true).unwrap();
        tokio::time::advance(Duration::from_millis(10_001)).await;
        machine.on_overall_timeout();
        assert_eq!(machine.phase(), Phase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_idempotent_from_idle() {
        let (mut machine, sent) = harness();
        machine.abort();
        assert_eq!(machine.phase(), Phase::Idle);
        assert!(sent.lock().unwrap().is_empty());
    }
}
