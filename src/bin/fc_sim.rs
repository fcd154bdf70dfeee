//! A minimal flight-computer simulator over TCP: emits COBS-framed `FC_FAST`/`FC_GPS`
//! telemetry at 10 Hz and answers `CMD_ARM`/`CMD_FIRE`/`CONFIRM`/`ABORT` with the matching
//! ACK, for exercising the ground-station core end-to-end without real hardware.

use std::sync::Arc;
use std::time::Duration;

use groundstation_core::cobs;
use groundstation_core::quaternion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{error, info, warn};

const TCP_PORT: u16 = 8090;

#[derive(Debug, Clone, Copy, Default)]
struct FcState {
    alt_m: f32,
    vel_mps: f32,
    time_s: f32,
    seq: u8,
    armed: [bool; 4],
    continuity: [bool; 4],
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Flight computer simulator");
    println!("==========================");

    let state = Arc::new(Mutex::new(FcState {
        continuity: [true; 4],
        ..FcState::default()
    }));

    let listener = TcpListener::bind(format!("127.0.0.1:{TCP_PORT}")).await?;
    info!("listening on 127.0.0.1:{TCP_PORT}");

    loop {
        let (socket, addr) = listener.accept().await?;
        info!(%addr, "ground station connected");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, state).await {
                error!(error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    state: Arc<Mutex<FcState>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let telemetry_writer = Arc::clone(&writer);
    let telemetry_state = Arc::clone(&state);
    let telemetry_task = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            let frame = {
                let mut guard = telemetry_state.lock().await;
                guard.time_s += 0.1;
                guard.seq = guard.seq.wrapping_add(1);
                build_fc_fast(&guard)
            };
            let mut w = telemetry_writer.lock().await;
            if w.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut buf = [0u8; 1024];
    let mut deframer = cobs::Deframer::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            warn!("ground station disconnected");
            break;
        }
        for frame in deframer.push_bytes(&buf[..n]) {
            if let Ok(payload) = cobs::decode(&frame) {
                if let Some(response) = handle_command(&payload, &state).await {
                    let mut w = writer.lock().await;
                    w.write_all(&response).await?;
                }
            }
        }
    }

    telemetry_task.abort();
    Ok(())
}

async fn handle_command(payload: &[u8], state: &Arc<Mutex<FcState>>) -> Option<Vec<u8>> {
    let msg_id = *payload.first()?;
    match msg_id {
        0x80 if payload.len() >= 12 => {
            let nonce = u16::from_le_bytes([payload[3], payload[4]]);
            let channel = payload[5];
            let action = payload[6];
            let mut guard = state.lock().await;
            guard.armed[channel as usize % 4] = action == 1;
            let ack = with_crc(build_ack_arm(nonce, channel, action, guard.continuity[channel as usize % 4]));
            Some(stuff_frame(&ack))
        }
        0x81 if payload.len() >= 13 => {
            let nonce = u16::from_le_bytes([payload[3], payload[4]]);
            let channel = payload[5];
            let duration = payload[6];
            let mut guard = state.lock().await;
            guard.continuity[channel as usize % 4] = false;
            let ack = with_crc(build_ack_fire(nonce, channel, duration, guard.continuity[channel as usize % 4]));
            Some(stuff_frame(&ack))
        }
        0xF0 | 0xF1 => None, // CONFIRM / ABORT: no response expected
        _ => None,
    }
}

fn build_fc_fast(state: &FcState) -> Vec<u8> {
    let status: u16 = 0x0001; // PAD state, CNT1 set
    let mut buf = vec![0x01u8];
    buf.extend_from_slice(&status.to_le_bytes());
    buf.extend_from_slice(&(state.alt_m as i16).to_le_bytes());
    buf.extend_from_slice(&((state.vel_mps * 10.0) as i16).to_le_bytes());
    buf.extend_from_slice(&quaternion::pack(quaternion::IDENTITY));
    buf.extend_from_slice(&((state.time_s * 10.0) as u16).to_le_bytes());
    buf.push(100); // battery raw
    buf.push(state.seq);
    let frame = with_crc(buf);
    stuff_frame(&frame)
}

fn stuff_frame(frame: &[u8]) -> Vec<u8> {
    let mut stuffed = cobs::encode(frame);
    stuffed.push(0x00);
    stuffed
}

fn build_ack_arm(nonce: u16, channel: u8, action: u8, continuity: bool) -> Vec<u8> {
    vec![0xA0, nonce as u8, (nonce >> 8) as u8, channel, action, action, continuity as u8, 0]
}

fn build_ack_fire(nonce: u16, channel: u8, duration: u8, continuity: bool) -> Vec<u8> {
    vec![
        0xA1,
        nonce as u8,
        (nonce >> 8) as u8,
        channel,
        duration,
        0b10,
        continuity as u8,
        0,
        0,
    ]
}

fn with_crc(mut buf: Vec<u8>) -> Vec<u8> {
    let crc = groundstation_core::crc::compute(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}
