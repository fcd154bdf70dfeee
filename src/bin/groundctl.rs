//! Ground-station CLI: connects to a TCP endpoint presenting the FC/GS byte stream, issues
//! `arm`/`fire`/`abort`/`reset` subcommands through the CAC machine, and prints live
//! telemetry as it arrives.

use std::time::Duration;

use clap::{App, Arg, SubCommand};
use colored::*;
use groundstation_core::gs_core::{GroundStationCore, LinkSource};
use groundstation_core::settings::GroundStationConfig;
use groundstation_core::telemetry::Snapshot;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8090";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("groundctl")
        .version("0.1.0")
        .author("Mission Control Systems Team")
        .about("Ground-station CLI for arming, firing, and monitoring the flight computer")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Flight computer link host")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Flight computer link port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("PATH")
                .help("Load CAC timeouts and endpoints from a JSON settings file")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("arm")
                .about("Arm or disarm a pyro channel")
                .arg(Arg::with_name("channel").required(true).help("Channel 1-4"))
                .arg(
                    Arg::with_name("disarm")
                        .long("disarm")
                        .help("Disarm instead of arm"),
                ),
        )
        .subcommand(
            SubCommand::with_name("fire")
                .about("Fire a pyro channel")
                .arg(Arg::with_name("channel").required(true).help("Channel 1-4"))
                .arg(
                    Arg::with_name("duration_ms")
                        .required(true)
                        .help("Fire duration in milliseconds (0-255)"),
                ),
        )
        .subcommand(SubCommand::with_name("abort").about("Abort the in-flight command"))
        .subcommand(SubCommand::with_name("monitor").about("Stream live telemetry"))
        .get_matches();

    let settings = match matches.value_of("config") {
        Some(path) => match GroundStationConfig::load_from_file(path) {
            Ok(cfg) => {
                println!("{}", format!("loaded settings from {path}").green());
                cfg
            }
            Err(e) => {
                eprintln!("{}", format!("failed to load {path}: {e}, using defaults").red());
                GroundStationConfig::default()
            }
        },
        None => GroundStationConfig::default(),
    };

    let addr = match (matches.value_of("host"), matches.value_of("port")) {
        (Some(host), Some(port)) if host != DEFAULT_HOST || port != DEFAULT_PORT => {
            format!("{host}:{port}")
        }
        _ => settings.fc_endpoint.clone(),
    };

    let fc_stream = TcpStream::connect(&addr).await?;
    println!("{}", format!("connected to flight computer at {addr}").green());

    let (fc_reader, mut fc_writer) = fc_stream.into_split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = send_rx.recv().await {
            if fc_writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let (mut core, mut ui_rx) = GroundStationCore::new(
        move |bytes| {
            let _ = send_tx.send(bytes);
        },
        settings.cac_timeouts(),
    );

    let mut telemetry_rx = core.subscribe();
    let gs_stub = tokio::io::empty();

    match matches.subcommand() {
        ("arm", Some(sub)) => {
            let channel: u8 = sub.value_of("channel").unwrap_or("1").parse()?;
            let arm = !sub.is_present("disarm");
            core.cac_mut().cmd_arm(channel, arm)?;
            println!("{}", format!("sent {} for channel {channel}", if arm { "ARM" } else { "DISARM" }).yellow());
            run_until_terminal(&mut core, fc_reader, gs_stub, &mut ui_rx).await?;
        }
        ("fire", Some(sub)) => {
            let channel: u8 = sub.value_of("channel").unwrap_or("1").parse()?;
            let duration_ms: u32 = sub.value_of("duration_ms").unwrap_or("0").parse()?;
            core.cac_mut().cmd_fire(channel, duration_ms)?;
            println!("{}", format!("sent FIRE for channel {channel}, {duration_ms}ms").yellow());
            run_until_terminal(&mut core, fc_reader, gs_stub, &mut ui_rx).await?;
        }
        ("abort", Some(_)) => {
            core.cac_mut().abort();
            println!("{}", "abort sent".red());
        }
        ("monitor", Some(_)) => {
            let monitor_task = tokio::spawn(async move {
                loop {
                    if telemetry_rx.changed().await.is_err() {
                        break;
                    }
                    print_snapshot(&telemetry_rx.borrow());
                }
            });
            core.run(fc_reader, gs_stub).await?;
            monitor_task.abort();
        }
        _ => {
            println!("{}", "no subcommand given; use --help".yellow());
        }
    }

    writer_task.abort();
    Ok(())
}

async fn run_until_terminal<R1, R2>(
    core: &mut GroundStationCore<impl FnMut(Vec<u8>) + Send + 'static>,
    fc_reader: R1,
    gs_reader: R2,
    ui_rx: &mut tokio::sync::watch::Receiver<groundstation_core::cac::UiState>,
) -> Result<(), Box<dyn std::error::Error>>
where
    R1: tokio::io::AsyncRead + Unpin,
    R2: tokio::io::AsyncRead + Unpin,
{
    let run = core.run(fc_reader, gs_reader);
    tokio::pin!(run);

    loop {
        tokio::select! {
            result = &mut run => {
                result?;
                break;
            }
            _ = ui_rx.changed() => {
                let state = ui_rx.borrow().clone();
                if !state.busy {
                    if let Some(err) = &state.error {
                        println!("{}", format!("FAILED: {err}").red());
                    } else {
                        println!("{}", "command complete".green());
                    }
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(11_000)) => {
                println!("{}", "timed out waiting for command completion".red());
                break;
            }
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "{} alt={:>8.1}m  vel={:>7.1}m/s  mach={:>4.2}  batt={:>4.1}V  state={:?}  seq={}",
        "TELEM".cyan(),
        snapshot.alt_m,
        snapshot.vel_mps,
        snapshot.mach,
        snapshot.batt_v,
        snapshot.fsm_state,
        snapshot.seq,
    );
}
