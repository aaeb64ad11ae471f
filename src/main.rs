use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use liverelay_mesh::media::SyntheticDevices;
use liverelay_mesh::rtc::WebRtcConnectionFactory;
use liverelay_mesh::{join, Config, EventBus, MeetingHandle, MeetingState};

// ─── Event log ──────────────────────────────────────────────────────────────

/// Print every meeting event as one JSON line on stdout.
fn spawn_event_printer(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(evt) => match serde_json::to_string(&evt) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("event not serializable: {e}"),
                },
                Err(RecvError::Lagged(n)) => warn!("event printer lagged, {n} events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

// ─── Console commands ───────────────────────────────────────────────────────

/// Handle one console line.  Returns `false` once the user asked to leave.
async fn run_command(handle: &MeetingHandle, line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    let result = match words.as_slice() {
        [] => return true,
        ["share"] => handle
            .toggle_screen_share()
            .await
            .map(|on| info!("screen sharing: {on}")),
        ["mic", arg @ ("on" | "off")] => handle
            .set_microphone(*arg == "on")
            .await
            .map(|ok| if !ok { warn!("no microphone") }),
        ["camera", arg @ ("on" | "off")] => handle
            .set_camera(*arg == "on")
            .await
            .map(|ok| if !ok { warn!("no camera") }),
        ["status"] => handle.snapshot().await.map(|snap| {
            match serde_json::to_string_pretty(&snap) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!("snapshot not serializable: {e}"),
            }
        }),
        ["leave"] | ["quit"] => return false,
        _ => {
            warn!("unknown command '{line}' (share | mic on|off | camera on|off | status | leave)");
            return true;
        }
    };
    if let Err(e) = result {
        warn!("{line}: {e}");
    }
    true
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    // DTLS needs a process-wide crypto provider before any connection exists.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("a rustls crypto provider was already installed");
    }

    // Configuration comes first: it decides the log filter.
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over LIVERELAY_LOG_LEVEL when both are set.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();
    cfg.log_summary();

    let factory = match WebRtcConnectionFactory::new(&cfg) {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            error!("webrtc setup failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let devices = Arc::new(SyntheticDevices::new(cfg.devices));

    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus);

    let (handle, session) = match join(&cfg, factory, devices, bus).await {
        Ok(joined) => joined,
        Err(e) => {
            error!("could not join room '{}': {e}", cfg.room_id);
            return ExitCode::FAILURE;
        }
    };
    info!(room_id = %cfg.room_id, "joining as {}", cfg.display_name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            state = handle.wait_for(MeetingState::is_terminal) => {
                info!(state = ?state, "meeting ended");
                break;
            }
        }
    }

    let final_state = match handle.leave().await {
        Ok(()) => handle.state(),
        Err(e) => {
            warn!("leave failed: {e}");
            handle.state()
        }
    };
    drop(handle);
    let _ = session.await;
    printer.abort();

    if final_state == MeetingState::Error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
