//! tabtime daemon entrypoint.
//!
//! A small, single-writer service that owns browsing-time state. Requests
//! arrive on a Unix socket as newline-delimited JSON; every state change is
//! forwarded to one signal worker so sessions never interleave.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chrono::NaiveDate;
use tabtime_daemon_protocol::{
    parse_command, parse_message, parse_register_domain, parse_signal, Command, CommandStatus,
    ErrorInfo, Message, Method, Request, Response, SignalEnvelope, SignalType, Visibility,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use tracker_core::{DispatchHandle, ExportOutcome, Signal, TrackerConfig};

mod db;
mod state;

use db::Db;
use state::DaemonState;

const SOCKET_NAME: &str = "daemon.sock";
const SOCKET_ENV: &str = "TABTIME_DAEMON_SOCKET";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let config = match tracker_core::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            TrackerConfig::default()
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let daemon_state = match DaemonState::start(db, &config) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "Failed to start signal worker");
            std::process::exit(1);
        }
    };
    state::spawn_heartbeat(
        daemon_state.dispatch().clone(),
        config.heartbeat_interval(),
    );

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        grace_period_secs = config.grace_period_secs,
        heartbeat_interval_secs = config.heartbeat_interval_secs,
        "tabtime daemon started"
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&daemon_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("TABTIME_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Ok(value) = env::var(SOCKET_ENV) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabtime").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabtime").join("daemon").join("state.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<DaemonState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &DaemonState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let tracking = state
                .dispatch()
                .tracking_snapshot()
                .ok()
                .and_then(|snapshot| snapshot.tracking)
                .map(|tracking| tracking.domain_id);
            Response::ok(
                request.id,
                serde_json::json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                    "tracking": tracking,
                }),
            )
        }
        Method::GetTrackingState => match state.dispatch().tracking_snapshot() {
            Ok(snapshot) => to_response(request.id, &snapshot.tracking, "tracking state"),
            Err(err) => Response::error(request.id, "worker_unavailable", err.to_string()),
        },
        Method::Signal => handle_signal(request, state),
        Method::Message => handle_message(request, state),
        Method::Command => handle_command(request, state),
        Method::RegisterDomain => handle_register_domain(request, state),
    }
}

fn handle_signal(request: Request, state: &DaemonState) -> Response {
    let Some(params) = request.params else {
        return Response::error(request.id, "invalid_params", "signal payload is required");
    };
    let envelope = match parse_signal(params) {
        Ok(envelope) => envelope,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    info!(
        event_id = %envelope.event_id,
        signal = ?envelope.signal,
        tab_id = ?envelope.tab_id,
        recorded_at = %envelope.recorded_at,
        "Received signal"
    );

    match forward_signal(state.dispatch(), core_signal(envelope)) {
        Ok(()) => Response::ok(request.id, serde_json::json!({ "accepted": true })),
        Err(err) => Response::error(request.id, "worker_unavailable", err.to_string()),
    }
}

fn handle_message(request: Request, state: &DaemonState) -> Response {
    let Some(params) = request.params else {
        return Response::error(request.id, "invalid_params", "message payload is required");
    };
    let message = match parse_message(params) {
        Ok(message) => message,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    let dispatch = state.dispatch();
    let signal = match message {
        Message::StartTracking {
            category,
            domain_id,
        } => Signal::StartRequested {
            category,
            domain_id,
        },
        Message::StopTracking => Signal::StopRequested,
        Message::VisibilityChanged { state: visibility } => Signal::VisibilityChanged {
            state: core_visibility(visibility),
            tab_id: None,
            url: None,
        },
        Message::GetBrowsingData { date } => {
            let date = match date.as_deref().map(parse_date).transpose() {
                Ok(date) => date,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            return match dispatch.browsing_data(date) {
                Ok(records) => {
                    tracing::debug!(records = records.len(), "Browsing data snapshot");
                    to_response(request.id, &records, "browsing data")
                }
                Err(err) => Response::error(
                    request.id,
                    "browsing_data_error",
                    format!("Failed to fetch browsing data: {}", err),
                ),
            };
        }
    };

    info!(signal = signal.name(), "Received message");
    match forward_signal(dispatch, signal) {
        Ok(()) => Response::ok(request.id, serde_json::json!({ "accepted": true })),
        Err(err) => Response::error(request.id, "worker_unavailable", err.to_string()),
    }
}

fn handle_command(request: Request, state: &DaemonState) -> Response {
    let Some(params) = request.params else {
        return Response::error(request.id, "invalid_params", "command payload is required");
    };
    let command = match parse_command(params) {
        Ok(command) => command,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    let status = match command {
        Command::SyncToDrive { date } => {
            let date = match date.as_deref().map(parse_date).transpose() {
                Ok(date) => date,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.dispatch().sync_to_drive(date) {
                Ok(ExportOutcome::Uploaded { name, records, .. }) => {
                    info!(name = %name, records, "Sync to drive succeeded");
                    CommandStatus::success()
                }
                Ok(ExportOutcome::Empty) => CommandStatus {
                    detail: Some("No data to sync".to_string()),
                    ..CommandStatus::success()
                },
                Err(err) => {
                    warn!(error = %err, "Sync to drive failed");
                    CommandStatus::failure(err.to_string())
                }
            }
        }
    };

    to_response(request.id, &status, "command status")
}

fn handle_register_domain(request: Request, state: &DaemonState) -> Response {
    let Some(params) = request.params else {
        return Response::error(request.id, "invalid_params", "domain payload is required");
    };
    let parsed = match parse_register_domain(params) {
        Ok(parsed) => parsed,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    match state
        .dispatch()
        .register_domain(&parsed.domain, &parsed.category, parsed.subcategories)
    {
        Ok(info) => {
            info!(domain_id = %info.domain_id, "Domain registered");
            to_response(request.id, &info, "domain info")
        }
        Err(err) => Response::error(
            request.id,
            "register_error",
            format!("Failed to register domain: {}", err),
        ),
    }
}

/// Stops triggered by unload or an explicit request are applied before the
/// reply goes out; the page may be gone by the time a queued stop would run.
fn forward_signal(dispatch: &DispatchHandle, signal: Signal) -> tracker_core::Result<()> {
    if waits_for_worker(&signal) {
        dispatch.signal_and_wait(signal)
    } else {
        dispatch.signal(signal)
    }
}

fn waits_for_worker(signal: &Signal) -> bool {
    matches!(signal, Signal::Unload { .. } | Signal::StopRequested)
}

fn core_signal(envelope: SignalEnvelope) -> Signal {
    // Required fields were checked by `SignalEnvelope::validate`.
    let tab_id = envelope.tab_id.unwrap_or_default();
    let url = envelope.url.clone().unwrap_or_default();
    match envelope.signal {
        SignalType::TabActivated => Signal::TabActivated { tab_id, url },
        SignalType::FocusGained => Signal::FocusGained { tab_id, url },
        SignalType::FocusLost => Signal::FocusLost,
        SignalType::TabDeactivated => Signal::TabDeactivated { tab_id },
        SignalType::VisibilityChanged => Signal::VisibilityChanged {
            state: core_visibility(envelope.state.unwrap_or(Visibility::Visible)),
            tab_id: envelope.tab_id,
            url: envelope.url,
        },
        SignalType::Unload => Signal::Unload {
            tab_id: envelope.tab_id,
        },
    }
}

fn core_visibility(state: Visibility) -> tracker_core::Visibility {
    match state {
        Visibility::Visible => tracker_core::Visibility::Visible,
        Visibility::Hidden => tracker_core::Visibility::Hidden,
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, ErrorInfo> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ErrorInfo::new("invalid_date", "date must be formatted as YYYY-MM-DD"))
}

fn to_response<T: serde::Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
