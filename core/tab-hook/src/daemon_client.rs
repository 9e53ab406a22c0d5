//! Client helper for talking to the tabtime daemon.
//!
//! The daemon is the only writer. Failures are surfaced to the caller; there
//! is no local fallback store.

use chrono::Utc;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use tabtime_daemon_protocol::{
    Command, CommandStatus, Message, Method, RegisterDomainParams, Request, Response,
    SignalEnvelope, SignalType, Visibility, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

const ENABLE_ENV: &str = "TABTIME_DAEMON_ENABLED";
const SOCKET_ENV: &str = "TABTIME_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
// Exports encrypt and write a file before replying.
const COMMAND_READ_TIMEOUT_MS: u64 = 10_000;
const RETRY_DELAY_MS: u64 = 50;

/// Fields of a browser signal as collected by the CLI or stdin handler.
#[derive(Debug, Clone, Default)]
pub struct SignalFields {
    pub tab_id: Option<i64>,
    pub url: Option<String>,
    pub state: Option<Visibility>,
}

pub fn send_signal(signal: SignalType, fields: SignalFields) -> Result<(), String> {
    ensure_enabled()?;

    let event_id = make_event_id(std::process::id());
    let recorded_at = Utc::now().to_rfc3339();
    let build_envelope = || SignalEnvelope {
        event_id: event_id.clone(),
        recorded_at: recorded_at.clone(),
        signal,
        tab_id: fields.tab_id,
        url: fields.url.clone(),
        state: fields.state,
    };

    send_signal_with_retry(build_envelope, signal)
}

/// Sends a cross-context message. Returns the daemon's `data` payload.
pub fn send_message(message: &Message) -> Result<Value, String> {
    ensure_enabled()?;
    let params = serde_json::to_value(message)
        .map_err(|err| format!("Failed to serialize message: {}", err))?;
    call(Method::Message, Some(params), READ_TIMEOUT_MS)
}

pub fn send_command(command: &Command) -> Result<CommandStatus, String> {
    ensure_enabled()?;
    let params = serde_json::to_value(command)
        .map_err(|err| format!("Failed to serialize command: {}", err))?;
    let data = call(Method::Command, Some(params), COMMAND_READ_TIMEOUT_MS)?;
    decode(data, "command status")
}

pub fn register_domain(params: &RegisterDomainParams) -> Result<Value, String> {
    ensure_enabled()?;
    let params = serde_json::to_value(params)
        .map_err(|err| format!("Failed to serialize domain: {}", err))?;
    call(Method::RegisterDomain, Some(params), READ_TIMEOUT_MS)
}

pub fn tracking_state() -> Result<Value, String> {
    ensure_enabled()?;
    call(Method::GetTrackingState, None, READ_TIMEOUT_MS)
}

pub fn daemon_health() -> Result<Value, String> {
    ensure_enabled()?;
    call(Method::GetHealth, None, READ_TIMEOUT_MS)
}

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

fn ensure_enabled() -> Result<(), String> {
    if daemon_enabled() {
        Ok(())
    } else {
        Err("Daemon disabled".to_string())
    }
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabtime").join(SOCKET_NAME))
}

fn call(method: Method, params: Option<Value>, read_timeout_ms: u64) -> Result<Value, String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(make_event_id(std::process::id())),
        params,
    };
    let response = send_request(request, read_timeout_ms)?;
    into_data(response)
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string()))
    }
}

fn decode<T: DeserializeOwned>(data: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(data).map_err(|err| format!("Failed to parse {}: {}", what, err))
}

fn send_signal_once(envelope: SignalEnvelope) -> Result<(), String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Signal,
        id: Some(envelope.event_id.clone()),
        params: Some(
            serde_json::to_value(envelope)
                .map_err(|err| format!("Failed to serialize signal: {}", err))?,
        ),
    };

    into_data(send_request(request, READ_TIMEOUT_MS)?).map(|_| ())
}

fn send_signal_with_retry<F>(mut build: F, signal: SignalType) -> Result<(), String>
where
    F: FnMut() -> SignalEnvelope,
{
    match send_signal_once(build()) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, signal = ?signal, "Failed to send signal to daemon");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_signal_once(build()).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    signal = ?signal,
                    "Retry failed sending signal to daemon"
                );
                retry_err
            })
        }
    }
}

fn send_request(request: Request, read_timeout_ms: u64) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(read_timeout_ms)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
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
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_event_id(pid: u32) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!("evt-{}-{}-{:x}", Utc::now().timestamp_millis(), pid, rand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    };
    use std::time::Instant;
    use tabtime_daemon_protocol::CommandOutcome;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }

        fn unset(key: &'static str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn socket_in_temp(prefix: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in("/tmp")
            .unwrap();
        let socket_path = dir.path().join("daemon.sock");
        (dir, socket_path)
    }

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }

        let newline_index = buffer.iter().position(|b| *b == b'\n');
        let request_bytes = match newline_index {
            Some(index) => &buffer[..index],
            None => buffer.as_slice(),
        };
        serde_json::from_slice(request_bytes).ok()
    }

    fn reply(stream: &mut UnixStream, response: &Response) {
        let mut payload = serde_json::to_vec(response).unwrap();
        payload.push(b'\n');
        let _ = stream.write_all(&payload);
    }

    #[test]
    fn send_signal_retries_after_daemon_error() {
        let _guard = env_lock();
        let (_dir, socket_path) = socket_in_temp("th-retry-");

        let listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        listener.set_nonblocking(true).unwrap();

        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = attempt_count.clone();

        let server = std::thread::spawn(move || {
            let start = Instant::now();
            let mut handled = 0;
            while handled < 2 && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        handled += 1;
                        attempt_count_clone.fetch_add(1, Ordering::SeqCst);
                        read_request(&mut stream);
                        let response = if handled == 1 {
                            Response::error(None, "test_error", "simulated")
                        } else {
                            Response::ok(None, serde_json::json!({"accepted": true}))
                        };
                        reply(&mut stream, &response);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());
        let _enabled_guard = EnvGuard::set(ENABLE_ENV, "1");

        let result = send_signal(SignalType::FocusLost, SignalFields::default());
        assert!(result.is_ok(), "{:?}", result);

        server.join().unwrap();
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signal_retry_reuses_same_event_id_after_lost_response() {
        let _guard = env_lock();
        let (_dir, socket_path) = socket_in_temp("th-lost-");

        let listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        listener.set_nonblocking(true).unwrap();

        let attempts: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));
        let attempts_clone = Arc::clone(&attempts);

        let server = std::thread::spawn(move || {
            let start = Instant::now();
            let mut handled = 0;
            while handled < 2 && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        handled += 1;
                        if let Some(request) = read_request(&mut stream) {
                            attempts_clone.lock().unwrap().push(request);
                        }
                        if handled == 2 {
                            reply(
                                &mut stream,
                                &Response::ok(None, serde_json::json!({"accepted": true})),
                            );
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());
        let _enabled_guard = EnvGuard::set(ENABLE_ENV, "1");

        let result = send_signal(
            SignalType::TabActivated,
            SignalFields {
                tab_id: Some(12),
                url: Some("https://cnn.com/".to_string()),
                state: None,
            },
        );
        assert!(result.is_ok(), "{:?}", result);
        server.join().unwrap();

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].id, attempts[1].id, "retry must reuse the event id");
        let envelope: SignalEnvelope =
            serde_json::from_value(attempts[1].params.clone().expect("params")).unwrap();
        assert_eq!(envelope.tab_id, Some(12));
        assert_eq!(envelope.url.as_deref(), Some("https://cnn.com/"));
        assert_eq!(Some(envelope.event_id), attempts[0].id);
    }

    #[test]
    fn command_status_is_decoded() {
        let _guard = env_lock();
        let (_dir, socket_path) = socket_in_temp("th-command-");
        let listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

        let server = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let request = read_request(&mut stream).expect("request");
                assert_eq!(request.method, Method::Command);
                let params = request.params.expect("params");
                assert_eq!(params["command"], "syncToDrive");
                reply(
                    &mut stream,
                    &Response::ok(None, serde_json::json!({"status": "failure", "detail": "drive offline"})),
                );
            }
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());
        let _enabled_guard = EnvGuard::set(ENABLE_ENV, "1");
        let status = send_command(&Command::SyncToDrive { date: None }).expect("status");
        server.join().unwrap();

        assert_eq!(status.status, CommandOutcome::Failure);
        assert_eq!(status.detail.as_deref(), Some("drive offline"));
    }

    #[test]
    fn disabled_daemon_short_circuits() {
        let _guard = env_lock();
        let _set = EnvGuard::set(ENABLE_ENV, "0");
        assert_eq!(
            send_message(&Message::StopTracking).unwrap_err(),
            "Daemon disabled"
        );
    }

    #[test]
    fn daemon_enabled_defaults_to_true_when_env_missing() {
        let _guard = env_lock();
        let _unset = EnvGuard::unset(ENABLE_ENV);
        assert!(daemon_enabled());
    }

    #[test]
    fn daemon_enabled_is_false_when_env_zero() {
        let _guard = env_lock();
        let _set = EnvGuard::set(ENABLE_ENV, "0");
        assert!(!daemon_enabled());
    }
}
