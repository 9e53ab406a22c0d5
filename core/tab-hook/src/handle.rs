//! Stdin handler for browser-side messages.
//!
//! Reads one JSON object from stdin and forwards it to the daemon. The
//! payload shape decides the route:
//!
//! ```text
//! {"signal": "...", ...}   → signal   (tab/focus/visibility/unload)
//! {"action": "...", ...}   → message  (startTracking, stopTracking, ...)
//! {"command": "...", ...}  → command  (syncToDrive)
//! ```
//!
//! The daemon's reply is written to stdout as one JSON line.

use serde::Deserialize;
use serde_json::Value;
use std::io::{self, Read, Write};

use tabtime_daemon_protocol::{parse_command, parse_message, SignalType, Visibility};

use crate::daemon_client::{self, SignalFields};

/// Browser signal as sent by the extension, before the event envelope is
/// added.
#[derive(Debug, Deserialize)]
struct BrowserSignal {
    signal: SignalType,
    #[serde(default)]
    tab_id: Option<i64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    state: Option<Visibility>,
}

#[derive(Debug, PartialEq)]
enum Route {
    Signal,
    Message,
    Command,
}

pub fn run() -> Result<(), String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| format!("Failed to read stdin: {}", e))?;

    if input.trim().is_empty() {
        return Ok(());
    }

    let payload: Value =
        serde_json::from_str(&input).map_err(|e| format!("Failed to parse input: {}", e))?;
    let reply = forward(payload)?;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, &reply)
        .map_err(|e| format!("Failed to write reply: {}", e))?;
    stdout
        .write_all(b"\n")
        .map_err(|e| format!("Failed to write reply: {}", e))
}

fn forward(payload: Value) -> Result<Value, String> {
    match route(&payload)? {
        Route::Signal => {
            let signal: BrowserSignal = serde_json::from_value(payload)
                .map_err(|e| format!("Invalid signal payload: {}", e))?;
            tracing::debug!(signal = ?signal.signal, tab_id = ?signal.tab_id, "Forwarding signal");
            daemon_client::send_signal(
                signal.signal,
                SignalFields {
                    tab_id: signal.tab_id,
                    url: signal.url,
                    state: signal.state,
                },
            )?;
            Ok(serde_json::json!({ "accepted": true }))
        }
        Route::Message => {
            let message = parse_message(payload).map_err(|e| format!("{}: {}", e.code, e.message))?;
            daemon_client::send_message(&message)
        }
        Route::Command => {
            let command = parse_command(payload).map_err(|e| format!("{}: {}", e.code, e.message))?;
            let status = daemon_client::send_command(&command)?;
            serde_json::to_value(status).map_err(|e| format!("Failed to encode status: {}", e))
        }
    }
}

fn route(payload: &Value) -> Result<Route, String> {
    let object = payload
        .as_object()
        .ok_or_else(|| "Input must be a JSON object".to_string())?;
    if object.contains_key("signal") {
        Ok(Route::Signal)
    } else if object.contains_key("action") {
        Ok(Route::Message)
    } else if object.contains_key("command") {
        Ok(Route::Command)
    } else {
        Err("Input has no signal, action or command field".to_string())
    }
}
