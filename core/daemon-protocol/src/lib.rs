//! IPC protocol types and validation for tabtime-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.
//!
//! Three payload families travel over the socket:
//!
//! - [`SignalEnvelope`]: browser lifecycle signals (tab activation, focus,
//!   visibility, unload).
//! - [`Message`]: cross-context messages tagged by `"action"`, matching the
//!   page-level signal source's wire format (`startTracking`, `stopTracking`,
//!   `visibilityChanged`, `getBrowsingData`).
//! - [`Command`]: commands tagged by `"command"` (`syncToDrive`), answered
//!   with a [`CommandStatus`].

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

const MAX_URL_LEN: usize = 8192;
const MAX_LABEL_LEN: usize = 256;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetTrackingState,
    Signal,
    Message,
    Command,
    RegisterDomain,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Page visibility as reported by the document.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SignalType {
    TabActivated,
    FocusGained,
    FocusLost,
    TabDeactivated,
    VisibilityChanged,
    Unload,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SignalEnvelope {
    pub event_id: String,
    pub recorded_at: String,
    pub signal: SignalType,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub state: Option<Visibility>,
}

impl SignalEnvelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        match self.signal {
            SignalType::TabActivated | SignalType::FocusGained => {
                require_tab_id(&self.tab_id)?;
                require_url(&self.url)?;
            }
            SignalType::TabDeactivated => {
                require_tab_id(&self.tab_id)?;
            }
            SignalType::VisibilityChanged => {
                if self.state.is_none() {
                    return Err(ErrorInfo::new("missing_field", "state is required"));
                }
                if self.url.is_some() {
                    require_url(&self.url)?;
                }
            }
            SignalType::FocusLost | SignalType::Unload => {}
        }

        Ok(())
    }
}

pub fn parse_signal(params: Value) -> Result<SignalEnvelope, ErrorInfo> {
    let envelope: SignalEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("signal payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

/// Cross-context message, tagged by `"action"`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    StartTracking {
        category: String,
        #[serde(rename = "domainId")]
        domain_id: String,
    },
    StopTracking,
    VisibilityChanged {
        state: Visibility,
    },
    GetBrowsingData {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
    },
}

impl Message {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match self {
            Message::StartTracking {
                category,
                domain_id,
            } => {
                require_label(category, "category")?;
                require_label(domain_id, "domainId")?;
                let suffix = format!("-{}", category);
                if domain_id.len() <= suffix.len() || !domain_id.ends_with(&suffix) {
                    return Err(ErrorInfo::new(
                        "invalid_domain_id",
                        "domainId must be formatted as <domain>-<category>",
                    ));
                }
                Ok(())
            }
            Message::GetBrowsingData { date } => match date {
                Some(date) => require_date(date),
                None => Ok(()),
            },
            Message::StopTracking | Message::VisibilityChanged { .. } => Ok(()),
        }
    }
}

pub fn parse_message(params: Value) -> Result<Message, ErrorInfo> {
    let message: Message = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("message payload is invalid: {}", err),
        )
    })?;
    message.validate()?;
    Ok(message)
}

/// Command message, tagged by `"command"`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    SyncToDrive {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
    },
}

pub fn parse_command(params: Value) -> Result<Command, ErrorInfo> {
    let command: Command = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("command payload is invalid: {}", err),
        )
    })?;
    match &command {
        Command::SyncToDrive { date: Some(date) } => require_date(date)?,
        Command::SyncToDrive { date: None } => {}
    }
    Ok(command)
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutcome {
    Success,
    Failure,
}

/// Reply to a [`Command`]: `{"status": "success"}` or `{"status": "failure"}`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    pub status: CommandOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandStatus {
    pub fn success() -> Self {
        Self {
            status: CommandOutcome::Success,
            detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: CommandOutcome::Failure,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegisterDomainParams {
    pub domain: String,
    pub category: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
}

pub fn parse_register_domain(params: Value) -> Result<RegisterDomainParams, ErrorInfo> {
    let parsed: RegisterDomainParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("register_domain params are invalid: {}", err),
        )
    })?;
    require_label(&parsed.domain, "domain")?;
    require_label(&parsed.category, "category")?;
    if parsed.domain.contains('/') || parsed.domain.contains(char::is_whitespace) {
        return Err(ErrorInfo::new(
            "invalid_domain",
            "domain must be a bare hostname",
        ));
    }
    Ok(parsed)
}

fn require_tab_id(tab_id: &Option<i64>) -> Result<(), ErrorInfo> {
    match tab_id {
        Some(id) if *id >= 0 => Ok(()),
        Some(_) => Err(ErrorInfo::new("invalid_tab_id", "tab_id must be non-negative")),
        None => Err(ErrorInfo::new("missing_field", "tab_id is required")),
    }
}

fn require_url(value: &Option<String>) -> Result<(), ErrorInfo> {
    match value {
        Some(url) if !url.trim().is_empty() => {
            if url.len() > MAX_URL_LEN {
                return Err(ErrorInfo::new(
                    "invalid_url",
                    format!("url must be {} bytes or fewer", MAX_URL_LEN),
                ));
            }
            Ok(())
        }
        _ => Err(ErrorInfo::new("missing_field", "url is required")),
    }
}

fn require_label(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("{} must be {} characters or fewer", field, MAX_LABEL_LEN),
        ));
    }
    Ok(())
}

fn require_date(value: &str) -> Result<(), ErrorInfo> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| ErrorInfo::new("invalid_date", "date must be formatted as YYYY-MM-DD"))
}
