//! Domain types shared by the tracker, the daemon and its clients.
//!
//! Records that cross over to the page-level signal source serialize in
//! camelCase (`domainId`, `visitCount`) to match its message format.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Category assigned when every classifier strategy fails.
pub const UNCATEGORIZED: &str = "Uncategorized";

// ═══════════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════════

/// One continuous interval of attention on a single domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub domain_id: String,
    pub domain: String,
    /// Fixed at start; reclassification never touches an open session.
    pub category: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A session that was stopped and folded into its daily record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedSession {
    pub session: Session,
    pub duration_secs: u64,
    pub record: DailyDomainRecord,
}

/// Persisted mirror of the open session. Single slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingState {
    pub session_id: String,
    pub category: String,
    pub domain_id: String,
    pub domain: String,
    pub start_time: DateTime<Utc>,
    /// Last time the daemon confirmed the session was alive. Crash recovery
    /// closes a stale slot here rather than at restart time.
    pub last_seen_at: DateTime<Utc>,
}

impl TrackingState {
    pub fn for_session(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            category: session.category.clone(),
            domain_id: session.domain_id.clone(),
            domain: session.domain.clone(),
            start_time: session.start_time,
            last_seen_at: now,
        }
    }

    pub fn to_session(&self) -> Session {
        Session {
            session_id: self.session_id.clone(),
            domain_id: self.domain_id.clone(),
            domain: self.domain.clone(),
            category: self.category.clone(),
            start_time: self.start_time,
            end_time: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Aggregates
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-day, per-domain accumulator of session durations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyDomainRecord {
    pub date: NaiveDate,
    pub domain_id: String,
    pub domain: String,
    pub category: String,
    /// Cumulative seconds.
    pub duration: u64,
    pub visit_count: u32,
}

impl DailyDomainRecord {
    /// Composite key, `"{date}_{domain_id}"`.
    pub fn key(&self) -> String {
        record_key(self.date, &self.domain_id)
    }

    /// Folds another record for the same key into this one.
    pub fn absorb(&mut self, other: &DailyDomainRecord) {
        self.duration = self.duration.saturating_add(other.duration);
        self.visit_count = self.visit_count.saturating_add(other.visit_count);
    }
}

pub fn record_key(date: NaiveDate, domain_id: &str) -> String {
    format!("{}_{}", date.format("%Y-%m-%d"), domain_id)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Classification {
    pub fn uncategorized() -> Self {
        Self {
            category: UNCATEGORIZED.to_string(),
            subcategories: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// Classification cache entry, keyed by `domain_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainInfo {
    pub domain_id: String,
    pub domain: String,
    pub category: String,
    pub subcategories: Vec<String>,
    pub tags: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

impl DomainInfo {
    pub fn new(domain: &str, classification: Classification, now: DateTime<Utc>) -> Self {
        Self {
            domain_id: domain_id_for(domain, &classification.category),
            domain: domain.to_string(),
            category: classification.category,
            subcategories: classification.subcategories,
            tags: classification.tags,
            registered_at: now,
        }
    }
}

/// What the resolver hands the tracker: enough to open a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCategory {
    pub domain: String,
    pub category: String,
    pub domain_id: String,
}

impl From<&DomainInfo> for ResolvedCategory {
    fn from(info: &DomainInfo) -> Self {
        Self {
            domain: info.domain.clone(),
            category: info.category.clone(),
            domain_id: info.domain_id.clone(),
        }
    }
}

/// `"{domain}-{category}"`.
pub fn domain_id_for(domain: &str, category: &str) -> String {
    format!("{}-{}", domain, category)
}

/// Inverse of [`domain_id_for`]; `None` when the id doesn't carry the category.
pub fn domain_from_domain_id<'a>(domain_id: &'a str, category: &str) -> Option<&'a str> {
    domain_id
        .strip_suffix(category)
        .and_then(|rest| rest.strip_suffix('-'))
        .filter(|domain| !domain.is_empty())
}
