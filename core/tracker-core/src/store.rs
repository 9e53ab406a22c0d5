//! Storage collaborator for tracked time.
//!
//! Two logical tables plus one slot:
//! - `daily_domain_records`, keyed by `(date, domain_id)`, with a by-date query
//! - `domain_info`, keyed by `domain_id`
//! - the single `TrackingState` slot
//!
//! Only [`SessionTracker`](crate::tracker::SessionTracker) and
//! [`DurationAggregator`](crate::aggregator::DurationAggregator) write records
//! and the tracking slot. The resolver writes `domain_info`.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, TrackerError};
use crate::types::{record_key, DailyDomainRecord, DomainInfo, TrackingState};

pub trait TrackerStore: Send + Sync {
    fn daily_record(&self, date: NaiveDate, domain_id: &str) -> Result<Option<DailyDomainRecord>>;

    fn put_daily_record(&self, record: &DailyDomainRecord) -> Result<()>;

    /// Adds `increment` to the stored record for its key, creating it when
    /// absent, and returns the merged record.
    ///
    /// The default is a plain read-modify-write; callers are serialized by
    /// the signal worker. Stores with native upserts should override it.
    fn merge_daily_record(&self, increment: &DailyDomainRecord) -> Result<DailyDomainRecord> {
        let merged = match self.daily_record(increment.date, &increment.domain_id)? {
            Some(mut existing) => {
                existing.absorb(increment);
                existing
            }
            None => increment.clone(),
        };
        self.put_daily_record(&merged)?;
        Ok(merged)
    }

    /// Merges a closed session's increment and clears the tracking slot as
    /// one unit: either both land or neither does. A slot left behind after a
    /// successful merge would be merged again by crash recovery.
    fn merge_and_clear_tracking_state(
        &self,
        increment: &DailyDomainRecord,
    ) -> Result<DailyDomainRecord>;

    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<DailyDomainRecord>>;

    fn all_records(&self) -> Result<Vec<DailyDomainRecord>>;

    fn domain_info_for_domain(&self, domain: &str) -> Result<Option<DomainInfo>>;

    /// Write-once: returns false and leaves the store alone when an entry for
    /// the same domain already exists.
    fn insert_domain_info_if_absent(&self, info: &DomainInfo) -> Result<bool>;

    /// Explicit re-registration: replaces every entry for `info.domain`.
    fn replace_domain_info(&self, info: &DomainInfo) -> Result<()>;

    fn load_tracking_state(&self) -> Result<Option<TrackingState>>;

    fn save_tracking_state(&self, state: &TrackingState) -> Result<()>;

    fn clear_tracking_state(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryTables {
    records: BTreeMap<String, DailyDomainRecord>,
    domain_info: BTreeMap<String, DomainInfo>,
    tracking: Option<TrackingState>,
}

/// In-process store. Backs tests and embedders that don't need durability.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    fail_writes: AtomicBool,
    fail_slot_clear: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a storage error until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes clearing the tracking slot fail while other writes succeed.
    pub fn set_fail_slot_clear(&self, fail: bool) {
        self.fail_slot_clear.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| TrackerError::storage("memory store lock poisoned"))
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryTables>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TrackerError::storage("simulated write failure"));
        }
        self.tables()
    }
}

impl TrackerStore for MemoryStore {
    fn daily_record(&self, date: NaiveDate, domain_id: &str) -> Result<Option<DailyDomainRecord>> {
        Ok(self.tables()?.records.get(&record_key(date, domain_id)).cloned())
    }

    fn put_daily_record(&self, record: &DailyDomainRecord) -> Result<()> {
        self.writable()?
            .records
            .insert(record.key(), record.clone());
        Ok(())
    }

    fn merge_and_clear_tracking_state(
        &self,
        increment: &DailyDomainRecord,
    ) -> Result<DailyDomainRecord> {
        let mut tables = self.writable()?;
        if self.fail_slot_clear.load(Ordering::SeqCst) {
            return Err(TrackerError::storage("simulated slot clear failure"));
        }
        let key = increment.key();
        let merged = match tables.records.get(&key) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.absorb(increment);
                merged
            }
            None => increment.clone(),
        };
        tables.records.insert(key, merged.clone());
        tables.tracking = None;
        Ok(merged)
    }

    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<DailyDomainRecord>> {
        Ok(self
            .tables()?
            .records
            .values()
            .filter(|record| record.date == date)
            .cloned()
            .collect())
    }

    fn all_records(&self) -> Result<Vec<DailyDomainRecord>> {
        Ok(self.tables()?.records.values().cloned().collect())
    }

    fn domain_info_for_domain(&self, domain: &str) -> Result<Option<DomainInfo>> {
        Ok(self
            .tables()?
            .domain_info
            .values()
            .find(|info| info.domain == domain)
            .cloned())
    }

    fn insert_domain_info_if_absent(&self, info: &DomainInfo) -> Result<bool> {
        let mut tables = self.writable()?;
        if tables
            .domain_info
            .values()
            .any(|existing| existing.domain == info.domain)
        {
            return Ok(false);
        }
        tables
            .domain_info
            .insert(info.domain_id.clone(), info.clone());
        Ok(true)
    }

    fn replace_domain_info(&self, info: &DomainInfo) -> Result<()> {
        let mut tables = self.writable()?;
        tables
            .domain_info
            .retain(|_, existing| existing.domain != info.domain);
        tables
            .domain_info
            .insert(info.domain_id.clone(), info.clone());
        Ok(())
    }

    fn load_tracking_state(&self) -> Result<Option<TrackingState>> {
        Ok(self.tables()?.tracking.clone())
    }

    fn save_tracking_state(&self, state: &TrackingState) -> Result<()> {
        self.writable()?.tracking = Some(state.clone());
        Ok(())
    }

    fn clear_tracking_state(&self) -> Result<()> {
        let mut tables = self.writable()?;
        if self.fail_slot_clear.load(Ordering::SeqCst) {
            return Err(TrackerError::storage("simulated slot clear failure"));
        }
        tables.tracking = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Classification, DomainInfo};
    use chrono::{TimeZone, Utc};

    fn record(duration: u64) -> DailyDomainRecord {
        DailyDomainRecord {
            date: NaiveDate::from_ymd_opt(2026, 3, 4).expect("date"),
            domain_id: "news.example-News".to_string(),
            domain: "news.example".to_string(),
            category: "News".to_string(),
            duration,
            visit_count: 1,
        }
    }

    #[test]
    fn merge_creates_then_accumulates() {
        let store = MemoryStore::new();
        let first = store.merge_daily_record(&record(125)).expect("merge");
        assert_eq!((first.duration, first.visit_count), (125, 1));
        let second = store.merge_daily_record(&record(60)).expect("merge");
        assert_eq!((second.duration, second.visit_count), (185, 2));
        assert_eq!(store.all_records().expect("records").len(), 1);
    }

    #[test]
    fn domain_info_is_write_once_until_replaced() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();
        let news = DomainInfo::new(
            "news.example",
            Classification {
                category: "News".to_string(),
                subcategories: vec![],
                tags: vec![],
            },
            now,
        );
        let mut other = news.clone();
        other.category = "Sports".to_string();
        other.domain_id = "news.example-Sports".to_string();

        assert!(store.insert_domain_info_if_absent(&news).expect("insert"));
        assert!(!store.insert_domain_info_if_absent(&other).expect("insert"));
        assert_eq!(
            store
                .domain_info_for_domain("news.example")
                .expect("lookup")
                .map(|info| info.category),
            Some("News".to_string())
        );

        store.replace_domain_info(&other).expect("replace");
        assert_eq!(
            store
                .domain_info_for_domain("news.example")
                .expect("lookup")
                .map(|info| info.category),
            Some("Sports".to_string())
        );
    }

    #[test]
    fn merge_and_clear_is_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();
        store
            .save_tracking_state(&TrackingState {
                session_id: "s1".to_string(),
                category: "News".to_string(),
                domain_id: "news.example-News".to_string(),
                domain: "news.example".to_string(),
                start_time: now,
                last_seen_at: now,
            })
            .expect("save");

        store.set_fail_slot_clear(true);
        assert!(store.merge_and_clear_tracking_state(&record(30)).is_err());
        assert!(store.all_records().expect("records").is_empty());
        assert!(store.load_tracking_state().expect("load").is_some());

        store.set_fail_slot_clear(false);
        let merged = store
            .merge_and_clear_tracking_state(&record(30))
            .expect("merge and clear");
        assert_eq!((merged.duration, merged.visit_count), (30, 1));
        assert!(store.load_tracking_state().expect("load").is_none());
    }

    #[test]
    fn failing_writes_leave_reads_working() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.put_daily_record(&record(1)).is_err());
        assert!(store.all_records().expect("read").is_empty());
    }
}
