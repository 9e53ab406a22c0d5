//! SQLite persistence for tabtime-daemon.
//!
//! This is the single-writer store backing the daemon: daily per-domain
//! records, the domain classification cache, and the one-row tracking slot.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::PathBuf;

use tracker_core::{DailyDomainRecord, DomainInfo, TrackerError, TrackerStore, TrackingState};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS daily_domain_records (
                    record_key TEXT PRIMARY KEY,
                    date TEXT NOT NULL,
                    domain_id TEXT NOT NULL,
                    domain TEXT NOT NULL,
                    category TEXT NOT NULL,
                    duration INTEGER NOT NULL DEFAULT 0,
                    visit_count INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_daily_domain_records_date
                    ON daily_domain_records(date);
                 CREATE TABLE IF NOT EXISTS domain_info (
                    domain_id TEXT PRIMARY KEY,
                    domain TEXT NOT NULL,
                    category TEXT NOT NULL,
                    subcategories TEXT NOT NULL,
                    tags TEXT NOT NULL,
                    registered_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_domain_info_domain
                    ON domain_info(domain);
                 CREATE TABLE IF NOT EXISTS tracking_state (
                    slot INTEGER PRIMARY KEY CHECK (slot = 1),
                    session_id TEXT NOT NULL,
                    category TEXT NOT NULL,
                    domain_id TEXT NOT NULL,
                    domain TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    last_seen_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }

    fn query_records(
        &self,
        sql: &str,
        bind: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DailyDomainRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|err| format!("Failed to prepare records query: {}", err))?;
            let rows = stmt
                .query_map(bind, read_record_row)
                .map_err(|err| format!("Failed to read record rows: {}", err))?;

            let mut records = Vec::new();
            for row in rows {
                let raw = row.map_err(|err| format!("Failed to decode record row: {}", err))?;
                records.push(raw.into_record()?);
            }
            Ok(records)
        })
    }
}

impl TrackerStore for Db {
    fn daily_record(
        &self,
        date: NaiveDate,
        domain_id: &str,
    ) -> tracker_core::Result<Option<DailyDomainRecord>> {
        let key = tracker_core::record_key(date, domain_id);
        self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    "SELECT date, domain_id, domain, category, duration, visit_count
                     FROM daily_domain_records WHERE record_key = ?1",
                    params![key],
                    read_record_row,
                )
                .optional()
                .map_err(|err| format!("Failed to read daily record: {}", err))?;
            raw.map(RawRecord::into_record).transpose()
        })
        .map_err(TrackerError::storage)
    }

    fn put_daily_record(&self, record: &DailyDomainRecord) -> tracker_core::Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO daily_domain_records
                    (record_key, date, domain_id, domain, category, duration, visit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(record_key) DO UPDATE SET
                    domain = excluded.domain,
                    category = excluded.category,
                    duration = excluded.duration,
                    visit_count = excluded.visit_count",
                params![
                    record.key(),
                    record.date.format(DATE_FORMAT).to_string(),
                    record.domain_id,
                    record.domain,
                    record.category,
                    record.duration as i64,
                    record.visit_count as i64,
                ],
            )
            .map_err(|err| format!("Failed to upsert daily record: {}", err))?;
            Ok(())
        })
        .map_err(TrackerError::storage)
    }

    fn merge_daily_record(
        &self,
        increment: &DailyDomainRecord,
    ) -> tracker_core::Result<DailyDomainRecord> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin merge: {}", err))?;
            let raw = upsert_record(&tx, increment)?;
            tx.commit()
                .map_err(|err| format!("Failed to commit merge: {}", err))?;
            raw.into_record()
        })
        .map_err(TrackerError::storage)
    }

    fn merge_and_clear_tracking_state(
        &self,
        increment: &DailyDomainRecord,
    ) -> tracker_core::Result<DailyDomainRecord> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin session close: {}", err))?;
            let raw = upsert_record(&tx, increment)?;
            tx.execute("DELETE FROM tracking_state WHERE slot = 1", [])
                .map_err(|err| format!("Failed to clear tracking state: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit session close: {}", err))?;
            raw.into_record()
        })
        .map_err(TrackerError::storage)
    }

    fn records_for_date(&self, date: NaiveDate) -> tracker_core::Result<Vec<DailyDomainRecord>> {
        let date = date.format(DATE_FORMAT).to_string();
        self.query_records(
            "SELECT date, domain_id, domain, category, duration, visit_count
             FROM daily_domain_records WHERE date = ?1
             ORDER BY duration DESC, domain_id ASC",
            &[&date],
        )
        .map_err(TrackerError::storage)
    }

    fn all_records(&self) -> tracker_core::Result<Vec<DailyDomainRecord>> {
        self.query_records(
            "SELECT date, domain_id, domain, category, duration, visit_count
             FROM daily_domain_records
             ORDER BY date ASC, duration DESC, domain_id ASC",
            &[],
        )
        .map_err(TrackerError::storage)
    }

    fn domain_info_for_domain(&self, domain: &str) -> tracker_core::Result<Option<DomainInfo>> {
        self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    "SELECT domain_id, domain, category, subcategories, tags, registered_at
                     FROM domain_info WHERE domain = ?1
                     ORDER BY registered_at DESC LIMIT 1",
                    params![domain],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(|err| format!("Failed to read domain info: {}", err))?;

            let Some((domain_id, domain, category, subcategories, tags, registered_at)) = raw
            else {
                return Ok(None);
            };
            Ok(Some(DomainInfo {
                domain_id,
                domain,
                category,
                subcategories: decode_list(&subcategories)?,
                tags: decode_list(&tags)?,
                registered_at: parse_timestamp(&registered_at)?,
            }))
        })
        .map_err(TrackerError::storage)
    }

    fn insert_domain_info_if_absent(&self, info: &DomainInfo) -> tracker_core::Result<bool> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin domain insert: {}", err))?;
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM domain_info WHERE domain = ?1)",
                    params![info.domain],
                    |row| row.get(0),
                )
                .map_err(|err| format!("Failed to check domain info: {}", err))?;
            if exists {
                return Ok(false);
            }
            insert_domain_info(&tx, info)?;
            tx.commit()
                .map_err(|err| format!("Failed to commit domain insert: {}", err))?;
            Ok(true)
        })
        .map_err(TrackerError::storage)
    }

    fn replace_domain_info(&self, info: &DomainInfo) -> tracker_core::Result<()> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin domain replace: {}", err))?;
            tx.execute("DELETE FROM domain_info WHERE domain = ?1", params![info.domain])
                .map_err(|err| format!("Failed to delete domain info: {}", err))?;
            insert_domain_info(&tx, info)?;
            tx.commit()
                .map_err(|err| format!("Failed to commit domain replace: {}", err))
        })
        .map_err(TrackerError::storage)
    }

    fn load_tracking_state(&self) -> tracker_core::Result<Option<TrackingState>> {
        self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    "SELECT session_id, category, domain_id, domain, start_time, last_seen_at
                     FROM tracking_state WHERE slot = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(|err| format!("Failed to read tracking state: {}", err))?;

            let Some((session_id, category, domain_id, domain, start_time, last_seen_at)) = raw
            else {
                return Ok(None);
            };
            Ok(Some(TrackingState {
                session_id,
                category,
                domain_id,
                domain,
                start_time: parse_timestamp(&start_time)?,
                last_seen_at: parse_timestamp(&last_seen_at)?,
            }))
        })
        .map_err(TrackerError::storage)
    }

    fn save_tracking_state(&self, state: &TrackingState) -> tracker_core::Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO tracking_state
                    (slot, session_id, category, domain_id, domain, start_time, last_seen_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(slot) DO UPDATE SET
                    session_id = excluded.session_id,
                    category = excluded.category,
                    domain_id = excluded.domain_id,
                    domain = excluded.domain,
                    start_time = excluded.start_time,
                    last_seen_at = excluded.last_seen_at",
                params![
                    state.session_id,
                    state.category,
                    state.domain_id,
                    state.domain,
                    state.start_time.to_rfc3339(),
                    state.last_seen_at.to_rfc3339(),
                ],
            )
            .map_err(|err| format!("Failed to save tracking state: {}", err))?;
            Ok(())
        })
        .map_err(TrackerError::storage)
    }

    fn clear_tracking_state(&self) -> tracker_core::Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM tracking_state WHERE slot = 1", [])
                .map_err(|err| format!("Failed to clear tracking state: {}", err))?;
            Ok(())
        })
        .map_err(TrackerError::storage)
    }
}

struct RawRecord {
    date: String,
    domain_id: String,
    domain: String,
    category: String,
    duration: i64,
    visit_count: i64,
}

impl RawRecord {
    fn into_record(self) -> Result<DailyDomainRecord, String> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|err| format!("Invalid record date {}: {}", self.date, err))?;
        Ok(DailyDomainRecord {
            date,
            domain_id: self.domain_id,
            domain: self.domain,
            category: self.category,
            duration: self.duration.max(0) as u64,
            visit_count: self.visit_count.clamp(0, u32::MAX as i64) as u32,
        })
    }
}

fn read_record_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        date: row.get(0)?,
        domain_id: row.get(1)?,
        domain: row.get(2)?,
        category: row.get(3)?,
        duration: row.get(4)?,
        visit_count: row.get(5)?,
    })
}

fn upsert_record(conn: &Connection, increment: &DailyDomainRecord) -> Result<RawRecord, String> {
    let key = increment.key();
    conn.execute(
        "INSERT INTO daily_domain_records
            (record_key, date, domain_id, domain, category, duration, visit_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(record_key) DO UPDATE SET
            duration = duration + excluded.duration,
            visit_count = visit_count + excluded.visit_count",
        params![
            key,
            increment.date.format(DATE_FORMAT).to_string(),
            increment.domain_id,
            increment.domain,
            increment.category,
            increment.duration as i64,
            increment.visit_count as i64,
        ],
    )
    .map_err(|err| format!("Failed to merge daily record: {}", err))?;
    conn.query_row(
        "SELECT date, domain_id, domain, category, duration, visit_count
         FROM daily_domain_records WHERE record_key = ?1",
        params![key],
        read_record_row,
    )
    .map_err(|err| format!("Failed to read merged record: {}", err))
}

fn insert_domain_info(conn: &Connection, info: &DomainInfo) -> Result<(), String> {
    let subcategories = serde_json::to_string(&info.subcategories)
        .map_err(|err| format!("Failed to serialize subcategories: {}", err))?;
    let tags = serde_json::to_string(&info.tags)
        .map_err(|err| format!("Failed to serialize tags: {}", err))?;
    conn.execute(
        "INSERT INTO domain_info (domain_id, domain, category, subcategories, tags, registered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(domain_id) DO UPDATE SET
            domain = excluded.domain,
            category = excluded.category,
            subcategories = excluded.subcategories,
            tags = excluded.tags,
            registered_at = excluded.registered_at",
        params![
            info.domain_id,
            info.domain,
            info.category,
            subcategories,
            tags,
            info.registered_at.to_rfc3339(),
        ],
    )
    .map_err(|err| format!("Failed to insert domain info: {}", err))?;
    Ok(())
}

fn decode_list(value: &str) -> Result<Vec<String>, String> {
    serde_json::from_str(value).map_err(|err| format!("Failed to parse stored list: {}", err))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("Invalid stored timestamp {}: {}", value, err))
}
