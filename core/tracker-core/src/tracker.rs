//! Session tracker: the single source of truth for "is anything being tracked
//! right now, and since when".
//!
//! ## State machine
//!
//! ```text
//! Idle --start--> Tracking
//! Tracking --start(same category, domain_id)--> Tracking   (no-op)
//! Tracking --start(other)--> Tracking                       (implicit stop + start)
//! Tracking --stop--> Idle
//! Idle --stop--> Idle                                       (no-op)
//! ```
//!
//! The persisted [`TrackingState`] slot is written before a session counts as
//! open and cleared in the same store write that merges its duration. On restart the slot is
//! rehydrated: fresh slots resume, stale ones are closed at `last_seen_at`.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::aggregator::DurationAggregator;
use crate::error::{Result, TrackerError};
use crate::store::TrackerStore;
use crate::types::{ClosedSession, Session, TrackingState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Tracking(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(String),
    /// The open session already matched; its start time is untouched.
    AlreadyTracking(String),
}

impl StartOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            StartOutcome::Started(id) | StartOutcome::AlreadyTracking(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NothingPersisted,
    Resumed(String),
    ClosedStale(ClosedSession),
}

pub struct SessionTracker {
    store: Arc<dyn TrackerStore>,
    aggregator: DurationAggregator,
    utc_offset: FixedOffset,
    current: Option<Session>,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn TrackerStore>, utc_offset: FixedOffset) -> Self {
        let aggregator = DurationAggregator::new(Arc::clone(&store));
        Self {
            store,
            aggregator,
            utc_offset,
            current: None,
        }
    }

    pub fn state(&self) -> TrackerState {
        match &self.current {
            Some(session) => TrackerState::Tracking(session.session_id.clone()),
            None => TrackerState::Idle,
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn is_tracking(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_tracking_pair(&self, category: &str, domain_id: &str) -> bool {
        self.current
            .as_ref()
            .map(|session| session.category == category && session.domain_id == domain_id)
            .unwrap_or(false)
    }

    pub fn aggregator(&self) -> &DurationAggregator {
        &self.aggregator
    }

    /// Calendar date a session started at belongs to.
    pub fn record_date(&self, start_time: DateTime<Utc>) -> NaiveDate {
        start_time.with_timezone(&self.utc_offset).date_naive()
    }

    pub fn start(
        &mut self,
        category: &str,
        domain_id: &str,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        if let Some(session) = &self.current {
            if session.category == category && session.domain_id == domain_id {
                debug!(session_id = %session.session_id, domain_id, "Already tracking");
                return Ok(StartOutcome::AlreadyTracking(session.session_id.clone()));
            }
        }

        if self.current.is_some() {
            match self.stop(now) {
                Ok(_) => {}
                Err(err @ TrackerError::InvalidSession { .. }) => {
                    error!(error = %err, "Implicit stop lost its session; starting fresh");
                }
                Err(err) => return Err(err),
            }
        }

        let session = Session {
            session_id: ulid::Ulid::new().to_string(),
            domain_id: domain_id.to_string(),
            domain: domain.to_string(),
            category: category.to_string(),
            start_time: now,
            end_time: None,
        };
        self.store
            .save_tracking_state(&TrackingState::for_session(&session, now))?;

        info!(
            session_id = %session.session_id,
            domain_id,
            category,
            start_time = %now,
            "Tracking started"
        );
        let session_id = session.session_id.clone();
        self.current = Some(session);
        Ok(StartOutcome::Started(session_id))
    }

    /// Closes the open session at `now`. Idle is a no-op.
    ///
    /// A storage failure leaves the session open so the next trigger retries.
    /// A slot that no longer references the session resets to Idle and merges
    /// nothing.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<Option<ClosedSession>> {
        let Some(session) = self.current.clone() else {
            return Ok(None);
        };

        self.verify_slot(&session.session_id)?;

        let duration_secs = (now - session.start_time).num_seconds().max(0) as u64;
        let date = self.record_date(session.start_time);
        let record = self.aggregator.merge_closed_session(
            date,
            &session.domain_id,
            &session.domain,
            &session.category,
            duration_secs,
        )?;

        let mut closed = session;
        closed.end_time = Some(now);
        self.current = None;

        info!(
            session_id = %closed.session_id,
            domain_id = %closed.domain_id,
            duration_secs,
            "Tracking stopped"
        );
        Ok(Some(ClosedSession {
            session: closed,
            duration_secs,
            record,
        }))
    }

    /// Refreshes `last_seen_at` in the persisted slot.
    pub fn checkpoint(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(session) = self.current.clone() else {
            return Ok(());
        };
        self.verify_slot(&session.session_id)?;
        self.store
            .save_tracking_state(&TrackingState::for_session(&session, now))
    }

    /// Restores the open session from the persisted slot after a restart.
    pub fn rehydrate(&mut self, now: DateTime<Utc>, stale_after: Duration) -> Result<RecoveryOutcome> {
        if self.current.is_some() {
            return Err(TrackerError::storage(
                "rehydrate called while a session is open",
            ));
        }

        let Some(slot) = self.store.load_tracking_state()? else {
            return Ok(RecoveryOutcome::NothingPersisted);
        };

        let session = slot.to_session();
        let session_id = session.session_id.clone();
        self.current = Some(session);

        if now - slot.last_seen_at <= stale_after {
            info!(session_id = %session_id, start_time = %slot.start_time, "Resumed tracking");
            return Ok(RecoveryOutcome::Resumed(session_id));
        }

        let closed_at = slot.last_seen_at.max(slot.start_time);
        match self.stop(closed_at)? {
            Some(closed) => {
                info!(
                    session_id = %session_id,
                    duration_secs = closed.duration_secs,
                    "Closed stale session from previous run"
                );
                Ok(RecoveryOutcome::ClosedStale(closed))
            }
            None => Ok(RecoveryOutcome::NothingPersisted),
        }
    }

    fn verify_slot(&mut self, session_id: &str) -> Result<()> {
        let slot = self.store.load_tracking_state()?;
        match slot {
            Some(state) if state.session_id == session_id => Ok(()),
            _ => {
                self.current = None;
                Err(TrackerError::InvalidSession {
                    session_id: session_id.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn tracker() -> (Arc<MemoryStore>, SessionTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = SessionTracker::new(store.clone(), FixedOffset::east_opt(0).unwrap());
        (store, tracker)
    }

    #[test]
    fn start_persists_slot_before_reporting_open() {
        let (store, mut tracker) = tracker();
        let outcome = tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        let slot = store.load_tracking_state().expect("load").expect("slot");
        assert_eq!(slot.session_id, outcome.session_id());
        assert_eq!(tracker.state(), TrackerState::Tracking(slot.session_id));
    }

    #[test]
    fn at_most_one_session_open_across_switches() {
        let (store, mut tracker) = tracker();
        let pairs = [
            ("News", "a.example"),
            ("Social Media", "b.example"),
            ("News", "a.example"),
            ("News", "c.example"),
        ];
        for (step, (category, domain)) in pairs.iter().enumerate() {
            let domain_id = format!("{}-{}", domain, category);
            tracker
                .start(category, &domain_id, domain, t(step as i64 * 10))
                .expect("start");
            let slot = store.load_tracking_state().expect("load").expect("slot");
            assert_eq!(tracker.current().map(|s| &s.session_id), Some(&slot.session_id));
        }
        let records = store.all_records().expect("records");
        let visits: u32 = records.iter().map(|r| r.visit_count).sum();
        let seconds: u64 = records.iter().map(|r| r.duration).sum();
        assert_eq!(visits, 3);
        assert_eq!(seconds, 30);
    }

    #[test]
    fn same_pair_start_keeps_original_start_time() {
        let (_store, mut tracker) = tracker();
        let first = tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        let second = tracker
            .start("News", "news.example-News", "news.example", t(40))
            .expect("start");
        assert_eq!(second, StartOutcome::AlreadyTracking(first.session_id().to_string()));
        assert_eq!(tracker.current().map(|s| s.start_time), Some(t(0)));
    }

    #[test]
    fn double_stop_merges_once() {
        let (store, mut tracker) = tracker();
        tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        let closed = tracker.stop(t(125)).expect("stop").expect("closed");
        assert_eq!(closed.duration_secs, 125);
        assert!(tracker.stop(t(200)).expect("second stop").is_none());

        let records = store.all_records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].duration, records[0].visit_count), (125, 1));
        assert!(store.load_tracking_state().expect("load").is_none());
    }

    #[test]
    fn clock_skew_clamps_to_zero() {
        let (_store, mut tracker) = tracker();
        tracker
            .start("News", "news.example-News", "news.example", t(100))
            .expect("start");
        let closed = tracker.stop(t(40)).expect("stop").expect("closed");
        assert_eq!(closed.duration_secs, 0);
        assert_eq!(closed.record.visit_count, 1);
    }

    #[test]
    fn duration_floors_partial_seconds() {
        let (_store, mut tracker) = tracker();
        tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        let closed = tracker
            .stop(t(9) + Duration::milliseconds(999))
            .expect("stop")
            .expect("closed");
        assert_eq!(closed.duration_secs, 9);
    }

    #[test]
    fn externally_cleared_slot_is_invalid_session() {
        let (store, mut tracker) = tracker();
        let started = tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        store.clear_tracking_state().expect("clear");

        let err = tracker.stop(t(50)).unwrap_err();
        match err {
            TrackerError::InvalidSession { session_id } => {
                assert_eq!(session_id, started.session_id())
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert!(store.all_records().expect("records").is_empty());
    }

    #[test]
    fn implicit_stop_with_lost_slot_still_starts() {
        let (store, mut tracker) = tracker();
        tracker
            .start("News", "a.example-News", "a.example", t(0))
            .expect("start");
        store.clear_tracking_state().expect("clear");
        let outcome = tracker
            .start("News", "b.example-News", "b.example", t(10))
            .expect("start proceeds");
        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert!(tracker.is_tracking_pair("News", "b.example-News"));
    }

    #[test]
    fn failed_merge_keeps_session_open_for_retry() {
        let (store, mut tracker) = tracker();
        tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        store.set_fail_writes(true);
        assert!(tracker.stop(t(30)).is_err());
        assert!(tracker.is_tracking());

        store.set_fail_writes(false);
        let closed = tracker.stop(t(45)).expect("retry").expect("closed");
        assert_eq!(closed.duration_secs, 45);
        assert_eq!(store.all_records().expect("records").len(), 1);
    }

    #[test]
    fn failed_slot_clear_is_not_merged_again_after_restart() {
        let (store, mut tracker) = tracker();
        tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        tracker.checkpoint(t(120)).expect("checkpoint");
        store.set_fail_slot_clear(true);
        assert!(tracker.stop(t(125)).is_err());
        assert!(tracker.is_tracking());
        assert!(store.all_records().expect("records").is_empty());

        // The process dies here; the next run recovers from the slot alone.
        store.set_fail_slot_clear(false);
        let mut restarted = SessionTracker::new(store.clone(), FixedOffset::east_opt(0).unwrap());
        let outcome = restarted
            .rehydrate(t(10_000), Duration::seconds(90))
            .expect("rehydrate");
        assert!(matches!(outcome, RecoveryOutcome::ClosedStale(_)));

        let records = store.all_records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].duration, records[0].visit_count), (120, 1));
        assert!(store.load_tracking_state().expect("load").is_none());
        assert_eq!(
            restarted.rehydrate(t(10_001), Duration::seconds(90)).expect("rehydrate"),
            RecoveryOutcome::NothingPersisted
        );
    }

    #[test]
    fn record_date_follows_configured_offset() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker =
            SessionTracker::new(store.clone(), FixedOffset::west_opt(10 * 3600).unwrap());
        // 2026-03-04T09:00Z is still March 3rd at UTC-10.
        tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        let closed = tracker.stop(t(60)).expect("stop").expect("closed");
        assert_eq!(closed.record.date, NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
    }

    #[test]
    fn rehydrate_resumes_fresh_slot_with_original_start() {
        let (store, mut tracker) = tracker();
        let started = tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        tracker.checkpoint(t(60)).expect("checkpoint");

        let mut restarted = SessionTracker::new(store.clone(), FixedOffset::east_opt(0).unwrap());
        let outcome = restarted
            .rehydrate(t(100), Duration::seconds(90))
            .expect("rehydrate");
        assert_eq!(outcome, RecoveryOutcome::Resumed(started.session_id().to_string()));
        let closed = restarted.stop(t(130)).expect("stop").expect("closed");
        assert_eq!(closed.duration_secs, 130);
    }

    #[test]
    fn rehydrate_closes_stale_slot_at_last_seen() {
        let (store, mut tracker) = tracker();
        tracker
            .start("News", "news.example-News", "news.example", t(0))
            .expect("start");
        tracker.checkpoint(t(60)).expect("checkpoint");

        let mut restarted = SessionTracker::new(store.clone(), FixedOffset::east_opt(0).unwrap());
        let outcome = restarted
            .rehydrate(t(3600), Duration::seconds(90))
            .expect("rehydrate");
        match outcome {
            RecoveryOutcome::ClosedStale(closed) => assert_eq!(closed.duration_secs, 60),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(restarted.state(), TrackerState::Idle);
        assert!(store.load_tracking_state().expect("load").is_none());
    }

    #[test]
    fn rehydrate_without_slot_stays_idle() {
        let (_store, mut tracker) = tracker();
        assert_eq!(
            tracker.rehydrate(t(0), Duration::seconds(90)).expect("rehydrate"),
            RecoveryOutcome::NothingPersisted
        );
        assert_eq!(tracker.state(), TrackerState::Idle);
    }
}
