//! End-to-end tracking properties: ordering, idempotence, grace period, merge.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tracker_core::config::ClassifierConfig;
use tracker_core::{
    ActivityCoordinator, CategoryResolver, ClassifierChain, DeferredStopScheduler,
    DurationAggregator, ManualClock, MemoryStore, SessionTracker, Signal, TrackerStore,
    Visibility,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 4).unwrap()
}

#[derive(Clone, Default)]
struct Timers {
    armed: Arc<Mutex<Vec<u64>>>,
}

impl DeferredStopScheduler for Timers {
    fn schedule(&self, generation: u64, _delay: std::time::Duration) {
        self.armed.lock().unwrap().push(generation);
    }
}

struct Browser {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    timers: Timers,
    coordinator: ActivityCoordinator,
}

impl Browser {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let timers = Timers::default();
        let coordinator = ActivityCoordinator::new(
            SessionTracker::new(store.clone(), FixedOffset::east_opt(0).unwrap()),
            CategoryResolver::new(
                store.clone(),
                ClassifierChain::from_config(&ClassifierConfig::default()),
                Vec::new(),
            ),
            clock.clone(),
            Box::new(timers.clone()),
            std::time::Duration::from_secs(120),
        );
        Self {
            store,
            clock,
            timers,
            coordinator,
        }
    }

    fn send(&mut self, secs: i64, signal: Signal) {
        self.clock.set(at(secs));
        self.coordinator.handle(signal);
    }

    fn fire_last_timer(&mut self, secs: i64) {
        let generation = *self.timers.armed.lock().unwrap().last().expect("armed");
        self.send(secs, Signal::DeferredStopFired { generation });
    }
}

fn start_news() -> Signal {
    Signal::StartRequested {
        category: "News".to_string(),
        domain_id: "news.example-News".to_string(),
    }
}

fn hidden() -> Signal {
    Signal::VisibilityChanged {
        state: Visibility::Hidden,
        tab_id: None,
        url: None,
    }
}

fn visible() -> Signal {
    Signal::VisibilityChanged {
        state: Visibility::Visible,
        tab_id: None,
        url: None,
    }
}

#[test]
fn never_more_than_one_open_session() {
    let store = Arc::new(MemoryStore::new());
    let mut tracker = SessionTracker::new(store.clone(), FixedOffset::east_opt(0).unwrap());
    let domains = ["a.example", "b.example", "a.example", "c.example", "c.example"];
    for (step, domain) in domains.iter().enumerate() {
        let domain_id = format!("{}-News", domain);
        tracker
            .start("News", &domain_id, domain, at(step as i64 * 5))
            .expect("start");
        let slot = store.load_tracking_state().expect("load").expect("one slot");
        assert_eq!(Some(&slot.session_id), tracker.current().map(|s| &s.session_id));
    }
    // Four distinct sessions were opened; three have been closed.
    let visits: u32 = store
        .all_records()
        .expect("records")
        .iter()
        .map(|record| record.visit_count)
        .sum();
    assert_eq!(visits, 3);
}

#[test]
fn stop_twice_merges_once() {
    let mut browser = Browser::new();
    browser.send(0, start_news());
    browser.send(30, Signal::StopRequested);
    browser.send(31, Signal::StopRequested);
    let record = browser
        .store
        .daily_record(day(), "news.example-News")
        .expect("lookup")
        .expect("record");
    assert_eq!((record.duration, record.visit_count), (30, 1));
}

#[test]
fn merge_is_order_independent() {
    let forward = DurationAggregator::new(Arc::new(MemoryStore::new()));
    let backward = DurationAggregator::new(Arc::new(MemoryStore::new()));
    forward.merge(day(), "x-News", "x", "News", 17, 1).expect("merge");
    let a = forward.merge(day(), "x-News", "x", "News", 90, 1).expect("merge");
    backward.merge(day(), "x-News", "x", "News", 90, 1).expect("merge");
    let b = backward.merge(day(), "x-News", "x", "News", 17, 1).expect("merge");
    assert_eq!((a.duration, a.visit_count), (b.duration, b.visit_count));
}

#[test]
fn same_domain_start_is_a_no_op() {
    let mut browser = Browser::new();
    browser.send(0, start_news());
    let first = browser.coordinator.tracker().current().cloned().expect("open");
    browser.send(45, start_news());
    let again = browser.coordinator.tracker().current().cloned().expect("open");
    assert_eq!(first.session_id, again.session_id);
    assert_eq!(again.start_time, at(0));
}

#[test]
fn occlusion_within_grace_keeps_original_start() {
    let mut browser = Browser::new();
    browser.send(0, start_news());
    browser.send(10, hidden());
    browser.send(30, visible());
    assert_eq!(
        browser.coordinator.tracker().current().map(|s| s.start_time),
        Some(at(0))
    );
    browser.send(100, Signal::StopRequested);
    let record = browser
        .store
        .daily_record(day(), "news.example-News")
        .expect("lookup")
        .expect("record");
    assert_eq!(record.duration, 100);
}

#[test]
fn grace_expiry_stops_at_hide_time() {
    let mut browser = Browser::new();
    browser.send(0, start_news());
    browser.send(10, hidden());
    browser.fire_last_timer(130);
    let record = browser
        .store
        .daily_record(day(), "news.example-News")
        .expect("lookup")
        .expect("record");
    assert_eq!((record.duration, record.visit_count), (10, 1));

    browser.send(140, start_news());
    let fresh = browser.coordinator.tracker().current().cloned().expect("open");
    assert_eq!(fresh.start_time, at(140));
}

#[test]
fn news_example_end_to_end() {
    let mut browser = Browser::new();
    browser.send(0, start_news());
    browser.send(125, Signal::StopRequested);
    let record = browser
        .store
        .daily_record(day(), "news.example-News")
        .expect("lookup")
        .expect("record");
    assert_eq!(record.key(), "2026-03-04_news.example-News");
    assert_eq!((record.duration, record.visit_count), (125, 1));

    browser.send(500, start_news());
    browser.send(560, Signal::StopRequested);
    let record = browser
        .store
        .daily_record(day(), "news.example-News")
        .expect("lookup")
        .expect("record");
    assert_eq!((record.duration, record.visit_count), (185, 2));
}

#[test]
fn unknown_domain_is_tracked_as_uncategorized() {
    let mut browser = Browser::new();
    browser.send(
        0,
        Signal::TabActivated {
            tab_id: 3,
            url: "https://obscure.example/page".to_string(),
        },
    );
    browser.send(20, Signal::FocusLost);
    let record = browser
        .store
        .daily_record(day(), "obscure.example-Uncategorized")
        .expect("lookup")
        .expect("record");
    assert_eq!(record.category, "Uncategorized");
    assert_eq!(record.duration, 20);
    let info = browser
        .store
        .domain_info_for_domain("obscure.example")
        .expect("lookup")
        .expect("cached");
    assert!(info.subcategories.is_empty());
}

#[test]
fn crash_after_unload_is_recovered_on_restart() {
    let mut browser = Browser::new();
    browser.send(0, start_news());
    browser.send(30, Signal::Heartbeat);
    browser.send(60, Signal::Heartbeat);
    // Process dies here; nothing stops the session.

    let mut restarted = SessionTracker::new(browser.store.clone(), FixedOffset::east_opt(0).unwrap());
    restarted
        .rehydrate(at(4000), Duration::seconds(90))
        .expect("rehydrate");
    assert!(!restarted.is_tracking());
    let record = browser
        .store
        .daily_record(day(), "news.example-News")
        .expect("lookup")
        .expect("record");
    assert_eq!(record.duration, 60);
}
