//! Activity coordinator: turns browser lifecycle signals and cross-context
//! messages into [`SessionTracker`] calls.
//!
//! Hidden visibility does not stop tracking right away. It arms a deferred
//! stop (the grace period); a `visible` signal before it fires cancels it and
//! the session carries on with its original start time. If the deferred stop
//! fires first, the session is closed at the moment the page was hidden.
//!
//! Cancellation is a generation check: every armed stop carries the
//! generation it was armed with, and a fired stop whose generation is no
//! longer pending is ignored. Signals are processed one at a time, so a
//! fired stop is either fully applied before a `visible` or ignored after it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Result, TrackerError};
use crate::resolver::{extract_domain, CategoryResolver};
use crate::tracker::SessionTracker;
use crate::types::{domain_from_domain_id, DailyDomainRecord, DomainInfo, ResolvedCategory, TrackingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    TabActivated { tab_id: i64, url: String },
    FocusGained { tab_id: i64, url: String },
    FocusLost,
    TabDeactivated { tab_id: i64 },
    VisibilityChanged {
        state: Visibility,
        tab_id: Option<i64>,
        url: Option<String>,
    },
    Unload { tab_id: Option<i64> },
    StartRequested { category: String, domain_id: String },
    StopRequested,
    DeferredStopFired { generation: u64 },
    Heartbeat,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::TabActivated { .. } => "tab_activated",
            Signal::FocusGained { .. } => "focus_gained",
            Signal::FocusLost => "focus_lost",
            Signal::TabDeactivated { .. } => "tab_deactivated",
            Signal::VisibilityChanged { .. } => "visibility_changed",
            Signal::Unload { .. } => "unload",
            Signal::StartRequested { .. } => "start_requested",
            Signal::StopRequested => "stop_requested",
            Signal::DeferredStopFired { .. } => "deferred_stop_fired",
            Signal::Heartbeat => "heartbeat",
        }
    }
}

/// Arms the grace-period timer. Implementations deliver
/// [`Signal::DeferredStopFired`] back through the same ordered queue as every
/// other signal once `delay` has elapsed.
pub trait DeferredStopScheduler: Send {
    fn schedule(&self, generation: u64, delay: Duration);
}

#[derive(Debug, Clone, Copy)]
struct PendingStop {
    generation: u64,
    hidden_at: DateTime<Utc>,
}

/// Last page the coordinator started (or tried to start) tracking for.
#[derive(Debug, Clone)]
struct PageContext {
    tab_id: Option<i64>,
    resolved: ResolvedCategory,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    pub tracking: Option<TrackingState>,
    pub grace_pending: bool,
    pub hidden_at: Option<DateTime<Utc>>,
}

pub struct ActivityCoordinator {
    tracker: SessionTracker,
    resolver: CategoryResolver,
    clock: Arc<dyn Clock>,
    scheduler: Box<dyn DeferredStopScheduler>,
    grace_period: Duration,
    generation: u64,
    pending: Option<PendingStop>,
    last_context: Option<PageContext>,
}

impl ActivityCoordinator {
    pub fn new(
        tracker: SessionTracker,
        resolver: CategoryResolver,
        clock: Arc<dyn Clock>,
        scheduler: Box<dyn DeferredStopScheduler>,
        grace_period: Duration,
    ) -> Self {
        Self {
            tracker,
            resolver,
            clock,
            scheduler,
            grace_period,
            generation: 0,
            pending: None,
            last_context: None,
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut SessionTracker {
        &mut self.tracker
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Today's record date for the current clock.
    pub fn today(&self) -> NaiveDate {
        self.tracker.record_date(self.clock.now())
    }

    pub fn grace_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Handles one signal. Failures are logged here and never propagate, so a
    /// bad signal cannot stop later ones from being processed.
    pub fn handle(&mut self, signal: Signal) {
        let name = signal.name();
        if let Err(err) = self.apply(signal) {
            match &err {
                TrackerError::InvalidSession { .. } => {
                    error!(signal = name, error = %err, "Tracking state lost; reset to idle");
                }
                _ if err.is_transient() => {
                    warn!(signal = name, error = %err, "Signal handling failed; will retry on next trigger");
                }
                _ => {
                    error!(signal = name, error = %err, "Signal handling failed");
                }
            }
        }
    }

    fn apply(&mut self, signal: Signal) -> Result<()> {
        let now = self.clock.now();
        debug!(signal = signal.name(), "Handling signal");
        match signal {
            Signal::TabActivated { tab_id, url } | Signal::FocusGained { tab_id, url } => {
                self.cancel_pending();
                self.activate(Some(tab_id), &url, now)
            }
            Signal::FocusLost | Signal::StopRequested => {
                self.cancel_pending();
                self.stop(now)
            }
            Signal::TabDeactivated { tab_id } => {
                if !self.is_current_tab(Some(tab_id)) {
                    debug!(tab_id, "Ignoring deactivation of a tab that isn't tracked");
                    return Ok(());
                }
                self.cancel_pending();
                self.stop(now)
            }
            Signal::Unload { tab_id } => {
                if !self.is_current_tab(tab_id) {
                    debug!(tab_id = ?tab_id, "Ignoring unload of a tab that isn't tracked");
                    return Ok(());
                }
                self.cancel_pending();
                self.stop(now)
            }
            Signal::VisibilityChanged { state, tab_id, url } => {
                if !self.is_current_tab(tab_id) {
                    debug!(tab_id = ?tab_id, "Ignoring visibility change of an untracked tab");
                    return Ok(());
                }
                match state {
                    Visibility::Hidden => {
                        self.arm_deferred_stop(now);
                        Ok(())
                    }
                    Visibility::Visible => self.became_visible(tab_id, url.as_deref(), now),
                }
            }
            Signal::StartRequested {
                category,
                domain_id,
            } => {
                self.cancel_pending();
                let domain = domain_from_domain_id(&domain_id, &category)
                    .ok_or_else(|| TrackerError::InvalidDomainId {
                        domain_id: domain_id.clone(),
                        category: category.clone(),
                    })?
                    .to_string();
                let resolved = ResolvedCategory {
                    domain,
                    category,
                    domain_id,
                };
                let tab_id = self.last_context.as_ref().and_then(|context| context.tab_id);
                self.start(tab_id, resolved, now)
            }
            Signal::DeferredStopFired { generation } => match self.pending.as_ref().copied() {
                Some(pending) if pending.generation == generation => {
                    self.pending = None;
                    info!(
                        generation,
                        hidden_at = %pending.hidden_at,
                        "Grace period elapsed; closing session at hide time"
                    );
                    self.tracker.stop(pending.hidden_at).map(|_| ())
                }
                _ => {
                    debug!(generation, "Ignoring cancelled deferred stop");
                    Ok(())
                }
            },
            Signal::Heartbeat => {
                if self.pending.is_some() {
                    return Ok(());
                }
                self.tracker.checkpoint(now)
            }
        }
    }

    fn activate(&mut self, tab_id: Option<i64>, url: &str, now: DateTime<Utc>) -> Result<()> {
        let resolved = match self.resolver.resolve(url, now) {
            Ok(resolved) => resolved,
            Err(err) => {
                // The tab changed either way; don't leave the old page's
                // session running on an unresolved one.
                self.last_context = None;
                self.stop(now)?;
                return Err(err);
            }
        };
        match resolved {
            Some(resolved) => self.start(tab_id, resolved, now),
            None => {
                self.last_context = None;
                self.stop(now)
            }
        }
    }

    fn start(
        &mut self,
        tab_id: Option<i64>,
        resolved: ResolvedCategory,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = self
            .tracker
            .start(&resolved.category, &resolved.domain_id, &resolved.domain, now);
        self.last_context = Some(PageContext { tab_id, resolved });
        outcome.map(|_| ())
    }

    fn stop(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.tracker.stop(now).map(|_| ())
    }

    fn became_visible(
        &mut self,
        tab_id: Option<i64>,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Page identity changed since we last tracked it: resolve afresh.
        if let Some(url) = url {
            let same_page = match (extract_domain(url), &self.last_context) {
                (Some(domain), Some(context)) => domain == context.resolved.domain,
                _ => false,
            };
            if !same_page {
                // The old page stopped being seen when it was hidden.
                if let Some(pending) = self.pending.take() {
                    debug!(generation = pending.generation, "Page changed during grace period");
                    self.tracker.stop(pending.hidden_at)?;
                }
                return self.activate(tab_id, url, now);
            }
        }

        if self.pending.take().is_some() && self.tracker.is_tracking() {
            debug!("Visible again within grace period; session resumes");
            return Ok(());
        }

        let Some(context) = self.last_context.clone() else {
            debug!("Visible with no known page context; nothing to resume");
            return Ok(());
        };
        if self
            .tracker
            .is_tracking_pair(&context.resolved.category, &context.resolved.domain_id)
        {
            return Ok(());
        }
        self.start(context.tab_id.or(tab_id), context.resolved, now)
    }

    fn arm_deferred_stop(&mut self, now: DateTime<Utc>) {
        if !self.tracker.is_tracking() {
            debug!("Hidden with nothing tracked; no deferred stop");
            return;
        }
        if self.pending.is_some() {
            debug!("Deferred stop already pending");
            return;
        }
        self.generation += 1;
        self.pending = Some(PendingStop {
            generation: self.generation,
            hidden_at: now,
        });
        debug!(
            generation = self.generation,
            grace_secs = self.grace_period.as_secs(),
            "Page hidden; deferred stop armed"
        );
        self.scheduler.schedule(self.generation, self.grace_period);
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(generation = pending.generation, "Deferred stop cancelled");
        }
    }

    /// A signal scoped to a tab only applies to the tab being tracked.
    /// Unscoped signals, or signals when no tab is known, always apply.
    fn is_current_tab(&self, tab_id: Option<i64>) -> bool {
        match (tab_id, self.last_context.as_ref().and_then(|c| c.tab_id)) {
            (Some(signal_tab), Some(tracked_tab)) => signal_tab == tracked_tab,
            _ => true,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read-only queries and registry writes
    // ─────────────────────────────────────────────────────────────────────

    /// Records for one day, or every record when `date` is `None`.
    pub fn browsing_data(&self, date: Option<NaiveDate>) -> Result<Vec<DailyDomainRecord>> {
        let aggregator = self.tracker.aggregator();
        match date {
            Some(date) => aggregator.records_for_date(date),
            None => aggregator.all_records(),
        }
    }

    pub fn tracking_snapshot(&self) -> TrackingSnapshot {
        TrackingSnapshot {
            tracking: self
                .tracker
                .current()
                .map(|session| TrackingState::for_session(session, self.clock.now())),
            grace_pending: self.pending.is_some(),
            hidden_at: self.pending.map(|pending| pending.hidden_at),
        }
    }

    pub fn register_domain(
        &self,
        domain: &str,
        category: &str,
        subcategories: Vec<String>,
    ) -> Result<DomainInfo> {
        self.resolver
            .register(domain, category, subcategories, self.clock.now())
    }
}
