//! Ordered signal processing.
//!
//! Every signal, query and command goes onto one FIFO queue drained by a
//! single worker thread that owns the [`ActivityCoordinator`] and the
//! [`ExportPipeline`]. Nothing is dropped under contention, and a
//! start/stop/merge sequence never interleaves with another one.
//!
//! Grace-period timers are sleeper threads that push
//! [`Signal::DeferredStopFired`] onto the same queue when they wake.

use chrono::NaiveDate;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::{ActivityCoordinator, DeferredStopScheduler, Signal, TrackingSnapshot};
use crate::error::{Result, TrackerError};
use crate::export::{ExportOutcome, ExportPipeline};
use crate::types::{DailyDomainRecord, DomainInfo};

type Reply<T> = Sender<Result<T>>;

pub enum Job {
    Signal(Signal),
    BrowsingData {
        date: Option<NaiveDate>,
        reply: Reply<Vec<DailyDomainRecord>>,
    },
    TrackingSnapshot {
        reply: Sender<TrackingSnapshot>,
    },
    RegisterDomain {
        domain: String,
        category: String,
        subcategories: Vec<String>,
        reply: Reply<DomainInfo>,
    },
    SyncToDrive {
        date: Option<NaiveDate>,
        reply: Reply<ExportOutcome>,
    },
    /// Like `Signal`, but answers once the signal has been applied.
    SignalAndWait {
        signal: Signal,
        reply: Sender<()>,
    },
    Shutdown,
}

/// Cloneable sending side of the queue.
#[derive(Clone)]
pub struct DispatchHandle {
    sender: Sender<Job>,
}

pub struct JobQueue {
    receiver: Receiver<Job>,
}

pub fn job_queue() -> (DispatchHandle, JobQueue) {
    let (sender, receiver) = mpsc::channel();
    (DispatchHandle { sender }, JobQueue { receiver })
}

impl DispatchHandle {
    fn send(&self, job: Job) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|_| TrackerError::WorkerUnavailable)
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Job) -> Result<T> {
        let (reply, response) = mpsc::channel();
        self.send(build(reply))?;
        response.recv().map_err(|_| TrackerError::WorkerUnavailable)
    }

    /// Fire-and-forget.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.send(Job::Signal(signal))
    }

    /// Enqueues `signal` and blocks until the worker has applied it.
    pub fn signal_and_wait(&self, signal: Signal) -> Result<()> {
        self.request(|reply| Job::SignalAndWait { signal, reply })
    }

    pub fn browsing_data(&self, date: Option<NaiveDate>) -> Result<Vec<DailyDomainRecord>> {
        self.request(|reply| Job::BrowsingData { date, reply })?
    }

    pub fn tracking_snapshot(&self) -> Result<TrackingSnapshot> {
        self.request(|reply| Job::TrackingSnapshot { reply })
    }

    pub fn register_domain(
        &self,
        domain: &str,
        category: &str,
        subcategories: Vec<String>,
    ) -> Result<DomainInfo> {
        self.request(|reply| Job::RegisterDomain {
            domain: domain.to_string(),
            category: category.to_string(),
            subcategories,
            reply,
        })?
    }

    /// Exports `date` (today when `None`).
    pub fn sync_to_drive(&self, date: Option<NaiveDate>) -> Result<ExportOutcome> {
        self.request(|reply| Job::SyncToDrive { date, reply })?
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Job::Shutdown)
    }
}

/// Timer-thread scheduler feeding fired stops back into the queue.
pub struct QueueScheduler {
    handle: DispatchHandle,
}

impl QueueScheduler {
    pub fn new(handle: DispatchHandle) -> Self {
        Self { handle }
    }
}

impl DeferredStopScheduler for QueueScheduler {
    fn schedule(&self, generation: u64, delay: Duration) {
        let handle = self.handle.clone();
        let spawned = thread::Builder::new()
            .name(format!("grace-timer-{}", generation))
            .spawn(move || {
                thread::sleep(delay);
                if handle
                    .signal(Signal::DeferredStopFired { generation })
                    .is_err()
                {
                    debug!(generation, "Worker gone before deferred stop fired");
                }
            });
        if let Err(err) = spawned {
            warn!(generation, error = %err, "Failed to spawn grace timer");
        }
    }
}

impl JobQueue {
    /// Starts the worker. It runs until [`DispatchHandle::shutdown`].
    pub fn spawn_worker(
        self,
        coordinator: ActivityCoordinator,
        exporter: ExportPipeline,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("signal-worker".to_string())
            .spawn(move || run_worker(self.receiver, coordinator, exporter))
    }
}

fn run_worker(receiver: Receiver<Job>, mut coordinator: ActivityCoordinator, exporter: ExportPipeline) {
    info!("Signal worker started");
    for job in receiver.iter() {
        match job {
            Job::Signal(signal) => coordinator.handle(signal),
            Job::SignalAndWait { signal, reply } => {
                coordinator.handle(signal);
                let _ = reply.send(());
            }
            Job::BrowsingData { date, reply } => {
                let _ = reply.send(coordinator.browsing_data(date));
            }
            Job::TrackingSnapshot { reply } => {
                let _ = reply.send(coordinator.tracking_snapshot());
            }
            Job::RegisterDomain {
                domain,
                category,
                subcategories,
                reply,
            } => {
                let _ = reply.send(coordinator.register_domain(&domain, &category, subcategories));
            }
            Job::SyncToDrive { date, reply } => {
                let date = date.unwrap_or_else(|| coordinator.today());
                let result = exporter.export_snapshot(date);
                if let Err(err) = &result {
                    warn!(date = %date, error = %err, "Snapshot export failed");
                }
                let _ = reply.send(result);
            }
            Job::Shutdown => break,
        }
    }
    info!("Signal worker stopped");
}
