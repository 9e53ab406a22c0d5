//! Long-lived daemon state.
//!
//! Owns the dispatch handle into the signal worker. Every request handler
//! goes through [`DaemonState`], so all mutations are serialized on the
//! worker thread regardless of how many connections are open.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use tracker_core::{
    job_queue, ActivityCoordinator, AesGcmEncryptor, CategoryResolver, ClassifierChain, Clock,
    DirectoryUploader, DispatchHandle, ExportPipeline, QueueScheduler, RecoveryOutcome,
    SessionTracker, Signal, SystemClock, TrackerConfig, TrackerStore,
};

use crate::db::Db;

pub struct DaemonState {
    handle: DispatchHandle,
    _worker: JoinHandle<()>,
}

impl DaemonState {
    pub fn start(db: Db, config: &TrackerConfig) -> Result<Self, String> {
        let store: Arc<dyn TrackerStore> = Arc::new(db);
        let (handle, queue) = job_queue();

        let mut tracker = SessionTracker::new(Arc::clone(&store), config.utc_offset());
        let clock = Arc::new(SystemClock);
        match tracker.rehydrate(clock.now(), config.stale_after()) {
            Ok(RecoveryOutcome::NothingPersisted) => {}
            Ok(RecoveryOutcome::Resumed(session_id)) => {
                info!(session_id = %session_id, "Resumed persisted session");
            }
            Ok(RecoveryOutcome::ClosedStale(closed)) => {
                info!(
                    session_id = %closed.session.session_id,
                    domain_id = %closed.session.domain_id,
                    duration_secs = closed.duration_secs,
                    "Closed stale session left by previous run"
                );
            }
            Err(err) => {
                warn!(error = %err, "Failed to recover persisted session");
            }
        }

        let resolver = CategoryResolver::new(
            Arc::clone(&store),
            ClassifierChain::from_config(&config.classifier),
            config.ignored_domains.clone(),
        );
        let coordinator = ActivityCoordinator::new(
            tracker,
            resolver,
            clock,
            Box::new(QueueScheduler::new(handle.clone())),
            config.grace_period(),
        );

        let key_path = config.key_path().map_err(String::from)?;
        let sync_dir = config.sync_dir().map_err(String::from)?;
        let encryptor = AesGcmEncryptor::from_key_file(&key_path).map_err(String::from)?;
        let exporter = ExportPipeline::new(
            store,
            Box::new(encryptor),
            Box::new(DirectoryUploader::new(sync_dir)),
        );

        let worker = queue
            .spawn_worker(coordinator, exporter)
            .map_err(|err| format!("Failed to spawn signal worker: {}", err))?;

        Ok(Self {
            handle,
            _worker: worker,
        })
    }

    pub fn dispatch(&self) -> &DispatchHandle {
        &self.handle
    }
}

/// Periodically persists `last_seen_at` so a crash loses at most one interval.
pub fn spawn_heartbeat(handle: DispatchHandle, interval: std::time::Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(err) = handle.signal(Signal::Heartbeat) {
            warn!(error = %err, "Heartbeat could not reach signal worker");
            break;
        }
    });
}
