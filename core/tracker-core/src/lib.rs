//! # tracker-core
//!
//! Session tracking and duration accrual for tabtime, shared by the daemon
//! and its clients.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Ordering comes from a single
//!   worker thread draining a FIFO queue ([`dispatch`]).
//! - **One open session**: [`SessionTracker`] owns the only open session; the
//!   persisted [`TrackingState`] slot mirrors it for crash recovery.
//! - **Collaborators behind traits**: storage ([`TrackerStore`]), time
//!   ([`Clock`]), classification ([`Classifier`]), encryption and upload
//!   ([`Encryptor`], [`Uploader`]).
//! - **Graceful degradation**: classification failures record
//!   `Uncategorized`; handler failures are logged, never fatal.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tracker_core::*;
//!
//! let store: Arc<dyn TrackerStore> = Arc::new(MemoryStore::new());
//! let mut tracker = SessionTracker::new(store.clone(), config.utc_offset());
//! tracker.start("News", "news.example-News", "news.example", Utc::now())?;
//! let closed = tracker.stop(Utc::now())?;
//! ```

pub mod aggregator;
pub mod classify;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod resolver;
pub mod store;
pub mod tracker;
pub mod types;

pub use aggregator::DurationAggregator;
pub use classify::{
    parse_classification_response, Classifier, ClassifierChain, ClassifyError, CommandClassifier,
    RuleTableClassifier,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, tabtime_dir, TrackerConfig};
pub use coordinator::{ActivityCoordinator, DeferredStopScheduler, Signal, TrackingSnapshot, Visibility};
pub use dispatch::{job_queue, DispatchHandle, JobQueue, QueueScheduler};
pub use error::{Result, TrackerError};
pub use export::{
    snapshot_name, AesGcmEncryptor, DirectoryUploader, Encryptor, ExportOutcome, ExportPipeline,
    Uploader,
};
pub use resolver::{extract_domain, CategoryResolver};
pub use store::{MemoryStore, TrackerStore};
pub use tracker::{RecoveryOutcome, SessionTracker, StartOutcome, TrackerState};
pub use types::*;
