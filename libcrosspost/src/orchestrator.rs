//! Posting orchestrator facade
//!
//! `Orchestrator` is the single entry point the binaries use. It owns the
//! shared pieces and keeps them consistent with each other:
//!
//! - `SubmissionQueue`: waiting submissions and in-flight cancellation
//! - `PostStatusTracker`: per-pair status, queried with [`Orchestrator::statuses`]
//! - `PostingScheduler`: drives pairs to a terminal state
//! - `TransformWorkerPool`: image normalization workers
//! - `EventBus`: progress notifications
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcrosspost::adapters::mock::MockAdapter;
//! use libcrosspost::adapters::DestinationAdapter;
//! use libcrosspost::{Config, Orchestrator};
//!
//! # async fn example() -> libcrosspost::Result<()> {
//! let config = Config::load()?;
//! let orchestrator = Orchestrator::from_config(&config, |destination| {
//!     Arc::new(MockAdapter::success(destination.website())) as Arc<dyn DestinationAdapter>
//! });
//!
//! let mut events = orchestrator.subscribe();
//! orchestrator.drain().await;
//! # let _ = events.try_recv();
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{Account, DestinationAdapter};
use crate::config::{Config, DestinationConfig};
use crate::error::{CrosspostError, Result};
use crate::events::{Event, EventBus, EventReceiver};
use crate::options::GenericOptions;
use crate::queue::{CancelOutcome, SubmissionQueue};
use crate::scheduler::{Destination, PostingScheduler, SchedulerConfig};
use crate::tracker::{PostStatusTracker, TrackerError};
use crate::transform::{TransformPoolConfig, TransformWorkerPool};
use crate::types::{PostStatuses, Submission};

pub struct Orchestrator {
    queue: Arc<SubmissionQueue>,
    tracker: Arc<PostStatusTracker>,
    events: EventBus,
    transforms: Arc<TransformWorkerPool>,
    scheduler: PostingScheduler,
}

impl Orchestrator {
    pub fn new(
        config: SchedulerConfig,
        generic: GenericOptions,
        destinations: Vec<Destination>,
        pool: TransformPoolConfig,
    ) -> Self {
        let events = EventBus::default();
        let queue = Arc::new(SubmissionQueue::new());
        let tracker = Arc::new(PostStatusTracker::new(events.clone()));
        let transforms = Arc::new(TransformWorkerPool::new(pool));
        let scheduler = PostingScheduler::new(
            config,
            generic,
            destinations,
            Arc::clone(&queue),
            Arc::clone(&tracker),
            events.clone(),
            Arc::clone(&transforms),
        );

        Self {
            queue,
            tracker,
            events,
            transforms,
            scheduler,
        }
    }

    /// Build from a loaded configuration.
    ///
    /// `adapter_for` is called once per configured destination. Every
    /// account shares the configuration's `RuntimeContext`.
    pub fn from_config<F>(config: &Config, mut adapter_for: F) -> Self
    where
        F: FnMut(&DestinationConfig) -> Arc<dyn DestinationAdapter>,
    {
        let context = Arc::new(config.context.clone());
        let destinations = config
            .destinations
            .iter()
            .map(|d| {
                let account = Account::shared(d.account.clone(), Arc::clone(&context));
                let mut destination = Destination::new(d.id.clone(), adapter_for(d), account)
                    .with_defaults(d.defaults.clone())
                    .with_rate_limit_free(d.rate_limit_free)
                    .with_prerequisites(d.depends_on.iter().cloned());
                if let Some(limit) = d.posts_per_hour {
                    destination = destination.with_posts_per_hour(limit);
                }
                destination
            })
            .collect();

        Self::new(
            config.scheduler_config(),
            config.defaults.clone(),
            destinations,
            config.pool_config(),
        )
    }

    /// Add a submission to the back of the queue.
    ///
    /// Rejects an empty id, an id that is already queued or posting, and a
    /// submission listing the same destination twice.
    pub fn enqueue(&self, submission: Submission) -> Result<()> {
        if submission.id.trim().is_empty() {
            return Err(CrosspostError::InvalidInput(
                "Submission id must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(target) = submission
            .destinations
            .iter()
            .find(|t| !seen.insert(t.destination.as_str()))
        {
            return Err(tracker_error(TrackerError::DuplicateDestination {
                submission_id: submission.id.clone(),
                destination: target.destination.clone(),
            }));
        }

        self.tracker.mark_queued(&submission).map_err(tracker_error)?;
        let submission_id = submission.id.clone();
        let destinations = submission
            .destinations
            .iter()
            .map(|t| t.destination.clone())
            .collect();
        if let Err(e) = self.queue.enqueue(submission) {
            self.tracker.remove_queued(&submission_id);
            return Err(e);
        }

        info!(submission_id = %submission_id, "Submission queued");
        self.events.emit(Event::SubmissionQueued {
            submission_id,
            destinations,
        });
        Ok(())
    }

    /// Cancel a queued or posting submission.
    ///
    /// A queued submission is dropped at once. A posting one stops waiting
    /// pairs immediately; adapter calls already running finish first.
    pub fn cancel(&self, submission_id: &str) -> CancelOutcome {
        let outcome = self.queue.cancel(submission_id);
        match outcome {
            CancelOutcome::Removed => {
                self.tracker.remove_queued(submission_id);
                info!(submission_id, "Queued submission cancelled");
                self.events.emit(Event::SubmissionCancelled {
                    submission_id: submission_id.to_string(),
                });
            }
            CancelOutcome::Signalled => info!(submission_id, "Cancelling submission"),
            CancelOutcome::NotFound => {}
        }
        outcome
    }

    /// Move a queued submission to `index` (clamped to the queue length)
    pub fn reorder(&self, submission_id: &str, index: usize) -> Result<()> {
        self.queue.reorder(submission_id, index)?;
        self.tracker.reorder_queued(&self.queue.queued_ids());
        Ok(())
    }

    pub fn statuses(&self) -> PostStatuses {
        self.tracker.snapshot()
    }

    pub fn tracker(&self) -> &PostStatusTracker {
        &self.tracker
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn transforms(&self) -> &TransformWorkerPool {
        &self.transforms
    }

    /// Post until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        self.scheduler.run(shutdown).await
    }

    /// Post everything queued, then return
    pub async fn drain(&self) {
        self.scheduler.drain().await
    }

    /// Stop all transform workers
    pub async fn shutdown(&self) {
        self.transforms.shutdown().await
    }
}

fn tracker_error(error: TrackerError) -> CrosspostError {
    CrosspostError::InvalidInput(error.to_string())
}
