//! Posting scheduler
//!
//! Drives every (submission, destination) pair through
//! `QUEUED -> WAITING* -> POSTING -> {SUCCESS | ERROR}`.
//!
//! Submissions are admitted from the queue in FIFO order, bounded by
//! `max_active_submissions`. Each pair runs as its own task: it resolves
//! its effective options, waits out `post_at`, prerequisites, the hourly
//! budget, retry backoff and the destination lane, normalizes files through
//! the transform pool, then calls the adapter once per attempt under a
//! timeout. Failures of one pair never affect the others.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{Account, DestinationAdapter, PreparedFile, SubmissionPart};
use crate::error::{AdapterError, CrosspostError, TransformError, ValidationError};
use crate::events::{Event, EventBus, PairResult};
use crate::options::{resolve, DestinationOptions, EffectiveOptions, GenericOptions};
use crate::queue::SubmissionQueue;
use crate::rate_limiter::{DestinationLanes, RateLimiter};
use crate::tracker::{PostStatusTracker, StatusUpdate};
use crate::transform::{TransformRequest, TransformWorkerPool};
use crate::types::{FileLocation, ImageMimeType, PostResponse, PostState, Submission};

/// Automatic retries of failed adapter calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Add up to 25% random delay on top of the backoff
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// `min(base * 2^(retry-1), max_backoff)` for the 1-based `retry`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay before `retry`, including jitter when enabled
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() / 4) as u64;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often waiting pairs re-check their conditions
    pub poll_interval: Duration,
    /// Adapter calls allowed in flight at once, across all destinations
    pub max_outstanding: usize,
    /// Submissions posted concurrently; the rest stay queued
    pub max_active_submissions: usize,
    pub adapter_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_outstanding: 8,
            max_active_submissions: 4,
            adapter_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// A configured posting target
#[derive(Clone)]
pub struct Destination {
    pub id: String,
    pub adapter: Arc<dyn DestinationAdapter>,
    pub account: Account,
    pub defaults: DestinationOptions,
    /// Skip per-destination serialization even if the adapter asks for it
    pub rate_limit_free: bool,
    pub posts_per_hour: Option<u32>,
    /// Destinations of the same submission that must succeed first
    pub depends_on: Vec<String>,
}

impl Destination {
    pub fn new(id: impl Into<String>, adapter: Arc<dyn DestinationAdapter>, account: Account) -> Self {
        Self {
            id: id.into(),
            adapter,
            account,
            defaults: DestinationOptions::default(),
            rate_limit_free: false,
            posts_per_hour: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: DestinationOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_rate_limit_free(mut self, rate_limit_free: bool) -> Self {
        self.rate_limit_free = rate_limit_free;
        self
    }

    pub fn with_posts_per_hour(mut self, posts_per_hour: u32) -> Self {
        self.posts_per_hour = Some(posts_per_hour);
        self
    }

    pub fn with_prerequisites<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = prerequisites.into_iter().map(Into::into).collect();
        self
    }

    fn serialized(&self) -> bool {
        !(self.rate_limit_free || self.adapter.rate_limit_free())
    }
}

/// State shared by the pair tasks of one submission
struct SubmissionRun {
    submission: Submission,
    token: CancellationToken,
    shutdown: CancellationToken,
    /// Final state of each pair that has finished
    outcomes: Mutex<HashMap<String, PostState>>,
}

impl SubmissionRun {
    fn new(submission: Submission, token: CancellationToken, shutdown: CancellationToken) -> Self {
        Self {
            submission,
            token,
            shutdown,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    fn id(&self) -> &str {
        &self.submission.id
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.shutdown.is_cancelled()
    }

    async fn cancelled(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    fn record(&self, destination: &str, state: PostState) {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(destination.to_string(), state);
    }

    fn outcome(&self, destination: &str) -> Option<PostState> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(destination)
            .copied()
    }

    fn includes(&self, destination: &str) -> bool {
        self.submission
            .destinations
            .iter()
            .any(|t| t.destination == destination)
    }
}

/// Why a pair cannot post yet: whether it is a condition other than
/// `post_at`, and how long to sleep before checking again
type Blocker = (bool, Duration);

struct Shared {
    config: SchedulerConfig,
    generic: GenericOptions,
    destinations: HashMap<String, Destination>,
    queue: Arc<SubmissionQueue>,
    tracker: Arc<PostStatusTracker>,
    events: EventBus,
    transforms: Arc<TransformWorkerPool>,
    lanes: DestinationLanes,
    limiter: RateLimiter,
    outstanding: Arc<Semaphore>,
}

pub struct PostingScheduler {
    shared: Arc<Shared>,
}

impl PostingScheduler {
    pub fn new(
        config: SchedulerConfig,
        generic: GenericOptions,
        destinations: Vec<Destination>,
        queue: Arc<SubmissionQueue>,
        tracker: Arc<PostStatusTracker>,
        events: EventBus,
        transforms: Arc<TransformWorkerPool>,
    ) -> Self {
        let limits = destinations
            .iter()
            .filter_map(|d| d.posts_per_hour.map(|limit| (d.id.clone(), limit)))
            .collect();
        let outstanding = Arc::new(Semaphore::new(config.max_outstanding.max(1)));

        Self {
            shared: Arc::new(Shared {
                config,
                generic,
                destinations: destinations.into_iter().map(|d| (d.id.clone(), d)).collect(),
                queue,
                tracker,
                events,
                transforms,
                lanes: DestinationLanes::new(),
                limiter: RateLimiter::new(limits),
                outstanding,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Post queued submissions until `shutdown` is cancelled.
    ///
    /// Cancelling `shutdown` cancels every active submission; adapter calls
    /// already in flight still complete and record their result.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.drive(shutdown, false).await
    }

    /// Post until the queue is empty and no submission is active
    pub async fn drain(&self) {
        self.drive(CancellationToken::new(), true).await
    }

    async fn drive(&self, shutdown: CancellationToken, until_idle: bool) {
        let shared = &self.shared;
        let max_active = shared.config.max_active_submissions.max(1);
        let mut active: JoinSet<()> = JoinSet::new();

        loop {
            while active.len() < max_active && !shutdown.is_cancelled() {
                let Some((submission, token)) = shared.queue.dequeue_next() else {
                    break;
                };
                let run = Arc::new(SubmissionRun::new(submission, token, shutdown.clone()));
                active.spawn(Arc::clone(shared).run_submission(run));
            }

            if until_idle && active.is_empty() && shared.queue.is_empty() {
                break;
            }
            shared
                .limiter
                .cleanup_old_windows(Utc::now().timestamp() - 3600);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = active.join_next(), if !active.is_empty() => {
                    log_join_error("submission", joined);
                }
                _ = shared.queue.wait_for_work() => {}
                _ = sleep(shared.config.poll_interval) => {}
            }
        }

        // Let active submissions record the results of calls already in flight
        while let Some(joined) = active.join_next().await {
            log_join_error("submission", joined);
        }
        debug!("Scheduler stopped");
    }
}

fn log_join_error(kind: &str, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "{} task failed", kind);
    }
}

impl Shared {
    #[instrument(skip_all, fields(submission_id = %run.id()))]
    async fn run_submission(self: Arc<Self>, run: Arc<SubmissionRun>) {
        let submission_id = run.id().to_string();

        if let Err(e) = self.tracker.begin(&run.submission) {
            error!(error = %e, "Cannot start submission");
            self.tracker.remove_queued(&submission_id);
            self.queue.complete(&submission_id);
            self.events.emit(Event::SubmissionCancelled { submission_id });
            return;
        }
        info!(
            destinations = run.submission.destinations.len(),
            "Posting submission"
        );

        let mut pairs = JoinSet::new();
        for target in &run.submission.destinations {
            let destination = target.destination.clone();
            pairs.spawn(Arc::clone(&self).run_pair(Arc::clone(&run), destination));
        }
        while let Some(joined) = pairs.join_next().await {
            log_join_error("pair", joined);
        }
        self.settle(&run);

        let info = self.tracker.finish(&submission_id);
        self.queue.complete(&submission_id);

        if run.is_cancelled() {
            info!("Submission cancelled");
            self.events.emit(Event::SubmissionCancelled { submission_id });
        } else {
            let results: Vec<PairResult> = info
                .map(|info| info.statuses.iter().map(PairResult::from).collect())
                .unwrap_or_default();
            info!(
                succeeded = results.iter().filter(|r| r.status == PostState::Success).count(),
                failed = results.iter().filter(|r| r.status == PostState::Error).count(),
                "Submission fully posted"
            );
            self.events.emit(Event::SubmissionCompleted {
                submission_id,
                results,
            });
        }
    }

    /// Fail any pair a crashed task left without a terminal state
    fn settle(&self, run: &SubmissionRun) {
        let Some(info) = self.tracker.post_info(run.id()) else {
            return;
        };
        if info.is_complete() {
            return;
        }
        for status in info.statuses.iter().filter(|s| !s.status.is_terminal()) {
            error!(destination = %status.destination, "Pair ended without a result");
            self.set(
                run,
                &status.destination,
                StatusUpdate::Error(
                    PostResponse::failure(&status.destination, "Posting task ended unexpectedly")
                        .with_source("scheduler"),
                ),
            );
        }
    }

    #[instrument(skip_all, fields(submission_id = %run.id(), destination = %destination_id))]
    async fn run_pair(self: Arc<Self>, run: Arc<SubmissionRun>, destination_id: String) {
        let outcome = self.post_pair(&run, &destination_id).await;
        run.record(&destination_id, outcome);
    }

    async fn post_pair(&self, run: &SubmissionRun, destination_id: &str) -> PostState {
        let Some(target) = run
            .submission
            .destinations
            .iter()
            .find(|t| t.destination == destination_id)
        else {
            return PostState::Error;
        };

        let Some(destination) = self.destinations.get(destination_id) else {
            let error = ValidationError::UnknownDestination(destination_id.to_string());
            return self.fail(run, destination_id, destination_id, &error.into());
        };
        let website = destination.adapter.website().to_string();

        let options = match resolve(
            destination_id,
            &self.generic,
            &destination.defaults,
            &target.options,
        ) {
            Ok(options) => Arc::new(options),
            Err(e) => return self.fail(run, destination_id, &website, &e.into()),
        };

        let deadline = target.post_at.map(instant_for);
        let mut not_before: Option<Instant> = None;
        let mut part: Option<Arc<SubmissionPart>> = None;
        let mut retries = 0u32;
        let mut waiting: Option<bool> = None;

        loop {
            // WAITING until every condition clears, then take the lane
            let (prepared, lane) = loop {
                if run.is_cancelled() {
                    return self.cancel_pair(run, destination_id, &website);
                }

                let (condition, wake) = match self.blocker(run, destination, deadline, not_before) {
                    Err(e) => return self.fail(run, destination_id, &website, &e.into()),
                    Ok(Some(blocker)) => blocker,
                    Ok(None) => {
                        let Some(prepared) = part.clone() else {
                            match self.prepare(run, destination, &options).await {
                                Ok(prepared) => part = Some(Arc::new(prepared)),
                                Err(e) => return self.fail(run, destination_id, &website, &e.into()),
                            }
                            continue;
                        };
                        if !destination.serialized() {
                            break (prepared, None);
                        }
                        match self.lanes.try_acquire(destination_id) {
                            Some(guard) => break (prepared, Some(guard)),
                            None => (true, self.config.poll_interval),
                        }
                    }
                };

                if waiting != Some(condition) {
                    self.set(run, destination_id, StatusUpdate::Waiting { condition });
                    waiting = Some(condition);
                }
                tokio::select! {
                    _ = run.cancelled() => {}
                    _ = sleep(wake.min(self.config.poll_interval).max(Duration::from_millis(1))) => {}
                }
            };

            let (error, response) = match self
                .attempt(run, destination, prepared, Arc::clone(&options), lane)
                .await
            {
                Attempt::Cancelled => return self.cancel_pair(run, destination_id, &website),
                Attempt::Deferred => continue,
                Attempt::Posted(response) => {
                    info!(attempts = retries + 1, "Posted");
                    self.set(run, destination_id, StatusUpdate::Success(response));
                    return PostState::Success;
                }
                Attempt::Failed(error, response) => (error, response),
            };

            self.set(run, destination_id, StatusUpdate::Error(response));

            let max_retries = self.config.retry.max_retries;
            if !error.is_retryable() || retries >= max_retries || run.is_cancelled() {
                warn!(attempts = retries + 1, error = %error, "Posting failed");
                return PostState::Error;
            }

            retries += 1;
            let delay = self.config.retry.backoff(retries);
            warn!(
                "Transient error posting to {} (retry {}/{}): {}. Retrying in {:?}",
                destination_id, retries, max_retries, error, delay
            );
            if let Err(e) = self.tracker.reset_for_retry(run.id(), destination_id) {
                warn!(error = %e, "Cannot reset pair for retry");
                return PostState::Error;
            }
            waiting = Some(true);
            not_before = Some(Instant::now() + delay);
        }
    }

    /// Run one adapter invocation for a pair that is ready to post
    async fn attempt(
        &self,
        run: &SubmissionRun,
        destination: &Destination,
        part: Arc<SubmissionPart>,
        options: Arc<EffectiveOptions>,
        lane: Option<OwnedMutexGuard<()>>,
    ) -> Attempt {
        let permit = tokio::select! {
            permit = Arc::clone(&self.outstanding).acquire_owned() => permit,
            _ = run.cancelled() => return Attempt::Cancelled,
        };
        if run.is_cancelled() {
            return Attempt::Cancelled;
        }

        // Another pair of this destination may have spent the budget since
        // the last check
        if !self
            .limiter
            .check_and_record(&destination.id, Utc::now().timestamp())
        {
            return Attempt::Deferred;
        }
        self.set(run, &destination.id, StatusUpdate::Posting);

        let website = destination.adapter.website().to_string();
        let result = self.invoke(destination, part, options).await;
        drop(permit);
        drop(lane);

        match result {
            Ok(response) if !response.is_error() && response.is_consistent() => {
                Attempt::Posted(response)
            }
            Ok(mut response) if response.is_consistent() => {
                let error = CrosspostError::Adapter(AdapterError::Rejected(
                    response.error.clone().unwrap_or_default(),
                ));
                if response.source.is_none() {
                    response.source = Some(error.source_label().to_string());
                }
                if response.stack.is_none() {
                    response.stack = Some(format!("{:?}", error));
                }
                Attempt::Failed(error, response)
            }
            Ok(_) => {
                let error = CrosspostError::InvalidInput(format!(
                    "{} returned an inconsistent response",
                    website
                ));
                let response = error_response(&website, &error);
                Attempt::Failed(error, response)
            }
            Err(error) => {
                let response = error_response(&website, &error);
                Attempt::Failed(error, response)
            }
        }
    }

    /// Call the adapter on its own task so panics and hangs stay contained
    async fn invoke(
        &self,
        destination: &Destination,
        part: Arc<SubmissionPart>,
        options: Arc<EffectiveOptions>,
    ) -> crate::error::Result<PostResponse> {
        let adapter = Arc::clone(&destination.adapter);
        let account = destination.account.clone();
        let call = tokio::spawn(async move { adapter.submit(&part, &options, &account).await });
        let abort = call.abort_handle();

        match tokio::time::timeout(self.config.adapter_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AdapterError::Rejected(describe_join_error(join_error)).into()),
            Err(_) => {
                abort.abort();
                Err(CrosspostError::Timeout(self.config.adapter_timeout))
            }
        }
    }

    fn blocker(
        &self,
        run: &SubmissionRun,
        destination: &Destination,
        deadline: Option<Instant>,
        not_before: Option<Instant>,
    ) -> Result<Option<Blocker>, ValidationError> {
        let prerequisites: Vec<&String> = destination
            .depends_on
            .iter()
            .filter(|p| run.includes(p))
            .collect();

        for prerequisite in &prerequisites {
            if run.outcome(prerequisite) == Some(PostState::Error) {
                return Err(ValidationError::PrerequisiteFailed {
                    destination: destination.id.clone(),
                    prerequisite: prerequisite.to_string(),
                });
            }
        }

        let now = Instant::now();
        if let Some(deadline) = deadline.filter(|d| *d > now) {
            return Ok(Some((false, deadline - now)));
        }
        if let Some(not_before) = not_before.filter(|t| *t > now) {
            return Ok(Some((true, not_before - now)));
        }
        if prerequisites
            .iter()
            .any(|p| run.outcome(p) != Some(PostState::Success))
        {
            return Ok(Some((true, self.config.poll_interval)));
        }

        let timestamp = Utc::now().timestamp();
        if !self.limiter.check(&destination.id, timestamp) {
            let wait = self.limiter.retry_after(timestamp).max(1) as u64;
            debug!(retry_after_secs = wait, "Hourly budget spent");
            return Ok(Some((true, Duration::from_secs(wait))));
        }

        Ok(None)
    }

    /// Collect the files of a pair, normalizing images the adapter wants normalized
    async fn prepare(
        &self,
        run: &SubmissionRun,
        destination: &Destination,
        options: &EffectiveOptions,
    ) -> Result<SubmissionPart, TransformError> {
        let requirements = destination.adapter.file_requirements();
        let mut files = Vec::new();

        for record in run.submission.files_for(&destination.id) {
            let source_type = ImageMimeType::from_mime_str(&record.mime_type);
            let file = match (&requirements, source_type) {
                (Some(requirements), Some(source_type)) => {
                    let buffer = match &record.location {
                        FileLocation::Buffer { data } => Some(data.clone()),
                        FileLocation::Path { .. } => None,
                    };
                    let transformed = self
                        .transforms
                        .submit(TransformRequest {
                            location: record.location_key(),
                            quality: requirements.quality,
                            mime_type: requirements.target_type(source_type).as_str().to_string(),
                            width: requirements.max_width,
                            buffer,
                        })
                        .await?;
                    debug!(
                        file = %record.name,
                        from = %record.mime_type,
                        to = %transformed.mime_type,
                        bytes = transformed.buffer.len(),
                        "Normalized file"
                    );
                    PreparedFile::new(record, transformed.mime_type, transformed.buffer)
                }
                _ => {
                    let data = record.read().await.map_err(|e| TransformError::Read {
                        location: record.location_key(),
                        reason: e.to_string(),
                    })?;
                    PreparedFile::new(record, record.mime_type.clone(), data)
                }
            };
            files.push(file);
        }

        Ok(SubmissionPart {
            submission_id: run.id().to_string(),
            destination: destination.id.clone(),
            title: options
                .title()
                .map(str::to_string)
                .or_else(|| run.submission.title.clone()),
            files,
        })
    }

    fn fail(
        &self,
        run: &SubmissionRun,
        destination_id: &str,
        website: &str,
        error: &CrosspostError,
    ) -> PostState {
        warn!(error = %error, "Pair failed without posting");
        self.set(
            run,
            destination_id,
            StatusUpdate::Error(error_response(website, error)),
        );
        PostState::Error
    }

    fn cancel_pair(&self, run: &SubmissionRun, destination_id: &str, website: &str) -> PostState {
        debug!("Pair cancelled before posting");
        self.set(
            run,
            destination_id,
            StatusUpdate::Error(
                PostResponse::failure(website, "Submission cancelled").with_source("scheduler"),
            ),
        );
        PostState::Error
    }

    fn set(&self, run: &SubmissionRun, destination_id: &str, update: StatusUpdate) {
        if let Err(e) = self.tracker.update(run.id(), destination_id, update) {
            warn!(error = %e, "Rejected status update");
        }
    }
}

enum Attempt {
    Posted(PostResponse),
    Failed(CrosspostError, PostResponse),
    /// The hourly budget ran out while waiting for a permit
    Deferred,
    Cancelled,
}

fn error_response(website: &str, error: &CrosspostError) -> PostResponse {
    PostResponse::failure(website, error.to_string())
        .with_source(error.source_label())
        .with_stack(format!("{:?}", error))
}

/// Tokio instant at which a wall-clock `post_at` arrives
fn instant_for(post_at: DateTime<Utc>) -> Instant {
    let delay = (post_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + delay
}

fn describe_join_error(error: JoinError) -> String {
    if !error.is_panic() {
        return "adapter call was cancelled".to_string();
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("adapter panicked: {}", message)
}
