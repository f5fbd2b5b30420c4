//! Mock adapter implementation for testing
//!
//! This module provides a configurable adapter that can simulate successes,
//! site-reported errors, transport failures, panics and slow calls. It's
//! designed for integration tests of the scheduler without any network access.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::adapters::{Account, DestinationAdapter, FileRequirements, SubmissionPart};
use crate::error::{AdapterError, Result};
use crate::options::EffectiveOptions;
use crate::types::PostResponse;

/// One scripted outcome of a `submit` call
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Success response carrying this message
    Success(String),
    /// Response whose `error` field is set
    Failure(String),
    /// `Err` returned from `submit`
    Error(AdapterError),
    /// `submit` panics
    Panic,
}

/// What a single `submit` call received
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub submission_id: String,
    pub destination: String,
    pub account: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub file_names: Vec<String>,
    pub mime_types: Vec<String>,
    pub file_sizes: Vec<usize>,
}

/// Configuration for mock adapter behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Website name reported in responses
    pub website: String,

    /// Outcomes consumed one per call, in order
    pub script: Arc<Mutex<VecDeque<MockResponse>>>,

    /// Outcome once the script is exhausted
    pub fallback: MockResponse,

    /// Delay before completing a call (simulates network latency)
    pub delay: Duration,

    pub rate_limit_free: bool,

    pub file_requirements: Option<FileRequirements>,

    /// Number of times submit has been called
    pub call_count: Arc<AtomicUsize>,

    /// Calls currently inside submit
    pub active: Arc<AtomicUsize>,

    /// Highest number of simultaneous calls observed
    pub max_active: Arc<AtomicUsize>,

    /// Calls that have been made (for verification)
    pub calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            website: "mock".to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: MockResponse::Success("posted".to_string()),
            delay: Duration::from_millis(0),
            rate_limit_free: false,
            file_requirements: None,
            call_count: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock adapter for testing
///
/// Clones share counters and the script, so a test can keep a handle after
/// handing the adapter to the orchestrator.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    config: MockConfig,
}

impl MockAdapter {
    /// Create a new mock adapter with the given configuration
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Create a mock adapter that always succeeds
    pub fn success(website: &str) -> Self {
        Self::new(MockConfig {
            website: website.to_string(),
            ..Default::default()
        })
    }

    /// Create a mock adapter whose responses always carry `error`
    pub fn failing(website: &str, error: &str) -> Self {
        Self::new(MockConfig {
            website: website.to_string(),
            fallback: MockResponse::Failure(error.to_string()),
            ..Default::default()
        })
    }

    /// Create a mock adapter that plays `script` and then succeeds
    pub fn scripted(website: &str, script: Vec<MockResponse>) -> Self {
        Self::new(MockConfig {
            website: website.to_string(),
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        })
    }

    /// Create a mock adapter with a delay
    pub fn with_delay(website: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            website: website.to_string(),
            delay,
            ..Default::default()
        })
    }

    pub fn rate_limit_free(mut self) -> Self {
        self.config.rate_limit_free = true;
        self
    }

    pub fn requiring(mut self, requirements: FileRequirements) -> Self {
        self.config.file_requirements = Some(requirements);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    /// Get the number of times submit was called
    pub fn call_count(&self) -> usize {
        self.config.call_count.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping submit calls seen so far
    pub fn max_concurrent(&self) -> usize {
        self.config.max_active.load(Ordering::SeqCst)
    }

    /// Get every call that was made
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.config.calls).clone()
    }

    fn next_response(&self) -> MockResponse {
        lock(&self.config.script)
            .pop_front()
            .unwrap_or_else(|| self.config.fallback.clone())
    }
}

/// Decrements the active-call gauge even if the call panics or is aborted
struct ActiveCall(Arc<AtomicUsize>);

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DestinationAdapter for MockAdapter {
    fn website(&self) -> &str {
        &self.config.website
    }

    fn rate_limit_free(&self) -> bool {
        self.config.rate_limit_free
    }

    fn file_requirements(&self) -> Option<FileRequirements> {
        self.config.file_requirements.clone()
    }

    async fn submit(
        &self,
        part: &SubmissionPart,
        options: &EffectiveOptions,
        account: &Account,
    ) -> Result<PostResponse> {
        self.config.call_count.fetch_add(1, Ordering::SeqCst);
        let now_active = self.config.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.config.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveCall(Arc::clone(&self.config.active));

        lock(&self.config.calls).push(RecordedCall {
            submission_id: part.submission_id.clone(),
            destination: part.destination.clone(),
            account: account.name.clone(),
            title: options.title().map(str::to_string),
            tags: options.tags().to_vec(),
            file_names: part.files.iter().map(|f| f.name.clone()).collect(),
            mime_types: part.files.iter().map(|f| f.mime_type.clone()).collect(),
            file_sizes: part.files.iter().map(|f| f.data.len()).collect(),
        });

        // Simulate delay
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        match self.next_response() {
            MockResponse::Success(message) => Ok(PostResponse::success(&self.config.website, message)
                .with_additional_info(serde_json::json!({
                    "url": format!("https://{}.example/{}", self.config.website, part.submission_id),
                }))),
            MockResponse::Failure(error) => Ok(PostResponse::failure(&self.config.website, error)
                .with_source(format!("https://{}.example", self.config.website))),
            MockResponse::Error(error) => Err(error.into()),
            MockResponse::Panic => panic!("mock adapter {} panicked", self.config.website),
        }
    }
}
