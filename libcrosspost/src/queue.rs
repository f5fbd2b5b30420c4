//! FIFO of submissions awaiting posting
//!
//! A submission lives in exactly one of two places: the waiting queue, or the
//! in-flight set once the scheduler has taken it. In-flight submissions carry
//! a cancellation token the scheduler's tasks observe.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CrosspostError, Result};
use crate::types::Submission;

/// What `cancel` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The submission was still queued and has been dropped
    Removed,
    /// The submission was in flight; its tasks have been told to stop
    Signalled,
    NotFound,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<Submission>,
    in_flight: HashMap<String, CancellationToken>,
}

#[derive(Default)]
pub struct SubmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a submission. Ids must be unique among queued and in-flight work.
    pub fn enqueue(&self, submission: Submission) -> Result<()> {
        {
            let mut state = self.lock();
            if state.in_flight.contains_key(&submission.id)
                || state.waiting.iter().any(|s| s.id == submission.id)
            {
                return Err(CrosspostError::InvalidInput(format!(
                    "submission {} is already queued",
                    submission.id
                )));
            }
            debug!(submission_id = %submission.id, "Submission enqueued");
            state.waiting.push_back(submission);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest queued submission and mark it in flight
    pub fn dequeue_next(&self) -> Option<(Submission, CancellationToken)> {
        let mut state = self.lock();
        let submission = state.waiting.pop_front()?;
        let token = CancellationToken::new();
        state
            .in_flight
            .insert(submission.id.clone(), token.clone());
        Some((submission, token))
    }

    pub fn cancel(&self, submission_id: &str) -> CancelOutcome {
        let mut state = self.lock();
        if let Some(index) = state.waiting.iter().position(|s| s.id == submission_id) {
            state.waiting.remove(index);
            return CancelOutcome::Removed;
        }
        match state.in_flight.get(submission_id) {
            Some(token) => {
                token.cancel();
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Move a queued submission to `index` (clamped to the end of the queue)
    pub fn reorder(&self, submission_id: &str, index: usize) -> Result<()> {
        let mut state = self.lock();
        let current = state
            .waiting
            .iter()
            .position(|s| s.id == submission_id)
            .ok_or_else(|| {
                CrosspostError::InvalidInput(format!(
                    "submission {} is not waiting in the queue",
                    submission_id
                ))
            })?;
        if let Some(submission) = state.waiting.remove(current) {
            let index = index.min(state.waiting.len());
            state.waiting.insert(index, submission);
        }
        Ok(())
    }

    /// Forget an in-flight submission once the scheduler is done with it
    pub fn complete(&self, submission_id: &str) {
        self.lock().in_flight.remove(submission_id);
    }

    pub fn queued(&self) -> Vec<Submission> {
        self.lock().waiting.iter().cloned().collect()
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.lock().waiting.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().waiting.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Resolve once something has been enqueued since the last wake-up
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}
