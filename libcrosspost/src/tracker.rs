//! In-memory status of queued and in-flight submissions
//!
//! The tracker is the only shared mutable structure of the orchestrator.
//! Writes come from the scheduler and are short; the lock is never held
//! across an `.await`. Every accepted change is published on the event bus.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::events::{Event, EventBus};
use crate::types::{PostInfo, PostInfoStatus, PostResponse, PostState, PostStatuses, Submission};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Submission {0} is not being posted")]
    UnknownSubmission(String),

    #[error("Submission {submission_id} has no destination {destination}")]
    UnknownPair {
        submission_id: String,
        destination: String,
    },

    #[error("Submission {0} is already queued")]
    AlreadyQueued(String),

    #[error("Submission {0} is already being posted")]
    AlreadyPosting(String),

    #[error("Submission {submission_id} lists destination {destination} more than once")]
    DuplicateDestination {
        submission_id: String,
        destination: String,
    },

    #[error("{destination}: illegal transition {from} -> {to}")]
    IllegalTransition {
        destination: String,
        from: PostState,
        to: PostState,
    },
}

/// A change the scheduler applies to one pair
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    /// Blocked. `condition` is false only while waiting for `post_at`.
    Waiting { condition: bool },
    /// One adapter invocation started
    Posting,
    Success(PostResponse),
    Error(PostResponse),
}

impl StatusUpdate {
    fn target(&self) -> PostState {
        match self {
            StatusUpdate::Waiting { .. } => PostState::Waiting,
            StatusUpdate::Posting => PostState::Posting,
            StatusUpdate::Success(_) => PostState::Success,
            StatusUpdate::Error(_) => PostState::Error,
        }
    }
}

fn is_legal(from: PostState, to: PostState) -> bool {
    use PostState::*;
    matches!(
        (from, to),
        (Queued, Waiting | Posting | Error)
            | (Waiting, Waiting | Posting | Error)
            | (Posting, Success | Error)
    )
}

#[derive(Default)]
struct TrackerState {
    queued: Vec<Submission>,
    posting: Vec<PostInfo>,
}

impl TrackerState {
    fn pair_mut(
        &mut self,
        submission_id: &str,
        destination: &str,
    ) -> Result<&mut PostInfoStatus, TrackerError> {
        let info = self
            .posting
            .iter_mut()
            .find(|info| info.submission_id == submission_id)
            .ok_or_else(|| TrackerError::UnknownSubmission(submission_id.to_string()))?;
        info.statuses
            .iter_mut()
            .find(|status| status.destination == destination)
            .ok_or_else(|| TrackerError::UnknownPair {
                submission_id: submission_id.to_string(),
                destination: destination.to_string(),
            })
    }
}

pub struct PostStatusTracker {
    state: Mutex<TrackerState>,
    events: EventBus,
}

impl PostStatusTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark_queued(&self, submission: &Submission) -> Result<(), TrackerError> {
        let mut state = self.lock();
        if state.queued.iter().any(|s| s.id == submission.id) {
            return Err(TrackerError::AlreadyQueued(submission.id.clone()));
        }
        if state.posting.iter().any(|info| info.submission_id == submission.id) {
            return Err(TrackerError::AlreadyPosting(submission.id.clone()));
        }
        state.queued.push(submission.clone());
        Ok(())
    }

    pub fn remove_queued(&self, submission_id: &str) -> Option<Submission> {
        let mut state = self.lock();
        let index = state.queued.iter().position(|s| s.id == submission_id)?;
        Some(state.queued.remove(index))
    }

    /// Keep the queued view in the same order as the queue itself
    pub fn reorder_queued(&self, order: &[String]) {
        let mut state = self.lock();
        state.queued.sort_by_key(|s| {
            order
                .iter()
                .position(|id| *id == s.id)
                .unwrap_or(usize::MAX)
        });
    }

    /// Move a submission from queued to posting with one QUEUED status per destination
    pub fn begin(&self, submission: &Submission) -> Result<PostInfo, TrackerError> {
        let mut seen = HashSet::new();
        for target in &submission.destinations {
            if !seen.insert(target.destination.as_str()) {
                return Err(TrackerError::DuplicateDestination {
                    submission_id: submission.id.clone(),
                    destination: target.destination.clone(),
                });
            }
        }

        let mut state = self.lock();
        if state.posting.iter().any(|info| info.submission_id == submission.id) {
            return Err(TrackerError::AlreadyPosting(submission.id.clone()));
        }
        state.queued.retain(|s| s.id != submission.id);

        let info = PostInfo {
            submission_id: submission.id.clone(),
            title: submission.title.clone(),
            statuses: submission
                .destinations
                .iter()
                .map(|target| PostInfoStatus::queued(&target.destination, target.post_at))
                .collect(),
            started_at: Utc::now(),
        };
        state.posting.push(info.clone());
        Ok(info)
    }

    /// Apply a status change to one pair and publish it
    pub fn update(
        &self,
        submission_id: &str,
        destination: &str,
        update: StatusUpdate,
    ) -> Result<PostInfoStatus, TrackerError> {
        let snapshot = {
            let mut state = self.lock();
            let status = state.pair_mut(submission_id, destination)?;
            let to = update.target();
            if !is_legal(status.status, to) {
                return Err(TrackerError::IllegalTransition {
                    destination: destination.to_string(),
                    from: status.status,
                    to,
                });
            }

            status.status = to;
            status.is_posting = false;
            status.waiting_for_condition = false;
            match update {
                StatusUpdate::Waiting { condition } => {
                    status.waiting_for_condition = condition;
                }
                StatusUpdate::Posting => {
                    status.is_posting = true;
                    status.attempts += 1;
                }
                StatusUpdate::Success(response) => {
                    status.message = response.message;
                    status.additional_info = response.additional_info;
                    status.error = None;
                    status.source = None;
                    status.stack = None;
                }
                StatusUpdate::Error(response) => {
                    status.error = response.error;
                    status.source = response.source;
                    status.stack = response.stack;
                }
            }
            status.updated_at = Utc::now();
            status.clone()
        };

        self.publish(submission_id, &snapshot);
        Ok(snapshot)
    }

    /// Move an ERROR pair back to WAITING ahead of an automatic retry.
    ///
    /// `post_at`, the destination and the attempt count are kept.
    pub fn reset_for_retry(
        &self,
        submission_id: &str,
        destination: &str,
    ) -> Result<PostInfoStatus, TrackerError> {
        let snapshot = {
            let mut state = self.lock();
            let status = state.pair_mut(submission_id, destination)?;
            if status.status != PostState::Error {
                return Err(TrackerError::IllegalTransition {
                    destination: destination.to_string(),
                    from: status.status,
                    to: PostState::Waiting,
                });
            }
            status.status = PostState::Waiting;
            status.is_posting = false;
            status.waiting_for_condition = true;
            status.updated_at = Utc::now();
            status.clone()
        };

        self.publish(submission_id, &snapshot);
        Ok(snapshot)
    }

    /// Remove a submission from the posting set, returning its final state
    pub fn finish(&self, submission_id: &str) -> Option<PostInfo> {
        let mut state = self.lock();
        let index = state
            .posting
            .iter()
            .position(|info| info.submission_id == submission_id)?;
        Some(state.posting.remove(index))
    }

    pub fn snapshot(&self) -> PostStatuses {
        let state = self.lock();
        PostStatuses {
            queued: state.queued.clone(),
            posting: state.posting.clone(),
        }
    }

    pub fn status(&self, submission_id: &str, destination: &str) -> Option<PostInfoStatus> {
        self.lock()
            .posting
            .iter()
            .find(|info| info.submission_id == submission_id)
            .and_then(|info| info.status(destination))
            .cloned()
    }

    pub fn post_info(&self, submission_id: &str) -> Option<PostInfo> {
        self.lock()
            .posting
            .iter()
            .find(|info| info.submission_id == submission_id)
            .cloned()
    }

    fn publish(&self, submission_id: &str, status: &PostInfoStatus) {
        self.events.emit(Event::PairStatusChanged {
            submission_id: submission_id.to_string(),
            status: status.clone(),
        });
    }
}
