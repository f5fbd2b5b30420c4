//! Crosspost - post one submission to many destinations
//!
//! This library provides the posting orchestrator: a submission queue, a
//! per-destination posting state machine with waiting, retries and
//! backoff, status tracking, option composition, and image normalization
//! through isolated transform workers.

pub mod adapters;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod options;
pub mod orchestrator;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod tracker;
pub mod transform;
pub mod types;

// Re-export commonly used types
pub use adapters::{Account, DestinationAdapter, RuntimeContext};
pub use config::Config;
pub use error::{CrosspostError, Result};
pub use events::{Event, EventBus};
pub use options::{DestinationOptions, EffectiveOptions, GenericOptions, SiteOptions};
pub use orchestrator::Orchestrator;
pub use queue::CancelOutcome;
pub use scheduler::{Destination, RetryPolicy, SchedulerConfig};
pub use types::{
    DestinationTarget, FileRecord, PostInfo, PostInfoStatus, PostResponse, PostState,
    PostStatuses, Submission,
};
