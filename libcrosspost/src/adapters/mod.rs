//! Destination adapter abstraction
//!
//! An adapter knows how to deliver one prepared part of a submission to one
//! website. The scheduler owns everything around the call: option
//! resolution, file normalization, waiting, retries, timeouts and status.
//! Adapters only ever see explicit inputs; identity and paths come in
//! through the `Account`, never from ambient global state.
//!
//! # Examples
//!
//! ```no_run
//! use libcrosspost::adapters::{mock::MockAdapter, Account, DestinationAdapter, RuntimeContext};
//!
//! let adapter = MockAdapter::success("gallery");
//! let account = Account::new("artist", RuntimeContext::default());
//! assert_eq!(adapter.website(), "gallery");
//! # let _ = account;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::options::EffectiveOptions;
use crate::types::{FileRecord, ImageMimeType, PostResponse};

pub mod directory;

// Mock adapter is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Process-level identity and paths, passed in explicitly
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContext {
    /// Identifier of the local user the orchestrator acts for
    #[serde(default)]
    pub auth_id: String,
    /// Root directory for anything adapters write locally
    #[serde(default)]
    pub base_dir: PathBuf,
    /// Adapters must not publish anything when set
    #[serde(default)]
    pub debug: bool,
}

/// The account a destination posts with
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub context: Arc<RuntimeContext>,
}

impl Account {
    pub fn new(name: impl Into<String>, context: RuntimeContext) -> Self {
        Self::shared(name, Arc::new(context))
    }

    pub fn shared(name: impl Into<String>, context: Arc<RuntimeContext>) -> Self {
        Self {
            name: name.into(),
            context,
        }
    }
}

/// How a destination wants image files normalized before upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequirements {
    /// Widest image the site accepts, in pixels
    pub max_width: u32,
    /// Encoder quality for re-encoded images
    pub quality: u8,
    /// Image types the site accepts; empty means any
    #[serde(default)]
    pub accepted_types: Vec<ImageMimeType>,
}

impl FileRequirements {
    /// Type to request for a source of `source_type`
    pub fn target_type(&self, source_type: ImageMimeType) -> ImageMimeType {
        if self.accepted_types.is_empty() || self.accepted_types.contains(&source_type) {
            source_type
        } else {
            self.accepted_types[0]
        }
    }
}

/// File bytes ready to hand to a site
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub order: u32,
    pub data: Vec<u8>,
}

impl PreparedFile {
    pub fn new(record: &FileRecord, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            mime_type: mime_type.into(),
            order: record.order,
            data,
        }
    }
}

/// What one adapter call posts: a submission's files for one destination
#[derive(Debug, Clone)]
pub struct SubmissionPart {
    pub submission_id: String,
    pub destination: String,
    pub title: Option<String>,
    pub files: Vec<PreparedFile>,
}

/// Contract every destination implements
///
/// `submit` must set `website` on every response and must populate either
/// the success fields (`message`, `additional_info`) or the error fields
/// (`error`, `stack`, `source`), never both. Failures may also be returned
/// as `Err`; the scheduler treats both forms the same way.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Website identifier reported in every response
    fn website(&self) -> &str;

    /// Sites without rate limits skip per-destination serialization
    fn rate_limit_free(&self) -> bool {
        false
    }

    /// Normalization to apply to image files before `submit`, if any
    fn file_requirements(&self) -> Option<FileRequirements> {
        None
    }

    async fn submit(
        &self,
        part: &SubmissionPart,
        options: &EffectiveOptions,
        account: &Account,
    ) -> Result<PostResponse>;
}
