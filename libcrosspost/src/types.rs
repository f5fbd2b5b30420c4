//! Core types for Crosspost

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::options::DestinationOptions;

// ============================================================================
// Submissions
// ============================================================================

/// One user-authored unit of content, posted to every listed destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub parts: Vec<FileRecord>,
    #[serde(default)]
    pub destinations: Vec<DestinationTarget>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: Some(title.into()),
            parts: Vec::new(),
            destinations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_part(mut self, part: FileRecord) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_destination(mut self, target: DestinationTarget) -> Self {
        self.destinations.push(target);
        self
    }

    /// Files that should be sent to `destination`, in posting order.
    pub fn files_for(&self, destination: &str) -> Vec<&FileRecord> {
        let mut files: Vec<&FileRecord> = self
            .parts
            .iter()
            .filter(|f| !f.ignored_destinations.iter().any(|d| d == destination))
            .collect();
        files.sort_by_key(|f| f.order);
        files
    }
}

/// A destination a submission should be posted to, with the user's options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationTarget {
    pub destination: String,
    #[serde(default)]
    pub options: DestinationOptions,
    #[serde(default)]
    pub post_at: Option<DateTime<Utc>>,
}

impl DestinationTarget {
    pub fn new(destination: impl Into<String>, options: DestinationOptions) -> Self {
        Self {
            destination: destination.into(),
            options,
            post_at: None,
        }
    }

    pub fn at(mut self, post_at: DateTime<Utc>) -> Self {
        self.post_at = Some(post_at);
        self
    }
}

// ============================================================================
// Files
// ============================================================================

/// Where the bytes of a file live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileLocation {
    Path { path: PathBuf },
    Buffer {
        #[serde(with = "crate::transform::protocol::base64_bytes")]
        data: Vec<u8>,
    },
}

/// A file attached to a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub location: FileLocation,
    pub mime_type: String,
    pub name: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub size: u64,
    /// Destination ids this file must not be sent to
    #[serde(default)]
    pub ignored_destinations: Vec<String>,
}

impl FileRecord {
    pub fn from_path(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            id: Uuid::new_v4().to_string(),
            location: FileLocation::Path { path },
            mime_type: mime_type.into(),
            name,
            order: 0,
            size,
            ignored_destinations: Vec::new(),
        }
    }

    pub fn from_buffer(
        name: impl Into<String>,
        data: Vec<u8>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            size: data.len() as u64,
            location: FileLocation::Buffer { data },
            mime_type: mime_type.into(),
            name: name.into(),
            order: 0,
            ignored_destinations: Vec::new(),
        }
    }

    /// Key used to route transforms of this file to the same worker
    pub fn location_key(&self) -> String {
        match &self.location {
            FileLocation::Path { path } => path.to_string_lossy().to_string(),
            FileLocation::Buffer { .. } => format!("buffer:{}", self.id),
        }
    }

    /// Read the raw bytes of the file
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match &self.location {
            FileLocation::Path { path } => tokio::fs::read(path).await,
            FileLocation::Buffer { data } => Ok(data.clone()),
        }
    }
}

/// Supported image MIME types for transforms
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageMimeType {
    #[serde(rename = "image/jpeg", alias = "image/jpg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/gif")]
    Gif,
    #[serde(rename = "image/webp")]
    WebP,
}

impl ImageMimeType {
    /// Parse MIME type from a MIME string (e.g., "image/jpeg")
    pub fn from_mime_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Get the MIME type string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
        }
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Png => image::ImageFormat::Png,
            Self::Gif => image::ImageFormat::Gif,
            Self::WebP => image::ImageFormat::WebP,
        }
    }
}

impl std::fmt::Display for ImageMimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Status tracking
// ============================================================================

/// Posting state of one (submission, destination) pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostState {
    Queued,
    Posting,
    Waiting,
    Success,
    Error,
}

impl PostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PostState::Success | PostState::Error)
    }
}

impl std::fmt::Display for PostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Posting => write!(f, "posting"),
            Self::Waiting => write!(f, "waiting"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Status of one destination of an in-flight submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostInfoStatus {
    pub destination: String,
    pub post_at: Option<DateTime<Utc>>,
    pub status: PostState,
    /// True only while the adapter call for this pair is outstanding
    pub is_posting: bool,
    /// True while blocked on a precondition (cooldown, prerequisite, lane)
    pub waiting_for_condition: bool,
    /// Number of adapter invocations so far
    pub attempts: u32,
    pub message: Option<String>,
    pub additional_info: Option<serde_json::Value>,
    pub error: Option<String>,
    pub source: Option<String>,
    pub stack: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PostInfoStatus {
    pub fn queued(destination: impl Into<String>, post_at: Option<DateTime<Utc>>) -> Self {
        Self {
            destination: destination.into(),
            post_at,
            status: PostState::Queued,
            is_posting: false,
            waiting_for_condition: false,
            attempts: 0,
            message: None,
            additional_info: None,
            error: None,
            source: None,
            stack: None,
            updated_at: Utc::now(),
        }
    }
}

/// Posting state of one in-flight submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostInfo {
    pub submission_id: String,
    pub title: Option<String>,
    pub statuses: Vec<PostInfoStatus>,
    pub started_at: DateTime<Utc>,
}

impl PostInfo {
    pub fn status(&self, destination: &str) -> Option<&PostInfoStatus> {
        self.statuses.iter().find(|s| s.destination == destination)
    }

    /// Every pair has reached SUCCESS or ERROR (vacuously true with no pairs)
    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(|s| s.status.is_terminal())
    }
}

/// Everything the status view needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostStatuses {
    pub queued: Vec<Submission>,
    pub posting: Vec<PostInfo>,
}

// ============================================================================
// Adapter responses
// ============================================================================

/// Result of one adapter call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostResponse {
    pub website: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PostResponse {
    pub fn success(website: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            website: website.into(),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn failure(website: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            website: website.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_additional_info(mut self, info: serde_json::Value) -> Self {
        self.additional_info = Some(info);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// `website` is set and success and error fields are never both populated
    pub fn is_consistent(&self) -> bool {
        let has_success = self.message.is_some() || self.additional_info.is_some();
        let has_error = self.error.is_some() || self.stack.is_some() || self.source.is_some();
        !self.website.is_empty() && !(has_success && has_error)
    }
}
