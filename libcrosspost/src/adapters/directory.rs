//! Adapter that "posts" into a local directory
//!
//! Each part is written to `<base_dir>/<destination>/<submission>/`: the
//! prepared files, prefixed with their order, and a `post.json` manifest
//! holding the effective options. Useful for dry runs of the daemon and for
//! inspecting exactly what a real site would have received.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::adapters::{Account, DestinationAdapter, FileRequirements, SubmissionPart};
use crate::error::Result;
use crate::options::EffectiveOptions;
use crate::types::PostResponse;

pub struct DirectoryAdapter {
    website: String,
    rate_limit_free: bool,
    file_requirements: Option<FileRequirements>,
}

impl DirectoryAdapter {
    pub fn new(website: impl Into<String>) -> Self {
        Self {
            website: website.into(),
            rate_limit_free: true,
            file_requirements: None,
        }
    }

    pub fn with_requirements(mut self, requirements: FileRequirements) -> Self {
        self.file_requirements = Some(requirements);
        self
    }

    pub fn serialized(mut self) -> Self {
        self.rate_limit_free = false;
        self
    }

    /// Directory a part for `destination` of `submission_id` is written to
    pub fn target_dir(base_dir: &Path, destination: &str, submission_id: &str) -> PathBuf {
        base_dir
            .join(sanitize(destination))
            .join(sanitize(submission_id))
    }
}

/// Keep path components to a safe character set
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[async_trait]
impl DestinationAdapter for DirectoryAdapter {
    fn website(&self) -> &str {
        &self.website
    }

    fn rate_limit_free(&self) -> bool {
        self.rate_limit_free
    }

    fn file_requirements(&self) -> Option<FileRequirements> {
        self.file_requirements.clone()
    }

    async fn submit(
        &self,
        part: &SubmissionPart,
        options: &EffectiveOptions,
        account: &Account,
    ) -> Result<PostResponse> {
        let dir = Self::target_dir(
            &account.context.base_dir,
            &part.destination,
            &part.submission_id,
        );

        if account.context.debug {
            info!(
                destination = %part.destination,
                files = part.files.len(),
                path = %dir.display(),
                "Debug mode, not writing"
            );
            return Ok(PostResponse::success(
                &self.website,
                format!("Debug mode: would write {} file(s)", part.files.len()),
            ));
        }

        tokio::fs::create_dir_all(&dir).await?;

        let mut written = Vec::with_capacity(part.files.len());
        for file in &part.files {
            let name = format!("{:02}-{}", file.order, sanitize(&file.name));
            tokio::fs::write(dir.join(&name), &file.data).await?;
            debug!(file = %name, bytes = file.data.len(), "Wrote file");
            written.push(json!({
                "name": name,
                "type": file.mime_type,
                "size": file.data.len(),
            }));
        }

        let manifest = json!({
            "submission_id": part.submission_id,
            "destination": part.destination,
            "website": self.website,
            "account": account.name,
            "auth_id": account.context.auth_id,
            "title": part.title,
            "options": options,
            "files": written,
        });
        let manifest = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(dir.join("post.json"), manifest).await?;

        info!(
            destination = %part.destination,
            submission_id = %part.submission_id,
            path = %dir.display(),
            "Saved submission"
        );

        Ok(
            PostResponse::success(&self.website, format!("Saved {} file(s)", part.files.len()))
                .with_additional_info(json!({ "path": dir })),
        )
    }
}
