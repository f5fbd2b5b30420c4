//! Transform worker actor
//!
//! A worker owns one `TransformEngine` (and therefore one decode cache) for
//! its whole lifetime. It runs either on a dedicated OS thread or as a
//! `crosspost-transform` child process speaking the JSON-lines protocol.
//! Requests are never pipelined: a worker serves one request at a time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::engine::TransformEngine;
use super::protocol::{decode_line, encode_line, TransformRequest, TransformResponse, TransformedFile};
use crate::error::TransformError;

/// Longest a worker may take to answer one request before it is given up on
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// How workers are run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WorkerBackend {
    /// Dedicated OS thread inside this process
    #[default]
    InProcess,
    /// Child process running the given worker program
    Subprocess { program: PathBuf },
}

struct Job {
    request: TransformRequest,
    reply: oneshot::Sender<Result<TransformedFile, TransformError>>,
}

enum Channel {
    Thread {
        jobs: mpsc::UnboundedSender<Job>,
    },
    Process {
        child: Child,
        stdin: ChildStdin,
        stdout: BufReader<ChildStdout>,
    },
    Closed,
}

pub struct TransformWorker {
    name: String,
    channel: Mutex<Channel>,
    alive: AtomicBool,
    request_timeout: Duration,
}

impl TransformWorker {
    /// Start a worker. `decodes` is bumped on every source decode (in-process only).
    pub fn spawn(
        name: impl Into<String>,
        backend: &WorkerBackend,
        decodes: Arc<AtomicU64>,
    ) -> Result<Self, TransformError> {
        let name = name.into();
        let channel = match backend {
            WorkerBackend::InProcess => spawn_thread(&name, decodes)?,
            WorkerBackend::Subprocess { program } => spawn_process(program)?,
        };
        debug!(worker = %name, "Transform worker started");

        Ok(Self {
            name,
            channel: Mutex::new(channel),
            alive: AtomicBool::new(true),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Give up on a request (and the worker) after `timeout`
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the worker thread or process has gone away
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub async fn transform(&self, request: TransformRequest) -> Result<TransformedFile, TransformError> {
        let mut channel = self.channel.lock().await;
        let exchange = async {
            match &mut *channel {
                Channel::Thread { jobs } => {
                    let (reply, response) = oneshot::channel();
                    if jobs.send(Job { request, reply }).is_err() {
                        Err(TransformError::Worker(format!("{} has stopped", self.name)))
                    } else {
                        response.await.unwrap_or_else(|_| {
                            Err(TransformError::Worker(format!(
                                "{} dropped the request",
                                self.name
                            )))
                        })
                    }
                }
                Channel::Process { stdin, stdout, .. } => round_trip(stdin, stdout, &request)
                    .await
                    .and_then(TransformResponse::into_result),
                Channel::Closed => Err(TransformError::Worker(format!("{} is shut down", self.name))),
            }
        };

        // A timed-out exchange leaves the pipe mid-reply, so the worker is done for
        let result = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(TransformError::Worker(format!(
                    "{} did not answer within {:?}",
                    self.name, self.request_timeout
                )))
            });

        if let Err(TransformError::Worker(reason)) = &result {
            warn!(worker = %self.name, %reason, "Transform worker lost");
            self.alive.store(false, Ordering::Release);
        }
        result
    }

    /// Stop the worker and wait for a child process to exit
    pub async fn shutdown(&self) {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        let mut channel = self.channel.lock().await;
        match std::mem::replace(&mut *channel, Channel::Closed) {
            Channel::Process {
                mut child, stdin, ..
            } => {
                // EOF on stdin ends the worker loop; a lost worker may not be reading
                drop(stdin);
                let stopped = if was_alive {
                    child.wait().await.map(drop)
                } else {
                    child.kill().await
                };
                if let Err(e) = stopped {
                    warn!(worker = %self.name, error = %e, "Failed to reap transform worker");
                }
            }
            // Dropping the sender ends the thread's receive loop
            Channel::Thread { jobs } => drop(jobs),
            Channel::Closed => {}
        }
        debug!(worker = %self.name, "Transform worker stopped");
    }
}

fn spawn_thread(name: &str, decodes: Arc<AtomicU64>) -> Result<Channel, TransformError> {
    let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

    std::thread::Builder::new()
        .name(format!("transform-{}", name))
        .spawn(move || {
            let mut engine = TransformEngine::with_counter(decodes);
            while let Some(job) = queue.blocking_recv() {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    engine.transform(&job.request)
                }))
                .unwrap_or_else(|_| {
                    Err(TransformError::Failed(format!(
                        "worker panicked transforming {}",
                        job.request.location
                    )))
                });
                let _ = job.reply.send(result);
            }
        })
        .map_err(|e| TransformError::Worker(format!("failed to start worker thread: {}", e)))?;

    Ok(Channel::Thread { jobs })
}

fn spawn_process(program: &Path) -> Result<Channel, TransformError> {
    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            TransformError::Worker(format!("failed to start {}: {}", program.display(), e))
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransformError::Worker("worker stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransformError::Worker("worker stdout unavailable".to_string()))?;

    Ok(Channel::Process {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn round_trip(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    request: &TransformRequest,
) -> Result<TransformResponse, TransformError> {
    let line = encode_line(request).map_err(|e| TransformError::Failed(e.to_string()))?;
    let io_error = |e: std::io::Error| TransformError::Worker(e.to_string());

    stdin.write_all(line.as_bytes()).await.map_err(io_error)?;
    stdin.flush().await.map_err(io_error)?;

    let mut reply = String::new();
    let read = stdout.read_line(&mut reply).await.map_err(io_error)?;
    if read == 0 {
        return Err(TransformError::Worker("worker process exited".to_string()));
    }

    decode_line(&reply).map_err(|e| TransformError::Worker(format!("malformed reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_png(dir: &TempDir, width: u32, height: u32) -> String {
        let img = RgbImage::from_pixel(width, height, Rgb([9, 9, 9]));
        let path = dir.path().join("source.png");
        img.save_with_format(&path, ImageFormat::Png).unwrap();
        path.to_string_lossy().to_string()
    }

    fn request(location: &str, quality: u8, width: u32) -> TransformRequest {
        TransformRequest {
            location: location.to_string(),
            quality,
            mime_type: "image/png".to_string(),
            width,
            buffer: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_decode_once() {
        let dir = TempDir::new().unwrap();
        let location = write_png(&dir, 400, 400);
        let decodes = Arc::new(AtomicU64::new(0));
        let worker = TransformWorker::spawn("test", &WorkerBackend::InProcess, decodes.clone())
            .unwrap();

        let (a, b) = tokio::join!(
            worker.transform(request(&location, 80, 200)),
            worker.transform(request(&location, 60, 100)),
        );

        assert_eq!(a.unwrap().mime_type, "image/jpeg");
        assert_eq!(b.unwrap().mime_type, "image/jpeg");
        assert_eq!(decodes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_errors_are_returned_not_fatal() {
        let decodes = Arc::new(AtomicU64::new(0));
        let worker = TransformWorker::spawn("test", &WorkerBackend::InProcess, decodes).unwrap();

        let result = worker.transform(request("/missing/file.png", 80, 10)).await;
        assert!(matches!(result, Err(TransformError::Read { .. })));
        assert!(worker.is_alive());

        let dir = TempDir::new().unwrap();
        let location = write_png(&dir, 10, 10);
        assert!(worker.transform(request(&location, 100, 10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_worker_program() {
        let result = TransformWorker::spawn(
            "test",
            &WorkerBackend::Subprocess {
                program: PathBuf::from("/nonexistent/crosspost-transform"),
            },
            Arc::new(AtomicU64::new(0)),
        );
        assert!(matches!(result, Err(TransformError::Worker(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unresponsive_worker_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let program = dir.path().join("stuck-worker");
        std::fs::write(&program, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let worker = TransformWorker::spawn(
            "stuck",
            &WorkerBackend::Subprocess { program },
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap()
        .with_request_timeout(Duration::from_millis(200));

        let result = worker.transform(request("/any/file.png", 80, 10)).await;
        assert!(matches!(result, Err(TransformError::Worker(reason)) if reason.contains("did not answer")));
        assert!(!worker.is_alive());
        worker.shutdown().await;
    }

    #[test]
    fn test_backend_deserialization() {
        let backend: WorkerBackend =
            toml::from_str("mode = \"subprocess\"\nprogram = \"/usr/bin/crosspost-transform\"")
                .unwrap();
        assert_eq!(
            backend,
            WorkerBackend::Subprocess {
                program: PathBuf::from("/usr/bin/crosspost-transform")
            }
        );
    }
}
