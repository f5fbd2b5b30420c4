//! End-to-end scheduling scenarios against mock adapters
//!
//! Time-driven tests run on a paused clock, so backoffs, `post_at` waits and
//! adapter delays complete instantly while keeping their ordering.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libcrosspost::adapters::mock::{MockAdapter, MockResponse};
use libcrosspost::adapters::{Account, FileRequirements, RuntimeContext};
use libcrosspost::error::AdapterError;
use libcrosspost::events::{Event, EventReceiver, PairResult};
use libcrosspost::options::{GalleryOptions, Rating};
use libcrosspost::transform::TransformPoolConfig;
use libcrosspost::types::ImageMimeType;
use libcrosspost::{
    CancelOutcome, Destination, DestinationOptions, DestinationTarget, FileRecord,
    GenericOptions, Orchestrator, PostInfoStatus, PostState, RetryPolicy, SchedulerConfig,
    SiteOptions, Submission,
};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(100),
        max_outstanding: 8,
        max_active_submissions: 4,
        adapter_timeout: Duration::from_secs(30),
        retry: RetryPolicy::none(),
    }
}

fn with_retries(max_retries: u32) -> SchedulerConfig {
    SchedulerConfig {
        retry: RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter: false,
        },
        ..scheduler_config()
    }
}

fn destination(id: &str, adapter: &MockAdapter) -> Destination {
    Destination::new(
        id,
        Arc::new(adapter.clone()),
        Account::new("artist", RuntimeContext::default()),
    )
}

fn orchestrator(config: SchedulerConfig, destinations: Vec<Destination>) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        config,
        GenericOptions::defaults(),
        destinations,
        TransformPoolConfig::default(),
    ))
}

fn rated() -> DestinationOptions {
    DestinationOptions {
        generic: GenericOptions {
            rating: Some(Rating::General),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn submission(id: &str, destinations: &[&str]) -> Submission {
    let mut submission = Submission::new("Cat");
    submission.id = id.to_string();
    for destination in destinations {
        submission = submission.with_destination(DestinationTarget::new(*destination, rated()));
    }
    submission
}

/// Everything already published on the bus
fn drain_events(events: &mut EventReceiver) -> Vec<Event> {
    let mut log = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => log.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return log,
        }
    }
}

/// Wait for `submission_id` to complete or be cancelled, returning every event seen
async fn wait_until_done(events: &mut EventReceiver, submission_id: &str) -> Vec<Event> {
    let mut log = Vec::new();
    loop {
        let event = events.recv().await.expect("event bus closed");
        let done = event.submission_id() == submission_id
            && matches!(
                event,
                Event::SubmissionCompleted { .. } | Event::SubmissionCancelled { .. }
            );
        log.push(event);
        if done {
            return log;
        }
    }
}

fn completed_results(log: &[Event], submission_id: &str) -> Vec<PairResult> {
    log.iter()
        .find_map(|event| match event {
            Event::SubmissionCompleted {
                submission_id: id,
                results,
            } if id == submission_id => Some(results.clone()),
            _ => None,
        })
        .expect("submission did not complete")
}

fn last_status(log: &[Event], submission_id: &str, destination: &str) -> PostInfoStatus {
    log.iter()
        .rev()
        .find_map(|event| match event {
            Event::PairStatusChanged {
                submission_id: id,
                status,
            } if id == submission_id && status.destination == destination => Some(status.clone()),
            _ => None,
        })
        .expect("no status for pair")
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width,
        height,
        image::Rgb([200, 40, 40]),
    ));
    let mut bytes = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

#[tokio::test]
async fn test_zero_destinations_complete_immediately() {
    let adapter = MockAdapter::success("gallery");
    let orchestrator = orchestrator(scheduler_config(), vec![destination("gallery", &adapter)]);
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(submission("empty", &[])).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    assert!(completed_results(&log, "empty").is_empty());
    assert_eq!(adapter.call_count(), 0);
    assert!(orchestrator.statuses().posting.is_empty());
}

#[tokio::test]
async fn test_pairs_post_independently() {
    let gallery = MockAdapter::success("gallery");
    let blog = MockAdapter::failing("blog", "server said no");
    let orchestrator = orchestrator(
        scheduler_config(),
        vec![destination("gallery", &gallery), destination("blog", &blog)],
    );
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(submission("s1", &["gallery", "blog"]))
        .unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let results = completed_results(&log, "s1");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].destination, "gallery");
    assert_eq!(results[0].status, PostState::Success);
    assert_eq!(results[1].status, PostState::Error);
    assert_eq!(results[1].error.as_deref(), Some("server said no"));

    let blog_status = last_status(&log, "s1", "blog");
    assert!(blog_status.source.is_some());
    assert!(blog_status.stack.is_some());
    let gallery_status = last_status(&log, "s1", "gallery");
    assert!(gallery_status.additional_info.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_future_post_at_waits_without_condition() {
    let adapter = MockAdapter::success("gallery");
    let orchestrator = orchestrator(scheduler_config(), vec![destination("gallery", &adapter)]);
    let mut events = orchestrator.subscribe();

    let post_at = Utc::now() + chrono::Duration::seconds(10);
    let mut scheduled = submission("later", &[]);
    scheduled = scheduled.with_destination(DestinationTarget::new("gallery", rated()).at(post_at));
    orchestrator.enqueue(scheduled).unwrap();

    let shutdown = CancellationToken::new();
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    let started = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let statuses = orchestrator.statuses();
    let status = statuses.posting[0].status("gallery").unwrap();
    assert_eq!(status.status, PostState::Waiting);
    assert!(!status.waiting_for_condition);
    assert!(!status.is_posting);
    assert_eq!(adapter.call_count(), 0);

    let log = wait_until_done(&mut events, "later").await;
    assert!(started.elapsed() >= Duration::from_secs(9));
    let results = completed_results(&log, "later");
    assert_eq!(results[0].status, PostState::Success);
    assert_eq!(adapter.call_count(), 1);

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_pair_waits_while_others_post() {
    let first = MockAdapter::success("first");
    let second = MockAdapter::success("second");
    let later = MockAdapter::success("later");
    let orchestrator = orchestrator(
        scheduler_config(),
        vec![
            destination("first", &first),
            destination("second", &second),
            destination("later", &later),
        ],
    );
    let mut events = orchestrator.subscribe();

    let post_at = Utc::now() + chrono::Duration::seconds(10);
    let scheduled = submission("mixed", &["first", "second"])
        .with_destination(DestinationTarget::new("later", rated()).at(post_at));
    orchestrator.enqueue(scheduled).unwrap();

    let shutdown = CancellationToken::new();
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;

    let statuses = orchestrator.statuses();
    let info = &statuses.posting[0];
    assert_eq!(info.status("first").unwrap().status, PostState::Success);
    assert_eq!(info.status("second").unwrap().status, PostState::Success);
    let waiting = info.status("later").unwrap();
    assert_eq!(waiting.status, PostState::Waiting);
    assert!(!waiting.waiting_for_condition);
    assert_eq!(first.call_count(), 1);
    assert_eq!(second.call_count(), 1);
    assert_eq!(later.call_count(), 0);

    let log = wait_until_done(&mut events, "mixed").await;
    let results = completed_results(&log, "mixed");
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == PostState::Success));
    assert_eq!(later.call_count(), 1);

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried_until_success() {
    let adapter = MockAdapter::scripted(
        "gallery",
        vec![
            MockResponse::Failure("busy".to_string()),
            MockResponse::Error(AdapterError::Network("reset".to_string())),
            MockResponse::Failure("busy again".to_string()),
        ],
    );
    let orchestrator = orchestrator(with_retries(5), vec![destination("gallery", &adapter)]);
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(submission("s1", &["gallery"])).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let results = completed_results(&log, "s1");
    assert_eq!(results[0].status, PostState::Success);
    assert_eq!(results[0].attempts, 4);
    assert_eq!(adapter.call_count(), 4);

    let final_status = last_status(&log, "s1", "gallery");
    assert!(final_status.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded_and_keep_post_at() {
    let adapter = MockAdapter::failing("gallery", "always busy");
    let orchestrator = orchestrator(with_retries(2), vec![destination("gallery", &adapter)]);
    let mut events = orchestrator.subscribe();

    let post_at = Utc::now() - chrono::Duration::seconds(1);
    let past = submission("s1", &[])
        .with_destination(DestinationTarget::new("gallery", rated()).at(post_at));
    orchestrator.enqueue(past).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let results = completed_results(&log, "s1");
    assert_eq!(results[0].status, PostState::Error);
    assert_eq!(results[0].attempts, 3);
    assert_eq!(adapter.call_count(), 3);

    for event in &log {
        if let Event::PairStatusChanged { status, .. } = event {
            assert_eq!(status.post_at, Some(post_at));
            assert_eq!(status.destination, "gallery");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_errors_fail_at_once() {
    let adapter = MockAdapter::scripted(
        "gallery",
        vec![MockResponse::Error(AdapterError::Authentication(
            "expired token".to_string(),
        ))],
    );
    let orchestrator = orchestrator(with_retries(5), vec![destination("gallery", &adapter)]);
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(submission("s1", &["gallery"])).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let status = last_status(&log, "s1", "gallery");
    assert_eq!(status.status, PostState::Error);
    assert_eq!(status.attempts, 1);
    assert_eq!(status.source.as_deref(), Some("adapter"));
    assert!(status.error.unwrap().contains("expired token"));
}

#[tokio::test(start_paused = true)]
async fn test_status_flags_are_never_both_set() {
    let flaky = MockAdapter::scripted(
        "flaky",
        vec![
            MockResponse::Failure("busy".to_string()),
            MockResponse::Failure("busy".to_string()),
        ],
    )
    .delayed(Duration::from_millis(300));
    let slow = MockAdapter::with_delay("slow", Duration::from_secs(1));
    let orchestrator = orchestrator(
        with_retries(3),
        vec![
            destination("flaky", &flaky),
            destination("slow", &slow).with_prerequisites(["flaky"]),
        ],
    );
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(submission("a", &["flaky", "slow"])).unwrap();
    orchestrator.enqueue(submission("b", &["slow"])).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let mut changes = 0;
    for event in &log {
        if let Event::PairStatusChanged { status, .. } = event {
            changes += 1;
            assert!(!(status.is_posting && status.waiting_for_condition));
            assert_eq!(status.is_posting, status.status == PostState::Posting);
        }
    }
    assert!(changes > 0);
    assert_eq!(completed_results(&log, "a")[1].status, PostState::Success);
    assert_eq!(completed_results(&log, "b")[0].status, PostState::Success);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_lets_in_flight_calls_finish() {
    let adapters: Vec<MockAdapter> = ["one", "two", "three"]
        .iter()
        .map(|name| MockAdapter::with_delay(name, Duration::from_secs(5)).rate_limit_free())
        .collect();
    let config = SchedulerConfig {
        max_outstanding: 2,
        ..scheduler_config()
    };
    let orchestrator = orchestrator(
        config,
        vec![
            destination("one", &adapters[0]),
            destination("two", &adapters[1]),
            destination("three", &adapters[2]),
        ],
    );
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(submission("s1", &["one", "two", "three"]))
        .unwrap();

    let shutdown = CancellationToken::new();
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    let mut posting = 0;
    while posting < 2 {
        if let Event::PairStatusChanged { status, .. } = events.recv().await.unwrap() {
            if status.status == PostState::Posting {
                posting += 1;
            }
        }
    }

    let snapshot = orchestrator.statuses();
    let states: Vec<PostState> = snapshot.posting[0]
        .statuses
        .iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(states.iter().filter(|s| **s == PostState::Posting).count(), 2);
    assert_eq!(states.iter().filter(|s| **s == PostState::Queued).count(), 1);

    assert_eq!(orchestrator.cancel("s1"), CancelOutcome::Signalled);
    let log = wait_until_done(&mut events, "s1").await;

    assert!(matches!(log.last(), Some(Event::SubmissionCancelled { .. })));
    assert!(!log
        .iter()
        .any(|e| matches!(e, Event::SubmissionCompleted { .. })));

    let finals: Vec<PostInfoStatus> = ["one", "two", "three"]
        .iter()
        .map(|d| last_status(&log, "s1", d))
        .collect();
    assert_eq!(
        finals.iter().filter(|s| s.status == PostState::Success).count(),
        2
    );
    let cancelled: Vec<&PostInfoStatus> = finals
        .iter()
        .filter(|s| s.status == PostState::Error)
        .collect();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].error.as_deref(), Some("Submission cancelled"));
    assert_eq!(cancelled[0].attempts, 0);

    let calls: usize = adapters.iter().map(MockAdapter::call_count).sum();
    assert_eq!(calls, 2);
    assert!(orchestrator.statuses().posting.is_empty());

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_validation_errors_never_reach_the_adapter() {
    let gallery = MockAdapter::success("gallery");
    let blog = MockAdapter::success("blog");
    let gallery_defaults = DestinationOptions::new(
        GenericOptions::default(),
        SiteOptions::Gallery(GalleryOptions::default()),
    );
    let orchestrator = orchestrator(
        with_retries(3),
        vec![
            destination("gallery", &gallery).with_defaults(gallery_defaults),
            destination("blog", &blog),
        ],
    );
    let mut events = orchestrator.subscribe();

    // No title anywhere for the gallery, no rating at all for the blog
    let mut untitled = Submission::new("ignored");
    untitled.id = "s1".to_string();
    untitled.title = None;
    untitled = untitled
        .with_destination(DestinationTarget::new("gallery", rated()))
        .with_destination(DestinationTarget::new("blog", DestinationOptions::default()))
        .with_destination(DestinationTarget::new("nowhere", rated()));
    orchestrator.enqueue(untitled).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    for destination in ["gallery", "blog", "nowhere"] {
        let status = last_status(&log, "s1", destination);
        assert_eq!(status.status, PostState::Error, "{}", destination);
        assert_eq!(status.source.as_deref(), Some("validation"));
        assert_eq!(status.attempts, 0);
    }
    assert!(last_status(&log, "s1", "gallery")
        .error
        .unwrap()
        .contains("title"));
    assert_eq!(gallery.call_count(), 0);
    assert_eq!(blog.call_count(), 0);
}

#[tokio::test]
async fn test_transform_errors_never_reach_the_adapter() {
    let adapter = MockAdapter::success("gallery").requiring(FileRequirements {
        max_width: 100,
        quality: 80,
        accepted_types: vec![ImageMimeType::Jpeg],
    });
    let orchestrator = orchestrator(with_retries(3), vec![destination("gallery", &adapter)]);
    let mut events = orchestrator.subscribe();

    let broken = submission("s1", &["gallery"]).with_part(FileRecord::from_buffer(
        "broken.png",
        vec![0, 1, 2, 3, 4],
        "image/png",
    ));
    orchestrator.enqueue(broken).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let status = last_status(&log, "s1", "gallery");
    assert_eq!(status.status, PostState::Error);
    assert_eq!(status.source.as_deref(), Some("transform"));
    assert_eq!(status.attempts, 0);
    assert_eq!(adapter.call_count(), 0);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_images_are_normalized_before_posting() {
    let adapter = MockAdapter::success("gallery").requiring(FileRequirements {
        max_width: 50,
        quality: 80,
        accepted_types: vec![ImageMimeType::Jpeg, ImageMimeType::Png],
    });
    let blog = MockAdapter::success("blog");
    let orchestrator = orchestrator(
        scheduler_config(),
        vec![destination("gallery", &adapter), destination("blog", &blog)],
    );

    let original = png(200, 100);
    let mut notes = FileRecord::from_buffer("notes.txt", b"hello".to_vec(), "text/plain");
    notes.order = 1;
    let image = FileRecord::from_buffer("cat.png", original.clone(), "image/png");
    let post = submission("s1", &["gallery", "blog"])
        .with_part(notes)
        .with_part(image);
    orchestrator.enqueue(post).unwrap();
    orchestrator.drain().await;

    let calls = adapter.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].file_names, vec!["cat.png", "notes.txt"]);
    assert_eq!(calls[0].mime_types, vec!["image/jpeg", "text/plain"]);
    assert_eq!(calls[0].file_sizes[1], 5);

    // Destinations without requirements get the original bytes
    let blog_calls = blog.calls();
    assert_eq!(blog_calls[0].mime_types, vec!["image/png", "text/plain"]);
    assert_eq!(blog_calls[0].file_sizes[0], original.len());

    assert_eq!(orchestrator.transforms().decode_count(), 1);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_destination_is_serialized_across_submissions() {
    let adapter = MockAdapter::with_delay("gallery", Duration::from_secs(1));
    let orchestrator = orchestrator(scheduler_config(), vec![destination("gallery", &adapter)]);

    for id in ["a", "b", "c"] {
        orchestrator.enqueue(submission(id, &["gallery"])).unwrap();
    }
    orchestrator.drain().await;

    assert_eq!(adapter.call_count(), 3);
    assert_eq!(adapter.max_concurrent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_free_destinations_run_in_parallel() {
    let adapter = MockAdapter::with_delay("archive", Duration::from_secs(1)).rate_limit_free();
    let orchestrator = orchestrator(scheduler_config(), vec![destination("archive", &adapter)]);

    for id in ["a", "b", "c"] {
        orchestrator.enqueue(submission(id, &["archive"])).unwrap();
    }
    orchestrator.drain().await;

    assert_eq!(adapter.call_count(), 3);
    assert_eq!(adapter.max_concurrent(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_prerequisite_must_succeed_first() {
    let archive = MockAdapter::with_delay("archive", Duration::from_secs(2));
    let gallery = MockAdapter::success("gallery");
    let orchestrator = orchestrator(
        scheduler_config(),
        vec![
            destination("archive", &archive),
            destination("gallery", &gallery).with_prerequisites(["archive"]),
        ],
    );
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(submission("s1", &["gallery", "archive"]))
        .unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let waited = log.iter().any(|event| {
        matches!(event, Event::PairStatusChanged { status, .. }
            if status.destination == "gallery"
                && status.status == PostState::Waiting
                && status.waiting_for_condition)
    });
    assert!(waited);

    let first_posting = log
        .iter()
        .find_map(|event| match event {
            Event::PairStatusChanged { status, .. } if status.status == PostState::Posting => {
                Some(status.destination.clone())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(first_posting, "archive");
    assert!(completed_results(&log, "s1")
        .iter()
        .all(|r| r.status == PostState::Success));
}

#[tokio::test(start_paused = true)]
async fn test_failed_prerequisite_fails_dependent() {
    let archive = MockAdapter::failing("archive", "disk full");
    let gallery = MockAdapter::success("gallery");
    let orchestrator = orchestrator(
        scheduler_config(),
        vec![
            destination("archive", &archive),
            destination("gallery", &gallery).with_prerequisites(["archive"]),
        ],
    );
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(submission("s1", &["archive", "gallery"]))
        .unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let status = last_status(&log, "s1", "gallery");
    assert_eq!(status.status, PostState::Error);
    assert_eq!(status.source.as_deref(), Some("validation"));
    assert!(status.error.unwrap().contains("archive"));
    assert_eq!(gallery.call_count(), 0);

    // A prerequisite outside the submission is ignored
    orchestrator.enqueue(submission("s2", &["gallery"])).unwrap();
    orchestrator.drain().await;
    assert_eq!(gallery.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_timeout_becomes_error() {
    let adapter = MockAdapter::with_delay("gallery", Duration::from_secs(60));
    let config = SchedulerConfig {
        adapter_timeout: Duration::from_secs(1),
        ..scheduler_config()
    };
    let orchestrator = orchestrator(config, vec![destination("gallery", &adapter)]);
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(submission("s1", &["gallery"])).unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let status = last_status(&log, "s1", "gallery");
    assert_eq!(status.status, PostState::Error);
    assert_eq!(status.source.as_deref(), Some("timeout"));
    assert!(status.stack.is_some());
}

#[tokio::test]
async fn test_adapter_panic_becomes_error() {
    let adapter = MockAdapter::scripted("gallery", vec![MockResponse::Panic]);
    let other = MockAdapter::success("blog");
    let orchestrator = orchestrator(
        scheduler_config(),
        vec![destination("gallery", &adapter), destination("blog", &other)],
    );
    let mut events = orchestrator.subscribe();

    orchestrator
        .enqueue(submission("s1", &["gallery", "blog"]))
        .unwrap();
    orchestrator.drain().await;

    let log = drain_events(&mut events);
    let status = last_status(&log, "s1", "gallery");
    assert_eq!(status.status, PostState::Error);
    assert!(status.error.unwrap().contains("panicked"));
    assert_eq!(
        last_status(&log, "s1", "blog").status,
        PostState::Success
    );
}

#[tokio::test(start_paused = true)]
async fn test_hourly_budget_holds_extra_posts() {
    let adapter = MockAdapter::success("gallery").rate_limit_free();
    let orchestrator = orchestrator(
        scheduler_config(),
        vec![destination("gallery", &adapter).with_posts_per_hour(1)],
    );
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue(submission("a", &["gallery"])).unwrap();
    orchestrator.enqueue(submission("b", &["gallery"])).unwrap();

    let shutdown = CancellationToken::new();
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };

    wait_until_done(&mut events, "a").await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let statuses = orchestrator.statuses();
    let held = statuses.posting[0].status("gallery").unwrap();
    assert_eq!(statuses.posting[0].submission_id, "b");
    assert_eq!(held.status, PostState::Waiting);
    assert!(held.waiting_for_condition);
    assert_eq!(adapter.call_count(), 1);

    shutdown.cancel();
    runner.await.unwrap();
    assert!(orchestrator.statuses().posting.is_empty());
}

#[tokio::test]
async fn test_queue_is_fifo_with_one_active_submission() {
    let adapter = MockAdapter::success("gallery").rate_limit_free();
    let config = SchedulerConfig {
        max_active_submissions: 1,
        ..scheduler_config()
    };
    let orchestrator = orchestrator(config, vec![destination("gallery", &adapter)]);

    for id in ["first", "second", "third"] {
        orchestrator.enqueue(submission(id, &["gallery"])).unwrap();
    }
    orchestrator.reorder("third", 0).unwrap();
    orchestrator.drain().await;

    let order: Vec<String> = adapter
        .calls()
        .into_iter()
        .map(|call| call.submission_id)
        .collect();
    assert_eq!(order, vec!["third", "first", "second"]);
}
