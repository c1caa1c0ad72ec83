//! Tests for the download task module.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::context::TaskContext;
use super::orchestration::DownloadTask;
use crate::config::Config;
use crate::downloader::test_helpers::{payload, target, test_config};
use crate::error::DownloadFailureKind;
use crate::types::{Event, Outcome, TaskState};
use crate::utils::part_path;

fn context(config: &Config) -> TaskContext {
    let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
    TaskContext::new(reqwest::Client::new(), &config.download_settings, event_tx)
}

fn assert_no_files(destination: &Path) {
    assert!(!destination.exists(), "destination should not exist");
    assert!(
        !part_path(destination).exists(),
        "partial file should have been removed"
    );
}

// -----------------------------------------------------------------------
// Success and streaming
// -----------------------------------------------------------------------

#[tokio::test]
async fn downloads_body_in_chunks_and_matches_content_length() {
    let server = MockServer::start().await;
    let body = payload(10_000);
    Mock::given(method("GET"))
        .and(path("/api/download/models/1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 3);
    let ctx = context(&config);
    let url = format!("{}/api/download/models/1", server.uri());
    let task_target = target(1, &url, &dir.path().join("models/Lora"), "a.safetensors");
    let destination = task_target.destination.clone();

    let result = DownloadTask::new(task_target, 3).run(&ctx).await;

    match result.outcome {
        Outcome::Succeeded {
            bytes, attempts, ..
        } => {
            assert_eq!(bytes, 10_000);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(std::fs::read(&destination).unwrap(), body);
    assert!(!part_path(&destination).exists());
    assert_eq!(ctx.progress.snapshot().total_bytes, 10_000);
    assert_eq!(ctx.progress.snapshot().succeeded, 1);
}

#[tokio::test]
async fn emits_progress_events_up_to_total() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(4096)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 1);
    let ctx = context(&config);
    let mut events = ctx.event_tx.subscribe();

    let url = format!("{}/file", server.uri());
    DownloadTask::new(target(7, &url, dir.path(), "f.bin"), 1)
        .run(&ctx)
        .await;

    let mut last_progress = None;
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::Progress {
                bytes_written,
                total_bytes,
                ..
            } => last_progress = Some((bytes_written, total_bytes)),
            Event::DownloadComplete { bytes, .. } => {
                assert_eq!(bytes, 4096);
                completed = true;
            }
            _ => {}
        }
    }
    assert_eq!(last_progress, Some((4096, Some(4096))));
    assert!(completed);
}

#[tokio::test]
async fn existing_destination_is_overwritten() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("m.safetensors");
    std::fs::write(&destination, b"stale contents").unwrap();

    let config = test_config(1, 1);
    let ctx = context(&config);
    let url = format!("{}/file", server.uri());
    let result = DownloadTask::new(target(1, &url, dir.path(), "m.safetensors"), 1)
        .run(&ctx)
        .await;

    assert!(result.outcome.is_success());
    assert_eq!(std::fs::read(&destination).unwrap(), b"fresh");
}

// -----------------------------------------------------------------------
// Retry behavior
// -----------------------------------------------------------------------

#[tokio::test]
async fn service_unavailable_twice_then_success_takes_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(512)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 3);
    let ctx = context(&config);
    let mut events = ctx.event_tx.subscribe();
    let url = format!("{}/file", server.uri());

    let result = DownloadTask::new(target(1, &url, dir.path(), "x.bin"), 3)
        .run(&ctx)
        .await;

    assert!(
        matches!(result.outcome, Outcome::Succeeded { attempts: 3, .. }),
        "got {:?}",
        result.outcome
    );

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::Retrying {
            attempt, delay_ms, ..
        } = event
        {
            retries.push((attempt, delay_ms));
        }
    }
    // initial_delay 10ms, multiplier 2.0
    assert_eq!(retries, vec![(1, 10), (2, 20)]);
}

#[tokio::test]
async fn not_found_fails_after_one_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 3);
    let ctx = context(&config);
    let url = format!("{}/file", server.uri());
    let task_target = target(1, &url, dir.path(), "missing.bin");
    let destination = task_target.destination.clone();

    let result = DownloadTask::new(task_target, 3).run(&ctx).await;

    match result.outcome {
        Outcome::DownloadFailed { kind, attempts, .. } => {
            assert_eq!(kind, DownloadFailureKind::Permanent);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected permanent failure, got {other:?}"),
    }
    assert_no_files(&destination);
    assert_eq!(ctx.progress.snapshot().failed, 1);
}

#[tokio::test]
async fn exhausted_retries_are_transient_and_leave_no_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 2);
    let ctx = context(&config);
    let url = format!("{}/file", server.uri());
    let task_target = target(1, &url, dir.path(), "flaky.bin");
    let destination = task_target.destination.clone();

    let result = DownloadTask::new(task_target, 2).run(&ctx).await;

    assert!(matches!(
        result.outcome,
        Outcome::DownloadFailed {
            kind: DownloadFailureKind::Transient,
            attempts: 2,
            ..
        }
    ));
    assert_no_files(&destination);
}

#[tokio::test]
async fn too_many_requests_honors_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(64)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 3);
    let ctx = context(&config);
    let url = format!("{}/file", server.uri());

    let start = Instant::now();
    let result = DownloadTask::new(target(1, &url, dir.path(), "r.bin"), 3)
        .run(&ctx)
        .await;

    assert!(matches!(
        result.outcome,
        Outcome::Succeeded { attempts: 2, .. }
    ));
    assert!(
        start.elapsed() >= Duration::from_millis(900),
        "should wait for Retry-After, waited {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn stalled_response_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(payload(16))
                .set_delay(Duration::from_secs(3)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(16)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(1, 2);
    config.download_settings.timeout = Duration::from_millis(300);
    let ctx = context(&config);
    let url = format!("{}/file", server.uri());

    let result = DownloadTask::new(target(1, &url, dir.path(), "s.bin"), 2)
        .run(&ctx)
        .await;

    assert!(matches!(
        result.outcome,
        Outcome::Succeeded { attempts: 2, .. }
    ));
}

/// Serve `connections` requests that declare 1000 bytes but send only a few, then hang up.
async fn spawn_truncating_server(connections: usize) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for _ in 0..connections {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\nshort",
                )
                .await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}/file")
}

#[tokio::test]
async fn truncated_body_is_transient_and_cleaned_up() {
    let url = spawn_truncating_server(2).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 2);
    let ctx = context(&config);
    let task_target = target(1, &url, dir.path(), "t.bin");
    let destination = task_target.destination.clone();

    let result = DownloadTask::new(task_target, 2).run(&ctx).await;

    assert!(
        matches!(
            result.outcome,
            Outcome::DownloadFailed {
                kind: DownloadFailureKind::Transient,
                attempts: 2,
                ..
            }
        ),
        "got {:?}",
        result.outcome
    );
    assert_no_files(&destination);
}

// -----------------------------------------------------------------------
// Permanent local failures
// -----------------------------------------------------------------------

#[tokio::test]
async fn unsupported_scheme_fails_without_request() {
    let dir = TempDir::new().unwrap();
    let config = test_config(1, 3);
    let ctx = context(&config);

    let result = DownloadTask::new(target(1, "ftp://example.com/m.bin", dir.path(), "m.bin"), 3)
        .run(&ctx)
        .await;

    match result.outcome {
        Outcome::DownloadFailed {
            kind,
            attempts,
            message,
        } => {
            assert_eq!(kind, DownloadFailureKind::Permanent);
            assert_eq!(attempts, 1);
            assert!(message.contains("unsupported scheme"), "message: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn unwritable_destination_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(8)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    // A regular file where a directory is needed
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();

    let config = test_config(1, 3);
    let ctx = context(&config);
    let url = format!("{}/file", server.uri());
    let result = DownloadTask::new(target(1, &url, &blocker, "m.bin"), 3)
        .run(&ctx)
        .await;

    assert!(matches!(
        result.outcome,
        Outcome::DownloadFailed {
            kind: DownloadFailureKind::Permanent,
            attempts: 1,
            ..
        }
    ));
}

// -----------------------------------------------------------------------
// Cancellation and state
// -----------------------------------------------------------------------

#[tokio::test]
async fn cancelled_before_start_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 3);
    let ctx = context(&config);
    ctx.cancel_token.cancel();
    let url = format!("{}/file", server.uri());

    let result = DownloadTask::new(target(1, &url, dir.path(), "c.bin"), 3)
        .run(&ctx)
        .await;

    assert_eq!(result.outcome, Outcome::cancelled(0));
}

#[tokio::test]
async fn cancellation_during_transfer_removes_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(payload(32))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(1, 3);
    let ctx = Arc::new(context(&config));
    let url = format!("{}/file", server.uri());
    let task_target = target(1, &url, dir.path(), "c.bin");
    let destination = task_target.destination.clone();

    let token = ctx.cancel_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let start = Instant::now();
    let result = DownloadTask::new(task_target, 3).run(&ctx).await;

    assert_eq!(result.outcome, Outcome::cancelled(1));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_no_files(&destination);
}

#[test]
fn new_task_starts_pending_with_at_least_one_attempt() {
    let dir = TempDir::new().unwrap();
    let task = DownloadTask::new(target(3, "https://civitai.com/x", dir.path(), "a"), 0);
    assert_eq!(task.state(), TaskState::Pending);
    assert_eq!(task.max_attempts(), 1);
    assert_eq!(task.attempts(), 0);
    assert_eq!(task.id().get(), 3);
    assert_eq!(task.total_bytes(), None);
}
