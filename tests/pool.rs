//! End-to-end tests driving [`relay_pool::pool::Pool`] against the
//! `nack_worker` fixture binary built from `demos/fixture_worker.rs`.
//!
//! These cover spec.md §8's scenarios 1 (two-worker pool readiness), 3
//! (proxy happy path), 4 (application error surfaces), and 5 (restart), plus
//! §4.1's `proxyRequest` request-body pumping (not one of spec.md §8's
//! numbered scenarios, but part of the same `proxy` contract).
//! Scenario 2 (round-robin fallback) is covered as a pure unit test in
//! `src/pool.rs` since it needs no I/O.

use std::collections::{HashMap, VecDeque};
use std::error::Error as _;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body::Body as HttpBody;

use relay_pool::client::BoxBody;
use relay_pool::pool::{Pool, PoolEvent};
use relay_pool::worker::{ProxyRequest, WorkerEvent, WorkerOptions};
use relay_pool::Error;

/// A minimal multi-chunk `http_body::Body`, standing in for whatever body
/// type an embedding HTTP server would hand to [`Pool::proxy`].
struct ChunkedBody {
    chunks: VecDeque<Bytes>,
}

impl ChunkedBody {
    fn new(chunks: Vec<&'static [u8]>) -> BoxBody {
        Box::pin(ChunkedBody {
            chunks: chunks.into_iter().map(Bytes::from_static).collect(),
        })
    }
}

impl HttpBody for ChunkedBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_data(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        Poll::Ready(self.chunks.pop_front().map(Ok))
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<Option<http::HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }

    fn is_end_stream(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Put the directory holding the freshly built `nack_worker` fixture ahead
/// of the rest of `PATH`, so the crate's own `which`-based command-search
/// (spec.md §6) finds it exactly as it would find a real worker program.
fn prepend_fixture_to_path() {
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_nack_worker"));
    let dir = exe.parent().expect("fixture binary has a parent dir");
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let mut paths = vec![dir.to_path_buf()];
    paths.extend(std::env::split_paths(&existing));
    let joined = std::env::join_paths(paths).expect("joining PATH entries");
    std::env::set_var("PATH", joined);
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("relay-pool-it-{}-{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("worker.conf");
    std::fs::write(&path, contents).unwrap();
    path
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..250 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(predicate(), "condition did not become true within 5s");
}

#[tokio::test]
async fn two_worker_pool_readiness() {
    prepend_fixture_to_path();
    let dir = scratch_dir("readiness");
    let config = write_config(&dir, "hello");
    let options = WorkerOptions::new(&config).unwrap();
    let (pool, _stdout, _stderr) = Pool::new(options, 2);

    assert_eq!(pool.len().await, 2);
    assert_eq!(pool.ready_count(), 0);
    assert_eq!(pool.alive_count(), 0);

    let mut events = pool.subscribe();
    pool.spawn().await;

    let mut ready_crossings = 0;
    while ready_crossings == 0 {
        match events.recv().await.unwrap() {
            PoolEvent::Ready => ready_crossings += 1,
            _ => {}
        }
    }
    assert_eq!(ready_crossings, 1, "pool `ready` must fire exactly once");

    wait_until(|| pool.ready_count() == 2).await;
    assert_eq!(pool.ready_count(), 2);
    assert_eq!(pool.alive_count(), 2);

    pool.quit().await;

    let mut exit_crossings = 0;
    while exit_crossings == 0 {
        match events.recv().await.unwrap() {
            PoolEvent::Exit => exit_crossings += 1,
            _ => {}
        }
    }
    assert_eq!(exit_crossings, 1, "pool `exit` must fire exactly once");

    wait_until(|| pool.alive_count() == 0).await;
    assert_eq!(pool.ready_count(), 0);
    assert_eq!(pool.alive_count(), 0);
}

#[tokio::test]
async fn proxy_happy_path_returns_canned_response() {
    prepend_fixture_to_path();
    let dir = scratch_dir("proxy");
    let config = write_config(&dir, "hello");
    let options = WorkerOptions::new(&config).unwrap();
    let (pool, _stdout, _stderr) = Pool::new(options, 1);

    let request = ProxyRequest {
        method: "GET".into(),
        path: "/".into(),
        query: String::new(),
        headers: vec![],
        meta: HashMap::new(),
        body: None,
    };

    let mut response = pool.proxy(request).await.unwrap();
    assert_eq!(response.head.status, 200);

    let mut body = Vec::new();
    while let Some(chunk) = response.lease.body.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn proxy_streams_request_body_to_worker() {
    prepend_fixture_to_path();
    let dir = scratch_dir("echo");
    let config = write_config(&dir, "echo");
    let options = WorkerOptions::new(&config).unwrap();
    let (pool, _stdout, _stderr) = Pool::new(options, 1);

    let request = ProxyRequest {
        method: "POST".into(),
        path: "/".into(),
        query: String::new(),
        headers: vec![],
        meta: HashMap::new(),
        body: Some(ChunkedBody::new(vec![b"hello, ", b"worker"])),
    };

    let mut response = pool.proxy(request).await.unwrap();
    assert_eq!(response.head.status, 200);

    let mut body = Vec::new();
    while let Some(chunk) = response.lease.body.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(
        body, b"hello, worker",
        "the fixture's echo behavior only sees this if the body was actually streamed"
    );
}

#[tokio::test]
async fn application_error_surfaces_verbatim_and_pool_exits() {
    prepend_fixture_to_path();
    let dir = scratch_dir("crash");
    let config = write_config(&dir, "crash:b00m");
    let options = WorkerOptions::new(&config).unwrap();
    let (pool, _stdout, _stderr) = Pool::new(options, 1);

    let mut events = pool.subscribe();
    pool.spawn().await;

    let mut crash_message = None;
    let mut saw_exit = false;
    while !saw_exit {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for the crashing worker's events")
            .unwrap()
        {
            PoolEvent::Worker(_, WorkerEvent::Error(err)) => {
                crash_message = err.source().map(|cause| cause.to_string());
            }
            PoolEvent::Exit => saw_exit = true,
            _ => {}
        }
    }

    assert_eq!(crash_message.as_deref(), Some("b00m"));
    assert!(saw_exit, "pool must emit `exit` after the crashing worker dies");
    assert_eq!(pool.alive_count(), 0);
}

#[tokio::test]
async fn restart_cycles_workers_through_absent_and_back_to_ready() {
    prepend_fixture_to_path();
    let dir = scratch_dir("restart");
    let config = write_config(&dir, "hello");
    let options = WorkerOptions::new(&config).unwrap();
    let (pool, _stdout, _stderr) = Pool::new(options, 2);

    pool.spawn().await;
    wait_until(|| pool.ready_count() == 2).await;

    pool.restart().await;

    wait_until(|| pool.ready_count() == 2).await;
    assert_eq!(pool.ready_count(), 2);
    assert_eq!(pool.alive_count(), 2);

    // Restart must leave the pool in a state that still quits cleanly.
    pool.quit().await;
    wait_until(|| pool.alive_count() == 0).await;
    assert_eq!(pool.alive_count(), 0);
}

#[tokio::test]
async fn restart_with_no_workers_alive_resolves_immediately() {
    prepend_fixture_to_path();
    let dir = scratch_dir("restart-absent");
    let config = write_config(&dir, "hello");
    let options = WorkerOptions::new(&config).unwrap();
    let (pool, _stdout, _stderr) = Pool::new(options, 1);

    assert_eq!(pool.alive_count(), 0);
    tokio::time::timeout(Duration::from_secs(5), pool.restart())
        .await
        .expect("restart with no live workers must not hang");

    wait_until(|| pool.ready_count() == 1).await;
    pool.quit().await;
    wait_until(|| pool.alive_count() == 0).await;
}
