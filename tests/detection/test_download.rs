// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model downloads against a local HTTP server

use pii_redactor::detection::{
    DownloadError, DownloadSource, ModelDownloader, ModelSpec, RetryPolicy,
};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn spec(server: &MockServer, file: &str) -> ModelSpec {
    ModelSpec::new(
        "test-model",
        DownloadSource::Http {
            url: format!("{}/{}", server.uri(), file),
        },
    )
}

fn fast_retries(max_retries: usize) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        exponential_base: 2.0,
    }
}

fn recorder() -> (Arc<Mutex<Vec<f32>>>, impl Fn(f32) + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |p: f32| sink.lock().unwrap().push(p))
}

#[tokio::test]
async fn test_download_reports_progress_and_writes_file() {
    let server = MockServer::start().await;
    let body = vec![7u8; 64 * 1024];
    Mock::given(method("GET"))
        .and(path("/model.onnx"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = ModelDownloader::new(dir.path()).unwrap();
    let spec = spec(&server, "model.onnx").with_sha256(hex::encode(Sha256::digest(&body)));
    assert!(!downloader.is_cached(&spec));

    let (seen, progress) = recorder();
    let path = downloader.ensure(&spec, &progress).await.unwrap();

    assert_eq!(path, dir.path().join("test-model").join("model.onnx"));
    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(downloader.is_cached(&spec));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last().copied(), Some(100.0));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.iter().filter(|p| **p >= 100.0).count(), 1);
}

#[tokio::test]
async fn test_cached_model_short_circuits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 16]))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = ModelDownloader::new(dir.path()).unwrap();
    let spec = spec(&server, "model.onnx");
    let local = downloader.local_path(&spec);
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"already here").unwrap();

    let (seen, progress) = recorder();
    downloader.ensure(&spec, &progress).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![100.0]);
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_no_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = ModelDownloader::new(dir.path()).unwrap();
    let spec = spec(&server, "model.onnx").with_sha256("00".repeat(32));

    let (_, progress) = recorder();
    let err = downloader.ensure(&spec, &progress).await.unwrap_err();

    assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
    assert!(!downloader.is_cached(&spec));
    let leftovers = std::fs::read_dir(dir.path().join("test-model")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"weights".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = ModelDownloader::new(dir.path())
        .unwrap()
        .with_retry_policy(fast_retries(3));
    let spec = spec(&server, "model.onnx");

    let (_, progress) = recorder();
    let path = downloader.ensure(&spec, &progress).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"weights");
}

#[tokio::test]
async fn test_retries_give_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = ModelDownloader::new(dir.path())
        .unwrap()
        .with_retry_policy(fast_retries(2));

    let (_, progress) = recorder();
    let err = downloader
        .ensure(&spec(&server, "model.onnx"), &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::MaxRetriesExceeded { attempts: 3, .. }));
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = ModelDownloader::new(dir.path())
        .unwrap()
        .with_retry_policy(fast_retries(3));

    let (_, progress) = recorder();
    let err = downloader
        .ensure(&spec(&server, "model.onnx"), &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::Http { status: 404 }));
}
