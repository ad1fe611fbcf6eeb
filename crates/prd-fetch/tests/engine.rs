//! End-to-end transfer engine tests against a local mock server.

use std::time::{Duration, Instant};

use prd_fetch::{Category, Download, DownloadError, EngineTuning, HttpEngine, Session};
use prd_hash::md5_of;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_tuning() -> EngineTuning {
    EngineTuning {
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        ..EngineTuning::default()
    }
}

fn record_for(server: &MockServer, dir: &tempfile::TempDir, file: &str) -> Download {
    let mut rec = Download::new(dir.path().join(file), file, Category::None);
    rec.add_mirror(format!("{}/{}", server.uri(), file));
    rec
}

#[tokio::test]
async fn downloads_and_verifies_single_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes("hello world"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut rec = record_for(&server, &dir, "a.bin");
    rec.expect_md5(md5_of(b"hello world"));

    let session = Session::plain().unwrap();
    let engine = HttpEngine::new(&session);
    engine
        .download(std::slice::from_mut(&mut rec), 1, 0)
        .await
        .unwrap();

    assert!(rec.is_finished());
    assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"hello world");
    assert!(!dir.path().join("a.bin.tmp").exists());
}

#[tokio::test]
async fn revalidates_with_etag_and_keeps_file_on_304() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .and(header("If-None-Match", "\"abc\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("a.bin");
    std::fs::write(&dest, b"hello world").unwrap();
    std::fs::write(
        dir.path().join("a.bin.etag"),
        format!("{}:\"abc\"", md5_of(b"hello world").to_hex()),
    )
    .unwrap();

    let mut rec = record_for(&server, &dir, "a.bin");
    rec.use_etags = true;

    let session = Session::plain().unwrap();
    HttpEngine::new(&session)
        .download(std::slice::from_mut(&mut rec), 1, 0)
        .await
        .unwrap();

    assert!(rec.is_finished());
    assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    assert!(!dir.path().join("a.bin.tmp").exists());
}

#[tokio::test]
async fn writes_etag_sidecar_then_revalidates() {
    let server = MockServer::start().await;
    // revalidation answers 304, everything else gets the body with an ETag
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes("payload")
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = Session::plain().unwrap();

    let mut first = record_for(&server, &dir, "a.bin");
    first.use_etags = true;
    HttpEngine::new(&session)
        .download(std::slice::from_mut(&mut first), 1, 0)
        .await
        .unwrap();
    assert!(first.is_finished());
    assert!(dir.path().join("a.bin.etag").exists());

    let mut second = record_for(&server, &dir, "a.bin");
    second.use_etags = true;
    HttpEngine::new(&session)
        .download(std::slice::from_mut(&mut second), 1, 0)
        .await
        .unwrap();
    assert!(second.is_finished());
    assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"payload");

    // exactly one full download happened; the second run revalidated
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].headers.get("If-None-Match").is_some());
}

#[tokio::test]
async fn honors_retry_after_on_503() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes("x"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut rec = record_for(&server, &dir, "a.bin");

    let session = Session::plain().unwrap();
    let start = Instant::now();
    HttpEngine::with_tuning(&session, fast_tuning())
        .download(std::slice::from_mut(&mut rec), 1, 0)
        .await
        .unwrap();

    assert!(rec.is_finished());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert!(
        start.elapsed() >= Duration::from_secs(1),
        "retry happened before the server-requested delay"
    );
}

#[tokio::test]
async fn gives_up_after_ten_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut rec = record_for(&server, &dir, "a.bin");

    let session = Session::plain().unwrap();
    let err = HttpEngine::with_tuning(&session, fast_tuning())
        .download(std::slice::from_mut(&mut rec), 1, 0)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::RetryLimit(10)), "got {err}");
    assert_eq!(server.received_requests().await.unwrap().len(), 10);
    assert!(!rec.is_finished());
    assert!(!dir.path().join("a.bin").exists());
    assert!(!dir.path().join("a.bin.tmp").exists());
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut rec = record_for(&server, &dir, "a.bin");

    let session = Session::plain().unwrap();
    let err = HttpEngine::with_tuning(&session, fast_tuning())
        .download(std::slice::from_mut(&mut rec), 1, 0)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::HttpStatus(404)), "got {err}");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn hash_mismatch_fails_and_removes_tmp() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes("evil payload"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut rec = record_for(&server, &dir, "a.bin");
    rec.expect_md5(md5_of(b"good payload"));

    let session = Session::plain().unwrap();
    let err = HttpEngine::new(&session)
        .download(std::slice::from_mut(&mut rec), 1, 0)
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Aborted), "got {err}");
    assert_eq!(rec.state, prd_fetch::State::Failed);
    assert!(!dir.path().join("a.bin").exists());
    assert!(!dir.path().join("a.bin.tmp").exists());
}

#[tokio::test]
async fn missing_mirrors_fail_before_any_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = Download::new(dir.path().join("a.bin"), "a.bin", Category::None);

    let session = Session::plain().unwrap();
    let err = HttpEngine::new(&session)
        .download(std::slice::from_mut(&mut rec), 1, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::NoMirrors(_)), "got {err}");
    assert_eq!(rec.state, prd_fetch::State::Failed);
}

#[tokio::test]
async fn large_body_arrives_byte_exact() {
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i * 31 % 251) as u8).collect();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut rec = record_for(&server, &dir, "big.bin");
    rec.expect_md5(md5_of(&payload));
    rec.size = Some(payload.len() as u64);

    let session = Session::plain().unwrap();
    HttpEngine::new(&session)
        .download(std::slice::from_mut(&mut rec), 4, 0)
        .await
        .unwrap();

    assert!(rec.is_finished());
    assert_eq!(rec.progress, payload.len() as u64);
    assert_eq!(std::fs::read(dir.path().join("big.bin")).unwrap(), payload);
}

#[tokio::test]
async fn many_parallel_records_all_land() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut records = Vec::new();
    for i in 0..20 {
        let name = format!("f{i}.bin");
        let body = format!("contents of file number {i}");
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;
        let mut rec = record_for(&server, &dir, &name);
        rec.expect_md5(md5_of(body.as_bytes()));
        records.push(rec);
    }

    let session = Session::plain().unwrap();
    HttpEngine::new(&session)
        .download(&mut records, 8, 0)
        .await
        .unwrap();

    for (i, rec) in records.iter().enumerate() {
        assert!(rec.is_finished(), "record {i} not finished");
        let body = std::fs::read(&rec.name).unwrap();
        assert_eq!(body, format!("contents of file number {i}").as_bytes());
    }
}

#[tokio::test]
async fn finished_and_rapid_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut done = Download::new(dir.path().join("done.bin"), "done", Category::None);
    done.state = prd_fetch::State::Finished;
    let mut rapid = Download::new(dir.path().join("rapid"), "ba:stable", Category::Game);
    rapid.dltype = prd_fetch::DownloadType::Rapid;

    let session = Session::plain().unwrap();
    HttpEngine::new(&session)
        .download(&mut [done, rapid], 1, 0)
        .await
        .unwrap();
}
