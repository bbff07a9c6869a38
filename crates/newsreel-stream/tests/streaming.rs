//! End-to-end streaming over the mock NNTP server: sizing, reads, seeks,
//! deduplication, spillover and the zero-fill policy.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use newsreel_nntp::testing::{ArticleBehavior, TestServer};
use newsreel_stream::StreamError;
use pretty_assertions::assert_eq;
use std::io::SeekFrom;
use std::time::Duration;
use support::{Session, payload, post_file, post_file_with_layout};
use tokio_util::sync::CancellationToken;

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn linear_read_sizes_from_probe() {
    let server = TestServer::start().await;
    // Declared encoded sizes {40000, 40000, 20000}; segment 0 decodes to
    // 38400 bytes, so the trailing segment re-lays out to 19200 and the
    // total lands on 96000.
    let data = payload(38_400 + 38_400 + 19_200, 1);
    let spec = post_file_with_layout(
        &server,
        "movie.mkv",
        &data,
        &[38_400, 38_400, 19_200],
        &[40_000, 40_000, 20_000],
    );

    let session = Session::new(vec![server.provider_config(4)]);
    let file = session.file(&spec);
    let token = CancellationToken::new();

    assert_eq!(
        file.size(&token).await.expect("Operation should succeed"),
        96_000
    );

    let mut reader = file.open_stream(&token);
    let mut out = Vec::new();
    let mut buf = vec![0u8; 7_000];
    loop {
        let n = reader.read(&mut buf).await.expect("Operation should succeed");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    reader.close().await;

    assert_eq!(out.len(), data.len());
    assert_eq!(out, data);
}

#[tokio::test]
async fn estimator_lets_sibling_files_skip_their_probe() {
    let server = TestServer::start().await;
    let data_a = payload(3 * 10_000, 2);
    let data_b = payload(3 * 10_000, 3);
    let spec_a = post_file(&server, "a.mkv", &data_a, 10_000, 400_000);
    // Declared sizes differ by less than the 4 KiB fuzz window.
    let spec_b = post_file(&server, "b.mkv", &data_b, 10_000, 401_500);

    let session = Session::new(vec![server.provider_config(4)]);
    let token = CancellationToken::new();

    let file_a = session.file(&spec_a);
    assert_eq!(
        file_a.size(&token).await.expect("Operation should succeed"),
        30_000
    );
    assert_eq!(server.body_request_count("a.mkv.0@mock"), 1);

    let file_b = session.file(&spec_b);
    assert_eq!(
        file_b.size(&token).await.expect("Operation should succeed"),
        30_000
    );
    // Sized without touching the wire.
    assert_eq!(server.body_request_count("b.mkv.0@mock"), 0);
}

#[tokio::test]
async fn concurrent_downloads_deduplicate_to_one_fetch() {
    let server = TestServer::start().await;
    let data = payload(4 * 8_192, 4);
    let spec = post_file(&server, "movie.mkv", &data, 8_192, 50_000);

    let session = Session::new(vec![server.provider_config(4)]);
    let file = session.file(&spec);
    let token = CancellationToken::new();
    file.size(&token).await.expect("Operation should succeed");
    let baseline = server.body_request_count("movie.mkv.2@mock");
    assert_eq!(baseline, 0);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let file = file.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            file.download_segment(&token, 2).await
        }));
    }
    for task in tasks {
        let bytes = task
            .await
            .expect("Operation should succeed")
            .expect("Operation should succeed");
        assert_eq!(bytes.as_ref(), &data[2 * 8_192..3 * 8_192]);
    }
    assert_eq!(server.body_request_count("movie.mkv.2@mock"), 1);
}

#[tokio::test]
async fn saturated_primary_spills_to_secondary() {
    let primary = TestServer::start().await;
    let secondary = TestServer::start().await;
    let data = payload(2 * 4_096, 5);
    let spec = post_file(&primary, "movie.mkv", &data, 4_096, 30_000);
    // Mirror the articles on the secondary provider.
    post_file(&secondary, "movie.mkv", &data, 4_096, 30_000);

    let session = Session::new(vec![
        primary.provider_config(1),
        secondary.provider_config(1),
    ]);

    // Saturate the primary's single connection.
    let (held, held_guard) = session.pools.pools()[0]
        .try_get()
        .await
        .expect("Operation should succeed")
        .expect("Operation should succeed");

    let file = session.file(&spec);
    let token = CancellationToken::new();
    let bytes = tokio::time::timeout(Duration::from_secs(5), file.download_segment(&token, 0))
        .await
        .expect("Operation should succeed")
        .expect("Operation should succeed");
    assert_eq!(bytes.len(), 4_096);
    assert_eq!(secondary.body_request_count("movie.mkv.0@mock"), 1);

    session.pools.pools()[0].put(held, held_guard);
}

#[tokio::test]
async fn missing_article_zero_fills_and_playback_continues() {
    let server = TestServer::start().await;
    let data = payload(5 * 4_096, 6);
    let spec = post_file(&server, "movie.mkv", &data, 4_096, 30_000);
    // Article 2 is gone on the only provider.
    server.add_article("movie.mkv.2@mock", ArticleBehavior::Missing);

    let session = Session::new(vec![server.provider_config(2)]);
    let file = session.file(&spec);
    let token = CancellationToken::new();

    let mut expected = data.clone();
    expected[2 * 4_096..3 * 4_096].fill(0);

    let mut buf = vec![0u8; expected.len()];
    let n = file
        .read_at(&token, &mut buf, 0)
        .await
        .expect("Operation should succeed");
    assert_eq!(n, expected.len());
    assert_eq!(buf, expected);
    assert_eq!(file.zero_filled_count(), 1);

    // The zeros are cached; a re-read does not retry the article.
    let requests = server.body_request_count("movie.mkv.2@mock");
    let mut again = vec![0u8; 4_096];
    file.read_at(&token, &mut again, 2 * 4_096)
        .await
        .expect("Operation should succeed");
    assert!(again.iter().all(|&b| b == 0));
    assert_eq!(server.body_request_count("movie.mkv.2@mock"), requests);
}

#[tokio::test]
async fn zero_fill_budget_exhaustion_is_terminal() {
    let server = TestServer::start().await;
    let data = payload(4 * 2_048, 7);
    let spec = post_file(&server, "movie.mkv", &data, 2_048, 20_000);
    for idx in 1..4 {
        server.add_article(&format!("movie.mkv.{idx}@mock"), ArticleBehavior::Missing);
    }

    // Budget of two: segments 1 and 2 degrade, segment 3 is terminal.
    let session = Session::with_budget(vec![server.provider_config(2)], 2);
    let file = session.file(&spec);
    let token = CancellationToken::new();
    file.size(&token).await.expect("Operation should succeed");

    let mut buf = vec![0u8; 2_048];
    for idx in 1..3 {
        let bytes = file
            .download_segment(&token, idx)
            .await
            .expect("Operation should succeed");
        assert!(bytes.iter().all(|&b| b == 0), "segment {idx} zero-filled");
    }
    let err = file
        .download_segment(&token, 3)
        .await
        .expect_err("Test operation should fail");
    assert!(
        err.is_budget_exhausted(),
        "expected TooManyFailedSegments, got {err}"
    );

    // Healthy segments keep working.
    let n = file
        .read_at(&token, &mut buf, 0)
        .await
        .expect("Operation should succeed");
    assert_eq!(n, 2_048);
    assert_eq!(buf, &data[..2_048]);
}

#[tokio::test]
async fn seek_round_trip_preserves_bytes() {
    let server = TestServer::start().await;
    let data = payload(6 * 4_096, 8);
    let spec = post_file(&server, "movie.mkv", &data, 4_096, 25_000);

    let session = Session::new(vec![server.provider_config(4)]);
    let file = session.file(&spec);
    let token = CancellationToken::new();
    let mut reader = file.open_stream(&token);

    for (p, q) in [(0u64, 20_000u64), (5_000, 1_000), (12_345, 23_456)] {
        reader
            .seek(SeekFrom::Start(p))
            .await
            .expect("Operation should succeed");
        let mut direct = [0u8; 1];
        reader.read(&mut direct).await.expect("Operation should succeed");

        // Detour to q and back; the byte at p must be unchanged.
        reader
            .seek(SeekFrom::Start(q))
            .await
            .expect("Operation should succeed");
        reader
            .seek(SeekFrom::Start(p))
            .await
            .expect("Operation should succeed");
        let mut after = [0u8; 1];
        reader.read(&mut after).await.expect("Operation should succeed");

        assert_eq!(direct, after, "byte at {p} changed across a {q} detour");
        assert_eq!(direct[0], data[p as usize]);
    }
    reader.close().await;
}

#[tokio::test]
async fn seek_past_end_is_rejected() {
    let server = TestServer::start().await;
    let data = payload(2 * 4_096, 9);
    let spec = post_file(&server, "movie.mkv", &data, 4_096, 25_000);

    let session = Session::new(vec![server.provider_config(2)]);
    let file = session.file(&spec);
    let token = CancellationToken::new();
    let mut reader = file.open_stream(&token);

    let err = reader
        .seek(SeekFrom::Start(8_193))
        .await
        .expect_err("Test operation should fail");
    assert!(matches!(err, StreamError::OutOfBounds { .. }));

    // Seeking exactly to the end is fine and reads return EOF.
    reader
        .seek(SeekFrom::End(0))
        .await
        .expect("Operation should succeed");
    let mut buf = [0u8; 8];
    assert_eq!(
        reader.read(&mut buf).await.expect("Operation should succeed"),
        0
    );
    reader.close().await;
}

#[tokio::test]
async fn reads_prefetch_a_connection_bounded_window() {
    let server = TestServer::start().await;
    let data = payload(10 * 2_048, 10);
    let spec = post_file(&server, "movie.mkv", &data, 2_048, 22_000);

    // Three connections bound the window to three.
    let session = Session::new(vec![server.provider_config(3)]);
    let file = session.file(&spec);
    let token = CancellationToken::new();
    let mut reader = file.open_stream(&token);

    let mut buf = [0u8; 512];
    reader.read(&mut buf).await.expect("Operation should succeed");

    // The three segments after the current one get fetched in the
    // background without further reads.
    wait_until(|| {
        (1..=3).all(|idx| server.body_request_count(&format!("movie.mkv.{idx}@mock")) >= 1)
    })
    .await;

    // Foreground read count for the window stays at one each (dedup).
    let mut rest = vec![0u8; data.len() - 512];
    let mut filled = 0;
    while filled < rest.len() {
        let n = reader
            .read(&mut rest[filled..])
            .await
            .expect("Operation should succeed");
        assert!(n > 0);
        filled += n;
    }
    for idx in 0..10 {
        assert_eq!(
            server.body_request_count(&format!("movie.mkv.{idx}@mock")),
            1,
            "segment {idx} fetched more than once"
        );
    }
    reader.close().await;
}

#[tokio::test]
async fn dropped_reader_wait_does_not_abort_download() {
    let server = TestServer::start().await;
    let data = payload(2 * 4_096, 11);
    let spec = post_file(&server, "movie.mkv", &data, 4_096, 27_000);

    let session = Session::new(vec![server.provider_config(2)]);
    let file = session.file(&spec);
    let token = CancellationToken::new();
    file.size(&token).await.expect("Operation should succeed");

    // Start a download, then cancel only the waiting side immediately.
    let wait_token = CancellationToken::new();
    let mut handle = file
        .start_download_segment(1)
        .expect("Operation should succeed");
    wait_token.cancel();
    let err = handle
        .wait(&wait_token)
        .await
        .expect_err("Test operation should fail");
    assert!(matches!(err, StreamError::Cancelled));

    // The download itself carried on under the file context and is served
    // from cache to the next caller.
    let bytes = file
        .download_segment(&token, 1)
        .await
        .expect("Operation should succeed");
    assert_eq!(bytes.as_ref(), &data[4_096..]);
    assert_eq!(server.body_request_count("movie.mkv.1@mock"), 1);
}
