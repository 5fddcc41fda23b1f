//! Entry lifecycle tests against a scripted upstream: cold start, warm
//! start from disk, verification failures, and metadata-only refreshes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    at, body, rogue_key, signed_response, signed_response_with_key, test_pki, ScriptedFetcher,
    TestPki,
};
use staple_cache::{CacheError, Clock, Entry, FakeClock, FetchOutcome};

/// One hour before the clock used by most tests
const T0: u64 = 1_700_000_000;

fn entry_with(
    pki: &TestPki,
    fetcher: Arc<ScriptedFetcher>,
    clock: &FakeClock,
) -> Entry {
    Entry::new(
        "example.org.pem",
        pki.serial.clone(),
        pki.issuer.clone(),
        vec!["http://ocsp.example.test/".to_string()],
        fetcher,
        Arc::new(clock.clone()),
    )
    .with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn cold_start_fetches_verifies_and_persists() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 4 * 3600));

    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("example.org.resp");

    let fetcher = ScriptedFetcher::new(vec![Ok(body(response.clone()))]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock)
        .with_response_filename(snapshot_path.clone());
    entry.init().await.unwrap();

    assert_eq!(fetcher.calls(), 1);
    let snapshot = entry.snapshot().await.expect("entry is servable");
    assert_eq!(snapshot.bytes, response);
    assert_eq!(snapshot.this_update, at(T0 - 3600));
    assert_eq!(snapshot.next_update, at(T0 + 4 * 3600));

    // write-then-read round trip: the snapshot on disk is byte identical
    let on_disk = std::fs::read(&snapshot_path).unwrap();
    assert_eq!(on_disk, response);
}

#[tokio::test]
async fn warm_start_serves_from_disk_without_network() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 4 * 3600));

    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("example.org.resp");
    std::fs::write(&snapshot_path, &response).unwrap();

    // upstream is unreachable, init must not need it
    let fetcher = ScriptedFetcher::new(vec![]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock)
        .with_response_filename(snapshot_path);
    entry.init().await.unwrap();

    assert_eq!(fetcher.calls(), 0);
    let snapshot = entry.snapshot().await.expect("entry is servable");
    assert_eq!(snapshot.bytes, response);
}

#[tokio::test]
async fn corrupt_snapshot_fails_init() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));

    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("example.org.resp");
    std::fs::write(&snapshot_path, b"not a response").unwrap();

    let fetcher = ScriptedFetcher::new(vec![]);
    let mut entry = entry_with(&pki, fetcher, &clock).with_response_filename(snapshot_path);
    assert!(matches!(
        entry.init().await,
        Err(CacheError::Verify(_))
    ));
}

#[tokio::test]
async fn expired_snapshot_fails_init() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let expired = signed_response(&pki, at(T0 - 7200), at(T0 - 3600));

    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("example.org.resp");
    std::fs::write(&snapshot_path, &expired).unwrap();

    let fetcher = ScriptedFetcher::new(vec![]);
    let mut entry = entry_with(&pki, fetcher, &clock).with_response_filename(snapshot_path);
    assert!(matches!(entry.init().await, Err(CacheError::Verify(_))));
}

#[tokio::test]
async fn cold_start_with_unreachable_upstream_fails() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));

    let fetcher = ScriptedFetcher::new(vec![Err(CacheError::Fetch("refused".to_string()))]);
    let mut entry = entry_with(&pki, fetcher, &clock);
    assert!(matches!(entry.init().await, Err(CacheError::Fetch(_))));
    assert!(entry.snapshot().await.is_none());
}

#[tokio::test]
async fn bad_signature_on_refresh_keeps_previous_response() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let good = signed_response(&pki, at(T0 - 3600), at(T0 + 3600));
    // a newer response signed by the wrong key
    let forged = signed_response_with_key(
        &rogue_key(),
        &pki.issuer,
        &pki.serial,
        at(T0),
        at(T0 + 8 * 3600),
    );

    let fetcher = ScriptedFetcher::new(vec![Ok(body(good.clone())), Ok(body(forged))]);
    let mut entry = entry_with(&pki, fetcher, &clock);
    entry.init().await.unwrap();

    // expire the good response so the next tick must refresh
    clock.advance(Duration::from_secs(2 * 3600));
    let err = entry.refresh_response().await;
    assert!(matches!(err, Err(CacheError::Verify(_))));

    let snapshot = entry.snapshot().await.expect("previous response kept");
    assert_eq!(snapshot.bytes, good);
}

#[tokio::test]
async fn identical_bytes_only_advance_metadata() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 3600));

    let fetcher = ScriptedFetcher::new(vec![
        Ok(body(response.clone())),
        Ok(FetchOutcome {
            body: Some(response.clone()),
            etag: Some("\"v2\"".to_string()),
            max_age: Duration::from_secs(60),
        }),
        Ok(body(response.clone())),
    ]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock);
    entry.init().await.unwrap();
    let before = entry.snapshot().await.unwrap();

    // past nextUpdate the refresh must fire, but the unchanged body leaves
    // the validity window alone
    clock.advance(Duration::from_secs(2 * 3600));
    entry.refresh_response().await.unwrap();
    let after = entry.snapshot().await.unwrap();
    assert_eq!(before, after);
    assert_eq!(fetcher.calls(), 2);

    // the stored ETag goes out with the next fetch
    entry.refresh_response().await.unwrap();
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(fetcher.last_etag().as_deref(), Some("\"v2\""));
}

#[tokio::test]
async fn not_modified_leaves_response_in_place() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 3600));

    let fetcher = ScriptedFetcher::new(vec![
        Ok(body(response.clone())),
        // 304 outcome: no body at all
        Ok(FetchOutcome {
            body: None,
            etag: Some("\"w1\"".to_string()),
            max_age: Duration::ZERO,
        }),
    ]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock);
    entry.init().await.unwrap();

    clock.advance(Duration::from_secs(2 * 3600));
    entry.refresh_response().await.unwrap();
    let snapshot = entry.snapshot().await.unwrap();
    assert_eq!(snapshot.bytes, response);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn fresh_entry_skips_the_network() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    // wide validity so T0 is far from the update window
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 40 * 3600));

    let fetcher = ScriptedFetcher::new(vec![Ok(body(response))]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock);
    entry.init().await.unwrap();

    entry.refresh_response().await.unwrap();
    entry.refresh_response().await.unwrap();
    assert_eq!(fetcher.calls(), 1, "fresh entry must not refetch");
}

#[tokio::test]
async fn base_backoff_retries_a_failed_fetch_once() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 3600));

    let fetcher = ScriptedFetcher::new(vec![
        Err(CacheError::Fetch("connection reset".to_string())),
        Ok(body(response.clone())),
    ]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock)
        .with_base_backoff(Duration::from_millis(5));
    entry.init().await.unwrap();

    assert_eq!(fetcher.calls(), 2);
    assert_eq!(entry.snapshot().await.unwrap().bytes, response);
}

#[tokio::test]
async fn without_backoff_a_failed_fetch_is_final() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 3600));

    let fetcher = ScriptedFetcher::new(vec![
        Err(CacheError::Fetch("connection reset".to_string())),
        Ok(body(response)),
    ]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock);
    assert!(matches!(entry.init().await, Err(CacheError::Fetch(_))));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn preloaded_request_goes_out_verbatim() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 3600));
    let request = staple_cache::ocsp::encode_request(&pki.issuer, &pki.serial).unwrap();

    let fetcher = ScriptedFetcher::new(vec![Ok(body(response))]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock).with_request(request.clone());
    entry.init().await.unwrap();

    assert_eq!(fetcher.last_request(), request);
}

#[tokio::test]
async fn max_age_hint_forces_an_early_refresh() {
    let pki = test_pki();
    let clock = FakeClock::new(at(T0));
    // long validity, the window alone would not refresh for hours
    let response = signed_response(&pki, at(T0 - 3600), at(T0 + 40 * 3600));

    let fetcher = ScriptedFetcher::new(vec![
        Ok(FetchOutcome {
            body: Some(response.clone()),
            etag: None,
            max_age: Duration::from_secs(300),
        }),
        Ok(body(response.clone())),
    ]);
    let mut entry = entry_with(&pki, fetcher.clone(), &clock);
    entry.init().await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    // inside max-age: nothing happens
    clock.advance(Duration::from_secs(200));
    entry.refresh_response().await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    // past max-age: refresh fires even though the window is far away
    clock.advance(Duration::from_secs(200));
    entry.refresh_response().await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}
