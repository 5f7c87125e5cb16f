//! Discovery: paging, idempotent re-discovery and partial results

mod helpers;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use harvest_backfill::models::ImportStatus;
use harvest_backfill::rate_limiter::{RateLimiter, RefillRate};
use harvest_backfill::services::{
    DiscoveryFilters, PortalError, RawDescriptor, SessionDiscoverer, StopReason,
};
use harvest_backfill::store::DiscoveryStore;
use helpers::{date, memory_store, raw, status_of, unlimited, ScriptedPortal};

fn eight_sessions() -> Vec<Vec<RawDescriptor>> {
    let page_one = (1..=5)
        .map(|i| raw(&format!("R{}", i), Some(format!("March {}, 2023", i).as_str())))
        .collect();
    let page_two = (6..=8)
        .map(|i| raw(&format!("R{}", i), Some(format!("March {}, 2023", i).as_str())))
        .collect();
    vec![page_one, page_two]
}

#[tokio::test(start_paused = true)]
async fn test_discovers_every_page_until_exhausted() {
    let store = memory_store();
    let portal = Arc::new(ScriptedPortal::new(eight_sessions()));
    let discoverer = SessionDiscoverer::new(portal.clone(), store.clone(), unlimited());

    let report = discoverer
        .discover(&DiscoveryFilters::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.new, 8);
    assert_eq!(report.known, 0);
    assert_eq!(report.pages_fetched, 2);
    assert_eq!(report.stop_reason, StopReason::Exhausted);
    assert!(!report.is_partial());
    assert_eq!(portal.requested(), vec![None, Some("page-1".to_string())]);

    let pending = store
        .list_descriptors(Some(ImportStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 8);

    let r3 = store.get_descriptor("R3").await.unwrap().unwrap();
    assert_eq!(r3.session_date, Some(date(2023, 3, 3)));
    assert_eq!(r3.access_key, "key-R3");
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_adds_nothing() {
    let store = memory_store();
    let portal = Arc::new(ScriptedPortal::new(eight_sessions()));
    let discoverer = SessionDiscoverer::new(portal, store.clone(), unlimited());
    let cancel = CancellationToken::new();

    discoverer
        .discover(&DiscoveryFilters::default(), &cancel)
        .await
        .unwrap();
    let again = discoverer
        .discover(&DiscoveryFilters::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(again.new, 0);
    assert_eq!(again.known, 8);
    assert_eq!(again.updated, 0);
    assert_eq!(store.list_descriptors(None).await.unwrap().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_keeps_import_progress() {
    let store = memory_store();
    let portal = Arc::new(ScriptedPortal::new(eight_sessions()));
    let discoverer = SessionDiscoverer::new(portal, store.clone(), unlimited());
    let cancel = CancellationToken::new();

    discoverer
        .discover(&DiscoveryFilters::default(), &cancel)
        .await
        .unwrap();

    store.begin_import("R1", "run-1").await.unwrap();
    store.complete_import("R1", 42).await.unwrap();
    store.begin_import("R2", "run-1").await.unwrap();
    store.record_failure("R2", "transient: timeout", true).await.unwrap();

    discoverer
        .discover(&DiscoveryFilters::default(), &cancel)
        .await
        .unwrap();

    let r1 = store.get_descriptor("R1").await.unwrap().unwrap();
    assert_eq!(r1.import_status, ImportStatus::Imported);
    assert_eq!(r1.record_count_actual, Some(42));
    assert_eq!(r1.attempt_count, 1);

    let r2 = store.get_descriptor("R2").await.unwrap().unwrap();
    assert_eq!(r2.import_status, ImportStatus::Pending);
    assert_eq!(r2.attempt_count, 1);
    assert_eq!(r2.last_error.as_deref(), Some("transient: timeout"));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_page_token_stops_paging() {
    let store = memory_store();
    let portal = Arc::new(ScriptedPortal::new(eight_sessions()).stuck_at(1));
    let discoverer = SessionDiscoverer::new(portal.clone(), store.clone(), unlimited());

    let report = discoverer
        .discover(&DiscoveryFilters::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::RepeatedPageToken);
    assert!(report.is_partial());
    assert_eq!(report.pages_fetched, 2);
    assert_eq!(report.new, 8);
    assert_eq!(portal.requested(), vec![None, Some("page-1".to_string())]);
    assert!(report.last_error.as_deref().unwrap().contains("page-1"));
}

#[tokio::test(start_paused = true)]
async fn test_failing_page_keeps_earlier_pages() {
    let store = memory_store();
    let errors = vec![PortalError::Transient("503 Service Unavailable".into()); 3];
    let portal = Arc::new(ScriptedPortal::new(eight_sessions()).failing_page(1, errors));
    let discoverer = SessionDiscoverer::new(portal.clone(), store.clone(), unlimited())
        .with_page_retry(3, Duration::from_secs(2));

    let report = discoverer
        .discover(&DiscoveryFilters::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::PageFailed);
    assert!(report.is_partial());
    assert_eq!(report.new, 5);
    assert!(report
        .last_error
        .as_deref()
        .unwrap()
        .contains("503 Service Unavailable"));

    // first page once, second page three times
    assert_eq!(portal.requested().len(), 4);
    assert_eq!(store.list_descriptors(None).await.unwrap().len(), 5);
    assert_eq!(status_of(store.as_ref(), "R5").await, ImportStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_transient_page_failure_is_retried() {
    let store = memory_store();
    let portal = Arc::new(
        ScriptedPortal::new(eight_sessions())
            .failing_page(1, vec![PortalError::Transient("timeout".into())]),
    );
    let discoverer = SessionDiscoverer::new(portal.clone(), store.clone(), unlimited())
        .with_page_retry(3, Duration::from_secs(2));

    let report = discoverer
        .discover(&DiscoveryFilters::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Exhausted);
    assert_eq!(report.new, 8);

    let times = portal.call_times();
    assert_eq!(times.len(), 3);
    assert!(times[2] - times[1] >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_max_pages_stops_early() {
    let store = memory_store();
    let portal = Arc::new(ScriptedPortal::new(eight_sessions()));
    let discoverer = SessionDiscoverer::new(portal.clone(), store.clone(), unlimited());

    let report = discoverer
        .discover(
            &DiscoveryFilters {
                max_pages: Some(1),
                max_results: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::MaxPages);
    assert_eq!(report.new, 5);
    assert_eq!(portal.requested().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_results_stops_mid_page() {
    let store = memory_store();
    let portal = Arc::new(ScriptedPortal::new(eight_sessions()));
    let discoverer = SessionDiscoverer::new(portal, store.clone(), unlimited());

    let report = discoverer
        .discover(
            &DiscoveryFilters {
                max_pages: None,
                max_results: Some(3),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::MaxResults);
    assert_eq!(report.new, 3);
    assert_eq!(store.list_descriptors(None).await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_rows_are_skipped_and_counted() {
    let store = memory_store();
    let mut no_key = raw("R9", None);
    no_key.access_key = None;
    let link = RawDescriptor {
        raw_id_or_url: "https://portal.example.com/report?report_id=R10&key=abc".into(),
        ..RawDescriptor::default()
    };
    let portal = Arc::new(ScriptedPortal::new(vec![vec![
        raw("R1", None),
        no_key,
        link,
    ]]));
    let discoverer = SessionDiscoverer::new(portal, store.clone(), unlimited());

    let report = discoverer
        .discover(&DiscoveryFilters::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.new, 2);
    assert_eq!(report.invalid, 1);

    let r10 = store.get_descriptor("R10").await.unwrap().unwrap();
    assert_eq!(r10.access_key, "abc");
    assert!(store.get_descriptor("R9").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disagreeing_dates_are_flagged() {
    let store = memory_store();
    let mut row = raw("R1", Some("Sunday, April 2nd 2023"));
    row.display_text = Some("League night 2023-04-20".into());
    let portal = Arc::new(ScriptedPortal::new(vec![vec![row]]));
    let discoverer = SessionDiscoverer::new(portal, store.clone(), unlimited());

    let report = discoverer
        .discover(&DiscoveryFilters::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.date_flagged, 1);
    let r1 = store.get_descriptor("R1").await.unwrap().unwrap();
    assert!(r1.date_flagged);
    assert_eq!(r1.session_date, Some(date(2023, 4, 2)));
}

#[tokio::test(start_paused = true)]
async fn test_page_fetches_share_the_rate_limit() {
    let store = memory_store();
    let pages = (0..3).map(|i| vec![raw(&format!("R{}", i), None)]).collect();
    let portal = Arc::new(ScriptedPortal::new(pages));
    let limiter = Arc::new(RateLimiter::new(1, RefillRate::per_second(0.1).unwrap()).unwrap());
    let discoverer = SessionDiscoverer::new(portal.clone(), store, limiter);

    discoverer
        .discover(&DiscoveryFilters::default(), &CancellationToken::new())
        .await
        .unwrap();

    let times = portal.call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(10));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_discovery_reports_partial() {
    let store = memory_store();
    let pages = (0..3).map(|i| vec![raw(&format!("R{}", i), None)]).collect();
    let portal = Arc::new(ScriptedPortal::new(pages));
    let limiter = Arc::new(RateLimiter::new(1, RefillRate::per_second(0.1).unwrap()).unwrap());
    let discoverer = SessionDiscoverer::new(portal.clone(), store.clone(), limiter);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        })
    };

    let report = discoverer
        .discover(&DiscoveryFilters::default(), &cancel)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert!(report.is_partial());
    assert_eq!(report.pages_fetched, 1);
    assert_eq!(store.list_descriptors(None).await.unwrap().len(), 1);
}
