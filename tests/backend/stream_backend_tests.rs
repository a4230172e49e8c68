//! StreamBackend contract tests.
//!
//! These tests verify the contract of the StreamBackend trait.
//! Each backend implementation should run these tests. Every test works on
//! keys under its own `prefix`, so runs against a shared server don't collide.

use std::collections::HashSet;
use std::time::Duration;

use event_store::backend::{BackendError, GroupStart, StoredEntry, StreamBackend};
use event_store::envelope::RawEntry;

fn entry(n: usize) -> RawEntry {
    RawEntry::new()
        .with("n", n.to_string())
        .with("eventType", "Numbered")
}

fn entries(range: std::ops::Range<usize>) -> Vec<RawEntry> {
    range.map(entry).collect()
}

fn numbers(entries: &[StoredEntry]) -> Vec<usize> {
    entries
        .iter()
        .map(|e| e.raw.get("n").unwrap().parse().unwrap())
        .collect()
}

fn keys(prefix: &str, name: &str) -> (String, String) {
    (format!("{prefix}:{name}:agg"), format!("{prefix}:{name}:all"))
}

// =============================================================================
// StreamBackend::append tests
// =============================================================================

pub async fn test_append_to_new_stream<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "append_new");

    let version = backend
        .append(&stream, &global, -1, entries(0..2))
        .await
        .expect("append should succeed");

    assert_eq!(version, 1, "two entries end at version 1");
    assert_eq!(backend.stream_len(&stream).await.unwrap(), 2);
    assert_eq!(backend.stream_len(&global).await.unwrap(), 2);
}

pub async fn test_append_version_mismatch<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "append_mismatch");
    backend
        .append(&stream, &global, -1, entries(0..2))
        .await
        .unwrap();

    let result = backend.append(&stream, &global, -1, entries(2..3)).await;

    assert!(
        matches!(result, Err(BackendError::VersionMismatch { actual: 1 })),
        "stale expected version must be rejected, got {result:?}"
    );
    assert_eq!(backend.stream_len(&stream).await.unwrap(), 2);
    assert_eq!(
        backend.stream_len(&global).await.unwrap(),
        2,
        "rejected append must not touch the global log"
    );
}

pub async fn test_append_sequential_batches<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "append_sequential");

    assert_eq!(
        backend.append(&stream, &global, -1, entries(0..2)).await.unwrap(),
        1
    );
    assert_eq!(
        backend.append(&stream, &global, 1, entries(2..5)).await.unwrap(),
        4
    );

    let all = backend.range(&stream, 0, None).await.unwrap();
    assert_eq!(numbers(&all), vec![0, 1, 2, 3, 4]);
}

pub async fn test_global_log_interleaves_streams<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (first, global) = keys(prefix, "global");
    let second = format!("{first}-second");

    backend.append(&first, &global, -1, entries(0..2)).await.unwrap();
    backend.append(&second, &global, -1, entries(2..3)).await.unwrap();
    backend.append(&first, &global, 1, entries(3..4)).await.unwrap();

    let all = backend.range(&global, 0, None).await.unwrap();
    assert_eq!(numbers(&all), vec![0, 1, 2, 3]);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id), "ids must increase");
}

// =============================================================================
// StreamBackend::range tests
// =============================================================================

pub async fn test_range_bounds<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "range");
    backend
        .append(&stream, &global, -1, entries(0..5))
        .await
        .unwrap();

    let middle = backend.range(&stream, 2, Some(4)).await.unwrap();
    assert_eq!(numbers(&middle), vec![2, 3, 4]);

    let tail = backend.range(&stream, 3, None).await.unwrap();
    assert_eq!(numbers(&tail), vec![3, 4]);

    let clipped = backend.range(&stream, 4, Some(100)).await.unwrap();
    assert_eq!(numbers(&clipped), vec![4]);

    assert!(backend.range(&stream, 10, None).await.unwrap().is_empty());
    assert!(backend.range(&stream, 3, Some(1)).await.unwrap().is_empty());
    let (missing, _) = keys(prefix, "range_missing");
    assert!(backend.range(&missing, 0, None).await.unwrap().is_empty());
}

pub async fn test_range_preserves_fields<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "range_fields");
    let raw = RawEntry::new()
        .with("eventType", "Created")
        .with("eventData", r#"{"name":"a b \"c\""}"#)
        .with("correlationId", "req-1");

    backend
        .append(&stream, &global, -1, vec![raw.clone()])
        .await
        .unwrap();

    let stored = backend.range(&stream, 0, None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].raw, raw);
}

// =============================================================================
// Consumer group tests
// =============================================================================

pub async fn test_group_latest_skips_existing<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (stream, global) = keys(prefix, "group_latest");
    backend.append(&stream, &global, -1, entries(0..1)).await.unwrap();

    assert!(backend
        .create_group(&global, "g", GroupStart::Latest)
        .await
        .unwrap());
    assert!(
        !backend
            .create_group(&global, "g", GroupStart::Latest)
            .await
            .unwrap(),
        "recreating a group is not an error"
    );

    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(delivered.is_empty(), "latest group starts after existing entries");

    backend.append(&stream, &global, 0, entries(1..2)).await.unwrap();
    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(numbers(&delivered), vec![1]);
}

pub async fn test_group_beginning_reads_existing<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (stream, global) = keys(prefix, "group_beginning");
    backend.append(&stream, &global, -1, entries(0..3)).await.unwrap();

    backend
        .create_group(&global, "g", GroupStart::Beginning)
        .await
        .unwrap();

    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(numbers(&delivered), vec![0, 1, 2]);
}

pub async fn test_group_on_missing_stream<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "group_missing");

    assert!(backend
        .create_group(&global, "g", GroupStart::Latest)
        .await
        .unwrap());
    backend.append(&stream, &global, -1, entries(0..1)).await.unwrap();

    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(numbers(&delivered), vec![0]);
}

pub async fn test_competing_consumers_split_entries<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (stream, global) = keys(prefix, "competing");
    backend
        .create_group(&global, "g", GroupStart::Beginning)
        .await
        .unwrap();
    backend.append(&stream, &global, -1, entries(0..6)).await.unwrap();

    let first = backend
        .read_new(&global, "g", "c1", 3, Duration::ZERO)
        .await
        .unwrap();
    let second = backend
        .read_new(&global, "g", "c2", 10, Duration::ZERO)
        .await
        .unwrap();
    let third = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();

    let mut seen = HashSet::new();
    for n in numbers(&first).into_iter().chain(numbers(&second)) {
        assert!(seen.insert(n), "entry {n} delivered twice");
    }
    assert_eq!(seen.len(), 6);
    assert!(third.is_empty());
}

pub async fn test_groups_receive_independent_copies<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (stream, global) = keys(prefix, "broadcast");
    for group in ["projections", "notifications"] {
        backend
            .create_group(&global, group, GroupStart::Beginning)
            .await
            .unwrap();
    }
    backend.append(&stream, &global, -1, entries(0..3)).await.unwrap();

    for group in ["projections", "notifications"] {
        let delivered = backend
            .read_new(&global, group, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(numbers(&delivered), vec![0, 1, 2], "group {group}");
    }
}

pub async fn test_pending_and_ack<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "pending");
    backend
        .create_group(&global, "g", GroupStart::Beginning)
        .await
        .unwrap();
    backend.append(&stream, &global, -1, entries(0..3)).await.unwrap();

    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();

    let pending = backend.pending(&global, "g").await.unwrap();
    assert_eq!(pending.count, 3);
    assert_eq!(pending.lowest, Some(delivered[0].id));
    assert_eq!(pending.highest, Some(delivered[2].id));
    assert_eq!(pending.consumers.get("c1"), Some(&3));

    let ids: Vec<_> = delivered.iter().take(2).map(|e| e.id).collect();
    assert_eq!(backend.ack(&global, "g", &ids).await.unwrap(), 2);
    assert_eq!(
        backend.ack(&global, "g", &ids).await.unwrap(),
        0,
        "acknowledging twice is a no-op"
    );

    let pending = backend.pending(&global, "g").await.unwrap();
    assert_eq!(pending.count, 1);
    assert_eq!(pending.lowest, Some(delivered[2].id));
}

pub async fn test_acknowledged_entries_are_not_redelivered<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (stream, global) = keys(prefix, "acked");
    backend
        .create_group(&global, "g", GroupStart::Beginning)
        .await
        .unwrap();
    backend.append(&stream, &global, -1, entries(0..2)).await.unwrap();

    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();
    let ids: Vec<_> = delivered.iter().map(|e| e.id).collect();
    backend.ack(&global, "g", &ids).await.unwrap();

    let claimed = backend
        .claim_idle(&global, "g", "c2", Duration::ZERO, 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
    let fresh = backend
        .read_new(&global, "g", "c2", 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(fresh.is_empty());
}

pub async fn test_claim_idle_transfers_ownership<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (stream, global) = keys(prefix, "claim");
    backend
        .create_group(&global, "g", GroupStart::Beginning)
        .await
        .unwrap();
    backend.append(&stream, &global, -1, entries(0..2)).await.unwrap();
    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(delivered.iter().all(|e| e.deliveries == 1));

    let too_soon = backend
        .claim_idle(&global, "g", "c2", Duration::from_secs(3600), 10)
        .await
        .unwrap();
    assert!(too_soon.is_empty(), "fresh deliveries are not idle");

    let claimed = backend
        .claim_idle(&global, "g", "c2", Duration::ZERO, 1)
        .await
        .unwrap();
    assert_eq!(numbers(&claimed), vec![0], "claims oldest first, up to count");
    assert_eq!(claimed[0].deliveries, 2, "a claim counts as a delivery");

    let pending = backend.pending(&global, "g").await.unwrap();
    assert_eq!(pending.count, 2);
    assert_eq!(pending.consumers.get("c1"), Some(&1));
    assert_eq!(pending.consumers.get("c2"), Some(&1));
}

pub async fn test_read_without_group_fails<B: StreamBackend + ?Sized>(backend: &B, prefix: &str) {
    let (stream, global) = keys(prefix, "no_group");
    backend.append(&stream, &global, -1, entries(0..1)).await.unwrap();

    let result = backend
        .read_new(&global, "missing", "c1", 10, Duration::ZERO)
        .await;

    assert!(
        matches!(result, Err(BackendError::NoGroup { .. })),
        "got {result:?}"
    );
}

pub async fn test_blocking_read_returns_empty_after_timeout<B: StreamBackend + ?Sized>(
    backend: &B,
    prefix: &str,
) {
    let (_, global) = keys(prefix, "block");
    backend
        .create_group(&global, "g", GroupStart::Latest)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let delivered = backend
        .read_new(&global, "g", "c1", 10, Duration::from_millis(50))
        .await
        .unwrap();

    assert!(delivered.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(40));
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all StreamBackend contract tests against a backend implementation.
#[macro_export]
macro_rules! run_stream_backend_tests {
    ($backend:expr, $prefix:expr) => {
        use $crate::backend::stream_backend_tests::*;

        // append tests
        test_append_to_new_stream($backend, $prefix).await;
        println!("  test_append_to_new_stream: PASSED");

        test_append_version_mismatch($backend, $prefix).await;
        println!("  test_append_version_mismatch: PASSED");

        test_append_sequential_batches($backend, $prefix).await;
        println!("  test_append_sequential_batches: PASSED");

        test_global_log_interleaves_streams($backend, $prefix).await;
        println!("  test_global_log_interleaves_streams: PASSED");

        // range tests
        test_range_bounds($backend, $prefix).await;
        println!("  test_range_bounds: PASSED");

        test_range_preserves_fields($backend, $prefix).await;
        println!("  test_range_preserves_fields: PASSED");

        // consumer group tests
        test_group_latest_skips_existing($backend, $prefix).await;
        println!("  test_group_latest_skips_existing: PASSED");

        test_group_beginning_reads_existing($backend, $prefix).await;
        println!("  test_group_beginning_reads_existing: PASSED");

        test_group_on_missing_stream($backend, $prefix).await;
        println!("  test_group_on_missing_stream: PASSED");

        test_competing_consumers_split_entries($backend, $prefix).await;
        println!("  test_competing_consumers_split_entries: PASSED");

        test_groups_receive_independent_copies($backend, $prefix).await;
        println!("  test_groups_receive_independent_copies: PASSED");

        test_pending_and_ack($backend, $prefix).await;
        println!("  test_pending_and_ack: PASSED");

        test_acknowledged_entries_are_not_redelivered($backend, $prefix).await;
        println!("  test_acknowledged_entries_are_not_redelivered: PASSED");

        test_claim_idle_transfers_ownership($backend, $prefix).await;
        println!("  test_claim_idle_transfers_ownership: PASSED");

        test_read_without_group_fails($backend, $prefix).await;
        println!("  test_read_without_group_fails: PASSED");

        test_blocking_read_returns_empty_after_timeout($backend, $prefix).await;
        println!("  test_blocking_read_returns_empty_after_timeout: PASSED");
    };
}
