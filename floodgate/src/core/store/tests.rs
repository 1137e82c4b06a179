use super::{CounterStore, MemoryStore};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MINUTE: Duration = Duration::from_secs(60);

// A fixed instant keeps bucket boundaries deterministic.
fn aligned_now() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_040)
}

#[test]
fn window_counts_monotonically() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    for expected in 1..=5 {
        let slot = store.increment_window("w:a", MINUTE, now).unwrap();
        assert_eq!(slot.count, expected);
        assert!(slot.expires_at > now);
    }
}

#[test]
fn window_resets_at_bucket_boundary() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    let slot = store.increment_window("w:b", MINUTE, now).unwrap();
    assert_eq!(slot.count, 1);
    store.increment_window("w:b", MINUTE, now).unwrap();

    // Next minute bucket starts fresh
    let later = now + MINUTE;
    let slot = store.increment_window("w:b", MINUTE, later).unwrap();
    assert_eq!(slot.count, 1);
}

#[test]
fn window_count_reads_without_incrementing() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    assert_eq!(store.window_count("w:c", MINUTE, now).unwrap(), 0);
    store.increment_window("w:c", MINUTE, now).unwrap();
    store.increment_window("w:c", MINUTE, now).unwrap();
    assert_eq!(store.window_count("w:c", MINUTE, now).unwrap(), 2);
    // A lapsed bucket reads as zero
    assert_eq!(store.window_count("w:c", MINUTE, now + MINUTE).unwrap(), 0);
}

#[test]
fn bucket_starts_full_and_consumes() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    let v = store.consume_tokens("tb:a", 10.0, 0.2, 5.0, now).unwrap();
    assert!(v.allowed);
    assert_eq!(v.remaining as i64, 5);

    // After 5 simulated seconds at 0.2/s one token is refilled
    let later = now + Duration::from_secs(5);
    let v = store.consume_tokens("tb:a", 10.0, 0.2, 1.0, later).unwrap();
    assert!(v.allowed);
    assert_eq!(v.remaining.round() as i64, 5);
}

#[test]
fn bucket_denies_and_reports_wait() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    store.consume_tokens("tb:b", 4.0, 1.0, 4.0, now).unwrap();
    let v = store.consume_tokens("tb:b", 4.0, 1.0, 2.0, now).unwrap();
    assert!(!v.allowed);
    assert_eq!(v.retry_after, Duration::from_secs(2));

    // Denied attempts do not drain the bucket below zero
    assert!(v.remaining >= 0.0);
}

#[test]
fn bucket_never_exceeds_capacity() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    store.consume_tokens("tb:c", 3.0, 10.0, 1.0, now).unwrap();
    // A long idle stretch refills to capacity, not beyond
    let later = now + Duration::from_secs(3600);
    let v = store.consume_tokens("tb:c", 3.0, 10.0, 0.0, later).unwrap();
    assert_eq!(v.remaining, 3.0);
}

#[test]
fn flags_expire() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    store
        .set_flag("block:u1", Duration::from_secs(30), now)
        .unwrap();
    let expiry = store.flag_expiry("block:u1", now).unwrap();
    assert_eq!(expiry, Some(now + Duration::from_secs(30)));

    assert_eq!(
        store
            .flag_expiry("block:u1", now + Duration::from_secs(31))
            .unwrap(),
        None
    );
}

#[test]
fn remove_prefix_deletes_matching_keys() {
    let mut store = MemoryStore::new();
    let now = aligned_now();

    store.increment_window("fg:u1:chat:60", MINUTE, now).unwrap();
    store.increment_window("fg:u1:docs:60", MINUTE, now).unwrap();
    store.increment_window("fg:u2:chat:60", MINUTE, now).unwrap();

    let removed = store.remove_prefix("fg:u1:").unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.len(), 1);
    assert_eq!(store.window_count("fg:u1:chat:60", MINUTE, now).unwrap(), 0);
    assert_eq!(store.window_count("fg:u2:chat:60", MINUTE, now).unwrap(), 1);
}

#[test]
fn sweep_reclaims_expired_entries() {
    let mut store = MemoryStore::builder()
        .capacity(16)
        .sweep_interval(Duration::from_secs(60))
        .build();
    let now = aligned_now();

    for i in 0..10 {
        store
            .increment_window(&format!("w:{i}"), Duration::from_secs(1), now)
            .unwrap();
    }
    assert_eq!(store.len(), 10);

    // Past the sweep interval, a mutation triggers reclamation of the
    // long-expired one-second buckets.
    let later = now + Duration::from_secs(120);
    store.increment_window("w:keep", MINUTE, later).unwrap();
    assert_eq!(store.swept(), 10);
    assert_eq!(store.len(), 1);
}

#[test]
fn sweep_schedule_follows_the_supplied_clock() {
    let mut store = MemoryStore::builder()
        .sweep_interval(Duration::from_secs(60))
        .build();
    // A clock nowhere near the wall clock; the sweep schedule must
    // anchor to it, not to construction time.
    let epoch = UNIX_EPOCH + Duration::from_secs(60);

    store
        .increment_window("w:old", Duration::from_secs(1), epoch)
        .unwrap();

    // Within the interval nothing is reclaimed yet
    let hour = Duration::from_secs(3600);
    store
        .increment_window("w:mid", hour, epoch + Duration::from_secs(30))
        .unwrap();
    assert_eq!(store.len(), 2);

    // One interval past the first observed instant, the lapsed
    // one-second window is swept.
    store
        .increment_window("w:new", hour, epoch + Duration::from_secs(61))
        .unwrap();
    assert_eq!(store.swept(), 1);
    assert!(store.window_count("w:old", Duration::from_secs(1), epoch).unwrap() == 0);
}
