use std::time::Duration;

use census_ingest::rate_limit::Accountant;

/// Sum of admitted calls never exceeds daily_limit - reserve until reset.
#[tokio::test]
async fn budget_is_never_overrun() {
    let accountant = Accountant::new_in_memory(10, 0, Duration::from_secs(60));
    let mut admitted_total = 0u32;
    for _ in 0..50 {
        if accountant.try_acquire(1).await.unwrap() {
            admitted_total += 1;
        }
    }
    assert!(admitted_total <= 10);
}

/// Budget exhaustion: at most daily_limit calls are admitted, the rest
/// are denied outright.
#[tokio::test]
async fn budget_exhaustion_denies_beyond_daily_limit() {
    let accountant = Accountant::new_in_memory(10, 0, Duration::from_secs(60));
    let mut admitted = 0u32;
    let mut denied = 0u32;
    for _ in 0..20 {
        if accountant.try_acquire(1).await.unwrap() {
            admitted += 1;
        } else {
            denied += 1;
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(denied, 10);
}

#[tokio::test]
async fn denied_acquisitions_do_not_consume_budget() {
    let accountant = Accountant::new_in_memory(5, 0, Duration::from_secs(60));
    assert!(accountant.try_acquire(5).await.unwrap());
    assert!(!accountant.try_acquire(1).await.unwrap());
    let snapshot = accountant.snapshot().await.unwrap();
    assert_eq!(snapshot.used, 5);
}

#[tokio::test]
async fn reserve_for_interactive_is_withheld_from_available() {
    let accountant = Accountant::new_in_memory(100, 30, Duration::from_secs(60));
    assert!(accountant.try_acquire(70).await.unwrap());
    assert!(!accountant.try_acquire(1).await.unwrap());
}

#[tokio::test]
async fn record_performs_post_call_bookkeeping() {
    let accountant = Accountant::new_in_memory(100, 0, Duration::from_secs(60));
    accountant.record(3).await.unwrap();
    let snapshot = accountant.snapshot().await.unwrap();
    assert_eq!(snapshot.used, 3);
}
