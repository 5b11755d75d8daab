//! Host-local reservation

use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use dutlab::errors::LabError;
use dutlab::pool::lock::HostLock;

use crate::helpers::{device_config, mock_pool};

#[tokio::test]
async fn test_reserve_times_out_within_timeout_plus_interval() {
    let dir = tempfile::tempdir().unwrap();
    let sweep = Duration::from_millis(200);
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), sweep);
    let _held = HostLock::try_acquire(&dir.path().join("aft_pc1.lock")).unwrap().unwrap();

    let timeout = Duration::from_millis(500);
    let start = Instant::now();
    let result = pool.reserve("pc1", timeout, &CancellationToken::new()).await;

    assert!(matches!(result, Err(LabError::Timeout(_))));
    assert!(start.elapsed() >= timeout);
    assert!(start.elapsed() <= timeout + sweep + Duration::from_millis(200));
}

#[tokio::test]
async fn test_unknown_selector_fails_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_secs(10));

    let start = Instant::now();
    let result = pool
        .reserve("rpi", Duration::from_secs(60), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(LabError::ConfigError(_))));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_model_selector_takes_first_free_device() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(
        vec![
            device_config(dir.path(), "pc1", "pc"),
            device_config(dir.path(), "pc2", "pc"),
        ],
        dir.path(),
        Duration::from_millis(50),
    );
    let cancel = CancellationToken::new();

    let mut first = pool.reserve("pc", Duration::from_secs(1), &cancel).await.unwrap();
    let mut second = pool.reserve("pc", Duration::from_secs(1), &cancel).await.unwrap();
    assert_eq!(first.device().name(), "pc1");
    assert_eq!(second.device().name(), "pc2");

    first.release();
    second.release();
}

#[tokio::test]
async fn test_concurrent_reservations_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let timeout = Duration::from_millis(300);

    let (a, b) = tokio::join!(
        pool.reserve("pc1", timeout, &cancel),
        pool.reserve("pc1", timeout, &cancel)
    );

    let (mut winner, loser) = match (a, b) {
        (Ok(r), Err(e)) | (Err(e), Ok(r)) => (r, e),
        (a, b) => panic!("expected exactly one reservation, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(loser, LabError::Timeout(_)));

    winner.release();
    let mut again = pool.reserve("pc1", timeout, &cancel).await.unwrap();
    again.release();
}

#[tokio::test]
async fn test_waiter_gets_device_after_release() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_millis(50));
    let cancel = CancellationToken::new();

    let mut holder = pool.reserve("pc1", Duration::from_secs(1), &cancel).await.unwrap();
    let release_later = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        holder.release();
    };
    let (_, waiter) = tokio::join!(release_later, pool.reserve("pc1", Duration::from_secs(2), &cancel));

    let mut waiter = waiter.unwrap();
    assert!(!waiter.is_released());
    waiter.release();
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_millis(50));
    let cancel = CancellationToken::new();

    let mut first = assert_ok!(pool.reserve("pc1", Duration::from_secs(1), &cancel).await);
    pool.release(&mut first);
    pool.release(&mut first);
    assert!(first.is_released());

    // Releasing the stale handle again must not free the new holder
    let mut second = pool.reserve("pc1", Duration::from_secs(1), &cancel).await.unwrap();
    first.release();
    assert!(HostLock::try_acquire(&pool.lock_path(second.device().config()))
        .unwrap()
        .is_none());
    second.release();
}

#[tokio::test]
async fn test_cancel_interrupts_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_secs(30));
    let _held = HostLock::try_acquire(&dir.path().join("aft_pc1.lock")).unwrap().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pool.reserve("pc1", Duration::from_secs(60), &cancel).await;
    assert_err!(&result);
    assert!(matches!(result, Err(LabError::Interrupted)));
}

#[tokio::test]
async fn test_with_reservation_releases_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_millis(50));
    let cancel = CancellationToken::new();

    let result: Result<(), LabError> = pool
        .with_reservation("pc1", Duration::from_secs(1), &cancel, |_reservation| {
            Box::pin(async { Err(LabError::DeviceError("boom".into())) })
        })
        .await;
    assert!(matches!(result, Err(LabError::DeviceError(_))));

    let mut next = pool.reserve("pc1", Duration::from_millis(100), &cancel).await.unwrap();
    next.release();
}
