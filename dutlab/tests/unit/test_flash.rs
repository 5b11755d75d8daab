//! Bounded-retry flashing

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dutlab::device::Device;
use dutlab::errors::LabError;
use dutlab::flash::{FlashOrchestrator, FlashOutcome, ImageWriter};
use dutlab::pool::lock::HostLock;

use crate::helpers::{device_config, mock_pool};

/// Fails until the `succeed_on`-th write; never succeeds when `None`
struct StubWriter {
    succeed_on: Option<u32>,
    interrupt: bool,
    writes: AtomicU32,
}

impl StubWriter {
    fn new(succeed_on: Option<u32>) -> Self {
        Self {
            succeed_on,
            interrupt: false,
            writes: AtomicU32::new(0),
        }
    }

    fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageWriter for StubWriter {
    async fn write_image(&self, _device: &mut Device, _image: &Path, _cancel: &CancellationToken) -> Result<(), LabError> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.interrupt {
            return Err(LabError::Interrupted);
        }
        match self.succeed_on {
            Some(n) if write >= n => Ok(()),
            _ => Err(LabError::FlashImage(format!("write {} failed", write))),
        }
    }
}

#[tokio::test]
async fn test_flash_succeeds_on_last_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let mut reservation = pool.reserve("pc1", Duration::from_secs(1), &cancel).await.unwrap();

    let writer = Arc::new(StubWriter::new(Some(3)));
    let attempt = FlashOrchestrator::new(writer.clone())
        .flash(&mut reservation, Path::new("core.wic"), 3, &cancel)
        .await
        .unwrap();

    assert_eq!(writer.writes(), 3);
    assert_eq!(attempt.attempt_number, 3);
    assert_eq!(attempt.outcome, FlashOutcome::Success);
    assert!(!reservation.is_released());
    reservation.release();
}

#[tokio::test]
async fn test_flash_exhaustion_releases_and_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let mut reservation = pool.reserve("pc1", Duration::from_secs(1), &cancel).await.unwrap();

    let writer = Arc::new(StubWriter::new(None));
    let result = FlashOrchestrator::new(writer.clone())
        .flash(&mut reservation, Path::new("core.wic"), 4, &cancel)
        .await;

    assert_eq!(writer.writes(), 4);
    match result {
        Err(LabError::FlashImage(message)) => assert_eq!(message, "write 4 failed"),
        other => panic!("unexpected result: {:?}", other.map(|a| a.attempt_number)),
    }
    assert!(reservation.is_released());
    let free = HostLock::try_acquire(&pool.lock_path(reservation.device().config())).unwrap();
    assert!(free.is_some());
}

#[tokio::test]
async fn test_flash_interrupt_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mock_pool(vec![device_config(dir.path(), "pc1", "pc")], dir.path(), Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let mut reservation = pool.reserve("pc1", Duration::from_secs(1), &cancel).await.unwrap();

    let writer = Arc::new(StubWriter {
        interrupt: true,
        ..StubWriter::new(None)
    });
    let result = FlashOrchestrator::new(writer.clone())
        .flash(&mut reservation, Path::new("core.wic"), 5, &cancel)
        .await;

    assert!(matches!(result, Err(LabError::Interrupted)));
    assert_eq!(writer.writes(), 1);
    assert!(!reservation.is_released());
    reservation.release();
}
