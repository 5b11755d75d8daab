//! Bounded-retry flashing of a reserved device

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::device::Device;
use crate::errors::LabError;
use crate::pool::Reservation;

/// Writes an image onto a device. Each call is a complete, fresh write.
#[async_trait]
pub trait ImageWriter: Send + Sync {
    async fn write_image(
        &self,
        device: &mut Device,
        image: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LabError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashOutcome {
    Pending,
    Success,
    Failed,
}

/// State of one attempt within a flash call
#[derive(Debug, Clone, Serialize)]
pub struct FlashAttempt {
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub outcome: FlashOutcome,
}

impl FlashAttempt {
    fn first(max_attempts: u32) -> Self {
        Self {
            attempt_number: 1,
            max_attempts,
            outcome: FlashOutcome::Pending,
        }
    }

    fn next(&self) -> Self {
        Self {
            attempt_number: self.attempt_number + 1,
            max_attempts: self.max_attempts,
            outcome: FlashOutcome::Pending,
        }
    }

    fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_number)
    }
}

/// Drives an [`ImageWriter`] with bounded retry
#[derive(Clone)]
pub struct FlashOrchestrator {
    writer: Arc<dyn ImageWriter>,
}

impl FlashOrchestrator {
    pub fn new(writer: Arc<dyn ImageWriter>) -> Self {
        Self { writer }
    }

    /// Flash `image`, trying at most `max_attempts` times.
    ///
    /// On exhaustion the reservation is released and the last error returned.
    /// An interrupt returns at once and leaves the reservation to the caller.
    pub async fn flash(
        &self,
        reservation: &mut Reservation,
        image: &Path,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<FlashAttempt, LabError> {
        let mut attempt = FlashAttempt::first(max_attempts.max(1));

        loop {
            info!(
                "Flashing {}, attempt {} of {}.",
                reservation.device().name(),
                attempt.attempt_number,
                attempt.max_attempts
            );

            match self
                .writer
                .write_image(reservation.device_mut(), image, cancel)
                .await
            {
                Ok(()) => {
                    attempt.outcome = FlashOutcome::Success;
                    info!("Flashing successful.");
                    return Ok(attempt);
                }
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    attempt.outcome = FlashOutcome::Failed;
                    error!("{}: {}", e.kind(), e);

                    match attempt.remaining() {
                        0 => {
                            error!("Flashing failed {} times", attempt.attempt_number);
                            reservation.release();
                            return Err(e);
                        }
                        1 => warn!("Flashing failed, trying again one more time"),
                        n => warn!("Flashing failed, trying again {} more times", n),
                    }
                }
            }

            attempt = attempt.next();
        }
    }
}
