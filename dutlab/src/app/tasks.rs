//! Auxiliary tasks owned by one orchestration session

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::LabError;

/// Default bound on joining each task at teardown
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct NamedTask {
    name: String,
    handle: JoinHandle<Result<(), LabError>>,
}

/// Tasks spawned by a session. They observe a child of the session token,
/// so stopping them never cancels the session itself.
pub struct SessionTasks {
    stop: CancellationToken,
    join_timeout: Duration,
    tasks: Vec<NamedTask>,
}

impl SessionTasks {
    pub fn new(session: &CancellationToken, join_timeout: Duration) -> Self {
        Self {
            stop: session.child_token(),
            join_timeout,
            tasks: Vec::new(),
        }
    }

    /// Token new tasks should poll
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn push(&mut self, name: impl Into<String>, handle: JoinHandle<Result<(), LabError>>) {
        self.tasks.push(NamedTask {
            name: name.into(),
            handle,
        });
    }

    /// Signal every task and join each one within the join timeout.
    /// A task that overruns is aborted. Task failures are logged only.
    pub async fn shutdown(&mut self) {
        self.stop.cancel();

        for task in self.tasks.drain(..) {
            let NamedTask { name, mut handle } = task;
            match tokio::time::timeout(self.join_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => info!("{} stopped", name),
                Ok(Ok(Err(e))) => warn!("{} ended with an error: {}", name, e),
                Ok(Err(e)) => error!("{} panicked: {}", name, e),
                Err(_) => {
                    error!("{} did not stop within {:?}, aborting", name, self.join_timeout);
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        self.stop.cancel();
        for task in &self.tasks {
            task.handle.abort();
        }
    }
}
