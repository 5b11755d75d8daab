//! Advisory, content-based fleet locks.
//!
//! One file per fleet member. Empty means free, the sentinel alone means
//! reserved, the sentinel followed by reason lines means blacklisted until
//! someone clears the file by hand. Every read-then-write happens under a
//! short `flock(2)` so two front ends cannot both see "free". That file
//! work runs on the blocking pool, never on a runtime worker.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::LabError;
use crate::pool::lock::{flock_exclusive, try_flock_exclusive, unlock};
use crate::storage::inventory::FleetMember;

/// Content of a reserved lock file
pub const RESERVED_SENTINEL: &str = "Locked\n";

/// Observed state of a fleet lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Reserved,
    Blacklisted(String),
}

impl LockState {
    pub fn parse(contents: &str) -> Self {
        if contents.is_empty() {
            LockState::Free
        } else if contents == RESERVED_SENTINEL {
            LockState::Reserved
        } else {
            let reason = contents
                .strip_prefix(RESERVED_SENTINEL)
                .unwrap_or(contents)
                .trim()
                .to_string();
            LockState::Blacklisted(reason)
        }
    }
}

/// Result of one reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Busy,
    Blacklisted(String),
}

/// Lock file of one fleet member
#[derive(Debug, Clone)]
pub struct FleetLock {
    path: PathBuf,
}

/// Lock file opened and flocked for one read-then-write
struct Critical {
    file: File,
}

impl Critical {
    fn contents(&mut self) -> Result<String, LabError> {
        let mut contents = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut contents)?;
        Ok(contents)
    }

    fn replace(&mut self, contents: &str) -> Result<(), LabError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(contents.as_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for Critical {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

impl FleetLock {
    pub fn new(lock_dir: &Path, device: &str) -> Self {
        Self {
            path: lock_dir.join(device),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, LabError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?)
    }

    fn enter(&self) -> Result<Critical, LabError> {
        let file = self.open()?;
        flock_exclusive(&file)?;
        Ok(Critical { file })
    }

    fn try_enter(&self) -> Result<Option<Critical>, LabError> {
        let file = self.open()?;
        if try_flock_exclusive(&file)? {
            Ok(Some(Critical { file }))
        } else {
            Ok(None)
        }
    }

    /// Current state; a missing file is free
    pub fn state(&self) -> Result<LockState, LabError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(LockState::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LockState::Free),
            Err(e) => Err(e.into()),
        }
    }

    async fn off_runtime<T, F>(&self, op: F) -> Result<T, LabError>
    where
        T: Send + 'static,
        F: FnOnce(&FleetLock) -> Result<T, LabError> + Send + 'static,
    {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || op(&lock))
            .await
            .map_err(|e| LabError::Internal(format!("fleet lock task failed: {e}")))?
    }

    /// Claim the lock if it is free. Contention counts as busy.
    pub async fn try_reserve(&self) -> Result<ReserveOutcome, LabError> {
        self.off_runtime(FleetLock::reserve_now).await
    }

    /// Clear a plain reservation. A blacklisted lock is left untouched.
    pub async fn release(&self) -> Result<(), LabError> {
        self.off_runtime(FleetLock::release_now).await
    }

    /// Append `reason`, keeping the sentinel in front of it
    pub async fn blacklist(&self, reason: &str) -> Result<(), LabError> {
        let reason = reason.to_string();
        self.off_runtime(move |lock| lock.blacklist_now(&reason)).await
    }

    fn reserve_now(&self) -> Result<ReserveOutcome, LabError> {
        let Some(mut critical) = self.try_enter()? else {
            return Ok(ReserveOutcome::Busy);
        };

        match LockState::parse(&critical.contents()?) {
            LockState::Free => {
                critical.replace(RESERVED_SENTINEL)?;
                Ok(ReserveOutcome::Reserved)
            }
            LockState::Reserved => Ok(ReserveOutcome::Busy),
            LockState::Blacklisted(reason) => Ok(ReserveOutcome::Blacklisted(reason)),
        }
    }

    fn release_now(&self) -> Result<(), LabError> {
        let mut critical = self.enter()?;
        match LockState::parse(&critical.contents()?) {
            LockState::Reserved => critical.replace(""),
            LockState::Free => Ok(()),
            LockState::Blacklisted(_) => {
                warn!("{} is blacklisted, leaving it locked", self.path.display());
                Ok(())
            }
        }
    }

    fn blacklist_now(&self, reason: &str) -> Result<(), LabError> {
        let mut critical = self.enter()?;
        let mut contents = critical.contents()?;
        if !contents.starts_with(RESERVED_SENTINEL) {
            contents = format!("{}{}", RESERVED_SENTINEL, contents);
        }
        contents.push_str(reason.trim_end());
        contents.push('\n');
        critical.replace(&contents)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Held,
    Released,
    Blacklisted,
}

/// A reserved fleet member. Dropping a held reservation releases it.
pub struct FleetReservation {
    member: FleetMember,
    lock: FleetLock,
    hold: Hold,
}

impl fmt::Debug for FleetReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetReservation")
            .field("device", &self.member.device)
            .field("hold", &self.hold)
            .finish()
    }
}

impl FleetReservation {
    pub(crate) fn new(member: FleetMember, lock: FleetLock) -> Self {
        Self {
            member,
            lock,
            hold: Hold::Held,
        }
    }

    pub fn member(&self) -> &FleetMember {
        &self.member
    }

    pub fn lock(&self) -> &FleetLock {
        &self.lock
    }

    pub fn is_held(&self) -> bool {
        self.hold == Hold::Held
    }

    /// Release the reservation. A no-op unless still held, so it can never
    /// clear a lock someone else has taken since.
    pub async fn release(&mut self) -> Result<(), LabError> {
        if self.hold != Hold::Held {
            return Ok(());
        }
        self.hold = Hold::Released;
        self.lock.release().await?;
        info!("Released {}", self.member.device);
        Ok(())
    }

    /// Mark the member unusable; the lock stays taken
    pub async fn blacklist(&mut self, reason: &str) -> Result<(), LabError> {
        if self.hold != Hold::Held {
            return Ok(());
        }
        self.hold = Hold::Blacklisted;
        self.lock.blacklist(reason).await?;
        warn!("Blacklisted {}: {}", self.member.device, reason);
        Ok(())
    }
}

impl Drop for FleetReservation {
    fn drop(&mut self) {
        if self.hold != Hold::Held {
            return;
        }
        self.hold = Hold::Released;

        let lock = self.lock.clone();
        let device = self.member.device.clone();
        let release = move || match lock.release_now() {
            Ok(()) => info!("Released {}", device),
            Err(e) => warn!("Could not release {}: {}", device, e),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}
