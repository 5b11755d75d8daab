//! Fleet tier: lab controllers reserved through advisory lock files

pub mod bridge;
pub mod lock;
pub mod networking;

pub use bridge::{FleetBridge, PreparedFlash, RemoteFlashRequest};
pub use lock::{FleetLock, FleetReservation, LockState, ReserveOutcome};
