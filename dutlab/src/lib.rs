//! dutlab library
//!
//! Reservation, boot-mode control and flashing of devices under test,
//! locally on a lab controller or through a fleet of them.

pub mod app;
pub mod device;
pub mod errors;
pub mod exec;
pub mod filesys;
pub mod flash;
pub mod fleet;
pub mod hardware;
pub mod logs;
pub mod pool;
pub mod recorder;
pub mod storage;
pub mod testplan;
pub mod utils;
