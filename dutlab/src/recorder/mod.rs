//! Background recorders owned by a session

pub mod serial;

pub use serial::SerialRecorder;
