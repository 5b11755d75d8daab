//! Flashing images onto reserved devices

pub mod image;
pub mod orchestrator;
pub mod usb_emulation;

pub use image::PcImageWriter;
pub use orchestrator::{FlashAttempt, FlashOrchestrator, FlashOutcome, ImageWriter};
pub use usb_emulation::UsbEmulation;
