//! Lab hardware: GPIO, power cutters and keyboard emulators

pub mod cutter;
pub mod gpio;
pub mod keyboard;
