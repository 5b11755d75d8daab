//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::file::File;

/// Locations of the lab-controller and front-end configuration files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Lab-controller configuration root
    pub lab_dir: PathBuf,

    /// Front-end (fleet) configuration root
    pub fleet_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(lab_dir: impl Into<PathBuf>, fleet_dir: impl Into<PathBuf>) -> Self {
        Self {
            lab_dir: lab_dir.into(),
            fleet_dir: fleet_dir.into(),
        }
    }

    /// Lab-controller settings
    pub fn settings_file(&self) -> File {
        File::new(self.lab_dir.join("aft.json"))
    }

    /// Platform-level device defaults
    pub fn platform_file(&self) -> File {
        File::new(self.lab_dir.join("devices").join("platform.json"))
    }

    /// Default device catalog, overridable from the command line
    pub fn catalog_file(&self) -> File {
        File::new(self.lab_dir.join("devices").join("catalog.json"))
    }

    /// Front-end settings
    pub fn fleet_settings_file(&self) -> File {
        File::new(self.fleet_dir.join("daft.json"))
    }

    /// Lab controllers known to the front end
    pub fn fleet_inventory_file(&self) -> File {
        File::new(self.fleet_dir.join("devices.json"))
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/etc/aft", "/etc/daft")
    }
}
