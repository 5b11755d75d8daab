//! On-disk configuration: locations, settings and device catalogs

pub mod catalog;
pub mod inventory;
pub mod layout;
pub mod settings;
