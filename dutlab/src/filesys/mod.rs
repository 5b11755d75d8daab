//! Thin async wrappers over files

pub mod file;
