//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::LabError;

/// A file wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, LabError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, LabError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents).map_err(|e| {
            LabError::ConfigError(format!("Unable to parse {}: {}", self.path.display(), e))
        })?;
        Ok(value)
    }

    /// Read file as JSON, falling back to the default value when it is absent
    pub async fn read_json_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, LabError> {
        if !self.exists().await {
            return Ok(T::default());
        }
        self.read_json().await
    }

    /// Write string to file, replacing its contents
    pub async fn write_string(&self, contents: &str) -> Result<(), LabError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Write JSON to file
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), LabError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_string(&contents).await
    }

    /// Truncate the file to zero length, creating it if needed
    pub async fn clear(&self) -> Result<(), LabError> {
        self.write_string("").await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), LabError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rename the file, keeping it in the same directory
    pub async fn rename_to(&self, file_name: &str) -> Result<File, LabError> {
        let target = self.path.with_file_name(file_name);
        fs::rename(&self.path, &target).await?;
        Ok(File::new(target))
    }
}
