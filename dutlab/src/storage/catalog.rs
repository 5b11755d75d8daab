//! Device configurations merged from the platform and catalog files

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::errors::LabError;
use crate::filesys::file::File;

/// Immutable configuration of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub model: String,
    pub settings: HashMap<String, String>,
}

impl DeviceConfig {
    /// Look up an optional setting
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Look up a mandatory setting
    pub fn require(&self, key: &str) -> Result<&str, LabError> {
        self.get(key).ok_or_else(|| {
            LabError::ConfigError(format!("Device {} has no '{}' setting", self.name, key))
        })
    }

    /// True when `selector` names this device or its model, ignoring case
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.to_lowercase();
        self.name == selector || self.model == selector
    }
}

/// Load and merge the platform and catalog files
pub async fn load_device_configs(
    platform_file: &File,
    catalog_file: &File,
    serial_log_name: &str,
) -> Result<Vec<DeviceConfig>, LabError> {
    let platform: Map<String, Value> = platform_file.read_json_or_default().await?;
    let catalog: Map<String, Value> = catalog_file.read_json_or_default().await?;
    build_device_configs(&platform, &catalog, serial_log_name)
}

/// Merge catalog entries over their platform defaults, in catalog order.
pub fn build_device_configs(
    platform: &Map<String, Value>,
    catalog: &Map<String, Value>,
    serial_log_name: &str,
) -> Result<Vec<DeviceConfig>, LabError> {
    let mut configs = Vec::with_capacity(catalog.len());

    for (title, entry) in catalog {
        let catalog_entry = flatten_section(title, entry)?;

        let platform_name = catalog_entry.get("platform").ok_or_else(|| {
            LabError::ConfigError(format!("Catalog entry {} has no platform", title))
        })?;
        let platform_entry = match platform.get(platform_name) {
            Some(section) => flatten_section(platform_name, section)?,
            None => {
                return Err(LabError::ConfigError(format!(
                    "Catalog entry {} refers to unknown platform {}",
                    title, platform_name
                )))
            }
        };

        // Catalog values override platform values
        let mut settings = platform_entry;
        settings.extend(catalog_entry);

        let name = title.to_lowercase();
        let model = settings
            .get("model")
            .map(|m| m.to_lowercase())
            .unwrap_or_else(|| name.clone());

        settings.insert("name".to_string(), name.clone());
        settings.insert("model".to_string(), model.clone());
        settings
            .entry("serial_log_name".to_string())
            .or_insert_with(|| serial_log_name.to_string());

        configs.push(DeviceConfig {
            name,
            model,
            settings,
        });
    }

    if configs.is_empty() {
        return Err(LabError::ConfigError(
            "Zero device configurations built - check that the catalog and platform files \
             exist and contain settings"
                .to_string(),
        ));
    }

    info!("Built configuration sets for {} devices", configs.len());
    Ok(configs)
}

/// Turn a JSON section into string settings. Keys are lower-cased.
fn flatten_section(title: &str, section: &Value) -> Result<HashMap<String, String>, LabError> {
    let object = section.as_object().ok_or_else(|| {
        LabError::ConfigError(format!("Section {} is not an object", title))
    })?;

    let mut settings = HashMap::with_capacity(object.len());
    for (key, value) in object {
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            Value::Array(_) | Value::Object(_) => {
                return Err(LabError::ConfigError(format!(
                    "Setting {}.{} must be a scalar",
                    title, key
                )))
            }
            other => other.to_string(),
        };
        settings.insert(key.to_lowercase(), value);
    }
    Ok(settings)
}
