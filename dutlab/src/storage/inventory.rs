//! Lab controllers known to the front end

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::errors::LabError;
use crate::filesys::file::File;

/// One lab controller and the DUT attached to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetMember {
    /// Unique identity, also the lock file name
    pub device: String,

    /// Identity without its trailing index, e.g. `pc` for `pc_2`
    pub device_type: String,

    /// Address of the lab controller
    pub controller_ip: String,

    pub settings: HashMap<String, String>,
}

impl FleetMember {
    /// True when `selector` names this member or its type, ignoring case
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.to_lowercase();
        self.device.to_lowercase() == selector || self.device_type.to_lowercase() == selector
    }
}

/// Strip the trailing index from a member identity
pub fn device_type_of(device: &str) -> String {
    device
        .trim_end_matches(|c: char| c.is_ascii_digit() || c == '_')
        .to_string()
}

pub async fn load_inventory(file: &File) -> Result<Vec<FleetMember>, LabError> {
    if !file.exists().await {
        return Err(LabError::ConfigError(format!(
            "Fleet inventory {} does not exist",
            file.path().display()
        )));
    }
    let sections: Map<String, Value> = file.read_json().await?;
    parse_inventory(&sections)
}

pub fn parse_inventory(sections: &Map<String, Value>) -> Result<Vec<FleetMember>, LabError> {
    let mut members = Vec::with_capacity(sections.len());

    for (device, section) in sections {
        let object = section.as_object().ok_or_else(|| {
            LabError::ConfigError(format!("Fleet entry {} is not an object", device))
        })?;

        let settings: HashMap<String, String> = object
            .iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k.to_lowercase(), s.clone())),
                Value::Number(n) => Some((k.to_lowercase(), n.to_string())),
                Value::Bool(b) => Some((k.to_lowercase(), b.to_string())),
                _ => None,
            })
            .collect();

        let controller_ip = settings
            .get("bb_ip")
            .or_else(|| settings.get("controller_ip"))
            .cloned()
            .ok_or_else(|| {
                LabError::ConfigError(format!("Fleet entry {} has no controller address", device))
            })?;

        members.push(FleetMember {
            device: device.clone(),
            device_type: device_type_of(device),
            controller_ip,
            settings,
        });
    }

    Ok(members)
}
