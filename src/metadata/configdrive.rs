//! Config-drive payloads embedded in a node's `instance_info`.
//!
//! Ironic accepts a config-drive either as a JSON document (given as an
//! object or as a JSON string) or as a gzipped, base64-encoded ISO image
//! (or a URL to one). Only the JSON forms can be read here.
//!
//! reference: https://docs.openstack.org/ironic/latest/install/configdrive.html

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::ironic::Node;

/// `instance_info` key holding the config-drive.
pub const CONFIG_DRIVE_KEY: &str = "configdrive";

#[derive(Debug, thiserror::Error)]
pub enum ConfigDriveError {
    #[error("node has no config-drive")]
    Missing,
    #[error("config-drive images are not supported")]
    UnsupportedImage,
    #[error("unsupported config-drive value of type {0}")]
    UnsupportedValue(&'static str),
    #[error("malformed config-drive")]
    Malformed(#[source] serde_json::Error),
}

/// The shape a config-drive value was given in.
#[derive(Debug, PartialEq)]
pub enum ConfigDriveSource<'a> {
    /// A JSON document serialized as a string.
    RawString(&'a str),
    /// A JSON object.
    StructuredObject(&'a Map<String, Value>),
    /// An ISO image, inline or by URL.
    UnsupportedImage,
}

impl<'a> ConfigDriveSource<'a> {
    pub fn classify(value: &'a Value) -> Result<Self, ConfigDriveError> {
        match value {
            Value::Null => Err(ConfigDriveError::Missing),
            Value::String(s) if s.trim().is_empty() => Err(ConfigDriveError::Missing),
            Value::String(s) if s.trim_start().starts_with('{') => Ok(Self::RawString(s)),
            Value::String(_) => Ok(Self::UnsupportedImage),
            Value::Object(map) => Ok(Self::StructuredObject(map)),
            Value::Bool(_) => Err(ConfigDriveError::UnsupportedValue("bool")),
            Value::Number(_) => Err(ConfigDriveError::UnsupportedValue("number")),
            Value::Array(_) => Err(ConfigDriveError::UnsupportedValue("array")),
        }
    }
}

/// Partial object for the config-drive `meta_data`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ConfigDriveMetaData {
    #[serde(default, alias = "instance-type")]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub public_keys: Option<BTreeMap<String, String>>,
}

/// A parsed config-drive document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ConfigDrive {
    #[serde(default)]
    pub meta_data: Option<ConfigDriveMetaData>,
    /// Usually a string; cloud-config given as an object is kept as JSON.
    #[serde(default)]
    pub user_data: Option<Value>,
    /// Kept verbatim, it is served as-is.
    #[serde(default)]
    pub network_data: Option<Value>,
    #[serde(default)]
    pub public_keys: Option<BTreeMap<String, String>>,
}

impl ConfigDrive {
    /// Parse the config-drive of a node.
    pub fn from_node(node: &Node) -> Result<Self, ConfigDriveError> {
        let value = node
            .instance_info
            .get(CONFIG_DRIVE_KEY)
            .ok_or(ConfigDriveError::Missing)?;
        Self::parse(ConfigDriveSource::classify(value)?)
    }

    pub fn parse(source: ConfigDriveSource<'_>) -> Result<Self, ConfigDriveError> {
        match source {
            ConfigDriveSource::RawString(s) => {
                serde_json::from_str(s).map_err(ConfigDriveError::Malformed)
            }
            // Normalize loosely-typed input through a full round-trip.
            ConfigDriveSource::StructuredObject(map) => {
                serde_json::from_value(Value::Object(map.clone()))
                    .map_err(ConfigDriveError::Malformed)
            }
            ConfigDriveSource::UnsupportedImage => Err(ConfigDriveError::UnsupportedImage),
        }
    }

    /// User data as text, if any.
    pub fn user_data_text(&self) -> Option<String> {
        match self.user_data.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Non-empty public keys, preferring those inside `meta_data`.
    pub fn public_keys(&self) -> Option<&BTreeMap<String, String>> {
        self.meta_data
            .as_ref()
            .and_then(|m| m.public_keys.as_ref())
            .filter(|keys| !keys.is_empty())
            .or_else(|| self.public_keys.as_ref().filter(|keys| !keys.is_empty()))
    }

    /// IP addresses assigned by the config-drive network data.
    ///
    /// Only `networks[].ip_address` is read, the rest of the document may be
    /// in any shape.
    pub fn network_addresses(&self) -> Vec<String> {
        let networks = self
            .network_data
            .as_ref()
            .and_then(|data| data.get("networks"))
            .and_then(Value::as_array);
        networks
            .into_iter()
            .flatten()
            .filter_map(|network| network.get("ip_address")?.as_str())
            .map(|ip| match ip.split_once('/') {
                Some((addr, _prefix)) => addr,
                None => ip,
            })
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .collect()
    }
}
