//! Ironic API resources, as returned by the v1 REST API.
//!
//! Reference: https://docs.openstack.org/api-ref/baremetal/

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Ironic occasionally reports `null` for fields that are semantically empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A bare-metal node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Node {
    pub uuid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Owning project.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Hardware properties (`cpus`, `memory_mb`, ...).
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub driver_info: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub instance_info: Map<String, Value>,
}

impl Node {
    /// Hostname to advertise: the node name, else its UUID.
    pub fn hostname(&self) -> &str {
        if self.name.is_empty() {
            &self.uuid
        } else {
            &self.name
        }
    }

    /// A string-valued `instance_info` field.
    pub fn instance_info_str(&self, key: &str) -> Option<&str> {
        self.instance_info.get(key).and_then(Value::as_str)
    }
}

/// One page of a node listing.
#[derive(Debug, Deserialize)]
pub(crate) struct NodePage {
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Absolute URL of the following page, if any.
    #[serde(default)]
    pub next: Option<String>,
}

/// A network port attached to a node.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Port {
    pub uuid: String,
    /// MAC address.
    pub address: String,
    #[serde(default)]
    pub node_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PortPage {
    #[serde(default)]
    pub ports: Vec<Port>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DriverPage {
    #[serde(default)]
    pub drivers: Vec<Value>,
}
