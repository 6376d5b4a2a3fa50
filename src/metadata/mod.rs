//! OpenStack and EC2 metadata documents served to nodes.
//!
//! Documents are built from a node record on every request, serialized and
//! dropped. When a node carries a config-drive, its content takes precedence
//! over fields derived from the node itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod configdrive;
mod render;

pub use self::render::*;

/// API versions listed under `/openstack`.
pub const OPENSTACK_VERSIONS: &[&str] = &["latest"];

/// Documents listed under `/openstack/latest`.
pub const OPENSTACK_DOCUMENTS: &[&str] = &[
    "meta_data.json",
    "network_data.json",
    "user_data",
    "vendor_data.json",
    "vendor_data2.json",
];

/// EC2 API versions, as listed under `/`.
pub const EC2_VERSIONS: &[&str] = &["latest"];

/// EC2 endpoints, as listed under `/latest`.
pub const EC2_ENDPOINTS: &[&str] = &["meta-data/", "user-data"];

/// Instance metadata, served as `meta_data.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetaData {
    pub uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    pub hostname: String,
    /// Always 0, nodes are never part of a multi-instance launch.
    pub launch_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
    pub public_keys: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<Key>,
    pub meta: BTreeMap<String, String>,
}

/// SSH key entry of `meta_data.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Key {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub data: String,
}

/// OpenStack network metadata format for `network_data.json`
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NetworkData {
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// Network link (interface definition)
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Link {
    #[serde(default)]
    pub id: String,
    /// "phy", "vif", "bond" or "vlan"
    #[serde(rename = "type", default)]
    pub link_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethernet_mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// IP configuration of a link
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Network {
    #[serde(default)]
    pub id: String,
    /// "ipv4", "ipv6", "ipv4_dhcp", ...
    #[serde(rename = "type", default)]
    pub network_type: String,
    /// Id of the link this network applies to
    #[serde(default)]
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_nameservers: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Route {
    pub network: String,
    pub netmask: String,
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

/// Network service, such as a DNS server
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Service {
    #[serde(rename = "type")]
    pub service_type: String,
    pub address: String,
}

/// `vendor_data.json`, identical for every node.
pub fn vendor_data() -> Value {
    json!({"ironic": {"version": "1.0"}})
}

/// `vendor_data2.json`, identical for every node.
pub fn vendor_data2() -> Value {
    json!({"static": {"ironic-metadata": {"version": "1.0"}}})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_data_parse() {
        let data: NetworkData = serde_json::from_value(json!({
            "links": [{"id": "enp1s0", "type": "phy", "ethernet_mac_address": "9c:6b:00:70:59:8b", "mtu": 9000}],
            "networks": [{
                "id": "provisioning",
                "type": "ipv4",
                "link": "enp1s0",
                "ip_address": "10.1.105.195",
                "netmask": "255.255.255.0",
                "routes": [{"network": "0.0.0.0", "netmask": "0.0.0.0", "gateway": "10.1.105.1"}]
            }],
            "services": [{"type": "dns", "address": "10.1.105.1"}]
        }))
        .unwrap();

        assert_eq!(data.links[0].mtu, Some(9000));
        assert_eq!(data.networks[0].routes[0].gateway, "10.1.105.1");
        assert_eq!(data.services[0].service_type, "dns");
    }

    #[test]
    fn test_metadata_omits_empty_fields() {
        let md = MetaData {
            uuid: "node-1".to_string(),
            hostname: "node-1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(md).unwrap(),
            json!({
                "uuid": "node-1",
                "hostname": "node-1",
                "launch_index": 0,
                "public_keys": {},
                "meta": {}
            })
        );
    }
}
