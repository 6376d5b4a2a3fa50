use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use slog_scope::{debug, warn};

use super::configdrive::{ConfigDrive, ConfigDriveError};
use super::{Key, Link, MetaData, Network, NetworkData};
use crate::ironic::Node;

const FALLBACK_LINK: &str = "eth0";
const FALLBACK_NETWORK: &str = "network0";
const FALLBACK_MTU: u32 = 1500;

/// Network topology of a node, as served in `network_data.json`.
#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NetworkTopology {
    /// Network data from the config-drive, passed through untouched.
    Provided(Value),
    /// Placeholder for nodes without network data.
    Synthesized(NetworkData),
}

/// The config-drive of a node, when it has a readable one.
pub fn config_drive(node: &Node) -> Option<ConfigDrive> {
    match ConfigDrive::from_node(node) {
        Ok(cd) => Some(cd),
        Err(ConfigDriveError::Missing) => None,
        Err(e @ ConfigDriveError::Malformed(_)) => {
            warn!("ignoring config-drive of node {}: {}", node.uuid, e);
            None
        }
        Err(e) => {
            debug!("ignoring config-drive of node {}: {}", node.uuid, e);
            None
        }
    }
}

fn string_entries(map: &Map<String, Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

/// Build `meta_data.json` for a node.
pub fn build_instance_metadata(node: &Node) -> MetaData {
    let mut md = MetaData {
        uuid: node.uuid.clone(),
        name: node.name.clone(),
        hostname: node.hostname().to_string(),
        launch_index: 0,
        project_id: node.owner.clone().filter(|o| !o.is_empty()),
        creation_time: node.created_at.clone(),
        ..Default::default()
    };

    match config_drive(node) {
        Some(cd) => {
            if let Some(meta) = &cd.meta_data {
                md.instance_type = meta.instance_type.clone();
                if let Some(hostname) = meta.hostname.as_ref().filter(|h| !h.is_empty()) {
                    md.hostname = hostname.clone();
                }
                if let Some(az) = meta.availability_zone.as_ref().filter(|az| !az.is_empty()) {
                    md.availability_zone = Some(az.clone());
                }
            }
            if let Some(keys) = cd.public_keys() {
                md.public_keys = keys.clone();
            }
        }
        None => {
            if let Some(Value::Object(keys)) = node.instance_info.get("public_keys") {
                md.public_keys = string_entries(keys);
            }
            md.meta = string_entries(&node.properties);
        }
    }

    md.keys = md
        .public_keys
        .iter()
        .map(|(name, data)| Key {
            name: name.clone(),
            key_type: "ssh".to_string(),
            data: data.clone(),
        })
        .collect();
    md
}

/// Build `network_data.json` for a node.
pub fn build_network_topology(node: &Node) -> NetworkTopology {
    if let Some(network_data) = config_drive(node)
        .and_then(|cd| cd.network_data)
        .filter(|v| !v.is_null())
    {
        return NetworkTopology::Provided(network_data);
    }

    NetworkTopology::Synthesized(NetworkData {
        links: vec![Link {
            id: FALLBACK_LINK.to_string(),
            link_type: "physical".to_string(),
            ethernet_mac_address: None,
            mtu: Some(FALLBACK_MTU),
        }],
        networks: vec![Network {
            id: FALLBACK_NETWORK.to_string(),
            network_type: "ipv4".to_string(),
            link: FALLBACK_LINK.to_string(),
            ..Default::default()
        }],
        services: vec![],
    })
}

/// User data of a node; empty when there is none.
pub fn build_user_data(node: &Node) -> String {
    if let Some(user_data) = config_drive(node)
        .and_then(|cd| cd.user_data_text())
        .filter(|u| !u.is_empty())
    {
        return user_data;
    }
    node.instance_info_str("user_data")
        .unwrap_or_default()
        .to_string()
}

/// EC2 `meta-data` listing of a node.
pub fn build_ec2_metadata(node: &Node, client_ip: &str) -> String {
    [
        format!("instance-id\n{}", node.uuid),
        format!("hostname\n{}", node.hostname()),
        format!("local-ipv4\n{}", client_ip),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::configdrive::CONFIG_DRIVE_KEY;
    use maplit::btreemap;
    use serde_json::json;

    fn node() -> Node {
        serde_json::from_value(json!({
            "uuid": "1be26c0b-03f2-4d2e-ae87-c02d7f33c123",
            "name": "compute-1",
            "owner": "f3b6c2a4d1e54a8c9b0e7d6c5a4b3c2d",
            "created_at": "2025-06-24T21:24:08+00:00",
            "properties": {"memory_mb": "8192", "cpus": "4", "local_gb": 100},
            "instance_info": {
                "public_keys": {"default": "ssh-ed25519 AAAAC3 admin@example", "bad": 1},
                "user_data": "#!/bin/sh\necho dynamic\n"
            }
        }))
        .unwrap()
    }

    fn with_config_drive(mut node: Node, configdrive: Value) -> Node {
        node.instance_info
            .insert(CONFIG_DRIVE_KEY.to_string(), configdrive);
        node
    }

    #[test]
    fn test_instance_metadata_dynamic() {
        let md = build_instance_metadata(&node());

        assert_eq!(md.uuid, "1be26c0b-03f2-4d2e-ae87-c02d7f33c123");
        assert_eq!(md.hostname, "compute-1");
        assert_eq!(md.launch_index, 0);
        assert_eq!(
            md.project_id.as_deref(),
            Some("f3b6c2a4d1e54a8c9b0e7d6c5a4b3c2d")
        );
        assert_eq!(
            md.meta,
            btreemap! {
                "memory_mb".to_string() => "8192".to_string(),
                "cpus".to_string() => "4".to_string(),
            }
        );
        assert_eq!(
            md.public_keys,
            btreemap! {
                "default".to_string() => "ssh-ed25519 AAAAC3 admin@example".to_string(),
            }
        );
        assert_eq!(
            md.keys,
            vec![Key {
                name: "default".to_string(),
                key_type: "ssh".to_string(),
                data: "ssh-ed25519 AAAAC3 admin@example".to_string(),
            }]
        );
    }

    #[test]
    fn test_instance_metadata_config_drive() {
        let node = with_config_drive(
            node(),
            json!({
                "meta_data": {
                    "hostname": "provisioned.example.com",
                    "instance_type": "baremetal.large",
                    "availability_zone": "rack-3",
                    "public_keys": {"ops": "ssh-rsa AAAAB3 ops@example"}
                }
            }),
        );
        let md = build_instance_metadata(&node);

        assert_eq!(md.hostname, "provisioned.example.com");
        assert_eq!(md.instance_type.as_deref(), Some("baremetal.large"));
        assert_eq!(md.availability_zone.as_deref(), Some("rack-3"));
        assert_eq!(
            md.public_keys,
            btreemap! {
                "ops".to_string() => "ssh-rsa AAAAB3 ops@example".to_string(),
            }
        );
        // Dynamic fields are not merged in.
        assert!(md.meta.is_empty());
        assert_eq!(md.keys.len(), 1);
    }

    #[test]
    fn test_instance_metadata_config_drive_without_keys() {
        let node = with_config_drive(node(), json!({"meta_data": {"hostname": ""}}));
        let md = build_instance_metadata(&node);

        assert_eq!(md.hostname, "compute-1");
        assert!(md.public_keys.is_empty());
        assert!(md.keys.is_empty());
    }

    #[test]
    fn test_instance_metadata_unreadable_config_drive() {
        let node = with_config_drive(node(), json!("H4sICDq6qmgAA2NvbmZpZy1kcml2ZQ=="));
        assert_eq!(build_instance_metadata(&node), build_instance_metadata(&self::node()));
    }

    #[test]
    fn test_network_topology_fallback() {
        let topology = build_network_topology(&node());
        let data = match topology {
            NetworkTopology::Synthesized(data) => data,
            other => panic!("unexpected topology {other:?}"),
        };
        assert_eq!(data.links.len(), 1);
        assert_eq!(data.links[0].id, "eth0");
        assert_eq!(data.links[0].link_type, "physical");
        assert_eq!(data.links[0].mtu, Some(1500));
        assert_eq!(data.networks.len(), 1);
        assert_eq!(data.networks[0].id, "network0");
        assert_eq!(data.networks[0].network_type, "ipv4");
        assert_eq!(data.networks[0].link, "eth0");
        assert!(data.services.is_empty());

        let node = with_config_drive(node(), json!({"user_data": "x"}));
        assert!(matches!(
            build_network_topology(&node),
            NetworkTopology::Synthesized(_)
        ));
    }

    #[test]
    fn test_network_topology_passthrough() {
        let network_data = json!({
            "links": [{"id": "enp1s0", "type": "phy", "vif_id": "custom"}],
            "networks": [],
            "services": [{"type": "dns", "address": "8.8.8.8"}]
        });
        let node = with_config_drive(node(), json!({"network_data": network_data.clone()}));
        let topology = build_network_topology(&node);

        assert_eq!(topology, NetworkTopology::Provided(network_data.clone()));
        assert_eq!(serde_json::to_value(&topology).unwrap(), network_data);
    }

    #[test]
    fn test_user_data() {
        assert_eq!(build_user_data(&node()), "#!/bin/sh\necho dynamic\n");

        let node = with_config_drive(self::node(), json!({"user_data": "#cloud-config\n"}));
        assert_eq!(build_user_data(&node), "#cloud-config\n");

        let node = with_config_drive(self::node(), json!({"user_data": ""}));
        assert_eq!(build_user_data(&node), "#!/bin/sh\necho dynamic\n");

        let mut node = self::node();
        node.instance_info
            .insert("user_data".to_string(), json!({"not": "text"}));
        assert_eq!(build_user_data(&node), "");
        assert_eq!(build_user_data(&Node::default()), "");
    }

    #[test]
    fn test_ec2_metadata() {
        assert_eq!(
            build_ec2_metadata(&node(), "10.1.105.195"),
            "instance-id\n1be26c0b-03f2-4d2e-ae87-c02d7f33c123\nhostname\ncompute-1\nlocal-ipv4\n10.1.105.195"
        );
    }
}
