//! Client IP to node resolution.
//!
//! Every lookup fetches the full node listing and applies an ordered list of
//! match strategies, structured data first and free-text heuristics last.
//! Strategies form the outer loop, so a structured match on any node beats
//! a name match on an earlier one. When nothing matches and a DHCP lease
//! file is configured, the MAC leased to the client is looked up among the
//! Ironic ports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde_json::Value;
use slog_scope::{debug, info, warn};

use crate::ironic::{Node, NodeSource};
use crate::metadata::configdrive::ConfigDrive;
use crate::util;

/// A way of recognizing the node behind a client IP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchStrategy {
    /// An address of the config-drive network data.
    ConfigDriveNetwork,
    /// `instance_info.fixed_ips[].ip_address`.
    FixedIps,
    /// The deploy ramdisk address or its `ipa-api-url`.
    DeployRamdisk,
    /// The node name contains the IP. Only useful for testing.
    NodeName,
}

impl MatchStrategy {
    /// Strategies in the order they are tried.
    pub const ORDERED: [MatchStrategy; 4] = [
        MatchStrategy::ConfigDriveNetwork,
        MatchStrategy::FixedIps,
        MatchStrategy::DeployRamdisk,
        MatchStrategy::NodeName,
    ];

    pub fn matches(self, node: &Node, ip: &str) -> bool {
        match self {
            MatchStrategy::ConfigDriveNetwork => match ConfigDrive::from_node(node) {
                Ok(cd) => cd.network_addresses().iter().any(|addr| addr == ip),
                Err(_) => false,
            },
            MatchStrategy::FixedIps => match node.instance_info.get("fixed_ips") {
                Some(Value::Array(fixed_ips)) => fixed_ips
                    .iter()
                    .any(|f| f.get("ip_address").and_then(Value::as_str) == Some(ip)),
                _ => false,
            },
            MatchStrategy::DeployRamdisk => deploy_ramdisk_matches(node, ip),
            MatchStrategy::NodeName => node.name.contains(ip),
        }
    }
}

fn deploy_ramdisk_matches(node: &Node, ip: &str) -> bool {
    let info = &node.driver_info;
    if info.get("deploy_ramdisk_address").and_then(Value::as_str) == Some(ip) {
        return true;
    }

    let api_url = match info
        .get("deploy_ramdisk_options")
        .and_then(|opts| opts.get("ipa-api-url"))
        .and_then(Value::as_str)
    {
        Some(url) => url,
        None => return false,
    };
    match Url::parse(api_url) {
        Ok(url) => {
            url.host_str()
                .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
                == Some(ip)
        }
        Err(_) => api_url.contains(ip),
    }
}

/// Find the node behind `ip` and the strategy that recognized it.
pub fn find_node<'a>(nodes: &'a [Node], ip: &str) -> Option<(&'a Node, MatchStrategy)> {
    MatchStrategy::ORDERED.iter().find_map(|strategy| {
        nodes
            .iter()
            .find(|node| strategy.matches(node, ip))
            .map(|node| (node, *strategy))
    })
}

pub struct Resolver {
    source: Arc<dyn NodeSource>,
    lease_file: Option<PathBuf>,
}

impl Resolver {
    pub fn new(source: Arc<dyn NodeSource>) -> Self {
        Resolver {
            source,
            lease_file: None,
        }
    }

    /// Fall back to the DHCP leases in `path` when no strategy matches.
    pub fn lease_file(mut self, path: Option<PathBuf>) -> Self {
        self.lease_file = path;
        self
    }

    pub fn resolve(&self, ip: &str) -> Result<Node> {
        if ip.is_empty() {
            bail!("no client IP to resolve");
        }

        let nodes = self
            .source
            .list_nodes()
            .with_context(|| format!("failed to look up node for IP {ip}"))?;
        if let Some((node, strategy)) = find_node(&nodes, ip) {
            debug!("resolved node";
                "client_ip" => ip,
                "node" => &node.uuid,
                "strategy" => ?strategy);
            return Ok(node.clone());
        }

        if let Some(path) = &self.lease_file {
            match self.resolve_by_lease(path, ip) {
                Ok(Some(node)) => {
                    info!("resolved node from DHCP lease";
                        "client_ip" => ip,
                        "node" => &node.uuid);
                    return Ok(node);
                }
                Ok(None) => {}
                Err(e) => warn!("DHCP lease lookup failed for {}: {:#}", ip, e),
            }
        }

        bail!("no node found for IP {}", ip)
    }

    fn resolve_by_lease(&self, path: &Path, ip: &str) -> Result<Option<Node>> {
        let mac = util::lease_file_mac(path, ip)?;
        self.source
            .node_by_port_address(&mac)
            .with_context(|| format!("failed to look up port {mac}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::configdrive::CONFIG_DRIVE_KEY;
    use pnet_base::MacAddr;
    use serde_json::json;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubSource {
        nodes: Vec<Node>,
        by_mac: Vec<(MacAddr, Node)>,
        listings: AtomicUsize,
    }

    impl NodeSource for StubSource {
        fn list_nodes(&self) -> Result<Vec<Node>> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            Ok(self.nodes.clone())
        }

        fn node_by_port_address(&self, mac: &MacAddr) -> Result<Option<Node>> {
            Ok(self
                .by_mac
                .iter()
                .find(|(m, _)| m == mac)
                .map(|(_, n)| n.clone()))
        }
    }

    fn node(uuid: &str, name: &str) -> Node {
        Node {
            uuid: uuid.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn with_instance_info(mut node: Node, key: &str, value: Value) -> Node {
        node.instance_info.insert(key.to_string(), value);
        node
    }

    fn with_driver_info(mut node: Node, key: &str, value: Value) -> Node {
        node.driver_info.insert(key.to_string(), value);
        node
    }

    fn config_drive_node(uuid: &str, ip: &str) -> Node {
        with_instance_info(
            node(uuid, ""),
            CONFIG_DRIVE_KEY,
            json!({
                "network_data": {
                    "links": [{"id": "enp1s0", "type": "phy"}],
                    "networks": [{"id": "net0", "type": "ipv4", "link": "enp1s0", "ip_address": ip}]
                }
            }),
        )
    }

    fn stub_resolver(nodes: Vec<Node>) -> (Arc<StubSource>, Resolver) {
        let source = Arc::new(StubSource {
            nodes,
            ..Default::default()
        });
        (source.clone(), Resolver::new(source))
    }

    #[test]
    fn test_strategies() {
        let ip = "10.1.105.195";

        let n = config_drive_node("a", ip);
        assert!(MatchStrategy::ConfigDriveNetwork.matches(&n, ip));
        assert!(!MatchStrategy::ConfigDriveNetwork.matches(&n, "10.1.105.19"));

        let n = config_drive_node("a", "10.1.105.195/24");
        assert!(MatchStrategy::ConfigDriveNetwork.matches(&n, ip));

        let n = with_instance_info(
            node("b", ""),
            "fixed_ips",
            json!([{"ip_address": "10.0.0.1"}, {"ip_address": ip, "subnet_id": "s"}]),
        );
        assert!(MatchStrategy::FixedIps.matches(&n, ip));
        assert!(!MatchStrategy::FixedIps.matches(&n, "10.0.0.2"));

        let n = with_driver_info(node("c", ""), "deploy_ramdisk_address", json!(ip));
        assert!(MatchStrategy::DeployRamdisk.matches(&n, ip));

        let n = with_driver_info(
            node("d", ""),
            "deploy_ramdisk_options",
            json!({"ipa-api-url": format!("http://{ip}:6385")}),
        );
        assert!(MatchStrategy::DeployRamdisk.matches(&n, ip));
        assert!(!MatchStrategy::DeployRamdisk.matches(&n, "10.1.105.19"));

        let n = with_driver_info(
            node("e", ""),
            "deploy_ramdisk_options",
            json!({"ipa-api-url": format!("{ip}:6385")}),
        );
        assert!(MatchStrategy::DeployRamdisk.matches(&n, ip));

        let n = node("f", &format!("test-node-{ip}"));
        assert!(MatchStrategy::NodeName.matches(&n, ip));
        assert!(!MatchStrategy::FixedIps.matches(&n, ip));
    }

    #[test]
    fn test_structured_beats_name() {
        let ip = "10.1.105.195";
        let nodes = vec![
            node("by-name", &format!("node-{ip}")),
            with_instance_info(node("by-fixed-ip", ""), "fixed_ips", json!([{"ip_address": ip}])),
            config_drive_node("by-config-drive", ip),
        ];

        let (found, strategy) = find_node(&nodes, ip).unwrap();
        assert_eq!(found.uuid, "by-config-drive");
        assert_eq!(strategy, MatchStrategy::ConfigDriveNetwork);

        let (found, strategy) = find_node(&nodes[..2], ip).unwrap();
        assert_eq!(found.uuid, "by-fixed-ip");
        assert_eq!(strategy, MatchStrategy::FixedIps);

        let (found, _) = find_node(&nodes[..1], ip).unwrap();
        assert_eq!(found.uuid, "by-name");
    }

    #[test]
    fn test_first_match_wins() {
        let ip = "10.1.105.195";
        let nodes = vec![config_drive_node("first", ip), config_drive_node("second", ip)];
        assert_eq!(find_node(&nodes, ip).unwrap().0.uuid, "first");
    }

    #[test]
    fn test_resolve_idempotent() {
        let ip = "10.1.105.195";
        let (source, resolver) = stub_resolver(vec![
            node("other", "compute-2"),
            config_drive_node("target", ip),
        ]);

        let first = resolver.resolve(ip).unwrap();
        let second = resolver.resolve(ip).unwrap();
        assert_eq!(first.uuid, "target");
        assert_eq!(first, second);
        // No caching: every lookup lists again.
        assert_eq!(source.listings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resolve_no_match() {
        let (_, resolver) = stub_resolver(vec![]);
        let err = resolver.resolve("10.1.105.195").unwrap_err();
        assert!(err.to_string().contains("no node found for IP 10.1.105.195"));

        let (_, resolver) = stub_resolver(vec![node("a", "compute-1")]);
        resolver.resolve("10.1.105.195").unwrap_err();
        resolver.resolve("").unwrap_err();
    }

    #[test]
    fn test_resolve_dhcp_lease() {
        let mut leases = tempfile::NamedTempFile::new().unwrap();
        writeln!(leases, "1750802648 9c:6b:00:70:59:8b 10.1.105.195 * *").unwrap();
        let mac: MacAddr = "9c:6b:00:70:59:8b".parse().unwrap();

        let source = Arc::new(StubSource {
            nodes: vec![node("a", "compute-1")],
            by_mac: vec![(mac, node("leased", "compute-2"))],
            ..Default::default()
        });
        let resolver =
            Resolver::new(source.clone()).lease_file(Some(leases.path().to_path_buf()));

        assert_eq!(resolver.resolve("10.1.105.195").unwrap().uuid, "leased");
        resolver.resolve("10.1.105.196").unwrap_err();

        // Structured matches are preferred over leases.
        let source = Arc::new(StubSource {
            nodes: vec![config_drive_node("structured", "10.1.105.195")],
            by_mac: vec![(mac, node("leased", "compute-2"))],
            ..Default::default()
        });
        let resolver = Resolver::new(source).lease_file(Some(leases.path().to_path_buf()));
        assert_eq!(resolver.resolve("10.1.105.195").unwrap().uuid, "structured");
    }
}
