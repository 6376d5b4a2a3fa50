//! Gateway to the Ironic bare-metal API.
//!
//! The gateway owns the API client and tracks whether the API is known to be
//! reachable. When a wait timeout is configured, the first caller polls the
//! API root and then the driver listing until a conductor is up; the outcome
//! sticks for the lifetime of the process.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use pnet_base::MacAddr;
use slog_scope::{debug, info, warn};

use crate::retry::Retry;

pub mod auth;
mod client;
mod node;

pub use self::client::{Access, IronicClient};
pub use self::node::Node;


/// Delay between readiness polls.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Source of node records for resolution.
pub trait NodeSource: Send + Sync {
    /// Every node known to the orchestration API.
    fn list_nodes(&self) -> Result<Vec<Node>>;

    /// The node owning the port with the given MAC address.
    fn node_by_port_address(&self, mac: &MacAddr) -> Result<Option<Node>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Readiness {
    Uninitialized,
    Ready,
    PermanentlyFailed,
}

#[derive(Debug)]
pub struct Gateway {
    client: IronicClient,
    /// Zero disables readiness polling.
    wait_timeout: Duration,
    poll_interval: Duration,
    state: Mutex<Readiness>,
}

impl Gateway {
    pub fn new(client: IronicClient, wait_timeout: Duration) -> Self {
        Gateway {
            client,
            wait_timeout,
            poll_interval: POLL_INTERVAL,
            state: Mutex::new(Readiness::Uninitialized),
        }
    }

    #[cfg(test)]
    fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Return a client for a reachable API, waiting for it if configured.
    ///
    /// Only one caller polls at a time; the others block on the state lock
    /// and then observe the outcome.
    pub fn acquire(&self) -> Result<&IronicClient> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("gateway state lock poisoned"))?;

        match *state {
            Readiness::Ready => return Ok(&self.client),
            Readiness::PermanentlyFailed => {
                bail!("could not contact Ironic API: timeout previously reached")
            }
            Readiness::Uninitialized if self.wait_timeout.is_zero() => {
                *state = Readiness::Ready;
                return Ok(&self.client);
            }
            Readiness::Uninitialized => {}
        }

        let deadline = Instant::now() + self.wait_timeout;
        match self.wait_until_ready(deadline) {
            Ok(()) => {
                info!("Ironic API is ready"; "endpoint" => self.client.endpoint());
                *state = Readiness::Ready;
                Ok(&self.client)
            }
            Err(e) => {
                *state = Readiness::PermanentlyFailed;
                Err(e.context("could not contact Ironic API"))
            }
        }
    }

    fn wait_until_ready(&self, deadline: Instant) -> Result<()> {
        let poll = Retry::new()
            .initial_backoff(self.poll_interval)
            .max_backoff(self.poll_interval)
            .until(deadline);

        info!("Waiting for Ironic API...");
        poll.clone()
            .retry(|attempt| {
                debug!("Waiting for API to become available (attempt #{})", attempt + 1);
                let status = self.client.probe(remaining(deadline)?)?;
                if status.is_success() {
                    Ok(())
                } else {
                    bail!("API root answered {}", status)
                }
            })
            .context("API never became available")?;

        info!("API successfully connected, waiting for conductor...");
        poll.retry(|attempt| {
            debug!("Waiting for conductor to become available (attempt #{})", attempt + 1);
            match self.client.count_drivers(remaining(deadline)?)? {
                0 => bail!("no drivers registered yet"),
                _ => Ok(()),
            }
        })
        .context("conductor never became available")
    }
}

/// Time left before the deadline, as a per-request timeout.
fn remaining(deadline: Instant) -> Result<Duration> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if !left.is_zero() => Ok(left),
        _ => bail!("deadline reached"),
    }
}

impl NodeSource for Gateway {
    fn list_nodes(&self) -> Result<Vec<Node>> {
        let client = self.acquire().context("failed to get Ironic client")?;
        client.list_nodes().context("failed to list nodes")
    }

    fn node_by_port_address(&self, mac: &MacAddr) -> Result<Option<Node>> {
        let client = self.acquire().context("failed to get Ironic client")?;
        let port = match client.port_by_address(mac)? {
            Some(port) => port,
            None => return Ok(None),
        };
        match port.node_uuid {
            Some(ref node) => client.get_node(node),
            None => {
                warn!("port {} ({}) is not attached to a node", port.uuid, port.address);
                Ok(None)
            }
        }
    }
}
