//! Ironic v1 REST client.

use std::time::Duration;

use anyhow::{Context, Result};
use pnet_base::MacAddr;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use slog_scope::{debug, warn};

use super::auth::{Credentials, Session};
use super::node::{DriverPage, Node, NodePage, Port, PortPage};
use crate::retry;

const API_VERSION_HEADER: &str = "x-openstack-ironic-api-version";
const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// How to reach the Ironic API.
#[derive(Clone, Debug)]
pub enum Access {
    /// Standalone Ironic, no authentication.
    Standalone { ironic_url: String },
    /// Keystone-authenticated Ironic, endpoint taken from the service catalog.
    Keystone(Credentials),
}

#[derive(Debug)]
pub struct IronicClient {
    /// Resource base, always ending with a slash (`http://host:6385/v1/`).
    endpoint: String,
    client: retry::Client,
    session: Option<Session>,
}

impl IronicClient {
    /// Build a client, authenticating first when credentials are given.
    pub fn connect(client: retry::Client, access: Access, api_version: &str) -> Result<Self> {
        let version = HeaderValue::from_str(api_version)
            .with_context(|| format!("invalid Ironic API version '{api_version}'"))?;
        let client = client
            .header(HeaderName::from_static(API_VERSION_HEADER), version)
            .return_on_404(true);

        let (endpoint, session) = match access {
            Access::Standalone { ironic_url } => {
                (format!("{}/v1/", ironic_url.trim_end_matches('/')), None)
            }
            Access::Keystone(credentials) => {
                let (session, endpoint) = Session::authenticate(&client, credentials)
                    .context("failed to authenticate with Keystone")?;
                (endpoint, Some(session))
            }
        };

        Ok(IronicClient {
            endpoint,
            client,
            session,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Plain GET on the API root, without authentication or retries.
    pub fn probe(&self, timeout: Duration) -> Result<StatusCode> {
        let root = self.endpoint.trim_end_matches('/').to_string();
        self.client.get(root).timeout(timeout).probe()
    }

    /// Number of drivers reported by the conductors, asked once.
    pub fn count_drivers(&self, timeout: Duration) -> Result<usize> {
        let url = format!("{}drivers", self.endpoint);
        let page: DriverPage = self
            .fetch_with(&url, |request| request.timeout(timeout).max_retries(0))?
            .context("driver listing not found")?;
        Ok(page.drivers.len())
    }

    /// All nodes with full details, following pagination.
    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut next = Some(format!("{}nodes/detail", self.endpoint));

        while let Some(url) = next.take() {
            let page: NodePage = self
                .fetch(&url)?
                .with_context(|| format!("node listing '{url}' not found"))?;
            debug!("fetched {} nodes from {}", page.nodes.len(), url);
            nodes.extend(page.nodes);
            next = page.next.filter(|n| !n.is_empty() && *n != url);
        }
        Ok(nodes)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        self.fetch(&format!("{}nodes/{}", self.endpoint, id))
            .with_context(|| format!("failed to get node {id}"))
    }

    /// The port with the given MAC address, if Ironic knows one.
    pub fn port_by_address(&self, mac: &MacAddr) -> Result<Option<Port>> {
        let url = format!("{}ports?address={}", self.endpoint, mac);
        let page: Option<PortPage> = self
            .fetch(&url)
            .with_context(|| format!("failed to look up port {mac}"))?;
        Ok(page.and_then(|p| p.ports.into_iter().next()))
    }

    /// GET a JSON resource, re-authenticating once on 401.
    fn fetch<T>(&self, url: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.fetch_with(url, |request| request)
    }

    fn fetch_with<T, F>(&self, url: &str, adjust: F) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        F: Fn(retry::RequestBuilder) -> retry::RequestBuilder,
    {
        match (self.fetch_once(url, &adjust), &self.session) {
            (Err(e), Some(session)) if retry::failed_status(&e) == Some(StatusCode::UNAUTHORIZED) => {
                warn!("Ironic rejected the token, re-authenticating");
                session.refresh(&self.client)?;
                self.fetch_once(url, &adjust)
            }
            (res, _) => res,
        }
    }

    fn fetch_once<T, F>(&self, url: &str, adjust: &F) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        F: Fn(retry::RequestBuilder) -> retry::RequestBuilder,
    {
        let mut request = adjust(self.client.get(url.to_string()));
        if let Some(session) = &self.session {
            let token = HeaderValue::from_str(&session.token()?).context("invalid auth token")?;
            request = request.header(HeaderName::from_static(AUTH_TOKEN_HEADER), token);
        }
        request.send()
    }
}
