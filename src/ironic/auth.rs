//! Keystone v3 password authentication.
//!
//! Reference: https://docs.openstack.org/api-ref/identity/v3/

use std::sync::RwLock;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog_scope::{debug, info};

use crate::retry;

const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";
const BAREMETAL_SERVICE: &str = "baremetal";

/// Credentials for a project-scoped token.
#[derive(Clone)]
pub struct Credentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub domain_name: String,
    pub region: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("project_name", &self.project_name)
            .field("domain_name", &self.domain_name)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    auth: Auth<'a>,
}

#[derive(Serialize)]
struct Auth<'a> {
    identity: Identity<'a>,
    scope: Scope<'a>,
}

#[derive(Serialize)]
struct Identity<'a> {
    methods: [&'static str; 1],
    password: Password<'a>,
}

#[derive(Serialize)]
struct Password<'a> {
    user: User<'a>,
}

#[derive(Serialize)]
struct User<'a> {
    name: &'a str,
    domain: Domain<'a>,
    password: &'a str,
}

#[derive(Serialize)]
struct Scope<'a> {
    project: Project<'a>,
}

#[derive(Serialize)]
struct Project<'a> {
    name: &'a str,
    domain: Domain<'a>,
}

#[derive(Serialize)]
struct Domain<'a> {
    name: &'a str,
}

impl<'a> AuthRequest<'a> {
    fn new(creds: &'a Credentials) -> Self {
        AuthRequest {
            auth: Auth {
                identity: Identity {
                    methods: ["password"],
                    password: Password {
                        user: User {
                            name: &creds.username,
                            domain: Domain {
                                name: &creds.domain_name,
                            },
                            password: &creds.password,
                        },
                    },
                },
                scope: Scope {
                    project: Project {
                        name: &creds.project_name,
                        domain: Domain {
                            name: &creds.domain_name,
                        },
                    },
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

impl Endpoint {
    fn in_region(&self, region: &str) -> bool {
        self.region_id.as_deref() == Some(region) || self.region.as_deref() == Some(region)
    }
}

/// An authenticated Keystone session.
pub struct Session {
    credentials: Credentials,
    token: RwLock<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Authenticate and discover the bare-metal endpoint in the service catalog.
    pub fn authenticate(
        client: &retry::Client,
        credentials: Credentials,
    ) -> Result<(Self, String)> {
        let (token, response) = request_token(client, &credentials)?;
        let endpoint = baremetal_endpoint(&response, credentials.region.as_deref())?;
        info!("authenticated with Keystone";
            "username" => &credentials.username,
            "endpoint" => &endpoint);
        let session = Session {
            credentials,
            token: RwLock::new(token),
        };
        Ok((session, endpoint))
    }

    /// Current token.
    pub fn token(&self) -> Result<String> {
        self.token
            .read()
            .map(|t| t.clone())
            .map_err(|_| anyhow!("token lock poisoned"))
    }

    /// Exchange the credentials for a fresh token.
    pub fn refresh(&self, client: &retry::Client) -> Result<()> {
        debug!("refreshing Keystone token");
        let (token, _) = request_token(client, &self.credentials)?;
        let mut current = self
            .token
            .write()
            .map_err(|_| anyhow!("token lock poisoned"))?;
        *current = token;
        Ok(())
    }
}

/// Token endpoint for an auth URL given with or without the `/v3` suffix.
fn token_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    let base = base.strip_suffix("/v3").unwrap_or(base);
    format!("{base}/v3/auth/tokens")
}

fn request_token(client: &retry::Client, creds: &Credentials) -> Result<(String, TokenResponse)> {
    let response = client
        .post_json(token_url(&creds.auth_url), &AuthRequest::new(creds))?
        .dispatch()
        .context("failed to request Keystone token")?;
    let token = response
        .headers()
        .get(SUBJECT_TOKEN_HEADER)
        .context("Keystone response is missing the subject token")?
        .to_str()
        .context("invalid subject token")?
        .to_string();
    let body: TokenResponse = response
        .json()
        .context("failed to parse Keystone token response")?;
    Ok((token, body))
}

/// Find the public bare-metal endpoint and return its v1 resource base.
fn baremetal_endpoint(response: &TokenResponse, region: Option<&str>) -> Result<String> {
    let service = match response
        .token
        .catalog
        .iter()
        .find(|entry| entry.service_type == BAREMETAL_SERVICE)
    {
        Some(s) => s,
        None => bail!("no '{}' service in the Keystone catalog", BAREMETAL_SERVICE),
    };
    let endpoint = service
        .endpoints
        .iter()
        .filter(|ep| ep.interface == "public")
        .find(|ep| region.map_or(true, |r| ep.in_region(r)))
        .ok_or_else(|| {
            anyhow!(
                "no public '{}' endpoint for region {:?}",
                BAREMETAL_SERVICE,
                region
            )
        })?;
    Ok(format!("{}/v1/", endpoint.url.trim_end_matches('/')))
}
