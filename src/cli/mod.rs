//! Command-line arguments parsing.

use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use slog_scope::info;

use crate::ironic::auth::Credentials;
use crate::ironic::{Access, Gateway, IronicClient};
use crate::resolver::Resolver;
use crate::retry;
use crate::server::{self, ServerSettings};

/// First delay before retrying a failed Ironic request.
const API_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Serve OpenStack and EC2 metadata to bare-metal nodes managed by Ironic
#[derive(Debug, Parser)]
#[command(name = "ironic-metadata", version)]
pub(crate) struct CliConfig {
    /// Base URL of the Ironic API
    #[arg(long, env = "IRONIC_URL", value_name = "url", default_value = "http://localhost:6385")]
    ironic_url: String,
    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", value_name = "addr", default_value = "169.254.169.254")]
    bind_addr: String,
    /// Port to listen on
    #[arg(long, env = "BIND_PORT", value_name = "port", default_value_t = 80)]
    bind_port: u16,
    /// Minimum level of log messages
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub(crate) log_level: LogLevel,
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Full)]
    pub(crate) log_format: LogFormat,
    /// Value of the X-OpenStack-Ironic-API-Version header
    #[arg(long, env = "IRONIC_API_VERSION", value_name = "version", default_value = "latest")]
    api_version: String,
    /// Seconds to wait for Ironic and a conductor to come up, 0 to not wait
    #[arg(long, env = "IRONIC_WAIT_TIMEOUT", value_name = "secs", default_value_t = 0)]
    wait_timeout: u64,
    /// Timeout of a single Ironic request in seconds, 0 to disable
    #[arg(long, env = "IRONIC_REQUEST_TIMEOUT", value_name = "secs", default_value_t = 30)]
    request_timeout: u64,
    /// Idle connections kept open to Ironic
    #[arg(long, env = "IRONIC_MAX_IDLE_CONNECTIONS", value_name = "count", default_value_t = 16)]
    max_idle_connections: usize,
    /// Retries of a failed Ironic request
    #[arg(long, env = "IRONIC_API_RETRIES", value_name = "count", default_value_t = 1)]
    api_retries: u32,
    /// dnsmasq lease file used to find nodes by MAC address
    #[arg(long, env = "DHCP_LEASE_FILE", value_name = "path")]
    dhcp_lease_file: Option<PathBuf>,
    /// Keystone URL, defaults to the Ironic URL
    #[arg(long, env = "OS_AUTH_URL", value_name = "url")]
    os_auth_url: Option<String>,
    /// Keystone user; Ironic is accessed without authentication when unset
    #[arg(long, env = "OS_USERNAME", value_name = "name")]
    os_username: Option<String>,
    /// Keystone password
    #[arg(long, env = "OS_PASSWORD", value_name = "password", default_value = "", hide_env_values = true)]
    os_password: Password,
    /// Keystone project
    #[arg(long, env = "OS_PROJECT_NAME", value_name = "name", default_value = "")]
    os_project_name: String,
    /// Keystone domain of the user and project
    #[arg(long, env = "OS_USER_DOMAIN_NAME", value_name = "name", default_value = "default")]
    os_user_domain_name: String,
    /// Region of the bare-metal endpoint in the Keystone catalog
    #[arg(long, env = "OS_REGION_NAME", value_name = "name")]
    os_region_name: Option<String>,
    /// HTTP worker threads, one per core by default
    #[arg(long, env = "HTTP_WORKERS", value_name = "count")]
    workers: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Trace => slog::Level::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    Full,
    Compact,
}

/// A password that stays out of logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct Password(String);

impl FromStr for Password {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Password(s.to_string()))
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl CliConfig {
    /// Connect to Ironic and serve metadata until shut down.
    pub fn run(self) -> Result<()> {
        let settings = retry::ClientSettings {
            timeout: Some(Duration::from_secs(self.request_timeout)).filter(|t| !t.is_zero()),
            max_idle_per_host: Some(self.max_idle_connections),
        };
        let client = retry::Client::try_with_settings(&settings)?
            .initial_backoff(API_RETRY_BACKOFF)
            .max_retries(self.api_retries);
        let ironic = IronicClient::connect(client, self.access(), &self.api_version)
            .context("failed to set up Ironic client")?;
        info!("using Ironic API"; "endpoint" => ironic.endpoint());

        let gateway = Arc::new(Gateway::new(
            ironic,
            Duration::from_secs(self.wait_timeout),
        ));
        let resolver = Arc::new(Resolver::new(gateway).lease_file(self.dhcp_lease_file));
        let server_settings = ServerSettings {
            bind_addr: self.bind_addr,
            bind_port: self.bind_port,
            workers: self.workers,
        };

        // The blocking HTTP client must not be dropped inside the async
        // runtime, so the last reference is kept out here.
        let served =
            actix_web::rt::System::new().block_on(server::serve(resolver.clone(), server_settings));
        drop(resolver);
        served
    }

    fn access(&self) -> Access {
        match self.os_username.as_deref() {
            Some(username) if !username.is_empty() => Access::Keystone(Credentials {
                auth_url: self
                    .os_auth_url
                    .clone()
                    .unwrap_or_else(|| self.ironic_url.clone()),
                username: username.to_string(),
                password: self.os_password.0.clone(),
                project_name: self.os_project_name.clone(),
                domain_name: self.os_user_domain_name.clone(),
                region: self.os_region_name.clone(),
            }),
            _ => Access::Standalone {
                ironic_url: self.ironic_url.clone(),
            },
        }
    }
}

/// Parse command-line arguments into CLI configuration.
pub(crate) fn parse_args(argv: impl IntoIterator<Item = String>) -> Result<CliConfig> {
    let cfg = match CliConfig::try_parse_from(argv) {
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp => e.exit(),
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayVersion => e.exit(),
        v => v,
    }?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<String> {
        std::iter::once("ironic-metadata")
            .chain(args.iter().copied())
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn clap_tests() {
        use clap::CommandFactory;
        CliConfig::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        // Only holds when none of the env fallbacks are set.
        if std::env::vars().any(|(k, _)| k == "IRONIC_URL" || k == "OS_USERNAME") {
            return;
        }
        let cfg = parse_args(args(&[])).unwrap();
        assert_eq!(cfg.ironic_url, "http://localhost:6385");
        assert_eq!(cfg.api_version, "latest");
        assert_eq!(cfg.max_idle_connections, 16);
        match cfg.access() {
            Access::Standalone { ironic_url } => assert_eq!(ironic_url, "http://localhost:6385"),
            x => panic!("unexpected access: {x:?}"),
        }
    }

    #[test]
    fn test_keystone_access() {
        let cfg = parse_args(args(&[
            "--ironic-url",
            "http://ironic:6385",
            "--os-username",
            "admin",
            "--os-password",
            "secret",
            "--os-project-name",
            "baremetal",
            "--os-region-name",
            "RegionOne",
        ]))
        .unwrap();

        assert!(!format!("{cfg:?}").contains("secret"));
        let creds = match cfg.access() {
            Access::Keystone(creds) => creds,
            x => panic!("unexpected access: {x:?}"),
        };
        assert_eq!(creds.password, "secret");
        assert_eq!(creds.project_name, "baremetal");
        assert_eq!(creds.region.as_deref(), Some("RegionOne"));
    }

    #[test]
    fn test_server_args() {
        let cfg = parse_args(args(&[
            "--bind-addr",
            "0.0.0.0",
            "--bind-port",
            "8080",
            "--log-level",
            "debug",
            "--log-format",
            "compact",
            "--wait-timeout",
            "60",
            "--dhcp-lease-file",
            "/var/lib/dnsmasq/dnsmasq.leases",
        ]))
        .unwrap();

        assert_eq!(cfg.bind_addr, "0.0.0.0");
        assert_eq!(cfg.bind_port, 8080);
        assert_eq!(slog::Level::from(cfg.log_level), slog::Level::Debug);
        assert_eq!(cfg.log_format, LogFormat::Compact);
        assert_eq!(cfg.wait_timeout, 60);
        assert_eq!(
            cfg.dhcp_lease_file,
            Some(PathBuf::from("/var/lib/dnsmasq/dnsmasq.leases"))
        );
    }

    #[test]
    fn test_invalid_args() {
        parse_args(args(&["--bind-port", "http"])).unwrap_err();
        parse_args(args(&["--log-level", "loud"])).unwrap_err();
        parse_args(args(&["serve"])).unwrap_err();
    }
}
