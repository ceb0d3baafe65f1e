//! Command line and environment configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::auth::authenticator::DEFAULT_SESSION_TTL_SECS;
use crate::auth::consumer::{self, ConsumerConfig};
use crate::auth::enterprise::{DEFAULT_AUTHORITY_URL, EnterpriseConfig};
use crate::ip::{DEFAULT_TUNNEL_CIDR, IpAllocator};
use crate::providers::kolide::DEFAULT_KOLIDE_URL;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--{flag} is required with --identity-provider {provider}")]
    MissingIdentityFlag { flag: &'static str, provider: &'static str },

    #[error("--jita-username and --jita-password are required with --jita-url")]
    MissingJitaCredentials,

    #[error("Invalid tunnel pool: {0}")]
    TunnelPool(String),

    #[error("Cannot determine home directory")]
    NoHomeDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IdentityProviderKind {
    Enterprise,
    Consumer,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "ztna-apiserver")]
#[command(
    version,
    about = "ZTNA control plane - device/gateway authentication and WireGuard config distribution"
)]
pub struct Config {
    /// gRPC listen address.
    #[arg(long, env = "ZTNA_GRPC_ADDR", default_value = "0.0.0.0:8099")]
    pub grpc_addr: SocketAddr,

    /// Legacy HTTP/JSON listen address. Disabled when omitted.
    #[arg(long, env = "ZTNA_HTTP_ADDR")]
    pub http_addr: Option<SocketAddr>,

    /// Path to SQLite database file. Defaults to `~/.ztna/apiserver.db`.
    #[arg(long, env = "ZTNA_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// IPv4 prefix tunnel addresses are allocated from.
    #[arg(long, env = "ZTNA_TUNNEL_CIDR", default_value = DEFAULT_TUNNEL_CIDR)]
    pub tunnel_cidr: String,

    /// Addresses never handed out (the server's own tunnel address).
    #[arg(
        long = "reserved-ip",
        env = "ZTNA_RESERVED_IPS",
        value_delimiter = ',',
        default_value = "10.255.240.1"
    )]
    pub reserved_ips: Vec<Ipv4Addr>,

    /// Session lifetime in seconds.
    #[arg(long, env = "ZTNA_SESSION_TTL", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    pub session_ttl: i64,

    #[arg(long, env = "ZTNA_IDENTITY_PROVIDER", value_enum, default_value_t = IdentityProviderKind::Enterprise)]
    pub identity_provider: IdentityProviderKind,

    #[arg(long, env = "ZTNA_ENTERPRISE_TENANT_ID")]
    pub enterprise_tenant_id: Option<String>,

    #[arg(long, env = "ZTNA_ENTERPRISE_CLIENT_ID")]
    pub enterprise_client_id: Option<String>,

    /// Overrides the key set URL derived from the tenant.
    #[arg(long, env = "ZTNA_ENTERPRISE_JWKS_URL")]
    pub enterprise_jwks_url: Option<String>,

    #[arg(long, env = "ZTNA_ENTERPRISE_AUTHORITY_URL", default_value = DEFAULT_AUTHORITY_URL)]
    pub enterprise_authority_url: String,

    #[arg(long, env = "ZTNA_CONSUMER_CLIENT_ID")]
    pub consumer_client_id: Option<String>,

    /// Accepted hosted domains (`hd` claim). Any domain when empty.
    #[arg(long = "consumer-allowed-domain", env = "ZTNA_CONSUMER_ALLOWED_DOMAINS", value_delimiter = ',')]
    pub consumer_allowed_domains: Vec<String>,

    #[arg(long, env = "ZTNA_CONSUMER_JWKS_URL", default_value = consumer::DEFAULT_JWKS_URL)]
    pub consumer_jwks_url: String,

    /// Group proving acceptable use policy acceptance.
    #[arg(long, env = "ZTNA_REQUIRED_GROUP")]
    pub required_group: Option<String>,

    /// Redirect URI handed to the identity provider by `/authurl`.
    #[arg(long, env = "ZTNA_AUTH_REDIRECT_URI", default_value = "http://localhost:51800")]
    pub auth_redirect_uri: String,

    #[arg(long, env = "ZTNA_ADMIN_USERNAME", default_value = "admin")]
    pub admin_username: String,

    #[arg(long, env = "ZTNA_ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: String,

    /// Just-in-time access service. Privileged gateways admit nobody without it.
    #[arg(long, env = "ZTNA_JITA_URL")]
    pub jita_url: Option<String>,

    #[arg(long, env = "ZTNA_JITA_USERNAME")]
    pub jita_username: Option<String>,

    #[arg(long, env = "ZTNA_JITA_PASSWORD", hide_env_values = true)]
    pub jita_password: Option<String>,

    #[arg(long, env = "ZTNA_KOLIDE_URL", default_value = DEFAULT_KOLIDE_URL)]
    pub kolide_url: String,

    /// Health sync is disabled when omitted.
    #[arg(long, env = "ZTNA_KOLIDE_API_TOKEN", hide_env_values = true)]
    pub kolide_api_token: Option<String>,

    /// Seconds between health sync passes.
    #[arg(long, env = "ZTNA_HEALTH_SYNC_INTERVAL", default_value_t = 60)]
    pub health_sync_interval: u64,

    /// Seconds between privileged access refreshes.
    #[arg(long, env = "ZTNA_JITA_REFRESH_INTERVAL", default_value_t = 10)]
    pub jita_refresh_interval: u64,

    /// Seconds between expired session sweeps.
    #[arg(long, env = "ZTNA_SESSION_CLEANUP_INTERVAL", default_value_t = 3600)]
    pub session_cleanup_interval: u64,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "ZTNA_LOG_JSON")]
    pub log_json: bool,
}

/// Validated identity provider selection.
#[derive(Debug, Clone)]
pub enum IdentitySettings {
    Enterprise(EnterpriseConfig),
    Consumer(ConsumerConfig),
}

#[derive(Debug, Clone)]
pub struct JitaSettings {
    pub url: String,
    pub username: String,
    pub password: String,
}

fn require(value: Option<&String>, flag: &'static str, provider: &'static str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(ConfigError::MissingIdentityFlag { flag, provider })
}

impl Config {
    pub fn identity_settings(&self) -> Result<IdentitySettings, ConfigError> {
        match self.identity_provider {
            IdentityProviderKind::Enterprise => Ok(IdentitySettings::Enterprise(EnterpriseConfig {
                tenant_id: require(self.enterprise_tenant_id.as_ref(), "enterprise-tenant-id", "enterprise")?,
                client_id: require(self.enterprise_client_id.as_ref(), "enterprise-client-id", "enterprise")?,
                authority_url: self.enterprise_authority_url.clone(),
                jwks_url: self.enterprise_jwks_url.clone(),
            })),
            IdentityProviderKind::Consumer => {
                let mut config =
                    ConsumerConfig::new(require(self.consumer_client_id.as_ref(), "consumer-client-id", "consumer")?);
                config.allowed_domains.clone_from(&self.consumer_allowed_domains);
                config.jwks_url.clone_from(&self.consumer_jwks_url);
                Ok(IdentitySettings::Consumer(config))
            }
        }
    }

    /// The policy group, falling back to the consumer provider's default.
    pub fn required_group(&self) -> Result<String, ConfigError> {
        match (self.required_group.as_ref(), self.identity_provider) {
            (Some(group), _) if !group.is_empty() => Ok(group.clone()),
            (_, IdentityProviderKind::Consumer) => Ok(consumer::DEFAULT_GROUP.to_string()),
            (_, IdentityProviderKind::Enterprise) => Err(ConfigError::MissingIdentityFlag {
                flag: "required-group",
                provider: "enterprise",
            }),
        }
    }

    pub fn jita_settings(&self) -> Result<Option<JitaSettings>, ConfigError> {
        let Some(url) = &self.jita_url else {
            return Ok(None);
        };
        match (&self.jita_username, &self.jita_password) {
            (Some(username), Some(password)) => Ok(Some(JitaSettings {
                url: url.clone(),
                username: username.clone(),
                password: password.clone(),
            })),
            _ => Err(ConfigError::MissingJitaCredentials),
        }
    }

    pub fn ip_allocator(&self) -> Result<IpAllocator, ConfigError> {
        IpAllocator::new(&self.tunnel_cidr, self.reserved_ips.iter().copied())
            .map_err(|e| ConfigError::TunnelPool(e.to_string()))
    }

    pub fn db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(".ztna")
                .join("apiserver.db")),
        }
    }

    pub const fn health_sync_period(&self) -> Duration {
        Duration::from_secs(self.health_sync_interval)
    }

    pub const fn jita_refresh_period(&self) -> Duration {
        Duration::from_secs(self.jita_refresh_interval)
    }

    pub const fn session_cleanup_period(&self) -> Duration {
        Duration::from_secs(self.session_cleanup_interval)
    }
}
