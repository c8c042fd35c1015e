//! Configuration file management.
//!
//! The config file is plain `key = value` text (a TOML subset) read from
//! the working directory. Unknown keys are ignored; missing required keys
//! abort startup before anything binds or opens.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::Deserialize;

/// Default configuration file name in the working directory.
pub const CONFIG_FILE: &str = "homenet.conf";

/// Complete daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Primary role port (role advertisement, neighbor replication).
    pub primary_port: u16,
    /// Port advertised for server-to-server traffic; must equal
    /// `primary_port` (the neighbor role shares the primary listener).
    pub server_neighbor_port: u16,
    /// Non-TLS client role port.
    pub client_non_customer_port: u16,
    /// TLS client role port.
    pub client_customer_port: u16,
    /// TLS application-service role port.
    pub client_app_service_port: u16,
    /// Public address peers can reach this server at.
    pub external_server_address: IpAddr,
    /// Port of the local location service.
    pub loc_port: u16,
    /// Path to the PKCS#12 TLS bundle.
    pub tls_server_certificate: PathBuf,
    /// Root of the image blob store.
    pub image_data_folder: PathBuf,
    /// SQLite database file.
    pub db_file_name: PathBuf,
    /// Active hosting agreements accepted.
    pub max_hosted_identities: u64,
    /// Neighbor cap.
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: u64,
    /// Follower cap.
    #[serde(default = "default_max_followers")]
    pub max_followers: u64,

    /// Password of the PKCS#12 bundle.
    #[serde(default)]
    pub tls_certificate_password: String,
    /// Server-wide connection cap.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Days an expired hosting agreement is kept before purge.
    #[serde(default = "default_hosting_retention_days")]
    pub hosting_retention_days: u64,
    /// Hours without a LOC refresh after which a neighbor is dropped.
    #[serde(default = "default_neighbor_expiration_hours")]
    pub neighbor_expiration_hours: u64,
}

fn default_max_neighbors() -> u64 {
    105
}

fn default_max_followers() -> u64 {
    200
}

fn default_max_connections() -> usize {
    1024
}

fn default_hosting_retention_days() -> u64 {
    14
}

fn default_neighbor_expiration_hours() -> u64 {
    24
}

impl DaemonConfig {
    /// Load and validate the configuration from the working directory.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&PathBuf::from(CONFIG_FILE))
    }

    /// Load and validate the configuration from an explicit path.
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let ports = [
            self.primary_port,
            self.client_non_customer_port,
            self.client_customer_port,
            self.client_app_service_port,
        ];
        if ports.iter().any(|p| *p == 0) {
            anyhow::bail!("role ports must be non-zero");
        }
        for (i, a) in ports.iter().enumerate() {
            if ports[i + 1..].contains(a) {
                anyhow::bail!("role ports must be distinct (port {a} is reused)");
            }
        }
        if self.server_neighbor_port != self.primary_port {
            anyhow::bail!(
                "server_neighbor_port must equal primary_port (the neighbor role \
                 shares the primary listener)"
            );
        }
        if self.loc_port == 0 {
            anyhow::bail!("loc_port must be non-zero");
        }
        if self.max_hosted_identities == 0 {
            anyhow::bail!("max_hosted_identities must be non-zero");
        }
        Ok(())
    }

    /// The local location-service endpoint.
    pub fn loc_endpoint(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.loc_port))
    }
}
