//! Transport settings
//!
//! Layered the usual way: built-in defaults, then an optional TOML file, then
//! `TRANSPORT_`-prefixed environment variables. Nested keys use a double
//! underscore, e.g. `TRANSPORT_SERVER__PORT=7000`.

use crate::error::TransportError;
use crate::{DEFAULT_FIRST_CLIENT_ID, DEFAULT_PORT};
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use tracing::{debug, info};

/// Server listener settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Id handed to the first admitted client; later clients count up
    pub first_client_id: u32,
    pub nodelay: bool,
}

impl ServerSettings {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            first_client_id: DEFAULT_FIRST_CLIENT_ID,
            nodelay: true,
        }
    }
}

/// Client connect settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub nodelay: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSettings {
    pub server: ServerSettings,
    pub client: ClientSettings,
}

impl TransportSettings {
    /// Load from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            Environment::with_prefix("TRANSPORT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading transport config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(env)
            .build()
            .context("Failed to build transport configuration")?;

        let settings: Self = config
            .try_deserialize()
            .context("Failed to deserialize transport configuration")?;

        settings.validate()?;
        debug!(?settings, "Transport settings loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), TransportError> {
        if self.client.host.trim().is_empty() {
            return Err(TransportError::configuration(
                "Client host must not be empty",
                Some("client.host"),
            ));
        }
        if self.server.first_client_id == 0 {
            return Err(TransportError::configuration(
                "Client ids start above zero; zero means unassigned",
                Some("server.first_client_id"),
            ));
        }
        Ok(())
    }
}
