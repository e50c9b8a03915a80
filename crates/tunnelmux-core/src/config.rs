//! Tunnel configuration

use std::collections::HashSet;
use std::time::Duration;

/// Config setup for a tunnel instance
#[derive(Debug, Clone)]
pub struct Config {
    /// accepted login secrets (responder side)
    pub secrets: HashSet<String>,
    /// timeout for incoming and outgoing direct connections (not for the
    /// tunnel itself)
    pub timeout: Duration,
    /// interval between tunnel health pings - should be low enough to avoid
    /// firewall and proxy timeouts, and because it also feeds the tunnel
    /// timeout it should be the same on both ends
    pub control_ping: Duration,
    /// timeout for connection setup, either for the tunnel itself or for
    /// any of the tunneled connections
    pub connect_timeout: Duration,
    /// count of max multiplexed connections per tunnel - the technical
    /// upper limit is 16 million
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secrets: HashSet::new(),
            timeout: Duration::from_secs(15),
            control_ping: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            max_connections: 100,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.config.secrets.insert(secret.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn control_ping(mut self, interval: Duration) -> Self {
        self.config.control_ping = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn build(self) -> Result<Config, String> {
        if self.config.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        Ok(self.config)
    }
}
