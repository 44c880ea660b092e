use std::fmt;
use std::str::FromStr;

use serenity::model::id::UserId;

use super::connection::{NodeOptions, DEFAULT_PORT};
use crate::error::LinkError;

/// Where a node listens, parsed from `host[:port][@region]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub region: Option<String>,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16, region: Option<&str>) -> Self {
        Self {
            host: host.into(),
            port,
            region: region.map(str::to_string),
        }
    }

    /// Registry key: `host:port`
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Completes the address with the shared credentials
    pub fn into_options(self, password: &str, user_id: UserId, num_shards: u64) -> NodeOptions {
        NodeOptions {
            host: self.host,
            port: self.port,
            region: self.region,
            password: password.to_string(),
            user_id,
            num_shards,
        }
    }
}

impl FromStr for NodeAddress {
    type Err = LinkError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (location, region) = match raw.split_once('@') {
            Some((location, region)) if !region.trim().is_empty() => {
                (location, Some(region.trim().to_lowercase()))
            }
            Some((location, _)) => (location, None),
            None => (raw, None),
        };

        let (host, port) = match location.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| LinkError::Config(format!("invalid port in node address '{raw}'")))?;
                (host, port)
            }
            None => (location, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(LinkError::Config(format!("missing host in node address '{raw}'")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            region,
        })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(region) = &self.region {
            write!(f, "@{region}")?;
        }
        Ok(())
    }
}
