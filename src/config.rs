use anyhow::{Context, Result};
use serenity::model::id::UserId;
use std::time::Duration;

use crate::manager::{default_buckets, ManagerOptions, RegionBuckets};
use crate::node::NodeAddress;

#[derive(Debug, Clone)]
pub struct Config {
    // Nodos
    pub nodes: Vec<NodeAddress>,
    pub password: String,

    // Identidad del bot
    pub user_id: u64,
    pub num_shards: u64,

    // Failover
    pub failover_rate: Duration,
    pub failover_limit: usize,
    pub reconnect_threshold: Duration,
    pub join_timeout: Duration,

    // Regiones
    pub default_region: String,
    pub regions: RegionBuckets,

    // Monitoreo
    pub status_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup (environment, map, ...)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            // Nodos
            nodes: match var("LAVALINK_NODES") {
                Some(raw) => parse_nodes(&raw)?,
                None => defaults.nodes,
            },
            password: var("LAVALINK_PASSWORD").unwrap_or(defaults.password),

            // Identidad del bot
            user_id: var("BOT_USER_ID")
                .context("BOT_USER_ID is required")?
                .trim()
                .parse()
                .context("BOT_USER_ID must be a numeric snowflake")?,
            num_shards: match var("NUM_SHARDS") {
                Some(raw) => raw.trim().parse().context("NUM_SHARDS must be a number")?,
                None => defaults.num_shards,
            },

            // Failover
            failover_rate: duration_var(&var, "FAILOVER_RATE", defaults.failover_rate)?,
            failover_limit: match var("FAILOVER_LIMIT") {
                Some(raw) => raw.trim().parse().context("FAILOVER_LIMIT must be a number")?,
                None => defaults.failover_limit,
            },
            reconnect_threshold: duration_var(
                &var,
                "RECONNECT_THRESHOLD",
                defaults.reconnect_threshold,
            )?,
            join_timeout: duration_var(&var, "JOIN_TIMEOUT", defaults.join_timeout)?,

            // Regiones
            default_region: var("DEFAULT_REGION")
                .map(|region| region.trim().to_lowercase())
                .unwrap_or(defaults.default_region),
            regions: match var("VOICE_REGIONS") {
                Some(raw) => parse_regions(&raw)?,
                None => defaults.regions,
            },

            // Monitoreo
            status_interval: duration_var(&var, "STATUS_INTERVAL", defaults.status_interval)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one node must be configured
    /// - `BOT_USER_ID` must be a non-zero snowflake
    /// - Failover batches must release at least one session
    /// - The join timeout must be positive
    /// - A default region is required
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one Lavalink node is required");
        }

        if self.user_id == 0 {
            anyhow::bail!("BOT_USER_ID must be a non-zero snowflake");
        }

        if self.failover_limit == 0 {
            anyhow::bail!("Failover limit must be greater than 0");
        }

        if self.join_timeout.is_zero() {
            anyhow::bail!("Join timeout must be greater than 0");
        }

        if self.default_region.trim().is_empty() {
            anyhow::bail!("Default region cannot be empty");
        }

        Ok(())
    }

    /// Options for the player manager derived from this configuration
    pub fn manager_options(&self) -> Result<ManagerOptions> {
        if self.user_id == 0 {
            anyhow::bail!("BOT_USER_ID must be a non-zero snowflake");
        }
        Ok(ManagerOptions {
            user_id: UserId::new(self.user_id),
            password: self.password.clone(),
            num_shards: self.num_shards,
            failover_rate: self.failover_rate,
            failover_limit: self.failover_limit,
            reconnect_threshold: self.reconnect_threshold,
            join_timeout: self.join_timeout,
            default_region: self.default_region.clone(),
            regions: self.regions.clone(),
        })
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The node password is never included.
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self.nodes.iter().map(ToString::to_string).collect();
        let regions: Vec<&str> = self.regions.keys().map(String::as_str).collect();
        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Bot: user {} ({} shards)\n  \
            Failover: {} every {}, resume +{}\n  \
            Join timeout: {}\n  \
            Regions: {} (default {})",
            nodes.join(", "),
            self.user_id,
            self.num_shards,
            self.failover_limit,
            humantime::format_duration(self.failover_rate),
            humantime::format_duration(self.reconnect_threshold),
            humantime::format_duration(self.join_timeout),
            regions.join(", "),
            self.default_region,
        )
    }
}

fn duration_var(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match var(key) {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("{key} must be a duration like 250ms or 10s")),
        None => Ok(default),
    }
}

/// `host[:port][@region]`, comma separated
fn parse_nodes(raw: &str) -> Result<Vec<NodeAddress>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<NodeAddress>()
                .with_context(|| format!("invalid LAVALINK_NODES entry '{entry}'"))
        })
        .collect()
}

/// `key=prefix|prefix;key=prefix`
fn parse_regions(raw: &str) -> Result<RegionBuckets> {
    let mut buckets = RegionBuckets::new();
    for bucket in raw.split(';').map(str::trim).filter(|b| !b.is_empty()) {
        let (key, prefixes) = bucket
            .split_once('=')
            .with_context(|| format!("invalid VOICE_REGIONS bucket '{bucket}'"))?;
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            anyhow::bail!("VOICE_REGIONS bucket without a key: '{bucket}'");
        }
        let prefixes: Vec<String> = prefixes
            .split('|')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        buckets.insert(key, prefixes);
    }
    Ok(buckets)
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec![NodeAddress::new("localhost", 2333, None)],
            password: "youshallnotpass".to_string(),

            // Sin valor por defecto: debe venir del entorno
            user_id: 0,
            num_shards: 1,

            failover_rate: Duration::from_millis(250),
            failover_limit: 1,
            reconnect_threshold: Duration::from_millis(2000),
            join_timeout: Duration::from_secs(10),

            default_region: "us".to_string(),
            regions: default_buckets(),

            status_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_with_only_user_id() {
        let config = load(&[("BOT_USER_ID", "1234")]).unwrap();
        assert_eq!(config.user_id, 1234);
        assert_eq!(config.nodes, vec![NodeAddress::new("localhost", 2333, None)]);
        assert_eq!(config.failover_rate, Duration::from_millis(250));
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.regions["eu"], ["eu", "amsterdam", "frankfurt", "russia"]);

        let options = config.manager_options().unwrap();
        assert_eq!(options.user_id, UserId::new(1234));
        assert_eq!(options.reconnect_threshold, Duration::from_millis(2000));
    }

    #[test]
    fn test_user_id_required() {
        assert!(load(&[]).is_err());
        assert!(load(&[("BOT_USER_ID", "0")]).is_err());
        assert!(load(&[("BOT_USER_ID", "abc")]).is_err());
    }

    #[test]
    fn test_parses_nodes_regions_and_durations() {
        let config = load(&[
            ("BOT_USER_ID", "1"),
            ("LAVALINK_NODES", "a.local:2333@eu, b.local@us"),
            ("VOICE_REGIONS", "eu=eu|amsterdam; us=us|brazil|miami"),
            ("FAILOVER_RATE", "1s 500ms"),
            ("FAILOVER_LIMIT", "3"),
            ("DEFAULT_REGION", "EU"),
        ])
        .unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].region.as_deref(), Some("eu"));
        assert_eq!(config.nodes[1].port, crate::node::DEFAULT_PORT);
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.regions["us"], ["us", "brazil", "miami"]);
        assert_eq!(config.failover_rate, Duration::from_millis(1500));
        assert_eq!(config.failover_limit, 3);
        assert_eq!(config.default_region, "eu");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(load(&[("BOT_USER_ID", "1"), ("FAILOVER_LIMIT", "0")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("JOIN_TIMEOUT", "0s")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("JOIN_TIMEOUT", "soon")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("LAVALINK_NODES", "a:x")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("VOICE_REGIONS", "eu")]).is_err());

        let mut config = Config::default();
        config.user_id = 1;
        config.nodes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_hides_password() {
        let mut config = load(&[("BOT_USER_ID", "1")]).unwrap();
        config.password = "super-secret".to_string();
        let summary = config.summary();
        assert!(summary.contains("localhost:2333"));
        assert!(summary.contains("250ms"));
        assert!(!summary.contains("super-secret"));
    }
}
