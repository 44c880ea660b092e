//! Region routing and least-loaded node selection.

use std::collections::BTreeMap;

use crate::node::NodeConnection;

/// Region key → voice endpoint prefixes
pub type RegionBuckets = BTreeMap<String, Vec<String>>;

/// Built-in buckets used when no `VOICE_REGIONS` is configured
pub fn default_buckets() -> RegionBuckets {
    [
        ("asia", &["hongkong", "singapore", "sydney"][..]),
        ("eu", &["eu", "amsterdam", "frankfurt", "russia"][..]),
        ("us", &["us", "brazil"][..]),
    ]
    .into_iter()
    .map(|(key, prefixes)| {
        (
            key.to_string(),
            prefixes.iter().map(|p| p.to_string()).collect(),
        )
    })
    .collect()
}

/// Maps a voice endpoint to a region key that currently has a usable node.
///
/// Buckets without a ready, non-draining node of their region are skipped.
pub fn region_from_endpoint<'a>(
    endpoint: Option<&str>,
    buckets: &RegionBuckets,
    nodes: impl IntoIterator<Item = &'a NodeConnection> + Clone,
    default_region: &str,
) -> String {
    let Some(endpoint) = endpoint.filter(|e| !e.is_empty()) else {
        return default_region.to_string();
    };
    let endpoint = endpoint.strip_prefix("vip-").unwrap_or(endpoint);

    for (key, prefixes) in buckets {
        let usable = nodes.clone().into_iter().any(|node| {
            node.region() == Some(key.as_str()) && node.is_ready() && !node.is_draining()
        });
        if !usable {
            continue;
        }
        if prefixes.iter().any(|prefix| endpoint.starts_with(prefix.as_str())) {
            return key.clone();
        }
    }

    default_region.to_string()
}

/// Lowest-load ready node, preferring `region` when any node there qualifies
pub fn find_ideal_node<'a>(
    nodes: impl IntoIterator<Item = &'a NodeConnection>,
    region: Option<&str>,
) -> Option<NodeConnection> {
    let candidates: Vec<&NodeConnection> = nodes
        .into_iter()
        .filter(|node| node.is_ready() && !node.is_draining())
        .collect();

    let regional: Vec<&NodeConnection> = match region {
        Some(region) => candidates
            .iter()
            .copied()
            .filter(|node| node.region() == Some(region))
            .collect(),
        None => Vec::new(),
    };
    let pool = if regional.is_empty() { candidates } else { regional };

    // Empate: gana el primero en orden de registro
    pool.into_iter()
        .min_by(|a, b| a.cpu_load().total_cmp(&b.cpu_load()))
        .cloned()
}
