use serde::{Deserialize, Serialize};

/// Load sample reported by a node through `op: stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    #[serde(default)]
    pub players: u64,
    #[serde(default)]
    pub playing_players: u64,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub cpu: Option<CpuStats>,
    #[serde(default)]
    pub memory: Option<MemoryStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub system_load: f64,
    #[serde(default)]
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub allocated: u64,
    #[serde(default)]
    pub reservable: u64,
}

impl NodeStats {
    /// `systemLoad / cores * 100`; a node without a CPU sample counts as idle
    pub fn cpu_load(&self) -> f64 {
        match &self.cpu {
            Some(cpu) if cpu.cores > 0 => cpu.system_load / f64::from(cpu.cores) * 100.0,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cpu_load() {
        let stats: NodeStats = serde_json::from_value(json!({
            "op": "stats",
            "players": 4,
            "playingPlayers": 2,
            "cpu": {"cores": 4, "systemLoad": 0.4, "lavalinkLoad": 0.1}
        }))
        .unwrap();
        assert_eq!(stats.players, 4);
        assert_eq!(stats.playing_players, 2);
        assert!((stats.cpu_load() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_sample_is_idle() {
        assert_eq!(NodeStats::default().cpu_load(), 0.0);

        let zero_cores = NodeStats {
            cpu: Some(CpuStats {
                cores: 0,
                system_load: 3.0,
                lavalink_load: 0.0,
            }),
            ..NodeStats::default()
        };
        assert_eq!(zero_cores.cpu_load(), 0.0);
    }
}
