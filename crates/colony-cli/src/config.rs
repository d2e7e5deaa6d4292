//! `colony.toml` loading.
//!
//! Every section is optional; missing keys take the component defaults.

use colony_cluster::{NodeConfig, PeerLinkSettings};
use colony_core::Position;
use colony_scheduler::{Agent, AutonomyConfig, SchedulerConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct ColonyConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub peer_link: PeerLinkSettings,
    /// Agents registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub position: Option<Position>,
}

impl AgentEntry {
    pub fn to_agent(&self) -> Agent {
        let agent = Agent::new(self.id.clone(), self.role.clone());
        match self.position {
            Some(position) => agent.with_position(position),
            None => agent,
        }
    }
}

impl ColonyConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut config: ColonyConfig = toml::from_str(raw)?;
        config.scheduler.validate()?;
        config.autonomy = config.autonomy.normalized();

        let mut seen = HashSet::new();
        for agent in &config.agents {
            if agent.id.trim().is_empty() || agent.role.trim().is_empty() {
                anyhow::bail!("agents entries need a non-empty id and role");
            }
            if !seen.insert(agent.id.as_str()) {
                anyhow::bail!("duplicate agent id '{}' in [[agents]]", agent.id);
            }
        }
        Ok(config)
    }
}
