//! Settings for a session (server side) and for a single agent.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: &'static str, value: String },
}

/// Reads `name` from the environment; unset or empty means `None`.
fn var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        _ => Ok(None),
    }
}

/// Configuration of the engine side of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub addr: String,
    pub agents: usize,
    pub map_id: u32,
    /// Map catalogue file; the embedded demo catalogue when unset.
    pub maps: Option<PathBuf>,
    /// Obstacles to place; one per agent when unset.
    pub obstacles: Option<usize>,
    pub seed: Option<u64>,
}

impl SessionConfig {
    /// Four agents on map 1 of the embedded catalogue, listening on `127.0.0.1:5555`.
    pub fn new() -> Self {
        SessionConfig {
            addr: "127.0.0.1:5555".to_string(),
            agents: 4,
            map_id: 1,
            maps: None,
            obstacles: None,
            seed: None,
        }
    }

    /// Defaults overridden by `HUNT_ADDR`, `HUNT_AGENTS`, `HUNT_MAP_ID`, `HUNT_MAPS`,
    /// `HUNT_OBSTACLES` and `HUNT_SEED`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new();
        if let Some(addr) = var("HUNT_ADDR")? {
            config.addr = addr;
        }
        if let Some(agents) = var("HUNT_AGENTS")? {
            config.agents = agents;
        }
        if let Some(map_id) = var("HUNT_MAP_ID")? {
            config.map_id = map_id;
        }
        config.maps = var("HUNT_MAPS")?.or(config.maps);
        config.obstacles = var("HUNT_OBSTACLES")?.or(config.obstacles);
        config.seed = var("HUNT_SEED")?.or(config.seed);
        Ok(config)
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_agents(mut self, agents: usize) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_map_id(mut self, map_id: u32) -> Self {
        self.map_id = map_id;
        self
    }

    pub fn with_maps(mut self, maps: impl Into<PathBuf>) -> Self {
        self.maps = Some(maps.into());
        self
    }

    pub fn with_obstacles(mut self, obstacles: usize) -> Self {
        self.obstacles = Some(obstacles);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of obstacles the world will try to place.
    pub fn obstacle_count(&self) -> usize {
        self.obstacles.unwrap_or(self.agents)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of one agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub addr: String,
    /// How long to wait for the reply to a move or handshake.
    pub request_timeout: Duration,
    /// How long to wait for an ownership answer before giving up on a discovery.
    pub owner_timeout: Duration,
    /// Poll interval while waiting for the other agents to connect.
    pub peer_poll: Duration,
    /// Give up waiting for peers after this long; wait forever when unset.
    pub peer_wait_limit: Option<Duration>,
    /// Pause after every move.
    pub step_delay: Duration,
    /// Stop after this many moves.
    pub max_steps: Option<u64>,
    pub seed: Option<u64>,
    /// Minimum distance between waypoints; derived from the grid size when unset.
    pub min_separation: Option<f64>,
    /// Moves between two statistics log lines.
    pub stats_interval: u64,
}

impl AgentConfig {
    pub fn new() -> Self {
        AgentConfig {
            addr: "127.0.0.1:5555".to_string(),
            request_timeout: Duration::from_secs(2),
            owner_timeout: Duration::from_secs(1),
            peer_poll: Duration::from_millis(100),
            peer_wait_limit: None,
            step_delay: Duration::ZERO,
            max_steps: None,
            seed: None,
            min_separation: None,
            stats_interval: 250,
        }
    }

    /// Defaults overridden by `HUNT_ADDR`, `HUNT_STEP_DELAY_MS`, `HUNT_MAX_STEPS`,
    /// `HUNT_SEED`, `HUNT_REQUEST_TIMEOUT_MS`, `HUNT_OWNER_TIMEOUT_MS` and
    /// `HUNT_MIN_SEPARATION`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new();
        if let Some(addr) = var("HUNT_ADDR")? {
            config.addr = addr;
        }
        if let Some(ms) = var("HUNT_STEP_DELAY_MS")? {
            config.step_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = var("HUNT_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = var("HUNT_OWNER_TIMEOUT_MS")? {
            config.owner_timeout = Duration::from_millis(ms);
        }
        config.min_separation = var("HUNT_MIN_SEPARATION")?.or(config.min_separation);
        config.max_steps = var("HUNT_MAX_STEPS")?.or(config.max_steps);
        config.seed = var("HUNT_SEED")?.or(config.seed);
        Ok(config)
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_owner_timeout(mut self, timeout: Duration) -> Self {
        self.owner_timeout = timeout;
        self
    }

    pub fn with_peer_wait_limit(mut self, limit: Duration) -> Self {
        self.peer_wait_limit = Some(limit);
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_min_separation(mut self, separation: f64) -> Self {
        self.min_separation = Some(separation);
        self
    }

    pub fn with_stats_interval(mut self, interval: u64) -> Self {
        self.stats_interval = interval.max(1);
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new()
    }
}
