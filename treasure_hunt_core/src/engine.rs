//! The authoritative session state: agent positions, the percept grid and item ownership.
//!
//! A [`GridEngine`] is plain data with `&mut self` mutators; callers that share it across
//! connections wrap it in a single mutex (see [`crate::server::Hub`]), which serialises every
//! move and every ownership query against each other.

use std::collections::HashSet;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::direction::Direction;
use crate::map::Grid;
use crate::world::{Item, MapConfig, Obstacle, World};
use crate::{AgentId, ItemKind, Position};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("agent {0} is not part of this session")]
    UnknownAgent(AgentId),
}

/// Server-side view of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub id: AgentId,
    pub position: Position,
    pub color: [u8; 3],
    /// Cells in the order they were first visited, spawn included.
    pub path: Vec<Position>,
    #[serde(skip)]
    visited: HashSet<Position>,
    pub connected: bool,
    pub completed: bool,
}

impl AgentState {
    fn new(id: AgentId, position: Position, color: [u8; 3]) -> Self {
        AgentState {
            id,
            position,
            color,
            path: vec![position],
            visited: HashSet::from([position]),
            connected: false,
            completed: false,
        }
    }

    fn record_visit(&mut self, position: Position) {
        if self.visited.insert(position) {
            self.path.push(position);
        }
    }
}

/// Reply to the initial handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialData {
    pub agent_id: AgentId,
    pub position: Position,
    pub width: usize,
    pub height: usize,
    pub cell_val: f64,
}

/// Position and percept after a move request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveOutcome {
    pub position: Position,
    pub cell_val: f64,
}

/// Owner and kind of the item an agent stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemOwner {
    pub owner: AgentId,
    pub kind: ItemKind,
}

/// Read-only copy of the engine state for viewers and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub values: Grid<f64>,
    pub agents: Vec<AgentState>,
    pub keys: Vec<Item>,
    pub boxes: Vec<Item>,
    pub obstacles: Vec<Obstacle>,
    pub connected: usize,
}

#[derive(Debug, Clone)]
pub struct GridEngine {
    world: World,
    agents: Vec<AgentState>,
}

impl GridEngine {
    pub fn new(world: World) -> Self {
        let agents = world
            .spawns
            .iter()
            .enumerate()
            .map(|(id, spawn)| AgentState::new(id, spawn.position, spawn.color))
            .collect();
        GridEngine { world, agents }
    }

    /// Builds the world for `config` and wraps it in a fresh engine.
    pub fn from_map<R: Rng>(config: &MapConfig, obstacle_count: usize, rng: &mut R) -> Self {
        let engine = Self::new(World::build(config, obstacle_count, rng));
        info!(
            width = config.width,
            height = config.height,
            agents = engine.agents.len(),
            obstacles = engine.world.obstacles.len(),
            "grid engine ready"
        );
        engine
    }

    pub fn width(&self) -> usize {
        self.world.values.width()
    }

    pub fn height(&self) -> usize {
        self.world.values.height()
    }

    /// Size of the session.
    pub fn expected_count(&self) -> usize {
        self.agents.len()
    }

    pub fn connected_count(&self) -> usize {
        self.agents.iter().filter(|a| a.connected).count()
    }

    /// Claims the lowest free agent slot, or `None` when the session is full.
    pub fn connect(&mut self) -> Option<AgentId> {
        let agent = self.agents.iter_mut().find(|a| !a.connected)?;
        agent.connected = true;
        info!(agent = agent.id, "agent slot claimed");
        Some(agent.id)
    }

    /// Releases a slot. The agent keeps its position and history.
    pub fn disconnect(&mut self, id: AgentId) {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.connected = false;
            info!(agent = id, "agent slot released");
        }
    }

    pub fn value_at(&self, position: Position) -> f64 {
        self.world.values.get(position.x, position.y).copied().unwrap_or(0.0)
    }

    fn agent(&self, id: AgentId) -> Result<&AgentState, EngineError> {
        self.agents.get(id).ok_or(EngineError::UnknownAgent(id))
    }

    pub fn position(&self, id: AgentId) -> Result<Position, EngineError> {
        Ok(self.agent(id)?.position)
    }

    pub fn initial_data(&self, id: AgentId) -> Result<InitialData, EngineError> {
        let agent = self.agent(id)?;
        Ok(InitialData {
            agent_id: id,
            position: agent.position,
            width: self.width(),
            height: self.height(),
            cell_val: self.value_at(agent.position),
        })
    }

    /// Applies a move given by its wire code.
    ///
    /// Codes outside `0..=8`, negative ones included, and destinations outside the grid leave
    /// the agent where it is; the reply always carries the current position and percept.
    pub fn apply_move(&mut self, id: AgentId, code: i64) -> Result<MoveOutcome, EngineError> {
        let (width, height) = (self.width(), self.height());
        let agent = self.agents.get_mut(id).ok_or(EngineError::UnknownAgent(id))?;
        let direction = u8::try_from(code).ok().and_then(Direction::from_code);
        match direction.and_then(|d| d.apply(agent.position, width, height)) {
            Some(destination) => {
                agent.position = destination;
                agent.record_visit(destination);
                trace!(agent = id, code, position = %destination, "moved");
            }
            None => trace!(agent = id, code, position = %agent.position, "move ignored"),
        }
        let position = agent.position;
        Ok(MoveOutcome {
            position,
            cell_val: self.value_at(position),
        })
    }

    /// Resolves the item under the agent. `None` unless the agent stands on a 1.0 cell that
    /// holds a key or a box; keys are checked before boxes.
    pub fn item_owner(&self, id: AgentId) -> Result<Option<ItemOwner>, EngineError> {
        let position = self.agent(id)?.position;
        if self.value_at(position) != crate::percept::TARGET_VALUE {
            return Ok(None);
        }
        let found = self
            .world
            .keys
            .iter()
            .chain(self.world.boxes.iter())
            .find(|item| item.position == position)
            .map(|item| ItemOwner {
                owner: item.owner,
                kind: item.kind,
            });
        debug!(agent = id, %position, ?found, "item owner resolved");
        Ok(found)
    }

    /// Records a completion notice from `id`.
    pub fn mark_completed(&mut self, id: AgentId) -> Result<(), EngineError> {
        let agent = self.agents.get_mut(id).ok_or(EngineError::UnknownAgent(id))?;
        if !agent.completed {
            agent.completed = true;
            info!(agent = id, "mission completed");
        }
        Ok(())
    }

    pub fn all_completed(&self) -> bool {
        self.agents.iter().all(|a| a.completed)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            values: self.world.values.clone(),
            agents: self.agents.clone(),
            keys: self.world.keys.clone(),
            boxes: self.world.boxes.clone(),
            obstacles: self.world.obstacles.clone(),
            connected: self.connected_count(),
        }
    }
}
