//! Static layout of a session: map catalogue loading, item placement, obstacle stamping and
//! the precomputed percept grid.

use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::map::Grid;
use crate::percept::{
    BOX_NEIGHBOUR_VALUE, KEY_NEIGHBOUR_VALUE, OBSTACLE_NEIGHBOUR_VALUE, TARGET_VALUE,
};
use crate::{AgentId, ItemKind, Position};

/// Side length of the square obstacle stamp.
pub const OBSTACLE_SIZE: usize = 5;
const OBSTACLE_PLACEMENT_ATTEMPTS: usize = 100;

/// Errors raised while loading or validating a map.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("could not read map catalogue: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed map catalogue: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("map '{0}' not found in catalogue")]
    MissingMap(String),
    #[error("map '{map}' has no entry '{entry}'")]
    MissingEntry { map: String, entry: String },
    #[error("{entry} at {position} lies outside the {width}x{height} map")]
    OutOfBounds {
        entry: String,
        position: Position,
        width: usize,
        height: usize,
    },
    #[error("map defines {available} agents but the session expects {requested}")]
    NotEnoughAgents { available: usize, requested: usize },
    #[error("a session needs at least one agent")]
    NoAgents,
}

/// Where an agent spawns and how a viewer should draw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpawn {
    pub position: Position,
    pub color: [u8; 3],
}

/// A validated map: dimensions plus one spawn, key and box per agent slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapConfig {
    pub width: usize,
    pub height: usize,
    pub agents: Vec<AgentSpawn>,
    pub keys: Vec<Position>,
    pub boxes: Vec<Position>,
}

#[derive(Debug, Deserialize)]
struct RawMap {
    width: usize,
    height: usize,
    #[serde(flatten)]
    entries: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    x: usize,
    y: usize,
    #[serde(default)]
    color: Option<[u8; 3]>,
}

const DEFAULT_COLORS: [[u8; 3]; 4] = [[255, 0, 0], [0, 160, 255], [0, 200, 0], [230, 200, 0]];

/// The maps of a catalogue file, keyed `map_<id>`.
#[derive(Debug)]
pub struct MapCatalog {
    maps: BTreeMap<String, RawMap>,
}

impl MapCatalog {
    pub fn from_json(json: &str) -> Result<Self, WorldError> {
        let maps: BTreeMap<String, RawMap> = serde_json::from_str(json)?;
        Ok(MapCatalog { maps })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WorldError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// The catalogue compiled into the crate.
    pub fn builtin() -> Result<Self, WorldError> {
        Self::from_json(BUILTIN_MAPS)
    }

    /// Catalogue keys, in sorted order.
    pub fn map_ids(&self) -> impl Iterator<Item = &str> {
        self.maps.keys().map(String::as_str)
    }

    /// Extracts map `map_<id>` with the first `nb_agents` agent/key/box triples.
    pub fn get(&self, id: u32, nb_agents: usize) -> Result<MapConfig, WorldError> {
        if nb_agents == 0 {
            return Err(WorldError::NoAgents);
        }
        let name = format!("map_{id}");
        let raw = self
            .maps
            .get(&name)
            .ok_or_else(|| WorldError::MissingMap(name.clone()))?;

        let available = (1..)
            .take_while(|i| raw.entries.contains_key(&format!("agent_{i}")))
            .count();
        if available < nb_agents {
            return Err(WorldError::NotEnoughAgents {
                available,
                requested: nb_agents,
            });
        }

        let lookup = |entry: String| -> Result<&RawEntry, WorldError> {
            let found = raw.entries.get(&entry).ok_or_else(|| WorldError::MissingEntry {
                map: name.clone(),
                entry: entry.clone(),
            })?;
            if found.x >= raw.width || found.y >= raw.height {
                return Err(WorldError::OutOfBounds {
                    entry,
                    position: Position::new(found.x, found.y),
                    width: raw.width,
                    height: raw.height,
                });
            }
            Ok(found)
        };

        let mut config = MapConfig {
            width: raw.width,
            height: raw.height,
            agents: Vec::with_capacity(nb_agents),
            keys: Vec::with_capacity(nb_agents),
            boxes: Vec::with_capacity(nb_agents),
        };
        for i in 1..=nb_agents {
            let agent = lookup(format!("agent_{i}"))?;
            config.agents.push(AgentSpawn {
                position: Position::new(agent.x, agent.y),
                color: agent
                    .color
                    .unwrap_or(DEFAULT_COLORS[(i - 1) % DEFAULT_COLORS.len()]),
            });
            let key = lookup(format!("key_{i}"))?;
            config.keys.push(Position::new(key.x, key.y));
            let boxed = lookup(format!("box_{i}"))?;
            config.boxes.push(Position::new(boxed.x, boxed.y));
        }
        Ok(config)
    }
}

/// A key or a box, owned by the agent whose id equals `owner`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub position: Position,
    pub kind: ItemKind,
    pub owner: AgentId,
    /// Value of the first ring; the second ring gets half of it.
    pub neighbour_value: f64,
}

impl Item {
    pub fn new(kind: ItemKind, owner: AgentId, position: Position) -> Self {
        let neighbour_value = match kind {
            ItemKind::Key => KEY_NEIGHBOUR_VALUE,
            ItemKind::Box => BOX_NEIGHBOUR_VALUE,
        };
        Item {
            position,
            kind,
            owner,
            neighbour_value,
        }
    }

    /// Paints the centre and both rings into `values`.
    fn stamp(&self, values: &mut Grid<f64>) {
        for cell in values.square_around(self.position, 2) {
            let value = match cell.chebyshev(&self.position) {
                0 => TARGET_VALUE,
                1 => self.neighbour_value,
                _ => self.neighbour_value / 2.0,
            };
            values.raise(cell, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObstacleCell {
    Free,
    Shell,
    Body,
}

const L_SHAPE: [[ObstacleCell; OBSTACLE_SIZE]; OBSTACLE_SIZE] = {
    use ObstacleCell::{Body as B, Free as F, Shell as S};
    [
        [S, S, S, F, F],
        [S, B, S, F, F],
        [S, B, S, S, S],
        [S, B, B, B, S],
        [S, S, S, S, S],
    ]
};

/// An L-shaped obstacle stamped at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obstacle {
    /// Top-left corner of the stamp window.
    pub origin: Position,
    pub body: Vec<Position>,
    pub shell: Vec<Position>,
}

impl Obstacle {
    /// Builds the L shape at `origin`, rotated by `quarter_turns` * 90 degrees.
    pub fn l_shape(origin: Position, quarter_turns: u8) -> Self {
        let mut body = Vec::new();
        let mut shell = Vec::new();
        let n = OBSTACLE_SIZE;
        for row in 0..n {
            for col in 0..n {
                let (r, c) = match quarter_turns % 4 {
                    0 => (row, col),
                    1 => (col, n - 1 - row),
                    2 => (n - 1 - row, n - 1 - col),
                    _ => (n - 1 - col, row),
                };
                let position = Position::new(origin.x + col, origin.y + row);
                match L_SHAPE[r][c] {
                    ObstacleCell::Body => body.push(position),
                    ObstacleCell::Shell => shell.push(position),
                    ObstacleCell::Free => {}
                }
            }
        }
        Obstacle {
            origin,
            body,
            shell,
        }
    }

    fn stamp(&self, values: &mut Grid<f64>) {
        for cell in &self.shell {
            values.raise(*cell, OBSTACLE_NEIGHBOUR_VALUE);
        }
        for cell in &self.body {
            values.raise(*cell, TARGET_VALUE);
        }
    }
}

/// Everything fixed at load time: the percept grid, spawns, items and obstacles.
#[derive(Debug, Clone)]
pub struct World {
    pub values: Grid<f64>,
    pub spawns: Vec<AgentSpawn>,
    pub keys: Vec<Item>,
    pub boxes: Vec<Item>,
    pub obstacles: Vec<Obstacle>,
}

impl World {
    /// Stamps items, then tries to place `obstacle_count` obstacles on empty 5x5 windows.
    pub fn build<R: Rng>(config: &MapConfig, obstacle_count: usize, rng: &mut R) -> Self {
        let mut values: Grid<f64> = Grid::new(config.width, config.height);
        let keys: Vec<Item> = config
            .keys
            .iter()
            .enumerate()
            .map(|(owner, &position)| Item::new(ItemKind::Key, owner, position))
            .collect();
        let boxes: Vec<Item> = config
            .boxes
            .iter()
            .enumerate()
            .map(|(owner, &position)| Item::new(ItemKind::Box, owner, position))
            .collect();
        for item in keys.iter().chain(boxes.iter()) {
            item.stamp(&mut values);
        }

        let mut world = World {
            values,
            spawns: config.agents.clone(),
            keys,
            boxes,
            obstacles: Vec::with_capacity(obstacle_count),
        };
        for _ in 0..obstacle_count {
            match Self::place_obstacle(&world.values, rng) {
                Some(obstacle) => {
                    debug!(origin = %obstacle.origin, "placed obstacle");
                    world.add_obstacle(obstacle);
                }
                None => warn!(
                    attempts = OBSTACLE_PLACEMENT_ATTEMPTS,
                    "could not place obstacle, skipping"
                ),
            }
        }
        world
    }

    /// Stamps `obstacle` over the current values. Existing stronger readings are kept.
    pub fn add_obstacle(&mut self, obstacle: Obstacle) {
        obstacle.stamp(&mut self.values);
        self.obstacles.push(obstacle);
    }

    fn place_obstacle<R: Rng>(values: &Grid<f64>, rng: &mut R) -> Option<Obstacle> {
        if values.width() < OBSTACLE_SIZE || values.height() < OBSTACLE_SIZE {
            return None;
        }
        for _ in 0..OBSTACLE_PLACEMENT_ATTEMPTS {
            let origin = Position::new(
                rng.random_range(0..=values.width() - OBSTACLE_SIZE),
                rng.random_range(0..=values.height() - OBSTACLE_SIZE),
            );
            let free = (0..OBSTACLE_SIZE).all(|dy| {
                (0..OBSTACLE_SIZE).all(|dx| {
                    values
                        .get(origin.x + dx, origin.y + dy)
                        .is_some_and(|v| *v == 0.0)
                })
            });
            if free {
                return Some(Obstacle::l_shape(origin, rng.random_range(0..4)));
            }
        }
        None
    }
}

const BUILTIN_MAPS: &str = include_str!("../../resources/maps.json");

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::percept::{BOX_OUTER_VALUE, KEY_OUTER_VALUE};

    fn single_key_map() -> MapConfig {
        MapConfig {
            width: 20,
            height: 20,
            agents: vec![AgentSpawn {
                position: Position::new(0, 0),
                color: [255, 0, 0],
            }],
            keys: vec![Position::new(10, 10)],
            boxes: vec![Position::new(16, 3)],
        }
    }

    #[test]
    fn key_rings_are_stamped_around_the_centre() {
        let world = World::build(&single_key_map(), 0, &mut StdRng::seed_from_u64(1));
        let v = &world.values;
        assert_eq!(v[Position::new(10, 10)], 1.0);
        assert_eq!(v[Position::new(11, 11)], KEY_NEIGHBOUR_VALUE);
        assert_eq!(v[Position::new(9, 10)], KEY_NEIGHBOUR_VALUE);
        assert_eq!(v[Position::new(12, 10)], KEY_OUTER_VALUE);
        assert_eq!(v[Position::new(8, 8)], KEY_OUTER_VALUE);
        assert_eq!(v[Position::new(13, 10)], 0.0);
        assert_eq!(v[Position::new(16, 3)], 1.0);
        assert_eq!(v[Position::new(18, 5)], BOX_OUTER_VALUE);
    }

    #[test]
    fn overlapping_rings_never_produce_unknown_values() {
        let config = MapConfig {
            width: 8,
            height: 8,
            agents: vec![AgentSpawn {
                position: Position::new(0, 0),
                color: [0, 0, 0],
            }],
            keys: vec![Position::new(3, 3)],
            boxes: vec![Position::new(4, 4)],
        };
        let world = World::build(&config, 0, &mut StdRng::seed_from_u64(1));
        let allowed = [0.0, 0.25, 0.3, 0.35, 0.5, 0.6, 1.0];
        for (position, value) in world.values.enumerate() {
            assert!(allowed.contains(value), "{position}: {value}");
        }
        assert_eq!(world.values[Position::new(3, 3)], 1.0);
        assert_eq!(world.values[Position::new(4, 4)], 1.0);
    }

    #[test]
    fn obstacles_land_on_empty_windows_only() {
        let mut rng = StdRng::seed_from_u64(42);
        let world = World::build(&single_key_map(), 3, &mut rng);
        assert!(!world.obstacles.is_empty());
        for obstacle in &world.obstacles {
            assert_eq!(obstacle.body.len(), 5);
            assert_eq!(obstacle.shell.len(), 16);
            for cell in &obstacle.body {
                assert_eq!(world.values[*cell], 1.0);
                assert!(world.keys.iter().all(|k| k.position.chebyshev(cell) > 2));
            }
            for cell in &obstacle.shell {
                assert_eq!(world.values[*cell], OBSTACLE_NEIGHBOUR_VALUE);
            }
        }
    }

    #[test]
    fn rotations_keep_the_shape_inside_its_window() {
        for turns in 0..4 {
            let obstacle = Obstacle::l_shape(Position::new(2, 2), turns);
            for cell in obstacle.body.iter().chain(obstacle.shell.iter()) {
                assert!((2..7).contains(&cell.x) && (2..7).contains(&cell.y));
            }
            assert_eq!(obstacle.body.len(), 5);
        }
    }

    #[test]
    fn tiny_maps_skip_obstacles() {
        let config = MapConfig {
            width: 4,
            height: 4,
            agents: vec![AgentSpawn {
                position: Position::new(0, 0),
                color: [0, 0, 0],
            }],
            keys: vec![Position::new(0, 3)],
            boxes: vec![Position::new(3, 0)],
        };
        let world = World::build(&config, 2, &mut StdRng::seed_from_u64(3));
        assert!(world.obstacles.is_empty());
    }

    #[test]
    fn catalogue_extracts_requested_agents() {
        let json = r#"{
            "map_1": {
                "width": 12, "height": 10,
                "agent_1": {"x": 0, "y": 0, "color": [1, 2, 3]},
                "key_1": {"x": 5, "y": 5},
                "box_1": {"x": 9, "y": 2},
                "agent_2": {"x": 11, "y": 9},
                "key_2": {"x": 2, "y": 8},
                "box_2": {"x": 7, "y": 1}
            }
        }"#;
        let catalog = MapCatalog::from_json(json).unwrap();
        let config = catalog.get(1, 2).unwrap();
        assert_eq!((config.width, config.height), (12, 10));
        assert_eq!(config.agents[0].color, [1, 2, 3]);
        assert_eq!(config.agents[1].position, Position::new(11, 9));
        assert_eq!(config.boxes[1], Position::new(7, 1));

        assert!(matches!(
            catalog.get(1, 3),
            Err(WorldError::NotEnoughAgents {
                available: 2,
                requested: 3
            })
        ));
        assert!(matches!(catalog.get(2, 1), Err(WorldError::MissingMap(_))));
    }

    #[test]
    fn catalogue_rejects_out_of_bounds_items() {
        let json = r#"{"map_1": {"width": 5, "height": 5,
            "agent_1": {"x": 0, "y": 0}, "key_1": {"x": 5, "y": 0}, "box_1": {"x": 1, "y": 1}}}"#;
        let catalog = MapCatalog::from_json(json).unwrap();
        assert!(matches!(
            catalog.get(1, 1),
            Err(WorldError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn builtin_catalogue_loads() {
        let catalog = MapCatalog::builtin().unwrap();
        let config = catalog.get(1, 4).unwrap();
        assert_eq!(config.agents.len(), 4);
        let ids: Vec<&str> = catalog.map_ids().collect();
        assert!(ids.contains(&"map_1") && ids.contains(&"map_2"), "{ids:?}");
    }
}
