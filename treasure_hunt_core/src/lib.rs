use serde::{Deserialize, Serialize};

pub mod client;
pub mod config;
pub mod direction;
pub mod engine;
pub mod link;
pub mod map;
pub mod navigator;
pub mod percept;
pub mod protocol;
pub mod search;
pub mod server;
pub mod world;

/// Identifier of an agent inside a session, in `[0, n)`.
///
/// Keys and boxes are indexed by the same id: `key_i` and `box_i` belong to agent `i`.
pub type AgentId = usize;

/// Represents a 2D coordinate.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub x: usize,
    pub y: usize,
}

impl Position {
    pub const fn new(x: usize, y: usize) -> Self {
        Position { x, y }
    }

    /// Euclidean distance between two cells.
    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        (dx * dx + dy * dy).sqrt()
    }

    /// Chebyshev distance, i.e. the number of 8-directional steps between two cells.
    pub fn chebyshev(&self, other: &Position) -> usize {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The two kinds of hidden item every agent owns one of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemKind {
    Key,
    Box,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Key => write!(f, "key"),
            ItemKind::Box => write!(f, "box"),
        }
    }
}

/// Acquires a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves the guarded state consistent before it
/// can panic, so a poisoned lock is still safe to read.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
