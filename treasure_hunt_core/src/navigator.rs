//! Exploration waypoints and straight-line step plans.

use std::collections::HashSet;

use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use crate::Position;
use crate::direction::Direction;

/// Candidates drawn per waypoint before generation gives up on further points.
pub const MAX_WAYPOINT_ATTEMPTS: usize = 200;

/// Number of waypoints for one exploration round on a `width` x `height` grid.
pub fn waypoint_count(width: usize, height: usize) -> usize {
    height.div_ceil(10) + width.div_ceil(10)
}

/// Separation used when none is configured: a quarter of the short side, at least 2.
pub fn default_separation(width: usize, height: usize) -> f64 {
    (width.min(height) / 4).max(2) as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Left,
    Right,
    Top,
    Bottom,
}

impl Edge {
    const ALL: [Edge; 4] = [Edge::Left, Edge::Right, Edge::Top, Edge::Bottom];

    fn nearest(position: Position, width: usize, height: usize) -> Edge {
        let distances = [
            (Edge::Left, position.x),
            (Edge::Right, width.saturating_sub(1 + position.x)),
            (Edge::Top, position.y),
            (Edge::Bottom, height.saturating_sub(1 + position.y)),
        ];
        distances
            .into_iter()
            .min_by_key(|&(_, distance)| distance)
            .map_or(Edge::Left, |(edge, _)| edge)
    }

    /// Draws a cell inside the band of width `band` along this edge.
    fn sample<R: Rng>(self, band: usize, width: usize, height: usize, rng: &mut R) -> Position {
        let x_band = band.min(width);
        let y_band = band.min(height);
        match self {
            Edge::Left => Position::new(rng.random_range(0..x_band), rng.random_range(0..height)),
            Edge::Right => Position::new(
                rng.random_range(width - x_band..width),
                rng.random_range(0..height),
            ),
            Edge::Top => Position::new(rng.random_range(0..width), rng.random_range(0..y_band)),
            Edge::Bottom => Position::new(
                rng.random_range(0..width),
                rng.random_range(height - y_band..height),
            ),
        }
    }
}

/// Draws up to `count` edge-biased waypoints.
///
/// Each candidate comes from a band along one of the three edges farthest from `current`
/// (the nearest edge is excluded). A candidate is kept only if it is not forbidden and lies
/// at least `min_separation` from every point kept so far. When a point cannot be placed
/// within [`MAX_WAYPOINT_ATTEMPTS`] draws, fewer points are returned; if none could be
/// placed at all, a single random allowed cell is returned instead. The result is empty only
/// when every cell is forbidden.
pub fn generate_waypoints<R: Rng>(
    rng: &mut R,
    width: usize,
    height: usize,
    current: Position,
    count: usize,
    min_separation: f64,
    forbidden: &HashSet<Position>,
) -> Vec<Position> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let band = (width.min(height) / 5).max(1);
    let nearest = Edge::nearest(current, width, height);
    let edges: Vec<Edge> = Edge::ALL.into_iter().filter(|&e| e != nearest).collect();

    let mut points: Vec<Position> = Vec::with_capacity(count);
    'points: for _ in 0..count {
        for _ in 0..MAX_WAYPOINT_ATTEMPTS {
            let Some(&edge) = edges.choose(rng) else {
                break 'points;
            };
            let candidate = edge.sample(band, width, height, rng);
            if forbidden.contains(&candidate) {
                continue;
            }
            if points
                .iter()
                .all(|p| p.distance(&candidate) >= min_separation)
            {
                points.push(candidate);
                continue 'points;
            }
        }
        debug!(placed = points.len(), count, "waypoint generation stopped early");
        break;
    }

    if points.is_empty() {
        match random_allowed_cell(rng, width, height, forbidden) {
            Some(cell) => points.push(cell),
            None => warn!("every cell is forbidden, no waypoint available"),
        }
    }
    points
}

fn random_allowed_cell<R: Rng>(
    rng: &mut R,
    width: usize,
    height: usize,
    forbidden: &HashSet<Position>,
) -> Option<Position> {
    for _ in 0..MAX_WAYPOINT_ATTEMPTS {
        let cell = Position::new(rng.random_range(0..width), rng.random_range(0..height));
        if !forbidden.contains(&cell) {
            return Some(cell);
        }
    }
    let allowed: Vec<Position> = (0..height)
        .flat_map(|y| (0..width).map(move |x| Position::new(x, y)))
        .filter(|cell| !forbidden.contains(cell))
        .collect();
    allowed.choose(rng).copied()
}

/// Orders `points` greedily: each next point is the one farthest from the previous one,
/// starting from `start`.
pub fn order_farthest_first(mut points: Vec<Position>, start: Position) -> Vec<Position> {
    let mut ordered = Vec::with_capacity(points.len());
    let mut reference = start;
    while !points.is_empty() {
        let mut farthest = 0;
        for (i, point) in points.iter().enumerate().skip(1) {
            if point.distance(&reference) > points[farthest].distance(&reference) {
                farthest = i;
            }
        }
        reference = points.swap_remove(farthest);
        ordered.push(reference);
    }
    ordered
}

/// Straight-line plan from `from` to `to`: diagonal steps while both axes differ, then
/// cardinal steps. The returned points start with `from` and end with `to`.
pub fn step_plan(from: Position, to: Position) -> (Vec<Direction>, Vec<Position>) {
    let mut directions = Vec::with_capacity(from.chebyshev(&to));
    let mut points = Vec::with_capacity(from.chebyshev(&to) + 1);
    let mut current = from;
    points.push(current);
    while current != to {
        let dx = (to.x as isize - current.x as isize).signum();
        let dy = (to.y as isize - current.y as isize).signum();
        let Some(direction) = Direction::from_delta(dx, dy) else {
            break;
        };
        current = Position::new(
            current.x.saturating_add_signed(dx),
            current.y.saturating_add_signed(dy),
        );
        directions.push(direction);
        points.push(current);
    }
    (directions, points)
}
