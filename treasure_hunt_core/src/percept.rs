//! Classification of the scalar signal an agent reads at its cell.
//!
//! The engine paints each item and obstacle with concentric rings of fixed values, so an
//! agent can tell what it is close to by exact comparison against those constants.

/// Value of the cells directly adjacent to a key.
pub const KEY_NEIGHBOUR_VALUE: f64 = 0.5;
/// Value of the second ring around a key.
pub const KEY_OUTER_VALUE: f64 = 0.25;
/// Value of the cells directly adjacent to a box.
pub const BOX_NEIGHBOUR_VALUE: f64 = 0.6;
/// Value of the second ring around a box.
pub const BOX_OUTER_VALUE: f64 = 0.3;
/// Value of the shell around an obstacle.
pub const OBSTACLE_NEIGHBOUR_VALUE: f64 = 0.35;
/// Value of an item centre or an obstacle body cell.
pub const TARGET_VALUE: f64 = 1.0;

/// Semantic category of a percept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Percept {
    Empty,
    KeyNeighbour,
    KeyOuter,
    BoxNeighbour,
    BoxOuter,
    ObstacleNeighbour,
    Target,
    /// The reading failed (timeout, malformed reply).
    Unknown,
}

impl Percept {
    /// Classifies a successful reading. Total: anything that is not a known constant is
    /// [`Percept::Empty`], NaN included.
    pub fn from_value(value: f64) -> Percept {
        if value == TARGET_VALUE {
            Percept::Target
        } else if value == KEY_NEIGHBOUR_VALUE {
            Percept::KeyNeighbour
        } else if value == KEY_OUTER_VALUE {
            Percept::KeyOuter
        } else if value == BOX_NEIGHBOUR_VALUE {
            Percept::BoxNeighbour
        } else if value == BOX_OUTER_VALUE {
            Percept::BoxOuter
        } else if value == OBSTACLE_NEIGHBOUR_VALUE {
            Percept::ObstacleNeighbour
        } else {
            Percept::Empty
        }
    }

    /// Classifies a reading that may have failed.
    pub fn classify(reading: Option<f64>) -> Percept {
        reading.map_or(Percept::Unknown, Percept::from_value)
    }

    /// The category used for transitions; a failed reading counts as no signal.
    pub fn effective(self) -> Percept {
        match self {
            Percept::Unknown => Percept::Empty,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_constants_map_to_their_category() {
        assert_eq!(Percept::from_value(1.0), Percept::Target);
        assert_eq!(Percept::from_value(0.5), Percept::KeyNeighbour);
        assert_eq!(Percept::from_value(0.25), Percept::KeyOuter);
        assert_eq!(Percept::from_value(0.6), Percept::BoxNeighbour);
        assert_eq!(Percept::from_value(0.3), Percept::BoxOuter);
        assert_eq!(Percept::from_value(0.35), Percept::ObstacleNeighbour);
        assert_eq!(Percept::from_value(0.0), Percept::Empty);
    }

    #[test]
    fn outer_rings_are_half_the_neighbour_value() {
        assert_eq!(KEY_NEIGHBOUR_VALUE / 2.0, KEY_OUTER_VALUE);
        assert_eq!(BOX_NEIGHBOUR_VALUE / 2.0, BOX_OUTER_VALUE);
    }

    #[test]
    fn everything_else_is_empty() {
        for value in [0.1, 0.49, 0.51, 0.99, 1.5, -1.0, f64::NAN, f64::INFINITY] {
            assert_eq!(Percept::from_value(value), Percept::Empty, "{value}");
        }
    }

    #[test]
    fn classification_is_deterministic() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let value: f64 = rng.random();
            let first = Percept::from_value(value);
            assert_eq!(first, Percept::from_value(value));
            assert_ne!(first, Percept::Unknown);
        }
    }

    #[test]
    fn failed_reads_are_unknown_but_act_as_empty() {
        assert_eq!(Percept::classify(None), Percept::Unknown);
        assert_eq!(Percept::classify(None).effective(), Percept::Empty);
        assert_eq!(Percept::classify(Some(0.5)), Percept::KeyNeighbour);
    }
}
