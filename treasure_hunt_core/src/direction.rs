use serde::{Deserialize, Serialize};

use crate::Position;

/// One of the nine moves an agent may request.
///
/// The wire code of each variant is fixed and shared by the engine and every agent:
/// `0` stand, `1..=4` left/right/up/down, `5..=8` up-left/up-right/down-left/down-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Direction {
    Stand,
    Left,
    Right,
    Up,
    Down,
    UpLeft,
    UpRight,
    DownLeft,
    DownRight,
}

impl Direction {
    /// Every direction that actually moves, in wire-code order.
    pub const MOVES: [Direction; 8] = [
        Direction::Left,
        Direction::Right,
        Direction::Up,
        Direction::Down,
        Direction::UpLeft,
        Direction::UpRight,
        Direction::DownLeft,
        Direction::DownRight,
    ];

    pub fn code(self) -> u8 {
        match self {
            Direction::Stand => 0,
            Direction::Left => 1,
            Direction::Right => 2,
            Direction::Up => 3,
            Direction::Down => 4,
            Direction::UpLeft => 5,
            Direction::UpRight => 6,
            Direction::DownLeft => 7,
            Direction::DownRight => 8,
        }
    }

    /// Returns `None` for codes outside `0..=8`.
    pub fn from_code(code: u8) -> Option<Direction> {
        Some(match code {
            0 => Direction::Stand,
            1 => Direction::Left,
            2 => Direction::Right,
            3 => Direction::Up,
            4 => Direction::Down,
            5 => Direction::UpLeft,
            6 => Direction::UpRight,
            7 => Direction::DownLeft,
            8 => Direction::DownRight,
            _ => return None,
        })
    }

    /// `(dx, dy)` of the move; `y` grows downwards.
    pub fn delta(self) -> (isize, isize) {
        match self {
            Direction::Stand => (0, 0),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::UpLeft => (-1, -1),
            Direction::UpRight => (1, -1),
            Direction::DownLeft => (-1, 1),
            Direction::DownRight => (1, 1),
        }
    }

    /// Inverse of [`Direction::delta`] for unit steps.
    pub fn from_delta(dx: isize, dy: isize) -> Option<Direction> {
        Some(match (dx, dy) {
            (0, 0) => Direction::Stand,
            (-1, 0) => Direction::Left,
            (1, 0) => Direction::Right,
            (0, -1) => Direction::Up,
            (0, 1) => Direction::Down,
            (-1, -1) => Direction::UpLeft,
            (1, -1) => Direction::UpRight,
            (-1, 1) => Direction::DownLeft,
            (1, 1) => Direction::DownRight,
            _ => return None,
        })
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Stand => Direction::Stand,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::UpLeft => Direction::DownRight,
            Direction::DownRight => Direction::UpLeft,
            Direction::UpRight => Direction::DownLeft,
            Direction::DownLeft => Direction::UpRight,
        }
    }

    /// The direction 90 degrees clockwise on screen.
    pub fn clockwise(self) -> Direction {
        match self {
            Direction::Stand => Direction::Stand,
            Direction::Left => Direction::Up,
            Direction::Up => Direction::Right,
            Direction::Right => Direction::Down,
            Direction::Down => Direction::Left,
            Direction::UpLeft => Direction::UpRight,
            Direction::UpRight => Direction::DownRight,
            Direction::DownRight => Direction::DownLeft,
            Direction::DownLeft => Direction::UpLeft,
        }
    }

    /// Applies the move to `from`, or `None` if the result leaves a `width` x `height` grid.
    pub fn apply(self, from: Position, width: usize, height: usize) -> Option<Position> {
        let (dx, dy) = self.delta();
        let x = from.x.checked_add_signed(dx)?;
        let y = from.y.checked_add_signed(dy)?;
        (x < width && y < height).then_some(Position { x, y })
    }
}

impl From<Direction> for u8 {
    fn from(direction: Direction) -> u8 {
        direction.code()
    }
}

impl TryFrom<u8> for Direction {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Direction::from_code(code).ok_or_else(|| format!("invalid direction code {code}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_and_reject_out_of_range() {
        for code in 0..=8u8 {
            let direction = Direction::from_code(code).unwrap();
            assert_eq!(direction.code(), code);
        }
        assert_eq!(Direction::from_code(9), None);
        assert_eq!(Direction::from_code(255), None);
    }

    #[test]
    fn opposite_cancels_delta() {
        for direction in Direction::MOVES {
            let (dx, dy) = direction.delta();
            let (ox, oy) = direction.opposite().delta();
            assert_eq!((dx + ox, dy + oy), (0, 0), "{direction:?}");
            assert_eq!(direction.opposite().opposite(), direction);
        }
    }

    #[test]
    fn clockwise_is_a_quarter_turn() {
        for direction in Direction::MOVES {
            let (dx, dy) = direction.delta();
            // screen coordinates: clockwise (dx, dy) -> (-dy, dx)
            assert_eq!(direction.clockwise().delta(), (-dy, dx), "{direction:?}");
        }
        assert_eq!(Direction::Left.clockwise(), Direction::Up);
        assert_eq!(Direction::DownLeft.clockwise(), Direction::UpLeft);
    }

    #[test]
    fn apply_respects_bounds() {
        let origin = Position::new(0, 0);
        assert_eq!(Direction::Left.apply(origin, 5, 5), None);
        assert_eq!(Direction::Up.apply(origin, 5, 5), None);
        assert_eq!(
            Direction::DownRight.apply(origin, 5, 5),
            Some(Position::new(1, 1))
        );
        assert_eq!(Direction::Right.apply(Position::new(4, 2), 5, 5), None);
    }
}
