use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::Position;

/// A dense 2D grid stored row-major in a flat vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid<T> {
    width: usize,
    height: usize,
    cells: Vec<T>,
}

impl<T> Grid<T> {
    /// Creates a new grid with the specified dimensions, filled with default values.
    ///
    /// # Panics
    ///
    /// Panics if `width * height` overflows `usize`.
    pub fn new(width: usize, height: usize) -> Self
    where
        T: Default + Clone,
    {
        let size = width.checked_mul(height).expect("Grid size overflow");
        Grid {
            width,
            height,
            cells: vec![T::default(); size],
        }
    }

    /// Returns the width of the grid.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns the height of the grid.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of cells in the grid.
    #[inline]
    pub fn area(&self) -> usize {
        self.cells.len()
    }

    /// Converts (x, y) coordinates to a flat vector index.
    #[inline]
    fn coords_to_index(&self, x: usize, y: usize) -> Option<usize> {
        self.is_valid(x, y).then(|| y * self.width + x)
    }

    /// Checks if the given coordinates are within the grid boundaries.
    #[inline]
    pub fn is_valid(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }

    /// Same as [`Grid::is_valid`], for a [`Position`].
    #[inline]
    pub fn contains(&self, position: Position) -> bool {
        self.is_valid(position.x, position.y)
    }

    /// Gets a reference to the cell at `(x, y)`, or `None` out of bounds.
    pub fn get(&self, x: usize, y: usize) -> Option<&T> {
        self.coords_to_index(x, y).map(|index| &self.cells[index])
    }

    /// Gets a mutable reference to the cell at `(x, y)`, or `None` out of bounds.
    pub fn get_mut(&mut self, x: usize, y: usize) -> Option<&mut T> {
        let index = self.coords_to_index(x, y)?;
        Some(&mut self.cells[index])
    }

    /// Returns an iterator that yields `(Position, &T)` for each cell in row-major order.
    pub fn enumerate(&self) -> impl Iterator<Item = (Position, &T)> {
        let width = self.width;
        self.cells.iter().enumerate().map(move |(index, cell)| {
            (
                Position {
                    x: index % width,
                    y: index / width,
                },
                cell,
            )
        })
    }

    /// In-bounds cells whose Chebyshev distance to `center` is at most `radius`,
    /// `center` included. Cells falling off the grid are skipped.
    pub fn square_around(&self, center: Position, radius: usize) -> Vec<Position> {
        if !self.contains(center) {
            return Vec::new();
        }
        let x0 = center.x.saturating_sub(radius);
        let y0 = center.y.saturating_sub(radius);
        let x1 = center.x.saturating_add(radius).min(self.width - 1);
        let y1 = center.y.saturating_add(radius).min(self.height - 1);
        (y0..=y1)
            .flat_map(|y| (x0..=x1).map(move |x| Position { x, y }))
            .collect()
    }
}

impl Grid<f64> {
    /// Raises the cell to `value` if it is currently lower; an off-grid position is ignored.
    ///
    /// Overlapping stamps therefore keep the strongest signal, and a cell never leaves the
    /// set of values that were stamped into it.
    pub fn raise(&mut self, position: Position, value: f64) {
        if let Some(cell) = self.get_mut(position.x, position.y) {
            if value > *cell {
                *cell = value;
            }
        }
    }
}

impl<T> Index<Position> for Grid<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: Position) -> &Self::Output {
        match self.coords_to_index(index.x, index.y) {
            Some(idx) => &self.cells[idx],
            None => panic!(
                "Grid index {} out of bounds for grid size ({}, {})",
                index, self.width, self.height
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_outside_is_none() {
        let mut grid: Grid<u8> = Grid::new(3, 2);
        assert_eq!(grid.get(3, 0), None);
        assert_eq!(grid.get(2, 2), None);
        *grid.get_mut(2, 1).unwrap() = 7;
        assert_eq!(grid[Position::new(2, 1)], 7);
        assert_eq!(grid.area(), 6);
    }

    #[test]
    fn enumerate_is_row_major() {
        let grid: Grid<u8> = Grid::new(2, 2);
        let positions: Vec<Position> = grid.enumerate().map(|(p, _)| p).collect();
        assert_eq!(
            positions,
            vec![
                Position::new(0, 0),
                Position::new(1, 0),
                Position::new(0, 1),
                Position::new(1, 1)
            ]
        );
    }

    #[test]
    fn square_around_clips_at_edges() {
        let grid: Grid<u8> = Grid::new(10, 10);
        assert_eq!(grid.square_around(Position::new(5, 5), 1).len(), 9);
        assert_eq!(grid.square_around(Position::new(0, 0), 1).len(), 4);
        assert_eq!(grid.square_around(Position::new(9, 0), 2).len(), 9);
    }

    #[test]
    fn raise_keeps_the_strongest_value() {
        let mut grid: Grid<f64> = Grid::new(3, 3);
        let center = Position::new(1, 1);
        grid.raise(center, 0.5);
        grid.raise(center, 0.25);
        grid.raise(Position::new(5, 0), 1.0);
        assert_eq!(grid[center], 0.5);
        grid.raise(center, 1.0);
        assert_eq!(grid[Position::new(1, 1)], 1.0);
    }
}
