use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bitboard::BitBoard;
use crate::types::Halo;

/// A single cell coordinate. `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: usize,
    pub y: usize,
}

/// A toroidal grid of cells, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub width: usize,
    pub height: usize,
    cells: Vec<bool>,
}

impl Board {
    /// An all-dead board.
    pub fn new(width: usize, height: usize) -> Self {
        Board {
            width,
            height,
            cells: vec![false; width * height],
        }
    }

    pub fn from_cells(cells: Vec<bool>, width: usize, height: usize) -> Self {
        debug_assert_eq!(cells.len(), width * height);
        Board {
            width,
            height,
            cells,
        }
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        self.cells[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, alive: bool) {
        self.cells[y * self.width + x] = alive;
    }

    pub fn cells(&self) -> &[bool] {
        &self.cells
    }

    pub fn row(&self, y: usize) -> &[bool] {
        &self.cells[y * self.width..(y + 1) * self.width]
    }

    /// Overwrite rows `[start, end)` from a flat row-major slice.
    pub fn copy_rows(&mut self, start: usize, end: usize, rows: &[bool]) {
        debug_assert_eq!(rows.len(), (end - start) * self.width);
        self.cells[start * self.width..end * self.width].copy_from_slice(rows);
    }

    pub fn alive_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// All alive cells in row-major order.
    pub fn alive_cells(&self) -> Vec<Cell> {
        let mut alive = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    alive.push(Cell { x, y });
                }
            }
        }
        alive
    }

    /// Re-seed the board in place with roughly `ratio` alive cells.
    pub fn randomise<R: Rng>(&mut self, rng: &mut R, ratio: f32) {
        for cell in &mut self.cells {
            *cell = rng.gen::<f32>() < ratio;
        }
    }

    pub fn to_bitboard(&self) -> BitBoard {
        BitBoard::from_cells(&self.cells, self.height, self.width)
    }

    pub fn from_bitboard(b: &BitBoard) -> Self {
        Board::from_cells(b.to_cells(), b.row_length, b.num_rows)
    }

    /// Build the halo for the strip `[start, end)`: the strip's own rows plus
    /// one wrap-aware neighbour row above and below. Neighbour rows are
    /// omitted when the strip already spans the whole board, so no row is
    /// ever duplicated. `offset` marks where the strip begins inside the
    /// halo.
    pub fn halo(&self, start: usize, end: usize) -> Halo {
        let up = (start + self.height - 1) % self.height;
        let down = end % self.height;

        let mut rows: Vec<bool> =
            Vec::with_capacity((end - start + 2) * self.width);
        let mut offset = 0;

        if up != (end + self.height - 1) % self.height {
            rows.extend_from_slice(self.row(up));
            offset = 1;
        }
        for y in start..end {
            rows.extend_from_slice(self.row(y));
        }
        if down != start {
            rows.extend_from_slice(self.row(down));
        }

        let num_rows = rows.len() / self.width;
        Halo {
            bitboard: BitBoard::from_cells(&rows, num_rows, self.width),
            offset,
            start_ptr: start,
            end_ptr: end,
        }
    }
}
