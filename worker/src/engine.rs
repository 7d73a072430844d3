//! The strip engine: evolves the rows of a halo one generation forward.

use lattice_protocol::{BitBoard, Fragment, Halo};

/// A halo decoded into a flat grid. Neighbour lookups wrap over the halo's
/// own dimensions, which equals board wrapping whenever a neighbour row is
/// actually outside the halo's strip.
struct Grid {
    cells: Vec<bool>,
    rows: usize,
    cols: usize,
}

impl Grid {
    fn get(&self, x: usize, y: usize) -> bool {
        self.cells[y * self.cols + x]
    }

    fn alive_neighbours(&self, x: usize, y: usize) -> u8 {
        let mut count = 0;
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = (x as i64 + dx).rem_euclid(self.cols as i64) as usize;
                let ny = (y as i64 + dy).rem_euclid(self.rows as i64) as usize;
                if self.get(nx, ny) {
                    count += 1;
                }
            }
        }
        count
    }

    /// The standard transition rule: survive on 2 or 3 neighbours, spawn
    /// on exactly 3.
    fn next_cell_state(&self, x: usize, y: usize) -> bool {
        let neighbours = self.alive_neighbours(x, y);
        if self.get(x, y) {
            neighbours == 2 || neighbours == 3
        } else {
            neighbours == 3
        }
    }
}

/// Compute the next generation of the halo's strip, fanning the rows out
/// over `threads` contiguous sub-strips. `threads` is clamped to the strip
/// height; the reply carries the strip's absolute row range.
pub fn evolve(halo: &Halo, threads: usize) -> Fragment {
    let grid = Grid {
        cells: halo.bitboard.to_cells(),
        rows: halo.bitboard.num_rows,
        cols: halo.bitboard.row_length,
    };
    let strip_rows = halo.end_ptr - halo.start_ptr;
    let width = grid.cols;
    let threads = threads.clamp(1, strip_rows);

    let mut out = vec![false; strip_rows * width];
    let base = strip_rows / threads;
    let rem = strip_rows % threads;

    rayon::scope(|scope| {
        let grid = &grid;
        let mut rest = out.as_mut_slice();
        let mut first_row = 0;
        for i in 0..threads {
            let rows = if i == threads - 1 { base + rem } else { base };
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(rows * width);
            rest = tail;
            let offset = halo.offset;
            scope.spawn(move |_| {
                for (r, row_out) in chunk.chunks_mut(width).enumerate() {
                    let y = first_row + r + offset;
                    for (x, cell) in row_out.iter_mut().enumerate() {
                        *cell = grid.next_cell_state(x, y);
                    }
                }
            });
            first_row += rows;
        }
    });

    Fragment {
        start_row: halo.start_ptr,
        end_row: halo.end_ptr,
        bitboard: BitBoard::from_cells(&out, strip_rows, width),
    }
}
