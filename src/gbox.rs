//! Global cell-grid geometry.
//!
//! A fixed cubic box with periodic boundaries in every direction is split
//! into `Gx * Gy * Gz` uniform cells, `Gi = floor(Li / min_cell_size)` and at
//! least one per axis. Cells are identified by their row-major linearization
//! (x fastest). The 27-cell full-shell neighborhood of a cell is enumerated
//! in a canonical order shared by all partitioning strategies: slot 0 is the
//! cell itself, slots `1..14` the half shell, slots `14..27` the mirrored
//! remainder. Pure geometry; no communication, no mutation.

use crate::error::{GridError, Result};
use crate::index::{FullShellIdx, GlobalCell};

/// Relative round-off admitted when mapping positions to cells.
const ROUND_ERROR_PREC: f64 = 1.0e-14;

/// Canonical full-shell offsets. Slot 0 is the center; slots `1..14` have
/// lexicographically positive `(dz, dy, dx)` and slots `14..27` mirror them
/// in the same order, so slot `k + 13` is the negation of slot `k`.
pub const FULL_SHELL_OFFSETS: [[i32; 3]; 27] = [
    [0, 0, 0],
    // half shell
    [1, 0, 0],
    [-1, 1, 0],
    [0, 1, 0],
    [1, 1, 0],
    [-1, -1, 1],
    [0, -1, 1],
    [1, -1, 1],
    [-1, 0, 1],
    [0, 0, 1],
    [1, 0, 1],
    [-1, 1, 1],
    [0, 1, 1],
    [1, 1, 1],
    // mirrored remainder
    [-1, 0, 0],
    [1, -1, 0],
    [0, -1, 0],
    [-1, -1, 0],
    [1, 1, -1],
    [0, 1, -1],
    [-1, 1, -1],
    [1, 0, -1],
    [0, 0, -1],
    [-1, 0, -1],
    [1, -1, -1],
    [0, -1, -1],
    [-1, -1, -1],
];

/// Immutable global box geometry shared by all strategies.
#[derive(Clone, Debug)]
pub struct GlobalBox {
    box_size: [f64; 3],
    grid: [u32; 3],
    cell: [f64; 3],
    inv_cell: [f64; 3],
}

impl GlobalBox {
    pub fn new(box_size: [f64; 3], min_cell_size: f64) -> Result<Self> {
        if !(min_cell_size > 0.0) {
            return Err(GridError::InvalidGeometry("minimum cell size must be positive"));
        }
        if box_size.iter().any(|&l| !(l > 0.0)) {
            return Err(GridError::InvalidGeometry("box extents must be positive"));
        }
        let mut grid = [1u32; 3];
        let mut cell = [0.0f64; 3];
        let mut inv_cell = [0.0f64; 3];
        for d in 0..3 {
            grid[d] = ((box_size[d] / min_cell_size).floor() as u32).max(1);
            cell[d] = box_size[d] / grid[d] as f64;
            inv_cell[d] = 1.0 / cell[d];
        }
        Ok(GlobalBox {
            box_size,
            grid,
            cell,
            inv_cell,
        })
    }

    #[inline]
    pub fn box_size(&self) -> [f64; 3] {
        self.box_size
    }

    #[inline]
    pub fn grid_size(&self) -> [u32; 3] {
        self.grid
    }

    #[inline]
    pub fn cell_size(&self) -> [f64; 3] {
        self.cell
    }

    /// Total number of cells in the grid.
    #[inline]
    pub fn n_cells(&self) -> u64 {
        self.grid.iter().map(|&g| g as u64).product()
    }

    /// Row-major linearization, x fastest.
    #[inline]
    pub fn linearize(&self, c: [u32; 3]) -> GlobalCell {
        debug_assert!(c[0] < self.grid[0] && c[1] < self.grid[1] && c[2] < self.grid[2]);
        let [gx, gy, _] = self.grid;
        GlobalCell::new(c[0] as u64 + gx as u64 * (c[1] as u64 + gy as u64 * c[2] as u64))
    }

    #[inline]
    pub fn unlinearize(&self, c: GlobalCell) -> [u32; 3] {
        let [gx, gy, _] = self.grid;
        let idx = c.get();
        [
            (idx % gx as u64) as u32,
            (idx / gx as u64 % gy as u64) as u32,
            (idx / (gx as u64 * gy as u64)) as u32,
        ]
    }

    /// Maps a position to its cell.
    ///
    /// Positions within `0.5 * 1e-14 * L` outside the box are attributed to
    /// the nearest boundary cell; anything further out is rejected.
    pub fn cell_at(&self, pos: [f64; 3]) -> Result<GlobalCell> {
        let mut coords = [0u32; 3];
        for d in 0..3 {
            let mut p = pos[d];
            let err_margin = 0.5 * ROUND_ERROR_PREC * self.box_size[d];
            if p < 0.0 && p > -err_margin {
                p = 0.0;
            } else if p >= self.box_size[d] && p < self.box_size[d] + err_margin {
                p -= 0.5 * self.cell[d];
            }
            if p < 0.0 || p >= self.box_size[d] {
                return Err(GridError::OutOfBox { pos });
            }
            coords[d] = ((p * self.inv_cell[d]) as u32).min(self.grid[d] - 1);
        }
        Ok(self.linearize(coords))
    }

    /// Center position of a cell.
    pub fn cell_center(&self, c: GlobalCell) -> [f64; 3] {
        let coords = self.unlinearize(c);
        [
            (coords[0] as f64 + 0.5) * self.cell[0],
            (coords[1] as f64 + 0.5) * self.cell[1],
            (coords[2] as f64 + 0.5) * self.cell[2],
        ]
    }

    #[inline]
    fn wrap(&self, x: i64, d: usize) -> u32 {
        let g = self.grid[d] as i64;
        x.rem_euclid(g) as u32
    }

    /// The `k`-th full-shell neighbor of `c` under periodic wrap.
    pub fn neighbor(&self, c: GlobalCell, k: FullShellIdx) -> GlobalCell {
        let coords = self.unlinearize(c);
        let off = FULL_SHELL_OFFSETS[k.get() as usize];
        self.linearize([
            self.wrap(coords[0] as i64 + off[0] as i64, 0),
            self.wrap(coords[1] as i64 + off[1] as i64, 1),
            self.wrap(coords[2] as i64 + off[2] as i64, 2),
        ])
    }

    /// All 27 full-shell cells of `c`, canonical slot order, `c` first.
    pub fn full_shell(&self, c: GlobalCell) -> [GlobalCell; 27] {
        let mut out = [c; 27];
        for k in FullShellIdx::shell() {
            out[k.get() as usize] = self.neighbor(c, k);
        }
        out
    }

    /// The 26 shell cells of `c`, canonical slot order.
    pub fn shell(&self, c: GlobalCell) -> [GlobalCell; 26] {
        let mut out = [c; 26];
        for k in FullShellIdx::shell() {
            out[k.get() as usize - 1] = self.neighbor(c, k);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_form_a_mirrored_full_shell() {
        // Every nonzero offset appears exactly once, and the second half
        // mirrors the first.
        let mut seen = std::collections::HashSet::new();
        for off in FULL_SHELL_OFFSETS {
            assert!(seen.insert(off));
            assert!(off.iter().all(|&o| (-1..=1).contains(&o)));
        }
        assert_eq!(seen.len(), 27);
        for k in 1..14 {
            let a = FULL_SHELL_OFFSETS[k];
            let b = FULL_SHELL_OFFSETS[k + 13];
            assert_eq!([a[0] + b[0], a[1] + b[1], a[2] + b[2]], [0, 0, 0]);
        }
    }

    #[test]
    fn grid_dimensions_from_box() {
        let g = GlobalBox::new([1.0, 1.0, 1.0], 0.1).unwrap();
        assert_eq!(g.grid_size(), [10, 10, 10]);
        assert_eq!(g.n_cells(), 1000);
        for d in 0..3 {
            assert!((g.cell_size()[d] * g.grid_size()[d] as f64 - 1.0).abs() < 1e-12);
        }

        let g = GlobalBox::new([8.0, 4.0, 2.0], 1.9).unwrap();
        assert_eq!(g.grid_size(), [4, 2, 1]);
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert!(GlobalBox::new([1.0, 1.0, 1.0], 0.0).is_err());
        assert!(GlobalBox::new([0.0, 1.0, 1.0], 0.1).is_err());
    }

    #[test]
    fn linearize_roundtrip() {
        let g = GlobalBox::new([4.0, 3.0, 2.0], 1.0).unwrap();
        for z in 0..2 {
            for y in 0..3 {
                for x in 0..4 {
                    let c = g.linearize([x, y, z]);
                    assert_eq!(g.unlinearize(c), [x, y, z]);
                }
            }
        }
        // x is the fastest axis.
        assert_eq!(g.linearize([1, 0, 0]).get(), 1);
        assert_eq!(g.linearize([0, 1, 0]).get(), 4);
        assert_eq!(g.linearize([0, 0, 1]).get(), 12);
    }

    #[test]
    fn position_mapping_and_tolerance() {
        let g = GlobalBox::new([1.0, 1.0, 1.0], 0.1).unwrap();
        assert_eq!(g.cell_at([0.0, 0.0, 0.0]).unwrap(), g.linearize([0, 0, 0]));
        assert_eq!(
            g.cell_at([0.95, 0.05, 0.55]).unwrap(),
            g.linearize([9, 0, 5])
        );
        // Round-off below zero clamps to the box.
        assert_eq!(
            g.cell_at([-1e-16, 0.5, 0.5]).unwrap(),
            g.linearize([0, 5, 5])
        );
        // Round-off on the upper boundary lands in the last cell.
        assert_eq!(
            g.cell_at([1.0 + 1e-16, 0.5, 0.5]).unwrap(),
            g.linearize([9, 5, 5])
        );
        // Clearly outside is an error.
        assert!(matches!(
            g.cell_at([1.5, 0.5, 0.5]),
            Err(GridError::OutOfBox { .. })
        ));
        assert!(matches!(
            g.cell_at([-0.2, 0.5, 0.5]),
            Err(GridError::OutOfBox { .. })
        ));
    }

    #[test]
    fn neighbors_wrap_periodically() {
        let g = GlobalBox::new([3.0, 3.0, 3.0], 1.0).unwrap();
        let corner = g.linearize([0, 0, 0]);
        let shell = g.full_shell(corner);
        assert_eq!(shell[0], corner);
        // Slot 14 mirrors slot 1 (+x): the -x neighbor wraps to x = 2.
        assert_eq!(shell[14], g.linearize([2, 0, 0]));
        // All 27 shell cells of a 3x3x3 grid are distinct: the shell covers
        // the whole grid.
        let distinct: std::collections::HashSet<_> = shell.iter().collect();
        assert_eq!(distinct.len(), 27);
    }

    #[test]
    fn shell_matches_full_shell_without_center() {
        let g = GlobalBox::new([5.0, 4.0, 3.0], 1.0).unwrap();
        let c = g.linearize([2, 1, 1]);
        let full = g.full_shell(c);
        let shell = g.shell(c);
        assert_eq!(&full[1..], &shell[..]);
    }
}
