//! Space-filling-curve partitioning.
//!
//! The cell grid is embedded in a cube of side `2^level` and enumerated
//! along the 3d Morton curve; every rank owns a contiguous interval of that
//! enumeration, described by a replicated array of first Morton codes. For
//! this strategy the global identity of a cell *is* its Morton code.
//! Redistribution assigns cell `i` to rank `min(nprocs - 1,
//! floor(prefix(i) / target))` over the weight prefix sum; a rank left
//! without cells is a fatal error. Per-cell shell records (inner, boundary
//! or ghost, owner, coordinates) are rebuilt after every redistribution.

use std::sync::Arc;

use crate::comm::collectives::{all_gather_pod, all_reduce_vec_sum_u64};
use crate::comm::{Communicator, REPART_TAGS};
use crate::ensure;
use crate::error::{GridError, Result};
use crate::exchange::{build_subdomain, GhostExchangeDesc, Subdomain};
use crate::gbox::{GlobalBox, FULL_SHELL_OFFSETS};
use crate::index::{CellIndex, FullShellIdx, GlobalCell, LocalCell, Rank};

use super::{Metric, StartCallback};

/// Bit-interleaved Morton code of a coordinate triple, x in the lowest bit.
pub(crate) fn morton_encode(c: [u32; 3]) -> u64 {
    fn spread(mut x: u64) -> u64 {
        x &= 0x1f_ffff; // 21 bits per axis
        x = (x | (x << 32)) & 0x1f00000000ffff;
        x = (x | (x << 16)) & 0x1f0000ff0000ff;
        x = (x | (x << 8)) & 0x100f00f00f00f00f;
        x = (x | (x << 4)) & 0x10c30c30c30c30c3;
        x = (x | (x << 2)) & 0x1249249249249249;
        x
    }
    spread(c[0] as u64) | (spread(c[1] as u64) << 1) | (spread(c[2] as u64) << 2)
}

/// Inverse of [`morton_encode`].
pub(crate) fn morton_decode(m: u64) -> [u32; 3] {
    fn compact(mut x: u64) -> u32 {
        x &= 0x1249249249249249;
        x = (x | (x >> 2)) & 0x10c30c30c30c30c3;
        x = (x | (x >> 4)) & 0x100f00f00f00f00f;
        x = (x | (x >> 8)) & 0x1f0000ff0000ff;
        x = (x | (x >> 16)) & 0x1f00000000ffff;
        x = (x | (x >> 32)) & 0x1f_ffff;
        x as u32
    }
    [compact(m), compact(m >> 1), compact(m >> 2)]
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CellKind {
    /// Local cell with a fully local shell.
    Inner,
    /// Local cell with at least one foreign shell neighbor.
    Boundary,
    /// Foreign cell cached in the ghost layer.
    Ghost,
}

/// Per-cell record of the shell bookkeeping, one per known cell.
#[derive(Copy, Clone, Debug)]
struct ShellCell {
    coords: [u32; 3],
    owner: Rank,
    kind: CellKind,
}

/// Grid with Morton-interval ownership.
pub struct SfcGrid<C: Communicator> {
    comm: Arc<C>,
    gbox: GlobalBox,
    /// Morton codes of all cells, ascending; the curve enumeration over the
    /// smallest `2^level` cube covering the grid.
    sorted_morton: Vec<u64>,
    /// Index of each rank's first cell on the curve, plus a sentinel.
    first_cell: Vec<usize>,
    /// First Morton code per rank, for box-wide owner lookup.
    first_morton: Vec<u64>,
    sub: Subdomain,
    shells: Vec<ShellCell>,
    /// Resolved shell neighbors per local cell, canonical slot order.
    neighbor_cache: Vec<[CellIndex; 26]>,
}

impl<C: Communicator> SfcGrid<C> {
    pub fn new(comm: Arc<C>, gbox: GlobalBox) -> Result<Self> {
        let nprocs = comm.size();
        let n = gbox.n_cells();
        if n < nprocs as u64 {
            return Err(GridError::TooManyRanks {
                n_cells: n,
                n_ranks: nprocs as u32,
            });
        }

        let grid = gbox.grid_size();
        let max_axis = grid.iter().copied().max().unwrap();
        // Smallest embedding level with 2^level covering the largest axis.
        let level = 32 - (max_axis - 1).leading_zeros();
        ensure!(level <= 21, "grid axis too large for the Morton range");

        let mut sorted_morton = Vec::with_capacity(n as usize);
        for z in 0..grid[2] {
            for y in 0..grid[1] {
                for x in 0..grid[0] {
                    sorted_morton.push(morton_encode([x, y, z]));
                }
            }
        }
        sorted_morton.sort_unstable();
        debug_assert!(sorted_morton.last().copied().unwrap_or(0) < 1u64 << (3 * level));

        let first_cell: Vec<usize> = (0..=nprocs)
            .map(|r| (r as u64 * n / nprocs as u64) as usize)
            .collect();

        let mut grid_obj = SfcGrid {
            comm,
            gbox,
            sorted_morton,
            first_cell,
            first_morton: Vec::new(),
            sub: Subdomain::default(),
            shells: Vec::new(),
            neighbor_cache: Vec::new(),
        };
        grid_obj.update_first_morton();
        grid_obj.rebuild()?;
        Ok(grid_obj)
    }

    pub fn n_local_cells(&self) -> u32 {
        self.sub.n_local
    }

    pub fn n_ghost_cells(&self) -> u32 {
        self.sub.n_ghost
    }

    pub fn cell_size(&self) -> [f64; 3] {
        self.gbox.cell_size()
    }

    pub fn grid_size(&self) -> [u32; 3] {
        self.gbox.grid_size()
    }

    pub fn neighbor_ranks(&self) -> &[Rank] {
        &self.sub.neighbors
    }

    pub fn cell_neighbor_index(&self, cell: LocalCell, k: FullShellIdx) -> Result<CellIndex> {
        if cell.get() >= self.sub.n_local {
            return Err(GridError::CellIndexOutOfRange {
                index: cell.get(),
                n_local: self.sub.n_local,
            });
        }
        if k == FullShellIdx::CENTER {
            return Ok(CellIndex::Local(cell));
        }
        Ok(self.neighbor_cache[cell.as_usize()][k.get() as usize - 1])
    }

    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        &self.sub.exchange
    }

    /// Morton lookup: encode the position's cell, then binary-search the
    /// local interval.
    pub fn position_to_cell_index(&self, pos: [f64; 3]) -> Result<LocalCell> {
        let code = self.position_morton(pos)?;
        let locals = &self.sub.cells[..self.sub.n_local as usize];
        match locals.binary_search(&GlobalCell::new(code)) {
            Ok(i) => Ok(LocalCell::new(i as u32)),
            Err(_) => Err(GridError::NotLocal { pos }),
        }
    }

    /// Box-wide lookup through the replicated first-Morton array. A code on
    /// an interval boundary belongs to the rank whose interval starts there.
    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        let code = self.position_morton(pos)?;
        Ok(self.owner_of_morton(code))
    }

    pub fn position_to_neighidx(&self, pos: [f64; 3]) -> Result<usize> {
        let rank = self.position_to_rank(pos)?;
        self.sub
            .neighbors
            .iter()
            .position(|&r| r == rank)
            .ok_or(GridError::NotANeighbor { rank: rank.get() })
    }

    pub fn global_hash(&self, idx: CellIndex) -> Result<GlobalCell> {
        let at = idx.storage_index(self.sub.n_local);
        if at >= self.sub.cells.len() {
            return Err(GridError::CellIndexOutOfRange {
                index: at as u32,
                n_local: self.sub.n_local,
            });
        }
        Ok(self.sub.cells[at])
    }

    /// Redistributes the curve intervals by weight. Collective on the
    /// communicator.
    pub fn repartition(&mut self, metric: Metric, start: StartCallback) -> Result<bool> {
        let weights = metric();
        ensure!(
            weights.len() == self.sub.n_local as usize,
            "metric returned {} weights for {} local cells",
            weights.len(),
            self.sub.n_local
        );

        let nprocs = self.comm.size();
        let local_sum: f64 = weights.iter().sum();
        let sums = all_gather_pod(self.comm.as_ref(), REPART_TAGS.loads, &local_sum);
        let total: f64 = sums.iter().sum();
        if total <= 0.0 {
            return Ok(false);
        }
        let prefix: f64 = sums[..self.comm.rank()].iter().sum();
        let target = total / nprocs as f64;

        // Assign each local cell to its prefix bucket; weights accumulate
        // along the curve.
        let mut counts = vec![0u64; nprocs];
        let mut cellpref = prefix;
        for &w in &weights {
            let proc = ((cellpref / target) as usize).min(nprocs - 1);
            counts[proc] += 1;
            cellpref += w;
        }
        let counts =
            all_reduce_vec_sum_u64(self.comm.as_ref(), REPART_TAGS.gather, &counts);
        if let Some(empty) = counts.iter().position(|&c| c == 0) {
            return Err(GridError::PartitionEmpty {
                rank: empty as u32,
            });
        }

        let mut first_cell = Vec::with_capacity(nprocs + 1);
        let mut at = 0usize;
        first_cell.push(0);
        for &c in &counts {
            at += c as usize;
            first_cell.push(at);
        }
        ensure!(
            at == self.sorted_morton.len(),
            "redistribution lost cells: {at} of {}",
            self.sorted_morton.len()
        );
        if first_cell == self.first_cell {
            return Ok(false);
        }

        self.first_cell = first_cell;
        self.update_first_morton();
        start();
        self.rebuild()?;
        Ok(true)
    }

    fn update_first_morton(&mut self) {
        let n = self.sorted_morton.len();
        self.first_morton = self
            .first_cell
            .iter()
            .map(|&i| {
                if i < n {
                    self.sorted_morton[i]
                } else {
                    u64::MAX
                }
            })
            .collect();
    }

    fn owner_of_morton(&self, code: u64) -> Rank {
        let nprocs = self.comm.size();
        let upper = self.first_morton[1..nprocs]
            .partition_point(|&first| first <= code);
        Rank::from_usize(upper)
    }

    fn position_morton(&self, pos: [f64; 3]) -> Result<u64> {
        let coords = self.gbox.unlinearize(self.gbox.cell_at(pos)?);
        Ok(morton_encode(coords))
    }

    /// The 26 shell neighbors of a cell, canonical slot order, as Morton
    /// codes.
    fn shell_codes(&self, code: u64) -> [GlobalCell; 26] {
        let c = morton_decode(code);
        let grid = self.gbox.grid_size();
        let mut out = [GlobalCell::new(0); 26];
        for (slot, off) in FULL_SHELL_OFFSETS[1..].iter().enumerate() {
            let n = [
                (c[0] as i64 + off[0] as i64).rem_euclid(grid[0] as i64) as u32,
                (c[1] as i64 + off[1] as i64).rem_euclid(grid[1] as i64) as u32,
                (c[2] as i64 + off[2] as i64).rem_euclid(grid[2] as i64) as u32,
            ];
            out[slot] = GlobalCell::new(morton_encode(n));
        }
        out
    }

    /// Rederives the subdomain, shell records and neighbor cache from the
    /// current intervals.
    fn rebuild(&mut self) -> Result<()> {
        let me = Rank::from_usize(self.comm.rank());
        let locals: Vec<GlobalCell> = self.sorted_morton
            [self.first_cell[me.as_usize()]..self.first_cell[me.as_usize() + 1]]
            .iter()
            .map(|&m| GlobalCell::new(m))
            .collect();
        ensure!(!locals.is_empty(), "rank {me} holds an empty curve interval");

        let shell_of = |c: GlobalCell| self.shell_codes(c.get());
        let owner_of = |c: GlobalCell| Some(self.owner_of_morton(c.get()));
        let sub = build_subdomain(me, locals, shell_of, owner_of)?;

        let border: std::collections::HashSet<u32> =
            sub.border_cells.iter().map(|b| b.get()).collect();
        let mut shells = Vec::with_capacity(sub.cells.len());
        for (i, &cell) in sub.cells.iter().enumerate() {
            let coords = morton_decode(cell.get());
            let (owner, kind) = if (i as u32) < sub.n_local {
                let kind = if border.contains(&(i as u32)) {
                    CellKind::Boundary
                } else {
                    CellKind::Inner
                };
                (me, kind)
            } else {
                (self.owner_of_morton(cell.get()), CellKind::Ghost)
            };
            shells.push(ShellCell {
                coords,
                owner,
                kind,
            });
        }

        debug_assert!(shells[..sub.n_local as usize].iter().all(|s| s.owner == me));
        debug_assert!(shells[sub.n_local as usize..]
            .iter()
            .all(|s| s.kind == CellKind::Ghost && s.owner != me));

        // One-ring neighbor resolution for the local cells.
        let mut cache = Vec::with_capacity(sub.n_local as usize);
        for i in 0..sub.n_local {
            let shell = shells[i as usize];
            let mut resolved = [CellIndex::Local(LocalCell::new(0)); 26];
            let codes = self.shell_codes(morton_encode(shell.coords));
            for (slot, code) in codes.into_iter().enumerate() {
                match sub.global_to_local.get(&code) {
                    Some(&idx) => resolved[slot] = idx,
                    None => {
                        crate::ensure_not_reached!("shell cell {code} missing from the ghost layer")
                    }
                }
            }
            cache.push(resolved);
        }

        self.sub = sub;
        self.shells = shells;
        self.neighbor_cache = cache;
        Ok(())
    }
}
