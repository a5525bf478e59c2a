//! Recursive weight-balanced spatial bisection.
//!
//! The cell grid is split by axis-aligned planes into one rectangular
//! sub-box per rank. Per-cell weights are summed into a globally replicated
//! vector, so every rank rebuilds the identical tree deterministically: the
//! split axis is the longest box side, the split plane balances the
//! cumulative weight proportionally to the rank split (to within one plane),
//! and each side keeps at least as many cells as ranks. Ghost exchange
//! descriptors come from intersecting sub-boxes with ghost boxes, handling
//! periodic wrap as shifted axis-aligned intersection boxes enumerated in a
//! canonical shift order shared by both endpoints.

use std::sync::Arc;

use crate::comm::collectives::all_reduce_vec_sum_f64;
use crate::comm::{Communicator, REPART_TAGS};
use crate::ensure;
use crate::error::{GridError, Result};
use crate::exchange::GhostExchangeDesc;
use crate::gbox::GlobalBox;
use crate::index::{CellIndex, FullShellIdx, GhostCell, GlobalCell, LocalCell, Rank};

use super::{Metric, StartCallback};
use crate::gbox::FULL_SHELL_OFFSETS;

/// Half-open axis-aligned box of cell coordinates.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Domain {
    lo: [i64; 3],
    hi: [i64; 3],
}

impl Domain {
    fn volume(&self) -> i64 {
        (0..3).map(|d| (self.hi[d] - self.lo[d]).max(0)).product()
    }

    fn extent(&self, d: usize) -> i64 {
        self.hi[d] - self.lo[d]
    }

    fn grown(&self) -> Domain {
        Domain {
            lo: [self.lo[0] - 1, self.lo[1] - 1, self.lo[2] - 1],
            hi: [self.hi[0] + 1, self.hi[1] + 1, self.hi[2] + 1],
        }
    }

    fn shifted(&self, s: [i64; 3]) -> Domain {
        Domain {
            lo: [self.lo[0] + s[0], self.lo[1] + s[1], self.lo[2] + s[2]],
            hi: [self.hi[0] + s[0], self.hi[1] + s[1], self.hi[2] + s[2]],
        }
    }

    fn intersect(&self, other: &Domain) -> Option<Domain> {
        let mut lo = [0i64; 3];
        let mut hi = [0i64; 3];
        for d in 0..3 {
            lo[d] = self.lo[d].max(other.lo[d]);
            hi[d] = self.hi[d].min(other.hi[d]);
            if lo[d] >= hi[d] {
                return None;
            }
        }
        Some(Domain { lo, hi })
    }

    fn contains(&self, c: [i64; 3]) -> bool {
        (0..3).all(|d| c[d] >= self.lo[d] && c[d] < self.hi[d])
    }

    /// Cells in row-major order, x fastest.
    fn cells(&self) -> impl Iterator<Item = [i64; 3]> + '_ {
        let lo = self.lo;
        let hi = self.hi;
        (lo[2]..hi[2]).flat_map(move |z| {
            (lo[1]..hi[1]).flat_map(move |y| (lo[0]..hi[0]).map(move |x| [x, y, z]))
        })
    }
}

enum KdNode {
    Leaf(Rank),
    Split {
        axis: usize,
        pos: i64,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
}

impl KdNode {
    fn rank_of(&self, c: [i64; 3]) -> Rank {
        match self {
            KdNode::Leaf(r) => *r,
            KdNode::Split {
                axis,
                pos,
                left,
                right,
            } => {
                if c[*axis] < *pos {
                    left.rank_of(c)
                } else {
                    right.rank_of(c)
                }
            }
        }
    }
}

/// Grid with recursive weight-balanced bisection.
pub struct KdTreeGrid<C: Communicator> {
    comm: Arc<C>,
    gbox: GlobalBox,
    tree: KdNode,
    /// Leaf sub-box per rank, replicated on all ranks.
    domains: Vec<Domain>,
    own: Domain,
    ghost: Domain,
    n_local: u32,
    n_ghost: u32,
    /// Ghost-grid linear position to combined cell index.
    perm: Vec<CellIndex>,
    /// Ghost index to ghost-grid linear position.
    ghost_positions: Vec<u32>,
    neighbors: Vec<Rank>,
    exchange: Vec<GhostExchangeDesc>,
}

impl<C: Communicator> KdTreeGrid<C> {
    pub fn new(comm: Arc<C>, gbox: GlobalBox) -> Result<Self> {
        let nprocs = comm.size() as u32;
        if gbox.n_cells() < nprocs as u64 {
            return Err(GridError::TooManyRanks {
                n_cells: gbox.n_cells(),
                n_ranks: nprocs,
            });
        }
        let weights = vec![1.0f64; gbox.n_cells() as usize];
        let (tree, domains) = build_tree(&gbox, &weights, nprocs);
        let mut grid = KdTreeGrid {
            comm,
            gbox,
            tree,
            domains,
            own: Domain {
                lo: [0; 3],
                hi: [0; 3],
            },
            ghost: Domain {
                lo: [0; 3],
                hi: [0; 3],
            },
            n_local: 0,
            n_ghost: 0,
            perm: Vec::new(),
            ghost_positions: Vec::new(),
            neighbors: Vec::new(),
            exchange: Vec::new(),
        };
        grid.rebuild();
        Ok(grid)
    }

    pub fn n_local_cells(&self) -> u32 {
        self.n_local
    }

    pub fn n_ghost_cells(&self) -> u32 {
        self.n_ghost
    }

    pub fn cell_size(&self) -> [f64; 3] {
        self.gbox.cell_size()
    }

    pub fn grid_size(&self) -> [u32; 3] {
        self.gbox.grid_size()
    }

    pub fn neighbor_ranks(&self) -> &[Rank] {
        &self.neighbors
    }

    pub fn cell_neighbor_index(&self, cell: LocalCell, k: FullShellIdx) -> Result<CellIndex> {
        if cell.get() >= self.n_local {
            return Err(GridError::CellIndexOutOfRange {
                index: cell.get(),
                n_local: self.n_local,
            });
        }
        let abs = self.local_to_abs(cell);
        let off = FULL_SHELL_OFFSETS[k.get() as usize];
        let pos = [
            abs[0] + off[0] as i64,
            abs[1] + off[1] as i64,
            abs[2] + off[2] as i64,
        ];
        Ok(self.perm[self.ghost_linear(pos)])
    }

    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        &self.exchange
    }

    pub fn position_to_cell_index(&self, pos: [f64; 3]) -> Result<LocalCell> {
        let abs = self.cell_coords(pos)?;
        if !self.own.contains(abs) {
            return Err(GridError::NotLocal { pos });
        }
        Ok(self.abs_to_local(abs))
    }

    /// Box-wide tree descent.
    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        let abs = self.cell_coords(pos)?;
        Ok(self.tree.rank_of(abs))
    }

    pub fn position_to_neighidx(&self, pos: [f64; 3]) -> Result<usize> {
        let rank = self.position_to_rank(pos)?;
        self.neighbors
            .iter()
            .position(|&r| r == rank)
            .ok_or(GridError::NotANeighbor { rank: rank.get() })
    }

    pub fn global_hash(&self, idx: CellIndex) -> Result<GlobalCell> {
        let abs = match idx {
            CellIndex::Local(l) => {
                if l.get() >= self.n_local {
                    return Err(GridError::CellIndexOutOfRange {
                        index: l.get(),
                        n_local: self.n_local,
                    });
                }
                self.local_to_abs(l)
            }
            CellIndex::Ghost(g) => {
                if g.get() >= self.n_ghost {
                    return Err(GridError::CellIndexOutOfRange {
                        index: g.get(),
                        n_local: self.n_local,
                    });
                }
                let rel = self.ghost_positions[g.as_usize()] as i64;
                let sg = self.ghost_sizes();
                [
                    self.ghost.lo[0] + rel % sg[0],
                    self.ghost.lo[1] + rel / sg[0] % sg[1],
                    self.ghost.lo[2] + rel / (sg[0] * sg[1]),
                ]
            }
        };
        Ok(self.wrap_linearize(abs))
    }

    /// Rebuilds the tree from fresh weights. Collective on the communicator.
    pub fn repartition(&mut self, metric: Metric, start: StartCallback) -> Result<bool> {
        let weights = metric();
        ensure!(
            weights.len() == self.n_local as usize,
            "metric returned {} weights for {} local cells",
            weights.len(),
            self.n_local
        );

        let n = self.gbox.n_cells() as usize;
        let mut mine = vec![0.0f64; n];
        for (i, w) in weights.iter().enumerate() {
            let abs = self.local_to_abs(LocalCell::new(i as u32));
            mine[self.wrap_linearize(abs).get() as usize] = *w;
        }
        let global = all_reduce_vec_sum_f64(self.comm.as_ref(), REPART_TAGS.gather, &mine);

        let (tree, domains) = build_tree(&self.gbox, &global, self.comm.size() as u32);
        if domains == self.domains {
            return Ok(false);
        }

        self.tree = tree;
        self.domains = domains;
        start();
        self.rebuild();
        Ok(true)
    }

    fn cell_coords(&self, pos: [f64; 3]) -> Result<[i64; 3]> {
        let c = self.gbox.unlinearize(self.gbox.cell_at(pos)?);
        Ok([c[0] as i64, c[1] as i64, c[2] as i64])
    }

    fn local_to_abs(&self, l: LocalCell) -> [i64; 3] {
        let s = [self.own.extent(0), self.own.extent(1), self.own.extent(2)];
        let idx = l.get() as i64;
        [
            self.own.lo[0] + idx % s[0],
            self.own.lo[1] + idx / s[0] % s[1],
            self.own.lo[2] + idx / (s[0] * s[1]),
        ]
    }

    fn abs_to_local(&self, abs: [i64; 3]) -> LocalCell {
        let s = [self.own.extent(0), self.own.extent(1), self.own.extent(2)];
        let rel = [
            abs[0] - self.own.lo[0],
            abs[1] - self.own.lo[1],
            abs[2] - self.own.lo[2],
        ];
        LocalCell::new((rel[0] + s[0] * (rel[1] + s[1] * rel[2])) as u32)
    }

    fn ghost_sizes(&self) -> [i64; 3] {
        [
            self.ghost.extent(0),
            self.ghost.extent(1),
            self.ghost.extent(2),
        ]
    }

    fn ghost_linear(&self, abs: [i64; 3]) -> usize {
        let sg = self.ghost_sizes();
        let rel = [
            abs[0] - self.ghost.lo[0],
            abs[1] - self.ghost.lo[1],
            abs[2] - self.ghost.lo[2],
        ];
        debug_assert!((0..3).all(|d| rel[d] >= 0 && rel[d] < sg[d]));
        (rel[0] + sg[0] * (rel[1] + sg[1] * rel[2])) as usize
    }

    fn wrap_linearize(&self, abs: [i64; 3]) -> GlobalCell {
        let g = self.gbox.grid_size();
        let c = [
            abs[0].rem_euclid(g[0] as i64) as u32,
            abs[1].rem_euclid(g[1] as i64) as u32,
            abs[2].rem_euclid(g[2] as i64) as u32,
        ];
        self.gbox.linearize(c)
    }

    /// Rederives subdomain, ghost permutation, neighbors and descriptors
    /// from the current leaf domains.
    fn rebuild(&mut self) {
        let me = self.comm.rank();
        self.own = self.domains[me];
        self.ghost = self.own.grown();
        self.n_local = self.own.volume() as u32;

        // Ghost permutation: positions wrapping into the own box stay local
        // (their periodic image is an owned cell); everything else becomes a
        // ghost in ghost-grid scan order.
        let grid = self.gbox.grid_size();
        let wrap = |abs: [i64; 3]| {
            [
                abs[0].rem_euclid(grid[0] as i64),
                abs[1].rem_euclid(grid[1] as i64),
                abs[2].rem_euclid(grid[2] as i64),
            ]
        };
        self.perm.clear();
        self.ghost_positions.clear();
        self.n_ghost = 0;
        let ghost = self.ghost;
        for (linear, abs) in ghost.cells().enumerate() {
            if self.own.contains(abs) {
                self.perm.push(CellIndex::Local(self.abs_to_local(abs)));
            } else {
                let wrapped = wrap(abs);
                if self.own.contains(wrapped) {
                    self.perm.push(CellIndex::Local(self.abs_to_local(wrapped)));
                } else {
                    self.perm
                        .push(CellIndex::Ghost(GhostCell::new(self.n_ghost)));
                    self.ghost_positions.push(linear as u32);
                    self.n_ghost += 1;
                }
            }
        }

        // Neighbors: ranks whose sub-box touches the own ghost box under
        // some periodic shift.
        let shifts = canonical_shifts(grid);
        self.neighbors.clear();
        for (r, dom) in self.domains.iter().enumerate() {
            if r == me {
                continue;
            }
            let touches = shifts
                .iter()
                .any(|&s| self.ghost.intersect(&dom.shifted(s)).is_some());
            if touches {
                self.neighbors.push(Rank::from_usize(r));
            }
        }

        // Exchange descriptors. Both endpoints enumerate the same regions in
        // the same canonical shift order, so the lists pair cell-by-cell.
        self.exchange.clear();
        for &peer in &self.neighbors {
            let dom_peer = self.domains[peer.as_usize()];
            let ghost_peer = dom_peer.grown();

            let mut recv = Vec::new();
            let mut send = Vec::new();
            for &s in &shifts {
                if let Some(region) = self.ghost.intersect(&dom_peer.shifted(s)) {
                    for abs in region.cells() {
                        match self.perm[self.ghost_linear(abs)] {
                            CellIndex::Ghost(g) => recv.push(g),
                            CellIndex::Local(_) => {
                                crate::ensure_not_reached!("peer-owned cell mapped locally")
                            }
                        }
                    }
                }
                if let Some(region) = ghost_peer.shifted([-s[0], -s[1], -s[2]]).intersect(&self.own)
                {
                    for abs in region.cells() {
                        send.push(self.abs_to_local(abs));
                    }
                }
            }
            ensure!(
                !recv.is_empty() && !send.is_empty(),
                "one-sided exchange with rank {peer}"
            );
            self.exchange.push(GhostExchangeDesc {
                dest: peer,
                send,
                recv,
            });
        }
    }
}

/// The 27 periodic image shifts in canonical order, z outermost.
fn canonical_shifts(grid: [u32; 3]) -> Vec<[i64; 3]> {
    let g = [grid[0] as i64, grid[1] as i64, grid[2] as i64];
    let mut out = Vec::with_capacity(27);
    for sz in -1..=1i64 {
        for sy in -1..=1i64 {
            for sx in -1..=1i64 {
                out.push([sx * g[0], sy * g[1], sz * g[2]]);
            }
        }
    }
    out
}

/// Builds the bisection tree over the whole grid; returns it with the leaf
/// domain of every rank.
fn build_tree(gbox: &GlobalBox, weights: &[f64], nprocs: u32) -> (KdNode, Vec<Domain>) {
    let grid = gbox.grid_size();
    let full = Domain {
        lo: [0; 3],
        hi: [grid[0] as i64, grid[1] as i64, grid[2] as i64],
    };
    let mut domains = vec![full; nprocs as usize];
    let tree = split_domain(gbox, weights, 0, nprocs, full, &mut domains);
    (tree, domains)
}

fn split_domain(
    gbox: &GlobalBox,
    weights: &[f64],
    r0: u32,
    r1: u32,
    dom: Domain,
    domains: &mut Vec<Domain>,
) -> KdNode {
    if r1 - r0 == 1 {
        domains[r0 as usize] = dom;
        return KdNode::Leaf(Rank::new(r0));
    }
    let nl = (r1 - r0) / 2;
    let nr = (r1 - r0) - nl;

    // Longest side, ties toward the lower axis.
    let axis = (0..3).max_by_key(|&d| (dom.extent(d), std::cmp::Reverse(d))).unwrap();
    let len = dom.extent(axis);
    ensure!(len >= 2, "cannot bisect a domain of extent {len}");
    let area = dom.volume() / len;

    // Cumulative slab weights along the split axis.
    let mut slab = vec![0.0f64; len as usize];
    for abs in dom.cells() {
        let c = [abs[0] as u32, abs[1] as u32, abs[2] as u32];
        slab[(abs[axis] - dom.lo[axis]) as usize] += weights[gbox.linearize(c).get() as usize];
    }
    let total: f64 = slab.iter().sum();
    let target = total * nl as f64 / (nl + nr) as f64;

    // Feasible split planes leave both sides at least one cell per rank.
    let min_i = (nl as i64 + area - 1) / area;
    let max_i = len - (nr as i64 + area - 1) / area;
    ensure!(min_i <= max_i, "no feasible split plane");

    let mut best_i = min_i;
    let mut best_err = f64::INFINITY;
    let mut cum = 0.0;
    for i in 1..len {
        cum += slab[(i - 1) as usize];
        if i < min_i || i > max_i {
            continue;
        }
        let err = (cum - target).abs();
        if err < best_err {
            best_err = err;
            best_i = i;
        }
    }

    let mut left_dom = dom;
    left_dom.hi[axis] = dom.lo[axis] + best_i;
    let mut right_dom = dom;
    right_dom.lo[axis] = dom.lo[axis] + best_i;

    let left = split_domain(gbox, weights, r0, r0 + nl, left_dom, domains);
    let right = split_domain(gbox, weights, r0 + nl, r1, right_dom, domains);
    KdNode::Split {
        axis,
        pos: dom.lo[axis] + best_i,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_split_of_a_cube() {
        let gbox = GlobalBox::new([4.0, 4.0, 4.0], 1.0).unwrap();
        let weights = vec![1.0; 64];
        let (_, domains) = build_tree(&gbox, &weights, 8);
        for dom in &domains {
            assert_eq!(dom.volume(), 8);
            for d in 0..3 {
                assert_eq!(dom.extent(d), 2);
            }
        }
    }

    #[test]
    fn tree_is_deterministic() {
        let gbox = GlobalBox::new([6.0, 4.0, 2.0], 1.0).unwrap();
        let weights: Vec<f64> = (0..48).map(|i| 1.0 + (i % 3) as f64).collect();
        let (_, a) = build_tree(&gbox, &weights, 5);
        let (_, b) = build_tree(&gbox, &weights, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn leaves_partition_the_grid() {
        let gbox = GlobalBox::new([5.0, 3.0, 2.0], 1.0).unwrap();
        let weights: Vec<f64> = (0..30).map(|i| (i % 4) as f64 + 0.5).collect();
        let (tree, domains) = build_tree(&gbox, &weights, 4);
        let total: i64 = domains.iter().map(|d| d.volume()).sum();
        assert_eq!(total, 30);
        for z in 0..2i64 {
            for y in 0..3i64 {
                for x in 0..5i64 {
                    let owner = tree.rank_of([x, y, z]);
                    assert!(domains[owner.as_usize()].contains([x, y, z]));
                    let holders = domains.iter().filter(|d| d.contains([x, y, z])).count();
                    assert_eq!(holders, 1);
                }
            }
        }
    }

    #[test]
    fn weighted_split_shrinks_the_loaded_side() {
        let gbox = GlobalBox::new([8.0, 2.0, 2.0], 1.0).unwrap();
        // Left half carries ten times the weight.
        let weights: Vec<f64> = (0..32)
            .map(|i| {
                let x = i % 8;
                if x < 4 { 10.0 } else { 1.0 }
            })
            .collect();
        let (_, domains) = build_tree(&gbox, &weights, 2);
        let vol0 = domains[0].volume();
        let vol1 = domains[1].volume();
        assert!(vol0 < vol1, "loaded side kept {vol0} of {} cells", vol0 + vol1);
    }
}
