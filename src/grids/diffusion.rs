//! Diffusive load balancing.
//!
//! One `repartition` call performs a single diffusion round after
//! Willebeek-LeMair and Reeves: ranks exchange their loads within the
//! current neighborhood, overloaded ranks pick border cells to hand to
//! underloaded neighbors, and the updated ownership is propagated with two
//! communication steps. Step one broadcasts every reassignment table to the
//! whole neighborhood, so freshly created neighborhood edges see a
//! consistent partition; step two ships the shell ownership of each moved
//! cell so the receiver can extend its partition view around its new cells.

use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::comm::collectives::subset_all_gather;
use crate::comm::{Communicator, NeighborhoodComm, REPART_TAGS};
use crate::ensure;
use crate::error::{GridError, Result};
use crate::exchange::GhostExchangeDesc;
use crate::gbox::GlobalBox;
use crate::index::{CellIndex, FullShellIdx, GlobalCell, LocalCell, Rank};
use crate::wire;

use super::unstructured::VectorPartition;
use super::{InitialPartitioning, Metric, StartCallback};

/// Grid with diffusive, neighbor-pair load transfer.
pub struct DiffusionGrid<C: Communicator> {
    vp: VectorPartition<C>,
}

/// Candidate border cell for the send heap. Orders by fewest newly created
/// border cells, then by highest weight; ties break toward the lower global
/// index so rounds are deterministic.
struct SendCandidate {
    fewer_border_key: i32,
    profit: f64,
    cell: LocalCell,
    global: GlobalCell,
}

impl PartialEq for SendCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for SendCandidate {}

impl PartialOrd for SendCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SendCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fewer_border_key
            .cmp(&other.fewer_border_key)
            .then_with(|| self.profit.total_cmp(&other.profit))
            .then_with(|| other.global.cmp(&self.global))
    }
}

impl<C: Communicator> DiffusionGrid<C> {
    pub fn new(comm: Arc<C>, gbox: GlobalBox, init: InitialPartitioning) -> Result<Self> {
        Ok(DiffusionGrid {
            vp: VectorPartition::new(comm, gbox, init)?,
        })
    }

    pub fn n_local_cells(&self) -> u32 {
        self.vp.n_local_cells()
    }

    pub fn n_ghost_cells(&self) -> u32 {
        self.vp.n_ghost_cells()
    }

    pub fn cell_size(&self) -> [f64; 3] {
        self.vp.cell_size()
    }

    pub fn grid_size(&self) -> [u32; 3] {
        self.vp.grid_size()
    }

    pub fn neighbor_ranks(&self) -> &[Rank] {
        self.vp.neighbor_ranks()
    }

    pub fn cell_neighbor_index(&self, cell: LocalCell, k: FullShellIdx) -> Result<CellIndex> {
        self.vp.cell_neighbor_index(cell, k)
    }

    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        self.vp.get_boundary_info()
    }

    pub fn position_to_cell_index(&self, pos: [f64; 3]) -> Result<LocalCell> {
        self.vp.position_to_cell_index(pos)
    }

    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        self.vp.position_to_rank(pos)
    }

    pub fn position_to_neighidx(&self, pos: [f64; 3]) -> Result<usize> {
        self.vp.position_to_neighidx(pos)
    }

    pub fn global_hash(&self, idx: CellIndex) -> Result<GlobalCell> {
        self.vp.global_hash(idx)
    }

    pub(crate) fn partition_mut(&mut self) -> &mut VectorPartition<C> {
        &mut self.vp
    }

    /// Runs one diffusion round. Collective on the communicator.
    pub fn repartition(&mut self, metric: Metric, start: StartCallback) -> Result<bool> {
        let weights = metric();
        ensure!(
            weights.len() == self.vp.n_local_cells() as usize,
            "metric returned {} weights for {} local cells",
            weights.len(),
            self.vp.n_local_cells()
        );

        self.vp.clear_far_ownership();

        let neighbors: Vec<Rank> = self.vp.sub.neighbors.clone();
        let local_load: f64 = weights.iter().sum();

        let send_volume = {
            let neigh = NeighborhoodComm::new(self.vp.comm.as_ref(), &neighbors);
            compute_send_volume(&neigh, local_load)
        };
        ensure!(
            send_volume.len() == neighbors.len(),
            "send volume per neighbor mismatch"
        );

        let mut to_send: Vec<Vec<GlobalCell>> = vec![Vec::new(); neighbors.len()];
        if send_volume.iter().any(|&v| v > 0.0) {
            to_send = self.compute_send_list(send_volume, &weights, &neighbors);
            for (list, &target) in to_send.iter().zip(&neighbors) {
                for &cell in list {
                    self.vp.partition[cell.get() as usize] = Some(target);
                }
            }
        }

        // First communication step: broadcast the complete reassignment
        // table to every current neighbor, not only to the targets, so that
        // newly adjacent ranks learn about their new boundary.
        let table: Vec<(Rank, Vec<GlobalCell>)> = neighbors
            .iter()
            .copied()
            .zip(to_send.iter().cloned())
            .collect();
        let encoded = wire::encode_cell_table(&table);
        let received = subset_all_gather(
            self.vp.comm.as_ref(),
            &neighbors,
            REPART_TAGS.cells,
            &encoded,
        );

        let mut changed = to_send.iter().any(|l| !l.is_empty());
        for (payload, &from) in received.iter().zip(&neighbors) {
            let lists = match wire::decode_cell_table(payload) {
                Some(lists) => lists,
                None => {
                    return Err(GridError::Comm {
                        peer: from.get(),
                        reason: "malformed reassignment table".into(),
                    })
                }
            };
            for (target, cells) in lists {
                if !cells.is_empty() {
                    changed = true;
                }
                for cell in cells {
                    self.vp.partition[cell.get() as usize] = Some(target);
                }
            }
        }

        // Second communication step: ship the shell ownership of each moved
        // cell to its receiver.
        let mut shell_payloads: Vec<Vec<u8>> = Vec::with_capacity(neighbors.len());
        for list in &to_send {
            let records: Vec<wire::NeighborhoodRecord> = list
                .iter()
                .map(|&cell| {
                    let mut owners = [wire::WIRE_UNKNOWN_OWNER; 26];
                    for (slot, n) in self.vp.gbox.shell(cell).into_iter().enumerate() {
                        owners[slot] = wire::owner_to_wire(self.vp.partition[n.get() as usize]);
                    }
                    wire::NeighborhoodRecord::new(cell, owners)
                })
                .collect();
            shell_payloads.push(wire::cast_slice(&records).to_vec());
        }
        let received_shells = exchange_per_neighbor(
            self.vp.comm.as_ref(),
            &neighbors,
            &shell_payloads,
        )?;
        for (payload, &from) in received_shells.iter().zip(&neighbors) {
            let record_size = std::mem::size_of::<wire::NeighborhoodRecord>();
            if payload.len() % record_size != 0 {
                return Err(GridError::Comm {
                    peer: from.get(),
                    reason: "malformed shell ownership records".into(),
                });
            }
            // Receive buffers carry no alignment guarantee; copy into an
            // aligned record vector before casting.
            let mut records =
                vec![bytemuck::Zeroable::zeroed(); payload.len() / record_size];
            wire::cast_slice_mut::<wire::NeighborhoodRecord>(&mut records)
                .copy_from_slice(payload);
            for rec in &records {
                for (slot, n) in self.vp.gbox.shell(rec.base_cell()).into_iter().enumerate() {
                    let owner = rec.owner(slot);
                    ensure!(
                        owner.is_some(),
                        "received unknown shell owner around cell {}",
                        rec.base_cell()
                    );
                    self.vp.partition[n.get() as usize] = owner;
                }
            }
        }

        if !changed {
            return Ok(false);
        }

        let me = Some(self.vp.my_rank());
        if !self.vp.partition.iter().any(|&p| p == me) {
            return Err(GridError::PartitionEmpty {
                rank: self.vp.my_rank().get(),
            });
        }

        start();
        self.vp.rebuild()?;
        Ok(true)
    }

    /// Picks border cells to hand away, cheapest new boundary first.
    fn compute_send_list(
        &self,
        mut send_volume: Vec<f64>,
        weights: &[f64],
        neighbors: &[Rank],
    ) -> Vec<Vec<GlobalCell>> {
        let sub = &self.vp.sub;
        let me = Some(self.vp.my_rank());
        let border_set: HashSet<LocalCell> = sub.border_cells.iter().copied().collect();

        let mut heap = BinaryHeap::new();
        for &b in &sub.border_cells {
            let profit = weights[b.as_usize()];
            if profit <= 0.0 {
                continue;
            }
            let global = sub.cells[b.as_usize()];
            // Local shell cells that are border cells themselves would turn
            // into additional boundary if this cell left.
            let mut extra_border = 0i32;
            for n in self.vp.gbox.shell(global) {
                if self.vp.partition[n.get() as usize] != me {
                    continue;
                }
                if let Some(CellIndex::Local(l)) = sub.global_to_local.get(&n) {
                    if border_set.contains(l) {
                        extra_border += 1;
                    }
                }
            }
            ensure!(extra_border < 27, "shell cannot exceed 26 cells");
            heap.push(SendCandidate {
                fewer_border_key: 27 - extra_border,
                profit,
                cell: b,
                global,
            });
        }

        let mut to_send = vec![Vec::new(); neighbors.len()];
        while let Some(cand) = heap.pop() {
            for &owner in &sub.border_owners[&cand.cell] {
                let neighidx = neighbors
                    .iter()
                    .position(|&r| r == owner)
                    .expect("border owner is a neighbor");
                if cand.profit <= send_volume[neighidx] {
                    to_send[neighidx].push(cand.global);
                    send_volume[neighidx] -= cand.profit;
                    break;
                }
            }
        }
        to_send
    }
}

/// Exchanges per-neighbor payloads: neighbor `i` receives `payloads[i]`.
/// Sizes travel on the shell size tag, data on its successor.
fn exchange_per_neighbor<C: Communicator>(
    comm: &C,
    neighbors: &[Rank],
    payloads: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>> {
    use crate::comm::Wait;

    let size_tag = REPART_TAGS.shells.get();
    let data_tag = REPART_TAGS.shells.offset(1).get();

    let mut size_bufs = vec![[0u8; 8]; neighbors.len()];
    let mut size_recvs = Vec::with_capacity(neighbors.len());
    for (i, peer) in neighbors.iter().enumerate() {
        size_recvs.push(comm.irecv(peer.as_usize(), size_tag, &mut size_bufs[i]));
    }
    let mut size_sends = Vec::with_capacity(neighbors.len());
    for (peer, payload) in neighbors.iter().zip(payloads) {
        let len = (payload.len() as u64).to_le_bytes();
        size_sends.push(comm.isend(peer.as_usize(), size_tag, &len));
    }
    let mut lens = Vec::with_capacity(neighbors.len());
    for (h, peer) in size_recvs.into_iter().zip(neighbors) {
        let b = h.wait().ok_or(GridError::Comm {
            peer: peer.get(),
            reason: "size exchange returned no data".into(),
        })?;
        lens.push(u64::from_le_bytes(b.try_into().expect("8-byte size record")) as usize);
    }
    for s in size_sends {
        let _ = s.wait();
    }

    let mut bufs: Vec<Vec<u8>> = lens.iter().map(|&l| vec![0u8; l]).collect();
    let mut recvs = Vec::with_capacity(neighbors.len());
    for (i, peer) in neighbors.iter().enumerate() {
        recvs.push(comm.irecv(peer.as_usize(), data_tag, &mut bufs[i]));
    }
    let mut sends = Vec::with_capacity(neighbors.len());
    for (peer, payload) in neighbors.iter().zip(payloads) {
        sends.push(comm.isend(peer.as_usize(), data_tag, payload));
    }
    let mut out = Vec::with_capacity(neighbors.len());
    for (h, peer) in recvs.into_iter().zip(neighbors) {
        out.push(h.wait().ok_or(GridError::Comm {
            peer: peer.get(),
            reason: "payload exchange returned no data".into(),
        })?);
    }
    for s in sends {
        let _ = s.wait();
    }
    Ok(out)
}

/// Load volume to transfer to each neighbor.
///
/// Collective over the neighborhood. Underloaded ranks send nothing. When
/// every neighbor sits at or above the neighborhood average, the total
/// deficiency vanishes and the rank keeps its surplus for this round.
fn compute_send_volume<C: Communicator>(neigh: &NeighborhoodComm<'_, C>, load: f64) -> Vec<f64> {
    let gathered = neigh.allgather(REPART_TAGS.loads, &load.to_le_bytes());
    let neighloads: Vec<f64> = gathered
        .iter()
        .map(|b| f64::from_le_bytes(b.as_slice().try_into().expect("8-byte load record")))
        .collect();

    let avg = (neighloads.iter().sum::<f64>() + load) / (neighloads.len() + 1) as f64;
    if load < avg {
        return vec![0.0; neighloads.len()];
    }

    let deficiency: Vec<f64> = neighloads.iter().map(|&l| (avg - l).max(0.0)).collect();
    let total: f64 = deficiency.iter().sum();
    if total <= 0.0 {
        return vec![0.0; neighloads.len()];
    }

    let overload = load - avg;
    deficiency.into_iter().map(|d| overload * d / total).collect()
}
