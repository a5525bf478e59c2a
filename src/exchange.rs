//! Ghost-layer discovery and exchange-descriptor construction.
//!
//! Given the set of cells a rank owns and an ownership oracle for their
//! surroundings, [`build_subdomain`] derives everything a strategy publishes
//! about its subdomain: the combined local+ghost cell list, the
//! global-to-local table, the border cells with their foreign owner sets,
//! the neighbor ranks and the per-neighbor ghost exchange descriptors.
//!
//! Send and receive sets are sorted by global cell identity before
//! conversion to local indices. Global identities are unique and ordered the
//! same way on every rank, so the two endpoints of an exchange derive the
//! same cell-by-cell pairing without communicating.

use std::collections::HashMap;

use crate::ensure;
use crate::error::Result;
use crate::index::{CellIndex, GhostCell, GlobalCell, LocalCell, Rank};

/// Ghost exchange with one peer.
///
/// `send` lists local cells shipped to `dest` each exchange round; `recv`
/// lists the ghost cells filled by `dest`'s shipment. The orderings pair
/// cell-by-cell with the peer's mirrored descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GhostExchangeDesc {
    /// Peer rank.
    pub dest: Rank,
    /// Local cells to send, ordered by global identity.
    pub send: Vec<LocalCell>,
    /// Ghost cells to receive into, ordered by global identity.
    pub recv: Vec<GhostCell>,
}

/// Everything a rank knows about its subdomain and its ghost layer.
#[derive(Clone, Debug, Default)]
pub struct Subdomain {
    /// Global identities of known cells: local cells first (strategy order),
    /// ghosts after in discovery order.
    pub cells: Vec<GlobalCell>,
    /// Number of local cells.
    pub n_local: u32,
    /// Number of ghost cells.
    pub n_ghost: u32,
    /// Maps known global identities to local or ghost indices.
    pub global_to_local: HashMap<GlobalCell, CellIndex>,
    /// Local cells with at least one foreign shell neighbor, ascending.
    pub border_cells: Vec<LocalCell>,
    /// Foreign owner ranks per border cell, in encounter order.
    pub border_owners: HashMap<LocalCell, Vec<Rank>>,
    /// Ranks this rank exchanges ghosts with, ascending, each once.
    pub neighbors: Vec<Rank>,
    /// Exchange descriptors, ascending peer rank.
    pub exchange: Vec<GhostExchangeDesc>,
}

impl Subdomain {
    /// Global identity of a known cell.
    pub fn global_of(&self, idx: CellIndex) -> GlobalCell {
        self.cells[idx.storage_index(self.n_local)]
    }
}

fn push_unique<T: PartialEq>(v: &mut Vec<T>, val: T) {
    if !v.contains(&val) {
        v.push(val);
    }
}

/// Derives a [`Subdomain`] from an ownership assignment.
///
/// `local_cells` are this rank's cells in the strategy's local order;
/// `shell_of` enumerates the 26 shell cells of a global identity and
/// `owner_of` resolves ownership. Ownership must be known for the complete
/// shell of every local cell; a gap there means the partition state is
/// corrupt and aborts.
pub fn build_subdomain(
    my_rank: Rank,
    local_cells: Vec<GlobalCell>,
    shell_of: impl Fn(GlobalCell) -> [GlobalCell; 26],
    owner_of: impl Fn(GlobalCell) -> Option<Rank>,
) -> Result<Subdomain> {
    let n_local = local_cells.len() as u32;
    let mut sub = Subdomain {
        cells: local_cells,
        n_local,
        ..Subdomain::default()
    };
    for (i, &c) in sub.cells.iter().enumerate() {
        let prev = sub
            .global_to_local
            .insert(c, CellIndex::Local(LocalCell::new(i as u32)));
        ensure!(prev.is_none(), "cell {c} appears twice in the local cell list");
    }

    // Walk the shells of all local cells, discovering ghosts in encounter
    // order and collecting per-peer send/recv sets by global identity.
    let mut per_peer: HashMap<Rank, (Vec<GlobalCell>, Vec<GlobalCell>)> = HashMap::new();
    for i in 0..n_local {
        let local = LocalCell::new(i);
        let this_global = sub.cells[i as usize];
        for neighbor in shell_of(this_global) {
            let owner = owner_of(neighbor);
            ensure!(
                owner.is_some(),
                "owner of cell {neighbor} unknown in the shell of local cell {this_global}"
            );
            let owner = owner.unwrap();
            if owner == my_rank {
                continue;
            }

            if sub.border_cells.last() != Some(&local) {
                sub.border_cells.push(local);
            }
            push_unique(sub.border_owners.entry(local).or_default(), owner);

            if !sub.global_to_local.contains_key(&neighbor) {
                let ghost = GhostCell::new(sub.n_ghost);
                sub.cells.push(neighbor);
                sub.global_to_local.insert(neighbor, CellIndex::Ghost(ghost));
                sub.n_ghost += 1;
            }

            let (recv, send) = per_peer.entry(owner).or_default();
            push_unique(recv, neighbor);
            push_unique(send, this_global);
        }
    }

    sub.neighbors = per_peer.keys().copied().collect();
    sub.neighbors.sort_unstable();

    for &peer in &sub.neighbors {
        let (mut recv, mut send) = per_peer.remove(&peer).expect("peer collected above");
        recv.sort_unstable();
        send.sort_unstable();
        ensure!(
            !recv.is_empty() && !send.is_empty(),
            "one-sided exchange with rank {peer}"
        );
        let recv = recv
            .into_iter()
            .map(|g| match sub.global_to_local[&g] {
                CellIndex::Ghost(gh) => gh,
                CellIndex::Local(_) => {
                    crate::ensure_not_reached!("receive cell {g} is owned locally")
                }
            })
            .collect();
        let send = send
            .into_iter()
            .map(|g| match sub.global_to_local[&g] {
                CellIndex::Local(l) => l,
                CellIndex::Ghost(_) => {
                    crate::ensure_not_reached!("send cell {g} is not owned locally")
                }
            })
            .collect();
        sub.exchange.push(GhostExchangeDesc {
            dest: peer,
            send,
            recv,
        });
    }

    Ok(sub)
}
