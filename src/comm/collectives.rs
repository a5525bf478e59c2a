//! Collective operations built from non-blocking point-to-point messages.
//!
//! All reductions fold contributions in ascending rank order, so results are
//! bitwise identical on every rank and across repeated runs with the same
//! inputs. Variable-length gathers exchange sizes on `tag` and payloads on
//! `tag + 1`.

use bytemuck::Pod;

use super::{CommTag, Communicator, Wait};
use crate::index::Rank;

/// Gathers one fixed-size record from every rank, indexed by rank.
pub fn all_gather_pod<C: Communicator, T: Pod>(comm: &C, tag: CommTag, mine: &T) -> Vec<T> {
    let size = comm.size();
    let me = comm.rank();
    let bytes = bytemuck::bytes_of(mine);

    let mut recvs = Vec::with_capacity(size.saturating_sub(1));
    let mut bufs: Vec<Vec<u8>> = vec![vec![0u8; bytes.len()]; size];
    for peer in 0..size {
        if peer != me {
            let h = comm.irecv(peer, tag.get(), &mut bufs[peer]);
            recvs.push((peer, h));
        }
    }
    let mut sends = Vec::with_capacity(size.saturating_sub(1));
    for peer in 0..size {
        if peer != me {
            sends.push(comm.isend(peer, tag.get(), bytes));
        }
    }

    let mut out = vec![*mine; size];
    for (peer, h) in recvs {
        let data = h.wait().expect("gather receive returned no data");
        // Receive buffers carry no alignment guarantee; copy into place.
        bytemuck::bytes_of_mut(&mut out[peer]).copy_from_slice(&data);
    }
    for s in sends {
        let _ = s.wait();
    }
    out
}

/// Gathers a variable-length byte payload from every rank, indexed by rank.
pub fn all_gather_bytes<C: Communicator>(comm: &C, tag: CommTag, data: &[u8]) -> Vec<Vec<u8>> {
    let peers: Vec<Rank> = (0..comm.size())
        .filter(|&r| r != comm.rank())
        .map(Rank::from_usize)
        .collect();
    let gathered = subset_all_gather(comm, &peers, tag, data);

    let mut out = vec![Vec::new(); comm.size()];
    out[comm.rank()] = data.to_vec();
    for (peer, payload) in peers.iter().zip(gathered) {
        out[peer.as_usize()] = payload;
    }
    out
}

/// Gathers a byte payload from an explicit set of peers, peer order.
///
/// Collective over the peer set: every listed peer must call this with a
/// peer list containing the caller. Sizes travel on `tag`, payloads on
/// `tag + 1`.
pub fn subset_all_gather<C: Communicator>(
    comm: &C,
    peers: &[Rank],
    tag: CommTag,
    data: &[u8],
) -> Vec<Vec<u8>> {
    let size_tag = tag.get();
    let payload_tag = tag.offset(1).get();

    // Size stage.
    let mut size_bufs: Vec<[u8; 8]> = vec![[0u8; 8]; peers.len()];
    let mut size_recvs = Vec::with_capacity(peers.len());
    for (i, peer) in peers.iter().enumerate() {
        size_recvs.push(comm.irecv(peer.as_usize(), size_tag, &mut size_bufs[i]));
    }
    let size_bytes = (data.len() as u64).to_le_bytes();
    let mut size_sends = Vec::with_capacity(peers.len());
    for peer in peers {
        size_sends.push(comm.isend(peer.as_usize(), size_tag, &size_bytes));
    }
    let mut lens = Vec::with_capacity(peers.len());
    for h in size_recvs {
        let b = h.wait().expect("size receive returned no data");
        lens.push(u64::from_le_bytes(b.try_into().expect("size record is 8 bytes")) as usize);
    }
    for s in size_sends {
        let _ = s.wait();
    }

    // Payload stage.
    let mut payloads: Vec<Vec<u8>> = lens.iter().map(|&l| vec![0u8; l]).collect();
    let mut recvs = Vec::with_capacity(peers.len());
    for (i, peer) in peers.iter().enumerate() {
        recvs.push(comm.irecv(peer.as_usize(), payload_tag, &mut payloads[i]));
    }
    let mut sends = Vec::with_capacity(peers.len());
    for peer in peers {
        sends.push(comm.isend(peer.as_usize(), payload_tag, data));
    }
    let mut out = Vec::with_capacity(peers.len());
    for h in recvs {
        out.push(h.wait().expect("payload receive returned no data"));
    }
    for s in sends {
        let _ = s.wait();
    }
    out
}

/// Sum of one `f64` per rank, folded in rank order.
pub fn all_reduce_sum_f64<C: Communicator>(comm: &C, tag: CommTag, x: f64) -> f64 {
    all_gather_pod(comm, tag, &x).into_iter().sum()
}

/// Exclusive prefix sum over ranks: sum of the values of all lower ranks.
pub fn exscan_sum_f64<C: Communicator>(comm: &C, tag: CommTag, x: f64) -> f64 {
    all_gather_pod(comm, tag, &x)[..comm.rank()].iter().sum()
}

/// Logical AND over one flag per rank.
pub fn all_reduce_and<C: Communicator>(comm: &C, tag: CommTag, x: bool) -> bool {
    all_gather_pod(comm, tag, &(x as u8)).into_iter().all(|v| v != 0)
}

/// Element-wise sum of equally sized `f64` vectors, folded in rank order.
pub fn all_reduce_vec_sum_f64<C: Communicator>(comm: &C, tag: CommTag, v: &[f64]) -> Vec<f64> {
    let bytes: Vec<u8> = v.iter().flat_map(|x| x.to_le_bytes()).collect();
    let gathered = all_gather_bytes(comm, tag, &bytes);
    let mut out = vec![0.0f64; v.len()];
    for payload in gathered {
        crate::ensure!(
            payload.len() == 8 * v.len(),
            "vector reduction length mismatch"
        );
        for (acc, chunk) in out.iter_mut().zip(payload.chunks_exact(8)) {
            *acc += f64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        }
    }
    out
}

/// Element-wise sum of equally sized `u64` vectors, folded in rank order.
pub fn all_reduce_vec_sum_u64<C: Communicator>(comm: &C, tag: CommTag, v: &[u64]) -> Vec<u64> {
    let bytes: Vec<u8> = v.iter().flat_map(|x| x.to_le_bytes()).collect();
    let gathered = all_gather_bytes(comm, tag, &bytes);
    let mut out = vec![0u64; v.len()];
    for payload in gathered {
        crate::ensure!(
            payload.len() == 8 * v.len(),
            "vector reduction length mismatch"
        );
        for (acc, chunk) in out.iter_mut().zip(payload.chunks_exact(8)) {
            *acc += u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{NoComm, ThreadComm};

    fn on_world<T: Send + 'static>(
        size: usize,
        f: impl Fn(ThreadComm) -> T + Send + Sync + Clone + 'static,
    ) -> Vec<T> {
        let comms = ThreadComm::world(size);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = f.clone();
                std::thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn gather_pod_orders_by_rank() {
        let results = on_world(3, |c| {
            let mine = c.rank() as u64 * 10;
            all_gather_pod(&c, CommTag::new(0x10), &mine)
        });
        for r in results {
            assert_eq!(r, vec![0, 10, 20]);
        }
    }

    #[test]
    fn reduce_and_exscan_agree_across_ranks() {
        let results = on_world(4, |c| {
            let x = (c.rank() + 1) as f64;
            let total = all_reduce_sum_f64(&c, CommTag::new(0x20), x);
            let prefix = exscan_sum_f64(&c, CommTag::new(0x22), x);
            (c.rank(), total, prefix)
        });
        for (rank, total, prefix) in results {
            assert_eq!(total, 10.0);
            let expect: f64 = (1..=rank).map(|r| r as f64).sum();
            assert_eq!(prefix, expect);
        }
    }

    #[test]
    fn variable_length_gather() {
        let results = on_world(2, |c| {
            let data = vec![c.rank() as u8; c.rank() + 1];
            all_gather_bytes(&c, CommTag::new(0x30), &data)
        });
        for r in results {
            assert_eq!(r, vec![vec![0u8], vec![1u8, 1u8]]);
        }
    }

    #[test]
    fn vector_reduction_sums_elementwise() {
        let results = on_world(2, |c| {
            let mut v = vec![0.0; 4];
            v[c.rank()] = 2.0;
            all_reduce_vec_sum_f64(&c, CommTag::new(0x40), &v)
        });
        for r in results {
            assert_eq!(r, vec![2.0, 2.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn collectives_are_trivial_on_a_single_rank() {
        let c = NoComm;
        assert_eq!(all_reduce_sum_f64(&c, CommTag::new(0x50), 3.5), 3.5);
        assert_eq!(exscan_sum_f64(&c, CommTag::new(0x52), 3.5), 0.0);
        assert!(all_reduce_and(&c, CommTag::new(0x54), true));
    }
}
