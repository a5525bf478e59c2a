//! Fixed-width little-endian wire records for repartitioning exchanges.
//!
//! Strategies serialize small structs by hand: counts and ranks as `u32`,
//! cell identities as `u64`, all little-endian. Records crossing the wire are
//! `#[repr(C)]` and `bytemuck::Pod`-safe so buffers can be cast without
//! copying.

use bytemuck::{Pod, Zeroable};

use crate::index::{GlobalCell, Rank};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

pub fn cast_slice_from<T: Pod>(v: &[u8]) -> &[T] {
    bytemuck::cast_slice(v)
}

/// Owner rank of a cell on the wire: rank or `-1` for unknown.
pub const WIRE_UNKNOWN_OWNER: i32 = -1;

#[inline]
pub fn owner_to_wire(owner: Option<Rank>) -> i32 {
    match owner {
        Some(r) => r.get() as i32,
        None => WIRE_UNKNOWN_OWNER,
    }
}

#[inline]
pub fn owner_from_wire(w: i32) -> Option<Rank> {
    if w < 0 { None } else { Some(Rank::new(w as u32)) }
}

/// One reassigned cell together with the owners of its 26-cell shell.
///
/// Sent during the second communication step of diffusive balancing so the
/// receiver can extend its partition view around cells it just acquired.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct NeighborhoodRecord {
    /// Cell that changed owner (global identity, little-endian).
    pub base_cell_le: u64,
    /// Owner of each of the 26 shell neighbors, `-1` if unknown.
    pub owners_le: [i32; 26],
}

impl NeighborhoodRecord {
    pub fn new(base_cell: GlobalCell, owners: [i32; 26]) -> Self {
        let mut owners_le = [0i32; 26];
        for (dst, src) in owners_le.iter_mut().zip(owners) {
            *dst = src.to_le();
        }
        NeighborhoodRecord {
            base_cell_le: base_cell.get().to_le(),
            owners_le,
        }
    }

    pub fn base_cell(&self) -> GlobalCell {
        GlobalCell::new(u64::from_le(self.base_cell_le))
    }

    pub fn owner(&self, k: usize) -> Option<Rank> {
        owner_from_wire(i32::from_le(self.owners_le[k]))
    }
}

/// Encodes per-neighbor cell reassignment lists.
///
/// Layout: `u32` outer count, then per list a `u32` target rank, a `u32`
/// length and `length` cell identities as `u64`.
pub fn encode_cell_table(lists: &[(Rank, Vec<GlobalCell>)]) -> Vec<u8> {
    let payload: usize = lists.iter().map(|(_, c)| 8 + 8 * c.len()).sum();
    let mut out = Vec::with_capacity(4 + payload);
    out.extend_from_slice(&(lists.len() as u32).to_le_bytes());
    for (target, cells) in lists {
        out.extend_from_slice(&target.get().to_le_bytes());
        out.extend_from_slice(&(cells.len() as u32).to_le_bytes());
        for c in cells {
            out.extend_from_slice(&c.get().to_le_bytes());
        }
    }
    out
}

/// Inverse of [`encode_cell_table`]. Returns `None` on malformed input.
pub fn decode_cell_table(buf: &[u8]) -> Option<Vec<(Rank, Vec<GlobalCell>)>> {
    let mut rd = Reader { buf, at: 0 };
    let n = rd.u32()? as usize;
    let mut lists = Vec::with_capacity(n);
    for _ in 0..n {
        let target = Rank::new(rd.u32()?);
        let len = rd.u32()? as usize;
        let mut cells = Vec::with_capacity(len);
        for _ in 0..len {
            cells.push(GlobalCell::new(rd.u64()?));
        }
        lists.push((target, cells));
    }
    if rd.at == buf.len() { Some(lists) } else { None }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> Option<u32> {
        let b = self.buf.get(self.at..self.at + 4)?;
        self.at += 4;
        Some(u32::from_le_bytes(b.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let b = self.buf.get(self.at..self.at + 8)?;
        self.at += 8;
        Some(u64::from_le_bytes(b.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;

    // The record must stay padding-free so Pod casts are layout-stable.
    const_assert_eq!(std::mem::size_of::<NeighborhoodRecord>(), 112);

    #[test]
    fn cell_table_roundtrip() {
        let lists = vec![
            (Rank::new(2), vec![GlobalCell::new(7), GlobalCell::new(9)]),
            (Rank::new(5), vec![]),
        ];
        let buf = encode_cell_table(&lists);
        let back = decode_cell_table(&buf).unwrap();
        assert_eq!(back, lists);
    }

    #[test]
    fn cell_table_rejects_trailing_garbage() {
        let mut buf = encode_cell_table(&[(Rank::new(0), vec![GlobalCell::new(1)])]);
        buf.push(0);
        assert!(decode_cell_table(&buf).is_none());
    }

    #[test]
    fn neighborhood_record_owner_sentinel() {
        let mut owners = [3i32; 26];
        owners[4] = WIRE_UNKNOWN_OWNER;
        let rec = NeighborhoodRecord::new(GlobalCell::new(11), owners);
        assert_eq!(rec.base_cell(), GlobalCell::new(11));
        assert_eq!(rec.owner(0), Some(Rank::new(3)));
        assert_eq!(rec.owner(4), None);
    }
}
