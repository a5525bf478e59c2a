//! Strongly typed indices for cells, ranks and neighborhood slots.
//!
//! The grid juggles several integer spaces: global cell indices, local cell
//! indices, ghost cell indices, process ranks and full-shell neighborhood
//! slots. Conflating any two of them is a classic source of silent
//! corruption, so each gets its own nominal newtype. Conversions are explicit
//! and local-or-ghost results are a sum type instead of a signed integer
//! split by magnitude.

use std::fmt;

/// Rank of a process in the communicator, `0..size`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[repr(transparent)]
pub struct Rank(u32);

impl Rank {
    #[inline]
    pub const fn new(r: u32) -> Self {
        Rank(r)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Index into per-rank arrays.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn from_usize(r: usize) -> Self {
        Rank(r as u32)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global cell identity.
///
/// For most strategies this is the row-major linearization of the cell grid;
/// the space-filling-curve strategy uses Morton codes instead. Within one
/// strategy the meaning is fixed, and equality across ranks identifies the
/// same physical cell.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[repr(transparent)]
pub struct GlobalCell(u64);

impl GlobalCell {
    #[inline]
    pub const fn new(idx: u64) -> Self {
        GlobalCell(idx)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GlobalCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a cell owned by this rank, `0..n_local_cells`.
///
/// Invalidated by every successful repartitioning.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[repr(transparent)]
pub struct LocalCell(u32);

impl LocalCell {
    #[inline]
    pub const fn new(idx: u32) -> Self {
        LocalCell(idx)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Index of a ghost cell cached on this rank, `0..n_ghost_cells`.
///
/// Invalidated by every successful repartitioning.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[repr(transparent)]
pub struct GhostCell(u32);

impl GhostCell {
    #[inline]
    pub const fn new(idx: u32) -> Self {
        GhostCell(idx)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A cell known to this rank: either local or cached as a ghost.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CellIndex {
    /// Cell owned by this rank.
    Local(LocalCell),
    /// Cell owned by another rank, cached in the ghost layer.
    Ghost(GhostCell),
}

impl CellIndex {
    #[inline]
    pub fn is_local(self) -> bool {
        matches!(self, CellIndex::Local(_))
    }

    #[inline]
    pub fn is_ghost(self) -> bool {
        matches!(self, CellIndex::Ghost(_))
    }

    /// Position in the combined storage where local cells occupy
    /// `[0, n_local)` and ghost cells `[n_local, n_local + n_ghost)`.
    #[inline]
    pub fn storage_index(self, n_local: u32) -> usize {
        match self {
            CellIndex::Local(l) => l.as_usize(),
            CellIndex::Ghost(g) => n_local as usize + g.as_usize(),
        }
    }
}

/// Slot in the 27-cell full-shell neighborhood of a cell.
///
/// Slot 0 is the cell itself, slots `1..14` form the half shell and
/// `14..27` the remainder. The range is checked at construction; for
/// constant arguments the check happens at compile time.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[repr(transparent)]
pub struct FullShellIdx(u8);

impl FullShellIdx {
    /// Number of full-shell slots, the cell itself included.
    pub const COUNT: u8 = 27;
    /// The cell itself.
    pub const CENTER: FullShellIdx = FullShellIdx(0);

    /// Panics if `k >= 27`. In `const` position this is a compile error.
    #[inline]
    pub const fn new(k: u8) -> Self {
        assert!(k < Self::COUNT, "full-shell slot out of range");
        FullShellIdx(k)
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// All 27 slots, center first.
    #[inline]
    pub fn all() -> impl Iterator<Item = FullShellIdx> {
        (0..Self::COUNT).map(FullShellIdx)
    }

    /// The 26 slots excluding the center.
    #[inline]
    pub fn shell() -> impl Iterator<Item = FullShellIdx> {
        (1..Self::COUNT).map(FullShellIdx)
    }

    /// The 13 half-shell slots.
    #[inline]
    pub fn half_shell() -> impl Iterator<Item = FullShellIdx> {
        (1..14).map(FullShellIdx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_index_orders_local_before_ghost() {
        let l = CellIndex::Local(LocalCell::new(3));
        let g = CellIndex::Ghost(GhostCell::new(0));
        assert_eq!(l.storage_index(10), 3);
        assert_eq!(g.storage_index(10), 10);
    }

    #[test]
    fn full_shell_slot_counts() {
        assert_eq!(FullShellIdx::all().count(), 27);
        assert_eq!(FullShellIdx::shell().count(), 26);
        assert_eq!(FullShellIdx::half_shell().count(), 13);
        // Compile-time range check for constants.
        const UPPER: FullShellIdx = FullShellIdx::new(26);
        assert_eq!(UPPER.get(), 26);
    }

    #[test]
    #[should_panic]
    fn full_shell_slot_rejects_27() {
        let _ = FullShellIdx::new(27);
    }

    #[test]
    fn rank_roundtrip() {
        let r = Rank::from_usize(5);
        assert_eq!(r.get(), 5);
        assert_eq!(r.as_usize(), 5);
        assert_eq!(format!("{r}"), "5");
    }
}
