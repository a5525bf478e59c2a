//! Octagon subdomain geometry.
//!
//! A subdomain of the grid-based strategy is bounded by eight corner vertices
//! arranged as a (possibly sheared) cuboid. Vertex `0` is the upper corner in
//! all three axes; vertex `i` takes the lower coordinate along axis `d` when
//! bit `d` of `i` is set, so vertex `7` is the opposite lower corner.
//!
//! Containment works on a fixed-point integer grid: a [`Precision`] fixes the
//! number of grid points per unit length and every vertex and query point is
//! rounded onto that grid. The octagon is decomposed into the six tetrahedra
//! spanning its main diagonal; a point is inside if an exact orientation test
//! places it in one of them. Points on a boundary are resolved by a symbolic
//! perturbation toward the lower corner with lexicographic tie-breaking
//! across the axes. The net effect: of the six outer faces, exactly the three
//! adjacent to vertex `0` accept their boundary points, and when octagons
//! tile space every point lies in exactly one of them.

use crate::error::{GridError, Result};

/// Grid points per unit length of the fixed-point embedding.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Precision(i16);

impl Precision {
    /// Upper bound on grid points along one axis; keeps every orientation
    /// determinant exactly representable in 128-bit arithmetic.
    const MAX_AXIS_SPAN: f64 = (1u64 << 19) as f64;

    /// Creates a precision of `points` grid points per unit length.
    ///
    /// `points` must be positive and even (so that midpoints of unit
    /// intervals are representable exactly).
    pub fn new(points: i16) -> Result<Self> {
        if points <= 0 || points % 2 != 0 {
            return Err(GridError::InvalidGeometry(
                "precision must be a positive even number of grid points",
            ));
        }
        Ok(Precision(points))
    }

    /// Picks a precision suited to a given box and minimum cell size: at
    /// least ten grid points per cell where the axis-span bound allows it.
    pub fn for_box(min_cell_size: f64, box_size: [f64; 3]) -> Self {
        let max_extent = box_size.iter().cloned().fold(1.0f64, f64::max);
        let cap = (Self::MAX_AXIS_SPAN / max_extent)
            .min(i16::MAX as f64 - 1.0)
            .max(10.0);
        let want = (10.0 / min_cell_size).ceil().clamp(10.0, cap);
        let mut p = want as i16;
        if p % 2 != 0 {
            p -= 1;
        }
        Precision(p.max(10))
    }

    /// Grid points per unit length.
    #[inline]
    pub fn get(self) -> i16 {
        self.0
    }

    /// Rounds a position onto the grid.
    #[inline]
    pub fn discretize(self, p: [f64; 3]) -> [i64; 3] {
        let s = self.0 as f64;
        [
            (p[0] * s).round() as i64,
            (p[1] * s).round() as i64,
            (p[2] * s).round() as i64,
        ]
    }

    /// Length of a world-space extent in grid points, rounded.
    #[inline]
    pub fn span(self, length: f64) -> i64 {
        (length * self.0 as f64).round() as i64
    }
}

/// Corner vertices of an octagon, vertex `0` the upper corner.
pub type Vertices = [[f64; 3]; 8];

/// The six axis permutations generating the tetrahedra of the main-diagonal
/// decomposition, and the orientation sign each tetrahedron carries for a
/// proper (non-inverted) octagon.
const TET_PERMS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];
const TET_SIGNS: [i32; 6] = [-1, 1, 1, -1, -1, 1];

/// One subdomain bounded by eight corner vertices, fixed-point embedded.
pub struct Octagon {
    pts: [[i64; 3]; 8],
    precision: Precision,
    validity: Option<bool>,
    /// Vertex bounding box, for cheap rejection before the exact tests.
    bbox: ([i64; 3], [i64; 3]),
}

fn bbox_of(pts: &[[i64; 3]; 8]) -> ([i64; 3], [i64; 3]) {
    let mut lo = pts[0];
    let mut hi = pts[0];
    for p in &pts[1..] {
        for d in 0..3 {
            lo[d] = lo[d].min(p[d]);
            hi[d] = hi[d].max(p[d]);
        }
    }
    (lo, hi)
}

impl Octagon {
    /// Builds an octagon without a cutoff; [`Octagon::is_valid`] will be
    /// unavailable.
    pub fn new(vertices: &Vertices, precision: Precision) -> Self {
        let pts = vertices.map(|v| precision.discretize(v));
        Self::from_grid_points(pts, precision)
    }

    /// Builds an octagon and records whether it is valid with respect to the
    /// given maximum interaction cutoff.
    pub fn with_cutoff(vertices: &Vertices, precision: Precision, max_cutoff: f64) -> Self {
        let pts = vertices.map(|v| precision.discretize(v));
        Self::from_grid_points_with_cutoff(pts, precision, max_cutoff)
    }

    /// Builds an octagon from already discretized vertices.
    pub fn from_grid_points(pts: [[i64; 3]; 8], precision: Precision) -> Self {
        Octagon {
            pts,
            precision,
            validity: None,
            bbox: bbox_of(&pts),
        }
    }

    /// Builds an octagon from discretized vertices and records validity.
    pub fn from_grid_points_with_cutoff(
        pts: [[i64; 3]; 8],
        precision: Precision,
        max_cutoff: f64,
    ) -> Self {
        let cutoff_grid = max_cutoff * precision.get() as f64;
        let valid = orientation_consistent(&pts) && face_distances_at_least(&pts, cutoff_grid);
        Octagon {
            pts,
            precision,
            validity: Some(valid),
            bbox: bbox_of(&pts),
        }
    }

    /// Whether the octagon has positive volume and its opposite faces are at
    /// least the construction cutoff apart.
    ///
    /// Fails with [`GridError::MissingCutoff`] if the octagon was built
    /// without a cutoff.
    pub fn is_valid(&self) -> Result<bool> {
        self.validity.ok_or(GridError::MissingCutoff)
    }

    /// Tests whether a world-space point lies in this octagon.
    pub fn contains(&self, p: [f64; 3]) -> bool {
        self.contains_point(self.precision.discretize(p))
    }

    /// Tests whether a point lies in this octagon under periodic wrap.
    ///
    /// Octagons tiling a periodic box may reach across its boundary; their
    /// vertices then live outside `[0, L)`. A point is inside if any of its
    /// periodic images is.
    pub fn contains_wrapped(&self, p: [f64; 3], box_size: [f64; 3]) -> bool {
        let gp = self.precision.discretize(p);
        let span = [
            self.precision.span(box_size[0]),
            self.precision.span(box_size[1]),
            self.precision.span(box_size[2]),
        ];
        for sx in -1..=1i64 {
            for sy in -1..=1i64 {
                for sz in -1..=1i64 {
                    let img = [gp[0] + sx * span[0], gp[1] + sy * span[1], gp[2] + sz * span[2]];
                    if self.contains_point(img) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Tests an already discretized point.
    pub fn contains_point(&self, gp: [i64; 3]) -> bool {
        let (lo, hi) = self.bbox;
        if (0..3).any(|d| gp[d] < lo[d] || gp[d] > hi[d]) {
            return false;
        }
        (0..6).any(|k| self.tet_contains(k, gp))
    }

    fn tet(&self, k: usize) -> [[i64; 3]; 4] {
        let [a, b, _c] = TET_PERMS[k];
        let i1 = 1usize << a;
        let i2 = i1 | (1usize << b);
        [self.pts[0], self.pts[i1], self.pts[i2], self.pts[7]]
    }

    fn tet_contains(&self, k: usize, p: [i64; 3]) -> bool {
        let t = self.tet(k);
        let vol = orient_exact(t[0], t[1], t[2], t[3]);
        if vol == 0 {
            return false;
        }
        // Faces omit one vertex each; the remaining three keep their order.
        const FACES: [[usize; 4]; 4] = [[1, 2, 3, 0], [0, 2, 3, 1], [0, 1, 3, 2], [0, 1, 2, 3]];
        FACES.iter().all(|&[a, b, c, opp]| {
            let want = sign(orient_exact(t[a], t[b], t[c], t[opp]));
            orient_perturbed(t[a], t[b], t[c], p) == want
        })
    }
}

#[inline]
fn sign(x: i128) -> i32 {
    match x.cmp(&0) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

#[inline]
fn sub(a: [i64; 3], b: [i64; 3]) -> [i64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn cross(u: [i64; 3], v: [i64; 3]) -> [i64; 3] {
    [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ]
}

/// Exact orientation of `p` against the plane through `a`, `b`, `c`.
fn orient_exact(a: [i64; 3], b: [i64; 3], c: [i64; 3], p: [i64; 3]) -> i128 {
    let n = cross(sub(b, a), sub(c, a));
    let d = sub(p, a);
    n[0] as i128 * d[0] as i128 + n[1] as i128 * d[1] as i128 + n[2] as i128 * d[2] as i128
}

/// Orientation of `p` symbolically perturbed toward the lower corner.
///
/// The perturbed point is `p - eps * (1, delta, delta^2)` with
/// `1 >> delta > 0` infinitesimal, so the plane normal breaks ties
/// lexicographically by axis. Never returns 0 for a non-degenerate plane.
fn orient_perturbed(a: [i64; 3], b: [i64; 3], c: [i64; 3], p: [i64; 3]) -> i32 {
    let d = orient_exact(a, b, c, p);
    if d != 0 {
        return sign(d);
    }
    let n = cross(sub(b, a), sub(c, a));
    for comp in n {
        if comp != 0 {
            return sign(-(comp as i128));
        }
    }
    0
}

/// Checks that all six tetrahedra carry the orientation sign a proper
/// octagon implies (inverted or collapsed configurations fail).
fn orientation_consistent(pts: &[[i64; 3]; 8]) -> bool {
    TET_PERMS.iter().zip(TET_SIGNS).all(|(&[a, b, _], want)| {
        let i1 = 1usize << a;
        let i2 = i1 | (1usize << b);
        sign(orient_exact(pts[0], pts[i1], pts[i2], pts[7])) == want
    })
}

/// Checks that each pair of opposite faces is at least `cutoff_grid` apart,
/// with every vertex of the far face on the inner side.
fn face_distances_at_least(pts: &[[i64; 3]; 8], cutoff_grid: f64) -> bool {
    for axis in 0..3 {
        let (e, f) = match axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        // Corner cycle of the upper face; the lower face adds the axis bit.
        let cycle = [0, 1 << e, (1 << e) | (1 << f), 1 << f];
        let upper = cycle.map(|i| pts[i]);
        let lower = cycle.map(|i| pts[i | (1 << axis)]);
        if !face_clearance(&upper, &lower, cutoff_grid)
            || !face_clearance(&lower, &upper, cutoff_grid)
        {
            return false;
        }
    }
    true
}

/// Distance of all of `far`'s vertices from both triangles of `near`, signed
/// toward `far`. All distances must be positive and at least `cutoff_grid`.
fn face_clearance(near: &[[i64; 3]; 4], far: &[[i64; 3]; 4], cutoff_grid: f64) -> bool {
    for tri in [[near[0], near[1], near[2]], [near[0], near[2], near[3]]] {
        let n = cross(sub(tri[1], tri[0]), sub(tri[2], tri[0]));
        let norm = ((n[0] as f64).powi(2) + (n[1] as f64).powi(2) + (n[2] as f64).powi(2)).sqrt();
        if norm == 0.0 {
            return false;
        }
        let dist = |p: [i64; 3]| {
            let d = sub(p, tri[0]);
            (n[0] as f64 * d[0] as f64 + n[1] as f64 * d[1] as f64 + n[2] as f64 * d[2] as f64)
                / norm
        };
        // Orient the normal toward the far face.
        let s = if dist(far[0]) < 0.0 { -1.0 } else { 1.0 };
        if far.iter().any(|&p| s * dist(p) < cutoff_grid) {
            return false;
        }
    }
    true
}
