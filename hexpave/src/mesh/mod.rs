//! The central mutable polyhedral mesh
//!
//! Faces are ordered point loops; cells are lists of face indices.  Faces
//! are stored as one contiguous internal block followed by contiguous
//! per-patch boundary blocks.  Owner/neighbour addressing is derived data,
//! cached with an explicit validity flag: mutators invalidate it and the
//! next read recomputes it (stages never run concurrently, see the
//! pipeline module).
//!
//! Orientation invariant: the point loop of every face winds so that its
//! normal points out of its owner cell, and for internal faces the owner
//! is the lower-indexed cell.

pub mod modifier;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// A boundary patch: a named, contiguous range of boundary faces
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BoundaryPatch {
    /// Patch name
    pub name: String,
    /// Physical type tag (`wall`, `patch`, ...)
    pub patch_type: String,
    /// First face of the patch in the mesh face list
    pub start: usize,
    /// Number of faces in the patch
    pub size: usize,
}

impl BoundaryPatch {
    /// Face range of this patch
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.size
    }
}

/// Owner/neighbour addressing, recomputed on demand
#[derive(Clone, Debug, Default)]
pub struct Addressing {
    /// Cell on the positive side of each face
    pub owner: Vec<usize>,
    /// Cell on the negative side of each internal face
    pub neighbour: Vec<Option<usize>>,
    /// Faces using each point
    pub point_faces: Vec<Vec<usize>>,
    valid: bool,
}

/// The polyhedral volume mesh mutated in place by every pipeline stage
#[derive(Clone, Debug, Default)]
pub struct PolyMesh {
    /// Vertex positions
    pub points: Vec<Point3<f64>>,
    /// Faces as ordered point loops
    pub faces: Vec<Vec<usize>>,
    /// Cells as lists of face indices
    pub cells: Vec<Vec<usize>>,
    /// Boundary patches partitioning the trailing boundary face block
    pub boundaries: Vec<BoundaryPatch>,
    /// Named cell subsets (diagnostics)
    pub cell_subsets: BTreeMap<String, Vec<usize>>,
    /// Named face subsets (diagnostics)
    pub face_subsets: BTreeMap<String, Vec<usize>>,
    /// Named point subsets (diagnostics)
    pub point_subsets: BTreeMap<String, Vec<usize>>,
    addressing: Addressing,
}

impl PolyMesh {
    /// Builds a mesh from its raw components
    ///
    /// `boundaries` must partition the trailing block of `faces`.
    /// Addressing starts stale and is computed on first use.
    pub fn from_components(
        points: Vec<Point3<f64>>,
        faces: Vec<Vec<usize>>,
        cells: Vec<Vec<usize>>,
        boundaries: Vec<BoundaryPatch>,
    ) -> Self {
        Self {
            points,
            faces,
            cells,
            boundaries,
            ..Self::default()
        }
    }

    /// Number of internal faces
    ///
    /// Boundary patches always sit at the end of the face list, so this is
    /// the start of the first patch.
    pub fn n_internal_faces(&self) -> usize {
        self.boundaries
            .first()
            .map(|b| b.start)
            .unwrap_or(self.faces.len())
    }

    /// Whether `face` lies in the internal block
    pub fn is_internal(&self, face: usize) -> bool {
        face < self.n_internal_faces()
    }

    /// Range of all boundary faces
    pub fn boundary_faces(&self) -> std::ops::Range<usize> {
        self.n_internal_faces()..self.faces.len()
    }

    /// The patch containing `face`, if it is a boundary face
    pub fn patch_of(&self, face: usize) -> Option<usize> {
        self.boundaries
            .iter()
            .position(|b| b.range().contains(&face))
    }

    /// Marks the cached addressing as stale
    ///
    /// Every mutating operation calls this; recomputation only happens on
    /// the next [`PolyMesh::addressing`] read.
    pub fn invalidate_addressing(&mut self) {
        self.addressing.valid = false;
    }

    /// Owner/neighbour and point-face addressing, recomputing if stale
    pub fn addressing(&mut self) -> &Addressing {
        if !self.addressing.valid {
            self.recompute_addressing();
        }
        &self.addressing
    }

    fn recompute_addressing(&mut self) {
        let n_faces = self.faces.len();
        let mut owner = vec![usize::MAX; n_faces];
        let mut neighbour = vec![None; n_faces];

        for (c, faces) in self.cells.iter().enumerate() {
            for &f in faces {
                if owner[f] == usize::MAX {
                    owner[f] = c;
                } else {
                    debug_assert!(neighbour[f].is_none());
                    // Orientation invariant: owner is the lower cell index
                    if owner[f] < c {
                        neighbour[f] = Some(c);
                    } else {
                        neighbour[f] = Some(owner[f]);
                        owner[f] = c;
                    }
                }
            }
        }

        let mut point_faces = vec![vec![]; self.points.len()];
        for (f, face) in self.faces.iter().enumerate() {
            for &p in face {
                point_faces[p].push(f);
            }
        }

        self.addressing = Addressing {
            owner,
            neighbour,
            point_faces,
            valid: true,
        };
    }

    /// Area vector of `face` (Newell), magnitude = face area
    pub fn face_area(&self, face: usize) -> Vector3<f64> {
        let f = &self.faces[face];
        let mut n = Vector3::zeros();
        for i in 0..f.len() {
            let a = self.points[f[i]];
            let b = self.points[f[(i + 1) % f.len()]];
            n += (a - Point3::origin()).cross(&(b - Point3::origin()));
        }
        n * 0.5
    }

    /// Centre of `face`
    pub fn face_centre(&self, face: usize) -> Point3<f64> {
        let f = &self.faces[face];
        let mut c = Vector3::zeros();
        for &p in f {
            c += self.points[p].coords;
        }
        Point3::from(c / f.len() as f64)
    }

    /// Centroid of `cell` (mean of its face centres)
    pub fn cell_centre(&self, cell: usize) -> Point3<f64> {
        let faces = &self.cells[cell];
        let mut c = Vector3::zeros();
        for &f in faces {
            c += self.face_centre(f).coords;
        }
        Point3::from(c / faces.len() as f64)
    }

    /// Signed volume of `cell` via the divergence theorem
    ///
    /// Positive for a well-formed cell; inverted cells come out negative.
    pub fn cell_volume(&mut self, cell: usize) -> f64 {
        self.addressing();
        let this = &*self;
        let mut v = 0.0;
        for &f in &this.cells[cell] {
            let sf = this.face_area(f);
            let cf = this.face_centre(f);
            let flux = cf.coords.dot(&sf);
            v += if this.addressing.owner[f] == cell { flux } else { -flux };
        }
        v / 3.0
    }

    /// Signed volumes of all cells, computed in parallel
    pub fn cell_volumes(&mut self) -> Vec<f64> {
        self.addressing();
        let this = &*self;
        (0..this.cells.len())
            .into_par_iter()
            .map(|c| {
                let mut v = 0.0;
                for &f in &this.cells[c] {
                    let sf = this.face_area(f);
                    let cf = this.face_centre(f);
                    let flux = cf.coords.dot(&sf);
                    v += if this.addressing.owner[f] == c {
                        flux
                    } else {
                        -flux
                    };
                }
                v / 3.0
            })
            .collect()
    }

    /// Checks the structural invariants, returning human-readable
    /// violations (empty = valid)
    ///
    /// Covers the owner/neighbour invariant and the patch partition
    /// invariant; meant for tests and post-stage assertions.
    pub fn check(&mut self) -> Vec<String> {
        let mut errs = vec![];
        let n_internal = self.n_internal_faces();
        let n_faces = self.faces.len();
        let n_cells = self.cells.len();
        self.addressing();
        let owner = self.addressing.owner.clone();
        let neighbour = self.addressing.neighbour.clone();

        for f in 0..n_faces {
            if owner[f] == usize::MAX {
                errs.push(format!("face {f} has no owner"));
                continue;
            }
            if owner[f] >= n_cells {
                errs.push(format!("face {f} owner {} out of range", owner[f]));
            }
            match neighbour[f] {
                Some(n) if f >= n_internal => {
                    errs.push(format!("boundary face {f} has neighbour {n}"));
                }
                Some(n) if n == owner[f] => {
                    errs.push(format!("face {f} owner == neighbour == {n}"));
                }
                None if f < n_internal => {
                    errs.push(format!("internal face {f} has no neighbour"));
                }
                _ => (),
            }
        }

        // Patch partition: contiguous, no overlap, covering the boundary
        let mut expected = n_internal;
        for (i, b) in self.boundaries.iter().enumerate() {
            if b.start != expected {
                errs.push(format!(
                    "patch {i} ({}) starts at {} instead of {expected}",
                    b.name, b.start
                ));
            }
            expected = b.start + b.size;
        }
        if expected != n_faces {
            errs.push(format!(
                "patches end at {expected} instead of {n_faces}"
            ));
        }

        for (c, faces) in self.cells.iter().enumerate() {
            if faces.is_empty() {
                errs.push(format!("cell {c} has no faces"));
            }
            for &f in faces {
                if f >= n_faces {
                    errs.push(format!("cell {c} references face {f}"));
                }
            }
        }
        errs
    }

    /// Number of boundary faces of each cell
    pub fn boundary_face_count_per_cell(&mut self) -> Vec<usize> {
        self.addressing();
        let this = &*self;
        let mut out = vec![0; this.cells.len()];
        for f in this.boundary_faces() {
            out[this.addressing.owner[f]] += 1;
        }
        out
    }

    /// Marks every point used by a boundary face
    pub fn boundary_point_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.points.len()];
        for f in self.boundary_faces() {
            for &p in &self.faces[f] {
                mask[p] = true;
            }
        }
        mask
    }
}

#[cfg(test)]
pub(crate) mod test_meshes {
    use super::*;

    /// Two unit hexes sharing one internal face, one patch of 10 boundary
    /// faces
    pub fn two_hex_mesh() -> PolyMesh {
        let mut points = vec![];
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..3 {
                    points.push(Point3::new(i as f64, j as f64, k as f64));
                }
            }
        }
        let p = |i: usize, j: usize, k: usize| k * 6 + j * 3 + i;

        // Shared face between the two cells, normal towards +x (cell 1)
        let shared = vec![p(1, 0, 0), p(1, 1, 0), p(1, 1, 1), p(1, 0, 1)];

        let quad = |a: usize, b: usize, c: usize, d: usize| vec![a, b, c, d];
        let mut faces = vec![shared];
        let mut cells = vec![vec![0], vec![0]];

        // Boundary faces of cell 0 (x in [0,1]) and cell 1 (x in [1,2]),
        // wound outward
        let mut bnd = vec![];
        for (cell, x0, x1) in [(0usize, 0usize, 1usize), (1, 1, 2)] {
            let sides: [Vec<usize>; 5] = [
                // x-min only for cell 0, x-max only for cell 1
                if cell == 0 {
                    quad(p(x0, 0, 0), p(x0, 0, 1), p(x0, 1, 1), p(x0, 1, 0))
                } else {
                    quad(p(x1, 0, 0), p(x1, 1, 0), p(x1, 1, 1), p(x1, 0, 1))
                },
                quad(p(x0, 0, 0), p(x1, 0, 0), p(x1, 0, 1), p(x0, 0, 1)),
                quad(p(x0, 1, 0), p(x0, 1, 1), p(x1, 1, 1), p(x1, 1, 0)),
                quad(p(x0, 0, 0), p(x0, 1, 0), p(x1, 1, 0), p(x1, 0, 0)),
                quad(p(x0, 0, 1), p(x1, 0, 1), p(x1, 1, 1), p(x0, 1, 1)),
            ];
            for s in sides {
                bnd.push((cell, s));
            }
        }
        for (cell, f) in bnd {
            cells[cell].push(faces.len());
            faces.push(f);
        }

        PolyMesh {
            points,
            faces,
            cells,
            boundaries: vec![BoundaryPatch {
                name: "defaultFaces".into(),
                patch_type: "patch".into(),
                start: 1,
                size: 10,
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_meshes::two_hex_mesh;
    use approx::assert_relative_eq;

    #[test]
    fn addressing_owner_neighbour() {
        let mut m = two_hex_mesh();
        assert!(m.check().is_empty(), "{:?}", m.check());
        let addr = m.addressing();
        assert_eq!(addr.owner[0], 0);
        assert_eq!(addr.neighbour[0], Some(1));
        for f in 1..11 {
            assert!(addr.neighbour[f].is_none());
        }
    }

    #[test]
    fn volumes_positive() {
        let mut m = two_hex_mesh();
        let v = m.cell_volumes();
        assert_eq!(v.len(), 2);
        assert_relative_eq!(v[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(v[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn face_geometry() {
        let mut m = two_hex_mesh();
        // Shared face: unit area, normal towards +x (out of owner 0)
        let a = m.face_area(0);
        assert_relative_eq!(a.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(a.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(a.z, 0.0, epsilon = 1e-12);
        let c = m.face_centre(0);
        assert_relative_eq!(c.x, 1.0, epsilon = 1e-12);
        let _ = m.addressing();
    }

    #[test]
    fn boundary_face_counts() {
        let mut m = two_hex_mesh();
        // 10 boundary faces split evenly over the two hexes
        assert_eq!(m.boundary_face_count_per_cell(), vec![5, 5]);
    }

    #[test]
    fn from_components_matches_field_construction() {
        let mut m = two_hex_mesh();
        let owner = m.addressing().owner.clone();
        let mut built = super::PolyMesh::from_components(
            m.points.clone(),
            m.faces.clone(),
            m.cells.clone(),
            m.boundaries.clone(),
        );
        assert!(built.check().is_empty(), "{:?}", built.check());
        assert_eq!(built.addressing().owner, owner);
    }

    #[test]
    fn cache_invalidation() {
        let mut m = two_hex_mesh();
        let _ = m.addressing();
        m.invalidate_addressing();
        // Reads after invalidation recompute without panicking
        assert_eq!(m.addressing().owner.len(), m.faces.len());
    }
}
