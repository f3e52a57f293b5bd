//! Triangulated input surface and the read-only queries the mesher needs
//!
//! The mesh engine never mutates the surface after the one-off
//! [`TriSurface::prepare`] pass; every later stage only asks it geometric
//! questions (nearest point, nearest feature edge, box overlap).

mod primitives;

pub use primitives::{
    closest_on_segment, closest_on_triangle, triangle_overlaps_box, Aabb,
};

use crate::Error;
use log::{info, warn};
use nalgebra::{Point3, Vector3};
use std::collections::HashMap;

/// A triangle of the input surface, tagged with the patch it belongs to
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Triangle {
    /// Point indices, counter-clockwise seen from outside
    pub verts: [usize; 3],
    /// Index into [`TriSurface::patch_names`]
    pub patch: usize,
}

/// A sharp edge of the surface that must survive projection
#[derive(Copy, Clone, Debug)]
pub struct FeatureEdge {
    /// Point indices of the edge endpoints
    pub ends: [usize; 2],
    /// The two patches the edge separates
    pub patches: [usize; 2],
}

/// A closed triangulated surface with classified sharp features
#[derive(Clone, Debug, Default)]
pub struct TriSurface {
    /// Vertex positions
    pub points: Vec<Point3<f64>>,
    /// Triangles, each tagged with a patch
    pub triangles: Vec<Triangle>,
    /// Patch names, indexed by [`Triangle::patch`]
    pub patch_names: Vec<String>,
    /// Classified sharp edges
    pub feature_edges: Vec<FeatureEdge>,
    /// Corner points, where three or more feature edges meet
    pub corners: Vec<usize>,
}

impl TriSurface {
    /// Builds a surface from raw points and triangles, all in one patch
    pub fn new(points: Vec<Point3<f64>>, tris: Vec<[usize; 3]>) -> Self {
        Self {
            points,
            triangles: tris
                .into_iter()
                .map(|verts| Triangle { verts, patch: 0 })
                .collect(),
            patch_names: vec!["defaultFaces".to_owned()],
            feature_edges: vec![],
            corners: vec![],
        }
    }

    /// Axis-aligned box triangulated into 12 triangles across 6 patches
    ///
    /// Patches are named `xMin`, `xMax`, `yMin`, `yMax`, `zMin`, `zMax`.
    /// Used by tests and the demo driver.
    pub fn hexahedron(b: &Aabb) -> Self {
        let (lo, hi) = (b.min, b.max);
        let p = |x: bool, y: bool, z: bool| {
            Point3::new(
                if x { hi.x } else { lo.x },
                if y { hi.y } else { lo.y },
                if z { hi.z } else { lo.z },
            )
        };
        // Corner numbering matches octree corner order: bit 0 = x, 1 = y, 2 = z
        let points: Vec<_> = (0..8u8)
            .map(|i| p(i & 1 != 0, i & 2 != 0, i & 4 != 0))
            .collect();
        // Outward-facing quads per side, split along a diagonal
        let sides: [( &str, [usize; 4]); 6] = [
            ("xMin", [0, 4, 6, 2]),
            ("xMax", [1, 3, 7, 5]),
            ("yMin", [0, 1, 5, 4]),
            ("yMax", [2, 6, 7, 3]),
            ("zMin", [0, 2, 3, 1]),
            ("zMax", [4, 5, 7, 6]),
        ];
        let mut out = Self {
            points,
            triangles: vec![],
            patch_names: vec![],
            feature_edges: vec![],
            corners: vec![],
        };
        for (patch, (name, q)) in sides.iter().enumerate() {
            out.patch_names.push((*name).to_owned());
            out.triangles.push(Triangle {
                verts: [q[0], q[1], q[2]],
                patch,
            });
            out.triangles.push(Triangle {
                verts: [q[0], q[2], q[3]],
                patch,
            });
        }
        out.classify_features(45.0_f64.to_radians());
        out
    }

    /// Bounding box of the surface
    ///
    /// # Errors
    /// [`Error::EmptySurface`] if there are no triangles, or
    /// [`Error::DegenerateRootBox`] if the box has zero extent on any axis.
    pub fn bounding_box(&self) -> Result<Aabb, Error> {
        if self.triangles.is_empty() {
            return Err(Error::EmptySurface);
        }
        let bb = Aabb::around(self.points.iter()).ok_or(Error::EmptySurface)?;
        let span = bb.span();
        if span.x <= 0.0 || span.y <= 0.0 || span.z <= 0.0 {
            return Err(Error::DegenerateRootBox(bb.min.into(), bb.max.into()));
        }
        Ok(bb)
    }

    /// The three vertex positions of triangle `t`
    pub fn tri_points(&self, t: usize) -> [Point3<f64>; 3] {
        let tri = &self.triangles[t];
        [
            self.points[tri.verts[0]],
            self.points[tri.verts[1]],
            self.points[tri.verts[2]],
        ]
    }

    /// Unnormalised outward normal of triangle `t`
    pub fn tri_normal(&self, t: usize) -> Vector3<f64> {
        let [a, b, c] = self.tri_points(t);
        (b - a).cross(&(c - a))
    }

    /// Whether triangle `t` overlaps the given box
    pub fn tri_overlaps_box(&self, t: usize, b: &Aabb) -> bool {
        let [p0, p1, p2] = self.tri_points(t);
        triangle_overlaps_box(b, &p0, &p1, &p2)
    }

    /// Closest point to `p` on triangle `t`
    pub fn nearest_on_triangle(&self, t: usize, p: &Point3<f64>) -> Point3<f64> {
        let [a, b, c] = self.tri_points(t);
        closest_on_triangle(p, &a, &b, &c)
    }

    /// Closest point to `p` over a candidate triangle set
    ///
    /// Returns `(position, triangle)` of the best hit, or `None` if the
    /// candidate list is empty.
    pub fn nearest_in_candidates(
        &self,
        p: &Point3<f64>,
        candidates: &[usize],
    ) -> Option<(Point3<f64>, usize)> {
        let mut best: Option<(f64, Point3<f64>, usize)> = None;
        for &t in candidates {
            let q = self.nearest_on_triangle(t, p);
            let d = (q - p).norm_squared();
            if best.map(|(bd, _, _)| d < bd).unwrap_or(true) {
                best = Some((d, q, t));
            }
        }
        best.map(|(_, q, t)| (q, t))
    }

    /// Closest point to `p` on any feature edge
    ///
    /// Returns `(position, feature edge index)`.
    pub fn nearest_on_feature_edge(
        &self,
        p: &Point3<f64>,
    ) -> Option<(Point3<f64>, usize)> {
        let mut best: Option<(f64, Point3<f64>, usize)> = None;
        for (ei, e) in self.feature_edges.iter().enumerate() {
            let q = closest_on_segment(
                p,
                &self.points[e.ends[0]],
                &self.points[e.ends[1]],
            );
            let d = (q - p).norm_squared();
            if best.map(|(bd, _, _)| d < bd).unwrap_or(true) {
                best = Some((d, q, ei));
            }
        }
        best.map(|(_, q, e)| (q, e))
    }

    /// Closest corner point to `p`
    pub fn nearest_corner(&self, p: &Point3<f64>) -> Option<Point3<f64>> {
        self.corners
            .iter()
            .map(|&c| self.points[c])
            .min_by(|a, b| {
                (a - p).norm_squared().total_cmp(&(b - p).norm_squared())
            })
    }

    /// Map from undirected edge to adjacent triangle indices
    fn edge_triangles(&self) -> HashMap<(usize, usize), Vec<usize>> {
        let mut out: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
        for (t, tri) in self.triangles.iter().enumerate() {
            for i in 0..3 {
                let a = tri.verts[i];
                let b = tri.verts[(i + 1) % 3];
                out.entry((a.min(b), a.max(b))).or_default().push(t);
            }
        }
        out
    }

    /// One-off cleanup pass performed before meshing begins
    ///
    /// Removes duplicate and degenerate triangles, classifies feature
    /// edges by `feature_angle` (radians) if none were supplied, and runs
    /// the closed-2-manifold check.  Triangles that fail the manifold
    /// check are returned so the caller can tag them into a diagnostic
    /// subset; an open surface is reported, not fatal.
    pub fn prepare(&mut self, feature_angle: f64) -> Vec<usize> {
        let n_before = self.triangles.len();

        // Duplicate removal keys on the sorted vertex triple
        let mut seen = HashMap::new();
        let mut keep = Vec::with_capacity(self.triangles.len());
        for tri in &self.triangles {
            let mut key = tri.verts;
            key.sort_unstable();
            let degenerate = key[0] == key[1]
                || key[1] == key[2]
                || self.tri_area_sq(tri) <= f64::EPSILON;
            if !degenerate && seen.insert(key, ()).is_none() {
                keep.push(*tri);
            }
        }
        self.triangles = keep;
        if self.triangles.len() != n_before {
            info!(
                "surface cleanup removed {} duplicate/degenerate triangles",
                n_before - self.triangles.len()
            );
        }

        if self.feature_edges.is_empty() {
            self.classify_features(feature_angle);
        }

        // Closed-manifold check: every edge must have exactly two sides
        let mut bad = vec![];
        for (_, tris) in self.edge_triangles() {
            if tris.len() != 2 {
                bad.extend(tris);
            }
        }
        bad.sort_unstable();
        bad.dedup();
        if !bad.is_empty() {
            warn!(
                "surface is not a closed 2-manifold: {} offending triangles",
                bad.len()
            );
        }
        bad
    }

    fn tri_area_sq(&self, tri: &Triangle) -> f64 {
        let a = self.points[tri.verts[0]];
        let b = self.points[tri.verts[1]];
        let c = self.points[tri.verts[2]];
        (b - a).cross(&(c - a)).norm_squared() * 0.25
    }

    /// Classifies feature edges by dihedral angle and finds corner points
    ///
    /// An edge becomes a feature when the normals of its two triangles
    /// differ by more than `feature_angle` (radians) or when its sides lie
    /// in different patches; a point becomes a corner when three or more
    /// feature edges meet there.
    pub fn classify_features(&mut self, feature_angle: f64) {
        let cos_limit = feature_angle.cos();
        self.feature_edges.clear();

        for ((a, b), tris) in self.edge_triangles() {
            if tris.len() != 2 {
                continue;
            }
            let (t0, t1) = (tris[0], tris[1]);
            let n0 = self.tri_normal(t0).normalize();
            let n1 = self.tri_normal(t1).normalize();
            let p0 = self.triangles[t0].patch;
            let p1 = self.triangles[t1].patch;
            if n0.dot(&n1) < cos_limit || p0 != p1 {
                self.feature_edges.push(FeatureEdge {
                    ends: [a, b],
                    patches: [p0, p1],
                });
            }
        }

        let mut edge_count = vec![0usize; self.points.len()];
        for e in &self.feature_edges {
            edge_count[e.ends[0]] += 1;
            edge_count[e.ends[1]] += 1;
        }
        self.corners = edge_count
            .iter()
            .enumerate()
            .filter(|(_, &n)| n >= 3)
            .map(|(i, _)| i)
            .collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unit_cube() -> TriSurface {
        TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 1.0),
        ))
    }

    #[test]
    fn cube_features() {
        let s = unit_cube();
        assert_eq!(s.triangles.len(), 12);
        assert_eq!(s.patch_names.len(), 6);
        // The 12 cube edges are features; in-patch diagonals are coplanar
        assert_eq!(s.feature_edges.len(), 12);
        assert_eq!(s.corners.len(), 8);
    }

    #[test]
    fn cube_is_closed() {
        let mut s = unit_cube();
        let bad = s.prepare(45.0_f64.to_radians());
        assert!(bad.is_empty());
        assert_eq!(s.triangles.len(), 12);
    }

    #[test]
    fn duplicate_removal() {
        let mut s = unit_cube();
        let dup = s.triangles[0];
        s.triangles.push(dup);
        s.prepare(45.0_f64.to_radians());
        assert_eq!(s.triangles.len(), 12);
    }

    #[test]
    fn open_surface_reported() {
        let mut s = unit_cube();
        s.triangles.pop();
        let bad = s.prepare(45.0_f64.to_radians());
        assert!(!bad.is_empty());
    }

    #[test]
    fn outward_normals() {
        let s = unit_cube();
        let c = Point3::new(0.5, 0.5, 0.5);
        for t in 0..s.triangles.len() {
            let [a, b, cc] = s.tri_points(t);
            let centre = Point3::from((a.coords + b.coords + cc.coords) / 3.0);
            assert!(s.tri_normal(t).dot(&(centre - c)) > 0.0);
        }
    }
}
