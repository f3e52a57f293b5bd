//! Projection of mesh boundary points onto the input surface
//!
//! Points move in three steps: an optional planar collapse for 2D cases, a
//! coarse pre-map that pulls points already close to the surface onto it,
//! and the precise projection with feature snapping.  A point near a
//! feature edge of the surface (relative to the local cell size) lands on
//! the edge rather than the nearest triangle, and near-corner points land
//! on the corner, so sharp features survive; those points are handed back
//! as a locked set for the optimiser.

pub mod edges;

use crate::geom::TriSurface;
use crate::mesh::PolyMesh;
use crate::octree::Octree;
use log::{debug, info, warn};

/// Snap distances are measured against the local cell size scaled by this
const SNAP_TOL: f64 = 0.3;

/// What the precise projection did
#[derive(Clone, Debug, Default)]
pub struct MapReport {
    /// Boundary points moved onto the surface
    pub moved: usize,
    /// Points snapped to a feature edge (corners included)
    pub snapped_to_edges: usize,
    /// Points snapped to a surface corner
    pub snapped_to_corners: usize,
    /// Points with no reachable surface element, left in place
    pub failed: usize,
    /// Feature-snapped points, to be pinned by later stages
    pub locked: Vec<usize>,
}

/// Collapses near-planar points onto the plane `axis = value`
///
/// Supports extruded 2D cases where one pair of boundary planes must stay
/// exactly flat.  Returns the number of points adjusted.
pub fn collapse_to_plane(
    mesh: &mut PolyMesh,
    axis: usize,
    value: f64,
    tol: f64,
) -> usize {
    let mut n = 0;
    for p in mesh.points.iter_mut() {
        if (p[axis] - value).abs() <= tol && p[axis] != value {
            p[axis] = value;
            n += 1;
        }
    }
    if n > 0 {
        debug!("collapsed {n} points onto plane {axis} = {value}");
    }
    n
}

/// Coarse pre-map: moves boundary points already within half a cell of
/// the surface onto their nearest surface position
///
/// Points further out are left for the precise projection.  Returns the
/// number of points moved.
pub fn premap(
    mesh: &mut PolyMesh,
    octree: &Octree,
    surface: &TriSurface,
) -> usize {
    let on_boundary = mesh.boundary_point_mask();
    let mut n = 0;
    for (i, p) in mesh.points.iter_mut().enumerate() {
        if !on_boundary[i] {
            continue;
        }
        let local = octree.local_size(p);
        let candidates = octree.candidates_near(p, local);
        if let Some((q, _)) = surface.nearest_in_candidates(p, &candidates) {
            if (q - *p).norm() <= 0.5 * local {
                *p = q;
                n += 1;
            }
        }
    }
    info!("Pre-mapped {n} boundary points onto the surface");
    n
}

/// Precise projection of every boundary point onto the surface
///
/// The candidate search starts at twice the local cell size and widens
/// once; a point with nothing in reach even then is reported as failed and
/// keeps its position.
pub fn map_to_surface(
    mesh: &mut PolyMesh,
    octree: &Octree,
    surface: &TriSurface,
) -> MapReport {
    info!("Mapping mesh boundary points onto the surface");
    let on_boundary = mesh.boundary_point_mask();
    let mut report = MapReport::default();

    for (i, p) in mesh.points.iter_mut().enumerate() {
        if !on_boundary[i] {
            continue;
        }
        let local = octree.local_size(p);
        let mut candidates = octree.candidates_near(p, 2.0 * local);
        if candidates.is_empty() {
            candidates = octree.candidates_near(p, 4.0 * local);
        }
        let Some((q, _)) = surface.nearest_in_candidates(p, &candidates)
        else {
            report.failed += 1;
            continue;
        };

        let tol = SNAP_TOL * local;
        let mut target = q;
        if let Some((qe, _)) = surface.nearest_on_feature_edge(p) {
            if (qe - *p).norm() < (q - *p).norm() + tol {
                target = qe;
                report.snapped_to_edges += 1;
                report.locked.push(i);
                if let Some(qc) = surface.nearest_corner(p) {
                    if (qc - *p).norm() < (qe - *p).norm() + tol {
                        target = qc;
                        report.snapped_to_corners += 1;
                    }
                }
            }
        }

        if target != *p {
            report.moved += 1;
        }
        *p = target;
    }

    if report.failed > 0 {
        warn!(
            "{} boundary points had no surface element in reach \
             and were left in place",
            report.failed
        );
    }
    info!(
        "Moved {} points, snapped {} to feature edges ({} corners)",
        report.moved, report.snapped_to_edges, report.snapped_to_corners
    );
    report
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extract::extract;
    use crate::geom::Aabb;
    use crate::octree::BoxType;
    use nalgebra::Point3;

    fn cube() -> TriSurface {
        TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ))
    }

    fn template(padding: f64, levels: u8) -> (TriSurface, Octree, PolyMesh) {
        let s = cube();
        let mut o = Octree::build(&s, padding).unwrap();
        for _ in 0..levels {
            for l in o.leaves() {
                o.split(l, &s);
            }
        }
        let types = vec![BoxType::MeshCell; o.len()];
        let m = extract(&o, &types, 0).unwrap();
        (s, o, m)
    }

    fn distance_to_surface(s: &TriSurface, p: &Point3<f64>) -> f64 {
        let all: Vec<usize> = (0..s.triangles.len()).collect();
        let (q, _) = s.nearest_in_candidates(p, &all).unwrap();
        (q - p).norm()
    }

    #[test]
    fn exact_hull_snaps_features_only() {
        // Mesh hull coincides with the cube; nothing needs to move, but
        // the points on the 12 cube edges get locked
        let (s, o, mut m) = template(0.0, 2);
        let report = map_to_surface(&mut m, &o, &s);

        assert_eq!(report.failed, 0);
        // 12 edges with 3 interior points each, plus 8 corners
        assert_eq!(report.locked.len(), 44);
        assert_eq!(report.snapped_to_corners, 8);
        for p in &m.points {
            assert!(distance_to_surface(&s, p) < 1e-9 || !is_hull(p));
        }
    }

    fn is_hull(p: &Point3<f64>) -> bool {
        (0..3).any(|a| p[a] == 0.0 || p[a] == 2.0)
    }

    #[test]
    fn padded_hull_projects_inward() {
        let (s, o, mut m) = template(0.05, 2);
        let before = m.points.clone();
        let local = o.node_size(o.leaves()[0]);

        let report = map_to_surface(&mut m, &o, &s);
        assert_eq!(report.failed, 0);
        assert!(report.moved > 0);

        let on_boundary = m.boundary_point_mask();
        for (i, p) in m.points.iter().enumerate() {
            if on_boundary[i] {
                assert!(distance_to_surface(&s, p) < 1e-9);
            }
            // Projection locality: no point travels further than twice
            // the local cell size
            assert!((p - before[i]).norm() <= 2.0 * local);
        }

        // Squashed hull cells stay valid
        assert!(m.cell_volumes().iter().all(|&v| v > 0.0));
    }

    #[test]
    fn premap_moves_only_nearby_points() {
        let (s, o, mut m) = template(0.05, 2);
        let before = m.points.clone();
        let local = o.node_size(o.leaves()[0]);

        let n = premap(&mut m, &o, &s);
        assert!(n > 0);
        for (i, p) in m.points.iter().enumerate() {
            assert!((p - before[i]).norm() <= 0.5 * local + 1e-12);
        }
    }

    #[test]
    fn plane_collapse() {
        let (_, _, mut m) = template(0.05, 1);
        let n = collapse_to_plane(&mut m, 2, 0.0, 0.15);
        assert!(n > 0);
        assert!(m.points.iter().all(|p| p.z == 0.0 || p.z > 0.1));
    }
}
