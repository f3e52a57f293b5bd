//! Mesh untangling and quality smoothing
//!
//! Untangling relaxes the vertices of inverted cells (or flipped boundary
//! faces) towards the centroid of their neighbouring vertices until the
//! inversion count stops falling or hits zero; an iteration that makes
//! things worse is rolled back, so the count is non-increasing.  Residual
//! inversions at the cap are reported, never fatal.  The smoothing passes
//! are plain Laplacian relaxation; both honour a locked point set (feature
//! and layer points) which no pass is allowed to move.

use crate::mesh::PolyMesh;
use log::{info, warn};

/// Knobs for the untangle and smoothing passes
#[derive(Copy, Clone, Debug)]
pub struct OptimizeSettings {
    /// Iteration cap for untangling
    pub max_iterations: usize,
    /// Fraction of the Laplacian displacement applied per sweep
    pub relaxation: f64,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            relaxation: 0.5,
        }
    }
}

/// Inversion counts per untangle sweep
#[derive(Clone, Debug, Default)]
pub struct UntangleReport {
    /// Number of inverted entities before each sweep; non-increasing
    pub history: Vec<usize>,
    /// Whether the final count reached zero
    pub resolved: bool,
}

impl UntangleReport {
    /// Inversions left after the last sweep
    pub fn residual(&self) -> usize {
        self.history.last().copied().unwrap_or(0)
    }
}

/// Points adjacent to each point through a face edge
pub fn point_neighbours(mesh: &PolyMesh) -> Vec<Vec<usize>> {
    let mut nbr = vec![vec![]; mesh.points.len()];
    for loop_ in &mesh.faces {
        for i in 0..loop_.len() {
            let a = loop_[i];
            let b = loop_[(i + 1) % loop_.len()];
            nbr[a].push(b);
            nbr[b].push(a);
        }
    }
    for n in nbr.iter_mut() {
        n.sort_unstable();
        n.dedup();
    }
    nbr
}

fn lock_mask(n_points: usize, locked: &[usize]) -> Vec<bool> {
    let mut mask = vec![false; n_points];
    for &p in locked {
        mask[p] = true;
    }
    mask
}

fn relax_points(
    mesh: &mut PolyMesh,
    neighbours: &[Vec<usize>],
    movable: &[usize],
    relaxation: f64,
) {
    for &p in movable {
        let nbr = &neighbours[p];
        if nbr.is_empty() {
            continue;
        }
        let mut avg = nalgebra::Vector3::zeros();
        for &q in nbr {
            avg += mesh.points[q].coords;
        }
        avg /= nbr.len() as f64;
        let delta = avg - mesh.points[p].coords;
        mesh.points[p] += relaxation * delta;
    }
}

fn inverted_cells(mesh: &mut PolyMesh) -> Vec<usize> {
    mesh.cell_volumes()
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v <= 0.0)
        .map(|(c, _)| c)
        .collect()
}

/// Boundary faces whose normal does not leave their owner cell
fn flipped_boundary_faces(mesh: &mut PolyMesh) -> Vec<usize> {
    let owner = mesh.addressing().owner.clone();
    mesh.boundary_faces()
        .filter(|&f| {
            let out = mesh.face_area(f);
            let to_face = mesh.face_centre(f) - mesh.cell_centre(owner[f]);
            out.dot(&to_face) <= 0.0
        })
        .collect()
}

/// Untangles inverted cells by relaxing their vertices; returns whether
/// any inversion remains
pub fn untangle_volume(
    mesh: &mut PolyMesh,
    locked: &[usize],
    settings: &OptimizeSettings,
) -> UntangleReport {
    let neighbours = point_neighbours(mesh);
    let lock = lock_mask(mesh.points.len(), locked);
    let mut report = UntangleReport::default();

    let mut inverted = inverted_cells(mesh);
    report.history.push(inverted.len());
    for _ in 0..settings.max_iterations {
        if inverted.is_empty() {
            break;
        }
        let snapshot = mesh.points.clone();

        let mut movable: Vec<usize> = inverted
            .iter()
            .flat_map(|&c| mesh.cells[c].clone())
            .flat_map(|f| mesh.faces[f].clone())
            .filter(|&p| !lock[p])
            .collect();
        movable.sort_unstable();
        movable.dedup();
        relax_points(mesh, &neighbours, &movable, settings.relaxation);

        let now = inverted_cells(mesh);
        if now.len() > inverted.len() {
            mesh.points = snapshot;
            break;
        }
        report.history.push(now.len());
        inverted = now;
    }

    report.resolved = report.residual() == 0;
    if !report.resolved {
        warn!("{} inverted cells remain after untangling", report.residual());
    }
    report
}

/// Untangles flipped boundary faces by relaxing their vertices along the
/// boundary
pub fn untangle_surface(
    mesh: &mut PolyMesh,
    locked: &[usize],
    settings: &OptimizeSettings,
) -> UntangleReport {
    let on_boundary = mesh.boundary_point_mask();
    // Smooth against boundary neighbours only, so points stay near the
    // surface
    let mut neighbours = point_neighbours(mesh);
    for (p, nbr) in neighbours.iter_mut().enumerate() {
        if on_boundary[p] {
            nbr.retain(|&q| on_boundary[q]);
        }
    }
    let lock = lock_mask(mesh.points.len(), locked);
    let mut report = UntangleReport::default();

    let mut flipped = flipped_boundary_faces(mesh);
    report.history.push(flipped.len());
    for _ in 0..settings.max_iterations {
        if flipped.is_empty() {
            break;
        }
        let snapshot = mesh.points.clone();

        let mut movable: Vec<usize> = flipped
            .iter()
            .flat_map(|&f| mesh.faces[f].clone())
            .filter(|&p| !lock[p])
            .collect();
        movable.sort_unstable();
        movable.dedup();
        relax_points(mesh, &neighbours, &movable, settings.relaxation);

        let now = flipped_boundary_faces(mesh);
        if now.len() > flipped.len() {
            mesh.points = snapshot;
            break;
        }
        report.history.push(now.len());
        flipped = now;
    }

    report.resolved = report.residual() == 0;
    if !report.resolved {
        warn!(
            "{} flipped boundary faces remain after untangling",
            report.residual()
        );
    }
    report
}

/// Laplacian smoothing of interior points; boundary and locked points do
/// not move
pub fn optimize_volume(
    mesh: &mut PolyMesh,
    locked: &[usize],
    iterations: usize,
) {
    info!("Smoothing the interior of the mesh ({iterations} sweeps)");
    let neighbours = point_neighbours(mesh);
    let on_boundary = mesh.boundary_point_mask();
    let lock = lock_mask(mesh.points.len(), locked);
    let movable: Vec<usize> = (0..mesh.points.len())
        .filter(|&p| !on_boundary[p] && !lock[p])
        .collect();
    for _ in 0..iterations {
        relax_points(mesh, &neighbours, &movable, 0.5);
    }
}

/// Laplacian smoothing of boundary points against their boundary
/// neighbours; locked (feature and layer) points do not move
pub fn optimize_surface(
    mesh: &mut PolyMesh,
    locked: &[usize],
    iterations: usize,
) {
    info!("Smoothing the mesh boundary ({iterations} sweeps)");
    let on_boundary = mesh.boundary_point_mask();
    let mut neighbours = point_neighbours(mesh);
    for (p, nbr) in neighbours.iter_mut().enumerate() {
        if on_boundary[p] {
            nbr.retain(|&q| on_boundary[q]);
        }
    }
    let lock = lock_mask(mesh.points.len(), locked);
    let movable: Vec<usize> = (0..mesh.points.len())
        .filter(|&p| on_boundary[p] && !lock[p])
        .collect();
    for _ in 0..iterations {
        relax_points(mesh, &neighbours, &movable, 0.5);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extract::extract;
    use crate::geom::{Aabb, TriSurface};
    use crate::octree::{BoxType, Octree};
    use nalgebra::{Point3, Vector3};

    fn block(levels: u8) -> PolyMesh {
        let s = TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ));
        let mut o = Octree::build(&s, 0.0).unwrap();
        for _ in 0..levels {
            for l in o.leaves() {
                o.split(l, &s);
            }
        }
        let types = vec![BoxType::MeshCell; o.len()];
        extract(&o, &types, 0).unwrap()
    }

    fn interior_point(m: &PolyMesh) -> usize {
        let on_boundary = m.boundary_point_mask();
        (0..m.points.len()).find(|&p| !on_boundary[p]).unwrap()
    }

    #[test]
    fn untangle_restores_inverted_cells() {
        let mut m = block(2);
        // Push one interior point past its neighbours to invert the
        // surrounding cells
        let p = interior_point(&m);
        let original = m.points[p];
        m.points[p] += Vector3::new(0.9, 0.9, 0.9);
        assert!(!inverted_cells(&mut m).is_empty());

        let report =
            untangle_volume(&mut m, &[], &OptimizeSettings::default());
        assert!(report.resolved, "history: {:?}", report.history);
        for w in report.history.windows(2) {
            assert!(w[1] <= w[0], "inversions grew: {:?}", report.history);
        }
        assert!(m.cell_volumes().iter().all(|&v| v > 0.0));
        // The point was pulled back towards its grid position
        assert!((m.points[p] - original).norm() < 1.0);
    }

    #[test]
    fn untangle_respects_locked_points() {
        let mut m = block(2);
        let p = interior_point(&m);
        m.points[p] += Vector3::new(0.9, 0.9, 0.9);
        let moved = m.points[p];

        let report =
            untangle_volume(&mut m, &[p], &OptimizeSettings::default());
        assert_eq!(m.points[p], moved);
        // With the culprit pinned the neighbours give up at the cap or a
        // rollback; either way the count never grows
        for w in report.history.windows(2) {
            assert!(w[1] <= w[0]);
        }
    }

    #[test]
    fn volume_smoothing_is_a_noop_on_locked_and_boundary() {
        let mut m = block(2);
        let p = interior_point(&m);
        m.points[p] += Vector3::new(0.2, 0.0, 0.0);
        let boundary_before: Vec<_> = {
            let mask = m.boundary_point_mask();
            m.points
                .iter()
                .zip(&mask)
                .filter(|&(_, &b)| b)
                .map(|(p, _)| *p)
                .collect()
        };

        let perturbed = m.points[p];
        optimize_volume(&mut m, &[p], 3);
        assert_eq!(m.points[p], perturbed);

        optimize_volume(&mut m, &[], 3);
        assert!((m.points[p] - perturbed).norm() > 0.0);

        let mask = m.boundary_point_mask();
        let boundary_after: Vec<_> = m
            .points
            .iter()
            .zip(&mask)
            .filter(|&(_, &b)| b)
            .map(|(p, _)| *p)
            .collect();
        assert_eq!(boundary_before, boundary_after);
    }

    #[test]
    fn surface_smoothing_keeps_locked_points() {
        let mut m = block(2);
        let mask = m.boundary_point_mask();
        let locked: Vec<usize> =
            (0..m.points.len()).filter(|&p| mask[p]).step_by(3).collect();
        let before: Vec<_> = locked.iter().map(|&p| m.points[p]).collect();

        optimize_surface(&mut m, &locked, 2);
        for (&p, b) in locked.iter().zip(&before) {
            assert_eq!(m.points[p], *b);
        }
        assert!(m.check().is_empty());
    }
}
