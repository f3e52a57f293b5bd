//! Boundary patch assignment and feature edge extraction
//!
//! After projection each boundary face is voted onto the surface patch
//! nearest to its centre, the boundary block is reordered into contiguous
//! per-patch ranges, and the mesh edges where two assigned patches meet
//! are reclassified as feature edges with their points snapped onto the
//! surface features.

use crate::geom::TriSurface;
use crate::mesh::{BoundaryPatch, PolyMesh};
use crate::octree::Octree;
use log::{info, warn};
use std::collections::HashMap;

/// Votes a surface patch for every boundary face
///
/// Returns the patch index (into `surface.patch_names`) per boundary
/// face, indexed from the start of the boundary block.  Faces whose
/// centre finds no candidate surface element fall back to patch 0.
pub fn assign_patches(
    mesh: &PolyMesh,
    octree: &Octree,
    surface: &TriSurface,
) -> Vec<usize> {
    let mut assigned = Vec::with_capacity(mesh.boundary_faces().len());
    let mut fallbacks = 0;
    for f in mesh.boundary_faces() {
        let c = mesh.face_centre(f);
        let local = octree.local_size(&c);
        let mut candidates = octree.candidates_near(&c, 2.0 * local);
        if candidates.is_empty() {
            candidates = octree.candidates_near(&c, 4.0 * local);
        }
        match surface.nearest_in_candidates(&c, &candidates) {
            Some((_, t)) => assigned.push(surface.triangles[t].patch),
            None => {
                fallbacks += 1;
                assigned.push(0);
            }
        }
    }
    if fallbacks > 0 {
        warn!("{fallbacks} boundary faces found no patch, assigned patch 0");
    }
    assigned
}

/// Reorders the boundary block into contiguous per-patch ranges
///
/// `assigned` is indexed from the start of the boundary block and refers
/// into `names`; empty patches are kept with size 0 so patch indices stay
/// aligned with the surface patch list.
pub fn apply_patches(
    mesh: &mut PolyMesh,
    assigned: &[usize],
    names: &[String],
) {
    let n_internal = mesh.n_internal_faces();
    debug_assert_eq!(assigned.len(), mesh.faces.len() - n_internal);

    let mut new_label: Vec<Option<usize>> =
        (0..n_internal).map(Some).collect();
    new_label.resize(mesh.faces.len(), None);

    let mut order = vec![];
    let mut boundaries = Vec::with_capacity(names.len());
    for (pid, name) in names.iter().enumerate() {
        let start = n_internal + order.len();
        for (k, &a) in assigned.iter().enumerate() {
            if a == pid {
                new_label[n_internal + k] = Some(n_internal + order.len());
                order.push(n_internal + k);
            }
        }
        boundaries.push(BoundaryPatch {
            name: name.clone(),
            patch_type: "patch".into(),
            start,
            size: n_internal + order.len() - start,
        });
    }

    let mut faces = std::mem::take(&mut mesh.faces);
    let boundary_loops: Vec<Vec<usize>> = order
        .iter()
        .map(|&old| std::mem::take(&mut faces[old]))
        .collect();
    faces.truncate(n_internal);
    faces.extend(boundary_loops);
    mesh.faces = faces;
    mesh.boundaries = boundaries;

    for cell in mesh.cells.iter_mut() {
        for f in cell.iter_mut() {
            *f = new_label[*f].unwrap();
        }
    }
    for ids in mesh.face_subsets.values_mut() {
        *ids = ids.iter().filter_map(|&i| new_label[i]).collect();
    }
    mesh.invalidate_addressing();
    info!(
        "Assigned boundary faces to {} patches",
        mesh.boundaries.iter().filter(|b| b.size > 0).count()
    );
}

/// Extracts the mesh edges where two different patches meet and snaps
/// their points onto the surface feature edges
///
/// Points shared by three or more patches land on surface corners.
/// Returns the feature point set, sorted, for the optimiser to lock.
pub fn extract_feature_edges(
    mesh: &mut PolyMesh,
    surface: &TriSurface,
) -> Vec<usize> {
    // Patch of each boundary face, then boundary edges with the patches
    // on both sides
    let mut edge_patches: HashMap<(usize, usize), Vec<usize>> =
        HashMap::new();
    for f in mesh.boundary_faces() {
        let patch = mesh.patch_of(f).unwrap_or(0);
        let loop_ = &mesh.faces[f];
        for i in 0..loop_.len() {
            let a = loop_[i];
            let b = loop_[(i + 1) % loop_.len()];
            edge_patches
                .entry((a.min(b), a.max(b)))
                .or_default()
                .push(patch);
        }
    }

    let mut point_patches: HashMap<usize, Vec<usize>> = HashMap::new();
    for ((a, b), patches) in &edge_patches {
        let mut distinct = patches.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() < 2 {
            continue;
        }
        for p in [*a, *b] {
            point_patches.entry(p).or_default().extend(&distinct);
        }
    }

    let mut locked: Vec<usize> = vec![];
    for (p, patches) in &mut point_patches {
        patches.sort_unstable();
        patches.dedup();
        let pos = mesh.points[*p];
        let target = if patches.len() >= 3 {
            surface.nearest_corner(&pos)
        } else {
            surface.nearest_on_feature_edge(&pos).map(|(q, _)| q)
        };
        if let Some(q) = target {
            mesh.points[*p] = q;
        }
        locked.push(*p);
    }
    locked.sort_unstable();
    info!("Extracted {} feature points between patches", locked.len());
    locked
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extract::extract;
    use crate::geom::Aabb;
    use crate::octree::BoxType;
    use nalgebra::Point3;

    fn cube_template() -> (TriSurface, Octree, PolyMesh) {
        let s = TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ));
        let mut o = Octree::build(&s, 0.0).unwrap();
        for _ in 0..2 {
            for l in o.leaves() {
                o.split(l, &s);
            }
        }
        let types = vec![BoxType::MeshCell; o.len()];
        let m = extract(&o, &types, 0).unwrap();
        (s, o, m)
    }

    #[test]
    fn cube_faces_land_on_six_patches() {
        let (s, o, mut m) = cube_template();
        let assigned = assign_patches(&m, &o, &s);
        assert_eq!(assigned.len(), 96);
        apply_patches(&mut m, &assigned, &s.patch_names);

        assert_eq!(m.boundaries.len(), 6);
        for b in &m.boundaries {
            assert_eq!(b.size, 16, "patch {}", b.name);
        }
        assert!(m.check().is_empty(), "{:?}", m.check());

        // Every face of the zMin patch really sits on z = 0
        let z_min = m
            .boundaries
            .iter()
            .position(|b| b.name == "zMin")
            .unwrap();
        for f in m.boundaries[z_min].range() {
            assert!(m.face_centre(f).z.abs() < 1e-12);
        }
    }

    #[test]
    fn feature_edges_between_patches() {
        let (s, o, mut m) = cube_template();
        let assigned = assign_patches(&m, &o, &s);
        apply_patches(&mut m, &assigned, &s.patch_names);

        let locked = extract_feature_edges(&mut m, &s);
        // 12 cube edges with 3 interior points each, plus 8 corners
        assert_eq!(locked.len(), 44);
        for &p in &locked {
            let pos = m.points[p];
            let on_edge = (0..3)
                .filter(|&a| pos[a] == 0.0 || pos[a] == 2.0)
                .count();
            assert!(on_edge >= 2, "point {pos:?} is not on a cube edge");
        }
    }

    #[test]
    fn single_patch_has_no_feature_edges() {
        let (s, o, mut m) = cube_template();
        let _ = (s, o);
        // The extractor leaves everything in one default patch
        let locked = extract_feature_edges(
            &mut m,
            &TriSurface::hexahedron(&Aabb::new(
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(2.0, 2.0, 2.0),
            )),
        );
        assert!(locked.is_empty());
    }
}
