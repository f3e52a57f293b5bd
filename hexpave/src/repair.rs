//! Topology repair of the extracted template mesh
//!
//! The template mesh out of the extractor can touch the surface in ways
//! that no projection can map cleanly: cells whose boundary faces form
//! more than one patch on the cell, cells meeting the boundary through a
//! lone edge or vertex, and cell groups hanging off a single vertex.  Each
//! sub-pass detects one of these and removes the offending cells through
//! [`Modifier::remove_cells`], which keeps the mesh valid; a fixed-point
//! driver runs the passes until nothing changes, with an iteration cap for
//! pathological inputs.

use crate::mesh::{modifier::Modifier, PolyMesh};
use log::{info, warn};
use std::collections::HashMap;

/// Limits for the repair fixed-point loop
#[derive(Copy, Clone, Debug)]
pub struct RepairSettings {
    /// Maximum number of sweeps before giving up
    pub max_iterations: usize,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self { max_iterations: 16 }
    }
}

/// What a repair run did to the mesh
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RepairReport {
    /// Number of sweeps executed, including the final clean one
    pub iterations: usize,
    /// Cells removed over all sweeps
    pub removed_cells: usize,
    /// Pinched boundary face pairs fixed by the final pass
    pub pinches_fixed: usize,
    /// Whether the sweep cap was hit before reaching a fixed point
    pub capped: bool,
}

/// One repair sweep; returns whether anything changed
pub fn repair(mesh: &mut PolyMesh) -> bool {
    let mut changed = fix_irregular_surface_connections(mesh);
    changed |= remove_nonmappable_cells(mesh);
    changed |= remove_detached_cell_groups(mesh);
    changed
}

/// Runs [`repair`] until it reaches a fixed point, then fixes pinched
/// boundary faces once
pub fn repair_to_fixed_point(
    mesh: &mut PolyMesh,
    settings: &RepairSettings,
) -> RepairReport {
    info!("Checking the topology of the template mesh");
    let n_cells = mesh.cells.len();
    let mut report = RepairReport::default();

    loop {
        report.iterations += 1;
        if !repair(mesh) {
            break;
        }
        if report.iterations >= settings.max_iterations {
            warn!(
                "topology repair did not settle within {} sweeps",
                settings.max_iterations
            );
            report.capped = true;
            break;
        }
    }
    report.pinches_fixed = fix_pinched_boundary_faces(mesh);
    report.removed_cells = n_cells - mesh.cells.len();
    info!(
        "Finished topology repair: {} cells removed in {} sweeps",
        report.removed_cells, report.iterations
    );
    report
}

/// Number of edge-connected groups formed by a set of face loops
fn edge_groups(loops: &[&Vec<usize>]) -> usize {
    let mut edge_faces: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
    for (k, loop_) in loops.iter().enumerate() {
        for i in 0..loop_.len() {
            let a = loop_[i];
            let b = loop_[(i + 1) % loop_.len()];
            edge_faces.entry((a.min(b), a.max(b))).or_default().push(k);
        }
    }

    let mut group = vec![usize::MAX; loops.len()];
    let mut n_groups = 0;
    for seed in 0..loops.len() {
        if group[seed] != usize::MAX {
            continue;
        }
        let mut stack = vec![seed];
        group[seed] = n_groups;
        while let Some(k) = stack.pop() {
            let loop_ = loops[k];
            for i in 0..loop_.len() {
                let a = loop_[i];
                let b = loop_[(i + 1) % loop_.len()];
                for &m in &edge_faces[&(a.min(b), a.max(b))] {
                    if group[m] == usize::MAX {
                        group[m] = n_groups;
                        stack.push(m);
                    }
                }
            }
        }
        n_groups += 1;
    }
    n_groups
}

/// Removes cells whose boundary faces form more than one edge-connected
/// group on the cell
pub fn fix_irregular_surface_connections(mesh: &mut PolyMesh) -> bool {
    let n_internal = mesh.n_internal_faces();
    let mut remove = vec![false; mesh.cells.len()];
    let mut any = false;
    for (c, cell) in mesh.cells.iter().enumerate() {
        let bnd: Vec<&Vec<usize>> = cell
            .iter()
            .filter(|&&f| f >= n_internal)
            .map(|&f| &mesh.faces[f])
            .collect();
        if bnd.len() > 1 && edge_groups(&bnd) > 1 {
            remove[c] = true;
            any = true;
        }
    }
    if any {
        let n = remove.iter().filter(|&&r| r).count();
        info!("Removing {n} cells with irregular surface connections");
        Modifier::new(mesh).remove_cells(&remove);
    }
    any
}

/// Removes cells that touch the boundary through an edge or a vertex only
///
/// Such a cell uses boundary points but owns no boundary face, so no
/// consistent surface mapping exists for it.  Removal exposes new
/// boundary faces on its neighbours; the fixed-point driver re-runs the
/// check until the cascade settles.
pub fn remove_nonmappable_cells(mesh: &mut PolyMesh) -> bool {
    let counts = mesh.boundary_face_count_per_cell();
    let on_boundary = mesh.boundary_point_mask();

    let mut remove = vec![false; mesh.cells.len()];
    let mut any = false;
    for (c, cell) in mesh.cells.iter().enumerate() {
        if counts[c] > 0 {
            continue;
        }
        let touches = cell
            .iter()
            .any(|&f| mesh.faces[f].iter().any(|&p| on_boundary[p]));
        if touches {
            remove[c] = true;
            any = true;
        }
    }
    if any {
        let n = remove.iter().filter(|&&r| r).count();
        info!("Removing {n} cells touching the boundary over edges");
        Modifier::new(mesh).remove_cells(&remove);
    }
    any
}

/// Removes cell groups attached to the rest of the mesh through a single
/// vertex, and cell islands disconnected from the main body
///
/// At every boundary point the cells sharing it must form one
/// face-connected group; smaller groups are removed (ties keep the group
/// with the lowest cell index).
pub fn remove_detached_cell_groups(mesh: &mut PolyMesh) -> bool {
    let n_cells = mesh.cells.len();
    if n_cells == 0 {
        return false;
    }
    let n_internal = mesh.n_internal_faces();
    let on_boundary = mesh.boundary_point_mask();
    mesh.addressing();
    let owner = mesh.addressing().owner.clone();
    let neighbour = mesh.addressing().neighbour.clone();
    let point_faces = mesh.addressing().point_faces.clone();

    let mut adjacency = vec![vec![]; n_cells];
    for f in 0..n_internal {
        let n = neighbour[f].unwrap();
        adjacency[owner[f]].push(n);
        adjacency[n].push(owner[f]);
    }

    let mut remove = vec![false; n_cells];

    // Islands: keep the largest face-connected component
    let mut component = vec![usize::MAX; n_cells];
    let mut sizes = vec![];
    for seed in 0..n_cells {
        if component[seed] != usize::MAX {
            continue;
        }
        let id = sizes.len();
        let mut size = 0;
        let mut stack = vec![seed];
        component[seed] = id;
        while let Some(c) = stack.pop() {
            size += 1;
            for &m in &adjacency[c] {
                if component[m] == usize::MAX {
                    component[m] = id;
                    stack.push(m);
                }
            }
        }
        sizes.push(size);
    }
    if sizes.len() > 1 {
        let keep = (0..sizes.len()).max_by_key(|&i| sizes[i]).unwrap();
        let keep = (0..sizes.len())
            .find(|&i| sizes[i] == sizes[keep])
            .unwrap();
        for c in 0..n_cells {
            if component[c] != keep {
                remove[c] = true;
            }
        }
    }

    // Non-manifold vertices: cells around a boundary point split into
    // several face-connected groups
    for (p, faces) in point_faces.iter().enumerate() {
        if !on_boundary[p] {
            continue;
        }
        let mut cells: Vec<usize> = faces
            .iter()
            .flat_map(|&f| {
                std::iter::once(owner[f]).chain(neighbour[f].into_iter())
            })
            .collect();
        cells.sort_unstable();
        cells.dedup();
        if cells.len() < 2 {
            continue;
        }

        // Group the cells at this point by shared internal faces
        let mut group = vec![usize::MAX; cells.len()];
        let mut groups: Vec<Vec<usize>> = vec![];
        for seed in 0..cells.len() {
            if group[seed] != usize::MAX {
                continue;
            }
            let id = groups.len();
            let mut members = vec![];
            let mut stack = vec![seed];
            group[seed] = id;
            while let Some(k) = stack.pop() {
                members.push(cells[k]);
                for &m in &adjacency[cells[k]] {
                    if let Ok(j) = cells.binary_search(&m) {
                        if group[j] == usize::MAX {
                            group[j] = id;
                            stack.push(j);
                        }
                    }
                }
            }
            groups.push(members);
        }
        if groups.len() < 2 {
            continue;
        }
        let keep = (0..groups.len())
            .max_by_key(|&i| {
                (
                    groups[i].len(),
                    // Break ties towards the lowest cell index
                    usize::MAX - groups[i].iter().min().unwrap(),
                )
            })
            .unwrap();
        for (i, members) in groups.iter().enumerate() {
            if i != keep {
                for &c in members {
                    remove[c] = true;
                }
            }
        }
    }

    let any = remove.iter().any(|&r| r);
    if any {
        let n = remove.iter().filter(|&&r| r).count();
        info!("Removing {n} cells in detached groups");
        Modifier::new(mesh).remove_cells(&remove);
    }
    any
}

/// Removes one side of every pair of boundary faces sharing two or more
/// edges (a pinched boundary), returning the number of pairs fixed
pub fn fix_pinched_boundary_faces(mesh: &mut PolyMesh) -> usize {
    let mut edge_faces: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
    for f in mesh.boundary_faces() {
        let loop_ = &mesh.faces[f];
        for i in 0..loop_.len() {
            let a = loop_[i];
            let b = loop_[(i + 1) % loop_.len()];
            edge_faces.entry((a.min(b), a.max(b))).or_default().push(f);
        }
    }

    let mut shared: HashMap<(usize, usize), usize> = HashMap::new();
    for faces in edge_faces.values() {
        for i in 0..faces.len() {
            for j in i + 1..faces.len() {
                let key = (faces[i].min(faces[j]), faces[i].max(faces[j]));
                *shared.entry(key).or_insert(0) += 1;
            }
        }
    }

    let pairs: Vec<(usize, usize)> = shared
        .into_iter()
        .filter(|&(_, n)| n >= 2)
        .map(|(pair, _)| pair)
        .collect();
    if pairs.is_empty() {
        return 0;
    }

    mesh.addressing();
    let owner = mesh.addressing().owner.clone();
    let mut remove = vec![false; mesh.cells.len()];
    for &(_, high) in &pairs {
        remove[owner[high]] = true;
    }
    let n = remove.iter().filter(|&&r| r).count();
    info!(
        "Removing {n} cells at {} pinched boundary face pairs",
        pairs.len()
    );
    Modifier::new(mesh).remove_cells(&remove);
    pairs.len()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extract::extract;
    use crate::geom::{Aabb, TriSurface};
    use crate::mesh::BoundaryPatch;
    use crate::octree::{BoxType, Octree};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    /// Octree refined uniformly to `levels` over a 2x2x2 cube, with leaf
    /// selection by integer grid position
    fn select(
        levels: u8,
        pred: impl Fn([u32; 3]) -> bool,
    ) -> (Octree, Vec<BoxType>) {
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
        let mut types = vec![BoxType::Outside; o.len()];
        for l in o.leaves() {
            if pred(o.node(l).coords.pos) {
                types[l] = BoxType::MeshCell;
            }
        }
        (o, types)
    }

    #[test]
    fn clean_mesh_is_a_fixed_point() {
        let (o, types) = select(2, |_| true);
        let mut m = extract(&o, &types, 0).unwrap();
        let report =
            repair_to_fixed_point(&mut m, &RepairSettings::default());
        assert_eq!(report.removed_cells, 0);
        assert_eq!(report.iterations, 1);
        assert!(!report.capped);
        assert_eq!(m.cells.len(), 64);
    }

    #[test]
    fn vertex_connected_cell_is_removed() {
        // A 2x2x2 block plus one cell touching it through a single corner
        let (o, types) = select(2, |p| {
            p.iter().all(|&x| x < 2) || p == [2, 2, 2]
        });
        let mut m = extract(&o, &types, 0).unwrap();
        assert_eq!(m.cells.len(), 9);

        let report =
            repair_to_fixed_point(&mut m, &RepairSettings::default());
        assert_eq!(report.removed_cells, 1);
        assert_eq!(m.cells.len(), 8);
        assert!(m.check().is_empty(), "{:?}", m.check());

        // The surviving block is intact
        let total: f64 = m.cell_volumes().iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-10);

        // Repair is idempotent
        assert!(!repair(&mut m));
    }

    #[test]
    fn edge_connected_cells_are_split_apart() {
        // Two cells sharing only an edge; one of them has to go
        let (o, types) =
            select(1, |p| p == [0, 0, 0] || p == [1, 1, 0]);
        let mut m = extract(&o, &types, 0).unwrap();
        assert_eq!(m.cells.len(), 2);
        assert_eq!(m.n_internal_faces(), 0);

        repair_to_fixed_point(&mut m, &RepairSettings::default());
        assert_eq!(m.cells.len(), 1);
        assert!(m.check().is_empty(), "{:?}", m.check());
        assert!(!repair(&mut m));
    }

    #[test]
    fn interior_cell_touching_boundary_over_a_vertex() {
        // Removing a corner cell of a 3-level block leaves the diagonal
        // interior cell with a boundary vertex but no boundary face
        let (o, types) = select(2, |p| {
            p.iter().all(|&x| x < 3) && p != [0, 0, 0]
        });
        let mut m = extract(&o, &types, 0).unwrap();
        assert_eq!(m.cells.len(), 26);

        let touched = remove_nonmappable_cells(&mut m);
        assert!(touched);
        assert!(m.check().is_empty(), "{:?}", m.check());
        assert!(m.cells.len() < 26);
    }

    #[test]
    fn pinched_boundary_faces() {
        // Two single-face cells whose faces share the edges (0,1) and
        // (1,2)
        let mut m = PolyMesh::from_components(
            vec![Point3::origin(); 7],
            vec![vec![0, 1, 2, 3], vec![2, 1, 0, 6]],
            vec![vec![0], vec![1]],
            vec![BoundaryPatch {
                name: "defaultFaces".into(),
                patch_type: "patch".into(),
                start: 0,
                size: 2,
            }],
        );
        assert_eq!(fix_pinched_boundary_faces(&mut m), 1);
        assert_eq!(m.cells.len(), 1);
        assert_eq!(m.faces.len(), 1);
        assert_eq!(fix_pinched_boundary_faces(&mut m), 0);
    }
}
