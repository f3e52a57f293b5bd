//! Polyhedral mesh extraction from octree leaves
//!
//! Every selected leaf becomes one cell.  Corner points shared between
//! adjacent leaves are merged exactly by hashing their integer position on
//! the finest grid, never by coordinate quantisation.  Faces at a
//! refinement interface are emitted per finer-leaf facet, so a coarse cell
//! next to split neighbours ends up with more than 6 faces (a split hex);
//! [`decompose_split_hexes`] can break those into pyramids afterwards.

use crate::mesh::{BoundaryPatch, PolyMesh};
use crate::octree::{BoxType, Octree};
use crate::Error;
use log::{debug, info, warn};
use nalgebra::Point3;
use std::collections::HashMap;

/// Builds a mesh from the leaves of `octree` classified as anything but
/// [`BoxType::Outside`]
///
/// `types` is indexed by node id as produced by
/// [`Octree::classify`](crate::octree::Octree::classify).  Cells are
/// numbered in scan order of the leaf corners (z, then y, then x), which
/// makes owner indices smaller than neighbour indices on a uniform grid.
///
/// # Errors
/// [`Error::InconsistentCellTopology`] when more than `tolerance` cells
/// fail to form a closed polyhedron; smaller counts are recorded in the
/// `inconsistentCells` subset for the repair passes to deal with.
pub fn extract(
    octree: &Octree,
    types: &[BoxType],
    tolerance: usize,
) -> Result<PolyMesh, Error> {
    info!("Extracting the template mesh");
    let max_level = octree.max_level();

    // Selected leaves in scan order define the cell numbering
    let mut selected: Vec<usize> = octree
        .leaves()
        .into_iter()
        .filter(|&l| types[l] != BoxType::Outside)
        .collect();
    selected.sort_by_key(|&l| {
        let c = octree.node(l).coords.fine_corner(max_level);
        (c[2], c[1], c[0])
    });
    let cell_of_leaf: HashMap<usize, usize> = selected
        .iter()
        .enumerate()
        .map(|(c, &l)| (l, c))
        .collect();

    let mut points = vec![];
    let mut point_ids: HashMap<[u32; 3], usize> = HashMap::new();

    // A leaf corner on the finest grid; merging happens on the integer key
    let mut corner = |octree: &Octree, leaf: usize, bits: [u32; 3]| {
        let node = octree.node(leaf);
        let unit = 1u32 << (max_level - node.coords.level);
        let base = node.coords.fine_corner(max_level);
        let key = [
            base[0] + bits[0] * unit,
            base[1] + bits[1] * unit,
            base[2] + bits[2] * unit,
        ];
        *point_ids.entry(key).or_insert_with(|| {
            let b = octree.node_box(leaf);
            points.push(Point3::new(
                if bits[0] != 0 { b.max.x } else { b.min.x },
                if bits[1] != 0 { b.max.y } else { b.min.y },
                if bits[2] != 0 { b.max.z } else { b.min.z },
            ));
            points.len() - 1
        })
    };

    // The facet of `leaf` on side `side` of `axis`, wound so its normal
    // points towards +axis
    let mut facet = |octree: &Octree, leaf: usize, axis: usize, side: u32| {
        let u = (axis + 1) % 3;
        let v = (axis + 2) % 3;
        [(0, 0), (1, 0), (1, 1), (0, 1)]
            .map(|(bu, bv)| {
                let mut bits = [0u32; 3];
                bits[axis] = side;
                bits[u] = bu;
                bits[v] = bv;
                corner(octree, leaf, bits)
            })
            .to_vec()
    };

    // (loop wound out of `low`, cell on -axis side, cell on +axis side)
    let mut internal: Vec<(Vec<usize>, usize, usize)> = vec![];
    // (loop wound out of the cell, cell)
    let mut boundary: Vec<(Vec<usize>, usize)> = vec![];

    for (cell, &leaf) in selected.iter().enumerate() {
        let level = octree.node(leaf).coords.level;
        for dir in 0..6 {
            let axis = dir / 2;
            let positive = dir % 2 == 1;
            let own_side = u32::from(positive);

            let adjacent = octree.face_adjacent_leaves(leaf, dir);
            if adjacent.is_empty() {
                let mut f = facet(octree, leaf, axis, own_side);
                if !positive {
                    f.reverse();
                }
                boundary.push((f, cell));
                continue;
            }

            for &m in &adjacent {
                let m_level = octree.node(m).coords.level;
                match cell_of_leaf.get(&m) {
                    None => {
                        // Unmeshed on the far side; the shared region is
                        // the finer of the two facets
                        let mut f = if m_level > level {
                            facet(octree, m, axis, 1 - own_side)
                        } else {
                            facet(octree, leaf, axis, own_side)
                        };
                        if !positive {
                            f.reverse();
                        }
                        boundary.push((f, cell));
                    }
                    Some(&other) => {
                        // Emit each internal face once, from the finer
                        // side (the facet is the finer leaf's), or from
                        // the positive side when the levels match
                        if m_level > level || (m_level == level && !positive)
                        {
                            continue;
                        }
                        let f = facet(octree, leaf, axis, own_side);
                        let (low, high) = if positive {
                            (cell, other)
                        } else {
                            (other, cell)
                        };
                        internal.push((f, low, high));
                    }
                }
            }
        }
    }

    // Assemble: internal block first, boundary block behind it, loops
    // rewound so the normal leaves the lower-indexed cell
    let n_internal = internal.len();
    let mut faces = Vec::with_capacity(n_internal + boundary.len());
    let mut cells: Vec<Vec<usize>> = vec![vec![]; selected.len()];
    for (mut f, low, high) in internal {
        if low > high {
            f.reverse();
        }
        cells[low].push(faces.len());
        cells[high].push(faces.len());
        faces.push(f);
    }
    for (f, cell) in boundary {
        cells[cell].push(faces.len());
        faces.push(f);
    }

    let boundaries = vec![BoundaryPatch {
        name: "defaultFaces".into(),
        patch_type: "patch".into(),
        start: n_internal,
        size: faces.len() - n_internal,
    }];
    let mut mesh = PolyMesh::from_components(points, faces, cells, boundaries);

    let bad = inconsistent_cells(&mesh);
    if bad.len() > tolerance {
        return Err(Error::InconsistentCellTopology {
            count: bad.len(),
            tolerance,
        });
    } else if !bad.is_empty() {
        warn!(
            "{} cells have inconsistent face topology, \
             leaving them to the repair passes",
            bad.len()
        );
        mesh.cell_subsets.insert("inconsistentCells".into(), bad);
    }

    info!(
        "Extracted {} cells, {} faces, {} points",
        mesh.cells.len(),
        mesh.faces.len(),
        mesh.points.len()
    );
    Ok(mesh)
}

/// The hanging node on the edge `a -> b`, if one of `candidates` lies on
/// the open segment between them
///
/// At a refinement interface the coarser side runs an edge corner to
/// corner while the finer facets stop at its midpoint; that midpoint is a
/// vertex of the cell, so edges must be compared segment by segment.
fn hanging_node(
    points: &[Point3<f64>],
    candidates: &[usize],
    a: usize,
    b: usize,
) -> Option<usize> {
    let pa = points[a];
    let v = points[b] - pa;
    let len_sq = v.norm_squared();
    candidates.iter().copied().find(|&m| {
        if m == a || m == b {
            return false;
        }
        let w = points[m] - pa;
        let t = w.dot(&v) / len_sq;
        t > 1e-6
            && t < 1.0 - 1e-6
            && (w - t * v).norm_squared() <= 1e-18 * len_sq
    })
}

/// Every point of `cell`, sorted and deduplicated
fn cell_point_set(mesh: &PolyMesh, cell: &[usize]) -> Vec<usize> {
    let mut out: Vec<usize> = cell
        .iter()
        .flat_map(|&f| mesh.faces[f].iter().copied())
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Cells whose faces do not close up (some edge segment is not used by
/// exactly two of the cell's faces)
///
/// Edges are split at hanging nodes before counting, so a split hex whose
/// full-size side faces run corner to corner while the quarter facets stop
/// at the midpoints still counts as closed.
fn inconsistent_cells(mesh: &PolyMesh) -> Vec<usize> {
    let mut bad = vec![];
    for (c, cell) in mesh.cells.iter().enumerate() {
        let cell_points = cell_point_set(mesh, cell);
        let mut edge_use: HashMap<(usize, usize), usize> = HashMap::new();
        for &f in cell {
            let loop_ = &mesh.faces[f];
            for i in 0..loop_.len() {
                let mut stack =
                    vec![(loop_[i], loop_[(i + 1) % loop_.len()])];
                while let Some((a, b)) = stack.pop() {
                    match hanging_node(&mesh.points, &cell_points, a, b) {
                        Some(m) => {
                            stack.push((a, m));
                            stack.push((m, b));
                        }
                        None => {
                            *edge_use
                                .entry((a.min(b), a.max(b)))
                                .or_insert(0) += 1;
                        }
                    }
                }
            }
        }
        if edge_use.values().any(|&n| n != 2) {
            bad.push(c);
        }
    }
    bad
}

/// Decomposes every cell with more than 6 faces into pyramids fanned from
/// the cell centroid, returning the number of cells decomposed
///
/// Each face of a split hex becomes the base of one pyramid; the side
/// triangles between neighbouring pyramids are new internal faces.  The
/// far side of every base face (its neighbour cell or boundary patch) is
/// untouched.
pub fn decompose_split_hexes(mesh: &mut PolyMesh) -> usize {
    let targets: Vec<usize> = (0..mesh.cells.len())
        .filter(|&c| mesh.cells[c].len() > 6)
        .collect();
    if targets.is_empty() {
        return 0;
    }
    info!("Decomposing {} split-hex cells into pyramids", targets.len());

    let n_internal_old = mesh.n_internal_faces();
    let old_len = mesh.faces.len();
    // New side faces get provisional ids past the end of the old face
    // list; the splice below moves them in front of the boundary block
    let mut side_faces: Vec<Vec<usize>> = vec![];

    for &c in &targets {
        let apex = mesh.points.len();
        mesh.points.push(mesh.cell_centre(c));
        let base_faces = std::mem::take(&mut mesh.cells[c]);

        // One pyramid per base face; the first reuses the cell slot
        let mut pyramid_ids = vec![c];
        for _ in 1..base_faces.len() {
            pyramid_ids.push(mesh.cells.len());
            mesh.cells.push(vec![]);
        }
        for (k, &f) in base_faces.iter().enumerate() {
            mesh.cells[pyramid_ids[k]].push(f);
        }

        // Each cell edge segment, with the local face traversing it as
        // a -> b; edges running over a hanging node are split so the
        // coarse face pairs up with both finer facets
        let cell_points = cell_point_set(mesh, &base_faces);
        let mut edges: HashMap<(usize, usize), Vec<(usize, usize, usize)>> =
            HashMap::new();
        for (k, &f) in base_faces.iter().enumerate() {
            let loop_ = &mesh.faces[f];
            for i in 0..loop_.len() {
                let mut stack =
                    vec![(loop_[i], loop_[(i + 1) % loop_.len()])];
                while let Some((a, b)) = stack.pop() {
                    match hanging_node(&mesh.points, &cell_points, a, b) {
                        Some(m) => {
                            stack.push((a, m));
                            stack.push((m, b));
                        }
                        None => edges
                            .entry((a.min(b), a.max(b)))
                            .or_default()
                            .push((k, a, b)),
                    }
                }
            }
        }

        for users in edges.values() {
            // Extraction already screened non-closing cells
            debug_assert_eq!(users.len(), 2);
            let (k1, a, b) = users[0];
            let (k2, ..) = users[1];
            let (p1, p2) = (pyramid_ids[k1], pyramid_ids[k2]);
            // The triangle (a, b, apex) points out of the pyramid whose
            // base runs the edge b -> a
            let tri = if p2 < p1 {
                vec![a, b, apex]
            } else {
                vec![b, a, apex]
            };
            let id = old_len + side_faces.len();
            side_faces.push(tri);
            mesh.cells[p1].push(id);
            mesh.cells[p2].push(id);
        }
    }

    // Splice the new internal faces in front of the boundary block
    let n_side = side_faces.len();
    let boundary_block = mesh.faces.split_off(n_internal_old);
    mesh.faces.extend(side_faces);
    mesh.faces.extend(boundary_block);
    for patch in mesh.boundaries.iter_mut() {
        patch.start += n_side;
    }
    for cell in mesh.cells.iter_mut() {
        for f in cell.iter_mut() {
            if *f >= old_len {
                *f = n_internal_old + (*f - old_len);
            } else if *f >= n_internal_old {
                *f += n_side;
            }
        }
    }
    mesh.invalidate_addressing();

    // Base faces may have changed sides of the owner-is-lower-cell order;
    // rewind any internal face pointing at its owner
    let n_internal = mesh.n_internal_faces();
    mesh.addressing();
    for f in 0..n_internal {
        let owner = mesh.addressing().owner[f];
        let outward = mesh.face_area(f);
        let to_face = mesh.face_centre(f) - mesh.cell_centre(owner);
        if outward.dot(&to_face) < 0.0 {
            mesh.faces[f].reverse();
        }
    }
    mesh.invalidate_addressing();

    debug!("{} pyramid side faces inserted", n_side);
    targets.len()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geom::{Aabb, TriSurface};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn uniform_tree(levels: u8) -> Octree {
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
        o
    }

    #[test]
    fn uniform_box_round_trip() {
        // 2x2x2 cube, unrefined beyond a uniform level: N leaves per axis
        let o = uniform_tree(2);
        let n = 4usize;
        let types = vec![BoxType::MeshCell; o.len()];
        let mut m = extract(&o, &types, 0).unwrap();

        assert_eq!(m.cells.len(), n * n * n);
        assert_eq!(m.n_internal_faces(), 3 * (n - 1) * n * n);
        assert_eq!(m.boundaries[0].size, 6 * n * n);
        assert_eq!(m.points.len(), (n + 1) * (n + 1) * (n + 1));
        assert!(m.check().is_empty(), "{:?}", m.check());

        // Scan-order numbering: owner below neighbour everywhere
        let addr = m.addressing();
        for f in 0..3 * (n - 1) * n * n {
            assert!(addr.owner[f] < addr.neighbour[f].unwrap());
        }

        let side = 2.0 / n as f64;
        for v in m.cell_volumes() {
            assert_relative_eq!(v, side.powi(3), epsilon = 1e-12);
        }
    }

    #[test]
    fn split_hex_faces_at_level_interface() {
        let s = TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ));
        let mut o = Octree::build(&s, 0.0).unwrap();
        o.split(0, &s);
        let first = o.leaves()[0];
        o.split(first, &s);

        let types = vec![BoxType::MeshCell; o.len()];
        let mut m = extract(&o, &types, 0).unwrap();
        assert_eq!(m.cells.len(), 7 + 8);
        assert!(m.check().is_empty(), "{:?}", m.check());

        // The three level-1 cells facing the split corner carry four
        // quarter facets instead of one face
        let n_split = m.cells.iter().filter(|c| c.len() == 9).count();
        assert_eq!(n_split, 3);

        let total: f64 = m.cell_volumes().iter().sum();
        assert_relative_eq!(total, 8.0, epsilon = 1e-10);
    }

    #[test]
    fn decompose_leaves_only_simple_cells() {
        let s = TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ));
        let mut o = Octree::build(&s, 0.0).unwrap();
        o.split(0, &s);
        let first = o.leaves()[0];
        o.split(first, &s);

        let types = vec![BoxType::MeshCell; o.len()];
        let mut m = extract(&o, &types, 0).unwrap();
        let n_decomposed = decompose_split_hexes(&mut m);
        assert_eq!(n_decomposed, 3);

        assert!(m.cells.iter().all(|c| c.len() <= 6));
        assert!(m.check().is_empty(), "{:?}", m.check());
        // Pyramids tile the decomposed hexes exactly
        let volumes = m.cell_volumes();
        assert!(volumes.iter().all(|&v| v > 0.0));
        let total: f64 = volumes.iter().sum();
        assert_relative_eq!(total, 8.0, epsilon = 1e-10);

        // A second pass finds nothing left to do
        assert_eq!(decompose_split_hexes(&mut m), 0);
    }

    #[test]
    fn outside_leaves_are_skipped() {
        let o = uniform_tree(1);
        let mut types = vec![BoxType::MeshCell; o.len()];
        // Drop one corner leaf; its three inward faces become boundary
        let corner = o.leaves()[0];
        types[corner] = BoxType::Outside;
        let mut m = extract(&o, &types, 0).unwrap();

        assert_eq!(m.cells.len(), 7);
        assert_eq!(m.n_internal_faces(), 12 - 3);
        assert_eq!(m.boundaries[0].size, 6 * 4 - 3 + 3);
        assert!(m.check().is_empty(), "{:?}", m.check());
    }
}
