//! Boundary layer insertion and refinement
//!
//! Layer insertion moves the boundary points of the layered patches
//! inward by the requested total thickness and fills the vacated shell
//! with stacks of prismatic cells, one stack per original boundary face.
//! The surface keeps its shape: new points at the original positions form
//! the new boundary faces, the displaced original face becomes the
//! internal interface to its old owner cell, and side faces close the
//! stacks against each other (internal) or against unlayered patches
//! (boundary).  At sharp corners where the face normals around a point
//! disagree too much the extrusion direction is undefined; such points
//! collapse and the faces using them are skipped with a report instead of
//! self-intersecting.
//!
//! Layer refinement splits the wall-adjacent cell of every stack into two
//! sublayers with the requested growth ratio and returns the updated set of
//! layer points for the optimiser to lock.

use crate::mesh::PolyMesh;
use crate::Error;
use log::{info, warn};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Layer request for one boundary patch
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LayerSpec {
    /// Number of sublayers
    pub n_layers: usize,
    /// Total thickness of the layer stack
    pub total_thickness: f64,
    /// Thickness ratio between consecutive sublayers, wall outward
    #[serde(default = "default_growth")]
    pub growth_rate: f64,
    /// Optional cap on any single sublayer
    #[serde(default)]
    pub max_layer_thickness: Option<f64>,
}

fn default_growth() -> f64 {
    1.0
}

impl LayerSpec {
    /// Depth of each level below the surface: `n + 1` values from 0 at
    /// the wall to the (possibly capped) total
    fn depths(&self, n: usize) -> Vec<f64> {
        let g = self.growth_rate.max(1e-6);
        let first = if (g - 1.0).abs() < 1e-12 {
            self.total_thickness / n as f64
        } else {
            self.total_thickness * (g - 1.0) / (g.powi(n as i32) - 1.0)
        };
        let mut depths = vec![0.0];
        let mut depth = 0.0;
        for k in 0..n {
            let mut t = first * g.powi(k as i32);
            if let Some(cap) = self.max_layer_thickness {
                t = t.min(cap);
            }
            depth += t;
            depths.push(depth);
        }
        depths
    }
}

/// What layer insertion did
#[derive(Clone, Debug, Default)]
pub struct LayerReport {
    /// Boundary faces turned into prism stacks
    pub faces_extruded: usize,
    /// Prism cells created
    pub cells_added: usize,
    /// Points with no usable extrusion direction
    pub collapsed_points: usize,
    /// Faces skipped because of collapsed points or an empty spec
    pub skipped_faces: usize,
    /// Every point of the layer stacks, sorted
    pub points_in_layer: Vec<usize>,
}

/// Where a face belongs while the face list is being rebuilt
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FaceHome {
    Internal,
    Patch(usize),
}

/// Mean inward direction over the face normals around a point, or `None`
/// when the normals disagree too much for a single direction to exist
fn extrusion_direction(normals: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    let mut avg = Vector3::zeros();
    for n in normals {
        avg += n.normalize();
    }
    avg /= normals.len() as f64;
    if avg.norm() < 0.5 {
        None
    } else {
        Some(-avg.normalize())
    }
}

/// Stable reorder of the face list into the internal block followed by
/// the per-patch blocks given by `home`
fn reorder_faces(mesh: &mut PolyMesh, home: &[FaceHome]) {
    debug_assert_eq!(home.len(), mesh.faces.len());
    let mut new_label = vec![usize::MAX; mesh.faces.len()];
    let mut order = Vec::with_capacity(mesh.faces.len());

    for (f, h) in home.iter().enumerate() {
        if *h == FaceHome::Internal {
            new_label[f] = order.len();
            order.push(f);
        }
    }
    for p in 0..mesh.boundaries.len() {
        let start = order.len();
        for (f, h) in home.iter().enumerate() {
            if *h == FaceHome::Patch(p) {
                new_label[f] = order.len();
                order.push(f);
            }
        }
        mesh.boundaries[p].start = start;
        mesh.boundaries[p].size = order.len() - start;
    }
    debug_assert_eq!(order.len(), mesh.faces.len());

    let mut old = std::mem::take(&mut mesh.faces);
    mesh.faces = order
        .iter()
        .map(|&f| std::mem::take(&mut old[f]))
        .collect();
    for cell in mesh.cells.iter_mut() {
        for f in cell.iter_mut() {
            *f = new_label[*f];
        }
    }
    for ids in mesh.face_subsets.values_mut() {
        for i in ids.iter_mut() {
            *i = new_label[*i];
        }
    }
    mesh.invalidate_addressing();
}

/// Rewinds any face whose normal points into its owner cell
fn orient_faces(mesh: &mut PolyMesh) {
    let owner = mesh.addressing().owner.clone();
    for f in 0..mesh.faces.len() {
        let out = mesh.face_area(f);
        let to_face = mesh.face_centre(f) - mesh.cell_centre(owner[f]);
        if out.dot(&to_face) < 0.0 {
            mesh.faces[f].reverse();
        }
    }
}

/// Inserts prismatic boundary layers on the patches named in `specs`
///
/// # Errors
/// [`Error::UnknownPatch`] when a spec names a patch the mesh does not
/// have.
pub fn add_layers(
    mesh: &mut PolyMesh,
    specs: &BTreeMap<String, LayerSpec>,
) -> Result<LayerReport, Error> {
    info!("Generating boundary layers on {} patches", specs.len());
    let mut report = LayerReport::default();

    // Per-patch spec lookup, rejecting unknown names
    let mut patch_spec: Vec<Option<&LayerSpec>> =
        vec![None; mesh.boundaries.len()];
    for (name, spec) in specs {
        let p = mesh
            .boundaries
            .iter()
            .position(|b| &b.name == name)
            .ok_or_else(|| Error::UnknownPatch(name.clone()))?;
        if spec.n_layers == 0 || spec.total_thickness <= 0.0 {
            warn!("patch {name} has an empty layer spec, skipping");
            report.skipped_faces += mesh.boundaries[p].size;
            continue;
        }
        patch_spec[p] = Some(spec);
    }
    let n_levels = match patch_spec
        .iter()
        .flatten()
        .map(|s| s.n_layers)
        .min()
    {
        Some(n) => n,
        None => return Ok(report),
    };
    if patch_spec.iter().flatten().any(|s| s.n_layers != n_levels) {
        warn!("mismatched layer counts between patches, using {n_levels}");
    }

    // Active faces settle together with the collapsed points: dropping a
    // face changes the normals around its points, which can collapse
    // more of them
    let mut active: Vec<usize> = mesh
        .boundary_faces()
        .filter(|&f| {
            patch_spec[mesh.patch_of(f).unwrap()].is_some()
        })
        .collect();
    let initial_active = active.len();
    let mut directions: HashMap<usize, Vector3<f64>> = HashMap::new();
    loop {
        let mut normals: HashMap<usize, Vec<Vector3<f64>>> = HashMap::new();
        for &f in &active {
            let n = mesh.face_area(f);
            for &p in &mesh.faces[f] {
                normals.entry(p).or_default().push(n);
            }
        }
        directions.clear();
        let mut collapsed = 0;
        for (&p, ns) in &normals {
            match extrusion_direction(ns) {
                Some(dir) => {
                    directions.insert(p, dir);
                }
                None => collapsed += 1,
            }
        }
        let before = active.len();
        active.retain(|&f| {
            mesh.faces[f].iter().all(|p| directions.contains_key(p))
        });
        if active.len() == before {
            report.collapsed_points = collapsed;
            break;
        }
    }
    report.skipped_faces += initial_active - active.len();
    if active.is_empty() {
        warn!("no boundary faces left to extrude");
        return Ok(report);
    }

    // Boundary edge connectivity of the original mesh, for homing the
    // side faces of stacks bordering unlayered patches
    let mut edge_boundary: HashMap<(usize, usize), Vec<usize>> =
        HashMap::new();
    for f in mesh.boundary_faces() {
        let loop_ = &mesh.faces[f];
        for i in 0..loop_.len() {
            let a = loop_[i];
            let b = loop_[(i + 1) % loop_.len()];
            edge_boundary
                .entry((a.min(b), a.max(b)))
                .or_default()
                .push(f);
        }
    }

    let mut home: Vec<FaceHome> = (0..mesh.faces.len())
        .map(|f| match mesh.patch_of(f) {
            None => FaceHome::Internal,
            Some(p) => FaceHome::Patch(p),
        })
        .collect();

    // Per-point level ids: new points at levels 0..n-1 from the surface
    // down, the original (moved) point as the innermost level
    let mut active_points: Vec<usize> = active
        .iter()
        .flat_map(|&f| mesh.faces[f].clone())
        .collect();
    active_points.sort_unstable();
    active_points.dedup();

    let mut levels: HashMap<usize, Vec<usize>> = HashMap::new();
    for &p in &active_points {
        let dir = directions[&p];
        let spec = mesh
            .addressing()
            .point_faces[p]
            .clone()
            .into_iter()
            .filter(|&f| active.binary_search(&f).is_ok())
            .filter_map(|f| patch_spec[mesh.patch_of(f).unwrap()])
            .min_by(|a, b| {
                a.total_thickness.total_cmp(&b.total_thickness)
            })
            .unwrap();
        let depths = spec.depths(n_levels);

        let base = mesh.points[p];
        let mut ids = Vec::with_capacity(n_levels + 1);
        for depth in depths.iter().take(n_levels) {
            ids.push(mesh.points.len());
            mesh.points.push(base + dir * *depth);
        }
        ids.push(p);
        mesh.points[p] = base + dir * depths[n_levels];
        levels.insert(p, ids);
    }

    // One prism stack per active face, outermost first
    let mut stacks: HashMap<usize, Vec<usize>> = HashMap::new();
    for &f in &active {
        let loop_ = mesh.faces[f].clone();
        let pid = mesh.patch_of(f).unwrap();

        let mut prisms = Vec::with_capacity(n_levels);
        for _ in 0..n_levels {
            prisms.push(mesh.cells.len());
            mesh.cells.push(vec![]);
        }

        // New surface face, same winding as the original
        let surface_loop: Vec<usize> =
            loop_.iter().map(|p| levels[p][0]).collect();
        let id = mesh.faces.len();
        mesh.faces.push(surface_loop);
        home.push(FaceHome::Patch(pid));
        mesh.cells[prisms[0]].push(id);

        // Interfaces between consecutive prisms
        for k in 1..n_levels {
            let mid: Vec<usize> =
                loop_.iter().map(|p| levels[p][k]).collect();
            let id = mesh.faces.len();
            mesh.faces.push(mid);
            home.push(FaceHome::Internal);
            mesh.cells[prisms[k - 1]].push(id);
            mesh.cells[prisms[k]].push(id);
        }

        // The displaced original face joins the innermost prism to the
        // old owner cell
        home[f] = FaceHome::Internal;
        mesh.cells[prisms[n_levels - 1]].push(f);
        stacks.insert(f, prisms);
        report.cells_added += n_levels;
    }
    report.faces_extruded = active.len();

    // Side faces close the stacks along the boundary edges
    let mut done = HashSet::new();
    for &f in &active {
        let loop_ = mesh.faces[f].clone();
        for i in 0..loop_.len() {
            let a = loop_[i];
            let b = loop_[(i + 1) % loop_.len()];
            let key = (a.min(b), a.max(b));
            if !done.insert(key) {
                continue;
            }
            let at_edge = &edge_boundary[&key];
            let adjacent: Vec<usize> = at_edge
                .iter()
                .copied()
                .filter(|g| stacks.contains_key(g))
                .collect();
            let side_home = if adjacent.len() >= 2 {
                FaceHome::Internal
            } else {
                // The stack borders an unlayered (or skipped) face; its
                // side quads belong to that face's patch
                let other = at_edge.iter().find(|&&g| g != f).unwrap_or(&f);
                FaceHome::Patch(mesh.patch_of(*other).unwrap())
            };

            for k in 0..n_levels {
                let quad = vec![
                    levels[&a][k],
                    levels[&b][k],
                    levels[&b][k + 1],
                    levels[&a][k + 1],
                ];
                let id = mesh.faces.len();
                mesh.faces.push(quad);
                home.push(side_home);
                for g in &adjacent {
                    mesh.cells[stacks[g][k]].push(id);
                }
            }
        }
    }

    reorder_faces(mesh, &home);
    orient_faces(mesh);

    report.points_in_layer = active_points
        .iter()
        .flat_map(|p| levels[p].clone())
        .collect();
    report.points_in_layer.sort_unstable();
    mesh.point_subsets.insert(
        "boundaryLayerPoints".into(),
        report.points_in_layer.clone(),
    );
    mesh.cell_subsets.insert(
        "boundaryLayerCells".into(),
        stacks.values().flatten().copied().collect(),
    );

    info!(
        "Added {} layer cells over {} faces ({} faces skipped)",
        report.cells_added, report.faces_extruded, report.skipped_faces
    );
    Ok(report)
}

/// Splits the wall-adjacent cell of every layer stack into two sublayers
/// with the patch spec's growth ratio
///
/// Returns the updated layer point set (the previous layer points plus
/// the new mid-level points), which the optimiser must lock.
///
/// # Errors
/// [`Error::UnknownPatch`] when a spec names a patch the mesh does not
/// have.
pub fn refine_layers(
    mesh: &mut PolyMesh,
    specs: &BTreeMap<String, LayerSpec>,
) -> Result<Vec<usize>, Error> {
    info!("Refining boundary layers");
    let mut patch_frac: Vec<Option<f64>> = vec![None; mesh.boundaries.len()];
    for (name, spec) in specs {
        let p = mesh
            .boundaries
            .iter()
            .position(|b| &b.name == name)
            .ok_or_else(|| Error::UnknownPatch(name.clone()))?;
        // The wall-side sublayer takes 1/(1+g) of the cell
        patch_frac[p] = Some(1.0 / (1.0 + spec.growth_rate.max(1e-6)));
    }
    let owner = mesh.addressing().owner.clone();

    // Plan every split before touching the mesh: shared side faces must
    // be paired against the unsplit topology
    struct Split {
        cell: usize,
        wall_face: usize,
        opposite: usize,
        sides: Vec<usize>,
    }
    let mut plans = vec![];
    let mut pairs: HashMap<usize, usize> = HashMap::new();
    let mut skipped = 0usize;

    for p in 0..mesh.boundaries.len() {
        if patch_frac[p].is_none() {
            continue;
        }
        for f in mesh.boundaries[p].range() {
            let c = owner[f];
            let wall: Vec<usize> = mesh.faces[f].clone();
            let opposite = mesh.cells[c].iter().copied().find(|&g| {
                g != f
                    && mesh.faces[g].iter().all(|q| !wall.contains(q))
            });
            let Some(opposite) = opposite else {
                skipped += 1;
                continue;
            };
            let sides: Vec<usize> = mesh.cells[c]
                .iter()
                .copied()
                .filter(|&g| g != f && g != opposite)
                .collect();

            // Pair each wall point with its counterpart on the opposite
            // face through a side edge
            let mut ok = true;
            for &a in &wall {
                let mut partner = None;
                'sides: for &s in &sides {
                    let loop_ = &mesh.faces[s];
                    for i in 0..loop_.len() {
                        let x = loop_[i];
                        let y = loop_[(i + 1) % loop_.len()];
                        let other = if x == a {
                            y
                        } else if y == a {
                            x
                        } else {
                            continue;
                        };
                        if mesh.faces[opposite].contains(&other) {
                            partner = Some(other);
                            break 'sides;
                        }
                    }
                }
                match partner {
                    Some(b) => {
                        pairs.insert(a, b);
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                skipped += 1;
                continue;
            }
            plans.push(Split {
                cell: c,
                wall_face: f,
                opposite,
                sides,
            });
        }
    }
    if skipped > 0 {
        warn!("{skipped} layer faces could not be split further");
    }
    if plans.is_empty() {
        return Ok(mesh
            .point_subsets
            .get("boundaryLayerPoints")
            .cloned()
            .unwrap_or_default());
    }

    // Mid points per wall point, at the growth fraction below the wall
    let mut mids: HashMap<usize, usize> = HashMap::new();
    for plan in &plans {
        let frac =
            patch_frac[mesh.patch_of(plan.wall_face).unwrap()].unwrap();
        for &a in &mesh.faces[plan.wall_face].clone() {
            if mids.contains_key(&a) {
                continue;
            }
            let b = pairs[&a];
            let pos =
                mesh.points[a] + (mesh.points[b] - mesh.points[a]) * frac;
            mids.insert(a, mesh.points.len());
            mesh.points.push(pos);
        }
    }

    let mut home: Vec<FaceHome> = (0..mesh.faces.len())
        .map(|f| match mesh.patch_of(f) {
            None => FaceHome::Internal,
            Some(p) => FaceHome::Patch(p),
        })
        .collect();

    // Split every side face once: the outer half keeps the id, the inner
    // half is new and joins every cell that used the original
    let mut inner_half: HashMap<usize, usize> = HashMap::new();
    let split_cells: Vec<usize> = plans.iter().map(|s| s.cell).collect();
    for plan in &plans {
        for &s in &plan.sides {
            if inner_half.contains_key(&s) {
                continue;
            }
            let loop_ = mesh.faces[s].clone();
            // Rotate so the loop starts with its wall edge
            let n = loop_.len();
            let start = (0..n)
                .find(|&i| {
                    mids.contains_key(&loop_[i])
                        && mids.contains_key(&loop_[(i + 1) % n])
                })
                .unwrap();
            let rot: Vec<usize> =
                (0..n).map(|i| loop_[(start + i) % n]).collect();
            let (w1, w2) = (rot[0], rot[1]);
            let outer = vec![w1, w2, mids[&w2], mids[&w1]];
            let inner: Vec<usize> = std::iter::once(mids[&w1])
                .chain(std::iter::once(mids[&w2]))
                .chain(rot[2..].iter().copied())
                .collect();

            mesh.faces[s] = outer;
            let id = mesh.faces.len();
            mesh.faces.push(inner);
            home.push(home[s]);
            inner_half.insert(s, id);

            // Cells that used this face but are not being split keep
            // both halves
            for (c, cell) in mesh.cells.iter_mut().enumerate() {
                if cell.contains(&s) && !split_cells.contains(&c) {
                    cell.push(id);
                }
            }
        }
    }

    // Rebuild each split cell as two sublayer cells around a new mid face
    let mut new_points: Vec<usize> = mids.values().copied().collect();
    for plan in &plans {
        let wall_loop = mesh.faces[plan.wall_face].clone();
        let mid_loop: Vec<usize> =
            wall_loop.iter().map(|a| mids[a]).collect();
        let mid_id = mesh.faces.len();
        mesh.faces.push(mid_loop);
        home.push(FaceHome::Internal);

        let mut outer = vec![plan.wall_face, mid_id];
        let mut inner = vec![plan.opposite, mid_id];
        for &s in &plan.sides {
            outer.push(s);
            inner.push(inner_half[&s]);
        }
        mesh.cells[plan.cell] = outer;
        mesh.cells.push(inner);
    }

    reorder_faces(mesh, &home);
    orient_faces(mesh);

    let mut points_in_layer = mesh
        .point_subsets
        .get("boundaryLayerPoints")
        .cloned()
        .unwrap_or_default();
    points_in_layer.append(&mut new_points);
    points_in_layer.sort_unstable();
    points_in_layer.dedup();
    mesh.point_subsets
        .insert("boundaryLayerPoints".into(), points_in_layer.clone());

    info!(
        "Split {} wall cells into sublayers",
        plans.len()
    );
    Ok(points_in_layer)
}
