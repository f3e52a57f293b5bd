//! Topology-changing operations on a [`PolyMesh`]
//!
//! All removals compact the face/cell/point arrays and remap every
//! owner/neighbour, patch-range and subset reference, in the manner of the
//! original face-removal pass: internal faces are copied first, then each
//! patch block in order, with a `new_face_label` mapping (`None` for
//! removed entries) handed back to the caller.

use super::{BoundaryPatch, PolyMesh};
use log::{debug, info};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Fate of a face while removing cells
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Fate {
    Drop,
    Internal,
    /// Becomes (or stays) a boundary face of `patch`; `flip` when the
    /// surviving cell was the neighbour
    Boundary {
        patch: usize,
        flip: bool,
        exposed: bool,
    },
}

/// Mutating wrapper around a mesh, in the style of the original
/// `polyMeshGenModifier`
pub struct Modifier<'a> {
    mesh: &'a mut PolyMesh,
}

impl<'a> Modifier<'a> {
    /// Wraps a mesh for modification
    pub fn new(mesh: &'a mut PolyMesh) -> Self {
        Self { mesh }
    }

    /// Removes every face with `remove[f] == true`
    ///
    /// Returns `new_face_label`: the new index of each old face, `None`
    /// for removed ones.  Patch start/size values are rewritten so the
    /// patch partition invariant holds on exit; cells are rebuilt in
    /// parallel.
    pub fn remove_faces(&mut self, remove: &[bool]) -> Vec<Option<usize>> {
        debug_assert_eq!(remove.len(), self.mesh.faces.len());
        info!("Removing faces");

        let n_internal = self.mesh.n_internal_faces();
        let old_faces = std::mem::take(&mut self.mesh.faces);
        let mut new_label = vec![None; old_faces.len()];
        let mut faces = Vec::with_capacity(old_faces.len());
        let mut old_faces: Vec<Option<Vec<usize>>> =
            old_faces.into_iter().map(Some).collect();

        for f in 0..n_internal {
            if !remove[f] {
                new_label[f] = Some(faces.len());
                faces.push(old_faces[f].take().unwrap());
            }
        }

        for patch in &mut self.mesh.boundaries {
            let old_start = patch.start;
            let old_size = patch.size;
            patch.start = faces.len();
            patch.size = 0;
            for f in old_start..old_start + old_size {
                if !remove[f] {
                    patch.size += 1;
                    new_label[f] = Some(faces.len());
                    faces.push(old_faces[f].take().unwrap());
                }
            }
        }

        self.mesh.faces = faces;
        remap_subsets(&mut self.mesh.face_subsets, &new_label);

        self.mesh.cells.par_iter_mut().for_each(|cell| {
            cell.retain(|&f| new_label[f].is_some());
            for f in cell.iter_mut() {
                *f = new_label[*f].unwrap();
            }
        });

        self.mesh.invalidate_addressing();
        info!("Finished removing faces");
        new_label
    }

    /// Removes every cell with `remove[c] == true`
    ///
    /// Internal faces that lose exactly one side are flipped as needed and
    /// re-homed to the last boundary patch (created as `defaultFaces` when
    /// the mesh has none); faces losing both sides disappear.  Returns
    /// `new_cell_label`.
    pub fn remove_cells(&mut self, remove: &[bool]) -> Vec<Option<usize>> {
        debug_assert_eq!(remove.len(), self.mesh.cells.len());
        let n_removed = remove.iter().filter(|&&r| r).count();
        debug!("removing {n_removed} cells");

        self.mesh.addressing();
        let owner = self.mesh.addressing().owner.clone();
        let neighbour = self.mesh.addressing().neighbour.clone();
        let n_internal = self.mesh.n_internal_faces();

        if self.mesh.boundaries.is_empty() {
            self.mesh.boundaries.push(BoundaryPatch {
                name: "defaultFaces".into(),
                patch_type: "patch".into(),
                start: self.mesh.faces.len(),
                size: 0,
            });
        }
        let last_patch = self.mesh.boundaries.len() - 1;

        // Decide every face's fate
        let mut fate = vec![Fate::Drop; self.mesh.faces.len()];
        for f in 0..self.mesh.faces.len() {
            let own_kept = !remove[owner[f]];
            if f >= n_internal {
                if own_kept {
                    fate[f] = Fate::Boundary {
                        patch: self.mesh.patch_of(f).unwrap(),
                        flip: false,
                        exposed: false,
                    };
                }
                continue;
            }
            let nei_kept = !remove[neighbour[f].unwrap()];
            fate[f] = match (own_kept, nei_kept) {
                (true, true) => Fate::Internal,
                (false, false) => Fate::Drop,
                (own_kept, _) => Fate::Boundary {
                    patch: last_patch,
                    flip: !own_kept,
                    exposed: true,
                },
            };
        }

        // Compact cells first so the labels exist for reporting
        let mut new_cell_label = vec![None; self.mesh.cells.len()];
        let mut cells = vec![];
        for (c, faces) in self.mesh.cells.drain(..).enumerate() {
            if !remove[c] {
                new_cell_label[c] = Some(cells.len());
                cells.push(faces);
            }
        }
        self.mesh.cells = cells;
        remap_subsets(&mut self.mesh.cell_subsets, &new_cell_label);

        // Rebuild the face list: internal block, then per-patch blocks
        // with newly exposed faces appended to the last patch
        let mut old_faces: Vec<Option<Vec<usize>>> =
            std::mem::take(&mut self.mesh.faces)
                .into_iter()
                .map(Some)
                .collect();
        let mut new_label = vec![None; old_faces.len()];
        let mut faces = vec![];

        for f in 0..old_faces.len() {
            if fate[f] == Fate::Internal {
                new_label[f] = Some(faces.len());
                faces.push(old_faces[f].take().unwrap());
            }
        }

        let n_patches = self.mesh.boundaries.len();
        for p in 0..n_patches {
            let start = faces.len();
            // Faces already in this patch keep their relative order
            for f in 0..old_faces.len() {
                match fate[f] {
                    Fate::Boundary {
                        patch,
                        flip,
                        exposed,
                    } if patch == p && !exposed => {
                        debug_assert!(!flip);
                        new_label[f] = Some(faces.len());
                        faces.push(old_faces[f].take().unwrap());
                    }
                    _ => (),
                }
            }
            // Newly exposed internal faces land at the end of the last
            // patch
            if p == last_patch {
                for f in 0..old_faces.len() {
                    if let Fate::Boundary { exposed: true, flip, .. } = fate[f]
                    {
                        let mut loop_ = old_faces[f].take().unwrap();
                        if flip {
                            loop_.reverse();
                        }
                        new_label[f] = Some(faces.len());
                        faces.push(loop_);
                    }
                }
            }
            let patch = &mut self.mesh.boundaries[p];
            patch.start = start;
            patch.size = faces.len() - start;
        }

        self.mesh.faces = faces;
        remap_subsets(&mut self.mesh.face_subsets, &new_label);

        self.mesh.cells.par_iter_mut().for_each(|cell| {
            for f in cell.iter_mut() {
                // Every face of a surviving cell survives
                *f = new_label[*f].unwrap();
            }
        });

        self.mesh.invalidate_addressing();
        new_cell_label
    }

    /// Drops points referenced by no face and compacts the point list
    pub fn remove_unused_points(&mut self) -> Vec<Option<usize>> {
        let mut used = vec![false; self.mesh.points.len()];
        for face in &self.mesh.faces {
            for &p in face {
                used[p] = true;
            }
        }

        let mut new_label = vec![None; self.mesh.points.len()];
        let mut points = vec![];
        for (p, keep) in used.iter().enumerate() {
            if *keep {
                new_label[p] = Some(points.len());
                points.push(self.mesh.points[p]);
            }
        }
        let n_dropped = self.mesh.points.len() - points.len();
        if n_dropped > 0 {
            debug!("dropped {n_dropped} unused points");
        }
        self.mesh.points = points;

        for face in self.mesh.faces.iter_mut() {
            for p in face.iter_mut() {
                *p = new_label[*p].unwrap();
            }
        }
        remap_subsets(&mut self.mesh.point_subsets, &new_label);
        self.mesh.invalidate_addressing();
        new_label
    }

    /// Final renumbering pass: sorts the internal faces upper-triangular
    /// by (owner, neighbour)
    pub fn renumber(&mut self) {
        info!("Renumbering the mesh");
        self.mesh.addressing();
        let owner = self.mesh.addressing().owner.clone();
        let neighbour = self.mesh.addressing().neighbour.clone();
        let n_internal = self.mesh.n_internal_faces();

        let mut order: Vec<usize> = (0..n_internal).collect();
        order.sort_by_key(|&f| (owner[f], neighbour[f]));

        let mut new_label: Vec<Option<usize>> =
            (0..self.mesh.faces.len()).map(Some).collect();
        for (new, &old) in order.iter().enumerate() {
            new_label[old] = Some(new);
        }

        let mut faces = vec![Vec::new(); self.mesh.faces.len()];
        for (old, loop_) in self.mesh.faces.drain(..).enumerate() {
            faces[new_label[old].unwrap()] = loop_;
        }
        self.mesh.faces = faces;

        for cell in self.mesh.cells.iter_mut() {
            for f in cell.iter_mut() {
                *f = new_label[*f].unwrap();
            }
        }
        remap_subsets(&mut self.mesh.face_subsets, &new_label);
        self.mesh.invalidate_addressing();
        info!("Finished renumbering the mesh");
    }

    /// Renames patches and updates their physical types
    ///
    /// Unknown patch names in `renames` are ignored; the face ranges are
    /// untouched.
    pub fn rename_patches(
        &mut self,
        renames: &BTreeMap<String, (String, String)>,
    ) {
        for patch in self.mesh.boundaries.iter_mut() {
            if let Some((name, patch_type)) = renames.get(&patch.name) {
                debug!("renaming patch {} -> {name}", patch.name);
                patch.name = name.clone();
                patch.patch_type = patch_type.clone();
            }
        }
    }
}

fn remap_subsets(
    subsets: &mut BTreeMap<String, Vec<usize>>,
    new_label: &[Option<usize>],
) {
    for ids in subsets.values_mut() {
        *ids = ids.iter().filter_map(|&i| new_label[i]).collect();
    }
}
