//! Refinement rules and the octree refinement controller
//!
//! Rules are a closed tagged union; each one answers a single question,
//! whether it demands finer resolution inside a given box.  The controller
//! applies the rules per leaf, splits marked leaves, and then enforces the
//! 2:1 level balance between face-adjacent leaves.

use super::{Neighbour, Octree};
use crate::geom::{Aabb, TriSurface};
use log::{debug, info, warn};
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Sizing carried by every refinement rule
///
/// Either an absolute target cell size or a number of levels added on top
/// of the global background level.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleSizing {
    /// Split until the leaf side is at most this long
    CellSize(f64),
    /// Split this many levels beyond the background level
    AdditionalLevels(u8),
}

impl RuleSizing {
    fn target_level(&self, root_size: f64, background: u8) -> u8 {
        match *self {
            RuleSizing::CellSize(s) => level_for_size(root_size, s),
            RuleSizing::AdditionalLevels(n) => background + n,
        }
    }
}

/// Smallest level whose leaf side does not exceed `cell_size`
pub fn level_for_size(root_size: f64, cell_size: f64) -> u8 {
    let mut level = 0u8;
    let mut side = root_size;
    while side > cell_size && level < 30 {
        side *= 0.5;
        level += 1;
    }
    level
}

/// A user-specified volumetric refinement directive
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RefinementRule {
    /// Refine every leaf that intersects the surface
    Surface {
        /// Target sizing near the surface
        sizing: RuleSizing,
    },
    /// Refine inside an axis-aligned box
    Box {
        /// Target sizing inside the region
        sizing: RuleSizing,
        /// Minimum corner
        min: Point3<f64>,
        /// Maximum corner
        max: Point3<f64>,
    },
    /// Refine inside a rotated box given by a local coordinate frame
    RotatedBox {
        /// Target sizing inside the region
        sizing: RuleSizing,
        /// Box corners in the local frame
        min: Point3<f64>,
        /// Box corners in the local frame
        max: Point3<f64>,
        /// Frame origin
        origin: Point3<f64>,
        /// Local z axis (`e3` in the dictionary)
        axis: Vector3<f64>,
        /// Local x axis (`e1` in the dictionary)
        direction: Vector3<f64>,
    },
    /// Refine inside a sphere
    Sphere {
        /// Target sizing inside the region
        sizing: RuleSizing,
        /// Sphere centre
        centre: Point3<f64>,
        /// Sphere radius
        radius: f64,
    },
    /// Refine inside a truncated cone between two discs
    Cone {
        /// Target sizing inside the region
        sizing: RuleSizing,
        /// Centre of the first disc
        p0: Point3<f64>,
        /// Radius at `p0`
        radius0: f64,
        /// Centre of the second disc
        p1: Point3<f64>,
        /// Radius at `p1`
        radius1: f64,
    },
    /// Refine along a line segment
    Line {
        /// Target sizing along the segment
        sizing: RuleSizing,
        /// Segment start
        p0: Point3<f64>,
        /// Segment end
        p1: Point3<f64>,
    },
    /// Refine every leaf near a classified surface feature edge
    FeatureEdge {
        /// Target sizing along feature edges
        sizing: RuleSizing,
    },
}

impl RefinementRule {
    /// Sizing of this rule
    pub fn sizing(&self) -> RuleSizing {
        match self {
            RefinementRule::Surface { sizing }
            | RefinementRule::Box { sizing, .. }
            | RefinementRule::RotatedBox { sizing, .. }
            | RefinementRule::Sphere { sizing, .. }
            | RefinementRule::Cone { sizing, .. }
            | RefinementRule::Line { sizing, .. }
            | RefinementRule::FeatureEdge { sizing } => *sizing,
        }
    }

    /// Whether the rule's region intersects the given leaf box
    ///
    /// `has_candidates` is the leaf's surface-intersection flag, used by
    /// the surface-driven variants.
    pub fn intersects_region(
        &self,
        bb: &Aabb,
        surface: &TriSurface,
        has_candidates: bool,
    ) -> bool {
        match self {
            RefinementRule::Surface { .. } => has_candidates,
            RefinementRule::Box { min, max, .. } => {
                bb.overlaps(&Aabb::new(*min, *max))
            }
            RefinementRule::RotatedBox {
                min,
                max,
                origin,
                axis,
                direction,
                ..
            } => {
                // Transform the leaf corners into the local frame and test
                // them against the local box, as the original does
                let e3 = axis.normalize();
                let e1 = (direction - e3 * direction.dot(&e3)).normalize();
                let e2 = e3.cross(&e1);
                let local = Aabb::new(*min, *max);
                corners(bb).iter().any(|p| {
                    let d = p - origin;
                    local.contains(&Point3::new(
                        d.dot(&e1),
                        d.dot(&e2),
                        d.dot(&e3),
                    ))
                })
            }
            RefinementRule::Sphere { centre, radius, .. } => {
                bb.dist_sq(centre) <= radius * radius
            }
            RefinementRule::Cone {
                p0,
                radius0,
                p1,
                radius1,
                ..
            } => {
                // Conservative: sample the corners and the axis segment
                if segment_overlaps_box(bb, p0, p1) {
                    return true;
                }
                let axis = p1 - p0;
                let len_sq = axis.norm_squared();
                corners(bb).iter().chain([bb.centre()].iter()).any(|p| {
                    let t = if len_sq > 0.0 {
                        ((p - p0).dot(&axis) / len_sq).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    let on_axis = p0 + axis * t;
                    let r = radius0 + (radius1 - radius0) * t;
                    (p - on_axis).norm_squared() <= r * r
                })
            }
            RefinementRule::Line { p0, p1, .. } => {
                segment_overlaps_box(bb, p0, p1)
            }
            RefinementRule::FeatureEdge { .. } => {
                surface.feature_edges.iter().any(|e| {
                    segment_overlaps_box(
                        bb,
                        &surface.points[e.ends[0]],
                        &surface.points[e.ends[1]],
                    )
                })
            }
        }
    }
}

fn corners(bb: &Aabb) -> [Point3<f64>; 8] {
    let mut out = [bb.min; 8];
    for (i, p) in out.iter_mut().enumerate() {
        if i & 1 != 0 {
            p.x = bb.max.x;
        }
        if i & 2 != 0 {
            p.y = bb.max.y;
        }
        if i & 4 != 0 {
            p.z = bb.max.z;
        }
    }
    out
}

/// Segment / box overlap by slab clipping
fn segment_overlaps_box(bb: &Aabb, a: &Point3<f64>, b: &Point3<f64>) -> bool {
    let d = b - a;
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for i in 0..3 {
        if d[i].abs() < f64::EPSILON {
            if a[i] < bb.min[i] || a[i] > bb.max[i] {
                return false;
            }
        } else {
            let inv = 1.0 / d[i];
            let mut near = (bb.min[i] - a[i]) * inv;
            let mut far = (bb.max[i] - a[i]) * inv;
            if near > far {
                std::mem::swap(&mut near, &mut far);
            }
            t0 = t0.max(near);
            t1 = t1.min(far);
            if t0 > t1 {
                return false;
            }
        }
    }
    true
}

/// Controls for [`refine`]
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineSettings {
    /// Background cell size; every leaf is refined at least this far
    pub max_cell_size: f64,
    /// Minimum refinement applied to leaves intersecting the surface,
    /// in levels beyond the background
    pub min_surface_levels: u8,
    /// Cap on refinement / balance sweeps
    pub max_iterations: usize,
}

impl Default for RefineSettings {
    fn default() -> Self {
        Self {
            max_cell_size: f64::INFINITY,
            min_surface_levels: 0,
            max_iterations: 32,
        }
    }
}

/// Outcome counters of a refinement run
#[derive(Copy, Clone, Debug, Default)]
pub struct RefineReport {
    /// Number of leaf-splitting sweeps performed
    pub sweeps: usize,
    /// Total leaves split
    pub splits: usize,
    /// Whether the balance loop hit its iteration cap
    pub balance_capped: bool,
}

/// Applies the refinement rules to the octree until the target density
/// and the 2:1 balance are reached
///
/// Hitting `settings.max_iterations` is a reported, non-fatal condition;
/// meshing proceeds with the best-effort octree.
pub fn refine(
    octree: &mut Octree,
    surface: &TriSurface,
    rules: &[RefinementRule],
    settings: &RefineSettings,
) -> RefineReport {
    info!("Refining octree");
    let root_size = octree.node_size(0);
    let background = level_for_size(root_size, settings.max_cell_size);
    let surface_min = background + settings.min_surface_levels;

    let targets: Vec<(u8, &RefinementRule)> = rules
        .iter()
        .map(|r| (r.sizing().target_level(root_size, background), r))
        .collect();

    let mut report = RefineReport::default();

    for sweep in 0..settings.max_iterations {
        let leaves = octree.leaves();
        let marked: Vec<usize> = leaves
            .par_iter()
            .copied()
            .filter(|&l| {
                let level = octree.node(l).coords.level;
                let has_candidates = !octree.node(l).candidates.is_empty();
                if level < background {
                    return true;
                }
                if has_candidates && level < surface_min {
                    return true;
                }
                let bb = octree.node_box(l);
                targets.iter().any(|&(target, rule)| {
                    level < target
                        && rule.intersects_region(&bb, surface, has_candidates)
                })
            })
            .collect();

        if marked.is_empty() {
            break;
        }
        debug!("refinement sweep {sweep}: splitting {} leaves", marked.len());
        for l in marked {
            octree.split(l, surface);
            report.splits += 1;
        }
        report.sweeps += 1;
    }

    report.balance_capped = !balance(octree, surface, settings.max_iterations);
    info!(
        "Finished refining octree ({} leaves, max level {})",
        octree.leaves().len(),
        octree.max_level()
    );
    report
}

/// Enforces the 2:1 balance between face-adjacent leaves
///
/// Returns `false` if the iteration cap was reached before the fixed
/// point.
pub fn balance(
    octree: &mut Octree,
    surface: &TriSurface,
    max_iterations: usize,
) -> bool {
    for _ in 0..max_iterations {
        let mut marked = vec![];
        for l in octree.leaves() {
            let level = octree.node(l).coords.level;
            if level < 2 {
                continue;
            }
            // A neighbour more than one level coarser must split
            for dir in 0..6 {
                if let Neighbour::Leaf(n) = octree.face_neighbour(l, dir) {
                    if octree.node(n).is_leaf()
                        && octree.node(n).coords.level + 1 < level
                    {
                        marked.push(n);
                    }
                }
            }
        }
        marked.sort_unstable();
        marked.dedup();
        if marked.is_empty() {
            return true;
        }
        for n in marked {
            if octree.node(n).is_leaf() {
                octree.split(n, surface);
            }
        }
    }
    warn!("octree 2:1 balance hit its iteration cap");
    false
}

#[cfg(test)]
mod test {
    use super::*;

    fn cube() -> (TriSurface, Octree) {
        let s = TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ));
        let o = Octree::build(&s, 0.1).unwrap();
        (s, o)
    }

    #[test]
    fn background_refinement() {
        let (s, mut o) = cube();
        let root = o.node_size(0);
        let settings = RefineSettings {
            max_cell_size: root / 4.0,
            ..Default::default()
        };
        refine(&mut o, &s, &[], &settings);
        // Uniform 4x4x4 grid of leaves
        let leaves = o.leaves();
        assert_eq!(leaves.len(), 64);
        assert!(leaves.iter().all(|&l| o.node(l).coords.level == 2));
    }

    #[test]
    fn sphere_rule_is_local() {
        let (s, mut o) = cube();
        let root = o.node_size(0);
        let settings = RefineSettings {
            max_cell_size: root / 2.0,
            ..Default::default()
        };
        let rules = [RefinementRule::Sphere {
            sizing: RuleSizing::AdditionalLevels(2),
            centre: Point3::new(0.1, 0.1, 0.1),
            radius: 0.05,
        }];
        refine(&mut o, &s, &rules, &settings);
        let max = o.max_level();
        assert_eq!(max, 3);
        // Deep leaves only where the rule demanded them: a leaf reaches
        // the deepest level only by its parent intersecting the sphere
        for l in o.leaves() {
            if o.node(l).coords.level == max {
                let parent = o.node(l).parent;
                let bb = o.node_box(parent);
                assert!(bb.dist_sq(&Point3::new(0.1, 0.1, 0.1)) <= 0.05 * 0.05);
            }
        }
    }

    #[test]
    fn two_to_one_balance() {
        let (s, mut o) = cube();
        let root = o.node_size(0);
        let settings = RefineSettings {
            max_cell_size: root / 2.0,
            ..Default::default()
        };
        let rules = [RefinementRule::Box {
            sizing: RuleSizing::AdditionalLevels(3),
            min: Point3::new(-0.05, -0.05, -0.05),
            max: Point3::new(0.05, 0.05, 0.05),
        }];
        refine(&mut o, &s, &rules, &settings);

        // Every face-adjacent leaf pair differs by at most one level
        for l in o.leaves() {
            let level = octree_level(&o, l);
            for dir in 0..6 {
                for n in o.face_adjacent_leaves(l, dir) {
                    let nl = octree_level(&o, n);
                    assert!(
                        (i32::from(level) - i32::from(nl)).abs() <= 1,
                        "leaves {l} (level {level}) and {n} (level {nl})"
                    );
                }
            }
        }
    }

    fn octree_level(o: &Octree, l: usize) -> u8 {
        o.node(l).coords.level
    }

    #[test]
    fn segment_box_clip() {
        let bb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        assert!(segment_overlaps_box(
            &bb,
            &Point3::new(-1.0, 0.5, 0.5),
            &Point3::new(2.0, 0.5, 0.5)
        ));
        assert!(!segment_overlaps_box(
            &bb,
            &Point3::new(-1.0, 2.0, 0.5),
            &Point3::new(2.0, 2.0, 0.5)
        ));
    }
}
