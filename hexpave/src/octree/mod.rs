//! Adaptive octree spatial index over the input surface
//!
//! The tree is an arena of nodes addressed by integer index; children are
//! allocated as a contiguous block of 8 and a node stores the index of the
//! first child, so there is no per-node ownership bookkeeping.  Node
//! positions are integer cube coordinates against the (cubic) root box,
//! which makes neighbour lookups and corner-point merging exact.

pub mod refine;

pub use refine::RefinementRule;

use crate::geom::{Aabb, TriSurface};
use crate::Error;
use arrayvec::ArrayVec;

/// Integer cube coordinates of an octree node
///
/// A node at `level` L occupies the cube of side `root_size / 2^L` whose
/// minimum corner sits at `root_min + pos * side`.  Children are numbered
/// with bit 0 = +x, bit 1 = +y, bit 2 = +z, matching the corner numbering
/// used by the extractor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CubeCoords {
    /// Refinement level; the root is level 0
    pub level: u8,
    /// Integer position, each component in `[0, 2^level)`
    pub pos: [u32; 3],
}

impl CubeCoords {
    /// The root cube
    pub const ROOT: Self = Self {
        level: 0,
        pos: [0, 0, 0],
    };

    /// Coordinates of child `i` (0-7)
    pub fn child(&self, i: u8) -> Self {
        debug_assert!(i < 8);
        Self {
            level: self.level + 1,
            pos: [
                self.pos[0] * 2 + u32::from(i & 1),
                self.pos[1] * 2 + u32::from((i >> 1) & 1),
                self.pos[2] * 2 + u32::from((i >> 2) & 1),
            ],
        }
    }

    /// Same-level neighbour across face `dir` (0..6, packed as axis*2+side)
    ///
    /// Returns `None` when the neighbour would fall outside the root cube.
    pub fn face_neighbour(&self, dir: usize) -> Option<Self> {
        let axis = dir / 2;
        let positive = dir % 2 == 1;
        let mut pos = self.pos;
        if positive {
            if pos[axis] + 1 >= (1u32 << self.level) {
                return None;
            }
            pos[axis] += 1;
        } else {
            if pos[axis] == 0 {
                return None;
            }
            pos[axis] -= 1;
        }
        Some(Self {
            level: self.level,
            pos,
        })
    }

    /// Position of the node's minimum corner in units of the finest grid
    ///
    /// `max_level` must be at least `self.level`.
    pub fn fine_corner(&self, max_level: u8) -> [u32; 3] {
        let shift = max_level - self.level;
        [
            self.pos[0] << shift,
            self.pos[1] << shift,
            self.pos[2] << shift,
        ]
    }
}

/// A single octree node
#[derive(Clone, Debug)]
pub struct Node {
    /// Cube coordinates of this node
    pub coords: CubeCoords,
    /// Parent node index; `usize::MAX` for the root
    pub parent: usize,
    /// Index of the first of 8 contiguous children, or `None` for a leaf
    pub children: Option<usize>,
    /// Surface triangles that may intersect this node's box
    ///
    /// Purely an indexing accelerator; it may contain false positives but
    /// never misses a genuinely intersecting triangle.
    pub candidates: Vec<usize>,
}

impl Node {
    /// Whether this node is a leaf
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// Coarse classification of a leaf relative to the surface
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BoxType {
    /// Outside the closed surface
    Outside,
    /// Intersects the surface
    Boundary,
    /// Fully inside the closed surface; becomes a mesh cell
    MeshCell,
}

/// Result of a same-level face-neighbour query
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Neighbour {
    /// No neighbour (outside the root cube)
    None,
    /// A leaf at the same or a coarser level
    Leaf(usize),
    /// An internal node at the same level; its subtree borders the face
    Finer(usize),
}

/// Adaptive octree over the bounding cube of a surface
#[derive(Clone, Debug)]
pub struct Octree {
    nodes: Vec<Node>,
    root_min: nalgebra::Point3<f64>,
    root_size: f64,
    max_level: u8,
}

impl Octree {
    /// Builds a single-leaf octree over the padded bounding cube of the
    /// surface
    ///
    /// `padding` is a fraction of the largest bounding-box span added on
    /// every side.
    ///
    /// # Errors
    /// Propagates [`Error::DegenerateRootBox`] / [`Error::EmptySurface`]
    /// from the surface bounding box.
    pub fn build(surface: &TriSurface, padding: f64) -> Result<Self, Error> {
        let bb = surface.bounding_box()?;
        let span = bb.span();
        let size = span.x.max(span.y).max(span.z) * (1.0 + 2.0 * padding);
        let centre = bb.centre();
        let root_min = centre - nalgebra::Vector3::repeat(size * 0.5);

        Ok(Self {
            nodes: vec![Node {
                coords: CubeCoords::ROOT,
                parent: usize::MAX,
                children: None,
                candidates: (0..surface.triangles.len()).collect(),
            }],
            root_min: root_min.into(),
            root_size: size,
            max_level: 0,
        })
    }

    /// Number of nodes in the arena
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds only the root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Deepest refinement level present in the tree
    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Shared node access
    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    /// Geometric box of node `i`
    pub fn node_box(&self, i: usize) -> Aabb {
        let c = &self.nodes[i].coords;
        let side = self.root_size / f64::from(1u32 << c.level);
        let min = self.root_min
            + nalgebra::Vector3::new(
                f64::from(c.pos[0]) * side,
                f64::from(c.pos[1]) * side,
                f64::from(c.pos[2]) * side,
            );
        Aabb::new(min, min + nalgebra::Vector3::repeat(side))
    }

    /// Side length of node `i`'s box
    pub fn node_size(&self, i: usize) -> f64 {
        self.root_size / f64::from(1u32 << self.nodes[i].coords.level)
    }

    /// Indices of all current leaves, in arena order
    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_leaf())
            .collect()
    }

    /// Splits leaf `i` into 8 children, redistributing candidates
    ///
    /// Candidate triangles are re-tested against each child box with the
    /// SAT overlap test; a triangle that fails the test for a child is
    /// dropped from that child's list.
    pub fn split(&mut self, i: usize, surface: &TriSurface) {
        debug_assert!(self.nodes[i].is_leaf());
        let first = self.nodes.len();
        let parent_coords = self.nodes[i].coords;
        let candidates = std::mem::take(&mut self.nodes[i].candidates);
        self.nodes[i].children = Some(first);

        for ci in 0..8u8 {
            let coords = parent_coords.child(ci);
            self.nodes.push(Node {
                coords,
                parent: i,
                children: None,
                candidates: vec![],
            });
            let child = first + ci as usize;
            // A hair of slack keeps triangles that graze a child face from
            // being dropped on both sides of it
            let bb = self
                .node_box(child)
                .inflated(self.node_size(child) * 1e-10);
            let node = &mut self.nodes[child];
            node.candidates = candidates
                .iter()
                .copied()
                .filter(|&t| surface.tri_overlaps_box(t, &bb))
                .collect();
        }
        self.max_level = self.max_level.max(parent_coords.level + 1);
    }

    /// The leaf whose box contains `p`, or `None` outside the root cube
    pub fn leaf_containing(&self, p: &nalgebra::Point3<f64>) -> Option<usize> {
        if !self.node_box(0).contains(p) {
            return None;
        }
        let mut n = 0;
        while let Some(first) = self.nodes[n].children {
            let b = self.node_box(n);
            let c = b.centre();
            let mut ci = 0usize;
            for a in 0..3 {
                if p[a] >= c[a] {
                    ci |= 1 << a;
                }
            }
            n = first + ci;
        }
        Some(n)
    }

    /// Descends towards the node with the given coordinates
    ///
    /// Returns the leaf that covers the coordinates if the tree stops
    /// early, the exact node when a node at `c.level` exists, and that
    /// node as `Finer` when it is internal.
    pub fn node_at(&self, c: CubeCoords) -> Neighbour {
        let mut n = 0;
        for depth in (0..c.level).rev() {
            match self.nodes[n].children {
                None => return Neighbour::Leaf(n),
                Some(first) => {
                    let mut ci = 0usize;
                    for a in 0..3 {
                        ci |= (((c.pos[a] >> depth) & 1) as usize) << a;
                    }
                    n = first + ci;
                }
            }
        }
        if self.nodes[n].is_leaf() {
            Neighbour::Leaf(n)
        } else {
            Neighbour::Finer(n)
        }
    }

    /// Same-level face neighbour of leaf `i` across `dir` (axis*2 + side)
    pub fn face_neighbour(&self, i: usize, dir: usize) -> Neighbour {
        match self.nodes[i].coords.face_neighbour(dir) {
            None => Neighbour::None,
            Some(c) => self.node_at(c),
        }
    }

    /// Leaves adjacent to face `dir` of leaf `i`
    ///
    /// For a finer neighbour this descends to the (up to 4 per level)
    /// grandchildren touching the shared face.
    pub fn face_adjacent_leaves(&self, i: usize, dir: usize) -> Vec<usize> {
        match self.face_neighbour(i, dir) {
            Neighbour::None => vec![],
            Neighbour::Leaf(n) => vec![n],
            Neighbour::Finer(n) => {
                let mut out = vec![];
                // Looking at the neighbour from `i`, the touching children
                // are the ones on the *opposite* side of `dir`'s axis
                let axis = dir / 2;
                let opposite_bit = u8::from(dir % 2 == 0);
                let mut stack = vec![n];
                while let Some(m) = stack.pop() {
                    match self.nodes[m].children {
                        None => out.push(m),
                        Some(first) => {
                            for ci in 0..8u8 {
                                if (ci >> axis) & 1 == opposite_bit {
                                    stack.push(first + ci as usize);
                                }
                            }
                        }
                    }
                }
                out
            }
        }
    }

    /// Gathers candidate triangles of every leaf whose box lies within
    /// `radius` of `p`
    pub fn candidates_near(
        &self,
        p: &nalgebra::Point3<f64>,
        radius: f64,
    ) -> Vec<usize> {
        let r_sq = radius * radius;
        let mut out = vec![];
        let mut stack = vec![0usize];
        while let Some(n) = stack.pop() {
            if self.node_box(n).dist_sq(p) > r_sq {
                continue;
            }
            match self.nodes[n].children {
                None => out.extend_from_slice(&self.nodes[n].candidates),
                Some(first) => stack.extend(first..first + 8),
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Size of the leaf containing `p`, falling back to the root size
    pub fn local_size(&self, p: &nalgebra::Point3<f64>) -> f64 {
        self.leaf_containing(p)
            .map(|l| self.node_size(l))
            .unwrap_or(self.root_size)
    }

    /// Classifies every leaf as outside / boundary / mesh cell
    ///
    /// Leaves with surface candidates are boundary; outside leaves are
    /// found by flood fill from the faces of the root cube; the remainder
    /// is inside.  The result is indexed by node id (internal nodes keep a
    /// meaningless `Outside` tag).
    pub fn classify(&self) -> Vec<BoxType> {
        let mut types = vec![BoxType::MeshCell; self.nodes.len()];
        let mut seeds = vec![];

        for (i, node) in self.nodes.iter().enumerate() {
            if !node.is_leaf() {
                types[i] = BoxType::Outside;
                continue;
            }
            if !node.candidates.is_empty() {
                types[i] = BoxType::Boundary;
                continue;
            }
            // Leaves touching the hull of the root cube seed the flood fill
            let c = &node.coords;
            let top = (1u32 << c.level) - 1;
            if (0..3).any(|a| c.pos[a] == 0 || c.pos[a] == top) {
                seeds.push(i);
            }
        }

        let mut stack = seeds;
        for &s in &stack {
            types[s] = BoxType::Outside;
        }
        while let Some(n) = stack.pop() {
            types[n] = BoxType::Outside;
            for dir in 0..6 {
                for m in self.face_adjacent_leaves(n, dir) {
                    if types[m] == BoxType::MeshCell {
                        types[m] = BoxType::Outside;
                        stack.push(m);
                    }
                }
            }
        }
        types
    }

    /// Corner positions of a leaf box in extractor corner order
    pub fn leaf_corners(&self, i: usize) -> ArrayVec<nalgebra::Point3<f64>, 8> {
        let b = self.node_box(i);
        (0..8u8)
            .map(|c| {
                nalgebra::Point3::new(
                    if c & 1 != 0 { b.max.x } else { b.min.x },
                    if c & 2 != 0 { b.max.y } else { b.min.y },
                    if c & 4 != 0 { b.max.z } else { b.min.z },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::Point3;

    fn cube_tree() -> (TriSurface, Octree) {
        let s = TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ));
        let o = Octree::build(&s, 0.05).unwrap();
        (s, o)
    }

    #[test]
    fn root_contains_surface() {
        let (s, o) = cube_tree();
        let bb = o.node_box(0);
        for p in &s.points {
            assert!(bb.contains(p));
        }
        assert_eq!(o.leaves(), vec![0]);
    }

    #[test]
    fn split_redistributes_candidates() {
        let (s, mut o) = cube_tree();
        o.split(0, &s);
        assert_eq!(o.len(), 9);
        assert_eq!(o.leaves().len(), 8);
        // Every child of the root touches the cube surface
        for l in o.leaves() {
            assert!(!o.node(l).candidates.is_empty());
        }
        // No triangle is lost
        let mut all: Vec<usize> = o
            .leaves()
            .iter()
            .flat_map(|&l| o.node(l).candidates.clone())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), s.triangles.len());
    }

    #[test]
    fn neighbour_lookup() {
        let (s, mut o) = cube_tree();
        o.split(0, &s);
        // Child 0 is at (0,0,0); its +x neighbour is child 1
        let c0 = o.leaves()[0];
        match o.face_neighbour(c0, 1) {
            Neighbour::Leaf(n) => {
                assert_eq!(o.node(n).coords.pos, [1, 0, 0]);
            }
            other => panic!("unexpected neighbour {other:?}"),
        }
        assert_eq!(o.face_neighbour(c0, 0), Neighbour::None);

        // Split the +x neighbour; child 0 now sees a finer neighbour with
        // four leaves on the shared face
        let c1 = match o.face_neighbour(c0, 1) {
            Neighbour::Leaf(n) => n,
            _ => unreachable!(),
        };
        o.split(c1, &s);
        match o.face_neighbour(c0, 1) {
            Neighbour::Finer(n) => assert_eq!(n, c1),
            other => panic!("unexpected neighbour {other:?}"),
        }
        assert_eq!(o.face_adjacent_leaves(c0, 1).len(), 4);
    }

    #[test]
    fn point_location() {
        let (s, mut o) = cube_tree();
        o.split(0, &s);
        let p = Point3::new(0.5, 0.5, 0.5);
        let l = o.leaf_containing(&p).unwrap();
        assert!(o.node_box(l).contains(&p));
        assert!(o.leaf_containing(&Point3::new(50.0, 0.0, 0.0)).is_none());
    }
}
