//! Hexpave is a library for hex-dominant Cartesian volume mesh generation
//! from triangulated surfaces.
//!
//! Meshing starts from a closed triangulated surface and a control
//! dictionary, and produces a polyhedral volume mesh whose cells are
//! mostly hexahedra: a cube octree is refined around the surface, the
//! leaves inside the surface become cells, and the resulting boundary is
//! projected onto the surface, split into patches, and smoothed.
//!
//! # The workflow
//! A [`MeshGenerator`](crate::pipeline::MeshGenerator) drives the whole
//! build over eight named steps:
//!
//! 1. `templateGeneration` builds and refines the [octree](crate::octree)
//!    and [extracts](crate::extract) the template mesh from its inside
//!    leaves
//! 2. `surfaceTopology` [repairs](crate::repair) boundary defects that
//!    would make projection impossible
//! 3. `surfaceProjection` [maps](crate::surface) the boundary points onto
//!    the surface
//! 4. `patchAssignment` votes every boundary face onto a surface patch
//! 5. `edgeExtraction` snaps the points between patches onto the surface
//!    feature edges and corners
//! 6. `boundaryLayerGeneration` inserts prismatic
//!    [layers](crate::layers) under the requested patches
//! 7. `meshOptimisation` [untangles and smooths](crate::optimize) the
//!    result
//! 8. `boundaryLayerRefinement` subdivides the layer stacks radially
//!
//! Steps can be skipped or the run stopped early through the
//! [dictionary](crate::config::MeshDict); recoverable problems are
//! collected in a [`DefectLog`](crate::pipeline::DefectLog) rather than
//! aborting the run.
//!
//! ```
//! use hexpave::{
//!     config::MeshDict,
//!     geom::{Aabb, TriSurface},
//!     pipeline::MeshGenerator,
//! };
//! use nalgebra::Point3;
//!
//! let surface = TriSurface::hexahedron(&Aabb::new(
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 1.0, 1.0),
//! ));
//! let dict: MeshDict =
//!     serde_json::from_str(r#"{ "maxCellSize": 0.2 }"#).unwrap();
//! let mut generator = MeshGenerator::new(surface, dict)?;
//! let mesh = generator.generate()?;
//! assert!(!mesh.cells.is_empty());
//! # Ok::<(), hexpave::Error>(())
//! ```
//!
//! The data structures are self-contained: a
//! [`PolyMesh`](crate::mesh::PolyMesh) stores points, face point loops and
//! cell face lists, and each step mutates it in place through the same
//! public API the caller sees.
#![warn(missing_docs)]

pub mod config;
pub mod extract;
pub mod geom;
pub mod layers;
pub mod mesh;
pub mod octree;
pub mod optimize;
pub mod pipeline;
pub mod repair;
pub mod surface;

mod error;
pub use error::Error;
