//! Module containing the hexpave universal error type
use thiserror::Error;

/// Universal error type for hexpave
///
/// Only unrecoverable conditions end up here; best-effort defects (failed
/// projections, residual inverted cells, collapsed layer patches) are
/// counted in a [`DefectLog`](crate::pipeline::DefectLog) instead and never
/// abort the run.
#[derive(Error, Debug)]
pub enum Error {
    /// The input surface contains no triangles
    #[error("the input surface contains no triangles")]
    EmptySurface,

    /// The surface bounding box is degenerate along at least one axis
    #[error("degenerate surface bounding box ({0:?} to {1:?})")]
    DegenerateRootBox([f64; 3], [f64; 3]),

    /// Too many extracted cells with inconsistent face topology
    #[error(
        "extraction produced {count} cells with inconsistent face \
         topology (tolerance {tolerance})"
    )]
    InconsistentCellTopology {
        /// Number of cells whose face fan failed to close
        count: usize,
        /// Maximum number of such cells tolerated before aborting
        tolerance: usize,
    },

    /// A pipeline step name was not recognised
    #[error("unknown pipeline step `{0}`")]
    UnknownStep(String),

    /// A patch name referenced by the dictionary does not exist
    #[error("unknown boundary patch `{0}`")]
    UnknownPatch(String),

    /// A mesh invariant was violated beyond repair
    #[error("mesh invariant violated in stage `{stage}`: {message}")]
    InvalidMesh {
        /// Pipeline stage that detected the violation
        stage: &'static str,
        /// Human-readable description, including offending indices
        message: String,
    },
}
