//! The meshing dictionary
//!
//! One serde document controls a whole run: global sizing, the volumetric
//! refinement rules, per-patch boundary layer requests, optimisation
//! sweep counts, patch renaming and the workflow controls.  Everything
//! has a default so a dictionary only needs the fields it changes.

use crate::layers::LayerSpec;
use crate::octree::refine::{RefineSettings, RefinementRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Complete control dictionary for one mesh build
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MeshDict {
    /// Background cell size
    pub max_cell_size: f64,
    /// Padding of the octree root cube, as a fraction of the largest
    /// bounding box span
    pub bounding_box_padding: f64,
    /// Extra refinement levels forced on leaves touching the surface
    pub min_surface_levels: u8,
    /// Dihedral angle (degrees) above which a surface edge is a feature
    pub feature_angle: f64,
    /// Volumetric refinement rules
    pub object_refinements: Vec<RefinementRule>,
    /// Boundary layer requests per patch
    pub boundary_layers: BTreeMap<String, LayerSpec>,
    /// Smoothing and untangling sweep counts
    pub optimisation: OptimisationDict,
    /// Break cells with more than 6 faces into pyramids
    pub decompose_split_hexes: bool,
    /// Extracted cells allowed to have inconsistent topology before the
    /// run aborts
    pub inconsistent_cell_tolerance: usize,
    /// Step skipping and early stopping
    pub workflow: WorkflowDict,
    /// Final patch renames, applied after all steps
    pub patch_renames: BTreeMap<String, PatchRename>,
}

impl Default for MeshDict {
    fn default() -> Self {
        Self {
            max_cell_size: f64::INFINITY,
            bounding_box_padding: 0.05,
            min_surface_levels: 0,
            feature_angle: 45.0,
            object_refinements: vec![],
            boundary_layers: BTreeMap::new(),
            optimisation: OptimisationDict::default(),
            decompose_split_hexes: false,
            inconsistent_cell_tolerance: 0,
            workflow: WorkflowDict::default(),
            patch_renames: BTreeMap::new(),
        }
    }
}

impl MeshDict {
    /// Octree refinement settings implied by the dictionary
    pub fn refine_settings(&self) -> RefineSettings {
        RefineSettings {
            max_cell_size: self.max_cell_size,
            min_surface_levels: self.min_surface_levels,
            ..RefineSettings::default()
        }
    }
}

/// Sweep counts for the optimisation step
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct OptimisationDict {
    /// Laplacian sweeps over the boundary
    pub surface_iterations: usize,
    /// Laplacian sweeps over the interior
    pub volume_iterations: usize,
    /// Untangling iteration cap
    pub untangle_iterations: usize,
}

impl Default for OptimisationDict {
    fn default() -> Self {
        Self {
            surface_iterations: 3,
            volume_iterations: 5,
            untangle_iterations: 20,
        }
    }
}

/// Workflow controls: named steps to skip, and where to stop
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct WorkflowDict {
    /// Steps to leave out entirely
    pub skip: Vec<String>,
    /// Stop once this step has completed
    pub stop_after: Option<String>,
}

/// Rename (and retype) one boundary patch
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PatchRename {
    /// New patch name
    pub new_name: String,
    /// New physical type
    #[serde(default = "default_patch_type")]
    pub new_type: String,
}

fn default_patch_type() -> String {
    "patch".to_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::octree::refine::RuleSizing;

    #[test]
    fn minimal_dictionary() {
        let dict: MeshDict = serde_json::from_str("{}").unwrap();
        assert!(dict.max_cell_size.is_infinite());
        assert!(dict.object_refinements.is_empty());
        assert_eq!(dict.optimisation.volume_iterations, 5);
    }

    #[test]
    fn full_dictionary() {
        let dict: MeshDict = serde_json::from_str(
            r#"{
                "maxCellSize": 0.25,
                "minSurfaceLevels": 1,
                "objectRefinements": [
                    {
                        "type": "sphere",
                        "sizing": { "cellSize": 0.05 },
                        "centre": [0.5, 0.5, 0.5],
                        "radius": 0.2
                    },
                    {
                        "type": "box",
                        "sizing": { "additionalLevels": 2 },
                        "min": [0.0, 0.0, 0.0],
                        "max": [1.0, 1.0, 1.0]
                    }
                ],
                "boundaryLayers": {
                    "walls": {
                        "nLayers": 3,
                        "totalThickness": 0.02,
                        "growthRate": 1.2
                    }
                },
                "workflow": { "stopAfter": "surfaceProjection" },
                "patchRenames": {
                    "zMin": { "newName": "bottom", "newType": "wall" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(dict.object_refinements.len(), 2);
        match &dict.object_refinements[0] {
            RefinementRule::Sphere { sizing, radius, .. } => {
                assert_eq!(*radius, 0.2);
                assert!(matches!(sizing, RuleSizing::CellSize(s) if *s == 0.05));
            }
            other => panic!("unexpected rule {other:?}"),
        }
        let layer = &dict.boundary_layers["walls"];
        assert_eq!(layer.n_layers, 3);
        assert_eq!(layer.max_layer_thickness, None);
        assert_eq!(
            dict.workflow.stop_after.as_deref(),
            Some("surfaceProjection")
        );
        assert_eq!(dict.patch_renames["zMin"].new_type, "wall");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<MeshDict>(
            r#"{ "maxCellSze": 0.25 }"#
        )
        .is_err());
    }
}
