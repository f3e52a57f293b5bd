//! The meshing workflow
//!
//! A [`MeshGenerator`] owns the surface, the dictionary and the evolving
//! mesh, and exposes one method per named workflow step.  [`generate`]
//! runs the steps in order under a [`StepController`] that can skip named
//! steps and stop early, then renumbers the mesh and applies the final
//! patch renames.  Recoverable problems (failed projections, residual
//! inversions, collapsed layers) are collected in a [`DefectLog`];
//! only structural failures abort the run.
//!
//! [`generate`]: MeshGenerator::generate

use crate::config::MeshDict;
use crate::extract::{decompose_split_hexes, extract};
use crate::geom::TriSurface;
use crate::layers::{add_layers, refine_layers};
use crate::mesh::{modifier::Modifier, PolyMesh};
use crate::octree::refine::refine;
use crate::octree::{BoxType, Octree};
use crate::optimize::{
    optimize_surface, optimize_volume, untangle_surface, untangle_volume,
    OptimizeSettings,
};
use crate::repair::{repair_to_fixed_point, RepairSettings};
use crate::surface::edges::{
    apply_patches, assign_patches, extract_feature_edges,
};
use crate::surface::{map_to_surface, premap};
use crate::Error;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The named workflow steps, in execution order
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Step {
    /// Octree refinement and template mesh extraction
    TemplateGeneration,
    /// Topology repair of the template boundary
    SurfaceTopology,
    /// Projection of the boundary onto the surface
    SurfaceProjection,
    /// Patch voting for every boundary face
    PatchAssignment,
    /// Feature edge extraction between patches
    EdgeExtraction,
    /// Prismatic layer insertion under the requested patches
    BoundaryLayerGeneration,
    /// Untangling and smoothing
    MeshOptimisation,
    /// Radial subdivision of the layer stacks
    BoundaryLayerRefinement,
}

impl Step {
    /// Every step, in execution order
    pub const ALL: [Step; 8] = [
        Step::TemplateGeneration,
        Step::SurfaceTopology,
        Step::SurfaceProjection,
        Step::PatchAssignment,
        Step::EdgeExtraction,
        Step::BoundaryLayerGeneration,
        Step::MeshOptimisation,
        Step::BoundaryLayerRefinement,
    ];

    /// Dictionary name of the step
    pub fn name(&self) -> &'static str {
        match self {
            Step::TemplateGeneration => "templateGeneration",
            Step::SurfaceTopology => "surfaceTopology",
            Step::SurfaceProjection => "surfaceProjection",
            Step::PatchAssignment => "patchAssignment",
            Step::EdgeExtraction => "edgeExtraction",
            Step::BoundaryLayerGeneration => "boundaryLayerGeneration",
            Step::MeshOptimisation => "meshOptimisation",
            Step::BoundaryLayerRefinement => "boundaryLayerRefinement",
        }
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Step::ALL
            .iter()
            .find(|step| step.name() == s)
            .copied()
            .ok_or_else(|| Error::UnknownStep(s.to_owned()))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decides which steps run and records which have completed
#[derive(Clone, Debug, Default)]
pub struct StepController {
    skip: Vec<Step>,
    stop_after: Option<Step>,
    completed: Vec<Step>,
}

impl StepController {
    /// Builds a controller from the workflow section of the dictionary
    ///
    /// # Errors
    /// [`Error::UnknownStep`] for a name that is not a workflow step.
    pub fn new(workflow: &crate::config::WorkflowDict) -> Result<Self, Error> {
        let skip = workflow
            .skip
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<Step>, Error>>()?;
        let stop_after = workflow
            .stop_after
            .as_ref()
            .map(|s| s.parse())
            .transpose()?;
        Ok(Self {
            skip,
            stop_after,
            completed: vec![],
        })
    }

    /// Whether `step` should execute
    pub fn should_run(&self, step: Step) -> bool {
        !self.skip.contains(&step) && !self.completed.contains(&step)
    }

    /// Records a completed step
    pub fn record(&mut self, step: Step) {
        self.completed.push(step);
    }

    /// Steps completed so far, in order
    pub fn completed(&self) -> &[Step] {
        &self.completed
    }

    /// Whether the workflow ends after `step`
    pub fn stops_after(&self, step: Step) -> bool {
        self.stop_after == Some(step)
    }
}

/// Recoverable problems found during a run
///
/// Nothing in here aborts meshing; the log ends up with the caller so a
/// best-effort mesh can still be inspected or discarded.
#[derive(Clone, Debug, Default)]
pub struct DefectLog {
    entries: Vec<String>,
}

impl DefectLog {
    /// Records one defect against the step that found it
    pub fn add(&mut self, step: Step, message: impl Into<String>) {
        let message = message.into();
        warn!("[{step}] {message}");
        self.entries.push(format!("{step}: {message}"));
    }

    /// Whether the run was defect free
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded defects
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The recorded defects, oldest first
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Drives a whole mesh build over one surface and one dictionary
pub struct MeshGenerator {
    surface: TriSurface,
    dict: MeshDict,
    controller: StepController,
    octree: Option<Octree>,
    mesh: PolyMesh,
    locked: Vec<usize>,
    defects: DefectLog,
}

impl MeshGenerator {
    /// Prepares the surface (cleanup and feature classification) and the
    /// step controller
    ///
    /// # Errors
    /// [`Error::UnknownStep`] for bad workflow names.
    pub fn new(
        mut surface: TriSurface,
        dict: MeshDict,
    ) -> Result<Self, Error> {
        let controller = StepController::new(&dict.workflow)?;
        let open = surface.prepare(dict.feature_angle.to_radians());
        if !open.is_empty() {
            warn!(
                "input surface is not closed at {} triangles",
                open.len()
            );
        }
        Ok(Self {
            surface,
            dict,
            controller,
            octree: None,
            mesh: PolyMesh::default(),
            locked: vec![],
            defects: DefectLog::default(),
        })
    }

    /// The mesh in its current state
    pub fn mesh(&self) -> &PolyMesh {
        &self.mesh
    }

    /// Defects recorded so far
    pub fn defects(&self) -> &DefectLog {
        &self.defects
    }

    /// Octree refinement, classification and template mesh extraction
    pub fn template_generation(&mut self) -> Result<(), Error> {
        let mut octree =
            Octree::build(&self.surface, self.dict.bounding_box_padding)?;
        let report = refine(
            &mut octree,
            &self.surface,
            &self.dict.object_refinements,
            &self.dict.refine_settings(),
        );
        if report.balance_capped {
            self.defects.add(
                Step::TemplateGeneration,
                "octree balance hit its iteration cap",
            );
        }

        // Cells come from the leaves strictly inside the surface; the
        // leaves cut by it guide projection later
        let mut types = octree.classify();
        for t in types.iter_mut() {
            if *t == BoxType::Boundary {
                *t = BoxType::Outside;
            }
        }
        self.mesh = extract(
            &octree,
            &types,
            self.dict.inconsistent_cell_tolerance,
        )?;
        if self.dict.decompose_split_hexes {
            decompose_split_hexes(&mut self.mesh);
        }
        self.octree = Some(octree);
        Ok(())
    }

    /// Topology repair to a fixed point
    pub fn surface_topology(&mut self) -> Result<(), Error> {
        let report =
            repair_to_fixed_point(&mut self.mesh, &RepairSettings::default());
        if report.capped {
            self.defects.add(
                Step::SurfaceTopology,
                "topology repair hit its sweep cap",
            );
        }
        if self.mesh.cells.is_empty() {
            return Err(Error::InvalidMesh {
                stage: "surfaceTopology",
                message: "no cells left after topology repair".into(),
            });
        }
        Ok(())
    }

    /// Pre-map and precise projection of the boundary onto the surface
    pub fn surface_projection(&mut self) -> Result<(), Error> {
        let octree = self.octree.as_ref().ok_or(Error::InvalidMesh {
            stage: "surfaceProjection",
            message: "no octree; templateGeneration has not run".into(),
        })?;
        premap(&mut self.mesh, octree, &self.surface);
        let report = map_to_surface(&mut self.mesh, octree, &self.surface);
        if report.failed > 0 {
            self.defects.add(
                Step::SurfaceProjection,
                format!(
                    "{} boundary points found no surface element",
                    report.failed
                ),
            );
        }
        self.locked.extend(report.locked);
        self.locked.sort_unstable();
        self.locked.dedup();
        Ok(())
    }

    /// Patch voting and boundary reordering
    pub fn patch_assignment(&mut self) -> Result<(), Error> {
        let octree = self.octree.as_ref().ok_or(Error::InvalidMesh {
            stage: "patchAssignment",
            message: "no octree; templateGeneration has not run".into(),
        })?;
        let assigned = assign_patches(&self.mesh, octree, &self.surface);
        apply_patches(&mut self.mesh, &assigned, &self.surface.patch_names);
        Ok(())
    }

    /// Feature edge extraction between the assigned patches
    pub fn edge_extraction(&mut self) -> Result<(), Error> {
        let locked = extract_feature_edges(&mut self.mesh, &self.surface);
        self.locked.extend(locked);
        self.locked.sort_unstable();
        self.locked.dedup();
        Ok(())
    }

    /// Boundary layer insertion per the dictionary
    pub fn boundary_layer_generation(&mut self) -> Result<(), Error> {
        if self.dict.boundary_layers.is_empty() {
            return Ok(());
        }
        let report =
            add_layers(&mut self.mesh, &self.dict.boundary_layers)?;
        if report.collapsed_points > 0 || report.skipped_faces > 0 {
            self.defects.add(
                Step::BoundaryLayerGeneration,
                format!(
                    "{} collapsed points, {} faces skipped",
                    report.collapsed_points, report.skipped_faces
                ),
            );
        }
        self.locked.extend(report.points_in_layer);
        self.locked.sort_unstable();
        self.locked.dedup();
        Ok(())
    }

    /// Untangling and quality smoothing
    pub fn mesh_optimisation(&mut self) -> Result<(), Error> {
        let opt = &self.dict.optimisation;
        let settings = OptimizeSettings {
            max_iterations: opt.untangle_iterations,
            ..OptimizeSettings::default()
        };

        let surface_report =
            untangle_surface(&mut self.mesh, &self.locked, &settings);
        optimize_surface(&mut self.mesh, &self.locked, opt.surface_iterations);
        let volume_report =
            untangle_volume(&mut self.mesh, &self.locked, &settings);
        optimize_volume(&mut self.mesh, &self.locked, opt.volume_iterations);

        let residual = surface_report.residual() + volume_report.residual();
        if residual > 0 {
            self.defects.add(
                Step::MeshOptimisation,
                format!("{residual} inverted entities remain"),
            );
        }
        Ok(())
    }

    /// Radial subdivision of the boundary layer stacks
    pub fn boundary_layer_refinement(&mut self) -> Result<(), Error> {
        if self.dict.boundary_layers.is_empty() {
            return Ok(());
        }
        let points =
            refine_layers(&mut self.mesh, &self.dict.boundary_layers)?;
        self.locked.extend(points);
        self.locked.sort_unstable();
        self.locked.dedup();
        Ok(())
    }

    fn run_step(&mut self, step: Step) -> Result<(), Error> {
        match step {
            Step::TemplateGeneration => self.template_generation(),
            Step::SurfaceTopology => self.surface_topology(),
            Step::SurfaceProjection => self.surface_projection(),
            Step::PatchAssignment => self.patch_assignment(),
            Step::EdgeExtraction => self.edge_extraction(),
            Step::BoundaryLayerGeneration => self.boundary_layer_generation(),
            Step::MeshOptimisation => self.mesh_optimisation(),
            Step::BoundaryLayerRefinement => self.boundary_layer_refinement(),
        }
    }

    /// Runs the remaining workflow steps and finalises the mesh
    ///
    /// # Errors
    /// The first structural failure of any step, or
    /// [`Error::InvalidMesh`] when the finished mesh violates its own
    /// invariants.
    pub fn generate(&mut self) -> Result<&PolyMesh, Error> {
        for step in Step::ALL {
            if !self.controller.should_run(step) {
                info!("Skipping {step}");
                continue;
            }
            info!("Starting {step}");
            self.run_step(step)?;
            self.controller.record(step);
            info!("Finished {step}");
            if self.controller.stops_after(step) {
                info!("Stopping after {step} as requested");
                return Ok(&self.mesh);
            }
        }

        let mut modifier = Modifier::new(&mut self.mesh);
        modifier.remove_unused_points();
        modifier.renumber();
        let renames: BTreeMap<String, (String, String)> = self
            .dict
            .patch_renames
            .iter()
            .map(|(old, r)| {
                (old.clone(), (r.new_name.clone(), r.new_type.clone()))
            })
            .collect();
        modifier.rename_patches(&renames);

        let problems = self.mesh.check();
        if !problems.is_empty() {
            return Err(Error::InvalidMesh {
                stage: "final",
                message: problems.join("; "),
            });
        }
        Ok(&self.mesh)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PatchRename, WorkflowDict};
    use crate::geom::Aabb;
    use crate::layers::LayerSpec;
    use nalgebra::Point3;

    fn cube() -> TriSurface {
        TriSurface::hexahedron(&Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 2.0),
        ))
    }

    #[test]
    fn step_names_round_trip() {
        for step in Step::ALL {
            assert_eq!(step.name().parse::<Step>().unwrap(), step);
        }
        match "surfaceSnapping".parse::<Step>() {
            Err(Error::UnknownStep(name)) => {
                assert_eq!(name, "surfaceSnapping");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn controller_skips_and_stops() {
        let workflow = WorkflowDict {
            skip: vec!["edgeExtraction".to_owned()],
            stop_after: Some("surfaceProjection".to_owned()),
        };
        let mut controller = StepController::new(&workflow).unwrap();
        assert!(controller.should_run(Step::TemplateGeneration));
        assert!(!controller.should_run(Step::EdgeExtraction));
        assert!(controller.stops_after(Step::SurfaceProjection));

        controller.record(Step::TemplateGeneration);
        assert!(!controller.should_run(Step::TemplateGeneration));
        assert_eq!(controller.completed(), &[Step::TemplateGeneration]);
    }

    #[test]
    fn full_cube_build() {
        let dict: MeshDict = serde_json::from_str(
            r#"{ "maxCellSize": 0.3, "boundingBoxPadding": 0.05 }"#,
        )
        .unwrap();
        let mut generator = MeshGenerator::new(cube(), dict).unwrap();
        generator.generate().unwrap();

        let mesh = generator.mesh();
        assert!(!mesh.cells.is_empty());
        // Six patches from the surface survive to the end
        assert_eq!(mesh.boundaries.len(), 6);
        assert!(mesh
            .boundaries
            .iter()
            .any(|b| b.name == "zMin" && b.size > 0));
        let mut check = generator.mesh.clone();
        assert!(check.check().is_empty(), "{:?}", check.check());
        assert!(check.cell_volumes().iter().all(|&v| v > 0.0));
    }

    #[test]
    fn interior_refinement_rule_build() {
        // An interior rule leaves a refinement-level interface between
        // meshed cells, so split hexes flow through the whole pipeline
        let dict: MeshDict = serde_json::from_str(
            r#"{
                "maxCellSize": 0.3,
                "boundingBoxPadding": 0.05,
                "objectRefinements": [
                    {
                        "type": "sphere",
                        "sizing": { "additionalLevels": 1 },
                        "centre": [1.0, 1.0, 1.0],
                        "radius": 0.3
                    }
                ]
            }"#,
        )
        .unwrap();
        let mut generator = MeshGenerator::new(cube(), dict).unwrap();
        generator.generate().unwrap();

        let mut mesh = generator.mesh().clone();
        assert!(mesh.cells.iter().any(|c| c.len() > 6));
        assert_eq!(mesh.boundaries.len(), 6);
        assert!(mesh.check().is_empty(), "{:?}", mesh.check());
        assert!(mesh.cell_volumes().iter().all(|&v| v > 0.0));
    }

    #[test]
    fn stop_after_template_generation() {
        let mut dict: MeshDict = serde_json::from_str(
            r#"{ "maxCellSize": 0.3 }"#,
        )
        .unwrap();
        dict.workflow.stop_after = Some("templateGeneration".to_owned());

        let mut generator = MeshGenerator::new(cube(), dict).unwrap();
        generator.generate().unwrap();
        // The template mesh exists but was never projected or patched
        assert!(!generator.mesh().cells.is_empty());
        assert_eq!(generator.mesh().boundaries.len(), 1);
        assert_eq!(generator.mesh().boundaries[0].name, "defaultFaces");
        assert_eq!(
            generator.controller.completed(),
            &[Step::TemplateGeneration]
        );
    }

    #[test]
    fn layered_cube_build() {
        let mut dict: MeshDict = serde_json::from_str(
            r#"{ "maxCellSize": 0.4, "boundingBoxPadding": 0.05 }"#,
        )
        .unwrap();
        dict.boundary_layers.insert(
            "zMin".to_owned(),
            LayerSpec {
                n_layers: 2,
                total_thickness: 0.05,
                growth_rate: 1.2,
                max_layer_thickness: None,
            },
        );
        dict.patch_renames.insert(
            "zMin".to_owned(),
            PatchRename {
                new_name: "bottom".to_owned(),
                new_type: "wall".to_owned(),
            },
        );

        let mut generator = MeshGenerator::new(cube(), dict).unwrap();
        generator.generate().unwrap();
        let mesh = generator.mesh();
        assert!(mesh
            .boundaries
            .iter()
            .any(|b| b.name == "bottom" && b.patch_type == "wall"));
        assert!(mesh.cell_subsets.contains_key("boundaryLayerCells"));
    }
}
