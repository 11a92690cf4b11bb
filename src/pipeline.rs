//! Run orchestration.
//!
//! A [`Pipeline`] owns the two per-run caches (normalized lightmaps,
//! generated materials) and drives the whole bake: texture phase, per-instance
//! rebake, consolidation, tree assembly, cleanup. Per-instance failures are
//! counted and reported once at run end; only a missing root target rejects
//! the run outright.

use std::collections::{HashMap, HashSet};

use bon::Builder;
use itertools::Itertools;
use rootcause::Report;
use thiserror::Error;
use tracing::warn;

use crate::Rc;
use crate::bake::{self, OffsetMode, ProcessedMesh, RebakeOptions};
use crate::merge;
use crate::output::{self, HierarchyMode, OutputMesh, OutputNode};
use crate::scene::{BlendMode, Scene};
use crate::texture::{LightmapImage, LightmapRegistry, PrecisionTier, TextureCache};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no root target provided")]
    MissingRoot,
    #[error("run cancelled after {processed} processed instances")]
    Cancelled { processed: usize },
}

/// Progress milestones, reported in order through the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Start,
    Textures,
    Merge,
    Cleanup,
    Done,
}

/// Full configuration for one bake run.
#[derive(Builder, Debug, Clone)]
pub struct PipelineOptions {
    /// Name of the output root node. A run without one is rejected.
    root_name: Option<String>,
    #[builder(default)]
    tier: PrecisionTier,
    /// Longest-side cap for normalized lightmaps. `None` keeps source size.
    size_cap: Option<u32>,
    /// Dither strength; `None` disables dithering.
    dither: Option<f32>,
    /// Vertex-offset magnitude passed to the rebake step.
    #[builder(default = 0.001)]
    offset: f32,
    #[builder(default)]
    offset_mode: OffsetMode,
    #[builder(default)]
    recompute_normals: bool,
    /// Consolidate meshes sharing a material into one. On by default.
    #[builder(default = true)]
    merge: bool,
    #[builder(default)]
    hierarchy: HierarchyMode,
}

impl PipelineOptions {
    pub fn root_name(&self) -> Option<&str> {
        self.root_name.as_deref()
    }

    pub fn tier(&self) -> PrecisionTier {
        self.tier
    }

    pub fn size_cap(&self) -> Option<u32> {
        self.size_cap
    }

    pub fn dither(&self) -> Option<f32> {
        self.dither
    }

    pub fn merge(&self) -> bool {
        self.merge
    }

    pub fn hierarchy(&self) -> HierarchyMode {
        self.hierarchy
    }

    fn rebake_options(&self) -> RebakeOptions {
        RebakeOptions {
            offset: self.offset,
            mode: self.offset_mode,
            recompute_normals: self.recompute_normals,
        }
    }
}

/// Per-run instance counts, reported once at run end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RunSummary {
    pub processed: usize,
    /// Instances without a secondary-UV channel (not an error).
    pub skipped_no_uv: usize,
    /// Instances without an assigned lightmap (not an error).
    pub skipped_no_lightmap: usize,
    /// Instances skipped because of a read or bake failure.
    pub skipped_errors: usize,
    /// Groups that had two or more members and were merged.
    pub merged_groups: usize,
    /// Source meshes folded away by merging.
    pub merged_meshes: usize,
}

/// One generated unlit material per distinct lightmap, cached per run.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GeneratedMaterial {
    pub name: String,
    pub lightmap_id: u32,
    /// Blend behavior inherited from the first renderer seen with this
    /// lightmap.
    pub blend: BlendMode,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub texture: Rc<LightmapImage>,
}

/// Everything a run hands back to the collaborator.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RunOutput {
    pub root: OutputNode,
    pub materials: Vec<GeneratedMaterial>,
    pub summary: RunSummary,
    /// Human-readable skip/failure details, one entry per cause.
    pub diagnostics: Vec<String>,
}

/// One bake run's context. Caches are rebuilt at the start of every run, so a
/// `Pipeline` can be reused across runs without stale cross-run state.
pub struct Pipeline<'a> {
    registry: &'a dyn LightmapRegistry,
    options: PipelineOptions,
    textures: TextureCache,
    material_index: HashMap<u32, usize>,
    materials: Vec<GeneratedMaterial>,
    name_counter: u32,
    diagnostics: Vec<String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(registry: &'a dyn LightmapRegistry, options: PipelineOptions) -> Self {
        Self {
            registry,
            options,
            textures: TextureCache::new(),
            material_index: HashMap::new(),
            materials: Vec::new(),
            name_counter: 0,
            diagnostics: Vec::new(),
        }
    }

    /// Run the full bake synchronously.
    pub fn run(&mut self, scene: &Scene) -> Result<RunOutput, Report<RunError>> {
        self.run_with(scene, |_| {}, || false)
    }

    /// Run with a progress callback and a cooperative cancellation check.
    ///
    /// `should_cancel` is polled between per-instance steps; instance
    /// processing is order-insensitive apart from the naming counter, so
    /// cancelling mid-run leaves no partial state behind in the caller.
    pub fn run_with(
        &mut self,
        scene: &Scene,
        mut progress: impl FnMut(Milestone),
        mut should_cancel: impl FnMut() -> bool,
    ) -> Result<RunOutput, Report<RunError>> {
        let Some(root_name) = self.options.root_name().map(str::to_owned) else {
            return Err(Report::new(RunError::MissingRoot));
        };

        // Fresh caches per run.
        self.textures = TextureCache::new();
        self.material_index.clear();
        self.materials.clear();
        self.name_counter = 0;
        self.diagnostics.clear();

        let mut summary = RunSummary::default();
        progress(Milestone::Start);

        // Texture phase: one normalized lightmap and one generated material
        // per distinct id referenced by a qualifying instance.
        let wanted: Vec<(u32, BlendMode)> = scene
            .instances
            .iter()
            .filter(|i| !i.secondary_uv.is_empty())
            .filter_map(|i| i.lightmap_id.map(|id| (id, i.blend)))
            .unique_by(|&(id, _)| id)
            .collect();

        let mut failed: HashSet<u32> = HashSet::new();
        for (id, blend) in wanted {
            if should_cancel() {
                return Err(Report::new(RunError::Cancelled {
                    processed: summary.processed,
                }));
            }
            let result = match self.options.dither() {
                Some(strength) => self.textures.normalized_dithered(
                    self.registry,
                    id,
                    self.options.tier(),
                    self.options.size_cap(),
                    strength,
                ),
                None => self.textures.normalized(
                    self.registry,
                    id,
                    self.options.tier(),
                    self.options.size_cap(),
                ),
            };
            match result {
                Ok(texture) => {
                    let index = self.materials.len();
                    self.materials.push(GeneratedMaterial {
                        name: format!("lightmap_{id}"),
                        lightmap_id: id,
                        blend,
                        texture,
                    });
                    self.material_index.insert(id, index);
                }
                Err(e) => {
                    warn!("failed to normalize lightmap {id}: {e}");
                    self.diagnostics.push(format!("lightmap {id}: {e}"));
                    failed.insert(id);
                }
            }
        }
        progress(Milestone::Textures);

        // Rebake phase.
        let rebake_options = self.options.rebake_options();
        let mut processed: Vec<ProcessedMesh> = Vec::new();
        for instance in &scene.instances {
            if should_cancel() {
                return Err(Report::new(RunError::Cancelled {
                    processed: summary.processed,
                }));
            }
            if instance.secondary_uv.is_empty() {
                summary.skipped_no_uv += 1;
                continue;
            }
            let Some(id) = instance.lightmap_id else {
                summary.skipped_no_lightmap += 1;
                continue;
            };
            if failed.contains(&id) {
                summary.skipped_errors += 1;
                continue;
            }
            match bake::rebake_instance(instance, id, &rebake_options) {
                Ok(mesh) => {
                    summary.processed += 1;
                    processed.push(mesh);
                }
                Err(e) => {
                    warn!("skipping '{}': {e}", instance.name);
                    summary.skipped_errors += 1;
                    self.diagnostics.push(format!("{}: {e}", instance.name));
                }
            }
        }

        // Merge phase.
        let outputs: Vec<OutputMesh> = if self.options.merge() {
            let groups = merge::group_by_material(processed);
            summary.merged_groups = groups.mergeable_count();
            let mut outs = Vec::new();
            for (key, members) in groups.groups {
                let member_count = members.len();
                let merged = merge::merge_group(&key, members, &mut self.name_counter);
                if member_count > 1 {
                    summary.merged_meshes += member_count;
                }
                outs.push(self.to_output(merged));
            }
            outs
        } else {
            processed.into_iter().map(|m| self.to_output(m)).collect()
        };
        if self.options.merge() && summary.merged_groups == 0 {
            tracing::debug!("no groups qualified for merging");
        }
        progress(Milestone::Merge);

        // Tree assembly + cleanup (materialize prunes empty scaffolding).
        let root = output::materialize(&root_name, self.options.hierarchy(), scene, outputs);
        progress(Milestone::Cleanup);

        let out = RunOutput {
            root,
            materials: std::mem::take(&mut self.materials),
            summary,
            diagnostics: std::mem::take(&mut self.diagnostics),
        };
        progress(Milestone::Done);
        Ok(out)
    }

    fn to_output(&self, mesh: ProcessedMesh) -> OutputMesh {
        let material = self
            .material_index
            .get(&mesh.lightmap_id)
            .copied()
            .unwrap_or(0);
        OutputMesh {
            mesh,
            material,
            submeshes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec2, Vec3};

    use super::*;
    use crate::scene::{MeshInstance, ScaleOffset, SourceNode};
    use crate::texture::{LightmapSet, PixelData};

    fn lightmap(id: u32) -> LightmapImage {
        LightmapImage {
            id,
            width: 4,
            height: 4,
            pixels: PixelData::Rgba8(vec![255; 64]),
        }
    }

    fn instance(name: &str, key: &str, lightmap_id: Option<u32>) -> MeshInstance {
        MeshInstance {
            name: name.into(),
            positions: vec![
                Vec3::ZERO,
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            normals: vec![Vec3::Z; 3],
            secondary_uv: vec![Vec2::new(0.5, 0.5); 3],
            indices: vec![0, 1, 2],
            world_transform: Mat4::IDENTITY,
            lightmap_id,
            scale_offset: ScaleOffset::IDENTITY,
            material_key: key.into(),
            blend: BlendMode::Opaque,
            parent: None,
        }
    }

    fn options() -> PipelineOptions {
        PipelineOptions::builder()
            .root_name("Baked".to_string())
            .build()
    }

    #[test]
    fn missing_root_rejects_the_run() {
        let registry = LightmapSet::default();
        let mut pipeline = Pipeline::new(&registry, PipelineOptions::builder().build());
        let err = pipeline.run(&Scene::default()).unwrap_err();
        assert!(err.to_string().contains("no root target"));
    }

    #[test]
    fn empty_uv_instances_are_skipped_not_failed() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let mut scene = Scene {
            nodes: Vec::new(),
            instances: vec![
                instance("a", "wood", Some(0)),
                instance("no_uv", "wood", Some(0)),
            ],
        };
        scene.instances[1].secondary_uv.clear();

        let mut pipeline = Pipeline::new(&registry, options());
        let out = pipeline.run(&scene).unwrap();
        assert_eq!(out.summary.processed, 1);
        assert_eq!(out.summary.skipped_no_uv, 1);
        assert_eq!(out.summary.skipped_errors, 0);
    }

    #[test]
    fn unassigned_lightmap_is_a_plain_skip() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![
                instance("a", "wood", Some(0)),
                instance("unlit", "wood", None),
            ],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let out = pipeline.run(&scene).unwrap();
        assert_eq!(out.summary.processed, 1);
        assert_eq!(out.summary.skipped_no_lightmap, 1);
    }

    #[test]
    fn unreadable_lightmap_skips_instance_and_continues() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![
                instance("ok", "wood", Some(0)),
                instance("broken", "stone", Some(9)),
            ],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let out = pipeline.run(&scene).unwrap();
        assert_eq!(out.summary.processed, 1);
        assert_eq!(out.summary.skipped_errors, 1);
        assert!(!out.diagnostics.is_empty());
    }

    #[test]
    fn shared_material_instances_merge_into_one_leaf() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![
                instance("a", "wood", Some(0)),
                instance("b", "wood", Some(0)),
            ],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let out = pipeline.run(&scene).unwrap();
        assert_eq!(out.summary.merged_groups, 1);
        assert_eq!(out.summary.merged_meshes, 2);
        assert_eq!(out.root.children.len(), 1);
        assert_eq!(out.root.children[0].name, "wood_combined_0");
        assert_eq!(out.root.children[0].mesh.as_ref().unwrap().mesh.vertex_count(), 6);
    }

    #[test]
    fn merge_can_be_disabled() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![
                instance("a", "wood", Some(0)),
                instance("b", "wood", Some(0)),
            ],
        };
        let opts = PipelineOptions::builder()
            .root_name("Baked".to_string())
            .merge(false)
            .build();
        let mut pipeline = Pipeline::new(&registry, opts);
        let out = pipeline.run(&scene).unwrap();
        assert_eq!(out.summary.merged_groups, 0);
        assert_eq!(out.root.children.len(), 2);
    }

    #[test]
    fn lone_instances_keep_their_names() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![instance("solo", "wood", Some(0))],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let out = pipeline.run(&scene).unwrap();
        assert_eq!(out.summary.merged_groups, 0);
        assert_eq!(out.root.children[0].name, "solo");
    }

    #[test]
    fn one_material_per_distinct_lightmap() {
        let registry = LightmapSet::new(vec![lightmap(0), lightmap(1)]);
        let mut cutout = instance("c", "brick", Some(1));
        cutout.blend = BlendMode::Cutout;
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![
                instance("a", "wood", Some(0)),
                instance("b", "stone", Some(0)),
                cutout,
            ],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let out = pipeline.run(&scene).unwrap();
        assert_eq!(out.materials.len(), 2);
        assert_eq!(out.materials[0].lightmap_id, 0);
        assert_eq!(out.materials[1].lightmap_id, 1);
        assert_eq!(out.materials[0].blend, BlendMode::Opaque);
        assert_eq!(out.materials[1].blend, BlendMode::Cutout);
    }

    #[test]
    fn milestones_arrive_in_order() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![instance("a", "wood", Some(0))],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let mut seen = Vec::new();
        pipeline
            .run_with(&scene, |m| seen.push(m), || false)
            .unwrap();
        assert_eq!(
            seen,
            vec![
                Milestone::Start,
                Milestone::Textures,
                Milestone::Merge,
                Milestone::Cleanup,
                Milestone::Done,
            ]
        );
    }

    #[test]
    fn cancellation_stops_the_run() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![instance("a", "wood", Some(0))],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let err = pipeline
            .run_with(&scene, |_| {}, || true)
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn preserve_mode_round_trip() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let mut inst = instance("crate", "wood", Some(0));
        inst.parent = Some(1);
        let scene = Scene {
            nodes: vec![
                SourceNode {
                    name: "level".into(),
                    translation: Vec3::ZERO,
                    rotation: glam::Quat::IDENTITY,
                    scale: Vec3::ONE,
                    parent: None,
                },
                SourceNode {
                    name: "props".into(),
                    translation: Vec3::ZERO,
                    rotation: glam::Quat::IDENTITY,
                    scale: Vec3::ONE,
                    parent: Some(0),
                },
            ],
            instances: vec![inst],
        };
        let opts = PipelineOptions::builder()
            .root_name("Baked".to_string())
            .hierarchy(HierarchyMode::Preserve)
            .build();
        let mut pipeline = Pipeline::new(&registry, opts);
        let out = pipeline.run(&scene).unwrap();
        let level = &out.root.children[0];
        assert_eq!(level.name, "level");
        assert_eq!(level.children[0].name, "props");
        assert!(level.children[0].children[0].mesh.is_some());
    }

    #[test]
    fn caches_reset_between_runs() {
        let registry = LightmapSet::new(vec![lightmap(0)]);
        let scene = Scene {
            nodes: Vec::new(),
            instances: vec![
                instance("a", "wood", Some(0)),
                instance("b", "wood", Some(0)),
            ],
        };
        let mut pipeline = Pipeline::new(&registry, options());
        let first = pipeline.run(&scene).unwrap();
        let second = pipeline.run(&scene).unwrap();
        // Same scene, fresh counter: names and materials are reproducible.
        assert_eq!(first.root.children[0].name, second.root.children[0].name);
        assert_eq!(first.materials.len(), second.materials.len());
    }
}
