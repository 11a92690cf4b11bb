//! Bucketing and concatenation of processed meshes by shared material.
//!
//! Instances that share an assigned material (and therefore a lightmap) are
//! folded into one mesh each: vertices are baked into world space first so the
//! merged mesh sits under an identity transform, index buffers are rebased,
//! and the index width widens to 32-bit when the combined vertex count
//! outgrows 16-bit addressing.

use std::collections::BTreeMap;

use glam::Mat4;

use crate::bake::{Aabb, ProcessedMesh, index_width_for, normal_matrix};

/// Processed meshes bucketed by material key, in deterministic key order.
#[derive(Debug, Default)]
pub struct MergeGroups {
    pub groups: BTreeMap<String, Vec<ProcessedMesh>>,
}

impl MergeGroups {
    /// Number of groups that actually qualify for merging (two or more
    /// members). Zero is an informational outcome, not an error.
    pub fn mergeable_count(&self) -> usize {
        self.groups.values().filter(|g| g.len() > 1).count()
    }
}

/// Bucket meshes by their material key.
pub fn group_by_material(meshes: Vec<ProcessedMesh>) -> MergeGroups {
    let mut groups: BTreeMap<String, Vec<ProcessedMesh>> = BTreeMap::new();
    for mesh in meshes {
        groups.entry(mesh.material_key.clone()).or_default().push(mesh);
    }
    MergeGroups { groups }
}

/// Merge one group into a single world-space mesh.
///
/// A single-member group is returned unchanged; merging it would only waste
/// an allocation and a rename. For larger groups the first member's material
/// is authoritative (every member shares the key by construction), the output
/// name is `"{key}_combined_{n}"` with a per-run counter, and the merged mesh
/// carries an identity transform.
pub fn merge_group(
    material_key: &str,
    mut meshes: Vec<ProcessedMesh>,
    counter: &mut u32,
) -> ProcessedMesh {
    if meshes.len() == 1 {
        return meshes.pop().expect("length checked");
    }

    let total_vertices: usize = meshes.iter().map(|m| m.vertex_count()).sum();
    let total_indices: usize = meshes.iter().map(|m| m.indices.len()).sum();

    let mut positions = Vec::with_capacity(total_vertices);
    let mut normals = Vec::with_capacity(total_vertices);
    let mut uv = Vec::with_capacity(total_vertices);
    let mut indices = Vec::with_capacity(total_indices);

    for mesh in &meshes {
        let base = positions.len() as u32;
        let world = mesh.world_transform;
        let nmat = normal_matrix(&world);
        positions.extend(mesh.positions.iter().map(|p| world.transform_point3(*p)));
        normals.extend(
            mesh.normals
                .iter()
                .map(|n| (nmat * *n).normalize_or_zero()),
        );
        uv.extend(mesh.uv.iter().copied());
        indices.extend(mesh.indices.iter().map(|i| i + base));
    }

    let name = format!("{material_key}_combined_{counter}");
    *counter += 1;

    let first = &meshes[0];
    let bounds = Aabb::from_points(&positions);
    ProcessedMesh {
        name,
        positions,
        normals,
        uv,
        indices,
        index_width: index_width_for(total_vertices),
        bounds,
        world_transform: Mat4::IDENTITY,
        material_key: first.material_key.clone(),
        lightmap_id: first.lightmap_id,
        blend: first.blend,
        source_parent: None,
    }
}

/// One index range of a multi-material combined mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SubMesh {
    /// Index into the run's generated-material table.
    pub material: usize,
    pub first_index: usize,
    pub index_count: usize,
}

/// Fold every output mesh into one multi-material mesh with one index range
/// per distinct material.
///
/// Used by the combine-all flatten sub-mode. The combined mesh's own
/// material fields mirror the first region; per-region materials live in the
/// returned [`SubMesh`] list.
pub fn combine_all(
    name: String,
    meshes: Vec<(ProcessedMesh, usize)>,
) -> (ProcessedMesh, Vec<SubMesh>) {
    let mut by_material: BTreeMap<usize, Vec<ProcessedMesh>> = BTreeMap::new();
    for (mesh, material) in meshes {
        by_material.entry(material).or_default().push(mesh);
    }

    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut uv = Vec::new();
    let mut indices = Vec::new();
    let mut submeshes = Vec::new();
    let mut first = None;

    for (material, group) in by_material {
        let first_index = indices.len();
        for mesh in &group {
            let base = positions.len() as u32;
            let world = mesh.world_transform;
            let nmat = normal_matrix(&world);
            positions.extend(mesh.positions.iter().map(|p| world.transform_point3(*p)));
            normals.extend(
                mesh.normals
                    .iter()
                    .map(|n| (nmat * *n).normalize_or_zero()),
            );
            uv.extend(mesh.uv.iter().copied());
            indices.extend(mesh.indices.iter().map(|i| i + base));
        }
        submeshes.push(SubMesh {
            material,
            first_index,
            index_count: indices.len() - first_index,
        });
        if first.is_none() {
            if let Some(mesh) = group.into_iter().next() {
                first = Some(mesh);
            }
        }
    }

    let total_vertices = positions.len();
    let bounds = Aabb::from_points(&positions);
    let first = first.expect("combine_all requires at least one mesh");
    let combined = ProcessedMesh {
        name,
        positions,
        normals,
        uv,
        indices,
        index_width: index_width_for(total_vertices),
        bounds,
        world_transform: Mat4::IDENTITY,
        material_key: first.material_key,
        lightmap_id: first.lightmap_id,
        blend: first.blend,
        source_parent: None,
    };
    (combined, submeshes)
}
