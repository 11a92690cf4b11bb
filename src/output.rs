//! Output tree assembly.
//!
//! Builds the tree handed back to the collaborator for serialization: either
//! a clone of the source hierarchy's shape with baked leaves attached under
//! their original parents, or a flat group. A final prune removes every node
//! that ended up with no geometry anywhere beneath it.

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};

use crate::bake::ProcessedMesh;
use crate::merge::{self, SubMesh};
use crate::scene::Scene;

/// Shape of the output tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HierarchyMode {
    /// Clone the source hierarchy's shape and attach each output leaf under
    /// the clone of its original parent.
    Preserve,
    /// Attach every output directly under one group node.
    #[default]
    Flatten,
    /// Flatten, then fold everything into a single multi-material mesh with
    /// one sub-mesh range per distinct material.
    FlattenCombine,
}

/// A baked mesh plus its resolved material, owned by an output leaf.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OutputMesh {
    pub mesh: ProcessedMesh,
    /// Index into the run's generated-material table.
    pub material: usize,
    /// Per-region materials when this is a multi-material combined mesh;
    /// empty for single-material meshes.
    pub submeshes: Vec<SubMesh>,
}

/// One node of the output tree.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OutputNode {
    pub name: String,
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub mesh: Option<OutputMesh>,
    pub children: Vec<OutputNode>,
}

impl OutputNode {
    fn group(name: impl Into<String>) -> OutputNode {
        OutputNode {
            name: name.into(),
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            mesh: None,
            children: Vec::new(),
        }
    }

    fn leaf(mesh: OutputMesh, transform: Mat4) -> OutputNode {
        let (scale, rotation, translation) = transform.to_scale_rotation_translation();
        OutputNode {
            name: mesh.mesh.name.clone(),
            translation,
            rotation,
            scale,
            mesh: Some(mesh),
            children: Vec::new(),
        }
    }

    /// Whether this node or any descendant holds a mesh.
    pub fn has_geometry(&self) -> bool {
        self.mesh.is_some() || self.children.iter().any(OutputNode::has_geometry)
    }

    /// Total node count including this one.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(OutputNode::node_count).sum::<usize>()
    }

    /// Meshes in this subtree, depth first.
    pub fn meshes(&self) -> Vec<&OutputMesh> {
        let mut out = Vec::new();
        self.collect_meshes(&mut out);
        out
    }

    fn collect_meshes<'a>(&'a self, out: &mut Vec<&'a OutputMesh>) {
        if let Some(mesh) = &self.mesh {
            out.push(mesh);
        }
        for child in &self.children {
            child.collect_meshes(out);
        }
    }
}

/// Build the output tree for the given mode and prune empty scaffolding.
pub fn materialize(
    root_name: &str,
    mode: HierarchyMode,
    scene: &Scene,
    outputs: Vec<OutputMesh>,
) -> OutputNode {
    let mut root = match mode {
        HierarchyMode::Preserve => preserve(root_name, scene, outputs),
        HierarchyMode::Flatten => flatten(root_name, outputs),
        HierarchyMode::FlattenCombine => flatten_combine(root_name, outputs),
    };
    prune_empty(&mut root);
    root
}

fn flatten(root_name: &str, outputs: Vec<OutputMesh>) -> OutputNode {
    let mut root = OutputNode::group(root_name);
    for output in outputs {
        let transform = output.mesh.world_transform;
        root.children.push(OutputNode::leaf(output, transform));
    }
    root
}

fn flatten_combine(root_name: &str, outputs: Vec<OutputMesh>) -> OutputNode {
    let mut root = OutputNode::group(root_name);
    if outputs.is_empty() {
        return root;
    }
    let meshes: Vec<(ProcessedMesh, usize)> = outputs
        .into_iter()
        .map(|o| (o.mesh, o.material))
        .collect();
    let (combined, submeshes) = merge::combine_all(format!("{root_name}_combined"), meshes);
    let material = submeshes.first().map(|s| s.material).unwrap_or(0);
    root.children.push(OutputNode::leaf(
        OutputMesh {
            mesh: combined,
            material,
            submeshes,
        },
        Mat4::IDENTITY,
    ));
    root
}

fn preserve(root_name: &str, scene: &Scene, outputs: Vec<OutputMesh>) -> OutputNode {
    // Bucket leaves by their source parent; anything without a valid mapping
    // falls back to the new root.
    let mut by_parent: HashMap<usize, Vec<OutputMesh>> = HashMap::new();
    let mut at_root: Vec<OutputMesh> = Vec::new();
    for output in outputs {
        match output.mesh.source_parent {
            Some(parent) if parent < scene.nodes.len() => {
                by_parent.entry(parent).or_default().push(output);
            }
            _ => at_root.push(output),
        }
    }

    // Child lists of the source hierarchy; a node whose parent index is out
    // of range counts as a top-level node.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); scene.nodes.len()];
    let mut top_level = Vec::new();
    for (i, node) in scene.nodes.iter().enumerate() {
        match node.parent {
            Some(p) if p < scene.nodes.len() => children[p].push(i),
            _ => top_level.push(i),
        }
    }

    let mut root = OutputNode::group(root_name);
    for &index in &top_level {
        root.children.push(clone_subtree(
            scene,
            index,
            &children,
            &mut by_parent,
            Mat4::IDENTITY,
        ));
    }
    for output in at_root {
        let transform = output.mesh.world_transform;
        root.children.push(OutputNode::leaf(output, transform));
    }
    root
}

fn clone_subtree(
    scene: &Scene,
    index: usize,
    children: &[Vec<usize>],
    by_parent: &mut HashMap<usize, Vec<OutputMesh>>,
    parent_global: Mat4,
) -> OutputNode {
    let source = &scene.nodes[index];
    let mut node = OutputNode::group(source.name.as_str());
    node.translation = source.translation;
    node.rotation = source.rotation;
    node.scale = source.scale;

    let global = parent_global * source.local_transform();
    for &child in &children[index] {
        node.children
            .push(clone_subtree(scene, child, children, by_parent, global));
    }

    if let Some(outputs) = by_parent.remove(&index) {
        for output in outputs {
            // Leaf placement relative to the cloned parent keeps the mesh at
            // its original world position.
            let local = if global.determinant().abs() > f32::EPSILON {
                global.inverse() * output.mesh.world_transform
            } else {
                output.mesh.world_transform
            };
            node.children.push(OutputNode::leaf(output, local));
        }
    }

    node
}

/// Recursively drop every child that holds no mesh and has no surviving
/// children of its own. The root itself is the run's requested target and is
/// kept even when empty.
pub fn prune_empty(node: &mut OutputNode) {
    node.children.retain_mut(|child| {
        prune_empty(child);
        child.mesh.is_some() || !child.children.is_empty()
    });
}
