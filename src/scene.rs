//! Collaborator-supplied scene records.
//!
//! The pipeline does not traverse any engine scene graph itself. An external
//! extraction step hands it one [`MeshInstance`] per visible renderer plus the
//! shape of the source hierarchy as flat [`SourceNode`] tables, the same way
//! node tables arrive from a parsed visual prototype (names, local transforms,
//! parent indices).

use glam::{Mat4, Quat, Vec2, Vec3};

/// Per-instance lightmap atlas placement: `primary = secondary * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScaleOffset {
    pub sx: f32,
    pub sy: f32,
    pub ox: f32,
    pub oy: f32,
}

impl ScaleOffset {
    /// Identity placement (instance occupies the whole lightmap).
    pub const IDENTITY: ScaleOffset = ScaleOffset {
        sx: 1.0,
        sy: 1.0,
        ox: 0.0,
        oy: 0.0,
    };

    /// Map a secondary-UV coordinate into primary-UV space.
    ///
    /// Exact affine remap; no clamping or wrapping.
    pub fn apply(&self, uv: Vec2) -> Vec2 {
        Vec2::new(uv.x * self.sx + self.ox, uv.y * self.sy + self.oy)
    }
}

impl Default for ScaleOffset {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Blend behavior of the renderer's original material, as classified by the
/// extraction step. Only used to pick the output material kind; the original
/// material itself is never reproduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlendMode {
    #[default]
    Opaque,
    Cutout,
    Blend,
}

/// One visible mesh instance, extracted from the source scene.
///
/// Immutable once handed to the pipeline. An instance with an empty
/// `secondary_uv` buffer is skipped (counted, not an error); an instance with
/// `lightmap_id == None` likewise.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeshInstance {
    pub name: String,
    /// Vertex positions in instance-local space.
    pub positions: Vec<Vec3>,
    /// Vertex normals; recomputed from topology when absent or mismatched.
    #[cfg_attr(feature = "serde", serde(default))]
    pub normals: Vec<Vec3>,
    /// Secondary (lightmap) UV channel. Empty ⇒ instance is skipped.
    #[cfg_attr(feature = "serde", serde(default))]
    pub secondary_uv: Vec<Vec2>,
    /// Triangle list indices into the vertex buffers.
    pub indices: Vec<u32>,
    /// Local-to-world affine transform.
    pub world_transform: Mat4,
    /// Assigned baked lightmap, or `None` for unlit instances.
    pub lightmap_id: Option<u32>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scale_offset: ScaleOffset,
    /// Opaque merge-bucket key. Instances sharing a key share one material
    /// and one lightmap by construction.
    pub material_key: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub blend: BlendMode,
    /// Index of the owning node in [`Scene::nodes`], for hierarchy
    /// preservation. `None` ⇒ attached at the output root.
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent: Option<usize>,
}

/// One node of the source hierarchy: name plus local TRS, linked by parent
/// index. Carries no geometry, only the shape cloned in preserve mode.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceNode {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub translation: Vec3,
    #[cfg_attr(feature = "serde", serde(default))]
    pub rotation: Quat,
    #[cfg_attr(feature = "serde", serde(default = "unit_scale"))]
    pub scale: Vec3,
    pub parent: Option<usize>,
}

#[cfg(feature = "serde")]
fn unit_scale() -> Vec3 {
    Vec3::ONE
}

impl SourceNode {
    /// Local transform composed from the stored TRS.
    pub fn local_transform(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// The full extracted scene: hierarchy shape + mesh instances.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Scene {
    #[cfg_attr(feature = "serde", serde(default))]
    pub nodes: Vec<SourceNode>,
    pub instances: Vec<MeshInstance>,
}

impl Scene {
    /// World transform of a source node, walking the parent chain. A
    /// malformed cycle terminates once every node has been visited.
    pub fn node_world_transform(&self, index: usize) -> Mat4 {
        let mut chain = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            let Some(node) = self.nodes.get(i) else { break };
            chain.push(node.local_transform());
            cursor = node.parent;
            if chain.len() > self.nodes.len() {
                break;
            }
        }
        chain.iter().rev().fold(Mat4::IDENTITY, |acc, m| acc * *m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_offset_remap() {
        let so = ScaleOffset {
            sx: 0.25,
            sy: 0.25,
            ox: 0.1,
            oy: 0.2,
        };
        let uv = so.apply(Vec2::new(0.5, 0.5));
        assert!((uv.x - 0.225).abs() < 1e-6);
        assert!((uv.y - 0.325).abs() < 1e-6);
    }

    #[test]
    fn scale_offset_does_not_clamp() {
        let so = ScaleOffset {
            sx: 2.0,
            sy: 2.0,
            ox: 0.5,
            oy: -0.5,
        };
        let uv = so.apply(Vec2::new(1.0, 1.0));
        assert_eq!(uv, Vec2::new(2.5, 1.5));
    }

    #[test]
    fn node_world_transform_walks_parents() {
        let scene = Scene {
            nodes: vec![
                SourceNode {
                    name: "root".into(),
                    translation: Vec3::new(1.0, 0.0, 0.0),
                    rotation: Quat::IDENTITY,
                    scale: Vec3::ONE,
                    parent: None,
                },
                SourceNode {
                    name: "child".into(),
                    translation: Vec3::new(0.0, 2.0, 0.0),
                    rotation: Quat::IDENTITY,
                    scale: Vec3::ONE,
                    parent: Some(0),
                },
            ],
            instances: Vec::new(),
        };
        let world = scene.node_world_transform(1);
        let p = world.transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::new(1.0, 2.0, 0.0));
    }
}
