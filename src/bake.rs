//! Secondary-UV rebake and anti-z-fight vertex offsetting.
//!
//! Produces one [`ProcessedMesh`] per qualifying instance: the secondary UV
//! channel remapped into primary-UV space via the instance's lightmap
//! scale/offset, and every vertex pushed along its normal by a small
//! world-space distance so the output never z-fights the source geometry.

use glam::{Mat3, Mat4, Vec2, Vec3};
use rootcause::Report;
use thiserror::Error;

use crate::scene::{BlendMode, MeshInstance};

/// Largest vertex count addressable with 16-bit indices.
pub const NARROW_INDEX_LIMIT: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum BakeError {
    #[error("'{name}': secondary UV count {uvs} does not match vertex count {vertices}")]
    AttributeMismatch {
        name: String,
        uvs: usize,
        vertices: usize,
    },
    #[error("'{name}': index {index} out of range ({vertices} vertices)")]
    IndexOutOfRange {
        name: String,
        index: u32,
        vertices: usize,
    },
    #[error("'{name}': index count {len} is not a multiple of 3")]
    IndexCount { name: String, len: usize },
    #[error("'{name}': world transform is not invertible")]
    SingularTransform { name: String },
}

/// How the vertex-offset magnitude is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetMode {
    /// The configured value is a world-space distance.
    #[default]
    Absolute,
    /// The configured value is multiplied by the instance's largest scale
    /// factor, so heavily scaled instances get a proportionally larger gap.
    RelativeToScale,
}

/// Per-instance rebake parameters.
#[derive(Debug, Clone, Copy)]
pub struct RebakeOptions {
    /// Vertex-offset magnitude. Zero disables displacement.
    pub offset: f32,
    pub mode: OffsetMode,
    /// Recompute normals from topology before offsetting, for sources whose
    /// authored normals are unreliable (e.g. after non-uniform scaling).
    pub recompute_normals: bool,
}

impl Default for RebakeOptions {
    fn default() -> Self {
        Self {
            offset: 0.001,
            mode: OffsetMode::Absolute,
            recompute_normals: false,
        }
    }
}

/// Index storage width of an output mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum IndexWidth {
    U16,
    U32,
}

/// 32-bit iff the vertex count exceeds the narrow-index limit.
pub fn index_width_for(vertex_count: usize) -> IndexWidth {
    if vertex_count > NARROW_INDEX_LIMIT {
        IndexWidth::U32
    } else {
        IndexWidth::U16
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn from_points(points: &[Vec3]) -> Aabb {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for p in points {
            min = min.min(*p);
            max = max.max(*p);
        }
        if points.is_empty() {
            Aabb {
                min: Vec3::ZERO,
                max: Vec3::ZERO,
            }
        } else {
            Aabb { min, max }
        }
    }
}

/// A rebaked mesh ready for consolidation and output.
///
/// Positions are post-offset and still local; `world_transform` carries the
/// instance placement until consolidation bakes it in.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProcessedMesh {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    /// Primary UV channel, rebaked from the secondary channel.
    pub uv: Vec<Vec2>,
    pub indices: Vec<u32>,
    pub index_width: IndexWidth,
    pub bounds: Aabb,
    pub world_transform: Mat4,
    pub material_key: String,
    pub lightmap_id: u32,
    pub blend: BlendMode,
    /// Source-hierarchy parent, for preserve-mode attachment.
    pub source_parent: Option<usize>,
}

impl ProcessedMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Area-weighted vertex normals from a triangle list. Unreferenced or
/// degenerate vertices come back zero.
pub fn compute_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut acc = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        acc[a] += face;
        acc[b] += face;
        acc[c] += face;
    }
    acc.into_iter().map(|n| n.normalize_or_zero()).collect()
}

/// Inverse-transpose of the transform's linear part, for carrying normals
/// through non-uniform scales. Falls back to the plain linear part when the
/// transform is singular.
pub(crate) fn normal_matrix(world: &Mat4) -> Mat3 {
    let linear = Mat3::from_mat4(*world);
    if linear.determinant().abs() <= f32::EPSILON {
        linear
    } else {
        linear.inverse().transpose()
    }
}

/// Largest basis-vector length of the transform's linear part.
fn max_scale_factor(transform: &Mat4) -> f32 {
    let linear = Mat3::from_mat4(*transform);
    linear
        .x_axis
        .length()
        .max(linear.y_axis.length())
        .max(linear.z_axis.length())
}

/// Rebake one instance.
///
/// The caller is responsible for skipping instances with an empty secondary-UV
/// buffer or no assigned lightmap; by the time an instance reaches this
/// function both are guaranteed present.
pub fn rebake_instance(
    instance: &MeshInstance,
    lightmap_id: u32,
    options: &RebakeOptions,
) -> Result<ProcessedMesh, Report<BakeError>> {
    let vertices = instance.positions.len();
    if instance.secondary_uv.len() != vertices {
        return Err(Report::new(BakeError::AttributeMismatch {
            name: instance.name.clone(),
            uvs: instance.secondary_uv.len(),
            vertices,
        }));
    }
    if instance.indices.len() % 3 != 0 {
        return Err(Report::new(BakeError::IndexCount {
            name: instance.name.clone(),
            len: instance.indices.len(),
        }));
    }
    if let Some(&bad) = instance
        .indices
        .iter()
        .find(|&&i| i as usize >= vertices)
    {
        return Err(Report::new(BakeError::IndexOutOfRange {
            name: instance.name.clone(),
            index: bad,
            vertices,
        }));
    }

    // 1. Primary UV = affine remap of the secondary channel.
    let uv: Vec<Vec2> = instance
        .secondary_uv
        .iter()
        .map(|&t| instance.scale_offset.apply(t))
        .collect();

    // 2. Source normals, optionally recomputed. A missing or mismatched
    //    normal buffer always forces a recompute.
    let normals = if options.recompute_normals || instance.normals.len() != vertices {
        compute_normals(&instance.positions, &instance.indices)
    } else {
        instance.normals.clone()
    };

    // 3. Offset in world space so the displacement is a true world distance
    //    regardless of the instance's local scale.
    let mut positions = instance.positions.clone();
    if options.offset != 0.0 {
        let world = instance.world_transform;
        if world.determinant().abs() <= f32::EPSILON {
            return Err(Report::new(BakeError::SingularTransform {
                name: instance.name.clone(),
            }));
        }
        let inverse = world.inverse();
        let normal_matrix = normal_matrix(&world);
        let magnitude = match options.mode {
            OffsetMode::Absolute => options.offset,
            OffsetMode::RelativeToScale => options.offset * max_scale_factor(&world),
        };

        for (p, n) in positions.iter_mut().zip(normals.iter()) {
            let world_normal = (normal_matrix * *n).normalize_or_zero();
            if world_normal == Vec3::ZERO {
                continue;
            }
            let world_pos = world.transform_point3(*p) + world_normal * magnitude;
            *p = inverse.transform_point3(world_pos);
        }
    }

    // 4. Normals and bounds always reflect the displaced geometry.
    let normals = compute_normals(&positions, &instance.indices);
    let bounds = Aabb::from_points(&positions);
    let index_width = index_width_for(vertices);

    Ok(ProcessedMesh {
        name: instance.name.clone(),
        positions,
        normals,
        uv,
        indices: instance.indices.clone(),
        index_width,
        bounds,
        world_transform: instance.world_transform,
        material_key: instance.material_key.clone(),
        lightmap_id,
        blend: instance.blend,
        source_parent: instance.parent,
    })
}
