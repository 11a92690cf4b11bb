/// Secondary-UV rebake and anti-z-fight vertex offsetting
pub mod bake;
/// Bucketing and concatenation of processed meshes by shared material
pub mod merge;
/// Output tree assembly: hierarchy preservation, flattening, pruning
pub mod output;
/// Run orchestration: per-run context, caches, counts, milestones
pub mod pipeline;
/// Collaborator-supplied input records (mesh instances, source hierarchy)
pub mod scene;
/// Lightmap normalization: precision tiers, size capping, dither
pub mod texture;

#[cfg(feature = "arc")]
pub type Rc<T> = std::sync::Arc<T>;

#[cfg(not(feature = "arc"))]
pub type Rc<T> = std::rc::Rc<T>;
