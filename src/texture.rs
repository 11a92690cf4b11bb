//! Lightmap readback normalization.
//!
//! Converts a source lightmap into a CPU-addressable RGBA buffer at a chosen
//! precision tier, optionally downsized so the longer side fits a cap, and
//! optionally dithered. Normalized results are cached per run keyed by
//! `(lightmap id, tier, cap)`; dithered requests bypass the cache.

use std::collections::HashMap;

use half::f16;
use image::Rgba32FImage;
use image::imageops::{self, FilterType};
use rootcause::Report;
use thiserror::Error;

use crate::Rc;

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("lightmap {id} is missing or unreadable")]
    ImageRead { id: u32 },
    #[error("lightmap {id} has no pixels ({width}x{height})")]
    EmptyImage { id: u32, width: u32, height: u32 },
    #[error("lightmap {id} pixel buffer holds {actual} values, expected {expected}")]
    BufferLength {
        id: u32,
        actual: usize,
        expected: usize,
    },
}

/// Storage precision of an RGBA pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8,
    Rgba16F,
    Rgba32F,
}

/// Requested output precision.
///
/// `Png` asks for 8-bit output but never narrows a half/float source: the
/// source precision wins to avoid a lossy readback. `Half` and `Float` always
/// produce their tier regardless of source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrecisionTier {
    #[default]
    Png,
    Half,
    Float,
}

/// Row-major RGBA pixel storage in one of the three precision tiers.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    Rgba8(Vec<u8>),
    Rgba16F(Vec<f16>),
    Rgba32F(Vec<f32>),
}

impl PixelData {
    pub fn format(&self) -> PixelFormat {
        match self {
            PixelData::Rgba8(_) => PixelFormat::Rgba8,
            PixelData::Rgba16F(_) => PixelFormat::Rgba16F,
            PixelData::Rgba32F(_) => PixelFormat::Rgba32F,
        }
    }

    /// Number of stored channel values (4 per pixel).
    pub fn len(&self) -> usize {
        match self {
            PixelData::Rgba8(d) => d.len(),
            PixelData::Rgba16F(d) => d.len(),
            PixelData::Rgba32F(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_f32(&self) -> Vec<f32> {
        match self {
            PixelData::Rgba8(d) => d.iter().map(|&v| v as f32 / 255.0).collect(),
            PixelData::Rgba16F(d) => d.iter().map(|v| v.to_f32()).collect(),
            PixelData::Rgba32F(d) => d.clone(),
        }
    }

    fn from_f32(format: PixelFormat, data: Vec<f32>) -> PixelData {
        match format {
            PixelFormat::Rgba8 => PixelData::Rgba8(
                data.iter()
                    .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                    .collect(),
            ),
            PixelFormat::Rgba16F => {
                PixelData::Rgba16F(data.iter().map(|&v| f16::from_f32(v)).collect())
            }
            PixelFormat::Rgba32F => PixelData::Rgba32F(data),
        }
    }
}

/// A baked lightmap as a CPU pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct LightmapImage {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: PixelData,
}

impl LightmapImage {
    pub fn format(&self) -> PixelFormat {
        self.pixels.format()
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Collaborator seam: resolves a lightmap id to its source image.
pub trait LightmapRegistry {
    /// Source image for `id`, or `None` when the id is out of range or the
    /// backing texture could not be read.
    fn lightmap(&self, id: u32) -> Option<&LightmapImage>;
}

/// Simple registry over an owned list of lightmaps.
#[derive(Debug, Default)]
pub struct LightmapSet {
    maps: Vec<LightmapImage>,
}

impl LightmapSet {
    pub fn new(maps: Vec<LightmapImage>) -> Self {
        Self { maps }
    }

    pub fn push(&mut self, map: LightmapImage) {
        self.maps.push(map);
    }
}

impl LightmapRegistry for LightmapSet {
    fn lightmap(&self, id: u32) -> Option<&LightmapImage> {
        self.maps.iter().find(|m| m.id == id)
    }
}

/// Output precision for a source format under a requested tier.
pub fn resolve_format(source: PixelFormat, tier: PrecisionTier) -> PixelFormat {
    match tier {
        // 8-bit unless the source already exceeds it.
        PrecisionTier::Png => match source {
            PixelFormat::Rgba8 => PixelFormat::Rgba8,
            higher => higher,
        },
        PrecisionTier::Half => PixelFormat::Rgba16F,
        PrecisionTier::Float => PixelFormat::Rgba32F,
    }
}

/// Clamp the longer side to `cap`, scaling the shorter side proportionally
/// (rounded to nearest, never below 1).
pub fn capped_dimensions(width: u32, height: u32, cap: u32) -> (u32, u32) {
    let long = width.max(height);
    if long <= cap {
        return (width, height);
    }
    let ratio = cap as f64 / long as f64;
    if width >= height {
        (cap, ((height as f64 * ratio).round() as u32).max(1))
    } else {
        (((width as f64 * ratio).round() as u32).max(1), cap)
    }
}

/// Normalize a source lightmap to the requested tier, resizing to the cap if
/// one is set. Pure function; callers wanting caching go through
/// [`TextureCache`].
pub fn normalize(
    source: &LightmapImage,
    tier: PrecisionTier,
    size_cap: Option<u32>,
) -> Result<LightmapImage, Report<TextureError>> {
    if source.width == 0 || source.height == 0 {
        return Err(Report::new(TextureError::EmptyImage {
            id: source.id,
            width: source.width,
            height: source.height,
        }));
    }
    if source.pixels.len() != source.expected_len() {
        return Err(Report::new(TextureError::BufferLength {
            id: source.id,
            actual: source.pixels.len(),
            expected: source.expected_len(),
        }));
    }

    let target_format = resolve_format(source.format(), tier);
    let (tw, th) = match size_cap {
        Some(cap) => capped_dimensions(source.width, source.height, cap),
        None => (source.width, source.height),
    };

    if (tw, th) == (source.width, source.height) && target_format == source.format() {
        return Ok(source.clone());
    }

    let mut working = source.pixels.to_f32();
    if (tw, th) != (source.width, source.height) {
        let img = Rgba32FImage::from_raw(source.width, source.height, working)
            .expect("pixel buffer length already validated");
        working = imageops::resize(&img, tw, th, FilterType::Triangle).into_raw();
    }

    Ok(LightmapImage {
        id: source.id,
        width: tw,
        height: th,
        pixels: PixelData::from_f32(target_format, working),
    })
}

/// Add symmetric noise in `[-strength/2, +strength/2]` to each RGB channel,
/// seeded from the image id so the same id always produces the same pattern.
/// Alpha is left untouched. 8-bit output clamps to `[0, 1]`; float tiers only
/// clamp below zero (baked lighting may exceed 1).
pub fn apply_dither(image: &mut LightmapImage, strength: f32) {
    let mut rng = SplitMix64::new(image.id as u64);
    let count = image.pixels.len();
    let mut working = image.pixels.to_f32();
    for px in working.chunks_exact_mut(4) {
        for channel in px.iter_mut().take(3) {
            *channel += (rng.next_f32() - 0.5) * strength;
        }
    }
    let format = image.format();
    if format != PixelFormat::Rgba8 {
        for v in working.iter_mut() {
            *v = v.max(0.0);
        }
    }
    image.pixels = PixelData::from_f32(format, working);
    debug_assert_eq!(image.pixels.len(), count);
}

/// splitmix64 mixer. Enough for dither noise, and keeps the pattern a pure
/// function of the lightmap id.
struct SplitMix64(u64);

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in [0, 1).
    fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

type CacheKey = (u32, PrecisionTier, Option<u32>);

/// Per-run cache of normalized lightmaps.
///
/// Write-once-per-key: repeated requests with identical parameters return the
/// same buffer without recomputation. Dithered requests never touch the cache.
#[derive(Default)]
pub struct TextureCache {
    entries: HashMap<CacheKey, Rc<LightmapImage>>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Normalized lightmap for `(id, tier, size_cap)`, from cache when
    /// already computed this run.
    pub fn normalized(
        &mut self,
        registry: &dyn LightmapRegistry,
        id: u32,
        tier: PrecisionTier,
        size_cap: Option<u32>,
    ) -> Result<Rc<LightmapImage>, Report<TextureError>> {
        let key = (id, tier, size_cap);
        if let Some(hit) = self.entries.get(&key) {
            tracing::debug!(id, "lightmap cache hit");
            return Ok(hit.clone());
        }
        let source = registry
            .lightmap(id)
            .ok_or_else(|| Report::new(TextureError::ImageRead { id }))?;
        let normalized = Rc::new(normalize(source, tier, size_cap)?);
        self.entries.insert(key, normalized.clone());
        Ok(normalized)
    }

    /// Normalize and dither, bypassing the cache entirely.
    pub fn normalized_dithered(
        &mut self,
        registry: &dyn LightmapRegistry,
        id: u32,
        tier: PrecisionTier,
        size_cap: Option<u32>,
        strength: f32,
    ) -> Result<Rc<LightmapImage>, Report<TextureError>> {
        let source = registry
            .lightmap(id)
            .ok_or_else(|| Report::new(TextureError::ImageRead { id }))?;
        let mut image = normalize(source, tier, size_cap)?;
        apply_dither(&mut image, strength);
        Ok(Rc::new(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgba8(id: u32, width: u32, height: u32, value: u8) -> LightmapImage {
        LightmapImage {
            id,
            width,
            height,
            pixels: PixelData::Rgba8(vec![value; (width * height * 4) as usize]),
        }
    }

    #[test]
    fn cap_clamps_longer_side() {
        assert_eq!(capped_dimensions(1024, 512, 256), (256, 128));
        assert_eq!(capped_dimensions(512, 1024, 256), (128, 256));
    }

    #[test]
    fn cap_rounds_shorter_side_to_nearest() {
        // 100x30 capped to 50: 30 * 0.5 = 15
        assert_eq!(capped_dimensions(100, 30, 50), (50, 15));
        // 1000x333 capped to 100: 333 * 0.1 = 33.3 -> 33
        assert_eq!(capped_dimensions(1000, 333, 100), (100, 33));
    }

    #[test]
    fn cap_is_noop_when_under() {
        assert_eq!(capped_dimensions(128, 64, 256), (128, 64));
    }

    #[test]
    fn cap_never_drops_below_one() {
        assert_eq!(capped_dimensions(4096, 2, 64), (64, 1));
    }

    #[test]
    fn png_tier_keeps_high_precision_source() {
        assert_eq!(
            resolve_format(PixelFormat::Rgba16F, PrecisionTier::Png),
            PixelFormat::Rgba16F
        );
        assert_eq!(
            resolve_format(PixelFormat::Rgba32F, PrecisionTier::Png),
            PixelFormat::Rgba32F
        );
        assert_eq!(
            resolve_format(PixelFormat::Rgba8, PrecisionTier::Png),
            PixelFormat::Rgba8
        );
    }

    #[test]
    fn float_tiers_override_source() {
        assert_eq!(
            resolve_format(PixelFormat::Rgba8, PrecisionTier::Half),
            PixelFormat::Rgba16F
        );
        assert_eq!(
            resolve_format(PixelFormat::Rgba32F, PrecisionTier::Half),
            PixelFormat::Rgba16F
        );
        assert_eq!(
            resolve_format(PixelFormat::Rgba8, PrecisionTier::Float),
            PixelFormat::Rgba32F
        );
    }

    #[test]
    fn normalize_resizes_and_keeps_constant_color() {
        let source = solid_rgba8(0, 64, 32, 128);
        let out = normalize(&source, PrecisionTier::Png, Some(16)).unwrap();
        assert_eq!((out.width, out.height), (16, 8));
        assert_eq!(out.format(), PixelFormat::Rgba8);
        // A constant image stays constant under a triangle filter.
        let PixelData::Rgba8(data) = &out.pixels else {
            panic!("expected 8-bit output");
        };
        assert!(data.iter().all(|&v| v == 128));
    }

    #[test]
    fn normalize_rejects_bad_buffer() {
        let source = LightmapImage {
            id: 7,
            width: 4,
            height: 4,
            pixels: PixelData::Rgba8(vec![0; 3]),
        };
        assert!(normalize(&source, PrecisionTier::Png, None).is_err());
    }

    #[test]
    fn cache_is_idempotent_and_bit_identical() {
        let registry = LightmapSet::new(vec![solid_rgba8(3, 32, 32, 200)]);
        let mut cache = TextureCache::new();
        let a = cache
            .normalized(&registry, 3, PrecisionTier::Png, Some(16))
            .unwrap();
        let b = cache
            .normalized(&registry, 3, PrecisionTier::Png, Some(16))
            .unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(*a, *b);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_lightmap_is_an_image_read_error() {
        let registry = LightmapSet::default();
        let mut cache = TextureCache::new();
        let err = cache
            .normalized(&registry, 9, PrecisionTier::Png, None)
            .unwrap_err();
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn dither_is_deterministic_per_id() {
        let mut a = solid_rgba8(5, 8, 8, 100);
        let mut b = solid_rgba8(5, 8, 8, 100);
        apply_dither(&mut a, 0.1);
        apply_dither(&mut b, 0.1);
        assert_eq!(a.pixels, b.pixels);

        let mut c = solid_rgba8(6, 8, 8, 100);
        apply_dither(&mut c, 0.1);
        assert_ne!(a.pixels, c.pixels);
    }

    #[test]
    fn dither_leaves_alpha_alone() {
        let mut img = solid_rgba8(1, 4, 4, 100);
        apply_dither(&mut img, 0.5);
        let PixelData::Rgba8(data) = &img.pixels else {
            panic!("expected 8-bit output");
        };
        assert!(data.chunks_exact(4).all(|px| px[3] == 100));
    }

    #[test]
    fn dithered_requests_bypass_the_cache() {
        let registry = LightmapSet::new(vec![solid_rgba8(2, 8, 8, 50)]);
        let mut cache = TextureCache::new();
        let noisy = cache
            .normalized_dithered(&registry, 2, PrecisionTier::Png, None, 0.2)
            .unwrap();
        assert!(cache.is_empty());
        let clean = cache
            .normalized(&registry, 2, PrecisionTier::Png, None)
            .unwrap();
        assert_ne!(noisy.pixels, clean.pixels);
    }
}
