use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rootcause::prelude::*;

use unlitbake::bake::OffsetMode;
use unlitbake::output::HierarchyMode;
use unlitbake::pipeline::{Milestone, Pipeline, PipelineOptions, RunOutput};
use unlitbake::scene::Scene;
use unlitbake::texture::{LightmapImage, LightmapSet, PixelData, PrecisionTier};

/// Bake a lightmapped scene description into standalone unlit meshes.
///
/// The scene file is JSON: the extracted hierarchy nodes, mesh instances, and
/// a list of lightmap image files keyed by id.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scene description JSON file
    scene: PathBuf,

    /// Name of the output root node
    #[clap(short, long, default_value = "Baked")]
    root: String,

    /// Output precision tier for normalized lightmaps
    #[clap(long, value_enum, default_value_t = TierArg::Png)]
    tier: TierArg,

    /// Cap the longer side of each normalized lightmap to this many pixels
    #[clap(long)]
    size_cap: Option<u32>,

    /// Dither strength (adds deterministic noise to each lightmap)
    #[clap(long)]
    dither: Option<f32>,

    /// Vertex offset distance used to avoid z-fighting the source geometry
    #[clap(long, default_value_t = 0.001)]
    offset: f32,

    /// How the vertex offset is interpreted
    #[clap(long, value_enum, default_value_t = OffsetModeArg::Absolute)]
    offset_mode: OffsetModeArg,

    /// Recompute normals from topology before offsetting
    #[clap(long)]
    recompute_normals: bool,

    /// Keep instances separate instead of merging by material
    #[clap(long)]
    no_merge: bool,

    /// Output tree shape
    #[clap(long, value_enum, default_value_t = HierarchyArg::Flatten)]
    hierarchy: HierarchyArg,

    /// Write the output tree as JSON to this path
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// Write each normalized lightmap as a PNG into this directory
    #[clap(long)]
    dump_lightmaps: Option<PathBuf>,

    /// Print pipeline milestones as they pass
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierArg {
    Png,
    Half,
    Float,
}

impl From<TierArg> for PrecisionTier {
    fn from(value: TierArg) -> Self {
        match value {
            TierArg::Png => PrecisionTier::Png,
            TierArg::Half => PrecisionTier::Half,
            TierArg::Float => PrecisionTier::Float,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OffsetModeArg {
    Absolute,
    Relative,
}

impl From<OffsetModeArg> for OffsetMode {
    fn from(value: OffsetModeArg) -> Self {
        match value {
            OffsetModeArg::Absolute => OffsetMode::Absolute,
            OffsetModeArg::Relative => OffsetMode::RelativeToScale,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HierarchyArg {
    Preserve,
    Flatten,
    Combine,
}

impl From<HierarchyArg> for HierarchyMode {
    fn from(value: HierarchyArg) -> Self {
        match value {
            HierarchyArg::Preserve => HierarchyMode::Preserve,
            HierarchyArg::Flatten => HierarchyMode::Flatten,
            HierarchyArg::Combine => HierarchyMode::FlattenCombine,
        }
    }
}

/// On-disk scene description: the scene records plus lightmap file references.
#[derive(serde::Deserialize)]
struct SceneFile {
    #[serde(flatten)]
    scene: Scene,
    #[serde(default)]
    lightmaps: Vec<LightmapEntry>,
}

#[derive(serde::Deserialize)]
struct LightmapEntry {
    id: u32,
    path: PathBuf,
}

fn load_lightmap(entry: &LightmapEntry) -> Result<LightmapImage, Report> {
    let img = image::open(&entry.path)
        .context_with(|| format!("could not read lightmap image: {}", entry.path.display()))?;
    // 8-bit sources stay 8-bit; anything wider is carried as float so the
    // PNG-tier precision-upgrade rule can see it.
    let (width, height, pixels) = match img {
        img @ (image::DynamicImage::ImageLuma8(_)
        | image::DynamicImage::ImageLumaA8(_)
        | image::DynamicImage::ImageRgb8(_)
        | image::DynamicImage::ImageRgba8(_)) => {
            let buf = img.to_rgba8();
            (buf.width(), buf.height(), PixelData::Rgba8(buf.into_raw()))
        }
        other => {
            let buf = other.to_rgba32f();
            (buf.width(), buf.height(), PixelData::Rgba32F(buf.into_raw()))
        }
    };
    Ok(LightmapImage {
        id: entry.id,
        width,
        height,
        pixels,
    })
}

/// Flatten any pixel tier to 8-bit for a PNG dump.
fn dump_png(material_name: &str, image: &LightmapImage, dir: &PathBuf) -> Result<(), Report> {
    let rgba: Vec<u8> = match &image.pixels {
        PixelData::Rgba8(data) => data.clone(),
        PixelData::Rgba16F(data) => data
            .iter()
            .map(|v| (v.to_f32().clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
        PixelData::Rgba32F(data) => data
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
    };
    let buffer = image::RgbaImage::from_raw(image.width, image.height, rgba)
        .ok_or_else(|| rootcause::report!("lightmap {} has an inconsistent buffer", image.id))?;
    let path = dir.join(format!("{material_name}.png"));
    buffer
        .save(&path)
        .context_with(|| format!("could not write {}", path.display()))?;
    Ok(())
}

fn print_summary(output: &RunOutput) {
    let s = &output.summary;
    println!(
        "processed {} instance(s), skipped {} (no UVs: {}, no lightmap: {}, errors: {})",
        s.processed,
        s.skipped_no_uv + s.skipped_no_lightmap + s.skipped_errors,
        s.skipped_no_uv,
        s.skipped_no_lightmap,
        s.skipped_errors,
    );
    if s.merged_groups > 0 {
        println!(
            "merged {} mesh(es) across {} group(s)",
            s.merged_meshes, s.merged_groups
        );
    } else {
        println!("no groups qualified for merging");
    }
    let meshes = output.root.meshes();
    let triangles: usize = meshes.iter().map(|m| m.mesh.triangle_count()).sum();
    println!(
        "output: {} node(s), {} mesh(es), {} triangle(s), {} material(s)",
        output.root.node_count(),
        meshes.len(),
        triangles,
        output.materials.len()
    );
    for line in &output.diagnostics {
        eprintln!("  warning: {line}");
    }
}

fn main() -> Result<(), Report> {
    let args = Args::parse();

    let file = File::open(&args.scene)
        .context_with(|| format!("could not open scene file: {}", args.scene.display()))?;
    let scene_file: SceneFile =
        serde_json::from_reader(file).context("scene file is not valid JSON")?;

    let mut registry = LightmapSet::default();
    for entry in &scene_file.lightmaps {
        registry.push(load_lightmap(entry)?);
    }

    let options = PipelineOptions::builder()
        .root_name(args.root.clone())
        .tier(args.tier.into())
        .maybe_size_cap(args.size_cap)
        .maybe_dither(args.dither)
        .offset(args.offset)
        .offset_mode(args.offset_mode.into())
        .recompute_normals(args.recompute_normals)
        .merge(!args.no_merge)
        .hierarchy(args.hierarchy.into())
        .build();

    let verbose = args.verbose;
    let mut pipeline = Pipeline::new(&registry, options);
    let output = pipeline
        .run_with(
            &scene_file.scene,
            |milestone: Milestone| {
                if verbose {
                    eprintln!("[{milestone:?}]");
                }
            },
            || false,
        )
        .context("bake run failed")?;

    print_summary(&output);

    if let Some(dir) = &args.dump_lightmaps {
        std::fs::create_dir_all(dir)
            .context_with(|| format!("could not create {}", dir.display()))?;
        for material in &output.materials {
            dump_png(&material.name, &material.texture, dir)?;
        }
        println!(
            "wrote {} lightmap PNG(s) to {}",
            output.materials.len(),
            dir.display()
        );
    }

    if let Some(path) = &args.out {
        let writer = BufWriter::new(
            File::create(path)
                .context_with(|| format!("could not create {}", path.display()))?,
        );
        serde_json::to_writer_pretty(writer, &output).context("could not serialize output tree")?;
        println!("wrote output tree to {}", path.display());
    }

    Ok(())
}
