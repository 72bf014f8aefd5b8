use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synthblend_core::catalog::AssetCatalog;
use synthblend_core::config::{BboxFormat, Config};
use synthblend_core::process::executor::CommandRunner;
use synthblend_core::sampler::{SamplerConfig, SceneSampler};
use synthblend_dataset::manifest::load_or_create;
use synthblend_dataset::shards::{compact, ShardLog};
use synthblend_dataset::Accumulator;
use synthblend_pipeline::augment::{discover_renders, AugmentJob};
use synthblend_pipeline::{
    AnnotationSink, Orchestrator, PipelineAugmenter, ProcessRenderer, RenderBatch, RenderContext,
};
use synthblend_worker::cli::{Cli, Stage};

/// Bound on entries queued for the accumulator.
const ACCUMULATOR_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // --- Tracing ---
    let json = cli.log_json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "synthblend_worker=info,synthblend_pipeline=info,\
                 synthblend_dataset=info,synthblend_core=info"
                    .into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    // --- Configuration ---
    let stage = cli.stage;
    let skip_augment = cli.no_augment;
    let continue_manifest = cli.start_index.is_none();
    let config = cli.into_config().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    let seed = config.seed.unwrap_or_else(rand::random);
    tracing::info!(
        work_dir = %config.work_dir.display(),
        seed,
        render_count = config.render_count,
        start_index = config.start_index,
        render_workers = config.render_workers,
        bbox_format = ?config.bbox_format,
        "Loaded configuration",
    );

    // --- Asset catalog ---
    let catalog = AssetCatalog::build(&config.models_path(), &config.backgrounds_path())
        .context("Failed to build asset catalog")?;
    tracing::info!(
        models = catalog.models().len(),
        backgrounds = catalog.backgrounds().len(),
        "Asset catalog ready",
    );

    // --- Cancellation ---
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl-C; cancelling outstanding jobs");
            ctrl_c_cancel.cancel();
        }
    });
    let orchestrator = Orchestrator::new(cancel);

    // --- Render ---
    let augment_jobs = match stage {
        Stage::All | Stage::Render => {
            let batch =
                render_stage(&config, catalog.clone(), seed, &orchestrator, continue_manifest)
                    .await?;
            println!("Render: {}", batch.summary);
            (stage == Stage::All).then(|| {
                batch
                    .rendered
                    .into_iter()
                    .map(|image| AugmentJob {
                        index: image.job_index,
                        image_path: image.image_path,
                    })
                    .collect::<Vec<_>>()
            })
        }
        Stage::Augment => Some(
            discover_renders(&config.renders_path())
                .with_context(|| format!("Failed to list {}", config.renders_path().display()))?,
        ),
    };

    // --- Augment ---
    if let Some(jobs) = augment_jobs {
        if skip_augment {
            tracing::info!("Augmentation disabled");
        } else if catalog.backgrounds().is_empty() {
            tracing::warn!("No background images found; skipping augmentation");
        } else {
            let augmenter = PipelineAugmenter::new(
                catalog.backgrounds().to_vec(),
                config.augment.clone(),
                seed,
            )?;
            let summary = orchestrator
                .run_augmentations(&augmenter, jobs, config.augment_workers)
                .await;
            println!("Augment: {summary}");
        }
    }

    Ok(())
}

/// Render this batch. With `continue_manifest`, a COCO batch starts after
/// the last image already in the manifest.
async fn render_stage(
    config: &Config,
    mut catalog: AssetCatalog,
    seed: u64,
    orchestrator: &Orchestrator,
    continue_manifest: bool,
) -> anyhow::Result<RenderBatch> {
    let renders_dir = config.renders_path();
    tokio::fs::create_dir_all(&renders_dir)
        .await
        .with_context(|| format!("Failed to create {}", renders_dir.display()))?;

    let runner = CommandRunner::resolve(&config.renderer).context("Renderer is not usable")?;
    let renderer = ProcessRenderer::new(runner, config.render_timeout)
        .with_working_directory(&config.work_dir);

    let mut jobs = config.job_indices();
    let mut accumulator_task = None;
    let sink = match config.bbox_format {
        BboxFormat::None => AnnotationSink::None,
        BboxFormat::Yolo => AnnotationSink::Yolo,
        BboxFormat::Coco => {
            let shards_dir = config.shards_path();
            let manifest = config.manifest_file();
            // Recover entries left behind by an interrupted run before accepting new ones.
            compact(&shards_dir, &manifest, catalog.categories())
                .await
                .context("Failed to compact shard log")?;

            // Category ids and image ids already in the manifest are fixed.
            let dataset = load_or_create(&manifest, catalog.categories())
                .await
                .context("Failed to read dataset manifest")?;
            catalog.assign_categories(&dataset.categories)?;
            if continue_manifest {
                let start = dataset.next_free_index();
                jobs = start..start.saturating_add(config.render_count);
            }
            tracing::info!(
                existing_images = dataset.images.len(),
                first_job = jobs.start,
                "Extending dataset manifest",
            );

            let (handle, task) =
                Accumulator::spawn(&manifest, dataset.categories.clone(), ACCUMULATOR_CAPACITY)
                    .await
                    .context("Failed to open dataset manifest")?;
            accumulator_task = Some(task);
            AnnotationSink::Coco {
                accumulator: handle,
                shards: ShardLog::open(shards_dir).await?,
                convention: config.coco_bbox,
                recorded: dataset.image_ids(),
            }
        }
    };

    let ctx = RenderContext {
        sampler: SceneSampler::new(SamplerConfig::from(config), seed),
        catalog,
        renders_dir,
        image_format: config.image_format,
        sink,
    };
    let batch = orchestrator
        .run_renders(
            &ctx,
            &renderer,
            jobs,
            config.render_workers,
            config.max_render_attempts,
        )
        .await;

    // Dropping the context closes the accumulator's channel.
    drop(ctx);
    if let Some(task) = accumulator_task {
        let report = task.await.context("Dataset accumulator panicked")?;
        tracing::info!(
            appended = report.appended,
            rejected = report.rejected,
            total_images = report.total_images,
            "Dataset manifest updated",
        );
    }

    Ok(batch)
}
