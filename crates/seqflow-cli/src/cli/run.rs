//! `seqflow run`: load configuration, build the stage registry and drive the
//! requested stages through the configured backend.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use seqflow_core::backend::{Backend, ClusterBackend, ClusterPlacement, LocalBackend, QueueBackend};
use seqflow_core::checkpoint::CheckpointManager;
use seqflow_core::resources::{ResourceAllocator, resolve_engine_count};
use seqflow_core::runner::{AllocationMode, PipelineRunner, RunReport};
use seqflow_core::stage::StageRegistry;
use seqflow_infra::broker::InProcessBroker;
use seqflow_infra::checkpoint::FileCheckpointStore;
use seqflow_infra::config::{discover_samples, load_run_description, load_system_config};
use seqflow_infra::engines::InProcessLauncher;
use seqflow_infra::grid::GridSlots;
use seqflow_infra::host::HostResources;
use seqflow_infra::tools::ExternalTools;
use seqflow_types::config::{BackendKind, ClusterConfig, RunDescription, SchedulerFamily, SystemConfig};
use seqflow_types::record::DataRecord;

use super::RunArgs;
use crate::stage::CommandStage;

/// Everything a backend-specific run needs besides the backend itself.
struct RunContext {
    config: SystemConfig,
    registry: StageRegistry,
    stages: Vec<String>,
    samples: Vec<DataRecord>,
    host: HostResources,
    total_cores: u32,
}

pub async fn run(args: RunArgs, cancel: CancellationToken) -> Result<RunReport> {
    let mut config = load_system_config(&args.config)
        .await
        .with_context(|| format!("loading system config {}", args.config.display()))?;
    apply_overrides(&mut config, &args);

    let run = match &args.run {
        Some(path) => load_run_description(path)
            .await
            .with_context(|| format!("loading run description {}", path.display()))?,
        None => RunDescription::default(),
    };

    let mut samples = run.samples.clone();
    if let Some(dir) = &args.input_dir {
        let found = discover_samples(dir)
            .await
            .with_context(|| format!("discovering samples in {}", dir.display()))?;
        samples.extend(found);
    }
    if samples.is_empty() {
        bail!("no samples: pass --input-dir or list [[samples]] in the run description");
    }

    let registry = build_registry(&run)?;
    let stages = if args.stages.is_empty() {
        run.stages.iter().map(|s| s.name.clone()).collect()
    } else {
        args.stages.clone()
    };
    if stages.is_empty() {
        bail!("no stages to run: define [[stages]] in the run description");
    }
    for name in &stages {
        registry.resolve(name)?;
    }

    let host = HostResources::detect();
    let total_cores = host.cores_or(config.backend.cores);
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;

    tracing::info!(
        backend = %config.backend.kind,
        samples = samples.len(),
        stages = stages.len(),
        cores = total_cores,
        work_dir = %config.work_dir.display(),
        "starting run"
    );

    let ctx = RunContext {
        config,
        registry,
        stages,
        samples,
        host,
        total_cores,
    };
    match ctx.config.backend.kind {
        BackendKind::Local => run_local(ctx, cancel).await,
        BackendKind::Queue => run_queue(ctx, cancel).await,
        BackendKind::Cluster => run_cluster(ctx, cancel).await,
    }
}

fn apply_overrides(config: &mut SystemConfig, args: &RunArgs) {
    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }
    if let Some(cores) = args.cores {
        config.backend.cores = Some(cores);
    }
    let cluster_flags = args.scheduler.is_some() || args.queue.is_some() || args.num_jobs.is_some();
    if !cluster_flags {
        return;
    }
    let cluster = config.backend.cluster.get_or_insert_with(|| ClusterConfig {
        scheduler: args.scheduler.unwrap_or(SchedulerFamily::Sge),
        queue: String::new(),
        num_jobs: Default::default(),
        stage_cores: Default::default(),
        extra: Vec::new(),
    });
    if let Some(scheduler) = args.scheduler {
        cluster.scheduler = scheduler;
    }
    if let Some(queue) = &args.queue {
        cluster.queue = queue.clone();
    }
    if let Some(num_jobs) = args.num_jobs {
        cluster.num_jobs = num_jobs;
    }
}

fn build_registry(run: &RunDescription) -> Result<StageRegistry> {
    let mut registry = StageRegistry::new();
    for definition in &run.stages {
        registry.register(CommandStage::new(definition)?)?;
    }
    Ok(registry)
}

async fn drive<B: Backend>(ctx: RunContext, backend: B, mode: AllocationMode) -> Result<RunReport> {
    let store = FileCheckpointStore::new(&ctx.config.work_dir, backend.kind());
    let mut runner = PipelineRunner::new(
        backend,
        CheckpointManager::new(store),
        ctx.registry,
        ResourceAllocator::new(ctx.config.resources.clone()),
        mode,
        Arc::new(ExternalTools::default()),
        ctx.config.split.clone(),
        ctx.config.work_dir.clone(),
    );
    Ok(runner.run(&ctx.stages, ctx.samples).await?)
}

async fn run_local(ctx: RunContext, cancel: CancellationToken) -> Result<RunReport> {
    let mode = AllocationMode::SharedCores {
        total_cores: ctx.total_cores,
        free_memory: ctx.host.free_memory,
    };
    drive(ctx, LocalBackend::new(cancel), mode).await
}

async fn run_queue(ctx: RunContext, cancel: CancellationToken) -> Result<RunReport> {
    let (concurrency, poll_interval) = match &ctx.config.backend.broker {
        Some(broker) => {
            tracing::info!(
                host = broker.host.as_str(),
                port = broker.port,
                user = broker.user.as_str(),
                vhost = broker.vhost.as_str(),
                authenticated = broker.password.as_ref().is_some_and(|p| !p.expose_secret().is_empty()),
                run_config = ?broker.run_config,
                "broker settings"
            );
            (broker.concurrency, broker.poll_interval())
        }
        None => (ctx.total_cores as usize, std::time::Duration::from_secs(1)),
    };

    let broker = Arc::new(InProcessBroker::start(ctx.registry.clone(), concurrency, &cancel));
    let backend = QueueBackend::new(Arc::clone(&broker), poll_interval, ctx.config.retry, cancel);
    // Workers run on this machine, so the host's free memory applies.
    let mode = AllocationMode::SharedCores {
        total_cores: ctx.total_cores,
        free_memory: ctx.host.free_memory,
    };
    let result = drive(ctx, backend, mode).await;
    broker.shutdown().await;
    result
}

async fn run_cluster(ctx: RunContext, cancel: CancellationToken) -> Result<RunReport> {
    let cluster = ctx
        .config
        .backend
        .cluster
        .clone()
        .context("the cluster backend needs a [backend.cluster] section or --scheduler/--queue")?;
    let engines = resolve_engine_count(
        cluster.num_jobs,
        &GridSlots,
        cluster.scheduler,
        &cluster.queue,
        &ctx.samples,
    )
    .await;

    let backend = ClusterBackend::new(
        InProcessLauncher::new(),
        ClusterPlacement {
            scheduler: cluster.scheduler,
            queue: cluster.queue.clone(),
            extra: cluster.extra.clone(),
        },
        ctx.config.retry,
        cancel,
    );
    let mode = AllocationMode::Engines {
        engines,
        stage_cores: cluster.stage_cores,
    };
    drive(ctx, backend, mode).await
}
