//! Application context shared by all route handlers via Axum state.

use std::sync::Arc;
use std::time::Instant;

use tc_av::{FfmpegRunner, ToolRegistry, TranscodeRunner};
use tc_core::config::Config;
use tc_core::events::EventBus;
use tc_jobs::{JobCoordinator, JobDescriptorBuilder, LocalMediaStore, MediaStore, SlotPool};

/// Everything a handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub builder: Arc<JobDescriptorBuilder>,
    pub coordinator: JobCoordinator,
    pub event_bus: Arc<EventBus>,
    pub tools: Arc<ToolRegistry>,
    pub started_at: Instant,
}

impl AppContext {
    /// Production context: ffmpeg from `tools`, local filesystem store.
    pub fn new(config: Config, tools: ToolRegistry) -> tc_core::Result<Self> {
        let runner = Arc::new(FfmpegRunner::from_registry(&tools, &config)?);
        tracing::info!("Using ffmpeg at {}", runner.program().display());
        Self::with_runner(config, tools, runner)
    }

    /// Context with a caller-supplied runner and the local store.
    pub fn with_runner(
        config: Config,
        tools: ToolRegistry,
        runner: Arc<dyn TranscodeRunner>,
    ) -> tc_core::Result<Self> {
        let store = Arc::new(
            LocalMediaStore::new(&config.storage)?
                .with_buffer_budget(config.jobs.buffer_budget_bytes),
        );
        Ok(Self::assemble(config, tools, runner, store))
    }

    pub fn assemble(
        config: Config,
        tools: ToolRegistry,
        runner: Arc<dyn TranscodeRunner>,
        store: Arc<dyn MediaStore>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let pool = SlotPool::new(config.jobs.max_concurrent_jobs);
        let coordinator =
            JobCoordinator::new(runner, store, pool, &config.jobs, event_bus.clone());

        Self {
            builder: Arc::new(JobDescriptorBuilder::new(&config)),
            config: Arc::new(config),
            coordinator,
            event_bus,
            tools: Arc::new(tools),
            started_at: Instant::now(),
        }
    }
}
