use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use kb_agent::config::{self, KbaConfig};
use kb_agent::controller::{AgentController, StartOutcome};
use kb_agent::error::KbaError;
use kb_agent::event_bus::EventBus;
use kb_agent::item_store::{self, ItemStoreHandle};
use kb_agent::lock;
use kb_agent::model_router::{BackendCapabilities, BackendEntry, CliModelBackend, MockModelBackend, ModelBackend, ModelRouter};
use kb_agent::pipeline_engine::{NoOpContentFetcher, NoOpGitSyncer, NoOpReadmeGenerator, PipelineDeps};
use kb_agent::retry_manager::RetryManager;
use kb_agent::scheduler::Scheduler;
use kb_agent::stats_store::StatsStore;
use kb_agent::task_runtime::{self, TaskRuntimeHandle};
use kb_agent::types::{ScheduleDefinition, ScheduleFrequency};

#[derive(Parser)]
#[command(name = "kb-agent", about = "Knowledge-base construction pipeline agent")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/kba.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and a default kba.toml
    Init,
    /// Start, stop, or inspect the pipeline run
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Inspect TaskRuntime jobs
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Inspect or edit ItemRecords
    Items {
        #[command(subcommand)]
        action: ItemAction,
    },
    /// CRUD on recurring ScheduleDefinitions
    Schedules {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Health probes for configured backends and storage
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },
    /// Run the schedule-evaluation loop until SIGINT/SIGTERM
    Serve,
}

#[derive(Subcommand)]
enum AgentAction {
    /// Begin a run
    Start {
        /// Block until the run finishes
        #[arg(long)]
        wait: bool,
    },
    /// Request cooperative cancellation
    Stop {
        #[arg(long)]
        task_id: Option<Uuid>,
    },
    /// Current AgentState
    Status,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Active jobs
    Active,
    /// Completed/failed/cancelled jobs within the retention window
    History,
    /// A single job by id
    Get { task_id: Uuid },
    /// Aggregate counts
    Stats,
}

#[derive(Subcommand)]
enum ItemAction {
    /// A single item by id
    Get { item_id: String },
    /// Every item currently known to the store
    List,
}

#[derive(Subcommand)]
enum ScheduleAction {
    List,
    Get { name: String },
    /// Create or replace a schedule
    Set {
        name: String,
        #[arg(long, value_enum)]
        frequency: FrequencyArg,
        #[arg(long)]
        cron_expr: Option<String>,
        #[arg(long, default_value_t = true)]
        enabled: bool,
    },
    Remove { name: String },
    /// Recorded attempts for a schedule
    History { name: String },
}

#[derive(Clone, clap::ValueEnum)]
enum FrequencyArg {
    Manual,
    Daily,
    Weekly,
    Monthly,
    CustomCron,
}

impl From<FrequencyArg> for ScheduleFrequency {
    fn from(value: FrequencyArg) -> Self {
        match value {
            FrequencyArg::Manual => ScheduleFrequency::Manual,
            FrequencyArg::Daily => ScheduleFrequency::Daily,
            FrequencyArg::Weekly => ScheduleFrequency::Weekly,
            FrequencyArg::Monthly => ScheduleFrequency::Monthly,
            FrequencyArg::CustomCron => ScheduleFrequency::CustomCron,
        }
    }
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Probe that every configured backend resolves and storage is writable
    TestComponents,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = cli.root.clone();
    let config_path = cli.config.clone();

    let result = run(cli, &root, config_path.as_deref()).await;
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    if let Commands::Init = &cli.command {
        return handle_init(root);
    }

    let cfg = config::load_config_from(config_path, root).map_err(|e| e.to_string())?;

    // Only commands that can start or drive a run need the single-instance
    // guard; read-only inspection commands may run alongside a `serve`
    // without contending over the lock file.
    let _guard = match &cli.command {
        Commands::Agent { action: AgentAction::Start { .. } } | Commands::Serve => {
            Some(lock::try_acquire(&root.join(&cfg.project.data_dir))?)
        }
        _ => None,
    };

    let services = Services::bootstrap(root, &cfg).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Agent { action } => handle_agent(&services, action).await,
        Commands::Tasks { action } => handle_tasks(&services, action).await,
        Commands::Items { action } => handle_items(&services, action).await,
        Commands::Schedules { action } => handle_schedules(&services, action).await,
        Commands::Pipeline { action } => handle_pipeline(&services, action).await,
        Commands::Serve => handle_serve(services, &cfg).await,
    }
}

/// Block serving schedule ticks until the process receives SIGINT or
/// SIGTERM. `signal_hook::flag::register` toggles a shared `AtomicBool`,
/// polled here on a short interval; once set, the run-scoped
/// `CancellationToken` is cancelled and the scheduler task is awaited to
/// completion before returning.
async fn handle_serve(services: Services, cfg: &KbaConfig) -> Result<(), String> {
    let scheduler = Scheduler::load(services.controller.clone(), services.scheduler_path.clone()).map_err(|e| e.to_string())?;

    let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone()).map_err(|e| e.to_string())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone()).map_err(|e| e.to_string())?;

    let cancel = tokio_util::sync::CancellationToken::new();
    let poll_interval = std::time::Duration::from_secs(cfg.runtime.schedule_poll_interval_seconds.max(1));
    let scheduler_task = tokio::spawn(scheduler.run(poll_interval, cancel.clone()));

    let mut watch = tokio::time::interval(std::time::Duration::from_millis(250));
    while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
        watch.tick().await;
    }

    println!("shutting down");
    cancel.cancel();
    let _ = scheduler_task.await;
    Ok(())
}

/// Everything a command needs, constructed once per invocation and handed
/// to every handler, rather than threading a long argument list through
/// each `handle_*` function.
struct Services {
    item_store: ItemStoreHandle,
    task_runtime: TaskRuntimeHandle,
    controller: AgentController,
    scheduler_path: PathBuf,
}

impl Services {
    fn bootstrap(root: &Path, cfg: &KbaConfig) -> Result<Self, KbaError> {
        let data_dir = root.join(&cfg.project.data_dir);
        std::fs::create_dir_all(&data_dir).map_err(|e| KbaError::Storage(e.to_string()))?;

        let items_path = root.join(&cfg.storage.items_path);
        let stats_path = root.join(&cfg.storage.stats_path);
        let schedule_path = data_dir.join("schedules.json");

        let (item_store, _item_store_jh) = item_store::spawn_item_store(items_path)?;
        let stats = StatsStore::load(stats_path)?;
        let (task_runtime, _task_runtime_jh) = task_runtime::spawn_task_runtime();

        let mut model_router = ModelRouter::default();
        let mut backend: Option<Arc<dyn ModelBackend>> = None;
        for (phase_name, backend_cfg) in &cfg.backends {
            model_router.register_phase(
                phase_name,
                BackendEntry {
                    name: backend_cfg.backend_name.clone(),
                    model: backend_cfg.model.clone(),
                    capabilities: BackendCapabilities {
                        supports_streaming: backend_cfg.supports_streaming,
                        supports_vision: backend_cfg.supports_vision,
                        embedding_dimensions: backend_cfg.embedding_dimensions,
                    },
                },
                Default::default(),
            );
            if backend.is_none() {
                backend = Some(Arc::new(CliModelBackend::new(
                    backend_cfg.binary_name.clone(),
                    backend_cfg.extra_args.clone(),
                    data_dir.join("backend-results"),
                )));
            }
        }
        let backend = backend.unwrap_or_else(|| Arc::new(MockModelBackend::new(Vec::new())) as Arc<dyn ModelBackend>);

        let event_bus = EventBus::new();
        let deps = PipelineDeps {
            item_store: item_store.clone(),
            stats: Arc::new(stats),
            task_runtime: task_runtime.clone(),
            retry_manager: RetryManager::new(cfg.retry.clone()),
            model_router: Arc::new(model_router),
            backend,
            event_bus,
            content_fetcher: Arc::new(NoOpContentFetcher),
            readme_generator: Arc::new(NoOpReadmeGenerator),
            git_syncer: Arc::new(NoOpGitSyncer),
            runtime_config: cfg.runtime.clone(),
            kb_root: data_dir,
        };

        let controller = AgentController::new(deps, cfg.runtime.start_fails_fast_when_running);

        Ok(Services { item_store, task_runtime, controller, scheduler_path: schedule_path })
    }
}

fn handle_init(root: &Path) -> Result<(), String> {
    std::fs::create_dir_all(root.join("data")).map_err(|e| e.to_string())?;
    let config_path = root.join("kba.toml");
    if !config_path.exists() {
        let default_toml = toml::to_string_pretty(&KbaConfig::default()).map_err(|e| e.to_string())?;
        std::fs::write(&config_path, default_toml).map_err(|e| e.to_string())?;
    }
    println!("Initialized knowledge-base agent project at {}", root.display());
    Ok(())
}

async fn handle_agent(services: &Services, action: AgentAction) -> Result<(), String> {
    match action {
        AgentAction::Start { wait } => {
            let outcome = services.controller.start().await.map_err(|e| e.to_string())?;
            match outcome {
                StartOutcome::Started(task_id) => {
                    println!("started task {task_id}");
                    if wait {
                        services.controller.wait(std::time::Duration::from_secs(3600)).await;
                        println!("run {task_id} finished");
                    }
                }
                StartOutcome::AlreadyRunning(task_id) => {
                    println!("already running (task {task_id})");
                }
            }
        }
        AgentAction::Stop { task_id } => {
            let stopped = services.controller.stop(task_id).await;
            println!("{}", if stopped { "stop requested" } else { "no active run" });
        }
        AgentAction::Status => {
            let status = services.controller.status().await;
            println!("{}", serde_json::to_string_pretty(&status).unwrap());
        }
    }
    Ok(())
}

async fn handle_tasks(services: &Services, action: TaskAction) -> Result<(), String> {
    match action {
        TaskAction::Active => {
            let tasks = services.task_runtime.list_active().await;
            println!("{}", serde_json::to_string_pretty(&tasks).unwrap());
        }
        TaskAction::History => {
            let tasks = services.task_runtime.list_history().await;
            println!("{}", serde_json::to_string_pretty(&tasks).unwrap());
        }
        TaskAction::Get { task_id } => match services.task_runtime.status(task_id).await {
            Some(state) => println!("{}", serde_json::to_string_pretty(&state).unwrap()),
            None => return Err(format!("no such task: {task_id}")),
        },
        TaskAction::Stats => {
            let stats = services.task_runtime.statistics().await;
            println!("{}", serde_json::to_string_pretty(&stats).unwrap());
        }
    }
    Ok(())
}

async fn handle_items(services: &Services, action: ItemAction) -> Result<(), String> {
    match action {
        ItemAction::Get { item_id } => {
            let item = services.item_store.get(&item_id).await.map_err(|e| e.to_string())?;
            match item {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record).unwrap()),
                None => return Err(format!("no such item: {item_id}")),
            }
        }
        ItemAction::List => {
            let items = services.item_store.list_all().await.map_err(|e| e.to_string())?;
            println!("{}", serde_json::to_string_pretty(&items).unwrap());
        }
    }
    Ok(())
}

async fn handle_schedules(services: &Services, action: ScheduleAction) -> Result<(), String> {
    let mut scheduler =
        Scheduler::load(services.controller.clone(), services.scheduler_path.clone()).map_err(|e| e.to_string())?;

    match action {
        ScheduleAction::List => {
            println!("{}", serde_json::to_string_pretty(&scheduler.list()).unwrap());
        }
        ScheduleAction::Get { name } => match scheduler.get(&name) {
            Some(def) => println!("{}", serde_json::to_string_pretty(&def).unwrap()),
            None => return Err(format!("no such schedule: {name}")),
        },
        ScheduleAction::Set { name, frequency, cron_expr, enabled } => {
            let definition = ScheduleDefinition {
                name: name.clone(),
                frequency: frequency.into(),
                cron_expr,
                enabled,
                pipeline_config: serde_json::Value::Null,
                last_run_at: None,
                next_run_at: None,
            };
            scheduler.upsert(definition).map_err(|e| e.to_string())?;
            println!("saved schedule {name}");
        }
        ScheduleAction::Remove { name } => {
            let removed = scheduler.remove(&name).map_err(|e| e.to_string())?;
            println!("{}", if removed { "removed" } else { "no such schedule" });
        }
        ScheduleAction::History { name } => {
            println!("{}", serde_json::to_string_pretty(&scheduler.history(&name)).unwrap());
        }
    }
    Ok(())
}

async fn handle_pipeline(services: &Services, action: PipelineAction) -> Result<(), String> {
    match action {
        PipelineAction::TestComponents => {
            let mut report = serde_json::Map::new();
            let items = services.item_store.list_all().await;
            report.insert("item_store".to_string(), serde_json::json!(items.is_ok()));
            let stats = services.task_runtime.statistics().await;
            report.insert("task_runtime".to_string(), serde_json::json!(true));
            report.insert("active_jobs".to_string(), serde_json::json!(stats.active_count));
            println!("{}", serde_json::to_string_pretty(&report).unwrap());
        }
    }
    Ok(())
}
