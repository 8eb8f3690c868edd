use std::net::SocketAddr;
use std::sync::Arc;

use agent_jobs::{
    agents::ReplyAgent,
    config::Config,
    db::{self, CancellationSubscriber, JobStore, MemoryJobStore, PgJobStore},
    queue::{
        BatchConsumer, BatchPoller, JobProcessor, JobQueue, JobService, MemoryQueue,
        QueueOptions, RedisQueue, Worker, WorkerOptions,
    },
    routes::create_router,
    AppState,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "agent-jobs", about = "Cancellable background jobs for AI agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Consume the job queue
    Worker {
        /// Process a single batch with the batch consumer, then exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Apply database migrations and exit
    Migrate,
    /// API and worker in one process with in-memory store and queue
    Dev,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_jobs=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config.server);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Worker { once } => worker(config, once).await,
        Command::Migrate => migrate(config).await,
        Command::Dev => dev(config).await,
    }
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<PgJobStore>> {
    let pool = db::create_pool(&config.database).await?;
    Ok(Arc::new(PgJobStore::new(pool)))
}

async fn connect_queue(config: &Config) -> anyhow::Result<Arc<RedisQueue>> {
    let queue = RedisQueue::connect(
        &config.queue.url,
        &config.queue.name,
        QueueOptions::from(&config.queue),
    )
    .await?;
    Ok(Arc::new(queue))
}

fn processor(config: &Config, store: Arc<dyn JobStore>) -> JobProcessor {
    let executor = Arc::new(ReplyAgent::new(&config.llm));
    JobProcessor::new(store, executor)
        .with_abort_grace(config.worker.abort_grace())
        .with_job_timeout(config.worker.job_timeout())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        trigger.cancel();
    });
    token
}

async fn serve_http(
    config: &Config,
    jobs: Arc<JobService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = AppState {
        jobs,
        config: config.clone(),
    };
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    db::pool::run_migrations(store.pool()).await?;
    let queue = connect_queue(&config).await?;

    let jobs = Arc::new(JobService::new(store, queue));
    serve_http(&config, jobs, shutdown_on_ctrl_c()).await
}

async fn worker(config: Config, once: bool) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let queue = connect_queue(&config).await?;
    let processor = processor(&config, store.clone());

    if once || config.worker.use_batch_consumer {
        let poller = BatchPoller::new(
            queue,
            BatchConsumer::new(processor, config.queue.max_receive_count),
            config.worker.batch_size,
            config.queue.wait_time(),
        );

        if once {
            let summary = poller.poll_once().await?;
            info!(received = summary.received, failed = summary.failed, "Batch processed");
        } else {
            poller.run(shutdown_on_ctrl_c()).await;
        }
        return Ok(());
    }

    let worker = Worker::new(
        queue,
        processor,
        store,
        WorkerOptions {
            wait_time: config.queue.wait_time(),
            ..WorkerOptions::default()
        },
    );
    worker.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}

async fn migrate(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database).await?;
    info!("Running database migrations...");
    db::pool::run_migrations(&pool).await?;
    info!("Database migrations completed");
    Ok(())
}

async fn dev(config: Config) -> anyhow::Result<()> {
    info!("Starting in dev mode with in-memory store and queue");

    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueue::new(QueueOptions::from(&config.queue)));
    let shutdown = shutdown_on_ctrl_c();

    let worker = Worker::new(
        queue.clone() as Arc<dyn JobQueue>,
        processor(&config, store.clone()),
        store.clone() as Arc<dyn CancellationSubscriber>,
        WorkerOptions::default(),
    );
    let worker_shutdown = shutdown.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });

    let jobs = Arc::new(JobService::new(store, queue));
    serve_http(&config, jobs, shutdown.clone()).await?;

    shutdown.cancel();
    worker_task.await??;
    Ok(())
}
