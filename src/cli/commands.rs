//! CLI command definitions for route-dispatch.
//!
//! One subcommand per process role. Broker topology, connection URLs and
//! retry settings come from the environment (see `DispatchConfig`); the
//! flags here only override per-process knobs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::admission::Admission;
use crate::api::{self, AppState};
use crate::broker::{AmqpBroker, Broker, MemoryBroker, MessageHandler, Publisher, QueueBinding};
use crate::config::DispatchConfig;
use crate::metrics::init_metrics;
use crate::pipeline::{
    ConsumerPool, ConsumerPoolConfig, InboundHandler, OutboundHandler,
};
use crate::polling::ResultPoller;
use crate::solver::CheapestArcSolver;
use crate::store::{MemoryResultStore, RedisResultStore, ResultStore};

/// Asynchronous route-optimization job dispatch.
#[derive(Parser)]
#[command(name = "route-dispatch")]
#[command(about = "Dispatch route-optimization jobs over durable queues")]
#[command(version)]
#[command(
    long_about = "route-dispatch accepts routing jobs over HTTP, solves them on worker processes fed by an AMQP queue, and caches the results in Redis for clients to poll.\n\nA deployment runs one `serve` process, any number of `solver` processes and at least one `cache-writer` process.\n\nExample usage:\n  route-dispatch serve --bind 0.0.0.0:8000\n  route-dispatch solver --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the HTTP front end (submission, polling, liveness, metrics).
    Serve(ServeArgs),

    /// Consume route requests, solve them and publish route results.
    Solver(WorkerArgs),

    /// Consume route results and write them to the result store.
    #[command(name = "cache-writer")]
    CacheWriter(WorkerArgs),

    /// Run every role in one process on the in-memory broker and store.
    ///
    /// Nothing survives a restart; intended for local runs and demos.
    Standalone(StandaloneArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP listener to.
    #[arg(short, long, env = "DISPATCH_HTTP_ADDR")]
    pub bind: Option<SocketAddr>,
}

#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Competing consume loops in this process.
    #[arg(short = 'w', long, env = "DISPATCH_WORKERS")]
    pub workers: Option<usize>,

    /// Unacknowledged deliveries each loop may hold.
    #[arg(short, long, env = "DISPATCH_PREFETCH")]
    pub prefetch: Option<u16>,
}

#[derive(Parser, Debug)]
pub struct StandaloneArgs {
    /// Address to bind the HTTP listener to.
    #[arg(short, long, env = "DISPATCH_HTTP_ADDR")]
    pub bind: Option<SocketAddr>,

    /// Consume loops per worker role.
    #[arg(short = 'w', long, env = "DISPATCH_WORKERS")]
    pub workers: Option<usize>,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = DispatchConfig::from_env()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics unavailable");
    }

    match cli.command {
        Commands::Serve(args) => run_serve(apply_serve_args(config, &args)?).await,
        Commands::Solver(args) => run_solver(apply_worker_args(config, &args)?).await,
        Commands::CacheWriter(args) => run_cache_writer(apply_worker_args(config, &args)?).await,
        Commands::Standalone(args) => run_standalone(apply_standalone_args(config, &args)?).await,
    }
}

fn apply_serve_args(mut config: DispatchConfig, args: &ServeArgs) -> anyhow::Result<DispatchConfig> {
    if let Some(bind) = args.bind {
        config = config.with_http_addr(bind);
    }
    config.validate()?;
    Ok(config)
}

fn apply_worker_args(
    mut config: DispatchConfig,
    args: &WorkerArgs,
) -> anyhow::Result<DispatchConfig> {
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(prefetch) = args.prefetch {
        config = config.with_prefetch(prefetch);
    }
    config.validate()?;
    Ok(config)
}

fn apply_standalone_args(
    mut config: DispatchConfig,
    args: &StandaloneArgs,
) -> anyhow::Result<DispatchConfig> {
    if let Some(bind) = args.bind {
        config = config.with_http_addr(bind);
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    config.validate()?;
    Ok(config)
}

async fn connect_store(config: &DispatchConfig) -> anyhow::Result<RedisResultStore> {
    let store = RedisResultStore::connect(&config.redis_url)
        .await?
        .with_key_prefix(config.result_key_prefix.clone())
        .with_ttl(config.result_ttl);
    Ok(store)
}

/// Builds the HTTP router and hands back the admission it submits through,
/// so shutdown can drain dispatches the router spawned.
fn front_end(
    config: &DispatchConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
) -> (axum::Router, Admission) {
    let admission = Admission::new(
        Arc::new(Publisher::new(broker)),
        config.inbound.clone(),
        config.retry.clone(),
    );
    let router = api::router(AppState::new(admission.clone(), ResultPoller::new(store)));
    (router, admission)
}

/// Lets admitted jobs reach the inbound queue, then closes the broker.
async fn stop_front_end(admission: &Admission, broker: &dyn Broker, timeout: Duration) {
    if !admission.drain(timeout).await {
        warn!(
            pending = admission.in_flight(),
            "Closing broker with dispatches still running"
        );
    }
    close_broker(broker).await;
}

fn solver_pool(config: &DispatchConfig, broker: Arc<dyn Broker>) -> ConsumerPool {
    let handler = InboundHandler::new(
        Arc::new(CheapestArcSolver::new()),
        Arc::new(Publisher::new(Arc::clone(&broker))),
        config.outbound.clone(),
        config.retry.clone(),
    );
    pool(config, broker, config.inbound.clone(), Arc::new(handler))
}

fn cache_writer_pool(
    config: &DispatchConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
) -> ConsumerPool {
    let handler = OutboundHandler::new(store, config.retry.clone());
    pool(config, broker, config.outbound.clone(), Arc::new(handler))
}

fn pool(
    config: &DispatchConfig,
    broker: Arc<dyn Broker>,
    binding: QueueBinding,
    handler: Arc<dyn MessageHandler>,
) -> ConsumerPool {
    let pool_config = ConsumerPoolConfig::new(config.workers)
        .with_prefetch(config.prefetch)
        .with_shutdown_timeout(config.shutdown_timeout);
    ConsumerPool::new(pool_config, broker, binding, handler)
}

async fn run_serve(config: DispatchConfig) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.amqp_url.clone()));
    let store: Arc<dyn ResultStore> = Arc::new(connect_store(&config).await?);

    let (router, admission) = front_end(&config, Arc::clone(&broker), store);
    let served = api::serve(config.http_addr, router, shutdown_signal()).await;

    stop_front_end(&admission, broker.as_ref(), config.shutdown_timeout).await;
    served?;
    Ok(())
}

async fn run_solver(config: DispatchConfig) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.amqp_url.clone()));
    let pool = solver_pool(&config, Arc::clone(&broker));
    run_pool(pool, broker).await
}

async fn run_cache_writer(config: DispatchConfig) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.amqp_url.clone()));
    let store: Arc<dyn ResultStore> = Arc::new(connect_store(&config).await?);
    let pool = cache_writer_pool(&config, Arc::clone(&broker), store);
    run_pool(pool, broker).await
}

/// Runs `pool` until a shutdown signal arrives or every loop stops on its own.
async fn run_pool(mut pool: ConsumerPool, broker: Arc<dyn Broker>) -> anyhow::Result<()> {
    pool.start()?;

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = pool.wait() => warn!("All consume loops stopped"),
    }

    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Consumer pool did not stop cleanly");
    }
    log_stats(&pool);

    close_broker(broker.as_ref()).await;
    Ok(())
}

async fn run_standalone(config: DispatchConfig) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new());

    // Declared up front so no early message lands on an unbound exchange.
    broker.declare(&config.inbound).await?;
    broker.declare(&config.outbound).await?;

    let mut solvers = solver_pool(&config, Arc::clone(&broker));
    let mut writers = cache_writer_pool(&config, Arc::clone(&broker), Arc::clone(&store));
    solvers.start()?;
    writers.start()?;

    info!("Running standalone; results are kept in memory only");
    let (router, admission) = front_end(&config, Arc::clone(&broker), store);
    let served = api::serve(config.http_addr, router, shutdown_signal()).await;
    if !admission.drain(config.shutdown_timeout).await {
        warn!(
            pending = admission.in_flight(),
            "Stopping pools with dispatches still running"
        );
    }

    for pool in [&mut solvers, &mut writers] {
        if let Err(e) = pool.shutdown().await {
            warn!(error = %e, "Consumer pool did not stop cleanly");
        }
        log_stats(pool);
    }
    close_broker(broker.as_ref()).await;

    served?;
    Ok(())
}

fn log_stats(pool: &ConsumerPool) {
    let stats = pool.stats();
    info!(
        handled = stats.total_handled(),
        acked = stats.acked,
        requeued = stats.requeued,
        discarded = stats.discarded,
        unacked = stats.unacked,
        "Consumer pool stopped"
    );
}

async fn close_broker(broker: &dyn Broker) {
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Broker connection did not close cleanly");
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command_with_bind() {
        let cli = Cli::try_parse_from(["route-dispatch", "serve", "--bind", "127.0.0.1:9000"])
            .expect("should parse");

        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.bind, Some("127.0.0.1:9000".parse().expect("addr")));
            }
            _ => panic!("Expected Serve command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cache_writer_command_with_options() {
        let cli = Cli::try_parse_from([
            "route-dispatch",
            "cache-writer",
            "-w",
            "3",
            "--prefetch",
            "5",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        match cli.command {
            Commands::CacheWriter(args) => {
                assert_eq!(args.workers, Some(3));
                assert_eq!(args.prefetch, Some(5));
            }
            _ => panic!("Expected CacheWriter command"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_solver_command_rejects_bad_prefetch() {
        let result = Cli::try_parse_from(["route-dispatch", "solver", "--prefetch", "lots"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_command_fails() {
        assert!(Cli::try_parse_from(["route-dispatch", "migrate"]).is_err());
    }

    #[test]
    fn test_worker_args_override_config() {
        let args = WorkerArgs {
            workers: Some(4),
            prefetch: Some(2),
        };
        let config = apply_worker_args(DispatchConfig::default(), &args).expect("valid");
        assert_eq!(config.workers, 4);
        assert_eq!(config.prefetch, 2);
    }

    #[test]
    fn test_zero_prefetch_override_is_rejected() {
        let args = WorkerArgs {
            workers: None,
            prefetch: Some(0),
        };
        assert!(apply_worker_args(DispatchConfig::default(), &args).is_err());
    }

    #[test]
    fn test_pool_uses_config_sizes() {
        let config = DispatchConfig::default().with_workers(3);
        let pool = solver_pool(&config, Arc::new(MemoryBroker::new()));
        assert_eq!(pool.num_consumers(), 3);
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_stop_front_end_enqueues_admitted_jobs_before_close() {
        let config = DispatchConfig::default();
        let memory = MemoryBroker::new();
        let broker: Arc<dyn Broker> = Arc::new(memory.clone());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new());
        let (_router, admission) = front_end(&config, Arc::clone(&broker), store);

        let locations: Vec<serde_json::Value> = (0..4)
            .map(|i| serde_json::json!({"id": i, "lat": i as f64, "lon": 0.0}))
            .collect();
        admission
            .submit(serde_json::json!({"locations": locations, "vehicle_count": 1, "depot": 0}))
            .expect("submit");

        stop_front_end(&admission, broker.as_ref(), Duration::from_secs(5)).await;

        assert_eq!(admission.in_flight(), 0);
        assert_eq!(memory.ready_len(&config.inbound.queue), 1);
    }
}
