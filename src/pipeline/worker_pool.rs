//! Pool of competing consume loops on one queue.
//!
//! Each loop holds its own subscription and prefetch window, so a pool of N
//! behaves like N independent consumer processes against the same durable
//! queue.
//!
//! # Features
//!
//! - Configurable number of consume loops
//! - Graceful shutdown with broadcast channel
//! - Per-outcome delivery statistics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{
    Broker, Delivery, HandlerOutcome, MessageHandler, QueueBinding, QueueConsumer,
};
use crate::metrics::MetricsCollector;

/// Errors that can occur in the consumer pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the consumer pool.
#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    /// Number of consume loops to spawn.
    pub num_consumers: usize,
    /// Prefetch window of each loop.
    pub prefetch: u16,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerPoolConfig {
    fn default() -> Self {
        Self {
            num_consumers: 1,
            prefetch: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerPoolConfig {
    /// Creates a new configuration with the specified number of loops.
    pub fn new(num_consumers: usize) -> Self {
        Self {
            num_consumers,
            ..Default::default()
        }
    }

    /// Sets the prefetch window.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the consumer pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of consume loops in the pool.
    pub num_consumers: usize,
    /// Loops still running.
    pub running_consumers: usize,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub unacked: u64,
}

impl PoolStats {
    /// Returns the total number of deliveries handled.
    pub fn total_handled(&self) -> u64 {
        self.acked + self.requeued + self.discarded + self.unacked
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    unacked: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            unacked: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: HandlerOutcome) {
        let counter = match outcome {
            HandlerOutcome::Acked => &self.acked,
            HandlerOutcome::Requeued => &self.requeued,
            HandlerOutcome::Discarded => &self.discarded,
            HandlerOutcome::Unacked => &self.unacked,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_consumers: usize, running_consumers: usize) -> PoolStats {
        PoolStats {
            num_consumers,
            running_consumers,
            acked: self.acked.load(Ordering::SeqCst),
            requeued: self.requeued.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
            unacked: self.unacked.load(Ordering::SeqCst),
        }
    }
}

/// Wraps the pool's handler to count outcomes as they happen.
struct CountingHandler {
    inner: Arc<dyn MessageHandler>,
    stats: Arc<SharedPoolStats>,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, delivery: Delivery) -> HandlerOutcome {
        let outcome = self.inner.handle(delivery).await;
        self.stats.record(outcome);
        outcome
    }
}

/// Runs N competing consume loops for one binding and handler.
pub struct ConsumerPool {
    config: ConsumerPoolConfig,
    broker: Arc<dyn Broker>,
    binding: QueueBinding,
    handler: Arc<dyn MessageHandler>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    running_tx: Arc<watch::Sender<usize>>,
    is_running: AtomicBool,
}

impl ConsumerPool {
    pub fn new(
        config: ConsumerPoolConfig,
        broker: Arc<dyn Broker>,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        // Only one shutdown signal is ever sent.
        let (shutdown_tx, _) = broadcast::channel(1);
        let (running_tx, _) = watch::channel(0usize);

        Self {
            config,
            broker,
            binding,
            handler,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            running_tx: Arc::new(running_tx),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all consume loops.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let handler: Arc<dyn MessageHandler> = Arc::new(CountingHandler {
            inner: Arc::clone(&self.handler),
            stats: Arc::clone(&self.stats),
        });
        let metrics = MetricsCollector::new();

        for i in 0..self.config.num_consumers {
            let consumer = QueueConsumer::new(Arc::clone(&self.broker), self.config.prefetch);
            let binding = self.binding.clone();
            let handler = Arc::clone(&handler);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let running = Arc::clone(&self.running_tx);
            let consumer_id = format!("consumer-{}", i);

            // Counted before spawning so `wait` never sees a spurious zero.
            running.send_modify(|n| *n += 1);
            metrics.update_consumers(*running.borrow());

            let handle = tokio::spawn(async move {
                info!(consumer_id = %consumer_id, queue = %binding.queue, "Consume loop started");
                match consumer.consume(&binding, handler, shutdown_rx).await {
                    Ok(summary) => info!(
                        consumer_id = %consumer_id,
                        handled = summary.total(),
                        "Consume loop stopped"
                    ),
                    Err(e) => error!(
                        consumer_id = %consumer_id,
                        error = %e,
                        "Consume loop failed"
                    ),
                }
                running.send_modify(|n| *n = n.saturating_sub(1));
                metrics.update_consumers(*running.borrow());
            });

            self.handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_consumers = self.config.num_consumers,
            queue = %self.binding.queue,
            "Consumer pool started"
        );

        Ok(())
    }

    /// Resolves once every consume loop has stopped on its own (broker
    /// closed or failed). Returns immediately if none are running.
    pub async fn wait(&self) {
        let mut rx = self.running_tx.subscribe();
        let _ = rx.wait_for(|running| *running == 0).await;
    }

    /// Gracefully shuts down all consume loops.
    ///
    /// Each loop finishes the delivery it is handling, then cancels its
    /// subscription.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if loops don't stop within the
    /// configured timeout; those loops are aborted.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue = %self.binding.queue, "Initiating consumer pool shutdown");

        // Loops that already stopped have dropped their receivers.
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Consume loop panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!(queue = %self.binding.queue, "Consumer pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(queue = %self.binding.queue, "Consumer pool shutdown timed out, aborting loops");
                for abort in aborts {
                    abort.abort();
                }
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .to_pool_stats(self.config.num_consumers, *self.running_tx.borrow())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_consumers(&self) -> usize {
        self.config.num_consumers
    }
}
