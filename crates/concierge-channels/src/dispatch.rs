//! Dispatch queue: hands inbound message ids to supervised worker tasks
//!
//! Producers call [`DispatchQueue::submit`]; a single [`Dispatcher`] drains
//! the queue, runs each message on its own task under a concurrency limit
//! and waits for in-flight work when shut down. Duplicate submissions are
//! harmless because processing starts with the store's atomic claim.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use concierge_core::orchestrator::Orchestrator;
use concierge_core::types::ProcessResult;

/// Something that can run one stored message through the agents
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message_id: &str) -> ProcessResult;
}

#[async_trait]
impl MessageProcessor for Orchestrator {
    async fn process(&self, message_id: &str) -> ProcessResult {
        self.process_message_id(message_id).await
    }
}

/// Producer handle, cheap to clone
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<String>,
}

impl DispatchQueue {
    /// Queue a message id. Waits while the queue is full.
    pub async fn submit(&self, message_id: impl Into<String>) -> Result<()> {
        self.tx
            .send(message_id.into())
            .await
            .map_err(|_| anyhow!("Dispatch queue is closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Counters reported when the dispatcher stops
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: usize,
    pub succeeded: usize,
    pub panicked: usize,
}

pub struct Dispatcher {
    processor: Arc<dyn MessageProcessor>,
    rx: mpsc::Receiver<String>,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    /// Create a dispatcher and its queue
    pub fn new(
        processor: Arc<dyn MessageProcessor>,
        queue_size: usize,
        max_concurrent: usize,
    ) -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        info!(
            "Created dispatch queue (size {}, max concurrent {})",
            queue_size.max(1),
            max_concurrent.max(1)
        );
        let dispatcher = Self {
            processor,
            rx,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        };
        (dispatcher, DispatchQueue { tx })
    }

    /// Run until cancelled or until every queue handle is dropped, then
    /// wait for in-flight messages to finish.
    pub async fn run(mut self, cancel: CancellationToken) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut join_set: JoinSet<(String, bool)> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Dispatcher shutting down");
                    break;
                }
                next = self.rx.recv() => {
                    let Some(message_id) = next else {
                        info!("Dispatch queue closed");
                        break;
                    };
                    let permit = tokio::select! {
                        permit = self.semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => {
                            info!("Dispatcher shutting down, dropping message {}", message_id);
                            break;
                        }
                    };
                    debug!("Dispatching message {}", message_id);
                    let processor = self.processor.clone();
                    join_set.spawn(async move {
                        let _permit = permit;
                        let result = processor.process(&message_id).await;
                        (message_id, result.success)
                    });
                }
                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    record(&mut stats, joined);
                }
            }
        }

        // Drain remaining tasks for graceful shutdown
        while let Some(joined) = join_set.join_next().await {
            record(&mut stats, joined);
        }
        info!(
            "Dispatcher stopped: {} handled, {} succeeded",
            stats.handled, stats.succeeded
        );
        stats
    }
}

fn record(stats: &mut DispatchStats, joined: Result<(String, bool), tokio::task::JoinError>) {
    match joined {
        Ok((message_id, success)) => {
            stats.handled += 1;
            if success {
                stats.succeeded += 1;
            }
            debug!("Message {} finished (success: {})", message_id, success);
        }
        Err(e) => {
            stats.panicked += 1;
            error!("Dispatch task failed: {}", e);
        }
    }
}
