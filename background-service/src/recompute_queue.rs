use memefeed_core::{CoreError, ErrorExt, ErrorRecovery, RecoveryResult, UserId};
use preference_engine::{PreferenceAggregator, PreferenceSink, ReactionHook, ReactionSource};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counters reported by the worker when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecomputeStats {
    pub processed: usize,
    pub coalesced: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Shared {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<RecomputeStats>>>,
}

/// Asynchronous recomputation trigger.
///
/// Reaction writes enqueue the user id; a single worker task drains the queue
/// and rebuilds each user's preference vector. Every enqueued id is
/// recomputed at least once after it was enqueued, so the stored vector
/// always catches up with the latest committed reactions. Clones share the
/// same queue and worker.
#[derive(Clone)]
pub struct RecomputeQueue {
    sender: mpsc::Sender<UserId>,
    shared: Arc<Shared>,
}

impl RecomputeQueue {
    /// Spawns the worker on the current runtime.
    pub fn start<S>(aggregator: Arc<PreferenceAggregator<S>>, capacity: usize) -> Self
    where
        S: ReactionSource + PreferenceSink + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = tokio::spawn(run_worker(aggregator, receiver, shutdown_rx));
        info!("Recompute queue started (capacity {})", capacity.max(1));

        Self {
            sender,
            shared: Arc::new(Shared {
                shutdown: Mutex::new(Some(shutdown_tx)),
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    pub async fn enqueue(&self, user: UserId) -> Result<(), CoreError> {
        self.sender
            .send(user)
            .await
            .map_err(|_| CoreError::Internal {
                message: "recompute queue is stopped".to_string(),
            })
    }

    /// Stops accepting work, finishes everything already queued and returns
    /// the worker's counters. Later calls return `None`.
    pub async fn stop(&self) -> Result<Option<RecomputeStats>, CoreError> {
        let shutdown = self
            .shared
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(shutdown) = shutdown {
            // The worker may already have exited if every sender was dropped.
            let _ = shutdown.send(());
        }

        match worker {
            Some(worker) => {
                let stats = worker.await.map_err(|e| CoreError::Internal {
                    message: format!("recompute worker panicked: {}", e),
                })?;
                info!("Recompute queue stopped: {:?}", stats);
                Ok(Some(stats))
            }
            None => Ok(None),
        }
    }
}

impl ReactionHook for RecomputeQueue {
    async fn on_reactions_changed(&self, user: UserId) -> Result<(), CoreError> {
        self.enqueue(user).await
    }
}

async fn run_worker<S>(
    aggregator: Arc<PreferenceAggregator<S>>,
    mut receiver: mpsc::Receiver<UserId>,
    mut shutdown: oneshot::Receiver<()>,
) -> RecomputeStats
where
    S: ReactionSource + PreferenceSink,
{
    let mut stats = RecomputeStats::default();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = receiver.recv() => match next {
                Some(user) => {
                    let mut batch = vec![user];
                    while let Ok(user) = receiver.try_recv() {
                        batch.push(user);
                    }
                    process_batch(&aggregator, batch, &mut stats).await;
                }
                None => break,
            },
        }
    }

    receiver.close();
    let mut remaining = Vec::new();
    while let Ok(user) = receiver.try_recv() {
        remaining.push(user);
    }
    if !remaining.is_empty() {
        debug!("Draining {} queued recomputations", remaining.len());
        process_batch(&aggregator, remaining, &mut stats).await;
    }

    stats
}

async fn process_batch<S>(
    aggregator: &PreferenceAggregator<S>,
    batch: Vec<UserId>,
    stats: &mut RecomputeStats,
) where
    S: ReactionSource + PreferenceSink,
{
    let total = batch.len();
    let mut seen = HashSet::with_capacity(total);
    let users: Vec<UserId> = batch.into_iter().filter(|user| seen.insert(*user)).collect();
    stats.coalesced += total - users.len();

    for user in users {
        match recompute_with_recovery(aggregator, user).await {
            RecoveryResult::Recovered(_) => stats.processed += 1,
            RecoveryResult::Skipped => {
                warn!("Skipped preference recomputation for user {}", user);
                stats.skipped += 1;
            }
            RecoveryResult::Failed(e) => {
                e.log_error();
                error!("Preference recomputation for user {} failed", user);
                stats.failed += 1;
            }
        }
    }
}

async fn recompute_with_recovery<S>(
    aggregator: &PreferenceAggregator<S>,
    user: UserId,
) -> RecoveryResult<()>
where
    S: ReactionSource + PreferenceSink,
{
    match aggregator.recompute(user).await {
        Ok(_) => RecoveryResult::Recovered(()),
        Err(e) => {
            e.log_warn();
            let strategy = ErrorRecovery::determine_strategy(&e);
            debug!("Recovering recomputation of user {} with {:?}", user, strategy);
            ErrorRecovery::apply_strategy(strategy, || async {
                aggregator.recompute(user).await.map(|_| ())
            })
            .await
        }
    }
}
