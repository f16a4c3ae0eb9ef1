//! Database controller
//!
//! Feeds watcher notifications to reconciliation workers. Work is keyed by
//! intent: each key has a FIFO queue and at most one running reconciliation,
//! while distinct keys run in parallel up to the worker limit. All
//! bookkeeping is owned by the dispatcher loop; workers only report back
//! over a channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::cluster::ClusterApi;
use crate::controllers::Context;
use crate::crd::Database;
use crate::metrics;
use crate::reconcilers::database::{self as database_reconciler, IntentPhase, ReconcileReport};
use crate::watcher::{ChangeKind, IntentEvent, IntentKey, IntentWatcher};

/// Dispatcher tuning
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Maximum reconciliations running at once
    pub workers: usize,
    /// Backoff for retrying degraded intents
    pub retry: Backoff,
    /// How long in-flight work may run after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            retry: Backoff::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Run the Database controller until `shutdown` is cancelled
pub async fn run(
    cluster: Arc<dyn ClusterApi>,
    context: Arc<Context>,
    config: DispatcherConfig,
    watch_backoff: Backoff,
    shutdown: CancellationToken,
) {
    info!(workers = config.workers, "Starting Database controller");

    let events = IntentWatcher::new(cluster, watch_backoff).into_stream();
    Dispatcher::new(context, config).run(events, shutdown).await;

    info!("Database controller stopped");
}

struct Work {
    event: IntentEvent,
    epoch: u64,
}

struct Completion {
    report: ReconcileReport,
    epoch: u64,
    elapsed: Duration,
}

struct IntentState {
    phase: IntentPhase,
    /// Bumped on every watcher event; retries from older epochs are stale
    epoch: u64,
    attempts: u32,
    latest: Database,
    queue: VecDeque<Work>,
    running: bool,
}

impl IntentState {
    fn new(latest: Database) -> Self {
        Self {
            phase: IntentPhase::Pending,
            epoch: 0,
            attempts: 0,
            latest,
            queue: VecDeque::new(),
            running: false,
        }
    }
}

/// Per-intent serialising work queue in front of a bounded worker pool
pub struct Dispatcher {
    context: Arc<Context>,
    config: DispatcherConfig,
    intents: HashMap<IntentKey, IntentState>,
    /// Keys with queued work and no running reconciliation
    ready: VecDeque<IntentKey>,
    running: usize,
    tasks: JoinSet<()>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    retry_tx: mpsc::UnboundedSender<(IntentKey, u64)>,
    retry_rx: mpsc::UnboundedReceiver<(IntentKey, u64)>,
}

impl Dispatcher {
    pub fn new(context: Arc<Context>, config: DispatcherConfig) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            context,
            config,
            intents: HashMap::new(),
            ready: VecDeque::new(),
            running: 0,
            tasks: JoinSet::new(),
            done_tx,
            done_rx,
            retry_tx,
            retry_rx,
        }
    }

    /// Consume `events` until the stream ends or `shutdown` is cancelled,
    /// then drain in-flight work within the grace period.
    pub async fn run<S>(mut self, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = IntentEvent> + Send,
    {
        self.event_loop(events, &shutdown).await;
        self.drain().await;
    }

    async fn event_loop<S>(&mut self, events: S, shutdown: &CancellationToken)
    where
        S: Stream<Item = IntentEvent>,
    {
        let mut events = Box::pin(events.fuse());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting events");
                    break;
                }
                Some(done) = self.done_rx.recv() => self.on_complete(done, shutdown),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Reconciliation task failed");
                    }
                }
                Some((key, epoch)) = self.retry_rx.recv() => self.on_retry(key, epoch),
                event = events.next() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        warn!("Event stream ended");
                        break;
                    }
                },
            }
            self.dispatch(shutdown);
        }
    }

    fn on_event(&mut self, event: IntentEvent) {
        let key = event.key();
        debug!(intent = %key, change = %event.change, "Queueing event");

        let state = self
            .intents
            .entry(key.clone())
            .or_insert_with(|| IntentState::new(event.intent.clone()));
        state.epoch += 1;
        // Status writes echo back as Modified with an unchanged generation;
        // only a new generation restarts the backoff schedule.
        if event.change == ChangeKind::Deleted
            || generation_changed(&state.latest, &event.intent)
        {
            state.attempts = 0;
        }
        state.latest = event.intent.clone();
        if !state.running {
            state.phase = IntentPhase::Pending;
        }

        let was_idle = !state.running && state.queue.is_empty();
        state.queue.push_back(Work {
            event,
            epoch: state.epoch,
        });
        if was_idle {
            self.ready.push_back(key);
        }
    }

    fn on_retry(&mut self, key: IntentKey, epoch: u64) {
        let Some(state) = self.intents.get_mut(&key) else {
            return;
        };
        if state.epoch != epoch || state.phase != IntentPhase::Degraded {
            debug!(intent = %key, "Dropping superseded retry");
            return;
        }

        debug!(intent = %key, attempt = state.attempts, "Retrying degraded Database");
        let was_idle = !state.running && state.queue.is_empty();
        state.queue.push_back(Work {
            event: IntentEvent::new(ChangeKind::Modified, state.latest.clone()),
            epoch,
        });
        if was_idle {
            self.ready.push_back(key);
        }
    }

    fn on_complete(&mut self, done: Completion, shutdown: &CancellationToken) {
        self.running -= 1;
        metrics::IN_FLIGHT.dec();

        let report = done.report;
        let phase = report.phase.as_str();
        metrics::RECONCILIATIONS.with_label_values(&[phase]).inc();
        metrics::RECONCILE_DURATION
            .with_label_values(&[phase])
            .observe(done.elapsed.as_secs_f64());

        let key = report.key.clone();
        let Some(state) = self.intents.get_mut(&key) else {
            error!(intent = %key, "Completion for unknown intent");
            return;
        };
        state.running = false;
        state.phase = report.phase;

        match report.phase {
            IntentPhase::Converged => state.attempts = 0,
            IntentPhase::Degraded
                if report.retry && done.epoch == state.epoch && state.queue.is_empty() =>
            {
                let delay = self.config.retry.delay(state.attempts);
                state.attempts = state.attempts.saturating_add(1);
                info!(
                    intent = %key,
                    attempt = state.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling retry"
                );
                metrics::RETRIES_SCHEDULED
                    .with_label_values(&[&key.namespace])
                    .inc();
                schedule_retry(self.retry_tx.clone(), key.clone(), done.epoch, delay, shutdown);
            }
            IntentPhase::Tombstoned if state.queue.is_empty() => {
                self.intents.remove(&key);
                self.publish_phases();
                return;
            }
            _ => {}
        }

        if !state.queue.is_empty() {
            self.ready.push_back(key);
        }
        self.publish_phases();
    }

    fn dispatch(&mut self, shutdown: &CancellationToken) {
        while self.running < self.config.workers.max(1) {
            let Some(key) = self.ready.pop_front() else {
                break;
            };
            let Some(state) = self.intents.get_mut(&key) else {
                continue;
            };
            let Some(work) = state.queue.pop_front() else {
                continue;
            };

            state.running = true;
            state.phase = IntentPhase::Applying;
            self.running += 1;
            metrics::IN_FLIGHT.inc();

            let ctx = self.context.clone();
            let done_tx = self.done_tx.clone();
            let token = shutdown.clone();
            self.tasks.spawn(async move {
                let started = Instant::now();
                let report = database_reconciler::reconcile(&ctx, &work.event, &token).await;
                ctx.status.report(&report).await;
                // Receiver is gone only during shutdown.
                let _ = done_tx.send(Completion {
                    report,
                    epoch: work.epoch,
                    elapsed: started.elapsed(),
                });
            });
        }
        self.publish_phases();
    }

    fn publish_phases(&self) {
        for phase in IntentPhase::ALL {
            let count = self.intents.values().filter(|s| s.phase == phase).count();
            metrics::INTENTS
                .with_label_values(&[phase.as_str()])
                .set(count as f64);
        }
    }

    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        info!(
            in_flight = self.running,
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Waiting for in-flight reconciliations"
        );

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Shutdown grace period elapsed, aborting reconciliations"
            );
            self.tasks.abort_all();
            metrics::IN_FLIGHT.sub(self.running as f64);
            self.running = 0;
        }
    }
}

fn generation_changed(previous: &Database, next: &Database) -> bool {
    match (previous.metadata.generation, next.metadata.generation) {
        (Some(before), Some(after)) => before != after,
        _ => true,
    }
}

fn schedule_retry(
    retry_tx: mpsc::UnboundedSender<(IntentKey, u64)>,
    key: IntentKey,
    epoch: u64,
    delay: Duration,
    shutdown: &CancellationToken,
) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let _ = retry_tx.send((key, epoch));
            }
            _ = shutdown.cancelled() => {}
        }
    });
}
