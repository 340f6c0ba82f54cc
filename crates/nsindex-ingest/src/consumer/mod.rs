//! Completion event consumer.
//!
//! The [`EventConsumer`] pulls [`Delivery`] values from one logical queue and
//! handles up to `concurrency` of them at a time. Every delivery is settled
//! exactly once:
//!
//! | Payload                         | Settlement              |
//! |---------------------------------|-------------------------|
//! | unparseable / fails validation  | [`Settlement::Ack`]     |
//! | status other than `completed`   | [`Settlement::Ack`]     |
//! | indexed                         | [`Settlement::Ack`]     |
//! | store failed permanently        | [`Settlement::Ack`]     |
//! | store retries exhausted         | [`Settlement::Requeue`] |
//!
//! A delivery dropped without settlement (handler aborted at shutdown) is
//! never acknowledged and the broker redelivers it; indexing is idempotent,
//! so that is always safe.
//!
//! # Sources
//!
//! Broker adapters push deliveries into an `mpsc` channel and act on the
//! settlement they get back. [`JsonlSource`] does the same for payloads read
//! from a file or stdin.

mod jsonl;

pub use jsonl::{JsonlConfig, JsonlSource, JsonlStats};

use crate::indexer::{IndexReport, Indexer};
use metrics::{counter, gauge};
use nsindex_core::{IndexRequest, TaskStatus, parse_event};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processing is final; remove the message from the queue.
    Ack,
    /// Processing failed transiently; hand the message out again later.
    Requeue,
}

/// One message handed out by the subscription.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    /// Whether the broker has handed this message out before.
    pub redelivered: bool,
    settle: oneshot::Sender<Settlement>,
}

impl Delivery {
    /// Wrap a payload; the receiver resolves once the consumer settles it.
    ///
    /// If the receiver resolves with an error the delivery was dropped
    /// unsettled and must be treated as not acknowledged.
    pub fn new(payload: Vec<u8>, redelivered: bool) -> (Self, oneshot::Receiver<Settlement>) {
        let (settle, settled) = oneshot::channel();
        (
            Self {
                payload,
                redelivered,
                settle,
            },
            settled,
        )
    }

    /// Report the settlement back to the source.
    pub fn settle(self, settlement: Settlement) {
        // The source may have gone away; the broker redelivers in that case
        let _ = self.settle.send(settlement);
    }
}

/// What the consumer did with one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Indexed(IndexReport),
    /// Payload can never be indexed.
    Malformed(String),
    /// Valid event for a run that did not complete.
    Ignored(TaskStatus),
    /// Store failed in a way redelivery cannot fix; logged and dropped.
    Rejected(String),
    /// Transient store failure outlasted its retries; the message should
    /// come back later.
    Failed(String),
}

impl HandleOutcome {
    /// The settlement this outcome calls for.
    pub fn settlement(&self) -> Settlement {
        match self {
            HandleOutcome::Failed(_) => Settlement::Requeue,
            _ => Settlement::Ack,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            HandleOutcome::Indexed(_) => "indexed",
            HandleOutcome::Malformed(_) => "malformed",
            HandleOutcome::Ignored(_) => "ignored",
            HandleOutcome::Rejected(_) => "rejected",
            HandleOutcome::Failed(_) => "failed",
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Routes must start with `<route_prefix>.` to be indexed.
    pub route_prefix: String,
    /// Maximum deliveries handled at once.
    pub concurrency: usize,
    /// How long in-flight handlers may run after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            route_prefix: nsindex_core::DEFAULT_ROUTE_PREFIX.to_string(),
            concurrency: 32,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Routing-key pattern to bind the subscription with.
    pub fn binding_pattern(&self) -> String {
        format!("route.{}.#", self.route_prefix)
    }
}

/// Counters for a consumer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: usize,
    pub indexed: usize,
    pub malformed: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Handlers aborted at shutdown before settling.
    pub aborted: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicUsize,
    indexed: AtomicUsize,
    malformed: AtomicUsize,
    ignored: AtomicUsize,
    rejected: AtomicUsize,
    failed: AtomicUsize,
    aborted: AtomicUsize,
    in_flight: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: &HandleOutcome) {
        let counter = match outcome {
            HandleOutcome::Indexed(_) => &self.indexed,
            HandleOutcome::Malformed(_) => &self.malformed,
            HandleOutcome::Ignored(_) => &self.ignored,
            HandleOutcome::Rejected(_) => &self.rejected,
            HandleOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

struct Handler {
    indexer: Indexer,
    route_prefix: String,
    counters: Counters,
}

/// Holds one slot of the in-flight gauge until the handler task ends,
/// whether it finishes or is aborted.
struct InFlight(Arc<Handler>);

impl InFlight {
    fn enter(handler: Arc<Handler>) -> Self {
        let now = handler.counters.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("consumer_in_flight").set(now as f64);
        Self(handler)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let now = self.0.counters.in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("consumer_in_flight").set(now as f64);
    }
}

impl Handler {
    async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let outcome = match parse_event(payload) {
            Err(e) => {
                tracing::warn!("Dropping malformed message: {}", e);
                HandleOutcome::Malformed(e.to_string())
            }
            Ok(event) if event.status != TaskStatus::Completed => {
                tracing::debug!(
                    "Ignoring task {} run {} with status {:?}",
                    event.task_id,
                    event.run_id,
                    event.status
                );
                HandleOutcome::Ignored(event.status)
            }
            Ok(event) => {
                let request = IndexRequest::from_event(&event, &self.route_prefix);
                match self.indexer.index(&request).await {
                    Ok(report) => HandleOutcome::Indexed(report),
                    Err(e) if e.is_exhausted() => {
                        tracing::error!(
                            "Failed to index task {} run {}, requeueing: {}",
                            event.task_id,
                            event.run_id,
                            e
                        );
                        HandleOutcome::Failed(e.to_string())
                    }
                    Err(e) => {
                        tracing::error!(
                            "Dropping task {} run {}, store rejected it: {}",
                            event.task_id,
                            event.run_id,
                            e
                        );
                        HandleOutcome::Rejected(e.to_string())
                    }
                }
            }
        };

        self.counters.record(&outcome);
        counter!("index_events_total", "outcome" => outcome.label()).increment(1);
        outcome
    }
}

/// Bounded worker pool that indexes deliveries.
pub struct EventConsumer {
    config: ConsumerConfig,
    handler: Arc<Handler>,
}

impl EventConsumer {
    /// Create a consumer feeding `indexer`.
    pub fn new(config: ConsumerConfig, indexer: Indexer) -> Self {
        let handler = Arc::new(Handler {
            indexer,
            route_prefix: config.route_prefix.clone(),
            counters: Counters::default(),
        });
        Self { config, handler }
    }

    /// The consumer settings.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> ConsumerStats {
        self.handler.counters.snapshot()
    }

    /// Handler tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.handler.counters.in_flight.load(Ordering::Relaxed)
    }

    /// Handle a single payload without a delivery around it.
    pub async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        self.handler.handle(payload).await
    }

    /// Consume `deliveries` until the channel closes or `shutdown` fires.
    ///
    /// On shutdown no further deliveries are taken; in-flight handlers get
    /// `shutdown_grace` to finish and are aborted after that. Deliveries
    /// left in the channel are dropped unsettled.
    pub async fn run(
        &self,
        mut deliveries: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) -> ConsumerStats {
        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        tracing::info!(
            "Consumer started: binding '{}', concurrency {}",
            self.config.binding_pattern(),
            concurrency
        );

        loop {
            // Admission control: wait for a free worker before taking a message
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        tracing::info!("Delivery channel closed");
                        break;
                    }
                },
            };

            while let Some(joined) = in_flight.try_join_next() {
                self.log_join(joined);
            }

            self.handler.counters.received.fetch_add(1, Ordering::Relaxed);
            counter!("consumer_deliveries_total").increment(1);

            let slot = InFlight::enter(Arc::clone(&self.handler));
            in_flight.spawn(async move {
                let _permit = permit;
                let outcome = slot.0.handle(&delivery.payload).await;
                delivery.settle(outcome.settlement());
            });
        }

        // Stop taking deliveries; anything still queued goes back to the broker
        deliveries.close();
        self.drain(&mut in_flight).await;

        let stats = self.stats();
        tracing::info!(
            "Consumer stopped: {} received, {} indexed, {} malformed, {} ignored, \
             {} rejected, {} failed, {} aborted",
            stats.received,
            stats.indexed,
            stats.malformed,
            stats.ignored,
            stats.rejected,
            stats.failed,
            stats.aborted
        );
        stats
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        tracing::info!(
            "Waiting up to {:?} for {} in-flight deliveries",
            self.config.shutdown_grace,
            in_flight.len()
        );

        let finished = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                self.log_join(joined);
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!(
                "Grace period elapsed, aborting {} in-flight deliveries",
                in_flight.len()
            );
            in_flight.abort_all();
            // A handler may finish between the timeout and the abort
            let mut aborted = 0;
            while let Some(joined) = in_flight.join_next().await {
                match joined {
                    Err(e) if e.is_cancelled() => aborted += 1,
                    joined => self.log_join(joined),
                }
            }
            self.handler
                .counters
                .aborted
                .fetch_add(aborted, Ordering::Relaxed);
            tracing::warn!("{} aborted deliveries left for redelivery", aborted);
        }
    }

    fn log_join(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined
            && e.is_panic()
        {
            tracing::error!("Delivery handler panicked: {}", e);
        }
    }
}
