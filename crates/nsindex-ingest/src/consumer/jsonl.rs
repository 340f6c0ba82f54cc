//! JSONL delivery source.
//!
//! Replays completion events from JSONL files (one JSON payload per line) or
//! stdin, behaving like a broker subscription: every line becomes a
//! [`Delivery`], requeued lines are handed out again after a short delay,
//! and lines that keep failing are given up on after `max_redeliveries`.

use super::{Delivery, Settlement};
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Configuration for the JSONL source.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Input file or directory; `-` reads stdin.
    pub input: PathBuf,

    /// How often a requeued line is handed out again before it is dropped.
    pub max_redeliveries: u32,

    /// Pause before a requeued line is handed out again.
    pub redelivery_delay: Duration,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("-"),
            max_redeliveries: 10,
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

/// Statistics from a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonlStats {
    /// Files read (stdin counts as one).
    pub files: usize,
    /// Non-blank lines read.
    pub lines: usize,
    pub acked: usize,
    pub requeued: usize,
    /// Lines dropped after exhausting their redeliveries.
    pub abandoned: usize,
    /// Deliveries never settled (consumer stopped first).
    pub unsettled: usize,
}

struct Settled {
    payload: Vec<u8>,
    line: usize,
    deliveries: u32,
    settlement: Option<Settlement>,
}

/// JSONL file delivery source.
pub struct JsonlSource {
    config: JsonlConfig,
}

impl JsonlSource {
    /// Create a new JSONL source with the given configuration.
    pub fn new(config: JsonlConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    fn reads_stdin(&self) -> bool {
        self.config.input.as_os_str() == "-"
    }

    /// Collect files to read based on the input path.
    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let input = &self.config.input;

        if input.is_file() {
            return Ok(vec![input.clone()]);
        }
        if !input.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Input path does not exist: {}", input.display()),
            )));
        }

        let mut files: Vec<PathBuf> = fs::read_dir(input)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext == "jsonl" || ext == "json" || ext == "ndjson")
            })
            .collect();

        // Sort for deterministic replay order
        files.sort();
        Ok(files)
    }

    async fn open(path: &Path) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(BufReader::new(file)))
    }

    /// Feed every line to `deliveries` and follow up on settlements.
    ///
    /// Returns once every line is settled or abandoned, the consumer hangs
    /// up, or `shutdown` fires. Dropping `deliveries` on return closes the
    /// channel.
    pub async fn run(
        &self,
        deliveries: mpsc::Sender<Delivery>,
        shutdown: CancellationToken,
    ) -> Result<JsonlStats> {
        let mut stats = JsonlStats::default();
        let mut pending: JoinSet<Settled> = JoinSet::new();

        let readers: Vec<(String, Option<PathBuf>)> = if self.reads_stdin() {
            vec![("<stdin>".to_string(), None)]
        } else {
            self.collect_files()?
                .into_iter()
                .map(|path| (path.display().to_string(), Some(path)))
                .collect()
        };

        'inputs: for (label, path) in readers {
            let reader: Box<dyn AsyncBufRead + Unpin + Send> = match path {
                Some(path) => Self::open(&path).await?,
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };
            let mut lines = reader.lines();
            let mut line_num = 0usize;
            stats.files += 1;
            tracing::info!("Replaying {}", label);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'inputs,
                    Some(joined) = pending.join_next(), if !pending.is_empty() => {
                        if !self.on_settled(joined, &deliveries, &mut pending, &mut stats).await {
                            break 'inputs;
                        }
                    }
                    line = lines.next_line() => {
                        let Some(line) = line? else { break };
                        line_num += 1;
                        if line.trim().is_empty() {
                            continue;
                        }
                        stats.lines += 1;
                        let delivered = self
                            .deliver(line.into_bytes(), line_num, 1, &deliveries, &mut pending)
                            .await;
                        if !delivered {
                            break 'inputs;
                        }
                    }
                }
            }
        }

        // Input exhausted: wait for the outstanding settlements
        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = pending.join_next() => {
                    if !self.on_settled(joined, &deliveries, &mut pending, &mut stats).await {
                        break;
                    }
                }
                else => break,
            }
        }

        stats.unsettled += pending.len();
        pending.abort_all();

        tracing::info!(
            "Replay finished: {} lines from {} files, {} acked, {} requeued, \
             {} abandoned, {} unsettled",
            stats.lines,
            stats.files,
            stats.acked,
            stats.requeued,
            stats.abandoned,
            stats.unsettled
        );
        Ok(stats)
    }

    /// Hand a payload to the consumer and watch for its settlement.
    ///
    /// Returns `false` when the consumer has hung up.
    async fn deliver(
        &self,
        payload: Vec<u8>,
        line: usize,
        deliveries: u32,
        tx: &mpsc::Sender<Delivery>,
        pending: &mut JoinSet<Settled>,
    ) -> bool {
        let (delivery, settled) = Delivery::new(payload.clone(), deliveries > 1);
        if tx.send(delivery).await.is_err() {
            tracing::warn!("Consumer hung up, stopping replay at line {}", line);
            return false;
        }

        let delay = self.config.redelivery_delay;
        pending.spawn(async move {
            let settlement = settled.await.ok();
            if settlement == Some(Settlement::Requeue) {
                tokio::time::sleep(delay).await;
            }
            Settled {
                payload,
                line,
                deliveries,
                settlement,
            }
        });
        true
    }

    async fn on_settled(
        &self,
        joined: std::result::Result<Settled, JoinError>,
        tx: &mpsc::Sender<Delivery>,
        pending: &mut JoinSet<Settled>,
        stats: &mut JsonlStats,
    ) -> bool {
        let settled = match joined {
            Ok(settled) => settled,
            Err(e) => {
                tracing::error!("Settlement watcher failed: {}", e);
                stats.unsettled += 1;
                return true;
            }
        };

        match settled.settlement {
            Some(Settlement::Ack) => {
                stats.acked += 1;
                true
            }
            Some(Settlement::Requeue) => {
                stats.requeued += 1;
                if settled.deliveries > self.config.max_redeliveries {
                    tracing::error!(
                        "Line {}: giving up after {} deliveries",
                        settled.line,
                        settled.deliveries
                    );
                    stats.abandoned += 1;
                    return true;
                }
                tracing::debug!(
                    "Line {}: redelivering (delivery {})",
                    settled.line,
                    settled.deliveries + 1
                );
                self.deliver(
                    settled.payload,
                    settled.line,
                    settled.deliveries + 1,
                    tx,
                    pending,
                )
                .await
            }
            None => {
                stats.unsettled += 1;
                true
            }
        }
    }
}
