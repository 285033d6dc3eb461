//! Feeds watch events into an [`AppStore`].

use std::sync::Arc;
use std::time::Duration;

use metrics::histogram;
use pipedk8s_kubehub::WatchEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::AppStore;

pub const DEFAULT_QUEUE_CAP: usize = 2048;

/// Capacity of the event channel, from `PIPED_K8S_QUEUE_CAP`.
pub fn queue_cap_from_env() -> usize {
    std::env::var("PIPED_K8S_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_QUEUE_CAP)
}

/// Readers wait on the epoch to learn that new events were applied.
pub struct IngestHandle {
    epoch_rx: watch::Receiver<u64>,
    join: JoinHandle<()>,
}

impl IngestHandle {
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
    pub fn epoch(&self) -> u64 { *self.epoch_rx.borrow() }
    pub fn is_finished(&self) -> bool { self.join.is_finished() }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawn the loop applying events to `store`. Applied events are published
/// as a new epoch on the next tick; the loop drains and stops when every
/// sender is gone or `cancel` fires.
pub fn spawn_ingest(store: Arc<AppStore>, cap: usize, cancel: CancellationToken) -> (mpsc::Sender<WatchEvent>, IngestHandle) {
    let (tx, mut rx) = mpsc::channel::<WatchEvent>(cap);
    let (epoch_tx, epoch_rx) = watch::channel(0u64);

    let join = tokio::spawn(async move {
        let mut epoch = 0u64;
        let mut pending = 0usize;
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let publish = |epoch: &mut u64, pending: &mut usize| {
            if *pending > 0 {
                *epoch = epoch.saturating_add(1);
                histogram!("livestate_ingest_batch", *pending as f64, "target" => store.deploy_target().to_string());
                *pending = 0;
                let _ = epoch_tx.send(*epoch);
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target_name = %store.deploy_target(), "ingest cancelled");
                    break;
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(ev) => {
                            store.apply(ev);
                            pending += 1;
                        }
                        None => {
                            debug!("event channel closed; draining and exiting ingest loop");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => publish(&mut epoch, &mut pending),
            }
        }
        publish(&mut epoch, &mut pending);
        info!(target_name = %store.deploy_target(), epoch, tracked = store.len(), "ingest loop stopped");
    });

    (tx, IngestHandle { epoch_rx, join })
}
