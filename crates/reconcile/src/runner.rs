//! Drives reconcile passes from trigger events with a fixed worker pool.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{DesiredState, ObjectKey};
use keel_watch::TriggerEvent;
use metrics::counter;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config, Outcome, ReconcileError, Reconciler, WorkQueue};

struct Shared {
    queue: Mutex<WorkQueue>,
    ready: Notify,
}

impl Shared {
    async fn push(&self, key: ObjectKey) {
        let dropped = {
            let mut q = self.queue.lock().await;
            let before = q.dropped();
            if q.push(key) {
                self.ready.notify_one();
            }
            q.dropped() - before
        };
        if dropped > 0 {
            counter!("reconcile_queue_dropped_total", dropped);
            warn!(dropped, "work queue full; dropped oldest key");
        }
    }
}

pub struct Runner<D> {
    reconciler: Arc<Reconciler<D>>,
    workers: usize,
    requeue_after: Duration,
    gate_retry_after: Duration,
    queue_cap: usize,
}

impl<D: DesiredState> Runner<D> {
    /// Tunables come from the `KEEL_*` environment.
    pub fn new(reconciler: Arc<Reconciler<D>>) -> Self {
        Self {
            reconciler,
            workers: config::workers(),
            requeue_after: config::requeue_after(),
            gate_retry_after: config::gate_retry_after(),
            queue_cap: config::queue_cap(),
        }
    }

    pub fn with_workers(mut self, n: usize) -> Self { self.workers = n.max(1); self }
    pub fn with_requeue_after(mut self, d: Duration) -> Self { self.requeue_after = d; self }
    pub fn with_gate_retry_after(mut self, d: Duration) -> Self { self.gate_retry_after = d; self }

    /// Consume triggers until `shutdown` fires or the trigger channel closes,
    /// then wait for the workers to stop.
    pub async fn run(self, mut triggers: mpsc::Receiver<TriggerEvent>, shutdown: CancellationToken) {
        let shutdown = shutdown.child_token();
        let shared = Arc::new(Shared { queue: Mutex::new(WorkQueue::with_capacity(self.queue_cap)), ready: Notify::new() });
        let this = Arc::new(self);
        let mut handles = Vec::with_capacity(this.workers);
        for id in 0..this.workers {
            handles.push(tokio::spawn(Arc::clone(&this).worker(id, Arc::clone(&shared), shutdown.clone())));
        }
        info!(workers = this.workers, "runner started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = triggers.recv() => match next {
                    Some(t) => {
                        debug!(target_key = %t.target, kind = ?t.event.kind, "trigger");
                        shared.push(t.target).await;
                    }
                    None => {
                        info!("trigger channel closed");
                        shutdown.cancel();
                        break;
                    }
                }
            }
        }
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "worker panicked");
            }
        }
        info!("runner stopped");
    }

    async fn worker(self: Arc<Self>, id: usize, shared: Arc<Shared>, shutdown: CancellationToken) {
        loop {
            let next = shared.queue.lock().await.pop();
            let key = match next {
                Some(k) => k,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = shared.ready.notified() => {}
                    }
                    continue;
                }
            };
            debug!(worker = id, object = %key, "pass started");
            let res = self.reconciler.reconcile(&key, &shutdown).await;
            if let Some(delay) = self.requeue_delay(&res) {
                self.schedule(Arc::clone(&shared), key.clone(), delay, shutdown.clone());
            }
            if shared.queue.lock().await.done(&key) {
                shared.ready.notify_one();
            }
        }
    }

    fn requeue_delay(&self, res: &Result<Outcome, ReconcileError>) -> Option<Duration> {
        match res {
            Ok(Outcome::Gated { .. }) => Some(self.gate_retry_after),
            Ok(_) | Err(ReconcileError::Cancelled(_)) => None,
            Err(_) => Some(self.requeue_after),
        }
    }

    fn schedule(&self, shared: Arc<Shared>, key: ObjectKey, delay: Duration, shutdown: CancellationToken) {
        debug!(object = %key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => shared.push(key).await,
            }
        });
    }
}
