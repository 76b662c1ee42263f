// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded background executor for cache rebuilds.
//!
//! Jobs enter an unbounded queue and a dispatcher task runs at most
//! `concurrency` of them at once. Submission never blocks the caller.
//!
//! The pool is built once at startup and shared by reference. `shutdown`
//! closes the queue, lets queued and running jobs finish, and returns when
//! the last one is done.
//!
//! Per-key single flight is not the pool's job: the rebuild lock guarantees
//! it, independent of scheduling.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::storage::traits::StorageError;

pub type RebuildJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

pub struct RebuildPool {
    sender: Mutex<Option<mpsc::UnboundedSender<RebuildJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    concurrency: usize,
}

impl RebuildPool {
    /// Spawn the dispatcher. Must be called inside a Tokio runtime.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let dispatcher = tokio::spawn(dispatch(rx, Arc::new(Semaphore::new(concurrency)), counters.clone()));

        Self {
            sender: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            counters,
            concurrency,
        }
    }

    /// Queue a job. Fails only after [`shutdown`](Self::shutdown).
    pub fn submit<F>(&self, job: F) -> Result<(), StorageError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(StorageError::Backend("rebuild pool is shut down".into()));
        };

        let depth = self.counters.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if sender.send(Box::pin(job)).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::Backend("rebuild pool dispatcher stopped".into()));
        }
        crate::metrics::set_rebuild_queue_depth(depth);
        Ok(())
    }

    /// Jobs waiting for a worker slot.
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_idle(&self) -> bool {
        self.queued() == 0 && self.in_flight() == 0
    }

    /// Poll until nothing is queued or running.
    pub async fn wait_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Stop accepting jobs and drain everything already submitted.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Rebuild dispatcher failed");
            }
            info!("Rebuild pool drained");
        }
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<RebuildJob>, slots: Arc<Semaphore>, counters: Arc<Counters>) {
    let mut running = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };

        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let depth = counters.queued.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        crate::metrics::set_rebuild_queue_depth(depth);

        let slot = Slot {
            counters: counters.clone(),
            _permit: permit,
        };
        running.spawn(async move {
            let _slot = slot;
            job.await;
        });

        while let Some(finished) = running.try_join_next() {
            reap(finished);
        }
    }

    debug!(remaining = running.len(), "Rebuild queue closed, draining");
    while let Some(finished) = running.join_next().await {
        reap(finished);
    }
}

/// Frees the worker slot when the job ends, including by panic.
struct Slot {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn reap(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        error!(error = %e, "Rebuild job panicked");
    }
}
