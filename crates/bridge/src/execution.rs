//! Per-thread execution handles.
//!
//! Each background execution owns one producer task and one bounded
//! wire-event channel.  The channel closing is the end-of-stream sentinel;
//! a watch channel lets a later run for the same thread await the prior
//! one's completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use swb_domain::wire::WireEvent;

pub struct ExecutionState {
    thread_id: String,
    handle: JoinHandle<()>,
    /// Consumer half of the event queue.  Single consumer; the drain loop
    /// holds the lock for the whole drain.
    pub(crate) events: tokio::sync::Mutex<mpsc::Receiver<WireEvent>>,
    started_at: Instant,
    complete: AtomicBool,
    done: watch::Receiver<bool>,
}

impl ExecutionState {
    /// Spawn `producer` as this thread's background execution.
    pub fn spawn<F>(
        thread_id: impl Into<String>,
        receiver: mpsc::Receiver<WireEvent>,
        producer: F,
    ) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            producer.await;
            let _ = done_tx.send(true);
        });
        Self {
            thread_id: thread_id.into(),
            handle,
            events: tokio::sync::Mutex::new(receiver),
            started_at: Instant::now(),
            complete: AtomicBool::new(false),
            done: done_rx,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    /// Whether the producer task has finished (normally or by abort).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Running longer than `timeout` without completing.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        !self.is_complete() && self.started_at.elapsed() > timeout
    }

    /// Wait for the producer task to finish.  Returns immediately if it
    /// already has (including after an abort).
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        loop {
            if *done.borrow() {
                return;
            }
            if done.changed().await.is_err() {
                // Sender dropped: the task is gone either way.
                return;
            }
        }
    }

    /// Cancel the background task.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}
