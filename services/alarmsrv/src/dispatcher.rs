//! Ordered change queue and its single consumer
//!
//! Producers enqueue alarm snapshots from any context without blocking. One
//! consumer task drains them strictly in enqueue order and hands each to the
//! dequeued listeners, which may do I/O.
//!
//! The queue is an unbounded channel. Growth is bounded in practice by the
//! number of alarms times their change rate; a stalled consumer (messaging not
//! ready) lets it grow until readiness returns or shutdown drains it. The
//! current depth is exposed through [`Dispatcher::depth`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::AlarmChange;
use crate::error::{AlarmError, Result};

/// Consumer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatcherStatus {
    NotStarted,
    Running,
    Stopped,
}

/// Reaction to a dequeued change; runs on the consumer task only
#[async_trait]
pub trait DequeueListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn on_dequeued(&self, change: &AlarmChange) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// How often to re-check the ready predicate while held back
    pub ready_poll: Duration,
    /// Upper bound on the drain after cancellation
    pub drain_grace: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            ready_poll: Duration::from_millis(200),
            drain_grace: Duration::from_secs(5),
        }
    }
}

pub struct Dispatcher {
    tx: mpsc::UnboundedSender<AlarmChange>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<AlarmChange>>>,
    depth: AtomicUsize,
    processed: AtomicU64,
    status: RwLock<DispatcherStatus>,
    listeners: RwLock<Vec<Arc<dyn DequeueListener>>>,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(options: DispatcherOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            depth: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            status: RwLock::new(DispatcherStatus::NotStarted),
            listeners: RwLock::new(Vec::new()),
            options,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn DequeueListener>) {
        debug!("Dequeue listener added: {}", listener.name());
        self.listeners.write().push(listener);
    }

    /// Never blocks; safe to call while holding the manager lock
    pub fn enqueue(&self, change: AlarmChange) {
        // Count first so a fast consumer never sees the depth underflow
        self.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(change) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            debug!("Queue closed, change {} dropped", e.0.key());
        }
    }

    pub fn status(&self) -> DispatcherStatus {
        *self.status.read()
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Changes handed to listeners so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Consume the queue until `cancel` fires, then drain within the grace period.
    ///
    /// Items are held back while `ready` returns false. Can only run once.
    pub async fn run<F>(&self, ready: F, cancel: CancellationToken) -> Result<()>
    where
        F: Fn() -> bool + Send + Sync,
    {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| AlarmError::conflict("dispatcher already started"))?;

        *self.status.write() = DispatcherStatus::Running;
        info!("Dispatcher started");

        let mut held: Option<AlarmChange> = None;

        'consume: loop {
            let change = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'consume,
                item = rx.recv() => match item {
                    Some(change) => {
                        self.depth.fetch_sub(1, Ordering::SeqCst);
                        change
                    },
                    None => break 'consume,
                },
            };

            while !ready() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        held = Some(change);
                        break 'consume;
                    },
                    _ = tokio::time::sleep(self.options.ready_poll) => {},
                }
            }

            self.dispatch(&change).await;
        }

        let drained = tokio::time::timeout(self.options.drain_grace, async {
            let mut count = 0usize;
            if let Some(change) = held.take() {
                self.dispatch(&change).await;
                count += 1;
            }
            while let Ok(change) = rx.try_recv() {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                self.dispatch(&change).await;
                count += 1;
            }
            count
        })
        .await;

        match drained {
            Ok(count) => debug!("Dispatcher drained {} changes", count),
            Err(_) => warn!(
                "Dispatcher drain timed out after {:?}, {} changes left",
                self.options.drain_grace,
                self.depth()
            ),
        }

        *self.status.write() = DispatcherStatus::Stopped;
        info!("Dispatcher stopped");
        Ok(())
    }

    async fn dispatch(&self, change: &AlarmChange) {
        let listeners = self.listeners.read().clone();

        for listener in listeners {
            let outcome = AssertUnwindSafe(listener.on_dequeued(change))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(
                    "{} failed on {} #{}: {}",
                    listener.name(),
                    change.key(),
                    change.seq,
                    e
                ),
                Err(_) => error!(
                    "{} panicked on {} #{}",
                    listener.name(),
                    change.key(),
                    change.seq
                ),
            }
        }

        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::domain::{Alarm, ChangeKind};
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;
    use tracing_test::traced_test;

    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl DequeueListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_dequeued(&self, change: &AlarmChange) -> Result<()> {
            self.seen.lock().push(change.seq);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl DequeueListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_dequeued(&self, change: &AlarmChange) -> Result<()> {
            if change.seq == 2 {
                panic!("boom");
            }
            Err(AlarmError::transient("failing", "always"))
        }
    }

    fn change(seq: u64) -> AlarmChange {
        AlarmChange {
            seq,
            kind: ChangeKind::Raised,
            test_cancelled: false,
            alarm: Alarm::new(1, "local", "gs", "Gensets"),
            at: Utc::now(),
        }
    }

    fn fast() -> DispatcherOptions {
        DispatcherOptions {
            ready_poll: Duration::from_millis(10),
            drain_grace: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_consumer() {
        let dispatcher = Arc::new(Dispatcher::new(fast()));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.add_listener(Arc::new(Failing));
        dispatcher.add_listener(recorder.clone());

        for seq in 1..=3 {
            dispatcher.enqueue(change(seq));
        }
        assert_eq!(dispatcher.depth(), 3);

        let cancel = CancellationToken::new();
        let task = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(|| true, cancel).await })
        };

        for _ in 0..100 {
            if dispatcher.processed() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(*recorder.seen.lock(), vec![1, 2, 3]);
        assert_eq!(dispatcher.status(), DispatcherStatus::Stopped);
        assert_eq!(dispatcher.depth(), 0);
    }

    #[tokio::test]
    async fn test_not_ready_holds_then_drains_on_cancel() {
        let dispatcher = Arc::new(Dispatcher::new(fast()));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.add_listener(recorder.clone());

        let ready = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let task = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            let ready = ready.clone();
            tokio::spawn(async move {
                dispatcher
                    .run(move || ready.load(Ordering::SeqCst), cancel)
                    .await
            })
        };

        dispatcher.enqueue(change(1));
        dispatcher.enqueue(change(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(dispatcher.status(), DispatcherStatus::Running);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*recorder.seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_twice_conflicts() {
        let dispatcher = Dispatcher::new(fast());
        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher.run(|| true, cancel.clone()).await.unwrap();

        let err = dispatcher.run(|| true, cancel).await.unwrap_err();
        assert!(matches!(err, AlarmError::Conflict(_)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_listener_failures_are_logged() {
        let dispatcher = Arc::new(Dispatcher::new(fast()));
        dispatcher.add_listener(Arc::new(Failing));
        dispatcher.enqueue(change(1));
        dispatcher.enqueue(change(2));

        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher.run(|| true, cancel).await.unwrap();

        assert_eq!(dispatcher.processed(), 2);
        assert!(logs_contain("failing failed on"));
        assert!(logs_contain("panicked"));
    }

    #[test]
    fn test_initial_status() {
        let dispatcher = Dispatcher::new(DispatcherOptions::default());
        assert_eq!(dispatcher.status(), DispatcherStatus::NotStarted);
        assert_eq!(dispatcher.depth(), 0);
    }
}
