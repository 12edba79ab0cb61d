//! Work scheduling
//!
//! Each pipeline component is wrapped as a [`Work`] and registered with the
//! [`WorkManager`]. The sequential discipline is the normative one: a
//! round-robin over every work until the crawler reports convergence. The
//! parallel disciplines run each work in its own task with a throttle, and
//! the queue discipline hands works to external consumers via named queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ExecutionMode;
use crate::crawl::{Crawler, StepOutcome};
use crate::detect::{EndpointDetector, StateChangeDetector, StateDetector};
use crate::error::Result;
use crate::extract::EndpointExtractor;

/// What one work iteration reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Keep scheduling this work
    Progressed,
    /// The run is complete; stop every work
    Converged,
}

/// A schedulable unit of the pipeline.
#[async_trait]
pub trait Work: Send {
    /// Name used for queues and logging.
    fn name(&self) -> &'static str;

    /// Run one iteration.
    async fn run(&mut self) -> Result<WorkStatus>;
}

#[async_trait]
impl Work for Crawler {
    fn name(&self) -> &'static str {
        "crawler"
    }

    async fn run(&mut self) -> Result<WorkStatus> {
        match self.step().await? {
            StepOutcome::Converged => Ok(WorkStatus::Converged),
            StepOutcome::Visited | StepOutcome::NoMoreEndpoints => Ok(WorkStatus::Progressed),
        }
    }
}

#[async_trait]
impl Work for EndpointExtractor {
    fn name(&self) -> &'static str {
        "endpoint_extractor"
    }

    async fn run(&mut self) -> Result<WorkStatus> {
        self.process().await?;
        Ok(WorkStatus::Progressed)
    }
}

#[async_trait]
impl Work for EndpointDetector {
    fn name(&self) -> &'static str {
        "endpoint_detector"
    }

    async fn run(&mut self) -> Result<WorkStatus> {
        self.detect().await?;
        Ok(WorkStatus::Progressed)
    }
}

#[async_trait]
impl Work for StateChangeDetector {
    fn name(&self) -> &'static str {
        "state_change_detector"
    }

    async fn run(&mut self) -> Result<WorkStatus> {
        self.detect().await?;
        Ok(WorkStatus::Progressed)
    }
}

#[async_trait]
impl Work for StateDetector {
    fn name(&self) -> &'static str {
        "state_detector"
    }

    async fn run(&mut self) -> Result<WorkStatus> {
        self.detect().await?;
        Ok(WorkStatus::Progressed)
    }
}

/// Cooperative cancellation handle, observed by works between iterations.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// The sending side of cancellation, detachable from the manager.
#[derive(Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Named queues for the queue discipline: the manager enqueues works,
/// external consumers drain them.
#[derive(Default)]
pub struct WorkQueues {
    queues: Mutex<HashMap<String, VecDeque<Box<dyn Work>>>>,
}

impl WorkQueues {
    /// Push a work onto its named queue.
    pub fn enqueue(&self, name: &str, work: Box<dyn Work>) {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(work);
    }

    /// Take the next work off a named queue.
    pub fn take(&self, name: &str) -> Option<Box<dyn Work>> {
        self.queues.lock().get_mut(name)?.pop_front()
    }

    /// Names that currently have queued work.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues
            .lock()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Consume one named queue: loop its work with a throttle until it
    /// converges or the token cancels.
    pub async fn consume(
        &self,
        name: &str,
        cancel: CancelToken,
        throttle: Duration,
    ) -> Result<()> {
        let Some(mut work) = self.take(name) else {
            return Ok(());
        };
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if work.run().await? == WorkStatus::Converged {
                info!(work = name, "crawling converged");
                return Ok(());
            }
            tokio::time::sleep(throttle).await;
        }
    }
}

/// Registers works and drives them under the configured discipline.
pub struct WorkManager {
    mode: ExecutionMode,
    throttle: Duration,
    works: Vec<Box<dyn Work>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    queues: Arc<WorkQueues>,
}

impl WorkManager {
    /// Create a manager for the given discipline.
    pub fn new(mode: ExecutionMode, throttle_ms: u64) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            mode,
            throttle: Duration::from_millis(throttle_ms),
            works: Vec::new(),
            cancel_tx: Arc::new(cancel_tx),
            queues: Arc::new(WorkQueues::default()),
        }
    }

    /// Register a work.
    pub fn register(&mut self, work: Box<dyn Work>) {
        self.works.push(work);
    }

    /// A token that observes this manager's cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            rx: self.cancel_tx.subscribe(),
        }
    }

    /// A handle that can cancel the run after the manager is consumed.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Request cooperative cancellation of the whole run.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// The named queues used by the queue discipline.
    pub fn queues(&self) -> Arc<WorkQueues> {
        Arc::clone(&self.queues)
    }

    /// Drive all registered works to completion (or cancellation).
    pub async fn run(mut self) -> Result<()> {
        match self.mode {
            ExecutionMode::Sequential => self.run_sequential().await,
            ExecutionMode::ParallelThreaded => self.run_parallel().await,
            ExecutionMode::ParallelQueue => {
                self.run_queue();
                Ok(())
            }
        }
    }

    /// Round-robin every work until one reports convergence. Errors abort
    /// the run.
    async fn run_sequential(&mut self) -> Result<()> {
        let cancel = self.cancel_tx.subscribe();
        loop {
            for work in &mut self.works {
                if *cancel.borrow() {
                    info!("run cancelled");
                    return Ok(());
                }
                debug!(work = work.name(), "running work");
                if work.run().await? == WorkStatus::Converged {
                    info!(work = work.name(), "crawling converged");
                    return Ok(());
                }
            }
        }
    }

    /// One task per work, each looping with the throttle. Errors are logged
    /// and retried; convergence cancels every sibling.
    async fn run_parallel(&mut self) -> Result<()> {
        let mut handles = Vec::new();
        for mut work in self.works.drain(..) {
            let rx = self.cancel_tx.subscribe();
            let tx = self.cancel_tx.clone();
            let throttle = self.throttle;
            handles.push(tokio::spawn(async move {
                loop {
                    if *rx.borrow() {
                        return;
                    }
                    match work.run().await {
                        Ok(WorkStatus::Converged) => {
                            info!(work = work.name(), "crawling converged");
                            let _ = tx.send(true);
                            return;
                        }
                        Ok(WorkStatus::Progressed) => {}
                        Err(e) => {
                            warn!(work = work.name(), error = %e, "work iteration failed; retrying");
                        }
                    }
                    tokio::time::sleep(throttle).await;
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Hand every work to its named queue; external consumers drive them.
    fn run_queue(&mut self) {
        for work in self.works.drain(..) {
            let name = work.name();
            debug!(work = name, "enqueuing work");
            self.queues.enqueue(name, work);
        }
    }
}
