//! Batch scheduler: the periodic drain → classify → assemble → dispatch loop.
//!
//! Each tick:
//! 1. Return to idle right away when nothing is queued
//! 2. Load prompt templates (a failure skips the tick, tasks stay queued),
//!    then drain the task buffer
//! 3. Classify every task, one at a time, through the processor
//! 4. Take each task's correlation entry and join it with the result
//! 5. Send all matched results to the sink in one call
//!
//! Ticks never overlap: the loop runs on a single task and `run_tick`
//! additionally holds a tick lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::processor::FilterProcessor;
use super::prompts::PromptSource;
use super::store::{CorrelationStore, TaskBuffer};
use super::types::EnrichedResult;
use crate::sink::ResultSink;

/// Phase of the scheduler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Draining,
    Processing,
    Assembling,
    Dispatching,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks drained from the buffer.
    pub drained: usize,
    /// Results that named a filter.
    pub matched: usize,
    /// Results handed to the sink.
    pub dispatched: usize,
    /// Results whose correlation entry was already gone.
    pub correlation_misses: usize,
    /// The sink call failed and the batch was dropped.
    pub dispatch_failed: bool,
    /// The tick was skipped before draining (prompts unavailable).
    pub skipped: bool,
}

/// Drives the classification pipeline on a fixed interval.
pub struct BatchScheduler {
    store: Arc<CorrelationStore>,
    buffer: Arc<TaskBuffer>,
    processor: Arc<FilterProcessor>,
    sink: Arc<dyn ResultSink>,
    prompts: PromptSource,
    tick_lock: Mutex<()>,
    state: watch::Sender<SchedulerState>,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<CorrelationStore>,
        buffer: Arc<TaskBuffer>,
        processor: Arc<FilterProcessor>,
        sink: Arc<dyn ResultSink>,
        prompts: PromptSource,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            store,
            buffer,
            processor,
            sink,
            prompts,
            tick_lock: Mutex::new(()),
            state,
        }
    }

    /// Current phase.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn enter(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Run one drain → classify → assemble → dispatch cycle.
    pub async fn run_tick(&self) -> TickReport {
        let _tick = self.tick_lock.lock().await;
        let report = self.tick().await;
        self.enter(SchedulerState::Idle);
        report
    }

    async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        // Idle ticks never touch the prompt files.
        if self.buffer.is_empty() {
            return report;
        }

        let prompts = match self.prompts.load().await {
            Ok(prompts) => prompts,
            Err(e) => {
                error!(error = %e, "Prompt templates unavailable, skipping tick");
                report.skipped = true;
                return report;
            }
        };

        self.enter(SchedulerState::Draining);
        let tasks = self.buffer.drain_all().await;
        report.drained = tasks.len();
        if tasks.is_empty() {
            return report;
        }

        info!(count = tasks.len(), "Processing batch");

        self.enter(SchedulerState::Processing);
        let mut results = Vec::with_capacity(tasks.len());
        for task in &tasks {
            results.push(self.processor.classify(task, &prompts).await);
        }

        self.enter(SchedulerState::Assembling);
        let mut batch: Vec<EnrichedResult> = Vec::new();
        for result in results {
            // Every resolved task gives up its entry, matched or not.
            let Some(original) = self.store.take(result.messageid).await else {
                warn!(
                    messageid = result.messageid,
                    "Correlation entry missing, dropping result"
                );
                report.correlation_misses += 1;
                continue;
            };

            if result.matched.is_none() {
                debug!(messageid = result.messageid, "No match, not dispatching");
                continue;
            }

            report.matched += 1;
            batch.push(EnrichedResult::assemble(result, original));
        }

        if batch.is_empty() {
            debug!(drained = report.drained, "Nothing to dispatch");
            return report;
        }

        self.enter(SchedulerState::Dispatching);
        match self.sink.dispatch(&batch).await {
            Ok(()) => {
                report.dispatched = batch.len();
                info!(
                    count = batch.len(),
                    sink = self.sink.name(),
                    "Dispatched batch"
                );
            }
            Err(e) => {
                report.dispatch_failed = true;
                error!(
                    count = batch.len(),
                    sink = self.sink.name(),
                    error = %e,
                    "Dispatch failed, dropping batch"
                );
            }
        }

        report
    }
}

/// Spawn the scheduler loop on its own task.
///
/// Missed ticks are delayed rather than bursted, so a slow batch pushes the
/// next tick back instead of queuing up extra ones. Returns a `JoinHandle`
/// and a shutdown flag checked between ticks.
pub fn spawn_batch_scheduler(
    scheduler: Arc<BatchScheduler>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Batch scheduler started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Batch scheduler shutting down");
                return;
            }

            scheduler.run_tick().await;
        }
    });

    (handle, shutdown_flag)
}
