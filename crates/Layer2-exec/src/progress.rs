//! Progress tracking for running invocations
//!
//! Each invocation gets a context keyed by its id, holding step counts,
//! status and a cancellation token. Contexts leave the live set as soon as
//! they reach a terminal status. Every state change is published on the
//! `EventBus`; long-running contexts additionally emit heartbeats.

use crate::command::CommandResult;
use conduit_foundation::event::command;
use conduit_foundation::{CancellationToken, Error, EventBus, ProgressConfig, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

// ============================================================================
// Status
// ============================================================================

/// Invocation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Initializing,
    Validating,
    Preparing,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Validating => "validating",
            Self::Preparing => "preparing",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress report, either an absolute step or a percentage
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressStep {
    Step(u32),
    Percent(f64),
}

// ============================================================================
// Context
// ============================================================================

struct ProgressContext {
    command_name: String,
    started: Instant,
    current_step: u32,
    total_steps: u32,
    status: ProgressStatus,
    message: Option<String>,
    token: CancellationToken,
    cancelled: bool,
    eta: Option<Duration>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ProgressContext {
    fn percent(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        f64::from(self.current_step) / f64::from(self.total_steps) * 100.0
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    fn progress_event(&self, id: &str) -> conduit_foundation::ConduitEvent {
        command::progress(
            id,
            &self.command_name,
            self.percent(),
            self.status.as_str(),
            self.message.as_deref(),
            self.eta.map(|d| d.as_millis() as u64),
        )
    }

    fn snapshot(&self, id: &str) -> ProgressSnapshot {
        ProgressSnapshot {
            id: id.to_string(),
            command_name: self.command_name.clone(),
            status: self.status,
            current_step: self.current_step,
            total_steps: self.total_steps,
            progress: self.percent(),
            message: self.message.clone(),
            elapsed_ms: self.elapsed_ms(),
            estimated_time_remaining_ms: self.eta.map(|d| d.as_millis() as u64),
        }
    }
}

/// Point-in-time view of a live context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub id: String,
    pub command_name: String,
    pub status: ProgressStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub progress: f64,
    pub message: Option<String>,
    pub elapsed_ms: u64,
    pub estimated_time_remaining_ms: Option<u64>,
}

/// Returned by `create`: the context id and its cancellation token
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    id: String,
    signal: CancellationToken,
}

impl ProgressHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signal(&self) -> CancellationToken {
        self.signal.clone()
    }
}

// ============================================================================
// Tracker
// ============================================================================

struct TrackerInner {
    config: ProgressConfig,
    bus: Arc<EventBus>,
    contexts: Mutex<HashMap<String, ProgressContext>>,
}

impl TrackerInner {
    fn update(&self, id: &str, step: ProgressStep, message: Option<String>) {
        let event = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(id) else {
                trace!(id, "Progress update for unknown context ignored");
                return;
            };
            if ctx.status.is_terminal() {
                return;
            }

            let step = match step {
                ProgressStep::Step(n) => n,
                ProgressStep::Percent(p) => {
                    let fraction = p.clamp(0.0, 100.0) / 100.0;
                    (fraction * f64::from(ctx.total_steps)).round() as u32
                }
            };
            ctx.current_step = step.min(ctx.total_steps);
            if message.is_some() {
                ctx.message = message;
            }
            ctx.status = ProgressStatus::Executing;
            ctx.eta = estimate_remaining(ctx.started.elapsed(), ctx.current_step, ctx.total_steps);

            ctx.progress_event(id)
        };
        self.bus.publish(event);
    }
}

/// `elapsed / steps_done * steps_remaining`
fn estimate_remaining(elapsed: Duration, done: u32, total: u32) -> Option<Duration> {
    if done == 0 {
        return None;
    }
    let remaining = total.saturating_sub(done);
    Some(elapsed.mul_f64(f64::from(remaining) / f64::from(done)))
}

/// Progress tracker
///
/// Owns the live contexts and their heartbeat timers. Dropping the tracker
/// (or calling `shutdown`) stops every timer.
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl ProgressTracker {
    pub fn new(bus: Arc<EventBus>, config: ProgressConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                config,
                bus,
                contexts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Open a context and emit its initial 0% progress event.
    ///
    /// Fails with `Error::Validation` while a context with the same id is
    /// still live.
    pub fn create(
        &self,
        id: impl Into<String>,
        command_name: impl Into<String>,
        total_steps: u32,
    ) -> Result<ProgressHandle> {
        let id = id.into();
        let command_name = command_name.into();
        let token = CancellationToken::new();

        let ctx = ProgressContext {
            command_name,
            started: Instant::now(),
            current_step: 0,
            total_steps: total_steps.max(1),
            status: ProgressStatus::Initializing,
            message: None,
            token: token.clone(),
            cancelled: false,
            eta: None,
            heartbeat: None,
        };
        let event = ctx.progress_event(&id);

        {
            let mut contexts = self.inner.contexts.lock();
            if contexts.contains_key(&id) {
                return Err(Error::Validation(format!(
                    "invocation '{}' is already running",
                    id
                )));
            }
            contexts.insert(id.clone(), ctx);
        }

        if let Some(handle) = self.spawn_heartbeat(&id) {
            match self.inner.contexts.lock().get_mut(&id) {
                Some(ctx) => ctx.heartbeat = Some(handle),
                None => handle.abort(),
            }
        }

        debug!(id = %id, total_steps, "Progress context created");
        self.inner.bus.publish(event);

        Ok(ProgressHandle { id, signal: token })
    }

    /// Record progress. No-op for unknown or finished contexts.
    pub fn update(&self, id: &str, step: ProgressStep, message: Option<String>) {
        self.inner.update(id, step, message);
    }

    /// Move a live context to a non-terminal stage
    pub fn set_status(&self, id: &str, status: ProgressStatus, message: Option<String>) {
        if status.is_terminal() {
            debug!(id, %status, "Terminal status must go through complete/fail/cancel");
            return;
        }

        let event = {
            let mut contexts = self.inner.contexts.lock();
            let Some(ctx) = contexts.get_mut(id) else {
                return;
            };
            ctx.status = status;
            if message.is_some() {
                ctx.message = message;
            }
            ctx.progress_event(id)
        };
        self.inner.bus.publish(event);
    }

    /// Finish a context with the command's result
    pub fn complete(&self, id: &str, result: &CommandResult) -> bool {
        let Some(mut ctx) = self.take(id) else {
            return false;
        };

        ctx.status = if result.success {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Failed
        };
        if result.success {
            ctx.current_step = ctx.total_steps;
            ctx.eta = Some(Duration::ZERO);
        }

        let elapsed = ctx.elapsed_ms();
        debug!(id, elapsed_ms = elapsed, success = result.success, "Command completed");
        self.inner.bus.publish(ctx.progress_event(id));
        self.inner.bus.publish(command::completed(
            id,
            &ctx.command_name,
            result.success,
            elapsed,
        ));
        true
    }

    /// Finish a context as failed
    pub fn fail(&self, id: &str, message: &str) -> bool {
        let Some(mut ctx) = self.take(id) else {
            return false;
        };

        ctx.status = ProgressStatus::Failed;
        ctx.message = Some(message.to_string());
        ctx.eta = None;

        let elapsed = ctx.elapsed_ms();
        debug!(id, elapsed_ms = elapsed, error = message, "Command failed");
        self.inner.bus.publish(ctx.progress_event(id));
        self.inner
            .bus
            .publish(command::completed(id, &ctx.command_name, false, elapsed));
        true
    }

    /// Cancel a live context.
    ///
    /// Returns false when the context does not exist or was already
    /// cancelled. Otherwise the context's token fires exactly once.
    pub fn cancel(&self, id: &str, reason: &str) -> bool {
        let mut ctx = {
            let mut contexts = self.inner.contexts.lock();
            match contexts.get(id) {
                None => return false,
                Some(ctx) if ctx.cancelled => return false,
                Some(_) => {}
            }
            let Some(ctx) = contexts.remove(id) else {
                return false;
            };
            ctx
        };

        ctx.cancelled = true;
        ctx.status = ProgressStatus::Cancelled;
        ctx.stop_heartbeat();
        ctx.token.cancel();

        let elapsed = ctx.elapsed_ms();
        info!(id, reason, elapsed_ms = elapsed, "Command cancelled");
        self.inner
            .bus
            .publish(command::cancelled(id, &ctx.command_name, reason, elapsed));
        true
    }

    /// Live contexts, oldest first
    pub fn get_active(&self) -> Vec<ProgressSnapshot> {
        let contexts = self.inner.contexts.lock();
        let mut active: Vec<(Instant, ProgressSnapshot)> = contexts
            .iter()
            .map(|(id, ctx)| (ctx.started, ctx.snapshot(id)))
            .collect();
        active.sort_by_key(|(started, _)| *started);
        active.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.contexts.lock().len()
    }

    /// Cancellation token of a live context
    pub fn signal(&self, id: &str) -> Option<CancellationToken> {
        self.inner.contexts.lock().get(id).map(|ctx| ctx.token.clone())
    }

    /// Handle that lets an invoker report progress for `id`
    pub fn reporter(&self, id: &str) -> ProgressReporter {
        ProgressReporter {
            tracker: Arc::downgrade(&self.inner),
            id: id.to_string(),
        }
    }

    /// Drop every live context and stop all timers
    pub fn shutdown(&self) {
        let drained: Vec<(String, ProgressContext)> =
            self.inner.contexts.lock().drain().collect();
        for (_, mut ctx) in drained {
            ctx.stop_heartbeat();
        }
    }

    fn take(&self, id: &str) -> Option<ProgressContext> {
        let mut ctx = self.inner.contexts.lock().remove(id)?;
        ctx.stop_heartbeat();
        Some(ctx)
    }

    fn spawn_heartbeat(&self, id: &str) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval();
        let threshold = self.inner.config.heartbeat_threshold();
        let id = id.to_string();

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let event = {
                    let contexts = inner.contexts.lock();
                    let Some(ctx) = contexts.get(&id) else {
                        break;
                    };
                    let running = ctx.started.elapsed();
                    if running <= threshold {
                        continue;
                    }
                    command::heartbeat(&id, &ctx.command_name, running.as_millis() as u64)
                };
                inner.bus.publish(event);
            }
        }))
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable progress sink for one invocation
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Weak<TrackerInner>,
    id: String,
}

impl ProgressReporter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn report(&self, step: ProgressStep, message: Option<String>) {
        if let Some(inner) = self.tracker.upgrade() {
            inner.update(&self.id, step, message);
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_foundation::event::{COMMAND_CANCELLED, COMMAND_COMPLETE, HEARTBEAT, PROGRESS};
    use conduit_foundation::{ConduitEvent, EventFilter};

    fn tracker() -> (ProgressTracker, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (ProgressTracker::new(bus.clone(), ProgressConfig::default()), bus)
    }

    fn events_of(bus: &EventBus, event_type: &str) -> Vec<ConduitEvent> {
        bus.search_history(&EventFilter::new().with_event_types(vec![event_type.to_string()]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_emits_initial_progress() {
        let (tracker, bus) = tracker();
        let handle = tracker.create("a", "status", 3).unwrap();

        assert_eq!(handle.id(), "a");
        assert!(!handle.signal().is_cancelled());

        let progress = events_of(&bus, PROGRESS);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].data["progress"], 0.0);
        assert_eq!(progress[0].data["status"], "initializing");
        assert_eq!(tracker.get_active().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_computes_eta() {
        let (tracker, bus) = tracker();
        tracker.create("a", "analyze", 4).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.update("a", ProgressStep::Step(1), Some("indexing".into()));

        let snapshot = &tracker.get_active()[0];
        assert_eq!(snapshot.current_step, 1);
        assert_eq!(snapshot.status, ProgressStatus::Executing);
        assert_eq!(snapshot.estimated_time_remaining_ms, Some(6000));

        let last = events_of(&bus, PROGRESS).pop().unwrap();
        assert_eq!(last.data["progress"], 25.0);
        assert_eq!(last.data["message"], "indexing");
        assert_eq!(last.data["estimatedTimeRemaining"], 6000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_percentage_and_clamping() {
        let (tracker, _bus) = tracker();
        tracker.create("a", "analyze", 4).unwrap();

        tracker.update("a", ProgressStep::Percent(50.0), None);
        assert_eq!(tracker.get_active()[0].current_step, 2);

        tracker.update("a", ProgressStep::Step(10), None);
        assert_eq!(tracker.get_active()[0].current_step, 4);

        tracker.update("a", ProgressStep::Percent(250.0), None);
        assert_eq!(tracker.get_active()[0].current_step, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_unknown_is_noop() {
        let (tracker, bus) = tracker();
        tracker.update("missing", ProgressStep::Step(1), None);
        tracker.set_status("missing", ProgressStatus::Preparing, None);
        assert_eq!(bus.event_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_removes_context() {
        let (tracker, bus) = tracker();
        tracker.create("a", "status", 3).unwrap();

        assert!(tracker.complete("a", &CommandResult::success(vec![])));
        assert_eq!(tracker.active_count(), 0);
        assert!(!tracker.complete("a", &CommandResult::success(vec![])));

        let last_progress = events_of(&bus, PROGRESS).pop().unwrap();
        assert_eq!(last_progress.data["progress"], 100.0);
        assert_eq!(last_progress.data["status"], "completed");

        let done = events_of(&bus, COMMAND_COMPLETE);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data["success"], true);

        let before = bus.event_count();
        tracker.update("a", ProgressStep::Step(1), None);
        assert_eq!(bus.event_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_reports_unsuccessful_completion() {
        let (tracker, bus) = tracker();
        tracker.create("a", "status", 3).unwrap();

        assert!(tracker.fail("a", "exit 2"));

        let done = events_of(&bus, COMMAND_COMPLETE);
        assert_eq!(done[0].data["success"], false);
        let last_progress = events_of(&bus, PROGRESS).pop().unwrap();
        assert_eq!(last_progress.data["status"], "failed");
        assert_eq!(last_progress.data["message"], "exit 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fires_token_once() {
        let (tracker, bus) = tracker();
        let handle = tracker.create("a", "search", 4).unwrap();

        assert!(tracker.cancel("a", "user request"));
        assert!(handle.signal().is_cancelled());
        assert!(!tracker.cancel("a", "again"));
        assert!(!tracker.cancel("missing", "nope"));

        let cancelled = events_of(&bus, COMMAND_CANCELLED);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].data["reason"], "user request");
        assert_eq!(tracker.active_count(), 0);
        assert!(!tracker.fail("a", "late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_threshold() {
        let (tracker, bus) = tracker();
        tracker.create("a", "analyze", 5).unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(events_of(&bus, HEARTBEAT).is_empty());

        tokio::time::sleep(Duration::from_millis(2000)).await;
        let beats = events_of(&bus, HEARTBEAT);
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].data["runningTime"], 6000);

        tracker.complete("a", &CommandResult::success(vec![]));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(events_of(&bus, HEARTBEAT).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_updates_context() {
        let (tracker, _bus) = tracker();
        tracker.create("a", "analyze", 4).unwrap();

        let reporter = tracker.reporter("a");
        reporter.report(ProgressStep::Percent(75.0), Some("almost".into()));

        let snapshot = &tracker.get_active()[0];
        assert_eq!(snapshot.current_step, 3);
        assert_eq!(snapshot.message.as_deref(), Some("almost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_id_cannot_be_reused() {
        let (tracker, bus) = tracker();
        let first = tracker.create("a", "status", 3).unwrap();

        let err = tracker.create("a", "search", 2).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.get_active()[0].command_name, "status");
        assert_eq!(events_of(&bus, PROGRESS).len(), 1);

        // the id is free again once the first context finishes
        assert!(tracker.complete(first.id(), &CommandResult::success(vec![])));
        assert!(tracker.create("a", "search", 2).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_contexts() {
        let (tracker, _bus) = tracker();
        tracker.create("a", "status", 3).unwrap();
        tracker.create("b", "status", 3).unwrap();

        tracker.shutdown();
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.signal("a").is_none());
    }

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(estimate_remaining(Duration::from_secs(3), 0, 4), None);
        assert_eq!(
            estimate_remaining(Duration::from_secs(3), 3, 4),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            estimate_remaining(Duration::from_secs(3), 4, 4),
            Some(Duration::ZERO)
        );
    }
}
