//! Execution Orchestrator - 명령 실행 조율
//!
//! 캐시, 성능 모니터, 진행률 추적기, invoker를 조합하여 하나의 명령을
//! 실행합니다. 모든 구성 요소는 상속이 아닌 참조로 보유합니다.
//!
//! ## 실행 단계
//!
//! ```text
//! validate → cache check → monitor + tracker → dispatch → finalize
//!                │                                 │
//!                └── hit: 즉시 반환                  ├── success: cache set, complete
//!                                                  └── failure/cancel/timeout: fail
//! ```
//!
//! 어떤 경로로 끝나더라도 모니터 `end`와 추적기 `complete`/`fail`은
//! 정확히 한 번 호출됩니다 (future가 중간에 drop되는 경우 포함).
//!
//! ## 사용 예시
//!
//! ```ignore
//! let orchestrator = ExecutionOrchestrator::new(invoker, &config, bus);
//!
//! let result = orchestrator
//!     .execute("search", &json!({"query": "todo"}), ExecuteOptions::default())
//!     .await?;
//!
//! // 같은 인자로 다시 호출하면 캐시에서 반환
//! let again = orchestrator
//!     .execute("search", &json!({"query": " todo "}), ExecuteOptions::default())
//!     .await?;
//! assert!(again.cached);
//! ```

use crate::cache::{CacheStats, ResultCache};
use crate::command::{
    to_cli_args, validate_args, validate_command, CommandResult, ExecutionMetadata, InvocationId,
};
use crate::invoker::{InvokeOptions, Invoker};
use crate::monitor::{
    MemoryProbe, Outcome, PerfStatistics, PerfWindow, PerformanceMonitor, Recommendation,
};
use crate::progress::{ProgressSnapshot, ProgressStatus, ProgressTracker};
use conduit_foundation::util::normalize_json;
use conduit_foundation::{
    CancellationToken, CombinedSignal, ConduitConfig, Error, EventBus, ProgressConfig, Result,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a cancelled or timed-out invoker gets to wind down on its own
const INVOKER_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Options
// ============================================================================

/// `execute` 옵션
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// 캐시 조회 생략 (성공한 결과는 여전히 저장됨)
    pub skip_cache: bool,

    /// 호출 제한 시간 (없으면 tool 설정의 기본값)
    pub timeout: Option<Duration>,

    /// 외부 취소 신호
    pub cancel: Option<CancellationToken>,

    /// 호출 ID (없으면 새로 생성)
    pub invocation_id: Option<InvocationId>,
}

impl ExecuteOptions {
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_invocation_id(mut self, id: InvocationId) -> Self {
        self.invocation_id = Some(id);
        self
    }
}

// ============================================================================
// Finalizer
// ============================================================================

/// Closes the monitor window and the tracker context exactly once.
///
/// Dropping it unfinished (the `execute` future was dropped) records a
/// failure.
struct Finalizer<'a> {
    monitor: &'a PerformanceMonitor,
    tracker: &'a ProgressTracker,
    id: &'a str,
    window: Option<PerfWindow>,
}

impl Finalizer<'_> {
    fn succeed(mut self, result: &CommandResult) {
        if let Some(window) = self.window.take() {
            self.monitor.end(window, Outcome::Success);
            self.tracker.complete(self.id, result);
        }
    }

    fn fail(mut self, error: &Error) {
        if let Some(window) = self.window.take() {
            self.monitor.end(window, Outcome::Failure);
            self.tracker.fail(self.id, &error.to_string());
        }
    }
}

impl Drop for Finalizer<'_> {
    fn drop(&mut self) {
        if let Some(window) = self.window.take() {
            warn!(id = self.id, "Invocation dropped before completion");
            self.monitor.end(window, Outcome::Failure);
            self.tracker.fail(self.id, "invocation dropped before completion");
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Execution orchestrator
pub struct ExecutionOrchestrator {
    invoker: Arc<dyn Invoker>,
    cache: Arc<ResultCache>,
    tracker: ProgressTracker,
    monitor: PerformanceMonitor,
    progress_config: ProgressConfig,
    default_timeout: Duration,
}

impl ExecutionOrchestrator {
    /// Build all components from `config`. Inside a tokio runtime the cache
    /// sweep starts immediately.
    pub fn new(invoker: Arc<dyn Invoker>, config: &ConduitConfig, bus: Arc<EventBus>) -> Self {
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        if config.cache.enabled && tokio::runtime::Handle::try_current().is_ok() {
            cache.start_sweeper();
        }

        Self {
            invoker,
            cache,
            tracker: ProgressTracker::new(bus, config.progress.clone()),
            monitor: PerformanceMonitor::new(config.monitor.clone()),
            progress_config: config.progress.clone(),
            default_timeout: config.tool.default_timeout(),
        }
    }

    /// Replace the monitor's memory probe
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.monitor = PerformanceMonitor::with_probe(self.monitor.config().clone(), probe);
        self
    }

    /// Run one command
    pub async fn execute(
        &self,
        command: &str,
        args: &Value,
        options: ExecuteOptions,
    ) -> Result<CommandResult> {
        validate_command(command)?;
        validate_args(args)?;

        let normalized = normalize_json(args);

        if !options.skip_cache {
            if let Some(hit) = self.cache.get(command, &normalized) {
                debug!(command, "Serving cached result");
                return Ok(hit);
            }
        }

        let id = options.invocation_id.unwrap_or_default();
        let handle = self
            .tracker
            .create(id.as_str(), command, self.progress_config.steps_for(command))?;
        let window = self.monitor.start(command);
        let finalizer = Finalizer {
            monitor: &self.monitor,
            tracker: &self.tracker,
            id: id.as_str(),
            window: Some(window),
        };

        debug!(id = id.short(), command, "Starting invocation");
        self.tracker.set_status(id.as_str(), ProgressStatus::Preparing, None);

        let signal = CombinedSignal::any_of(options.cancel.into_iter().chain([handle.signal()]));
        if signal.is_cancelled() {
            let error = Error::cancelled(format!("{} cancelled before dispatch", command));
            info!(id = id.short(), command, "Cancelled before dispatch");
            finalizer.fail(&error);
            return Err(error);
        }

        self.tracker.set_status(id.as_str(), ProgressStatus::Executing, None);

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let invoke_options = InvokeOptions::new(timeout)
            .with_cancel(signal.token())
            .with_progress(self.tracker.reporter(id.as_str()));
        let cli_args = to_cli_args(&normalized);

        let started = Instant::now();
        let outcome = self
            .dispatch(command, &cli_args, invoke_options, &signal, timeout)
            .await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut result) if result.success => {
                self.cache.set(command, &normalized, &result, None);
                finalizer.succeed(&result);

                result.cached = false;
                result.cache_info = None;
                result.execution = Some(ExecutionMetadata {
                    invocation_id: id.to_string(),
                    execution_time_ms,
                });
                debug!(id = id.short(), command, execution_time_ms, "Invocation succeeded");
                Ok(result)
            }
            Ok(result) => {
                let error = Error::execution(command, result.failure_message());
                debug!(id = id.short(), command, error = %error, "Invocation failed");
                finalizer.fail(&error);
                Err(error)
            }
            Err(error) => {
                debug!(id = id.short(), command, error = %error, "Invocation aborted");
                finalizer.fail(&error);
                Err(error)
            }
        }
    }

    /// Race the invoker against the combined signal and the deadline.
    ///
    /// The invoker is expected to honor both itself; the race only matters
    /// when it does not, in which case it is dropped after `INVOKER_GRACE`.
    async fn dispatch(
        &self,
        command: &str,
        cli_args: &[String],
        options: InvokeOptions,
        signal: &CombinedSignal,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let invocation = self.invoker.invoke(command, cli_args, options);
        tokio::pin!(invocation);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            result = &mut invocation => result,
            _ = signal.cancelled() => {
                match tokio::time::timeout(INVOKER_GRACE, &mut invocation).await {
                    Ok(Err(e)) if e.is_cancellation() => Err(e),
                    _ => Err(Error::cancelled(format!("{} was cancelled", command))),
                }
            }
            _ = &mut deadline => {
                match tokio::time::timeout(INVOKER_GRACE, &mut invocation).await {
                    Ok(Err(e)) if matches!(e, Error::Timeout(_)) => Err(e),
                    _ => Err(Error::Timeout(format!(
                        "{} exceeded {:.1}s",
                        command,
                        timeout.as_secs_f64()
                    ))),
                }
            }
        }
    }

    /// Cancel a running invocation by id
    pub fn cancel(&self, id: &str, reason: &str) -> bool {
        self.tracker.cancel(id, reason)
    }

    /// Running invocations, oldest first
    pub fn active(&self) -> Vec<ProgressSnapshot> {
        self.tracker.get_active()
    }

    pub fn statistics(&self) -> PerfStatistics {
        self.monitor.get_statistics()
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.monitor.get_optimization_recommendations()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop cached results of `command` (all of them when `args` is `None`)
    pub fn invalidate(&self, command: &str, args: Option<&Value>) -> usize {
        self.cache.invalidate(command, args)
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.tracker.bus()
    }

    pub fn invoker_name(&self) -> &'static str {
        self.invoker.name()
    }

    /// Stop background timers and drop live contexts
    pub fn shutdown(&self) {
        self.cache.shutdown();
        self.tracker.shutdown();
    }
}

impl Drop for ExecutionOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
