//! Performance Monitor - 명령별 실행 시간/메모리 측정
//!
//! 측정 창(window)을 열고 닫으며 실행 시간과 RSS 변화량을 기록합니다.
//!
//! ## 기능
//! - 느린 실행 경고 (light 임계값 → medium, heavy 임계값 → high)
//! - 메모리 증가량 경고, 기준점이 없으면 절대 RSS 경고
//! - 제한된 크기의 측정 히스토리와 집계 통계
//! - 히스토리 기반 최적화 권장 사항
//!
//! ## 플랫폼 지원
//! - Linux: /proc/self/statm
//! - 그 외: 메모리 측정 없음 (시간 측정만)

use chrono::{DateTime, Utc};
use conduit_foundation::util::{format_bytes, format_bytes_delta};
use conduit_foundation::MonitorConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 성공률이 이 값보다 낮으면 안정성 권장
const RELIABILITY_THRESHOLD: f64 = 0.95;

/// 메모리 권장 판단에 쓰는 최근 측정 개수
const RECENT_WINDOW: usize = 20;

/// 최근 측정에서 이 개수를 넘는 메모리/high 경고가 있으면 메모리 권장
const RECENT_WARNING_LIMIT: usize = 3;

// ============================================================================
// Memory Probe
// ============================================================================

/// 현재 프로세스 RSS 측정
pub trait MemoryProbe: Send + Sync {
    fn rss_bytes(&self) -> Option<u64>;
}

/// 운영체제에서 직접 읽는 기본 구현
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    #[cfg(target_os = "linux")]
    fn rss_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * page_size())
    }

    #[cfg(not(target_os = "linux"))]
    fn rss_bytes(&self) -> Option<u64> {
        None
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf only reads a system constant
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

// ============================================================================
// Types
// ============================================================================

/// 열린 측정 창. `end`에 넘기면 소비되므로 창마다 정확히 한 번 종료됩니다.
#[derive(Debug)]
pub struct PerfWindow {
    id: u64,
    command_name: String,
    started: Instant,
    start_rss: Option<u64>,
}

impl PerfWindow {
    pub fn command_name(&self) -> &str {
        &self.command_name
    }
}

/// 실행 결과 (명시적 실패가 아니면 성공)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl<T, E> From<&Result<T, E>> for Outcome {
    fn from(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Slow,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfWarning {
    pub kind: WarningKind,
    pub severity: Severity,
    pub message: String,
}

/// 종료된 측정
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfMetrics {
    pub command_name: String,
    pub execution_time_ms: u64,
    pub memory_delta: Option<i64>,
    pub rss_bytes: Option<u64>,
    pub success: bool,
    pub warnings: Vec<PerfWarning>,
    pub timestamp: DateTime<Utc>,
}

/// 명령별 집계
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStats {
    pub count: usize,
    pub avg_time_ms: f64,
    pub max_time_ms: u64,
    pub success_rate: f64,
}

/// 전체 집계
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfStatistics {
    pub total: usize,
    pub active: usize,
    pub avg_time_ms: f64,
    pub min_time_ms: u64,
    pub max_time_ms: u64,
    pub success_rate: f64,
    pub by_command: BTreeMap<String, CommandStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Caching,
    Reliability,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Severity,
    pub message: String,
}

// ============================================================================
// Monitor
// ============================================================================

/// 성능 모니터
pub struct PerformanceMonitor {
    config: MonitorConfig,
    probe: Arc<dyn MemoryProbe>,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, String>>,
    history: Mutex<VecDeque<PerfMetrics>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_probe(config, Arc::new(ProcessMemoryProbe))
    }

    pub fn with_probe(config: MonitorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// 측정 시작
    pub fn start(&self, command_name: &str) -> PerfWindow {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(id, command_name.to_string());

        PerfWindow {
            id,
            command_name: command_name.to_string(),
            started: Instant::now(),
            start_rss: self.probe.rss_bytes(),
        }
    }

    /// 측정 종료
    pub fn end(&self, window: PerfWindow, outcome: Outcome) -> PerfMetrics {
        let elapsed_ms = window.started.elapsed().as_millis() as u64;
        let end_rss = self.probe.rss_bytes();
        let memory_delta = match (window.start_rss, end_rss) {
            (Some(start), Some(end)) => Some(end as i64 - start as i64),
            _ => None,
        };

        self.active.lock().remove(&window.id);

        let warnings = self.evaluate(elapsed_ms, memory_delta, end_rss);
        for warning in &warnings {
            warn!(
                command = %window.command_name,
                severity = ?warning.severity,
                "{}", warning.message
            );
        }

        let metrics = PerfMetrics {
            command_name: window.command_name,
            execution_time_ms: elapsed_ms,
            memory_delta,
            rss_bytes: end_rss,
            success: outcome == Outcome::Success,
            warnings,
            timestamp: Utc::now(),
        };

        debug!(
            command = %metrics.command_name,
            elapsed_ms,
            success = metrics.success,
            "Performance window closed"
        );

        let mut history = self.history.lock();
        history.push_back(metrics.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }

        metrics
    }

    fn evaluate(
        &self,
        elapsed_ms: u64,
        memory_delta: Option<i64>,
        rss: Option<u64>,
    ) -> Vec<PerfWarning> {
        let mut warnings = Vec::new();

        if elapsed_ms > self.config.heavy_threshold_ms {
            warnings.push(PerfWarning {
                kind: WarningKind::Slow,
                severity: Severity::High,
                message: format!(
                    "Execution took {}ms (heavy threshold {}ms)",
                    elapsed_ms, self.config.heavy_threshold_ms
                ),
            });
        } else if elapsed_ms > self.config.light_threshold_ms {
            warnings.push(PerfWarning {
                kind: WarningKind::Slow,
                severity: Severity::Medium,
                message: format!(
                    "Execution took {}ms (light threshold {}ms)",
                    elapsed_ms, self.config.light_threshold_ms
                ),
            });
        }

        match (memory_delta, rss) {
            (Some(delta), _) if delta > 0 && delta as u64 > self.config.memory_warn_bytes => {
                let severity = if delta as u64 > self.config.memory_critical_bytes {
                    Severity::High
                } else {
                    Severity::Medium
                };
                warnings.push(PerfWarning {
                    kind: WarningKind::Memory,
                    severity,
                    message: format!("Memory grew by {}", format_bytes_delta(delta)),
                });
            }
            (None, Some(rss)) if rss > self.config.absolute_rss_bytes => {
                warnings.push(PerfWarning {
                    kind: WarningKind::Memory,
                    severity: Severity::High,
                    message: format!("Resident memory at {}", format_bytes(rss)),
                });
            }
            _ => {}
        }

        warnings
    }

    /// 집계 통계
    pub fn get_statistics(&self) -> PerfStatistics {
        let active = self.active.lock().len();
        let history = self.history.lock();
        if history.is_empty() {
            return PerfStatistics {
                active,
                ..Default::default()
            };
        }

        let total = history.len();
        let times: Vec<u64> = history.iter().map(|m| m.execution_time_ms).collect();
        let successes = history.iter().filter(|m| m.success).count();

        let mut grouped: BTreeMap<String, Vec<&PerfMetrics>> = BTreeMap::new();
        for metrics in history.iter() {
            grouped
                .entry(metrics.command_name.clone())
                .or_default()
                .push(metrics);
        }
        let by_command = grouped
            .into_iter()
            .map(|(name, runs)| {
                let count = runs.len();
                let sum: u64 = runs.iter().map(|m| m.execution_time_ms).sum();
                let ok = runs.iter().filter(|m| m.success).count();
                let stats = CommandStats {
                    count,
                    avg_time_ms: sum as f64 / count as f64,
                    max_time_ms: runs.iter().map(|m| m.execution_time_ms).max().unwrap_or(0),
                    success_rate: ok as f64 / count as f64,
                };
                (name, stats)
            })
            .collect();

        PerfStatistics {
            total,
            active,
            avg_time_ms: times.iter().sum::<u64>() as f64 / total as f64,
            min_time_ms: times.iter().copied().min().unwrap_or(0),
            max_time_ms: times.iter().copied().max().unwrap_or(0),
            success_rate: successes as f64 / total as f64,
            by_command,
        }
    }

    /// 히스토리 기반 최적화 권장 사항
    pub fn get_optimization_recommendations(&self) -> Vec<Recommendation> {
        let stats = self.get_statistics();
        let mut recommendations = Vec::new();
        if stats.total == 0 {
            return recommendations;
        }

        if stats.avg_time_ms > self.config.light_threshold_ms as f64 {
            let slowest = stats
                .by_command
                .iter()
                .max_by(|a, b| a.1.avg_time_ms.total_cmp(&b.1.avg_time_ms))
                .map(|(name, _)| name.as_str())
                .unwrap_or("unknown");
            let priority = if stats.avg_time_ms > self.config.heavy_threshold_ms as f64 {
                Severity::High
            } else {
                Severity::Medium
            };
            recommendations.push(Recommendation {
                kind: RecommendationKind::Caching,
                priority,
                message: format!(
                    "Average execution time is {:.0}ms; enable caching for slow commands such as '{}'",
                    stats.avg_time_ms, slowest
                ),
            });
        }

        if stats.success_rate < RELIABILITY_THRESHOLD {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Reliability,
                priority: Severity::High,
                message: format!(
                    "Success rate is {:.1}%; check tool installation and command arguments",
                    stats.success_rate * 100.0
                ),
            });
        }

        let recent_warnings = {
            let history = self.history.lock();
            history
                .iter()
                .rev()
                .take(RECENT_WINDOW)
                .flat_map(|m| m.warnings.iter())
                .filter(|w| w.kind == WarningKind::Memory || w.severity == Severity::High)
                .count()
        };
        if recent_warnings > RECENT_WARNING_LIMIT {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Memory,
                priority: Severity::High,
                message: format!(
                    "{} memory or high-severity warnings in the last {} runs; reduce result sizes or cache entries",
                    recent_warnings, RECENT_WINDOW
                ),
            });
        }

        recommendations
    }

    /// 최근 측정 (최신순)
    pub fn history(&self, limit: Option<usize>) -> Vec<PerfMetrics> {
        let history = self.history.lock();
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// 한 줄 요약
    pub fn summary_report(&self) -> String {
        let stats = self.get_statistics();
        let rss = self
            .probe
            .rss_bytes()
            .map(format_bytes)
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "Runs {}: Avg {:.0}ms, Min {}ms, Max {}ms, Success {:.1}%, Active {}, RSS {}",
            stats.total,
            stats.avg_time_ms,
            stats.min_time_ms,
            stats.max_time_ms,
            stats.success_rate * 100.0,
            stats.active,
            rss
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    /// 미리 정한 값을 순서대로 돌려주는 probe
    struct ScriptedProbe {
        values: Mutex<VecDeque<Option<u64>>>,
    }

    impl ScriptedProbe {
        fn new(values: &[Option<u64>]) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(values.iter().copied().collect()),
            })
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn rss_bytes(&self) -> Option<u64> {
            self.values.lock().pop_front().flatten()
        }
    }

    fn monitor(values: &[Option<u64>]) -> PerformanceMonitor {
        PerformanceMonitor::with_probe(MonitorConfig::default(), ScriptedProbe::new(values))
    }

    async fn run(
        monitor: &PerformanceMonitor,
        command: &str,
        ms: u64,
        outcome: Outcome,
    ) -> PerfMetrics {
        let window = monitor.start(command);
        tokio::time::advance(Duration::from_millis(ms)).await;
        monitor.end(window, outcome)
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_measures_time_and_memory() {
        let monitor = monitor(&[Some(100 * MIB), Some(110 * MIB)]);

        let window = monitor.start("status");
        assert_eq!(monitor.get_statistics().active, 1);

        tokio::time::advance(Duration::from_millis(250)).await;
        let metrics = monitor.end(window, Outcome::Success);

        assert_eq!(metrics.execution_time_ms, 250);
        assert_eq!(metrics.memory_delta, Some(10 * MIB as i64));
        assert!(metrics.success);
        assert!(metrics.warnings.is_empty());
        assert_eq!(monitor.get_statistics().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_warnings() {
        let monitor = monitor(&[]);

        let medium = run(&monitor, "search", 3_000, Outcome::Success).await;
        assert_eq!(medium.warnings.len(), 1);
        assert_eq!(medium.warnings[0].kind, WarningKind::Slow);
        assert_eq!(medium.warnings[0].severity, Severity::Medium);

        let high = run(&monitor, "search", 11_000, Outcome::Success).await;
        assert_eq!(high.warnings[0].severity, Severity::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_warnings() {
        let monitor = monitor(&[
            Some(0),
            Some(60 * MIB),
            Some(0),
            Some(150 * MIB),
            None,
            Some(600 * MIB),
        ]);

        let medium = run(&monitor, "analyze", 10, Outcome::Success).await;
        assert_eq!(medium.warnings[0].kind, WarningKind::Memory);
        assert_eq!(medium.warnings[0].severity, Severity::Medium);

        let high = run(&monitor, "analyze", 10, Outcome::Success).await;
        assert_eq!(high.warnings[0].severity, Severity::High);

        // no baseline: absolute RSS check
        let absolute = run(&monitor, "analyze", 10, Outcome::Success).await;
        assert_eq!(absolute.memory_delta, None);
        assert_eq!(absolute.warnings[0].kind, WarningKind::Memory);
        assert_eq!(absolute.warnings[0].severity, Severity::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_capped() {
        let monitor = PerformanceMonitor::with_probe(
            MonitorConfig {
                history_size: 3,
                ..Default::default()
            },
            ScriptedProbe::new(&[]),
        );
        for i in 0..5 {
            run(&monitor, &format!("cmd{}", i), 1, Outcome::Success).await;
        }

        let history = monitor.history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].command_name, "cmd4");
        assert_eq!(history[2].command_name, "cmd2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics() {
        let monitor = monitor(&[]);
        run(&monitor, "status", 100, Outcome::Success).await;
        run(&monitor, "status", 300, Outcome::Failure).await;
        run(&monitor, "list", 200, Outcome::Success).await;

        let stats = monitor.get_statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.avg_time_ms, 200.0);
        assert_eq!(stats.min_time_ms, 100);
        assert_eq!(stats.max_time_ms, 300);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);

        let status = &stats.by_command["status"];
        assert_eq!(status.count, 2);
        assert_eq!(status.avg_time_ms, 200.0);
        assert_eq!(status.success_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recommendations() {
        let monitor = monitor(&[]);
        assert!(monitor.get_optimization_recommendations().is_empty());

        run(&monitor, "analyze", 3_000, Outcome::Success).await;
        run(&monitor, "analyze", 3_000, Outcome::Failure).await;

        let kinds: Vec<RecommendationKind> = monitor
            .get_optimization_recommendations()
            .into_iter()
            .map(|r| r.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![RecommendationKind::Caching, RecommendationKind::Reliability]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_recommendation_after_repeated_warnings() {
        let monitor = monitor(&[]);
        for _ in 0..4 {
            run(&monitor, "build", 11_000, Outcome::Success).await;
        }

        let recommendations = monitor.get_optimization_recommendations();
        assert!(recommendations
            .iter()
            .any(|r| r.kind == RecommendationKind::Memory));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Result<(), ()> = Ok(());
        let err: Result<(), ()> = Err(());
        assert_eq!(Outcome::from(&ok), Outcome::Success);
        assert_eq!(Outcome::from(&err), Outcome::Failure);
    }
}
