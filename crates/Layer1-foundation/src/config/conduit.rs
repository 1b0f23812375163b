//! Conduit Config - 실행 서브시스템 통합 설정
//!
//! 모든 필드는 기본값을 가지므로 설정 파일은 바꾸고 싶은 값만 담으면 됩니다.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// 설정 파일명
pub const CONDUIT_CONFIG_FILE: &str = "config.json";

/// 실행 파일 경로를 덮어쓰는 환경 변수
pub const TOOL_ENV_VAR: &str = "CONDUIT_TOOL";

const MIB: usize = 1024 * 1024;

// ============================================================================
// Conduit Config (통합)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConduitConfig {
    #[serde(default)]
    pub tool: ToolConfig,

    #[serde(default)]
    pub parser: ParserConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl ConduitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드 (프로젝트가 우선)
    pub fn load() -> Result<Self> {
        let mut stores = Vec::new();
        if let Ok(global) = JsonStore::global() {
            stores.push(global);
        }
        if let Ok(project) = JsonStore::current_project() {
            stores.push(project);
        }

        let mut config = Self::load_from(&stores)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// 주어진 저장소들을 순서대로 병합 (뒤쪽이 우선)
    ///
    /// 병합은 JSON 객체 단위로 이루어지므로 프로젝트 설정에 `cache.maxEntries`
    /// 하나만 있어도 글로벌 설정의 나머지 cache 필드는 유지됩니다.
    pub fn load_from(stores: &[JsonStore]) -> Result<Self> {
        let mut merged = Value::Object(Default::default());
        for store in stores {
            if let Some(layer) = store.load_optional::<Value>(CONDUIT_CONFIG_FILE)? {
                merge_json(&mut merged, layer);
            }
        }
        serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", CONDUIT_CONFIG_FILE, e)))
    }

    /// 검증 후 `store`에 저장. 저장된 파일 경로를 반환
    pub fn save_to(&self, store: &JsonStore) -> Result<PathBuf> {
        self.validate()?;
        store.save(CONDUIT_CONFIG_FILE, self)?;
        Ok(store.file_path(CONDUIT_CONFIG_FILE))
    }

    /// 환경 변수 오버라이드
    pub fn apply_env(&mut self) {
        if let Ok(program) = std::env::var(TOOL_ENV_VAR) {
            if !program.trim().is_empty() {
                self.tool.program = program.trim().to_string();
            }
        }
    }

    /// 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.tool.program.trim().is_empty() {
            return Err(Error::Config("tool.program must not be empty".into()));
        }
        if self.tool.default_timeout_secs == 0 {
            return Err(Error::Config("tool.defaultTimeoutSecs must be greater than zero".into()));
        }
        if self.parser.max_message_bytes == 0 || self.parser.max_buffer_bytes == 0 {
            return Err(Error::Config("parser limits must be greater than zero".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::Config("cache.maxEntries must be greater than zero".into()));
        }
        if self.monitor.heavy_threshold_ms < self.monitor.light_threshold_ms {
            return Err(Error::Config(
                "monitor.heavyThresholdMs must be >= monitor.lightThresholdMs".into(),
            ));
        }
        if self.monitor.memory_critical_bytes < self.monitor.memory_warn_bytes {
            return Err(Error::Config(
                "monitor.memoryCriticalBytes must be >= monitor.memoryWarnBytes".into(),
            ));
        }
        Ok(())
    }
}

/// `overlay`의 값을 `base`에 재귀적으로 덮어쓴다
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ============================================================================
// Tool (외부 CLI)
// ============================================================================

/// 래핑 대상 외부 CLI 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    /// 실행 파일 (PATH 검색)
    #[serde(default = "default_program")]
    pub program: String,

    /// 모든 호출 앞에 붙는 인자
    #[serde(default)]
    pub base_args: Vec<String>,

    /// 작업 디렉토리
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// 추가 환경 변수
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// 기본 타임아웃 (초)
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// stderr 수집 상한 (bytes)
    #[serde(default = "default_stderr_limit")]
    pub stderr_limit_bytes: usize,
}

impl ToolConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            base_args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            default_timeout_secs: default_timeout_secs(),
            stderr_limit_bytes: default_stderr_limit(),
        }
    }
}

fn default_program() -> String {
    "conduit-tool".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_stderr_limit() -> usize {
    64 * 1024
}

// ============================================================================
// Parser (NDJSON 프레이밍)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserConfig {
    /// 메시지 하나의 최대 크기
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// 미완성 조각을 포함한 누적 버퍼 최대 크기
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// 한 번에 읽는 청크 크기
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            max_buffer_bytes: default_max_buffer_bytes(),
            read_chunk_bytes: default_read_chunk_bytes(),
        }
    }
}

fn default_max_message_bytes() -> usize {
    MIB
}

fn default_max_buffer_bytes() -> usize {
    MIB
}

fn default_read_chunk_bytes() -> usize {
    8 * 1024
}

// ============================================================================
// Cache (결과 캐시)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// 결과 하나의 최대 직렬화 크기
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,

    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// 만료 항목 정리 주기
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// 캐시 가능한 명령 목록 (읽기 전용 명령만)
    #[serde(default = "default_cacheable_commands")]
    pub cacheable_commands: Vec<String>,

    /// 명령별 TTL (초)
    #[serde(default = "default_command_ttls")]
    pub command_ttls: BTreeMap<String, u64>,
}

impl CacheConfig {
    pub fn is_cacheable(&self, command: &str) -> bool {
        self.cacheable_commands.iter().any(|c| c == command)
    }

    /// 명령별 TTL, 없으면 기본값
    pub fn ttl_for(&self, command: &str) -> Duration {
        Duration::from_secs(
            self.command_ttls
                .get(command)
                .copied()
                .unwrap_or(self.default_ttl_secs),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            max_result_bytes: default_max_result_bytes(),
            default_ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cacheable_commands: default_cacheable_commands(),
            command_ttls: default_command_ttls(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    100
}

fn default_max_result_bytes() -> usize {
    MIB
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_cacheable_commands() -> Vec<String> {
    [
        "version", "help", "status", "info", "list", "search", "analyze", "explain",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_command_ttls() -> BTreeMap<String, u64> {
    [
        ("version", 3600),
        ("help", 3600),
        ("status", 30),
        ("info", 600),
        ("list", 120),
        ("search", 300),
        ("analyze", 600),
        ("explain", 900),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), *v))
    .collect()
}

// ============================================================================
// Progress (진행 추적)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressConfig {
    /// heartbeat 타이머 주기
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// 이 시간을 넘겨 실행 중이면 heartbeat 발행
    #[serde(default = "default_heartbeat_threshold_ms")]
    pub heartbeat_threshold_ms: u64,

    #[serde(default = "default_steps")]
    pub default_steps: u32,

    /// 명령별 예상 단계 수
    #[serde(default = "default_step_estimates")]
    pub step_estimates: BTreeMap<String, u32>,
}

impl ProgressConfig {
    pub fn steps_for(&self, command: &str) -> u32 {
        self.step_estimates
            .get(command)
            .copied()
            .unwrap_or(self.default_steps)
            .max(1)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_threshold_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_threshold_ms: default_heartbeat_threshold_ms(),
            default_steps: default_steps(),
            step_estimates: default_step_estimates(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_threshold_ms() -> u64 {
    5000
}

fn default_steps() -> u32 {
    3
}

fn default_step_estimates() -> BTreeMap<String, u32> {
    [("analyze", 5), ("search", 4), ("explain", 4), ("build", 6), ("test", 6)]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

// ============================================================================
// Monitor (성능 모니터)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// 측정 히스토리 보관 개수
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// 이 시간을 넘기면 medium 경고
    #[serde(default = "default_light_threshold_ms")]
    pub light_threshold_ms: u64,

    /// 이 시간을 넘기면 high 경고
    #[serde(default = "default_heavy_threshold_ms")]
    pub heavy_threshold_ms: u64,

    /// 메모리 증가량 경고 (medium)
    #[serde(default = "default_memory_warn_bytes")]
    pub memory_warn_bytes: u64,

    /// 메모리 증가량 경고 (high)
    #[serde(default = "default_memory_critical_bytes")]
    pub memory_critical_bytes: u64,

    /// 기준점이 없을 때 절대 RSS 경고
    #[serde(default = "default_absolute_rss_bytes")]
    pub absolute_rss_bytes: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            light_threshold_ms: default_light_threshold_ms(),
            heavy_threshold_ms: default_heavy_threshold_ms(),
            memory_warn_bytes: default_memory_warn_bytes(),
            memory_critical_bytes: default_memory_critical_bytes(),
            absolute_rss_bytes: default_absolute_rss_bytes(),
        }
    }
}

fn default_history_size() -> usize {
    100
}

fn default_light_threshold_ms() -> u64 {
    2_000
}

fn default_heavy_threshold_ms() -> u64 {
    10_000
}

fn default_memory_warn_bytes() -> u64 {
    50 * MIB as u64
}

fn default_memory_critical_bytes() -> u64 {
    100 * MIB as u64
}

fn default_absolute_rss_bytes() -> u64 {
    512 * MIB as u64
}
