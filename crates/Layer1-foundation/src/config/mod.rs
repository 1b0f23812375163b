//! Config - 통합 설정 관리
//!
//! - `conduit.rs` - ConduitConfig 및 섹션별 설정 (tool, parser, cache, progress, monitor)

mod conduit;

pub use conduit::{
    CacheConfig, ConduitConfig, MonitorConfig, ParserConfig, ProgressConfig, ToolConfig,
    CONDUIT_CONFIG_FILE, TOOL_ENV_VAR,
};
