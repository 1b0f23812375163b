//! # conduit-foundation
//!
//! Foundation layer for Conduit:
//! - Error: 에러 분류 (Validation, Protocol, Timeout, Cancellation, Execution)
//! - Config: 통합 설정 (ConduitConfig) 및 JSON 저장소
//! - Event: 동기 이벤트 버스 (progress, completion, cancellation, heartbeat)
//! - Cancel: 여러 취소 신호를 하나로 합치는 CombinedSignal
//! - Util: 캐시 키용 JSON 정규화/해시, 바이트 포맷
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  conduit-cli (Layer3)                                │
//! │         │                                            │
//! │         ▼                                            │
//! │  conduit-exec (Layer2)                               │
//! │  Orchestrator ─ Cache ─ Tracker ─ Monitor ─ Invoker  │
//! │         │                                            │
//! │         ▼                                            │
//! │  conduit-foundation (Layer1)                         │
//! │  Error · Config · EventBus · CombinedSignal · Util   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod storage;
pub mod util;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, ErrorKind, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    CacheConfig, ConduitConfig, MonitorConfig, ParserConfig, ProgressConfig, ToolConfig,
    CONDUIT_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{
    ConduitEvent, EventBus, EventCategory, EventFilter, EventId, EventListener, EventSeverity,
    ListenerId,
};

// ============================================================================
// Cancel (취소 신호)
// ============================================================================
pub use cancel::CombinedSignal;
pub use tokio_util::sync::CancellationToken;
