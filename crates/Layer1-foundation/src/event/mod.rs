//! Event System - 이벤트 발행/구독 시스템
//!
//! 명령 실행 중 발생하는 진행/완료/취소/heartbeat 이벤트를 전달합니다.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventBus                              │
//! │  publish(event) ─┬──────────────┬──────────────┐            │
//! │                  ▼              ▼              ▼            │
//! │           Listener 1     Listener 2     broadcast::Receiver │
//! │           (CLI output)   (metrics)      (async stream)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, EventListener, ListenerId, DEFAULT_HISTORY};

pub use types::{
    command, ConduitEvent, EventCategory, EventId, EventSeverity, COMMAND_CANCELLED,
    COMMAND_COMPLETE, HEARTBEAT, PROGRESS,
};
