//! Event Types - 실행 서브시스템에서 사용되는 이벤트 타입 정의
//!
//! 진행 상황, 완료, 취소, heartbeat 이벤트를 정의합니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event ID
// ============================================================================

/// 이벤트 고유 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// 새 이벤트 ID 생성
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Category
// ============================================================================

/// 이벤트 카테고리
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// progress, heartbeat
    Progress,
    /// 완료, 취소
    Command,
}

// ============================================================================
// Event Severity
// ============================================================================

/// 이벤트 심각도
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

// ============================================================================
// ConduitEvent - 핵심 이벤트 타입
// ============================================================================

/// Conduit 시스템 이벤트
///
/// `data`는 외부 소비자를 위한 camelCase JSON 페이로드입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitEvent {
    /// 이벤트 ID
    pub id: EventId,

    /// 이벤트 타입 (예: "progress", "command.complete")
    pub event_type: String,

    /// 이벤트 카테고리
    pub category: EventCategory,

    /// 심각도
    pub severity: EventSeverity,

    /// 이벤트 발생 시간
    pub timestamp: DateTime<Utc>,

    /// 이벤트 소스 (모듈)
    pub source: String,

    /// 이벤트 데이터
    pub data: Value,
}

impl ConduitEvent {
    /// 새 이벤트 생성
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            category,
            severity: EventSeverity::Info,
            timestamp: Utc::now(),
            source: String::new(),
            data: Value::Null,
        }
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// `data`에서 invocation id 조회
    pub fn invocation_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

// ============================================================================
// 사전 정의된 이벤트 타입들
// ============================================================================

pub const PROGRESS: &str = "progress";
pub const COMMAND_COMPLETE: &str = "command.complete";
pub const COMMAND_CANCELLED: &str = "command.cancelled";
pub const HEARTBEAT: &str = "heartbeat";

/// 명령 실행 이벤트
pub mod command {
    use super::*;

    /// 진행 상황 이벤트
    pub fn progress(
        id: &str,
        command_name: &str,
        progress: f64,
        status: &str,
        message: Option<&str>,
        estimated_time_remaining_ms: Option<u64>,
    ) -> ConduitEvent {
        ConduitEvent::new(PROGRESS, EventCategory::Progress)
            .with_source("progress")
            .with_data(serde_json::json!({
                "id": id,
                "commandName": command_name,
                "progress": progress,
                "status": status,
                "message": message,
                "estimatedTimeRemaining": estimated_time_remaining_ms,
            }))
    }

    /// 명령 완료 이벤트 (성공/실패 모두)
    pub fn completed(
        id: &str,
        command_name: &str,
        success: bool,
        execution_time_ms: u64,
    ) -> ConduitEvent {
        let severity = if success {
            EventSeverity::Info
        } else {
            EventSeverity::Error
        };
        ConduitEvent::new(COMMAND_COMPLETE, EventCategory::Command)
            .with_severity(severity)
            .with_source("progress")
            .with_data(serde_json::json!({
                "id": id,
                "commandName": command_name,
                "success": success,
                "executionTime": execution_time_ms,
            }))
    }

    /// 명령 취소 이벤트
    pub fn cancelled(
        id: &str,
        command_name: &str,
        reason: &str,
        execution_time_ms: u64,
    ) -> ConduitEvent {
        ConduitEvent::new(COMMAND_CANCELLED, EventCategory::Command)
            .with_severity(EventSeverity::Warning)
            .with_source("progress")
            .with_data(serde_json::json!({
                "id": id,
                "commandName": command_name,
                "reason": reason,
                "executionTime": execution_time_ms,
            }))
    }

    /// 장시간 실행 heartbeat
    pub fn heartbeat(id: &str, command_name: &str, running_time_ms: u64) -> ConduitEvent {
        ConduitEvent::new(HEARTBEAT, EventCategory::Progress)
            .with_severity(EventSeverity::Debug)
            .with_source("progress")
            .with_data(serde_json::json!({
                "id": id,
                "commandName": command_name,
                "runningTime": running_time_ms,
            }))
    }
}

// ============================================================================
// 테스트
// ============================================================================
