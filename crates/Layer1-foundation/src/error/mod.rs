//! Error types for Conduit
//!
//! 실행 서브시스템의 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// 에러 분류 (호출자가 재시도/표시 정책을 결정할 때 사용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Protocol,
    Timeout,
    Cancellation,
    Execution,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Cancellation => "cancellation",
            Self::Execution => "execution",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conduit 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 입력 검증
    // ========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // 프로토콜 (NDJSON 프레이밍)
    // ========================================================================
    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Buffer overflow: {size} buffered bytes exceeds limit of {limit} bytes")]
    BufferOverflow { size: usize, limit: usize },

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Execution failed: {command} - {message}")]
    Execution { command: String, message: String },

    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 에러 분류
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::MessageTooLarge { .. } | Error::BufferOverflow { .. } => ErrorKind::Protocol,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancellation,
            Error::Execution { .. } | Error::Io(_) => ErrorKind::Execution,
            Error::Config(_) => ErrorKind::Config,
            Error::Json(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 취소로 인한 에러인지 확인
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// 프레이밍 프로토콜 위반인지 확인
    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Io(_))
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Cancelled(_) | Error::Timeout(_) | Error::Execution { .. }
        )
    }

    /// 실행 에러 생성 헬퍼
    pub fn execution(command: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Execution {
            command: command.into(),
            message: message.into(),
        }
    }

    /// 취소 에러 생성 헬퍼
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled(reason.into())
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
