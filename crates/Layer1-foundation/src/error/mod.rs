//! Error types for labterm
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// labterm 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 명령어 검증
    // ========================================================================
    #[error("Command rejected: {reason}")]
    ValidationRejected { reason: String },

    // ========================================================================
    // 컨테이너 / 세션 수명주기
    // ========================================================================
    #[error("Provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("Attach failed: {0}")]
    AttachFailed(String),

    #[error("Command timed out after {timeout_secs}s: {command}")]
    ExecutionTimeout { command: String, timeout_secs: u64 },

    #[error("Teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    // ========================================================================
    // 세션 레지스트리
    // ========================================================================
    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Owner identity is missing")]
    OwnerMissing,

    // ========================================================================
    // Job 시스템
    // ========================================================================
    #[error("Job error: {0}")]
    Job(String),

    #[error("Job queue is closed")]
    QueueClosed,

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EngineUnavailable(_)
                | Error::ProvisionFailed(_)
                | Error::AttachFailed(_)
                | Error::Timeout(_)
                | Error::Job(_)
                | Error::Io(_)
        )
    }

    /// 재시도해도 결과가 바뀌지 않는 에러
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ValidationRejected { .. } | Error::Unauthorized(_) | Error::OwnerMissing
        )
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::ValidationRejected { .. }
                | Error::ProvisionFailed(_)
                | Error::AttachFailed(_)
                | Error::ExecutionTimeout { .. }
                | Error::EngineUnavailable(_)
                | Error::SessionExists(_)
                | Error::SessionNotFound(_)
                | Error::SessionClosed(_)
                | Error::Unauthorized(_)
                | Error::OwnerMissing
                | Error::InvalidInput(_)
                | Error::Cancelled
        )
    }

    /// Short machine-readable tag used in error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::ValidationRejected { .. } => "validation_rejected",
            Error::ProvisionFailed(_) => "provision_failed",
            Error::AttachFailed(_) => "attach_failed",
            Error::ExecutionTimeout { .. } => "execution_timeout",
            Error::TeardownFailed(_) => "teardown_failed",
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::ContainerNotFound(_) => "container_not_found",
            Error::SessionExists(_) => "session_exists",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionClosed(_) => "session_closed",
            Error::Unauthorized(_) => "unauthorized",
            Error::OwnerMissing => "owner_missing",
            Error::Job(_) => "job",
            Error::QueueClosed => "queue_closed",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Toml(_) => "toml",
            Error::Internal(_) => "internal",
        }
    }

    /// 검증 거부 에러 생성 헬퍼
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::ValidationRejected {
            reason: reason.into(),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_terminal_not_retryable() {
        let err = Error::rejected("matches deny pattern");
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
        assert!(err.is_user_facing());
        assert_eq!(err.kind(), "validation_rejected");
    }

    #[test]
    fn test_engine_errors_are_retryable() {
        assert!(Error::EngineUnavailable("socket".into()).is_retryable());
        assert!(Error::ProvisionFailed("pull".into()).is_retryable());
        assert!(!Error::TeardownFailed("gone".into()).is_user_facing());
    }

    #[test]
    fn test_display() {
        let err = Error::ExecutionTimeout {
            command: "sleep 120".into(),
            timeout_secs: 30,
        };
        assert_eq!(err.to_string(), "Command timed out after 30s: sleep 120");
    }
}
