//! Event Types - 클라이언트로 전달되는 이벤트 정의
//!
//! 세션 출력, 상태 변화, 대역 외 실행 결과를 같은 구조로 전달합니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Event ID
// ============================================================================

/// 이벤트 고유 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
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
    /// 터미널 출력
    Output,
    /// 세션 수명주기
    Session,
    /// 대역 외 실행
    Execution,
    /// 에러
    Error,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Session => "session",
            Self::Execution => "execution",
            Self::Error => "error",
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Outcome of one out-of-band command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i64,
    /// Wall-clock seconds
    pub execution_time: f64,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Exit status reported for a command killed by its timeout
    pub const TIMEOUT_EXIT_STATUS: i64 = 124;

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_status == 0
    }
}

/// Wire payload delivered to clients, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Subscribed {
        session_id: String,
        resumed: bool,
    },
    Output {
        output: String,
    },
    Status {
        session_id: String,
        state: String,
    },
    Error {
        message: String,
        kind: String,
    },
    CommandAcknowledged {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        job_id: String,
    },
    ExecutionCompleted {
        job_id: String,
        result: ExecutionResult,
    },
    ExecutionError {
        job_id: String,
        error: String,
    },
    ProbeResult {
        probe: String,
        passed: bool,
        detail: String,
    },
}

impl ServerEvent {
    pub fn output(output: impl Into<String>) -> Self {
        Self::Output {
            output: output.into(),
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            kind: kind.into(),
        }
    }

    pub fn from_error(err: &crate::Error) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Self::Output { .. } => EventCategory::Output,
            Self::Subscribed { .. } | Self::Status { .. } => EventCategory::Session,
            Self::CommandAcknowledged { .. }
            | Self::ExecutionCompleted { .. }
            | Self::ProbeResult { .. } => EventCategory::Execution,
            Self::Error { .. } | Self::ExecutionError { .. } => EventCategory::Error,
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

/// Stream names on the bus
pub mod streams {
    /// Output/status/errors of one interactive session
    pub fn terminal(session_id: &str) -> String {
        format!("terminal:{}", session_id)
    }

    /// Out-of-band acknowledgements and results for one owner
    pub fn owner(owner_id: &str) -> String {
        format!("owner:{}", owner_id)
    }
}

// ============================================================================
// LabEvent - 버스 봉투
// ============================================================================

/// Envelope carried on the [`EventBus`](super::EventBus)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabEvent {
    pub id: EventId,

    /// e.g. `terminal:<session_id>` or `owner:<owner_id>`
    pub stream: String,

    pub category: EventCategory,

    pub timestamp: DateTime<Utc>,

    pub payload: ServerEvent,
}

impl LabEvent {
    pub fn new(stream: impl Into<String>, payload: ServerEvent) -> Self {
        Self {
            id: EventId::new(),
            stream: stream.into(),
            category: payload.category(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        let json = serde_json::to_value(ServerEvent::output("hi\r\n")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "output", "output": "hi\r\n"}));

        let ack = ServerEvent::CommandAcknowledged {
            command: "ls".into(),
            session_id: None,
            job_id: "j1".into(),
        };
        let json = serde_json::to_value(ack).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "command_acknowledged", "command": "ls", "job_id": "j1"})
        );
    }

    #[test]
    fn test_execution_result_shape() {
        let event = ServerEvent::ExecutionCompleted {
            job_id: "j".into(),
            result: ExecutionResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_status: ExecutionResult::TIMEOUT_EXIT_STATUS,
                execution_time: 30.0,
                timed_out: true,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_completed");
        assert_eq!(json["result"]["timed_out"], true);
        assert_eq!(json["result"]["exit_status"], 124);
    }

    #[test]
    fn test_category_and_streams() {
        assert_eq!(ServerEvent::output("x").category(), EventCategory::Output);
        assert_eq!(
            ServerEvent::error("provision_failed", "boom").category(),
            EventCategory::Error
        );
        assert_eq!(streams::terminal("abc"), "terminal:abc");
        assert_eq!(streams::owner("42"), "owner:42");

        let event = LabEvent::new(streams::owner("42"), ServerEvent::output("x"));
        assert_eq!(event.category, EventCategory::Output);
    }
}
