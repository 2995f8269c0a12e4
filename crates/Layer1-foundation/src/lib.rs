//! # labterm-foundation
//!
//! Foundation layer for labterm:
//! - Error: 에러 분류 (ValidationRejected, ProvisionFailed, AttachFailed ...)
//! - Config: 통합 설정 (EngineConfig, 모드별 프로파일)
//! - Policy: 명령어 안전성 검증 (허용 목록 + 공유 금지 패턴)
//! - Event: 스트림 단위 이벤트 버스
//! - Storage: TOML/JSON 설정 파일
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Layer3 server (WebSocket / HTTP)                        │
//! │                     │                                    │
//! │                     ▼                                    │
//! │  Layer2 session engine                                   │
//! │  (Provisioner, Bridge, Registry, Executor, Reaper)       │
//! │                     │                                    │
//! │          ┌──────────┴──────────┐                         │
//! │          ▼                     ▼                         │
//! │   Validator (policy)     EventBus (event)                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod policy;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    BridgeSettings, DockerSettings, EngineConfig, EngineKind, ExecutorSettings, ModeProfile,
    ModeProfiles, PolicySettings, ReaperSettings, ResourceLimits, RetrySettings, ServerSettings,
    SessionMode, CONFIG_FILES,
};

// ============================================================================
// Policy (명령어 검증)
// ============================================================================
pub use policy::{CommandPolicy, DenyPattern, Validator, Verdict};

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{
    streams, EventBus, EventBusConfig, EventCategory, EventFilter,
    ExecutionResult, LabEvent, ServerEvent, StreamReceiver,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::FileStore;
