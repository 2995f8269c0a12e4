//! Config - 통합 설정 관리
//!
//! - `mode.rs` - 세션 모드별 프로파일 (이미지, 쉘, 리소스 제한)
//! - `engine.rs` - EngineConfig 통합 설정

mod engine;
mod mode;

pub use engine::{
    BridgeSettings, DockerSettings, EngineConfig, EngineKind, ExecutorSettings, ModeProfiles,
    PolicySettings, ReaperSettings, RetrySettings, ServerSettings, CONFIG_FILES,
};
pub use mode::{ModeProfile, ResourceLimits, SessionMode};
