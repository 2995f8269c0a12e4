//! Command policy - 명령어 안전성 검증
//!
//! - `patterns`: 모든 모드가 공유하는 금지 패턴
//! - `validator`: 모드별 허용 목록 + 금지 패턴 검사 (순수 함수)
//!
//! ## 사용 예시
//!
//! ```rust,ignore
//! let validator = Validator::from_config(&EngineConfig::default())?;
//! let verdict = validator.validate(SessionMode::IsolatedReadonly, "rm -rf /");
//! assert!(!verdict.allowed);
//! ```

mod patterns;
mod validator;

pub use patterns::{deny_patterns, DenyPattern, PatternType};
pub use validator::{CommandPolicy, Validator, Verdict};
