//! Event System - 이벤트 발행/구독 시스템
//!
//! 세션 출력과 대역 외 실행 결과를 스트림 단위로 전달합니다.
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventBus                              │
//! │  emit("terminal:<session>", Output)                          │
//! │  emit("owner:<owner>", ExecutionCompleted)                   │
//! │         │                                                    │
//! │         ├──────────────► StreamReceiver (WebSocket 연결별)    │
//! │         └──────────────► history (resume 시 replay)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusConfig, EventFilter, StreamReceiver};

pub use types::{streams, EventCategory, EventId, ExecutionResult, LabEvent, ServerEvent};
