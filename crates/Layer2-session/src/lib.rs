//! # labterm-session
//!
//! Ephemeral containerized terminal sessions.
//!
//! - Provisioner: 세션마다 라벨이 붙은 컨테이너 생성/제거
//! - Bridge: PTY 우선, 실패 시 plain pipe 로 셸 연결
//! - Registry: session id 당 하나의 slot (동시 subscribe 에도 컨테이너 하나)
//! - Executor: 큐 기반 out-of-band 명령 실행 + probe
//! - Reaper: 주기적 정리 (per-user cap, max age, orphan, idle)
//! - Channel: 클라이언트 연결 하나의 메시지 처리
//!
//! ## 사용 예시
//!
//! ```ignore
//! let config = EngineConfig::load(None)?;
//! let engine = LabEngine::from_config(config)?;
//! let reaper = engine.spawn_reaper();
//!
//! let mut channel = engine.channel(Some("alice".into()));
//! channel.handle_text(r#"{"action":"subscribe"}"#).await;
//! ```

pub mod bridge;
pub mod channel;
pub mod container;
pub mod executor;
pub mod guard;
pub mod manager;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod state;

pub use bridge::{AttachKind, AttachOutcome, Bridge, IoHandle, PLAIN_PROMPT};
pub use channel::{ClientMessage, Reply, SessionChannel, TermSize};
pub use container::{
    engine_from_config, ContainerEngine, ContainerInfo, ContainerRef, ContainerSpec, DockerEngine,
    ExecOutput, HostEngine, LabelKeys, ProvisionRequest, Provisioner, ShellLaunch,
};
pub use executor::{
    ExecOptions, ExecRequest, JobId, JobRecord, JobState, OutOfBandExecutor, Probe, ProbeResult,
};
pub use guard::{GuardStep, InputGuard};
pub use manager::{SessionManager, SubscribeRequest, Subscription};
pub use reaper::{Reaper, SweepReport};
pub use registry::{Registry, SessionSlot, SessionSummary};
pub use state::{ChannelState, CloseReason};

use labterm_foundation::{EngineConfig, EventBus, Result, Validator};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything one process needs, wired from a single config
pub struct LabEngine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    manager: Arc<SessionManager>,
    executor: Arc<OutOfBandExecutor>,
    reaper: Arc<Reaper>,
    token: CancellationToken,
}

impl LabEngine {
    /// Connects the engine named by `config.docker.kind`
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let engine = engine_from_config(&config)?;
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: EngineConfig, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        config.validate()?;

        let validator = Arc::new(Validator::from_config(&config)?);
        let bus = Arc::new(EventBus::with_config(config.event_bus.clone()));
        let provisioner = Arc::new(Provisioner::new(engine, &config));
        let manager = Arc::new(SessionManager::new(
            &config,
            provisioner,
            validator,
            bus.clone(),
        ));
        let executor = Arc::new(OutOfBandExecutor::new(manager.clone(), &config.executor));
        let reaper = Arc::new(Reaper::new(manager.clone(), config.reaper.clone()));

        Ok(Self {
            config,
            bus,
            manager,
            executor,
            reaper,
            token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn executor(&self) -> &Arc<OutOfBandExecutor> {
        &self.executor
    }

    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// New channel for one client connection
    pub fn channel(&self, owner_id: Option<String>) -> SessionChannel {
        SessionChannel::new(owner_id, self.manager.clone(), self.executor.clone())
    }

    /// Periodic reaper, stopped by `shutdown`
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        self.reaper.clone().spawn(self.token.child_token())
    }

    /// Stop the reaper and job workers, then close every session
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.executor.shutdown().await;
        let closed = self.manager.shutdown().await;
        info!(closed, "Engine shut down");
    }
}
