//! Container Module - 컨테이너 엔진과 프로비저너
//!
//! - `ContainerEngine`: create/list/stop/remove/exec 추상화
//! - `DockerEngine`: bollard 기반 구현
//! - `HostEngine`: 데몬 없이 호스트 셸로 동작 (개발/테스트용)
//! - `Provisioner`: 모드별 리소스 제한으로 세션 컨테이너 생성/정리

mod docker;
mod engine;
mod host;
mod provisioner;
mod spec;

pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ExecOutput, ShellLaunch};
pub use host::HostEngine;
pub use provisioner::{ProvisionRequest, Provisioner};
pub use spec::{container_name, ContainerInfo, ContainerRef, ContainerSpec, LabelKeys, KEEP_ALIVE};

use labterm_foundation::{EngineConfig, EngineKind, Result};
use std::sync::Arc;

/// Build the engine selected by `docker.kind`
pub fn engine_from_config(config: &EngineConfig) -> Result<Arc<dyn ContainerEngine>> {
    match config.docker.kind {
        EngineKind::Docker => Ok(Arc::new(DockerEngine::connect(
            config.docker.endpoint.as_deref(),
        )?)),
        EngineKind::Host => Ok(Arc::new(HostEngine::new())),
    }
}
