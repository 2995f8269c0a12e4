//! Container Provisioner
//!
//! Creates session containers with the limits of their mode and tears them
//! down again. Teardown never fails from the caller's point of view.

use super::engine::ContainerEngine;
use super::spec::{container_name, ContainerInfo, ContainerRef, ContainerSpec, LabelKeys};
use chrono::Utc;
use labterm_foundation::{DockerSettings, EngineConfig, Error, ModeProfiles, Result, SessionMode};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to provision
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub session_id: String,
    pub owner_id: String,
    pub mode: SessionMode,
    /// Overrides the mode's default image
    pub image: Option<String>,
}

impl ProvisionRequest {
    pub fn new(session_id: impl Into<String>, owner_id: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            mode,
            image: None,
        }
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image.filter(|i| !i.trim().is_empty());
        self
    }
}

pub struct Provisioner {
    engine: Arc<dyn ContainerEngine>,
    docker: DockerSettings,
    modes: ModeProfiles,
    keys: LabelKeys,
}

impl Provisioner {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &EngineConfig) -> Self {
        Self {
            engine,
            docker: config.docker.clone(),
            modes: config.modes.clone(),
            keys: LabelKeys::new(&config.docker.label_namespace),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn labels(&self) -> &LabelKeys {
        &self.keys
    }

    /// Derived container name for a session
    pub fn container_name(&self, session_id: &str) -> String {
        container_name(&self.docker.name_prefix, session_id)
    }

    /// Create the container for `request`.
    ///
    /// Any container left over under the same derived name is removed first,
    /// so a restart with the same session id never yields two containers.
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ContainerRef> {
        if let Err(e) = self.engine.ping().await {
            warn!(engine = self.engine.name(), "Engine ping failed: {}", e);
            return Err(Error::ProvisionFailed(
                "container engine is not running".to_string(),
            ));
        }

        let profile = self.modes.get(request.mode);
        let image = request.image.clone().unwrap_or_else(|| profile.image.clone());
        let name = self.container_name(&request.session_id);
        let created_at = Utc::now();

        match self.engine.remove(&name).await {
            Ok(()) => info!(container = %name, "Removed stale container before provisioning"),
            Err(Error::ContainerNotFound(_)) => {}
            Err(e) => debug!(container = %name, "Stale container check failed: {}", e),
        }

        let spec = ContainerSpec::for_session(&name, &image, profile, &self.docker.control_socket)
            .with_session_labels(
                &self.keys,
                &request.owner_id,
                &request.session_id,
                request.mode,
                created_at,
            );

        let id = self.engine.create(&spec).await.map_err(|e| match e {
            Error::ProvisionFailed(_) => e,
            other => Error::ProvisionFailed(other.to_string()),
        })?;

        info!(
            session_id = %request.session_id,
            owner_id = %request.owner_id,
            mode = %request.mode,
            container = %name,
            image = %image,
            "Container provisioned"
        );

        Ok(ContainerRef {
            id,
            name,
            created_at,
        })
    }

    /// Stop then force-remove. `Ok` when the container is gone afterwards,
    /// including when it never existed.
    pub async fn try_teardown(&self, name: &str) -> Result<()> {
        match self.engine.stop(name, self.docker.stop_grace()).await {
            Ok(()) | Err(Error::ContainerNotFound(_)) => {}
            Err(e) => debug!(container = %name, "Stop failed, removing anyway: {}", e),
        }

        match self.engine.remove(name).await {
            Ok(()) | Err(Error::ContainerNotFound(_)) => Ok(()),
            Err(e) => Err(Error::TeardownFailed(format!("{}: {}", name, e))),
        }
    }

    /// Best-effort teardown; failures are logged and swallowed
    pub async fn teardown(&self, name: &str) {
        match self.try_teardown(name).await {
            Ok(()) => debug!(container = %name, "Container torn down"),
            Err(e) => warn!(container = %name, "{}", e),
        }
    }

    /// Every container this subsystem owns
    pub async fn list_managed(&self) -> Result<Vec<ContainerInfo>> {
        self.engine.list(&self.keys.managed_filter()).await
    }

    /// One owner's containers, oldest first
    pub async fn list_owner(&self, owner_id: &str) -> Result<Vec<ContainerInfo>> {
        let mut containers = self.engine.list(&self.keys.owner_filter(owner_id)).await?;
        containers.sort_by_key(|c| c.created_at(&self.keys));
        Ok(containers)
    }
}
