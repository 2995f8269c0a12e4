//! Docker engine backed by bollard

use super::engine::{ContainerEngine, ExecOutput, ShellLaunch};
use super::spec::{ContainerInfo, ContainerSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use labterm_foundation::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Extra wall-clock allowance on top of the in-container `timeout`
const EXEC_GRACE: Duration = Duration::from_secs(2);

/// Docker engine
pub struct DockerEngine {
    docker: Docker,
    endpoint: Option<String>,
    cli: String,
}

impl DockerEngine {
    /// Connect to `endpoint` (`unix://...` or `tcp://...`), or local defaults
    pub fn connect(endpoint: Option<&str>) -> Result<Self> {
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults(),
            Some(ep) if ep.starts_with("unix://") => Docker::connect_with_unix(
                ep,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            Some(ep) => Docker::connect_with_http(
                ep,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| Error::EngineUnavailable(format!("Failed to connect to Docker: {}", e)))?;

        let cli = which::which("docker")
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "docker".to_string());

        Ok(Self {
            docker,
            endpoint: endpoint.map(str::to_string),
            cli,
        })
    }

    fn build_config(spec: &ContainerSpec) -> Config<String> {
        let limits = &spec.limits;

        let mut binds = Vec::new();
        if let Some(socket) = &spec.control_socket {
            binds.push(format!("{}:{}", socket, socket));
        }

        let host_config = HostConfig {
            memory: Some(limits.memory_bytes),
            nano_cpus: Some(limits.nano_cpus),
            pids_limit: Some(limits.pids_limit),
            readonly_rootfs: Some(limits.read_only_rootfs),
            network_mode: limits.network_disabled.then(|| "none".to_string()),
            tmpfs: (!limits.tmpfs.is_empty()).then(|| {
                limits
                    .tmpfs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>()
            }),
            binds: (!binds.is_empty()).then_some(binds),
            cap_drop: limits
                .drop_all_capabilities
                .then(|| vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(limits.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            item.map_err(|e| Error::ProvisionFailed(format!("Failed to pull {}: {}", image, e)))?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> std::result::Result<String, BollardError> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                Self::build_config(spec),
            )
            .await?;
        Ok(response.id)
    }
}

/// Map a bollard error, turning 404 into `ContainerNotFound`
fn map_err(name: &str, context: &str, err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => Error::ContainerNotFound(name.to_string()),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => Error::ProvisionFailed(format!("{} {}: {} ({})", context, name, message, status_code)),
        other => Error::EngineUnavailable(format!("{} {}: {}", context, name, other)),
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::EngineUnavailable(format!("Docker is not running: {}", e)))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = match self.create_container(spec).await {
            Ok(id) => id,
            // image missing locally
            Err(e) if is_status(&e, 404) => {
                self.pull_image(&spec.image).await?;
                self.create_container(spec)
                    .await
                    .map_err(|e| map_err(&spec.name, "create", e))?
            }
            Err(e) => return Err(map_err(&spec.name, "create", e)),
        };

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(Error::ProvisionFailed(format!(
                "Failed to start {}: {}",
                spec.name, e
            )));
        }

        debug!("Started container {} ({})", spec.name, id);
        Ok(id)
    }

    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>(),
        );

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::EngineUnavailable(format!("Failed to list containers: {}", e)))?;

        Ok(summaries
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                engine_created_at: c.created.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                running: c.state.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        match self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(map_err(name, "stop", e)),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err(name, "remove", e))
    }

    async fn exec(&self, name: &str, command: &str, limit: Duration) -> Result<ExecOutput> {
        // the in-container timeout kills the process tree; the outer bound
        // only guards a stuck attach stream
        let secs = limit.as_secs().max(1).to_string();
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec!["timeout", "-s", "KILL", secs.as_str(), "sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err(name, "create exec in", e))?;

        let started = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();

        let results = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_err(name, "start exec in", e))?;

        let mut stream_timed_out = false;
        if let StartExecResults::Attached { mut output, .. } = results {
            let collect = async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Exec output stream error in {}: {}", name, e);
                            break;
                        }
                    }
                }
            };
            stream_timed_out = timeout(limit + EXEC_GRACE, collect).await.is_err();
        }

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .ok()
            .and_then(|inspect| inspect.exit_code)
            .unwrap_or(-1);

        // `timeout -s KILL` reports 137 when it fires
        let timed_out =
            stream_timed_out || (started.elapsed() >= limit && matches!(exit_code, 124 | 137));

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }

    fn shell_launch(&self, name: &str, shell: &str) -> ShellLaunch {
        let mut base = Vec::new();
        if let Some(endpoint) = &self.endpoint {
            base.push("-H".to_string());
            base.push(endpoint.clone());
        }
        let with = |flag: &str| {
            let mut args = base.clone();
            args.extend(
                ["exec", flag, name, shell]
                    .iter()
                    .map(|s| s.to_string()),
            );
            args
        };
        ShellLaunch {
            program: self.cli.clone(),
            pty_args: with("-it"),
            plain_args: with("-i"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labterm_foundation::{ModeProfile, ResourceLimits};

    #[test]
    fn test_isolated_config() {
        let spec = ContainerSpec::for_session(
            "labterm_s1",
            "ubuntu:22.04",
            &ModeProfile::isolated(),
            "/var/run/docker.sock",
        );
        let config = DockerEngine::build_config(&spec);
        let host = config.host_config.unwrap();

        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(50));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert!(host.binds.is_none());
        assert_eq!(
            host.tmpfs.unwrap().get("/tmp").map(String::as_str),
            Some("rw,size=64m")
        );
        assert_eq!(config.network_disabled, Some(true));
    }

    #[test]
    fn test_privileged_config_binds_socket() {
        let mut spec = ContainerSpec::new("labterm_s2", "docker:cli")
            .with_limits(ResourceLimits::privileged());
        spec.control_socket = Some("/var/run/docker.sock".into());

        let host = DockerEngine::build_config(&spec).host_config.unwrap();
        assert_eq!(
            host.binds,
            Some(vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()])
        );
        assert!(host.network_mode.is_none());
        assert!(host.cap_drop.is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_docker_round_trip() {
        let engine = DockerEngine::connect(None).unwrap();
        engine.ping().await.unwrap();

        let spec = ContainerSpec::new("labterm_it_roundtrip", "alpine:3.20")
            .with_label("labterm.managed", "true");
        let _ = engine.remove(&spec.name).await;
        engine.create(&spec).await.unwrap();

        let out = engine
            .exec(&spec.name, "echo hi", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi");

        engine.remove(&spec.name).await.unwrap();
    }
}
