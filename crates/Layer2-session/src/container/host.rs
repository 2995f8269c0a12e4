//! Host engine - container metadata kept in memory, shells run on the host
//!
//! No daemon required. Used for development (`docker.kind = "host"`) and by
//! the integration tests. It enforces no isolation at all.

use super::engine::{ContainerEngine, ExecOutput, ShellLaunch};
use super::spec::{ContainerInfo, ContainerSpec, LabelKeys};
use crate::process::kill_group;
use async_trait::async_trait;
use chrono::Utc;
use labterm_foundation::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone)]
struct HostContainer {
    id: String,
    labels: HashMap<String, String>,
    running: bool,
}

/// In-process engine
pub struct HostEngine {
    containers: Mutex<HashMap<String, HostContainer>>,
    shell: String,
    available: AtomicBool,
    created_total: AtomicUsize,
    removed_total: AtomicUsize,
}

impl HostEngine {
    pub fn new() -> Self {
        Self::with_shell(DEFAULT_SHELL)
    }

    /// Use `shell` for every interactive session regardless of the mode profile
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            shell: shell.into(),
            available: AtomicBool::new(true),
            created_total: AtomicUsize::new(0),
            removed_total: AtomicUsize::new(0),
        }
    }

    /// Simulate the engine going away (ping/create fail)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Containers ever created
    pub fn created_total(&self) -> usize {
        self.created_total.load(Ordering::SeqCst)
    }

    /// Containers ever removed
    pub fn removed_total(&self) -> usize {
        self.removed_total.load(Ordering::SeqCst)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.containers.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a container's creation label `secs` into the past
    pub fn backdate(&self, name: &str, keys: &LabelKeys, secs: i64) -> bool {
        let mut containers = self.containers.lock();
        match containers.get_mut(name) {
            Some(container) => {
                let created = Utc::now().timestamp() - secs;
                container
                    .labels
                    .insert(keys.created_at.clone(), created.to_string());
                true
            }
            None => false,
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::EngineUnavailable("host engine disabled".to_string()))
        }
    }
}

impl Default for HostEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for HostEngine {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.check_available()?;

        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(Error::ProvisionFailed(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        containers.insert(
            spec.name.clone(),
            HostContainer {
                id: id.clone(),
                labels: spec.labels.clone(),
                running: true,
            },
        );
        self.created_total.fetch_add(1, Ordering::SeqCst);
        debug!("Host container {} created", spec.name);
        Ok(id)
    }

    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<ContainerInfo>> {
        self.check_available()?;

        let containers = self.containers.lock();
        Ok(containers
            .iter()
            .filter(|(_, c)| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .map(|(name, c)| ContainerInfo {
                id: c.id.clone(),
                name: name.clone(),
                labels: c.labels.clone(),
                engine_created_at: None,
                running: c.running,
            })
            .collect())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<()> {
        let mut containers = self.containers.lock();
        match containers.get_mut(name) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(Error::ContainerNotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.containers.lock().remove(name) {
            Some(_) => {
                self.removed_total.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::ContainerNotFound(name.to_string())),
        }
    }

    async fn exec(&self, name: &str, command: &str, limit: Duration) -> Result<ExecOutput> {
        if !self.exists(name) {
            return Err(Error::ContainerNotFound(name.to_string()));
        }

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
            Ok(status) => (status?.code().map(i64::from).unwrap_or(-1), false),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                let _ = child.kill().await;
                (-1, true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
            timed_out,
        })
    }

    fn shell_launch(&self, _name: &str, _shell: &str) -> ShellLaunch {
        ShellLaunch {
            program: self.shell.clone(),
            pty_args: vec!["-i".to_string()],
            plain_args: vec!["-i".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, owner: &str) -> ContainerSpec {
        ContainerSpec::new(name, "ubuntu:22.04")
            .with_label("labterm.managed", "true")
            .with_label("labterm.owner", owner)
    }

    #[test]
    fn test_unavailable_engine_refuses_work() {
        let engine = HostEngine::new();
        engine.set_available(false);

        let (ping, create) = tokio_test::block_on(async {
            (engine.ping().await, engine.create(&spec("labterm_x", "1")).await)
        });
        assert!(matches!(ping, Err(Error::EngineUnavailable(_))));
        assert!(create.is_err());
        assert_eq!(engine.created_total(), 0);
    }

    #[tokio::test]
    async fn test_create_list_remove() {
        let engine = HostEngine::new();
        engine.create(&spec("a", "1")).await.unwrap();
        engine.create(&spec("b", "2")).await.unwrap();

        let keys = LabelKeys::default();
        assert_eq!(engine.list(&keys.managed_filter()).await.unwrap().len(), 2);
        assert_eq!(engine.list(&keys.owner_filter("1")).await.unwrap().len(), 1);

        engine.remove("a").await.unwrap();
        assert!(matches!(
            engine.remove("a").await,
            Err(Error::ContainerNotFound(_))
        ));
        assert_eq!(engine.removed_total(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let engine = HostEngine::new();
        engine.create(&spec("a", "1")).await.unwrap();
        assert!(matches!(
            engine.create(&spec("a", "1")).await,
            Err(Error::ProvisionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let engine = HostEngine::new();
        engine.set_available(false);
        assert!(engine.ping().await.is_err());
        assert!(matches!(
            engine.create(&spec("a", "1")).await,
            Err(Error::EngineUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let engine = HostEngine::new();
        engine.create(&spec("a", "1")).await.unwrap();

        let out = engine
            .exec("a", "echo out; echo err >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_exec_timeout_kills_process() {
        let engine = HostEngine::new();
        engine.create(&spec("a", "1")).await.unwrap();

        let started = std::time::Instant::now();
        let out = engine
            .exec("a", "sleep 120", Duration::from_millis(300))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
