//! Container engine abstraction

use super::spec::{ContainerInfo, ContainerSpec};
use async_trait::async_trait;
use labterm_foundation::Result;
use std::time::Duration;

/// Captured result of a one-shot command inside a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
}

/// Host-side program that opens an interactive shell inside a container.
/// The bridge spawns it under a PTY, or with piped stdio as a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLaunch {
    pub program: String,
    /// Arguments when a terminal is allocated
    pub pty_args: Vec<String>,
    /// Arguments for the piped fallback
    pub plain_args: Vec<String>,
}

/// Container engine: create/list/stop/remove with label filtering, plus exec
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Fails when the engine cannot be reached
    async fn ping(&self) -> Result<()>;

    /// Create and start; returns the container id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Containers whose labels contain every `(key, value)` pair
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<ContainerInfo>>;

    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;

    /// Force-remove; `Error::ContainerNotFound` when it does not exist
    async fn remove(&self, name: &str) -> Result<()>;

    /// Run `sh -c <command>` inside the container, killed after `timeout`
    async fn exec(&self, name: &str, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// How to start an interactive `shell` inside `name`
    fn shell_launch(&self, name: &str, shell: &str) -> ShellLaunch;
}
