//! Environment probes: checks against a live session's container

use crate::manager::SessionManager;
use labterm_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum Probe {
    ContainerRunning,
    FileExists { path: String },
    /// Passes when stdout (ANSI stripped) contains `expect`
    CommandOutput { command: String, expect: String },
}

impl Probe {
    pub fn name(&self) -> &'static str {
        match self {
            Probe::ContainerRunning => "container_running",
            Probe::FileExists { .. } => "file_exists",
            Probe::CommandOutput { .. } => "command_output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub passed: bool,
    pub detail: String,
}

impl ProbeResult {
    fn new(passed: bool, detail: impl Into<String>) -> Self {
        Self {
            passed,
            detail: detail.into(),
        }
    }
}

pub(super) async fn run(
    manager: &SessionManager,
    owner_id: &str,
    session_id: &str,
    probe: &Probe,
    limit: Duration,
) -> Result<ProbeResult> {
    let slot = manager
        .registry()
        .get(session_id)
        .await
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
    if slot.owner_id != owner_id {
        return Err(Error::Unauthorized(format!(
            "session {} belongs to another user",
            session_id
        )));
    }
    let container = slot
        .container_name()
        .ok_or_else(|| Error::SessionClosed(format!("{} has no container yet", session_id)))?;

    let provisioner = manager.provisioner();
    let engine = provisioner.engine();

    match probe {
        Probe::ContainerRunning => {
            let running = provisioner
                .list_owner(owner_id)
                .await?
                .into_iter()
                .any(|c| c.name == container && c.running);
            let detail = if running { "running" } else { "not running" };
            Ok(ProbeResult::new(running, format!("{} is {}", container, detail)))
        }
        Probe::FileExists { path } => {
            let quoted = shlex::try_quote(path)
                .map_err(|e| Error::InvalidInput(format!("unusable path {:?}: {}", path, e)))?;
            let output = engine
                .exec(&container, &format!("test -e {}", quoted), limit)
                .await?;
            let exists = output.exit_code == 0 && !output.timed_out;
            let detail = if exists { "exists" } else { "missing" };
            Ok(ProbeResult::new(exists, format!("{} {}", path, detail)))
        }
        Probe::CommandOutput { command, expect } => {
            manager
                .validator()
                .validate(slot.mode, command)
                .into_result()?;
            let output = engine.exec(&container, command, limit).await?;
            let stdout = strip_ansi_escapes::strip_str(&output.stdout);
            let passed = !output.timed_out && stdout.contains(expect.as_str());
            let detail = if output.timed_out {
                "timed out".to_string()
            } else {
                stdout.trim().to_string()
            };
            Ok(ProbeResult::new(passed, detail))
        }
    }
}
