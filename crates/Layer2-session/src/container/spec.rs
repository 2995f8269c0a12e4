//! Container specification and discoverable metadata
//!
//! Every container carries labels so the reaper can find owners and ages
//! without consulting the registry.

use chrono::{DateTime, TimeZone, Utc};
use labterm_foundation::{ModeProfile, ResourceLimits, SessionMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Keep-alive command for session containers
pub const KEEP_ALIVE: &[&str] = &["tail", "-f", "/dev/null"];

// ============================================================================
// Labels
// ============================================================================

/// Label keys under one namespace, e.g. `labterm.owner`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelKeys {
    pub managed: String,
    pub owner: String,
    pub session: String,
    pub mode: String,
    pub created_at: String,
}

impl LabelKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            managed: format!("{}.managed", namespace),
            owner: format!("{}.owner", namespace),
            session: format!("{}.session", namespace),
            mode: format!("{}.mode", namespace),
            created_at: format!("{}.created_at", namespace),
        }
    }

    /// Filter selecting every container this subsystem owns
    pub fn managed_filter(&self) -> Vec<(String, String)> {
        vec![(self.managed.clone(), "true".to_string())]
    }

    /// Filter selecting one owner's containers
    pub fn owner_filter(&self, owner_id: &str) -> Vec<(String, String)> {
        vec![
            (self.managed.clone(), "true".to_string()),
            (self.owner.clone(), owner_id.to_string()),
        ]
    }
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self::new("labterm")
    }
}

// ============================================================================
// ContainerSpec
// ============================================================================

/// Engine-neutral creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,
    /// Host control socket to bind when `limits.mount_control_socket` is set
    pub control_socket: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: KEEP_ALIVE.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            env: HashMap::new(),
            labels: HashMap::new(),
            limits: ResourceLimits::isolated(),
            control_socket: None,
        }
    }

    /// Spec for an interactive session container
    pub fn for_session(
        name: impl Into<String>,
        image: impl Into<String>,
        profile: &ModeProfile,
        control_socket: &str,
    ) -> Self {
        let mut spec = Self::new(name, image)
            .with_working_dir(profile.workdir.clone())
            .with_limits(profile.limits.clone())
            .with_env("TERM", "xterm-256color")
            .with_env("PS1", "user@labterm:\\w$ ");
        if profile.limits.mount_control_socket {
            spec.control_socket = Some(control_socket.to_string());
        }
        spec
    }

    pub fn with_command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Ownership/age labels the reaper relies on
    pub fn with_session_labels(
        self,
        keys: &LabelKeys,
        owner_id: &str,
        session_id: &str,
        mode: SessionMode,
        created_at: DateTime<Utc>,
    ) -> Self {
        self.with_label(keys.managed.clone(), "true")
            .with_label(keys.owner.clone(), owner_id)
            .with_label(keys.session.clone(), session_id)
            .with_label(keys.mode.clone(), mode.as_str())
            .with_label(keys.created_at.clone(), created_at.timestamp().to_string())
    }
}

// ============================================================================
// ContainerInfo
// ============================================================================

/// One container as reported by an engine listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Engine-reported creation time, used when the label is missing
    pub engine_created_at: Option<DateTime<Utc>>,
    pub running: bool,
}

impl ContainerInfo {
    pub fn owner<'a>(&'a self, keys: &LabelKeys) -> Option<&'a str> {
        self.labels.get(&keys.owner).map(String::as_str)
    }

    pub fn session_id<'a>(&'a self, keys: &LabelKeys) -> Option<&'a str> {
        self.labels.get(&keys.session).map(String::as_str)
    }

    /// Creation time from the label, else from the engine
    pub fn created_at(&self, keys: &LabelKeys) -> Option<DateTime<Utc>> {
        self.labels
            .get(&keys.created_at)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .or(self.engine_created_at)
    }

    pub fn age(&self, keys: &LabelKeys, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.created_at(keys).map(|created| now - created)
    }
}

/// Handle to a provisioned container; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Derived container name: prefix + session id with anything outside
/// `[A-Za-z0-9_.-]` replaced by `_`
pub fn container_name(prefix: &str, session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", prefix, sanitized)
}
