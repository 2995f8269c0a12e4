//! Session modes and their per-mode profiles
//!
//! 모드별로 이미지, 쉘, 리소스 제한, 허용 명령어 집합이 달라집니다.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

// ============================================================================
// SessionMode
// ============================================================================

/// 세션 실행 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionMode {
    /// No network, low ceilings, read-only root with scratch tmpfs mounts.
    #[default]
    #[serde(rename = "isolated-readonly", alias = "isolated")]
    IsolatedReadonly,

    /// Host control socket mounted so the environment can drive sub-containers.
    #[serde(
        rename = "privileged-with-control-plane-socket",
        alias = "privileged"
    )]
    Privileged,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::IsolatedReadonly => "isolated-readonly",
            SessionMode::Privileged => "privileged-with-control-plane-socket",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isolated-readonly" | "isolated" => Ok(SessionMode::IsolatedReadonly),
            "privileged-with-control-plane-socket" | "privileged" => Ok(SessionMode::Privileged),
            other => Err(Error::InvalidInput(format!("unknown session mode: {}", other))),
        }
    }
}

// ============================================================================
// ResourceLimits
// ============================================================================

/// Resource ceilings applied to a provisioned container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Memory limit in bytes
    pub memory_bytes: i64,

    /// CPU quota in units of 1e-9 CPUs
    pub nano_cpus: i64,

    /// Maximum number of processes
    pub pids_limit: i64,

    /// Mount the root filesystem read-only
    #[serde(default)]
    pub read_only_rootfs: bool,

    /// Disable networking entirely
    #[serde(default)]
    pub network_disabled: bool,

    /// Scratch mounts: path -> tmpfs options
    #[serde(default)]
    pub tmpfs: BTreeMap<String, String>,

    /// Bind the host control socket into the container
    #[serde(default)]
    pub mount_control_socket: bool,

    /// Drop every Linux capability
    #[serde(default)]
    pub drop_all_capabilities: bool,
}

const MIB: i64 = 1024 * 1024;
const NANO: i64 = 1_000_000_000;

impl ResourceLimits {
    /// 격리 모드 기본 제한 (256m / 0.5 cpu / 50 pids)
    pub fn isolated() -> Self {
        let mut tmpfs = BTreeMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=64m".to_string());
        tmpfs.insert("/home/user".to_string(), "rw,size=32m".to_string());
        Self {
            memory_bytes: 256 * MIB,
            nano_cpus: NANO / 2,
            pids_limit: 50,
            read_only_rootfs: true,
            network_disabled: true,
            tmpfs,
            mount_control_socket: false,
            drop_all_capabilities: true,
        }
    }

    /// 특권 모드 기본 제한 (512m / 1 cpu / 100 pids)
    pub fn privileged() -> Self {
        Self {
            memory_bytes: 512 * MIB,
            nano_cpus: NANO,
            pids_limit: 100,
            read_only_rootfs: false,
            network_disabled: false,
            tmpfs: BTreeMap::new(),
            mount_control_socket: true,
            drop_all_capabilities: false,
        }
    }
}

// ============================================================================
// ModeProfile
// ============================================================================

/// Everything that varies by [`SessionMode`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeProfile {
    /// Default image when the client does not name one
    pub image: String,

    /// Interactive shell started inside the container
    pub shell: String,

    /// Working directory inside the container
    pub workdir: String,

    pub limits: ResourceLimits,

    /// First tokens accepted by the command validator
    pub allowed_commands: Vec<String>,

    /// Validate each completed interactive line before it is submitted
    #[serde(default)]
    pub guard_input: bool,
}

impl ModeProfile {
    pub fn for_mode(mode: SessionMode) -> Self {
        match mode {
            SessionMode::IsolatedReadonly => Self::isolated(),
            SessionMode::Privileged => Self::privileged(),
        }
    }

    pub fn isolated() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            shell: "/bin/bash".to_string(),
            workdir: "/home/user".to_string(),
            limits: ResourceLimits::isolated(),
            allowed_commands: base_commands(),
            guard_input: false,
        }
    }

    pub fn privileged() -> Self {
        let mut allowed = base_commands();
        allowed.extend(["docker", "kubectl"].iter().map(|s| s.to_string()));
        Self {
            image: "docker:cli".to_string(),
            shell: "/bin/sh".to_string(),
            workdir: "/root".to_string(),
            limits: ResourceLimits::privileged(),
            allowed_commands: allowed,
            guard_input: true,
        }
    }
}

/// Read-only and file utilities shared by every mode
fn base_commands() -> Vec<String> {
    [
        "ls", "cat", "echo", "pwd", "cd", "mkdir", "touch", "rm", "cp", "mv", "grep", "find",
        "ps", "top", "df", "free", "uname", "head", "tail", "wc", "sleep", "whoami", "env",
        "date", "clear",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serde_names() {
        let json = serde_json::to_string(&SessionMode::Privileged).unwrap();
        assert_eq!(json, "\"privileged-with-control-plane-socket\"");

        let mode: SessionMode = serde_json::from_str("\"isolated-readonly\"").unwrap();
        assert_eq!(mode, SessionMode::IsolatedReadonly);

        let mode: SessionMode = serde_json::from_str("\"privileged\"").unwrap();
        assert_eq!(mode, SessionMode::Privileged);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("isolated".parse::<SessionMode>().unwrap(), SessionMode::IsolatedReadonly);
        assert!("root".parse::<SessionMode>().is_err());
    }

    #[test]
    fn test_profiles_differ_by_trust_level() {
        let isolated = ModeProfile::isolated();
        let privileged = ModeProfile::privileged();

        assert!(isolated.limits.network_disabled);
        assert!(isolated.limits.read_only_rootfs);
        assert!(!isolated.limits.mount_control_socket);
        assert_eq!(isolated.limits.pids_limit, 50);

        assert!(privileged.limits.mount_control_socket);
        assert!(privileged.limits.memory_bytes > isolated.limits.memory_bytes);
        assert!(privileged.allowed_commands.iter().any(|c| c == "kubectl"));
        assert!(!isolated.allowed_commands.iter().any(|c| c == "docker"));
    }
}
