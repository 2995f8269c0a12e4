//! Engine Config - 통합 설정
//!
//! 세션 엔진 전체 설정. 글로벌 -> 프로젝트 -> 명시적 파일 순서로 병합됩니다.

use crate::event::EventBusConfig;
use crate::storage::{load_path, FileStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::{ModeProfile, SessionMode};

/// 설정 파일명 (우선순위 순)
pub const CONFIG_FILES: &[&str] = &["config.toml", "config.json"];

// ============================================================================
// Engine Config (통합)
// ============================================================================

/// labterm 통합 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub modes: ModeProfiles,

    #[serde(default)]
    pub policy: PolicySettings,

    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub reaper: ReaperSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub event_bus: EventBusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            docker: DockerSettings::default(),
            modes: ModeProfiles::default(),
            policy: PolicySettings::default(),
            bridge: BridgeSettings::default(),
            executor: ExecutorSettings::default(),
            reaper: ReaperSettings::default(),
            server: ServerSettings::default(),
            event_bus: EventBusConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// 글로벌 + 프로젝트 (+ 명시적 파일) 병합 로드
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = FileStore::global() {
            if let Some(global_config) = global.load_first::<EngineConfig>(CONFIG_FILES)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Ok(project) = FileStore::current_project() {
            if let Some(project_config) = project.load_first::<EngineConfig>(CONFIG_FILES)? {
                config.merge(project_config);
            }
        }

        // 3. 명시적 파일
        if let Some(path) = explicit {
            config.merge(load_path::<EngineConfig>(path)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a single file on top of the defaults, without the global/project layers
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::new();
        config.merge(load_path::<EngineConfig>(path)?);
        config.validate()?;
        Ok(config)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: EngineConfig) {
        self.docker.merge(other.docker);
        self.modes.merge(other.modes);
        self.policy.merge(other.policy);
        self.bridge.merge(other.bridge);
        self.executor.merge(other.executor);
        self.reaper.merge(other.reaper);
        self.server.merge(other.server);
        if other.event_bus != EventBusConfig::default() {
            self.event_bus = other.event_bus;
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    pub fn validate(&self) -> Result<()> {
        for mode in [SessionMode::IsolatedReadonly, SessionMode::Privileged] {
            let profile = self.modes.get(mode);
            if profile.image.trim().is_empty() {
                return Err(Error::Config(format!("{}: image must not be empty", mode)));
            }
            if profile.shell.trim().is_empty() {
                return Err(Error::Config(format!("{}: shell must not be empty", mode)));
            }
        }
        if self.bridge.poll_interval_ms == 0 {
            return Err(Error::Config("bridge.pollIntervalMs must be > 0".into()));
        }
        if self.reaper.interval_secs == 0 {
            return Err(Error::Config("reaper.intervalSecs must be > 0".into()));
        }
        if self.reaper.per_user_cap == 0 {
            return Err(Error::Config("reaper.perUserCap must be > 0".into()));
        }
        if self.executor.workers == 0 {
            return Err(Error::Config("executor.workers must be > 0".into()));
        }
        if self.executor.default_timeout_secs > self.executor.max_timeout_secs {
            return Err(Error::Config(
                "executor.defaultTimeoutSecs exceeds executor.maxTimeoutSecs".into(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn profile(&self, mode: SessionMode) -> &ModeProfile {
        self.modes.get(mode)
    }

    /// Render as TOML (used by `labterm config`)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("Failed to serialize: {}", e)))
    }
}

// ============================================================================
// Docker
// ============================================================================

/// Which container engine backs the sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Docker,
    /// In-process metadata plus host shells; no daemon required
    Host,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSettings {
    #[serde(default)]
    pub kind: EngineKind,

    /// `unix:///path/docker.sock` or `tcp://host:port`; local defaults when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Host control socket bound into privileged containers
    #[serde(default = "default_control_socket")]
    pub control_socket: String,

    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Label namespace, e.g. `labterm.owner`
    #[serde(default = "default_label_namespace")]
    pub label_namespace: String,

    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            endpoint: None,
            control_socket: default_control_socket(),
            name_prefix: default_name_prefix(),
            label_namespace: default_label_namespace(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl DockerSettings {
    fn merge(&mut self, other: DockerSettings) {
        if other.kind != EngineKind::default() {
            self.kind = other.kind;
        }
        if other.endpoint.is_some() {
            self.endpoint = other.endpoint;
        }
        if other.control_socket != default_control_socket() {
            self.control_socket = other.control_socket;
        }
        if other.name_prefix != default_name_prefix() {
            self.name_prefix = other.name_prefix;
        }
        if other.label_namespace != default_label_namespace() {
            self.label_namespace = other.label_namespace;
        }
        if other.stop_grace_secs != default_stop_grace_secs() {
            self.stop_grace_secs = other.stop_grace_secs;
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

// ============================================================================
// Modes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeProfiles {
    #[serde(default = "ModeProfile::isolated")]
    pub isolated_readonly: ModeProfile,

    #[serde(default = "ModeProfile::privileged")]
    pub privileged: ModeProfile,
}

impl Default for ModeProfiles {
    fn default() -> Self {
        Self {
            isolated_readonly: ModeProfile::isolated(),
            privileged: ModeProfile::privileged(),
        }
    }
}

impl ModeProfiles {
    pub fn get(&self, mode: SessionMode) -> &ModeProfile {
        match mode {
            SessionMode::IsolatedReadonly => &self.isolated_readonly,
            SessionMode::Privileged => &self.privileged,
        }
    }

    fn merge(&mut self, other: ModeProfiles) {
        if other.isolated_readonly != ModeProfile::isolated() {
            self.isolated_readonly = other.isolated_readonly;
        }
        if other.privileged != ModeProfile::privileged() {
            self.privileged = other.privileged;
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySettings {
    /// Regexes appended to the built-in deny list
    #[serde(default)]
    pub extra_deny_patterns: Vec<String>,
}

impl PolicySettings {
    fn merge(&mut self, other: PolicySettings) {
        for pattern in other.extra_deny_patterns {
            if !self.extra_deny_patterns.contains(&pattern) {
                self.extra_deny_patterns.push(pattern);
            }
        }
    }
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(default = "default_cols")]
    pub cols: u16,

    #[serde(default = "default_rows")]
    pub rows: u16,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,

    /// Chunks buffered between the blocking reader and the async loop
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
            poll_interval_ms: default_poll_interval_ms(),
            read_buffer_bytes: default_read_buffer_bytes(),
            output_capacity: default_output_capacity(),
        }
    }
}

impl BridgeSettings {
    fn merge(&mut self, other: BridgeSettings) {
        if other.cols != default_cols() {
            self.cols = other.cols;
        }
        if other.rows != default_rows() {
            self.rows = other.rows;
        }
        if other.poll_interval_ms != default_poll_interval_ms() {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.read_buffer_bytes != default_read_buffer_bytes() {
            self.read_buffer_bytes = other.read_buffer_bytes;
        }
        if other.output_capacity != default_output_capacity() {
            self.output_capacity = other.output_capacity;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSettings {
    #[serde(default = "default_exec_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Background worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Finished job records kept for status queries
    #[serde(default = "default_job_history")]
    pub history_size: usize,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_exec_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            history_size: default_job_history(),
            retry: RetrySettings::default(),
        }
    }
}

impl ExecutorSettings {
    fn merge(&mut self, other: ExecutorSettings) {
        if other.default_timeout_secs != default_exec_timeout_secs() {
            self.default_timeout_secs = other.default_timeout_secs;
        }
        if other.max_timeout_secs != default_max_timeout_secs() {
            self.max_timeout_secs = other.max_timeout_secs;
        }
        if other.workers != default_workers() {
            self.workers = other.workers;
        }
        if other.queue_capacity != default_queue_capacity() {
            self.queue_capacity = other.queue_capacity;
        }
        if other.history_size != default_job_history() {
            self.history_size = other.history_size;
        }
        if other.retry != RetrySettings::default() {
            self.retry = other.retry;
        }
    }

    /// Clamp a requested timeout into `1..=max_timeout_secs`
    pub fn effective_timeout(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(self.default_timeout_secs)
            .clamp(1, self.max_timeout_secs.max(1));
        Duration::from_secs(secs)
    }
}

/// Retry/backoff policy for background jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

// ============================================================================
// Reaper
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperSettings {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,

    /// Hard ceiling on container age
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Evict sessions with no input for this long
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Containers allowed per owner
    #[serde(default = "default_per_user_cap")]
    pub per_user_cap: usize,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            max_age_secs: default_max_age_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            per_user_cap: default_per_user_cap(),
        }
    }
}

impl ReaperSettings {
    fn merge(&mut self, other: ReaperSettings) {
        if other.interval_secs != default_reaper_interval_secs() {
            self.interval_secs = other.interval_secs;
        }
        if other.max_age_secs != default_max_age_secs() {
            self.max_age_secs = other.max_age_secs;
        }
        if other.idle_timeout_secs != default_idle_timeout_secs() {
            self.idle_timeout_secs = other.idle_timeout_secs;
        }
        if other.per_user_cap != default_per_user_cap() {
            self.per_user_cap = other.per_user_cap;
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Header carrying the authenticated owner id from the upstream proxy
    #[serde(default = "default_owner_header")]
    pub owner_header: String,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            owner_header: default_owner_header(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl ServerSettings {
    fn merge(&mut self, other: ServerSettings) {
        if other.bind != default_bind() {
            self.bind = other.bind;
        }
        if other.owner_header != default_owner_header() {
            self.owner_header = other.owner_header;
        }
        if other.ping_interval_secs != default_ping_interval_secs() {
            self.ping_interval_secs = other.ping_interval_secs;
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_control_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_name_prefix() -> String {
    "labterm_".to_string()
}

fn default_label_namespace() -> String {
    "labterm".to_string()
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_read_buffer_bytes() -> usize {
    4096
}

fn default_output_capacity() -> usize {
    100
}

fn default_exec_timeout_secs() -> u64 {
    30
}

fn default_max_timeout_secs() -> u64 {
    300
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_job_history() -> usize {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_max_age_secs() -> u64 {
    2 * 60 * 60
}

fn default_idle_timeout_secs() -> u64 {
    45 * 60
}

fn default_per_user_cap() -> usize {
    5
}

fn default_bind() -> String {
    "127.0.0.1:8686".to_string()
}

fn default_owner_header() -> String {
    "x-owner-id".to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.reaper.per_user_cap, 5);
        assert_eq!(config.executor.default_timeout_secs, 30);
        assert_eq!(config.bridge.poll_interval_ms, 100);
        assert_eq!((config.bridge.cols, config.bridge.rows), (80, 24));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [reaper]
            perUserCap = 2

            [docker]
            kind = "host"
            "#,
        )
        .unwrap();

        assert_eq!(config.reaper.per_user_cap, 2);
        assert_eq!(config.reaper.interval_secs, 60);
        assert_eq!(config.docker.kind, EngineKind::Host);
        assert_eq!(config.docker.name_prefix, "labterm_");
        assert_eq!(config.profile(SessionMode::IsolatedReadonly).image, "ubuntu:22.04");
    }

    #[test]
    fn test_merge_other_wins_for_non_defaults() {
        let mut base = EngineConfig::default();
        base.reaper.per_user_cap = 3;

        let mut other = EngineConfig::default();
        other.executor.workers = 8;
        other.policy.extra_deny_patterns.push(r"nc\s+-l".into());

        base.merge(other);
        assert_eq!(base.reaper.per_user_cap, 3);
        assert_eq!(base.executor.workers, 8);
        assert_eq!(base.policy.extra_deny_patterns.len(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.reaper.per_user_cap = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.executor.default_timeout_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_timeout_is_clamped() {
        let settings = ExecutorSettings::default();
        assert_eq!(settings.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(settings.effective_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(settings.effective_timeout(Some(10_000)), Duration::from_secs(300));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labterm.json");
        std::fs::write(&path, r#"{"server":{"bind":"0.0.0.0:9000"}}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.owner_header, "x-owner-id");
    }
}
