//! Subcommand implementations

use anyhow::{bail, Context, Result};
use chrono::Utc;
use labterm_foundation::{EngineConfig, EngineKind, SessionMode, Validator};
use labterm_session::{ExecRequest, JobState, LabEngine};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    EngineConfig::load(explicit).context("loading configuration")
}

fn build_engine(mut config: EngineConfig, kind: Option<EngineKind>) -> Result<LabEngine> {
    if let Some(kind) = kind {
        config.docker.kind = kind;
    }
    LabEngine::from_config(config).context("starting container engine")
}

pub async fn serve(
    mut config: EngineConfig,
    bind: Option<String>,
    kind: Option<EngineKind>,
) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let engine = Arc::new(build_engine(config, kind)?);
    info!(engine = engine.manager().provisioner().engine().name(), "Engine ready");

    labterm_server::serve(engine, labterm_server::shutdown_signal())
        .await
        .context("running server")
}

/// Returns the process exit code
pub async fn exec(
    config: EngineConfig,
    kind: Option<EngineKind>,
    owner: &str,
    command: &str,
    mode: SessionMode,
    timeout: Option<u64>,
    json: bool,
) -> Result<i32> {
    let engine = build_engine(config, kind)?;

    let mut request = ExecRequest::new(command).with_mode(mode);
    if let Some(secs) = timeout {
        request = request.with_timeout(secs);
    }

    let executor = engine.executor();
    let id = match executor.execute(owner, request).await {
        Ok(id) => id,
        Err(e) => {
            engine.shutdown().await;
            bail!("{}", e);
        }
    };

    let record = loop {
        match executor.status(id).await {
            Some(record) if record.state.is_terminal() => break record,
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    };
    engine.shutdown().await;

    match (record.state, record.result) {
        (JobState::Completed, Some(result)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
                if result.timed_out {
                    eprintln!("labterm: command timed out");
                }
            }
            Ok(i32::try_from(result.exit_status).unwrap_or(1))
        }
        (state, _) => bail!(
            "job {} ended {:?}: {}",
            id,
            state,
            record.last_error.unwrap_or_default()
        ),
    }
}

/// `true` when the command is allowed
pub fn check(config: &EngineConfig, command: &str, mode: SessionMode) -> Result<bool> {
    let validator = Validator::from_config(config).context("building command policy")?;
    let verdict = validator.validate(mode, command);
    if verdict.allowed {
        println!("allowed ({})", mode);
    } else {
        println!(
            "rejected ({}): {}",
            mode,
            verdict.reason.unwrap_or_else(|| "command rejected".to_string())
        );
    }
    Ok(verdict.allowed)
}

pub async fn reap(config: EngineConfig, kind: Option<EngineKind>, dry_run: bool) -> Result<()> {
    let engine = build_engine(config, kind)?;
    let provisioner = engine.manager().provisioner();

    if dry_run {
        let keys = provisioner.labels();
        let now = Utc::now();
        for container in provisioner.list_managed().await.context("listing containers")? {
            let age = container
                .age(keys, now)
                .map(|a| format!("{}s", a.num_seconds()))
                .unwrap_or_else(|| "?".to_string());
            println!(
                "{}\towner={}\tsession={}\tage={}",
                container.name,
                container.owner(keys).unwrap_or("-"),
                container.session_id(keys).unwrap_or("-"),
                age
            );
        }
        return Ok(());
    }

    let report = engine.reaper().sweep().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.shutdown().await;
    Ok(())
}

pub fn print_config(config: &EngineConfig) -> Result<()> {
    print!("{}", config.to_toml().context("rendering configuration")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_check_uses_mode_allow_set() {
        let config = EngineConfig::default();
        assert!(check(&config, "ls -la", SessionMode::IsolatedReadonly).unwrap());
        assert!(!check(&config, "docker ps", SessionMode::IsolatedReadonly).unwrap());
        assert!(check(&config, "docker ps", SessionMode::Privileged).unwrap());
        assert!(!check(&config, "rm -rf /", SessionMode::Privileged).unwrap());
    }

    #[test]
    fn test_explicit_config_layer() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[reaper]\nperUserCap = 3").unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.reaper.per_user_cap, 3);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[reaper]\nperUserCap = 0").unwrap();

        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("perUserCap"));
    }
}
