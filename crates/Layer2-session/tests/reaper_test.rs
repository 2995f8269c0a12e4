//! Reaper 통합 테스트 (HostEngine)

mod common;

use async_trait::async_trait;
use common::*;
use labterm_foundation::{streams, EngineConfig, Result, SessionMode};
use labterm_session::{
    ClientMessage, ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput, HostEngine,
    LabEngine, ProvisionRequest, ShellLaunch,
};
use std::sync::Arc;
use std::time::Duration;

/// HostEngine whose `stop` stalls for containers named `*ghost*`
struct SlowStop {
    inner: Arc<HostEngine>,
    delay: Duration,
}

#[async_trait]
impl ContainerEngine for SlowStop {
    fn name(&self) -> &'static str {
        "slow-stop"
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.inner.create(spec).await
    }

    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<ContainerInfo>> {
        self.inner.list(labels).await
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        if name.contains("ghost") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.stop(name, grace).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.inner.remove(name).await
    }

    async fn exec(&self, name: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.inner.exec(name, command, timeout).await
    }

    fn shell_launch(&self, name: &str, shell: &str) -> ShellLaunch {
        self.inner.shell_launch(name, shell)
    }
}

async fn provision_bare(engine: &LabEngine, session_id: &str, owner: &str) -> String {
    engine
        .manager()
        .provisioner()
        .provision(&ProvisionRequest::new(session_id, owner, SessionMode::IsolatedReadonly))
        .await
        .expect("provision")
        .name
}

#[tokio::test]
async fn test_orphan_container_removed_once() {
    let (engine, host) = engine();
    let name = provision_bare(&engine, "ghost", "42").await;
    let keys = engine.manager().provisioner().labels().clone();
    assert!(host.backdate(&name, &keys, 120));

    let report = engine.reaper().sweep().await;
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.removed(), 1);
    assert_eq!(report.failures, 0);
    assert!(!host.exists(&name));

    // idempotent
    let again = engine.reaper().sweep().await;
    assert_eq!(again.removed(), 0);
    assert_eq!(host.removed_total(), 1);
}

#[tokio::test]
async fn test_expired_session_is_closed() {
    let mut config = EngineConfig::default();
    config.reaper.max_age_secs = 60;
    let (engine, host) = engine_with(config);
    let mut rx = engine.bus().stream(&streams::terminal("old"));
    let mut channel = engine.channel(Some("alice".into()));

    channel
        .handle(ClientMessage::Subscribe {
            session_id: Some("old".into()),
            image: None,
            mode: SessionMode::IsolatedReadonly,
        })
        .await;
    wait_for_status(&mut rx, "attached").await;

    let name = engine.manager().provisioner().container_name("old");
    let keys = engine.manager().provisioner().labels().clone();
    assert!(host.backdate(&name, &keys, 3600));

    let report = engine.reaper().sweep().await;
    assert_eq!(report.expired, 1);
    wait_for_status(&mut rx, "terminated").await;
    assert!(host.is_empty());
    assert!(engine.manager().registry().is_empty().await);
}

#[tokio::test]
async fn test_per_user_cap_keeps_newest() {
    let (engine, host) = engine();
    let keys = engine.manager().provisioner().labels().clone();

    let mut names = Vec::new();
    for i in 0..6 {
        let session_id = format!("cap-{}", i);
        let mut rx = engine.bus().stream(&streams::terminal(&session_id));
        let mut channel = engine.channel(Some("carol".into()));
        channel
            .handle(ClientMessage::Subscribe {
                session_id: Some(session_id.clone()),
                image: None,
                mode: SessionMode::IsolatedReadonly,
            })
            .await;
        wait_for_status(&mut rx, "attached").await;

        let name = engine.manager().provisioner().container_name(&session_id);
        // older sessions get older labels
        host.backdate(&name, &keys, 600 - i as i64 * 60);
        names.push(name);
    }

    // attaching the sixth already enforced the cap
    let manager = engine.manager().clone();
    eventually(|| {
        let manager = manager.clone();
        async move { manager.registry().len().await == 5 }
    })
    .await;
    assert_eq!(host.len(), 5);
    assert!(!host.exists(&names[0]), "oldest container goes first");
    assert!(host.exists(&names[5]));

    let report = engine.reaper().sweep().await;
    assert_eq!(report.over_cap, 0);
    assert_eq!(host.len(), 5);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cap_pass_over_bare_containers() {
    let (engine, host) = engine();
    let keys = engine.manager().provisioner().labels().clone();
    for i in 0..7 {
        let name = provision_bare(&engine, &format!("bare-{}", i), "dave").await;
        host.backdate(&name, &keys, 100 - i as i64);
    }

    let report = engine.reaper().sweep().await;
    assert_eq!(report.over_cap, 2);
    // the rest have no session behind them
    assert_eq!(report.orphaned, 5);
    assert!(host.is_empty());
}

#[tokio::test]
async fn test_idle_session_evicted() {
    let mut config = EngineConfig::default();
    config.reaper.idle_timeout_secs = 0;
    let (engine, host) = engine_with(config);
    let mut rx = engine.bus().stream(&streams::terminal("sleepy"));
    let mut channel = engine.channel(Some("erin".into()));

    channel
        .handle(ClientMessage::Subscribe {
            session_id: Some("sleepy".into()),
            image: None,
            mode: SessionMode::IsolatedReadonly,
        })
        .await;
    wait_for_status(&mut rx, "attached").await;
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let report = engine.reaper().sweep().await;
    assert_eq!(report.idle, 1);
    assert!(host.is_empty());
}

#[tokio::test]
async fn test_sweep_survives_engine_outage() {
    let (engine, host) = engine();
    host.set_available(false);
    let report = engine.reaper().sweep().await;
    assert!(report.failures > 0);
    assert_eq!(report.removed(), 0);
}

#[tokio::test]
async fn test_session_without_container_is_dropped() {
    let (engine, host) = engine();
    let mut rx = engine.bus().stream(&streams::terminal("vanished"));
    let mut channel = engine.channel(Some("frank".into()));

    channel
        .handle(ClientMessage::Subscribe {
            session_id: Some("vanished".into()),
            image: None,
            mode: SessionMode::IsolatedReadonly,
        })
        .await;
    wait_for_status(&mut rx, "attached").await;

    // container disappears behind the registry's back
    let name = engine.manager().provisioner().container_name("vanished");
    host.remove(&name).await.expect("remove");

    let report = engine.reaper().sweep().await;
    assert_eq!(report.stale_entries, 1);
    assert_eq!(report.orphaned, 0);
    wait_for_status(&mut rx, "terminated").await;
    assert!(!engine.manager().registry().contains("vanished").await);
}

#[tokio::test]
async fn test_session_attached_mid_sweep_survives() {
    let host = Arc::new(HostEngine::new());
    let slow = Arc::new(SlowStop {
        inner: host.clone(),
        delay: Duration::from_millis(1500),
    });
    let engine = Arc::new(LabEngine::with_engine(EngineConfig::default(), slow).expect("engine"));
    provision_bare(&engine, "ghost", "42").await;

    let sweep = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.reaper().sweep().await })
    };
    // first listing is taken, the ghost's stop is stalling
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut rx = engine.bus().stream(&streams::terminal("healthy"));
    let mut channel = engine.channel(Some("gina".into()));
    channel
        .handle(ClientMessage::Subscribe {
            session_id: Some("healthy".into()),
            image: None,
            mode: SessionMode::IsolatedReadonly,
        })
        .await;
    wait_for_status(&mut rx, "attached").await;

    let report = sweep.await.expect("sweep task");
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.stale_entries, 0);
    assert!(engine.manager().registry().contains("healthy").await);
    assert!(host.exists(&engine.manager().provisioner().container_name("healthy")));

    engine.shutdown().await;
}
