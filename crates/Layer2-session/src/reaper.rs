//! Resource Reaper
//!
//! Timer-driven sweep over container metadata and the registry:
//! - per-user cap: oldest containers beyond the cap go first
//! - age / orphan: too old, or no live session behind the label
//! - idle: attached sessions without input for too long
//! - inverse: registry entries whose container is gone
//!
//! Each removal is logged once; a failing item never stops the sweep.

use crate::manager::SessionManager;
use crate::state::{ChannelState, CloseReason};
use chrono::{Duration as ChronoDuration, Utc};
use labterm_foundation::ReaperSettings;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub over_cap: usize,
    pub expired: usize,
    pub orphaned: usize,
    pub idle: usize,
    pub stale_entries: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.over_cap + self.expired + self.orphaned + self.idle + self.stale_entries
    }
}

pub struct Reaper {
    manager: Arc<SessionManager>,
    settings: ReaperSettings,
}

impl Reaper {
    pub fn new(manager: Arc<SessionManager>, settings: ReaperSettings) -> Self {
        Self { manager, settings }
    }

    pub fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    /// One full pass
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        self.cap_pass(&mut report).await;
        self.age_orphan_pass(&mut report).await;
        self.idle_pass(&mut report).await;

        if report.removed() > 0 || report.failures > 0 {
            info!(
                over_cap = report.over_cap,
                expired = report.expired,
                orphaned = report.orphaned,
                idle = report.idle,
                stale_entries = report.stale_entries,
                failures = report.failures,
                "Reaper sweep finished"
            );
        } else {
            debug!("Reaper sweep: nothing to do");
        }
        report
    }

    async fn cap_pass(&self, report: &mut SweepReport) {
        let provisioner = self.manager.provisioner();
        let containers = match provisioner.list_managed().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Reaper cannot list containers: {}", e);
                report.failures += 1;
                return;
            }
        };

        let mut per_owner: BTreeMap<&str, usize> = BTreeMap::new();
        for container in &containers {
            if let Some(owner) = container.owner(provisioner.labels()) {
                *per_owner.entry(owner).or_default() += 1;
            }
        }

        for (owner, count) in per_owner {
            if count > self.settings.per_user_cap {
                report.over_cap += self.manager.enforce_owner_cap(owner, None).await;
            }
        }
    }

    async fn age_orphan_pass(&self, report: &mut SweepReport) {
        let provisioner = self.manager.provisioner();
        let keys = provisioner.labels();
        let containers = match provisioner.list_managed().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Reaper cannot list containers: {}", e);
                report.failures += 1;
                return;
            }
        };

        let now = Utc::now();
        let max_age = ChronoDuration::seconds(self.settings.max_age_secs as i64);
        let registry = self.manager.registry();
        let mut present: HashSet<String> = HashSet::new();

        for container in &containers {
            let expired = container.age(keys, now).is_some_and(|age| age > max_age);
            let live = match container.session_id(keys) {
                Some(session_id) => registry.contains(session_id).await,
                None => false,
            };

            let reason = if expired {
                CloseReason::MaxAge
            } else if !live {
                CloseReason::Orphan
            } else {
                present.insert(container.name.clone());
                continue;
            };

            if self.manager.remove_container(container, reason).await {
                match reason {
                    CloseReason::MaxAge => report.expired += 1,
                    _ => report.orphaned += 1,
                }
            } else {
                report.failures += 1;
            }
        }

        // inverse inconsistency: attached sessions without a container
        let mut suspects = Vec::new();
        for slot in registry.list().await {
            if slot.state() != ChannelState::Attached {
                continue;
            }
            match slot.container_name() {
                Some(name) if !present.contains(&name) => suspects.push((slot, name)),
                _ => {}
            }
        }
        if suspects.is_empty() {
            return;
        }

        // the first listing is stale by now; sessions may have attached
        // while removals were awaited
        let current: HashSet<String> = match provisioner.list_managed().await {
            Ok(c) => c.into_iter().map(|c| c.name).collect(),
            Err(e) => {
                warn!("Reaper cannot re-list containers: {}", e);
                report.failures += 1;
                return;
            }
        };

        for (slot, name) in suspects {
            if current.contains(&name) {
                continue;
            }
            if self.manager.close(&slot.session_id, CloseReason::ContainerGone).await {
                debug!(session_id = %slot.session_id, container = %name, "Registry entry had no container");
                report.stale_entries += 1;
            }
        }
    }

    async fn idle_pass(&self, report: &mut SweepReport) {
        let idle_limit = ChronoDuration::seconds(self.settings.idle_timeout_secs as i64);
        let now = Utc::now();

        for slot in self.manager.registry().list().await {
            if slot.state() != ChannelState::Attached || now - slot.last_activity() <= idle_limit {
                continue;
            }
            if self.manager.evict(&slot.session_id, CloseReason::Idle).await {
                debug!(session_id = %slot.session_id, "Evicted idle session");
                report.idle += 1;
            }
        }
    }

    /// Sweep every `interval` until `token` is cancelled
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.settings.interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.settings.interval(), "Reaper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        self.sweep().await;
                    }
                }
            }
            info!("Reaper stopped");
        })
    }
}
