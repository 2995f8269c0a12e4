//! Session Registry
//!
//! Single source of truth for "is this session live". Inserts are
//! check-and-insert and removals are delete-and-return, each under one write
//! lock, so two cleanup triggers for the same session race to one winner.

use crate::bridge::{AttachKind, IoHandle, OutputGate};
use crate::container::ContainerRef;
use crate::guard::InputGuard;
use crate::state::ChannelState;
use chrono::{DateTime, Utc};
use labterm_foundation::SessionMode;
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ============================================================================
// SessionSlot
// ============================================================================

/// Terminal side of an attached session
#[derive(Clone)]
pub struct Terminal {
    pub kind: AttachKind,
    pub io: Arc<Mutex<IoHandle>>,
}

/// One registry entry, from reservation to removal
pub struct SessionSlot {
    pub session_id: String,
    pub owner_id: String,
    pub mode: SessionMode,
    pub created_at: DateTime<Utc>,
    /// Stops the reader loop
    pub token: CancellationToken,
    pub gate: Arc<OutputGate>,
    /// Tracks the typed line when the mode guards input
    pub guard: Option<parking_lot::Mutex<InputGuard>>,
    /// False for out-of-band exec contexts, which no terminal may join
    interactive: bool,
    state: SyncRwLock<ChannelState>,
    container: SyncRwLock<Option<ContainerRef>>,
    terminal: SyncRwLock<Option<Terminal>>,
    last_activity: SyncRwLock<DateTime<Utc>>,
}

impl SessionSlot {
    pub fn new(session_id: impl Into<String>, owner_id: impl Into<String>, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            mode,
            created_at: now,
            token: CancellationToken::new(),
            gate: Arc::new(OutputGate::new()),
            guard: None,
            interactive: true,
            state: SyncRwLock::new(ChannelState::Provisioning),
            container: SyncRwLock::new(None),
            terminal: SyncRwLock::new(None),
            last_activity: SyncRwLock::new(now),
        }
    }

    pub fn with_input_guard(mut self, enabled: bool) -> Self {
        self.guard = enabled.then(|| parking_lot::Mutex::new(InputGuard::new()));
        self
    }

    /// Mark as a one-shot exec context
    pub fn transient(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    /// Apply `next` if the state machine allows it
    pub fn transition(&self, next: ChannelState) -> bool {
        let mut state = self.state.write();
        if state.can_transition_to(next) {
            debug!(session_id = %self.session_id, from = %*state, to = %next, "Session state");
            *state = next;
            true
        } else {
            false
        }
    }

    /// Atomically move into cleanup. Returns the state it left: `Attached`
    /// (now `CleaningUp`), `Provisioning` (now `Terminated`, the start task
    /// tears down), or `None` when cleanup already happened.
    pub fn begin_cleanup(&self) -> Option<ChannelState> {
        let mut state = self.state.write();
        let previous = *state;
        match previous {
            ChannelState::Attached => *state = ChannelState::CleaningUp,
            ChannelState::Unsubscribed | ChannelState::Provisioning => {
                *state = ChannelState::Terminated
            }
            ChannelState::CleaningUp | ChannelState::Terminated => return None,
        }
        Some(previous)
    }

    pub fn container(&self) -> Option<ContainerRef> {
        self.container.read().clone()
    }

    pub fn container_name(&self) -> Option<String> {
        self.container.read().as_ref().map(|c| c.name.clone())
    }

    pub fn set_container(&self, container: ContainerRef) {
        *self.container.write() = Some(container);
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal.read().clone()
    }

    pub fn set_terminal(&self, terminal: Terminal) {
        *self.terminal.write() = Some(terminal);
    }

    pub fn take_terminal(&self) -> Option<Terminal> {
        self.terminal.write().take()
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            owner_id: self.owner_id.clone(),
            mode: self.mode,
            container: self.container_name(),
            attach: self.terminal.read().as_ref().map(|t| t.kind),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            state: self.state(),
        }
    }
}

impl std::fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("session_id", &self.session_id)
            .field("owner_id", &self.owner_id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("container", &self.container_name())
            .finish()
    }
}

/// Snapshot for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub owner_id: String,
    pub mode: SessionMode,
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach: Option<AttachKind>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: ChannelState,
}

// ============================================================================
// Registry
// ============================================================================

/// Result of a check-and-insert
#[derive(Debug)]
pub enum Reservation {
    /// Id was free; this slot is now registered
    Reserved(Arc<SessionSlot>),
    /// Id already taken by this slot
    Existing(Arc<SessionSlot>),
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `slot` unless its id is already present
    pub async fn reserve(&self, slot: SessionSlot) -> Reservation {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&slot.session_id) {
            return Reservation::Existing(Arc::clone(existing));
        }
        let slot = Arc::new(slot);
        sessions.insert(slot.session_id.clone(), Arc::clone(&slot));
        Reservation::Reserved(slot)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Remove and return; `None` for every caller but the first
    pub async fn take(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Remove only if the entry is still `slot` (not a newer session under the same id)
    pub async fn take_slot(&self, slot: &Arc<SessionSlot>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&slot.session_id) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                sessions.remove(&slot.session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn owned_by(&self, owner_id: &str) -> Vec<Arc<SessionSlot>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: &str, owner: &str) -> SessionSlot {
        SessionSlot::new(id, owner, SessionMode::IsolatedReadonly)
    }

    #[tokio::test]
    async fn test_reserve_rejects_duplicate() {
        let registry = Registry::new();
        assert!(matches!(registry.reserve(slot("s1", "a")).await, Reservation::Reserved(_)));

        match registry.reserve(slot("s1", "b")).await {
            Reservation::Existing(existing) => assert_eq!(existing.owner_id, "a"),
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reserve_has_one_winner() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                matches!(registry.reserve(slot("same", "a")).await, Reservation::Reserved(_))
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_take_is_idempotent() {
        let registry = Registry::new();
        registry.reserve(slot("s1", "a")).await;

        assert!(registry.take("s1").await.is_some());
        assert!(registry.take("s1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_take_slot_ignores_newer_session() {
        let registry = Registry::new();
        let old = match registry.reserve(slot("s1", "a")).await {
            Reservation::Reserved(s) => s,
            _ => unreachable!(),
        };
        registry.take("s1").await;
        registry.reserve(slot("s1", "a")).await;

        assert!(!registry.take_slot(&old).await);
        assert!(registry.contains("s1").await);
    }

    #[test]
    fn test_transient_slot_is_not_interactive() {
        assert!(slot("s1", "a").is_interactive());
        assert!(!slot("exec-1", "a").transient().is_interactive());
    }

    #[test]
    fn test_slot_state_machine() {
        let s = slot("s1", "a");
        assert_eq!(s.state(), ChannelState::Provisioning);
        assert!(!s.transition(ChannelState::CleaningUp));
        assert!(s.transition(ChannelState::Attached));
        assert!(s.transition(ChannelState::CleaningUp));
        assert!(!s.transition(ChannelState::CleaningUp));
        assert!(s.transition(ChannelState::Terminated));
    }

    #[test]
    fn test_begin_cleanup_runs_once() {
        let s = slot("s1", "a");
        s.transition(ChannelState::Attached);
        assert_eq!(s.begin_cleanup(), Some(ChannelState::Attached));
        assert_eq!(s.begin_cleanup(), None);

        let provisioning = slot("s2", "a");
        assert_eq!(provisioning.begin_cleanup(), Some(ChannelState::Provisioning));
        assert_eq!(provisioning.state(), ChannelState::Terminated);
        assert!(!provisioning.transition(ChannelState::Attached));
    }
}
