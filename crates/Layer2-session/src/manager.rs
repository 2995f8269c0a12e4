//! Session Manager
//!
//! Owns the lifecycle of interactive sessions: reserve in the registry,
//! provision, attach, stream, and converge every close trigger (unsubscribe,
//! shell EOF, reaper eviction, shutdown) onto a single teardown.

use crate::bridge::{AttachKind, Bridge, PLAIN_PROMPT, ReaderExit, ReaderLoop};
use crate::container::{ContainerInfo, ContainerRef, ProvisionRequest, Provisioner};
use crate::guard::{cancel_sequence, GuardStep};
use crate::registry::{Registry, Reservation, SessionSlot, SessionSummary, Terminal};
use crate::state::{ChannelState, CloseReason};
use labterm_foundation::{
    streams, EngineConfig, Error, EventBus, ModeProfiles, Result, ServerEvent, SessionMode,
    Validator,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Subscribe request after the session id has been settled
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub session_id: String,
    pub mode: SessionMode,
    pub image: Option<String>,
}

impl SubscribeRequest {
    /// Uses `session_id` when given, else a fresh uuid
    pub fn new(session_id: Option<String>, mode: SessionMode) -> Self {
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            session_id,
            mode,
            image: None,
        }
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub session_id: String,
    /// Joined a session that already existed
    pub resumed: bool,
}

pub struct SessionManager {
    registry: Arc<Registry>,
    provisioner: Arc<Provisioner>,
    bridge: Bridge,
    validator: Arc<Validator>,
    bus: Arc<EventBus>,
    modes: ModeProfiles,
    per_user_cap: usize,
}

impl SessionManager {
    pub fn new(
        config: &EngineConfig,
        provisioner: Arc<Provisioner>,
        validator: Arc<Validator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            provisioner,
            bridge: Bridge::new(config.bridge.clone()),
            validator,
            bus,
            modes: config.modes.clone(),
            per_user_cap: config.reaper.per_user_cap,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ========================================================================
    // Subscribe
    // ========================================================================

    /// Establish or resume a session.
    ///
    /// Returns once the id is reserved; provisioning and attach continue in
    /// the background and report on `terminal:<session_id>`.
    pub async fn subscribe(
        self: &Arc<Self>,
        owner_id: &str,
        request: SubscribeRequest,
    ) -> Result<Subscription> {
        if owner_id.trim().is_empty() {
            return Err(Error::OwnerMissing);
        }

        let guard_input = self.modes.get(request.mode).guard_input;
        let slot = SessionSlot::new(&request.session_id, owner_id, request.mode)
            .with_input_guard(guard_input);

        let slot = match self.registry.reserve(slot).await {
            Reservation::Existing(existing) => {
                if existing.owner_id != owner_id {
                    warn!(
                        session_id = %request.session_id,
                        owner_id = %owner_id,
                        "Subscribe to a session owned by someone else"
                    );
                    return Err(Error::Unauthorized(format!(
                        "session {} belongs to another user",
                        request.session_id
                    )));
                }
                if !existing.is_interactive() {
                    warn!(
                        session_id = %request.session_id,
                        owner_id = %owner_id,
                        "Subscribe to an out-of-band exec context"
                    );
                    return Err(Error::SessionExists(request.session_id));
                }
                info!(session_id = %request.session_id, owner_id = %owner_id, "Session resumed");
                return Ok(Subscription {
                    session_id: request.session_id,
                    resumed: true,
                });
            }
            Reservation::Reserved(slot) => slot,
        };

        info!(
            session_id = %slot.session_id,
            owner_id = %owner_id,
            mode = %request.mode,
            "Session reserved"
        );
        // a reused id must not repaint an earlier session's screen
        self.bus.forget(&streams::terminal(&slot.session_id)).await;

        let manager = Arc::clone(self);
        let image = request.image.clone();
        tokio::spawn(async move {
            manager.start(slot, image).await;
        });

        Ok(Subscription {
            session_id: request.session_id,
            resumed: false,
        })
    }

    /// provisioning -> attached, or provisioning -> terminated
    async fn start(self: Arc<Self>, slot: Arc<SessionSlot>, image: Option<String>) {
        let stream = streams::terminal(&slot.session_id);
        slot.gate
            .publish(
                &self.bus,
                &stream,
                ServerEvent::Status {
                    session_id: slot.session_id.clone(),
                    state: ChannelState::Provisioning.to_string(),
                },
            )
            .await;

        let request = ProvisionRequest::new(&slot.session_id, &slot.owner_id, slot.mode)
            .with_image(image);
        let container = match self.provisioner.provision(&request).await {
            Ok(container) => container,
            Err(e) => {
                self.fail_start(&slot, e).await;
                return;
            }
        };
        slot.set_container(container.clone());

        if slot.token.is_cancelled() {
            debug!(session_id = %slot.session_id, "Closed while provisioning");
            self.provisioner.teardown(&container.name).await;
            return;
        }

        let profile = self.modes.get(slot.mode);
        let launch = self
            .provisioner
            .engine()
            .shell_launch(&container.name, &profile.shell);

        let (kind, attached) = match self.bridge.attach(&launch).into_result() {
            Ok(ok) => ok,
            Err(e) => {
                self.provisioner.teardown(&container.name).await;
                self.fail_start(&slot, e).await;
                return;
            }
        };

        let io = Arc::new(Mutex::new(attached.handle));
        slot.set_terminal(Terminal {
            kind,
            io: Arc::clone(&io),
        });

        if !slot.transition(ChannelState::Attached) {
            // cleanup won the race while we were attaching
            io.lock().await.kill();
            self.provisioner.teardown(&container.name).await;
            return;
        }

        info!(
            session_id = %slot.session_id,
            container = %container.name,
            attach = ?kind,
            "Session attached"
        );

        slot.gate
            .publish(
                &self.bus,
                &stream,
                ServerEvent::Status {
                    session_id: slot.session_id.clone(),
                    state: ChannelState::Attached.to_string(),
                },
            )
            .await;
        if kind == AttachKind::Plain {
            slot.gate
                .publish(&self.bus, &stream, ServerEvent::output(PLAIN_PROMPT))
                .await;
        }

        let reader = ReaderLoop {
            session_id: slot.session_id.clone(),
            stream,
            bus: Arc::clone(&self.bus),
            gate: Arc::clone(&slot.gate),
            io,
            token: slot.token.clone(),
            poll_interval: self.bridge.settings().poll_interval(),
        };
        let manager = Arc::clone(&self);
        let reader_slot = Arc::clone(&slot);
        tokio::spawn(async move {
            let exit = reader.run(attached.output).await;
            if exit != ReaderExit::Cancelled {
                debug!(session_id = %reader_slot.session_id, ?exit, "Reader loop finished");
                manager.close_slot(&reader_slot, CloseReason::Eof).await;
            }
        });

        self.enforce_owner_cap(&slot.owner_id, Some(&container)).await;
    }

    async fn fail_start(&self, slot: &Arc<SessionSlot>, err: Error) {
        error!(session_id = %slot.session_id, "Session start failed: {}", err);

        let stream = streams::terminal(&slot.session_id);
        slot.gate
            .publish(
                &self.bus,
                &stream,
                ServerEvent::output(format!("\x1b[31mError: {}\x1b[0m\r\n", err)),
            )
            .await;
        slot.gate
            .publish(&self.bus, &stream, ServerEvent::from_error(&err))
            .await;

        slot.token.cancel();
        slot.gate.close().await;
        slot.transition(ChannelState::Terminated);
        self.registry.take_slot(slot).await;
        self.forget_history(slot).await;
    }

    /// Release the replay buffer once nobody can resume the id
    async fn forget_history(&self, slot: &SessionSlot) {
        if !self.registry.contains(&slot.session_id).await {
            self.bus.forget(&streams::terminal(&slot.session_id)).await;
        }
    }

    // ========================================================================
    // Input / resize
    // ========================================================================

    async fn owned_slot(&self, session_id: &str, owner_id: &str) -> Result<Arc<SessionSlot>> {
        let slot = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if slot.owner_id != owner_id {
            return Err(Error::Unauthorized(format!(
                "session {} belongs to another user",
                session_id
            )));
        }
        Ok(slot)
    }

    /// Forward typed bytes. Ignored until the session is attached.
    pub async fn send_input(&self, session_id: &str, owner_id: &str, input: &[u8]) -> Result<()> {
        let slot = self.owned_slot(session_id, owner_id).await?;
        if !slot.state().accepts_input() {
            debug!(session_id, state = %slot.state(), "Input ignored");
            return Ok(());
        }
        let terminal = slot
            .terminal()
            .ok_or_else(|| Error::SessionClosed(session_id.to_string()))?;

        slot.touch();
        let mut io = terminal.io.lock().await;

        let steps = match &slot.guard {
            Some(guard) => {
                let validator = &self.validator;
                let mode = slot.mode;
                guard
                    .lock()
                    .feed(input, |line| validator.validate(mode, line))
            }
            None => vec![GuardStep::Forward(input.to_vec())],
        };

        for step in steps {
            match step {
                GuardStep::Forward(bytes) => io.write(&bytes).await?,
                GuardStep::Reject { line, reason } => {
                    io.write(cancel_sequence()).await?;
                    warn!(session_id, command = %line, "Interactive command rejected: {}", reason);
                    let err = Error::rejected(reason);
                    slot.gate
                        .publish(
                            &self.bus,
                            &streams::terminal(session_id),
                            ServerEvent::from_error(&err),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, owner_id: &str, cols: u16, rows: u16) -> Result<()> {
        let slot = self.owned_slot(session_id, owner_id).await?;
        if !slot.state().accepts_input() {
            return Ok(());
        }
        match slot.terminal() {
            Some(terminal) => terminal.io.lock().await.resize(cols, rows),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Client unsubscribe; only the owner may close
    pub async fn unsubscribe(&self, session_id: &str, owner_id: &str) -> Result<bool> {
        let slot = self.owned_slot(session_id, owner_id).await?;
        Ok(self.close_slot(&slot, CloseReason::Unsubscribed).await)
    }

    /// Close by id. `false` when nothing was live (already closed elsewhere).
    pub async fn close(&self, session_id: &str, reason: CloseReason) -> bool {
        match self.registry.take(session_id).await {
            Some(slot) => {
                self.cleanup(&slot, reason).await;
                true
            }
            None => false,
        }
    }

    /// Reaper entry point
    pub async fn evict(&self, session_id: &str, reason: CloseReason) -> bool {
        self.close(session_id, reason).await
    }

    async fn close_slot(&self, slot: &Arc<SessionSlot>, reason: CloseReason) -> bool {
        if self.registry.take_slot(slot).await {
            self.cleanup(slot, reason).await;
            true
        } else {
            false
        }
    }

    /// Runs once per slot: whoever took it from the registry
    async fn cleanup(&self, slot: &Arc<SessionSlot>, reason: CloseReason) {
        slot.token.cancel();

        match slot.begin_cleanup() {
            Some(ChannelState::Attached) => {}
            Some(_) => {
                // the start task notices too; a second teardown is harmless
                slot.gate.close().await;
                if let Some(name) = slot.container_name() {
                    self.provisioner.teardown(&name).await;
                }
                info!(session_id = %slot.session_id, %reason, "Session closed during provisioning");
                return;
            }
            None => return,
        }

        slot.gate.close().await;

        if let Some(terminal) = slot.take_terminal() {
            terminal.io.lock().await.kill();
        }
        if let Some(name) = slot.container_name() {
            self.provisioner.teardown(&name).await;
        }

        slot.transition(ChannelState::Terminated);
        self.bus
            .emit(
                streams::terminal(&slot.session_id),
                ServerEvent::Status {
                    session_id: slot.session_id.clone(),
                    state: ChannelState::Terminated.to_string(),
                },
            )
            .await;

        info!(
            session_id = %slot.session_id,
            owner_id = %slot.owner_id,
            %reason,
            "Session closed"
        );
        self.forget_history(slot).await;
    }

    /// Close everything (process shutdown)
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for slot in self.registry.list().await {
            if self.close_slot(&slot, CloseReason::Shutdown).await {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "Closed sessions on shutdown");
        }
        closed
    }

    // ========================================================================
    // Listing / quota
    // ========================================================================

    pub async fn list(&self, owner_id: Option<&str>) -> Vec<SessionSummary> {
        let slots = match owner_id {
            Some(owner) => self.registry.owned_by(owner).await,
            None => self.registry.list().await,
        };
        let mut summaries: Vec<SessionSummary> = slots.iter().map(|s| s.summary()).collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Remove `owner_id`'s oldest containers beyond the per-user cap.
    /// `keep` is never removed. Returns the number removed.
    pub async fn enforce_owner_cap(&self, owner_id: &str, keep: Option<&ContainerRef>) -> usize {
        let containers = match self.provisioner.list_owner(owner_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(owner_id, "Cannot list containers for cap check: {}", e);
                return 0;
            }
        };
        if containers.len() <= self.per_user_cap {
            return 0;
        }

        let excess = containers.len() - self.per_user_cap;
        let victims: Vec<&ContainerInfo> = containers
            .iter()
            .filter(|c| keep.map_or(true, |k| k.name != c.name))
            .take(excess)
            .collect();

        let mut removed = 0;
        for container in victims {
            if self.remove_container(container, CloseReason::OverCap).await {
                removed += 1;
            }
        }
        removed
    }

    /// Evict the session behind `container` if there is one, else tear the
    /// container down directly. Logs the removal once.
    pub async fn remove_container(&self, container: &ContainerInfo, reason: CloseReason) -> bool {
        let keys = self.provisioner.labels();
        let owner = container.owner(keys).unwrap_or("-");

        if let Some(session_id) = container.session_id(keys) {
            if let Some(slot) = self.registry.get(session_id).await {
                if slot.container_name().as_deref() == Some(container.name.as_str()) {
                    let closed = self.close_slot(&slot, reason).await;
                    if closed {
                        info!(container = %container.name, owner_id = %owner, %reason, "Removed container");
                    }
                    return closed;
                }
            }
        }

        match self.provisioner.try_teardown(&container.name).await {
            Ok(()) => {
                info!(container = %container.name, owner_id = %owner, %reason, "Removed container");
                true
            }
            Err(e) => {
                warn!(container = %container.name, owner_id = %owner, "Removal failed: {}", e);
                false
            }
        }
    }
}
