//! Session Channel
//!
//! One per client connection. Turns client messages into manager/executor
//! calls and owns the event receiver the transport forwards to the client.

use crate::executor::{ExecOptions, ExecRequest, OutOfBandExecutor};
use crate::manager::{SessionManager, SubscribeRequest};
use crate::state::ChannelState;
use labterm_foundation::{streams, Error, LabEvent, ServerEvent, SessionMode, StreamReceiver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

/// Client -> server, tagged by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        mode: SessionMode,
    },
    Input {
        input: String,
    },
    Resize {
        resize: TermSize,
    },
    Unsubscribe,
    Execute {
        command: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        options: ExecOptions,
    },
    #[serde(other)]
    Unknown,
}

/// Direct answer to one client message
#[derive(Debug, Default)]
pub struct Reply {
    pub events: Vec<ServerEvent>,
    /// Transport should close the connection after sending `events`
    pub close: bool,
}

impl Reply {
    fn none() -> Self {
        Self::default()
    }

    fn event(event: ServerEvent) -> Self {
        Self {
            events: vec![event],
            close: false,
        }
    }

    fn error(err: &Error) -> Self {
        Self::event(ServerEvent::from_error(err))
    }
}

pub struct SessionChannel {
    owner_id: Option<String>,
    manager: Arc<SessionManager>,
    executor: Arc<OutOfBandExecutor>,
    receiver: StreamReceiver,
    session_id: Option<String>,
    state: ChannelState,
}

impl SessionChannel {
    /// `owner_id` comes from the upstream identity provider; `None` when absent
    pub fn new(
        owner_id: Option<String>,
        manager: Arc<SessionManager>,
        executor: Arc<OutOfBandExecutor>,
    ) -> Self {
        let owner_id = owner_id.filter(|o| !o.trim().is_empty());
        let streams = owner_id.iter().map(|o| streams::owner(o)).collect();
        let receiver = manager.bus().streams(streams);
        Self {
            owner_id,
            manager,
            executor,
            receiver,
            session_id: None,
            state: ChannelState::Unsubscribed,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// This connection's view; the session slot's own state once subscribed
    pub async fn state(&self) -> ChannelState {
        match &self.session_id {
            Some(id) => match self.manager.registry().get(id).await {
                Some(slot) => slot.state(),
                None => ChannelState::Terminated,
            },
            None => self.state,
        }
    }

    /// Next event for this client; `None` once the bus is gone
    pub async fn next_event(&mut self) -> Option<LabEvent> {
        self.receiver.recv().await
    }

    /// Parse and handle one text frame
    pub async fn handle_text(&mut self, text: &str) -> Reply {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                debug!("Unparseable client message: {}", e);
                Reply::error(&Error::InvalidInput(format!("invalid message: {}", e)))
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Reply {
        match message {
            ClientMessage::Subscribe {
                session_id,
                image,
                mode,
            } => self.subscribe(session_id, image, mode).await,
            ClientMessage::Input { input } => self.input(input.as_bytes()).await,
            ClientMessage::Resize { resize } => self.resize(resize).await,
            ClientMessage::Unsubscribe => self.unsubscribe().await,
            ClientMessage::Execute {
                command,
                session_id,
                options,
            } => self.execute(command, session_id, options).await,
            ClientMessage::Unknown => {
                debug!("Ignoring unknown client action");
                Reply::none()
            }
        }
    }

    async fn subscribe(
        &mut self,
        session_id: Option<String>,
        image: Option<String>,
        mode: SessionMode,
    ) -> Reply {
        let Some(owner_id) = self.owner_id.clone() else {
            self.state = ChannelState::Terminated;
            return Reply {
                events: vec![ServerEvent::from_error(&Error::OwnerMissing)],
                close: true,
            };
        };

        if let Some(current) = self.session_id.clone() {
            if session_id.as_deref() == Some(current.as_str()) {
                return Reply::event(ServerEvent::Subscribed {
                    session_id: current,
                    resumed: true,
                });
            }
            // switching sessions releases the previous one
            self.unsubscribe().await;
        }

        let request = SubscribeRequest::new(session_id, mode).with_image(image);
        let stream = streams::terminal(&request.session_id);
        // watch before provisioning starts so no output is missed
        self.receiver.add_stream(stream.clone());

        match self.manager.subscribe(&owner_id, request).await {
            Ok(subscription) => {
                self.session_id = Some(subscription.session_id.clone());
                self.state = ChannelState::Provisioning;
                let mut reply = Reply::event(ServerEvent::Subscribed {
                    session_id: subscription.session_id,
                    resumed: subscription.resumed,
                });
                if subscription.resumed {
                    // repaint what the terminal showed so far
                    let replayed = self.manager.bus().replay(&stream).await;
                    reply.events.extend(replayed.into_iter().map(|e| e.payload));
                }
                reply
            }
            Err(e) => {
                self.receiver.remove_stream(&stream);
                self.state = ChannelState::Terminated;
                info!(owner_id = %owner_id, "Subscribe refused: {}", e);
                Reply::error(&e)
            }
        }
    }

    async fn input(&mut self, bytes: &[u8]) -> Reply {
        let (Some(owner_id), Some(session_id)) = (&self.owner_id, &self.session_id) else {
            return Reply::none();
        };
        match self.manager.send_input(session_id, owner_id, bytes).await {
            Ok(()) => Reply::none(),
            Err(e) => Reply::error(&e),
        }
    }

    async fn resize(&mut self, size: TermSize) -> Reply {
        let (Some(owner_id), Some(session_id)) = (&self.owner_id, &self.session_id) else {
            return Reply::none();
        };
        match self
            .manager
            .resize(session_id, owner_id, size.cols, size.rows)
            .await
        {
            Ok(()) => Reply::none(),
            Err(e) => Reply::error(&e),
        }
    }

    async fn unsubscribe(&mut self) -> Reply {
        let Some(session_id) = self.session_id.take() else {
            return Reply::none();
        };
        self.receiver.remove_stream(&streams::terminal(&session_id));
        self.state = ChannelState::Terminated;

        if let Some(owner_id) = &self.owner_id {
            match self.manager.unsubscribe(&session_id, owner_id).await {
                // already closed by another trigger
                Ok(_) | Err(Error::SessionNotFound(_)) => {}
                Err(e) => return Reply::error(&e),
            }
        }
        Reply::event(ServerEvent::Status {
            session_id,
            state: ChannelState::Terminated.to_string(),
        })
    }

    async fn execute(
        &mut self,
        command: String,
        session_id: Option<String>,
        options: ExecOptions,
    ) -> Reply {
        let Some(owner_id) = self.owner_id.clone() else {
            return Reply::error(&Error::OwnerMissing);
        };
        let request = ExecRequest {
            command,
            session_id: session_id.or_else(|| self.session_id.clone()),
            options,
        };
        // acks, results and refusals all arrive on the owner stream
        if let Err(e) = self.executor.execute(&owner_id, request).await {
            debug!(owner_id = %owner_id, "Execute refused: {}", e);
        }
        Reply::none()
    }

    /// Connection closed: implicit unsubscribe
    pub async fn close(&mut self) {
        if self.session_id.is_some() {
            self.unsubscribe().await;
        }
    }
}
