//! Session channel state machine

use serde::{Deserialize, Serialize};

/// Lifecycle of one session channel
///
/// ```text
/// unsubscribed -> provisioning -> attached -> cleaning_up -> terminated
///                      |                                        ^
///                      +----------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Unsubscribed,
    Provisioning,
    Attached,
    CleaningUp,
    Terminated,
}

impl ChannelState {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Terminated)
    }

    /// Input and resize are only accepted here
    pub fn accepts_input(&self) -> bool {
        matches!(self, ChannelState::Attached)
    }

    pub fn can_transition_to(&self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Unsubscribed, Provisioning)
                | (Unsubscribed, Terminated)
                | (Provisioning, Attached)
                | (Provisioning, Terminated)
                | (Attached, CleaningUp)
                | (CleaningUp, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Unsubscribed => "unsubscribed",
            ChannelState::Provisioning => "provisioning",
            ChannelState::Attached => "attached",
            ChannelState::CleaningUp => "cleaning_up",
            ChannelState::Terminated => "terminated",
        }
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState::Unsubscribed
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client unsubscribed or disconnected
    Unsubscribed,
    /// Shell exited / stream ended
    Eof,
    /// Reaper: too old
    MaxAge,
    /// Reaper: no input for too long
    Idle,
    /// Reaper or provisioning: owner over the per-user cap
    OverCap,
    /// Reaper: container without a live session
    Orphan,
    /// Reaper: session whose container disappeared
    ContainerGone,
    /// Process shutting down
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::Eof => "eof",
            CloseReason::MaxAge => "max_age",
            CloseReason::Idle => "idle",
            CloseReason::OverCap => "over_cap",
            CloseReason::Orphan => "orphan",
            CloseReason::ContainerGone => "container_gone",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            ChannelState::Unsubscribed,
            ChannelState::Provisioning,
            ChannelState::Attached,
            ChannelState::CleaningUp,
            ChannelState::Terminated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failure_shortcuts() {
        assert!(ChannelState::Unsubscribed.can_transition_to(ChannelState::Terminated));
        assert!(ChannelState::Provisioning.can_transition_to(ChannelState::Terminated));
        assert!(!ChannelState::Attached.can_transition_to(ChannelState::Terminated));
        assert!(!ChannelState::Terminated.can_transition_to(ChannelState::Provisioning));
    }

    #[test]
    fn test_only_attached_accepts_input() {
        assert!(ChannelState::Attached.accepts_input());
        assert!(!ChannelState::Provisioning.accepts_input());
        assert!(!ChannelState::CleaningUp.accepts_input());
    }
}
