//! PTY/IO Bridge
//!
//! Attach is two explicit steps: try a PTY, then fall back to piped stdio.
//! The caller gets a tagged [`AttachOutcome`] and picks the handle from it.

mod plain;
mod pty;
mod reader;

pub use plain::{PlainHandle, PLAIN_PROMPT};
pub use pty::PtyHandle;
pub use reader::{OutputGate, ReaderExit, ReaderLoop, Utf8Decoder};

use crate::container::ShellLaunch;
use labterm_foundation::{BridgeSettings, Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachKind {
    Pty,
    Plain,
}

/// Exclusive handle to a session's terminal
pub enum IoHandle {
    Pty(PtyHandle),
    Plain(PlainHandle),
}

impl IoHandle {
    pub fn kind(&self) -> AttachKind {
        match self {
            IoHandle::Pty(_) => AttachKind::Pty,
            IoHandle::Plain(_) => AttachKind::Plain,
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            IoHandle::Pty(pty) => pty.write(bytes),
            IoHandle::Plain(plain) => plain.write(bytes).await,
        }
    }

    /// Only a PTY has a window size; plain attach refuses with `InvalidInput`
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(Error::InvalidInput(format!(
                "invalid terminal size {}x{}",
                cols, rows
            )));
        }
        match self {
            IoHandle::Pty(pty) => pty.resize(cols, rows),
            IoHandle::Plain(_) => Err(Error::InvalidInput(
                "terminal resize needs a PTY attach".to_string(),
            )),
        }
    }

    pub fn try_exit(&mut self) -> Option<i64> {
        match self {
            IoHandle::Pty(pty) => pty.try_exit(),
            IoHandle::Plain(plain) => plain.try_exit(),
        }
    }

    pub fn kill(&mut self) {
        match self {
            IoHandle::Pty(pty) => pty.kill(),
            IoHandle::Plain(plain) => plain.kill(),
        }
    }
}

/// A live terminal plus the byte stream coming out of it
pub struct Attached {
    pub handle: IoHandle,
    pub output: mpsc::Receiver<Vec<u8>>,
}

pub enum AttachOutcome {
    Pty(Attached),
    Plain(Attached),
    Failed(Error),
}

impl AttachOutcome {
    pub fn into_result(self) -> Result<(AttachKind, Attached)> {
        match self {
            AttachOutcome::Pty(attached) => Ok((AttachKind::Pty, attached)),
            AttachOutcome::Plain(attached) => Ok((AttachKind::Plain, attached)),
            AttachOutcome::Failed(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bridge {
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(settings: BridgeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// PTY first, plain second
    pub fn attach(&self, launch: &ShellLaunch) -> AttachOutcome {
        let pty_err = match self.attach_pty(launch) {
            Ok(attached) => return AttachOutcome::Pty(attached),
            Err(e) => e,
        };
        warn!(program = %launch.program, "PTY attach failed, falling back to plain: {}", pty_err);

        match self.attach_plain(launch) {
            Ok(attached) => AttachOutcome::Plain(attached),
            Err(plain_err) => AttachOutcome::Failed(Error::AttachFailed(format!(
                "pty: {}; plain: {}",
                pty_err, plain_err
            ))),
        }
    }

    pub fn attach_pty(&self, launch: &ShellLaunch) -> Result<Attached> {
        let (handle, output) = PtyHandle::open(launch, &self.settings)?;
        Ok(Attached {
            handle: IoHandle::Pty(handle),
            output,
        })
    }

    pub fn attach_plain(&self, launch: &ShellLaunch) -> Result<Attached> {
        let (handle, output) = PlainHandle::open(launch, &self.settings)?;
        Ok(Attached {
            handle: IoHandle::Plain(handle),
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn launch(program: &str) -> ShellLaunch {
        ShellLaunch {
            program: program.to_string(),
            pty_args: vec!["-i".to_string()],
            plain_args: vec!["-i".to_string()],
        }
    }

    async fn collect_until(output: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> bool {
        let mut decoder = Utf8Decoder::new();
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, output.recv()).await {
            seen.push_str(&decoder.decode(&chunk));
            if seen.contains(needle) {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn test_plain_attach_round_trip() {
        let bridge = Bridge::new(BridgeSettings::default());
        let mut attached = bridge.attach_plain(&launch("/bin/sh")).unwrap();
        assert_eq!(attached.handle.kind(), AttachKind::Plain);

        attached.handle.write(b"echo bridge-ok\n").await.unwrap();
        assert!(collect_until(&mut attached.output, "bridge-ok").await);
        attached.handle.kill();
    }

    #[tokio::test]
    async fn test_missing_program_fails_both_ways() {
        let bridge = Bridge::new(BridgeSettings::default());
        let outcome = bridge.attach(&launch("/nonexistent/shell"));
        assert!(matches!(outcome, AttachOutcome::Failed(Error::AttachFailed(_))));
    }

    #[tokio::test]
    async fn test_resize_rejects_zero() {
        let bridge = Bridge::new(BridgeSettings::default());
        let mut attached = bridge.attach_plain(&launch("/bin/sh")).unwrap();
        assert!(attached.handle.resize(0, 24).is_err());
        attached.handle.kill();
    }

    #[tokio::test]
    async fn test_plain_resize_is_refused() {
        let bridge = Bridge::new(BridgeSettings::default());
        let mut attached = bridge.attach_plain(&launch("/bin/sh")).unwrap();

        match attached.handle.resize(120, 40) {
            Err(Error::InvalidInput(message)) => assert!(message.contains("PTY"), "{}", message),
            other => panic!("expected invalid input, got {:?}", other),
        }

        // refused resize leaves the shell usable
        attached.handle.write(b"echo after-resize\n").await.unwrap();
        assert!(collect_until(&mut attached.output, "after-resize").await);
        attached.handle.kill();
    }
}
