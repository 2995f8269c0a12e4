//! Piped attach, used when no PTY can be allocated

use crate::container::ShellLaunch;
use crate::process::kill_group;
use labterm_foundation::{BridgeSettings, Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Prompt shown before the first real output of a plain attach
pub const PLAIN_PROMPT: &str = "user@labterm:~$ ";

pub struct PlainHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl PlainHandle {
    pub fn open(
        launch: &ShellLaunch,
        settings: &BridgeSettings,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.plain_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::AttachFailed(format!("Failed to spawn {}: {}", launch.program, e)))?;

        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(settings.output_capacity.max(1));
        let buffer_size = settings.read_buffer_bytes.max(1);

        // Channel closes once both pipes hit EOF
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone(), buffer_size));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx, buffer_size));
        }

        info!(program = %launch.program, pid = ?child.id(), "Plain attach established");

        Ok((Self { child, stdin }, rx))
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::SessionClosed("stdin is closed".to_string()))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub fn try_exit(&mut self) -> Option<i64> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().map(i64::from).unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                debug!("Plain child status unavailable: {}", e);
                Some(-1)
            }
        }
    }

    pub fn kill(&mut self) {
        self.stdin = None;
        if let Ok(None) = self.child.try_wait() {
            if let Some(pid) = self.child.id() {
                kill_group(pid);
            }
            let _ = self.child.start_kill();
        }
    }
}

impl Drop for PlainHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn pump<R>(mut pipe: R, tx: mpsc::Sender<Vec<u8>>, buffer_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Plain pipe closed: {}", e);
                break;
            }
        }
    }
}
