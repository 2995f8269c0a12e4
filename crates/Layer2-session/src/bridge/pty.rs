//! PTY attach: the launch program runs on the slave side of a pseudo-terminal

use crate::container::ShellLaunch;
use labterm_foundation::{BridgeSettings, Error, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    /// Open a PTY, spawn `launch` on it and start the blocking reader thread
    pub fn open(
        launch: &ShellLaunch,
        settings: &BridgeSettings,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: settings.rows,
            cols: settings.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| Error::AttachFailed(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&launch.program);
        cmd.args(&launch.pty_args);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::AttachFailed(format!("Failed to spawn PTY command: {}", e)))?;
        // EOF on the master needs every slave fd closed
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::AttachFailed(format!("Failed to clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::AttachFailed(format!("Failed to take PTY writer: {}", e)))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(settings.output_capacity.max(1));
        let buffer_size = settings.read_buffer_bytes.max(1);

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; buffer_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        // EIO once the child side is gone
                        debug!("PTY reader stopped: {}", e);
                        break;
                    }
                }
            }
        });

        info!(program = %launch.program, pid = ?child.process_id(), "PTY attached");

        Ok((
            Self {
                master: pair.master,
                writer,
                child,
            },
            rx,
        ))
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::InvalidInput(format!("PTY resize failed: {}", e)))
    }

    /// Exit code once the child has exited
    pub fn try_exit(&mut self) -> Option<i64> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(i64::from(status.exit_code())),
            Ok(None) => None,
            Err(e) => {
                debug!("PTY child status unavailable: {}", e);
                Some(-1)
            }
        }
    }

    pub fn kill(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                debug!("PTY child kill failed: {}", e);
            }
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.kill();
    }
}
