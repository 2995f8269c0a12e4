//! Reader loop: one per session, terminal output -> event bus

use super::IoHandle;
use labterm_foundation::{EventBus, ServerEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

// ============================================================================
// OutputGate
// ============================================================================

/// Open until cleanup starts. Publishing holds the read side, closing takes
/// the write side, so once `close` returns nothing more is published.
#[derive(Debug)]
pub struct OutputGate {
    open: RwLock<bool>,
}

impl OutputGate {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(true),
        }
    }

    /// Emit `payload` on `stream` unless the gate is closed
    pub async fn publish(&self, bus: &EventBus, stream: &str, payload: ServerEvent) -> bool {
        let open = self.open.read().await;
        if !*open {
            return false;
        }
        bus.emit(stream, payload).await;
        true
    }

    /// Returns true for the call that actually closed it
    pub async fn close(&self) -> bool {
        let mut open = self.open.write().await;
        std::mem::replace(&mut *open, false)
    }

    pub async fn is_open(&self) -> bool {
        *self.open.read().await
    }
}

impl Default for OutputGate {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Utf8Decoder
// ============================================================================

/// Decodes a byte stream whose chunks may split multi-byte characters
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // from_utf8 already vetted this prefix
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // incomplete tail, wait for the next chunk
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left once the stream has ended
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

// ============================================================================
// ReaderLoop
// ============================================================================

/// How a reader loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// Token cancelled or gate closed; cleanup already running elsewhere
    Cancelled,
    /// Output stream ended
    Eof,
    /// Shell exited with this code
    Exited(i64),
}

pub struct ReaderLoop {
    pub session_id: String,
    pub stream: String,
    pub bus: Arc<EventBus>,
    pub gate: Arc<OutputGate>,
    pub io: Arc<Mutex<IoHandle>>,
    pub token: CancellationToken,
    pub poll_interval: Duration,
}

impl ReaderLoop {
    pub async fn run(self, mut output: mpsc::Receiver<Vec<u8>>) -> ReaderExit {
        let mut decoder = Utf8Decoder::new();
        let mut exited: Option<(i64, Instant)> = None;
        // after the shell exits, keep draining for a few ticks
        let drain_window = self.poll_interval * 3;

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    debug!(session_id = %self.session_id, "Reader loop cancelled");
                    return ReaderExit::Cancelled;
                }

                chunk = output.recv() => {
                    let text = match chunk {
                        Some(data) => decoder.decode(&data),
                        None => {
                            let rest = decoder.finish();
                            if !rest.is_empty() {
                                self.gate
                                    .publish(&self.bus, &self.stream, ServerEvent::output(rest))
                                    .await;
                            }
                            debug!(session_id = %self.session_id, "Terminal stream ended");
                            return match exited {
                                Some((code, _)) => ReaderExit::Exited(code),
                                None => ReaderExit::Eof,
                            };
                        }
                    };

                    if text.is_empty() {
                        continue;
                    }
                    trace!(session_id = %self.session_id, bytes = text.len(), "Terminal output");
                    if !self.gate.publish(&self.bus, &self.stream, ServerEvent::output(text)).await {
                        return ReaderExit::Cancelled;
                    }
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    match exited {
                        Some((code, at)) if at.elapsed() >= drain_window => {
                            debug!(session_id = %self.session_id, code, "Shell exited");
                            return ReaderExit::Exited(code);
                        }
                        Some(_) => {}
                        None => {
                            if let Some(code) = self.io.lock().await.try_exit() {
                                exited = Some((code, Instant::now()));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labterm_foundation::streams;

    #[test]
    fn test_decoder_joins_split_characters() {
        let bytes = "héllo €".as_bytes();
        let mut decoder = Utf8Decoder::new();

        let mut out = String::new();
        for b in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, "héllo €");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn test_closed_gate_drops_output() {
        let bus = EventBus::new();
        let stream = streams::terminal("s1");
        let gate = OutputGate::new();

        assert!(gate.publish(&bus, &stream, ServerEvent::output("a")).await);
        assert!(gate.close().await);
        assert!(!gate.close().await);
        assert!(!gate.publish(&bus, &stream, ServerEvent::output("b")).await);
        assert_eq!(bus.event_count(), 1);
    }
}
