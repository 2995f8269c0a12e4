//! Interactive input guard
//!
//! Tracks the line being typed. Bytes are forwarded as they arrive; only the
//! Enter key is held back until the completed line has been validated.

use labterm_foundation::Verdict;

const CTRL_C: u8 = 0x03;
const CTRL_U: u8 = 0x15;
const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7f;
const ESC: u8 = 0x1b;

/// What to do with a chunk of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardStep {
    /// Write these bytes to the terminal
    Forward(Vec<u8>),
    /// Line refused: cancel it with Ctrl-C instead of submitting
    Reject { line: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Escape {
    #[default]
    None,
    Start,
    Csi,
}

#[derive(Debug, Default)]
pub struct InputGuard {
    line: Vec<u8>,
    escape: Escape,
}

impl InputGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Line typed so far
    pub fn current_line(&self) -> String {
        String::from_utf8_lossy(&self.line).into_owned()
    }

    pub fn feed<F>(&mut self, input: &[u8], check: F) -> Vec<GuardStep>
    where
        F: Fn(&str) -> Verdict,
    {
        let mut steps = Vec::new();
        let mut pending = Vec::with_capacity(input.len());

        for &byte in input {
            match self.escape {
                Escape::Start => {
                    pending.push(byte);
                    self.escape = if byte == b'[' { Escape::Csi } else { Escape::None };
                    continue;
                }
                Escape::Csi => {
                    pending.push(byte);
                    if (0x40..=0x7e).contains(&byte) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            match byte {
                b'\r' | b'\n' => {
                    let line = self.current_line();
                    self.line.clear();
                    if line.trim().is_empty() {
                        pending.push(byte);
                        continue;
                    }
                    let verdict = check(&line);
                    if verdict.allowed {
                        pending.push(byte);
                    } else {
                        if !pending.is_empty() {
                            steps.push(GuardStep::Forward(std::mem::take(&mut pending)));
                        }
                        steps.push(GuardStep::Reject {
                            line,
                            reason: verdict
                                .reason
                                .unwrap_or_else(|| "Command rejected".to_string()),
                        });
                    }
                }
                DEL | BACKSPACE => {
                    pop_char(&mut self.line);
                    pending.push(byte);
                }
                CTRL_C | CTRL_U => {
                    self.line.clear();
                    pending.push(byte);
                }
                ESC => {
                    self.escape = Escape::Start;
                    pending.push(byte);
                }
                b'\t' => pending.push(byte),
                b if b < 0x20 => pending.push(b),
                b => {
                    self.line.push(b);
                    pending.push(b);
                }
            }
        }

        if !pending.is_empty() {
            steps.push(GuardStep::Forward(pending));
        }
        steps
    }
}

/// Byte sequence that cancels the current line
pub fn cancel_sequence() -> &'static [u8] {
    &[CTRL_C]
}

/// Remove the last UTF-8 character
fn pop_char(line: &mut Vec<u8>) {
    while let Some(b) = line.pop() {
        if b & 0xC0 != 0x80 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deny_rm(line: &str) -> Verdict {
        if line.trim_start().starts_with("rm") {
            Verdict::deny("Command 'rm' is not allowed")
        } else {
            Verdict::allow()
        }
    }

    fn forwarded(steps: &[GuardStep]) -> Vec<u8> {
        steps
            .iter()
            .filter_map(|s| match s {
                GuardStep::Forward(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_allowed_line_passes_through() {
        let mut guard = InputGuard::new();
        let steps = guard.feed(b"ls -la\r", deny_rm);
        assert_eq!(forwarded(&steps), b"ls -la\r");
        assert!(guard.current_line().is_empty());
    }

    #[test]
    fn test_rejected_line_withholds_enter() {
        let mut guard = InputGuard::new();
        let mut steps = guard.feed(b"rm -rf ", deny_rm);
        steps.extend(guard.feed(b"/\r", deny_rm));

        assert_eq!(forwarded(&steps), b"rm -rf /");
        assert!(matches!(
            steps.last(),
            Some(GuardStep::Reject { line, .. }) if line == "rm -rf /"
        ));
    }

    #[test]
    fn test_backspace_edits_tracked_line() {
        let mut guard = InputGuard::new();
        guard.feed(b"rmx", deny_rm);
        guard.feed(&[DEL, DEL, DEL], deny_rm);
        let steps = guard.feed(b"ls\r", deny_rm);
        assert!(steps.iter().all(|s| matches!(s, GuardStep::Forward(_))));
    }

    #[test]
    fn test_escape_sequences_not_tracked() {
        let mut guard = InputGuard::new();
        guard.feed(b"\x1b[Als", deny_rm);
        assert_eq!(guard.current_line(), "ls");
    }

    #[test]
    fn test_ctrl_c_clears_line() {
        let mut guard = InputGuard::new();
        guard.feed(b"rm -rf /", deny_rm);
        guard.feed(&[CTRL_C], deny_rm);
        assert!(guard.current_line().is_empty());
    }
}
