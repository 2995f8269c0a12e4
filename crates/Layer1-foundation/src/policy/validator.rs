//! Command Validator - 명령어 안전성 검증
//!
//! 두 가지 검사를 모두 통과해야 허용됩니다:
//! - 허용 목록: 각 명령 세그먼트의 첫 토큰이 모드별 허용 집합에 속해야 함
//! - 금지 패턴: 전체 문자열이 공유 금지 패턴 중 하나라도 매칭되면 거부

use super::patterns::{deny_patterns, DenyPattern};
use crate::config::{EngineConfig, SessionMode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// 검증 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    /// `Err(ValidationRejected)` when denied
    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(Error::rejected(
                self.reason.unwrap_or_else(|| "command rejected".to_string()),
            ))
        }
    }
}

// ============================================================================
// CommandPolicy
// ============================================================================

/// One allow-set plus the shared deny list
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: HashSet<String>,
    deny: Arc<[DenyPattern]>,
}

impl CommandPolicy {
    pub fn new<I, S>(allowed: I, deny: Arc<[DenyPattern]>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            deny,
        }
    }

    pub fn is_allowed_program(&self, program: &str) -> bool {
        self.allowed.contains(program)
    }

    /// Pure and deterministic
    pub fn validate(&self, command: &str) -> Verdict {
        let command = command.trim();
        if command.is_empty() {
            return Verdict::deny("Empty command");
        }

        if let Some(pattern) = self.deny.iter().find(|p| p.matches(command)) {
            return Verdict::deny(pattern.reason.clone());
        }

        let segments = match split_segments(command) {
            Ok(segments) => segments,
            Err(reason) => return Verdict::deny(reason),
        };

        for segment in &segments {
            let program = match segment.first() {
                Some(first) => program_name(first),
                None => return Verdict::deny("Empty command segment"),
            };
            if !self.allowed.contains(program) {
                return Verdict::deny(format!("Command '{}' is not allowed", program));
            }
        }

        Verdict::allow()
    }
}

const UNPARSEABLE: &str = "Command could not be parsed";
const SUBSTITUTION: &str = "Command substitution is not allowed";

/// Split on newlines, `;`, `&`, `&&`, `||` and `|`, then tokenize each
/// segment shell-style. `$(..)`, backticks and `<(..)`/`>(..)` are refused
/// outside single quotes, since their contents would run unchecked.
fn split_segments(command: &str) -> std::result::Result<Vec<Vec<String>>, &'static str> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') => {
                quote = None;
                current.push(c);
            }
            (Some('\''), c) => current.push(c),
            (Some('"'), '"') => {
                quote = None;
                current.push(c);
            }
            // double quotes still expand
            (_, '`') => return Err(SUBSTITUTION),
            (_, '$') if chars.peek() == Some(&'(') => return Err(SUBSTITUTION),
            (_, '\\') => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '<' | '>') => {
                if chars.peek() == Some(&'(') {
                    return Err(SUBSTITUTION);
                }
                current.push(c);
                // `2>&1`, `<&0`
                if chars.peek() == Some(&'&') {
                    chars.next();
                    current.push('&');
                }
            }
            (None, ';' | '\n' | '\r') => segments.push(std::mem::take(&mut current)),
            (None, '&') => match chars.peek() {
                Some('&') => {
                    chars.next();
                    segments.push(std::mem::take(&mut current));
                }
                // `&>file`
                Some('>') => current.push(c),
                _ => segments.push(std::mem::take(&mut current)),
            },
            (None, '|') => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                segments.push(std::mem::take(&mut current));
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(UNPARSEABLE);
    }
    segments.push(current);

    let mut tokenized = Vec::with_capacity(segments.len());
    for segment in segments {
        let tokens = shlex::split(&segment).ok_or(UNPARSEABLE)?;
        // trailing `;` or `&` leaves an empty segment
        if tokens.is_empty() && !tokenized.is_empty() && segment.trim().is_empty() {
            continue;
        }
        tokenized.push(tokens);
    }
    Ok(tokenized)
}

/// `/usr/bin/ls` -> `ls`
fn program_name(token: &str) -> &str {
    Path::new(token)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(token)
}

// ============================================================================
// Validator (모드별 정책)
// ============================================================================

/// Policy per [`SessionMode`], all sharing one deny list
#[derive(Debug, Clone)]
pub struct Validator {
    policies: HashMap<SessionMode, CommandPolicy>,
}

impl Validator {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let deny: Arc<[DenyPattern]> = deny_patterns(&config.policy.extra_deny_patterns)?.into();
        let mut policies = HashMap::new();
        for mode in [SessionMode::IsolatedReadonly, SessionMode::Privileged] {
            let profile = config.profile(mode);
            policies.insert(
                mode,
                CommandPolicy::new(profile.allowed_commands.iter().cloned(), Arc::clone(&deny)),
            );
        }
        Ok(Self { policies })
    }

    pub fn policy(&self, mode: SessionMode) -> Option<&CommandPolicy> {
        self.policies.get(&mode)
    }

    pub fn validate(&self, mode: SessionMode, command: &str) -> Verdict {
        match self.policies.get(&mode) {
            Some(policy) => policy.validate(command),
            None => Verdict::deny(format!("No command policy for mode {}", mode)),
        }
    }
}
