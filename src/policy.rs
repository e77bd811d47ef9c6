use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::config::PolicyConfig;
use crate::error::{GridError, PolicyCode, Result};

/// Caller's explicit sign-off for a command that matches a dangerous pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Approval {
    pub approved: bool,
    pub token: Option<String>,
}

struct DangerPattern {
    id: &'static str,
    regex: Regex,
}

fn danger_patterns() -> &'static [DangerPattern] {
    static PATTERNS: OnceLock<Vec<DangerPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let raw: [(&'static str, &str); 3] = [
            (
                "sandbox-bypass",
                r"(?:^|\s)--(?:dangerously-skip-permissions|dangerously-bypass-approvals-and-sandbox|no-sandbox)(?:[\s=]|$)",
            ),
            (
                "recursive-root-delete",
                r"\brm\s+(?:-{1,2}[\w-]+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:-{1,2}[\w-]+\s+)*/\*?(?:[\s;&|]|$)",
            ),
            (
                "disk-format",
                r"(?i)\bmkfs\b|\bdd\b[^;&|]*\bof=/dev/|\bformat\s+[a-z]:",
            ),
        ];
        raw.into_iter()
            .filter_map(|(id, pattern)| Regex::new(pattern).ok().map(|regex| DangerPattern { id, regex }))
            .collect()
    })
}

/// Startup-command gate applied once per launch.
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    allowlist: Vec<String>,
    approval_token: Option<String>,
}

impl CommandPolicy {
    pub fn new(allowlist: Vec<String>, approval_token: Option<String>) -> Self {
        Self {
            allowlist: allowlist
                .into_iter()
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect(),
            approval_token: approval_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.allowlist.clone(), config.approval_token.clone())
    }

    fn allowed(&self, command: &str) -> bool {
        self.allowlist.is_empty()
            || self.allowlist.iter().any(|entry| {
                command == entry
                    || command
                        .strip_prefix(entry.as_str())
                        .is_some_and(|rest| rest.starts_with(' '))
            })
    }

    fn approved(&self, approval: &Approval) -> bool {
        match (&self.approval_token, approval.token.as_deref()) {
            (Some(expected), Some(given)) => approval.approved && expected == given,
            _ => false,
        }
    }

    /// Interactive shells (no command) always pass.
    pub fn check(&self, command: Option<&str>, approval: &Approval) -> Result<()> {
        let Some(command) = command.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(());
        };

        if !self.allowed(command) {
            return Err(GridError::Policy {
                code: PolicyCode::CommandNotAllowed,
                pattern: None,
            });
        }

        if let Some(hit) = danger_patterns().iter().find(|p| p.regex.is_match(command)) {
            if self.approved(approval) {
                tracing::info!(pattern = hit.id, "dangerous command approved");
                return Ok(());
            }
            tracing::warn!(pattern = hit.id, "dangerous command refused");
            return Err(GridError::Policy {
                code: PolicyCode::DangerousCommand,
                pattern: Some(hit.id),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_of(policy: &CommandPolicy, command: &str) -> Option<&'static str> {
        policy
            .check(Some(command), &Approval::default())
            .err()
            .and_then(|e| e.policy_pattern())
    }

    #[test]
    fn all_builtin_patterns_compile() {
        assert_eq!(danger_patterns().len(), 3);
    }

    #[test]
    fn flags_dangerous_commands() {
        let policy = CommandPolicy::default();
        assert_eq!(pattern_of(&policy, "claude --dangerously-skip-permissions"), Some("sandbox-bypass"));
        assert_eq!(
            pattern_of(&policy, "codex --dangerously-bypass-approvals-and-sandbox"),
            Some("sandbox-bypass")
        );
        assert_eq!(pattern_of(&policy, "rm -rf /"), Some("recursive-root-delete"));
        assert_eq!(pattern_of(&policy, "sudo rm -r -f /*"), Some("recursive-root-delete"));
        assert_eq!(pattern_of(&policy, "rm --recursive --force /"), Some("recursive-root-delete"));
        assert_eq!(pattern_of(&policy, "mkfs.ext4 /dev/sda1"), Some("disk-format"));
        assert_eq!(pattern_of(&policy, "dd if=/dev/zero of=/dev/sda bs=1M"), Some("disk-format"));
        assert_eq!(pattern_of(&policy, "format C:"), Some("disk-format"));
    }

    #[test]
    fn ordinary_commands_pass() {
        let policy = CommandPolicy::default();
        for command in ["claude", "rm -rf /tmp/build", "git format-patch HEAD~1", "ls /", "dd if=a of=b"] {
            assert!(policy.check(Some(command), &Approval::default()).is_ok(), "{command}");
        }
        assert!(policy.check(None, &Approval::default()).is_ok());
        assert!(policy.check(Some("   "), &Approval::default()).is_ok());
    }

    #[test]
    fn approval_needs_flag_and_matching_token() {
        let policy = CommandPolicy::new(Vec::new(), Some("s3cret".into()));
        let cmd = Some("claude --dangerously-skip-permissions");
        let cases = [
            (Approval { approved: true, token: Some("s3cret".into()) }, true),
            (Approval { approved: false, token: Some("s3cret".into()) }, false),
            (Approval { approved: true, token: Some("wrong".into()) }, false),
            (Approval { approved: true, token: None }, false),
        ];
        for (approval, ok) in cases {
            assert_eq!(policy.check(cmd, &approval).is_ok(), ok, "{approval:?}");
        }
    }

    #[test]
    fn approval_impossible_without_configured_token() {
        let policy = CommandPolicy::new(Vec::new(), None);
        let approval = Approval {
            approved: true,
            token: Some(String::new()),
        };
        assert!(policy.check(Some("rm -rf /"), &approval).is_err());
    }

    #[test]
    fn allowlist_matches_exact_or_word_prefix() {
        let policy = CommandPolicy::new(vec!["claude".into(), "npm run".into()], None);
        assert!(policy.check(Some("claude"), &Approval::default()).is_ok());
        assert!(policy.check(Some("claude --resume"), &Approval::default()).is_ok());
        assert!(policy.check(Some("npm run dev"), &Approval::default()).is_ok());
        let err = policy.check(Some("claudex"), &Approval::default()).unwrap_err();
        assert!(matches!(
            err,
            GridError::Policy {
                code: PolicyCode::CommandNotAllowed,
                pattern: None
            }
        ));
        assert!(policy.check(Some("npm install"), &Approval::default()).is_err());
    }
}
