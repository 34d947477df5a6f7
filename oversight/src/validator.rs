//! Command safety gate.
//!
//! Stateless decision engine over three rule sets: a forbidden
//! exact-or-substring list, a dangerous regex list, and an optional
//! allow-list (whitelist mode). Rule sets are read-mostly; mutation
//! clones and atomically swaps the shared `Arc`, so readers never block
//! on a writer mid-decision.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How alarming a command is when it is allowed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Class of a dangerous pattern; destructive patterns force operator
/// confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternClass {
    /// Irreversibly destroys data or the system.
    Destructive,
    /// Privilege or account manipulation.
    Privilege,
    /// Stops or reboots the whole host.
    SystemControl,
    /// Broad process kills.
    ProcessControl,
}

impl PatternClass {
    fn security_level(self) -> SecurityLevel {
        match self {
            Self::Destructive => SecurityLevel::Critical,
            Self::Privilege | Self::SystemControl => SecurityLevel::High,
            Self::ProcessControl => SecurityLevel::Medium,
        }
    }
}

/// One compiled dangerous-pattern rule.
#[derive(Debug, Clone)]
pub struct DangerousPattern {
    pub pattern: Regex,
    pub class: PatternClass,
    pub description: String,
}

/// The three rule sets, swapped as a unit.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Substring match, lowercased. A hit makes the command invalid.
    pub forbidden: Vec<String>,
    /// Regex match. A hit keeps the command valid but warns.
    pub dangerous: Vec<DangerousPattern>,
    /// When present, only commands whose program token is listed pass.
    pub allowlist: Option<HashSet<String>>,
}

impl RuleSet {
    /// Production defaults: commands that must never reach a server this
    /// agent manages, and patterns that demand a second look.
    pub fn default_rules() -> Self {
        let forbidden = [
            "rm -rf /",
            "rm -rf /*",
            "dd if=/dev/zero",
            "mkfs",
            "> /dev/sda",
            "chmod 777 /",
            "chown -r root:root /",
            ":(){ :|:& };:",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let dangerous = vec![
            pattern(r"\brm\s+-[a-z]*r[a-z]*f", PatternClass::Destructive, "recursive force remove"),
            pattern(r"\bmkfs(\.\w+)?\b", PatternClass::Destructive, "filesystem creation"),
            pattern(r"\b(fdisk|parted)\b", PatternClass::Destructive, "partition table edit"),
            pattern(r">\s*/dev/(sd|nvme|vd)", PatternClass::Destructive, "raw device write"),
            pattern(r"\bpasswd\s+root\b", PatternClass::Privilege, "root password change"),
            pattern(r"\buserdel\s+-r\b", PatternClass::Privilege, "user removal with home"),
            pattern(r"\bgroupdel\b", PatternClass::Privilege, "group removal"),
            pattern(
                r"\b(shutdown|reboot|halt|poweroff)\b",
                PatternClass::SystemControl,
                "host power control",
            ),
            pattern(r"\b(killall|pkill)\s+-9\b", PatternClass::ProcessControl, "broad SIGKILL"),
        ];

        Self {
            forbidden,
            dangerous,
            allowlist: None,
        }
    }
}

fn pattern(re: &str, class: PatternClass, description: &str) -> DangerousPattern {
    DangerousPattern {
        pattern: Regex::new(re).expect("builtin pattern must compile"),
        class,
        description: description.to_string(),
    }
}

/// Caller-supplied context, logged with every rejection.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub step_id: Option<String>,
    pub task_id: Option<String>,
}

/// Outcome of validating one command string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub security_level: SecurityLevel,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub requires_confirmation: bool,
}

impl ValidationReport {
    fn clean() -> Self {
        Self {
            valid: true,
            security_level: SecurityLevel::Low,
            errors: Vec::new(),
            warnings: Vec::new(),
            requires_confirmation: false,
        }
    }
}

/// The safety gate. Cheap to clone the handle; the rule sets are shared.
pub struct CommandValidator {
    rules: RwLock<Arc<RuleSet>>,
}

impl CommandValidator {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RuleSet::default_rules())
    }

    fn current(&self) -> Arc<RuleSet> {
        self.rules.read().expect("validator lock poisoned").clone()
    }

    /// Decision order: allow-list, forbidden substrings, dangerous
    /// patterns, clean.
    pub fn validate(&self, command: &str, context: Option<&ValidationContext>) -> ValidationReport {
        let rules = self.current();
        let trimmed = command.trim();
        let lowered = trimmed.to_lowercase();
        let mut report = ValidationReport::clean();

        if trimmed.is_empty() {
            report.valid = false;
            report.errors.push("empty command".to_string());
            self.log_rejection(trimmed, &report, context);
            return report;
        }

        if let Some(allow) = &rules.allowlist {
            let program = program_token(trimmed);
            if !program.map(|p| allow.contains(&p)).unwrap_or(false) {
                report.valid = false;
                report.security_level = SecurityLevel::High;
                report.errors.push(format!(
                    "command '{}' is not on the allow-list",
                    program_token(trimmed).unwrap_or_default()
                ));
                self.log_rejection(trimmed, &report, context);
                return report;
            }
        }

        for needle in &rules.forbidden {
            if lowered.contains(needle) {
                report.valid = false;
                report.security_level = SecurityLevel::Critical;
                report
                    .errors
                    .push(format!("forbidden command fragment: '{needle}'"));
            }
        }
        if !report.valid {
            self.log_rejection(trimmed, &report, context);
            return report;
        }

        for rule in &rules.dangerous {
            if rule.pattern.is_match(trimmed) {
                report.warnings.push(format!("dangerous pattern: {}", rule.description));
                report.security_level = report.security_level.max(rule.class.security_level());
                if rule.class == PatternClass::Destructive {
                    report.requires_confirmation = true;
                }
            }
        }

        report
    }

    fn log_rejection(
        &self,
        command: &str,
        report: &ValidationReport,
        context: Option<&ValidationContext>,
    ) {
        let ctx = context.cloned().unwrap_or_default();
        warn!(
            command,
            step_id = ctx.step_id.as_deref().unwrap_or("-"),
            task_id = ctx.task_id.as_deref().unwrap_or("-"),
            errors = ?report.errors,
            "command rejected"
        );
    }

    /// Add a forbidden substring. Atomic swap: concurrent readers keep
    /// the old set until the write completes.
    pub fn add_forbidden(&self, needle: impl Into<String>) {
        let mut guard = self.rules.write().expect("validator lock poisoned");
        let mut next = (**guard).clone();
        next.forbidden.push(needle.into().to_lowercase());
        *guard = Arc::new(next);
    }

    pub fn remove_forbidden(&self, needle: &str) {
        let needle = needle.to_lowercase();
        let mut guard = self.rules.write().expect("validator lock poisoned");
        let mut next = (**guard).clone();
        next.forbidden.retain(|f| *f != needle);
        *guard = Arc::new(next);
    }

    pub fn add_dangerous_pattern(
        &self,
        re: &str,
        class: PatternClass,
        description: &str,
    ) -> Result<(), regex::Error> {
        let compiled = Regex::new(re)?;
        let mut guard = self.rules.write().expect("validator lock poisoned");
        let mut next = (**guard).clone();
        next.dangerous.push(DangerousPattern {
            pattern: compiled,
            class,
            description: description.to_string(),
        });
        *guard = Arc::new(next);
        Ok(())
    }

    /// Switch to whitelist mode with the given program names.
    pub fn set_allowlist(&self, programs: Option<HashSet<String>>) {
        let mut guard = self.rules.write().expect("validator lock poisoned");
        let mut next = (**guard).clone();
        next.allowlist = programs;
        *guard = Arc::new(next);
    }
}

/// First shell token of the command, e.g. `sudo` for `sudo apt update`.
fn program_token(command: &str) -> Option<String> {
    shlex::split(command)
        .and_then(|parts| parts.into_iter().next())
        .or_else(|| command.split_whitespace().next().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_command_is_low_security() {
        let v = CommandValidator::with_defaults();
        let report = v.validate("apt update", None);
        assert!(report.valid);
        assert_eq!(report.security_level, SecurityLevel::Low);
        assert!(report.warnings.is_empty());
        assert!(!report.requires_confirmation);
    }

    #[test]
    fn forbidden_substring_rejects() {
        let v = CommandValidator::with_defaults();
        let report = v.validate("rm -rf /", None);
        assert!(!report.valid);
        assert_eq!(report.security_level, SecurityLevel::Critical);
        assert!(report.errors[0].contains("forbidden"));
    }

    #[test]
    fn dangerous_pattern_warns_and_requires_confirmation() {
        let v = CommandValidator::with_defaults();
        let report = v.validate("rm -rf /var/cache/myapp", None);
        assert!(report.valid, "dangerous but not forbidden");
        assert!(!report.warnings.is_empty());
        assert!(report.requires_confirmation);
        assert_eq!(report.security_level, SecurityLevel::Critical);
    }

    #[test]
    fn system_control_warns_without_confirmation() {
        let v = CommandValidator::with_defaults();
        let report = v.validate("sudo reboot", None);
        assert!(report.valid);
        assert!(!report.requires_confirmation);
        assert_eq!(report.security_level, SecurityLevel::High);
    }

    #[test]
    fn whitelist_mode_rejects_unlisted_programs() {
        let v = CommandValidator::with_defaults();
        v.set_allowlist(Some(["apt".to_string(), "systemctl".to_string()].into()));

        assert!(v.validate("apt update", None).valid);
        let report = v.validate("curl http://example.com", None);
        assert!(!report.valid);
        assert!(report.errors[0].contains("allow-list"));
    }

    #[test]
    fn empty_command_rejected() {
        let v = CommandValidator::with_defaults();
        assert!(!v.validate("   ", None).valid);
    }

    #[test]
    fn rule_mutation_is_observed_on_next_access() {
        let v = CommandValidator::with_defaults();
        assert!(v.validate("echo hello", None).valid);

        v.add_forbidden("echo hello");
        assert!(!v.validate("echo hello", None).valid);

        v.remove_forbidden("echo hello");
        assert!(v.validate("echo hello", None).valid);
    }

    #[test]
    fn added_dangerous_pattern_matches() {
        let v = CommandValidator::with_defaults();
        v.add_dangerous_pattern(r"\biptables\s+-F\b", PatternClass::SystemControl, "firewall flush")
            .unwrap();
        let report = v.validate("iptables -F", None);
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("firewall flush")));
    }

    #[test]
    fn case_insensitive_forbidden_match() {
        let v = CommandValidator::with_defaults();
        assert!(!v.validate("RM -RF /", None).valid);
    }
}
