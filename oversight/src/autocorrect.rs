//! Autocorrection: maps an observed command failure to a candidate
//! replacement command.
//!
//! Rules are consulted in order; the first match wins. The engine never
//! executes anything — the executor decides whether to run a candidate
//! under its own retry budget. A model-backed rewrite is the last resort,
//! reached only for failures no rule understands, and the caller bounds
//! it to one attempt per original command.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a correction did to the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    PrependSudo,
    InstallMissingCommand,
    RefreshPackageIndex,
    ReloadSystemdUnits,
    ModelRewrite,
}

impl std::fmt::Display for CorrectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrependSudo => write!(f, "prepend_sudo"),
            Self::InstallMissingCommand => write!(f, "install_missing_command"),
            Self::RefreshPackageIndex => write!(f, "refresh_package_index"),
            Self::ReloadSystemdUnits => write!(f, "reload_systemd_units"),
            Self::ModelRewrite => write!(f, "model_rewrite"),
        }
    }
}

/// A proposed replacement for a failed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub command: String,
    pub kind: CorrectionKind,
    /// Rule confidence in (0, 1]; the executor may gate on it.
    pub confidence: f32,
}

/// The observed failure the engine reasons about.
#[derive(Debug, Clone)]
pub struct Failure<'a> {
    pub command: &'a str,
    pub stderr: &'a str,
    pub exit_code: Option<i32>,
}

/// Seam for the model-backed rewrite; implemented in the agent crate.
#[async_trait]
pub trait CommandRewriter: Send + Sync {
    /// Propose a rewritten command, or `None` when the model has nothing
    /// better to offer.
    async fn rewrite(&self, command: &str, stderr: &str) -> anyhow::Result<Option<String>>;
}

/// Package manager commands per OS family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Yum,
}

impl PackageManager {
    pub fn for_os(os_type: &str) -> Self {
        match os_type.to_lowercase().as_str() {
            "centos" | "rhel" | "fedora" | "rocky" | "alma" => Self::Yum,
            _ => Self::Apt,
        }
    }

    fn install(self, package: &str) -> String {
        match self {
            Self::Apt => format!("sudo apt install -y {package}"),
            Self::Yum => format!("sudo yum install -y {package}"),
        }
    }

    fn refresh_index(self) -> &'static str {
        match self {
            Self::Apt => "sudo apt update",
            Self::Yum => "sudo yum makecache",
        }
    }
}

/// Rule-driven engine with an optional model fallback.
pub struct AutocorrectionEngine {
    package_manager: PackageManager,
    rewriter: Option<Arc<dyn CommandRewriter>>,
}

impl AutocorrectionEngine {
    pub fn new(package_manager: PackageManager) -> Self {
        Self {
            package_manager,
            rewriter: None,
        }
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn CommandRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Propose a correction for `failure`. `allow_model` lets the caller
    /// enforce the one-model-attempt-per-original-command bound.
    pub async fn correct(&self, failure: &Failure<'_>, allow_model: bool) -> Option<Correction> {
        if let Some(correction) = self.rule_correction(failure) {
            debug!(
                command = failure.command,
                kind = %correction.kind,
                "rule correction proposed"
            );
            return Some(correction);
        }

        if allow_model {
            if let Some(rewriter) = &self.rewriter {
                match rewriter.rewrite(failure.command, failure.stderr).await {
                    Ok(Some(command)) if command.trim() != failure.command.trim() => {
                        debug!(command = failure.command, "model rewrite proposed");
                        return Some(Correction {
                            command: command.trim().to_string(),
                            kind: CorrectionKind::ModelRewrite,
                            confidence: 0.4,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(command = failure.command, error = %e, "model rewrite failed");
                    }
                }
            }
        }

        None
    }

    /// Deterministic rules, in order. Substring match on lowercased stderr.
    fn rule_correction(&self, failure: &Failure<'_>) -> Option<Correction> {
        let stderr = failure.stderr.to_lowercase();
        let command = failure.command.trim();

        if stderr.contains("permission denied") && !starts_with_sudo(command) {
            return Some(Correction {
                command: format!("sudo {command}"),
                kind: CorrectionKind::PrependSudo,
                confidence: 0.9,
            });
        }

        if stderr.contains("command not found") {
            let program = missing_program(command)?;
            return Some(Correction {
                command: format!(
                    "{} && {}",
                    self.package_manager.install(&program),
                    command
                ),
                kind: CorrectionKind::InstallMissingCommand,
                confidence: 0.6,
            });
        }

        if stderr.contains("unable to locate")
            || (stderr.contains("package") && stderr.contains("not found"))
        {
            return Some(Correction {
                command: format!("{} && {}", self.package_manager.refresh_index(), command),
                kind: CorrectionKind::RefreshPackageIndex,
                confidence: 0.7,
            });
        }

        if stderr.contains("unit") && stderr.contains("not found") {
            return Some(Correction {
                command: format!("sudo systemctl daemon-reload && {command}"),
                kind: CorrectionKind::ReloadSystemdUnits,
                confidence: 0.6,
            });
        }

        // "syntax error" and everything else falls through to the model.
        None
    }
}

fn starts_with_sudo(command: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .map(|t| t == "sudo")
        .unwrap_or(false)
}

/// The program the shell reported missing: first token of the command,
/// skipping a leading `sudo`.
fn missing_program(command: &str) -> Option<String> {
    let mut tokens = command.split_whitespace();
    let first = tokens.next()?;
    let program = if first == "sudo" { tokens.next()? } else { first };
    Some(program.to_string())
}
