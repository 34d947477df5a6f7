//! Template command chains, indexed by (os_type, category).
//!
//! When a step's intent matches a known chain by keyword, the model only
//! parameterizes the template instead of inventing commands from
//! scratch. Placeholders use `{name}` syntax.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    PackageManagement,
    ServiceManagement,
    FileOperations,
    NetworkOperations,
    SystemChecks,
}

/// One reusable command chain with health checks and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub name: String,
    pub category: TemplateCategory,
    pub description: String,
    /// Keywords matched against step title + description (lowercased).
    pub keywords: Vec<String>,
    /// `{placeholder}` names the model must fill.
    pub parameters: Vec<String>,
    pub commands: Vec<String>,
    pub health_checks: Vec<String>,
    pub rollback_commands: Vec<String>,
    /// Empty means any OS.
    pub os_types: Vec<String>,
}

impl CommandTemplate {
    fn matches_os(&self, os_type: &str) -> bool {
        self.os_types.is_empty() || self.os_types.iter().any(|o| o == os_type)
    }

    /// Keyword hit count against the step text.
    fn score(&self, text: &str) -> usize {
        self.keywords.iter().filter(|k| text.contains(k.as_str())).count()
    }

    /// Substitute `{name}` placeholders in every command group.
    pub fn instantiate(
        &self,
        parameters: &HashMap<String, String>,
    ) -> Result<InstantiatedTemplate, MissingParameter> {
        for required in &self.parameters {
            if !parameters.contains_key(required) {
                return Err(MissingParameter {
                    template: self.name.clone(),
                    parameter: required.clone(),
                });
            }
        }

        let fill = |commands: &[String]| -> Vec<String> {
            commands
                .iter()
                .map(|c| {
                    let mut out = c.clone();
                    for (key, value) in parameters {
                        out = out.replace(&format!("{{{key}}}"), value);
                    }
                    out
                })
                .collect()
        };

        Ok(InstantiatedTemplate {
            name: self.name.clone(),
            commands: fill(&self.commands),
            health_checks: fill(&self.health_checks),
            rollback_commands: fill(&self.rollback_commands),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("template '{template}' is missing parameter '{parameter}'")]
pub struct MissingParameter {
    pub template: String,
    pub parameter: String,
}

/// A template with all placeholders filled.
#[derive(Debug, Clone)]
pub struct InstantiatedTemplate {
    pub name: String,
    pub commands: Vec<String>,
    pub health_checks: Vec<String>,
    pub rollback_commands: Vec<String>,
}

/// The process-wide template library. Built once; read-only afterwards.
pub struct TemplateLibrary {
    templates: Vec<CommandTemplate>,
}

impl TemplateLibrary {
    pub fn builtin() -> Self {
        Self {
            templates: builtin_templates(),
        }
    }

    /// Best keyword match for a step on this OS, if any keyword hits.
    pub fn best_match(&self, step_text: &str, os_type: &str) -> Option<&CommandTemplate> {
        let text = step_text.to_lowercase();
        self.templates
            .iter()
            .filter(|t| t.matches_os(os_type))
            .map(|t| (t.score(&text), t))
            .filter(|(score, _)| *score > 0)
            .max_by_key(|(score, _)| *score)
            .map(|(_, t)| t)
    }

    pub fn by_name(&self, name: &str, os_type: &str) -> Option<&CommandTemplate> {
        self.templates
            .iter()
            .find(|t| t.name == name && t.matches_os(os_type))
    }

    pub fn names_for(&self, os_type: &str) -> Vec<&str> {
        self.templates
            .iter()
            .filter(|t| t.matches_os(os_type))
            .map(|t| t.name.as_str())
            .collect()
    }
}

fn template(
    name: &str,
    category: TemplateCategory,
    description: &str,
    keywords: &[&str],
    parameters: &[&str],
    commands: &[&str],
    health_checks: &[&str],
    rollback: &[&str],
    os_types: &[&str],
) -> CommandTemplate {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    CommandTemplate {
        name: name.to_string(),
        category,
        description: description.to_string(),
        keywords: owned(keywords),
        parameters: owned(parameters),
        commands: owned(commands),
        health_checks: owned(health_checks),
        rollback_commands: owned(rollback),
        os_types: owned(os_types),
    }
}

fn builtin_templates() -> Vec<CommandTemplate> {
    use TemplateCategory::*;
    vec![
        template(
            "update_packages",
            PackageManagement,
            "Refresh the package index",
            &["update", "refresh", "package list", "indices", "index"],
            &[],
            &["sudo apt update"],
            &["apt-get check"],
            &[],
            &["ubuntu", "debian"],
        ),
        template(
            "install_package",
            PackageManagement,
            "Install a package",
            &["install", "package"],
            &["package_name"],
            &["sudo apt update", "sudo apt install -y {package_name}"],
            &["dpkg -s {package_name}"],
            &["sudo apt remove -y {package_name}"],
            &["ubuntu", "debian"],
        ),
        template(
            "install_package_rpm",
            PackageManagement,
            "Install a package (RPM family)",
            &["install", "package"],
            &["package_name"],
            &["sudo yum install -y {package_name}"],
            &["rpm -q {package_name}"],
            &["sudo yum remove -y {package_name}"],
            &["centos", "rhel", "fedora"],
        ),
        template(
            "start_service",
            ServiceManagement,
            "Start and enable a systemd service",
            &["start", "enable", "service", "daemon"],
            &["service_name"],
            &[
                "sudo systemctl start {service_name}",
                "sudo systemctl enable {service_name}",
            ],
            &["systemctl is-active {service_name}"],
            &["sudo systemctl stop {service_name}"],
            &[],
        ),
        template(
            "restart_service",
            ServiceManagement,
            "Restart a systemd service",
            &["restart", "reload", "service"],
            &["service_name"],
            &["sudo systemctl restart {service_name}"],
            &["systemctl is-active {service_name}"],
            &[],
            &[],
        ),
        template(
            "create_directory",
            FileOperations,
            "Create a directory tree",
            &["directory", "folder", "mkdir"],
            &["directory_path"],
            &["mkdir -p {directory_path}"],
            &["test -d {directory_path}"],
            &["rmdir {directory_path}"],
            &[],
        ),
        template(
            "copy_file",
            FileOperations,
            "Copy a file into place",
            &["copy", "deploy file"],
            &["source_path", "destination_path"],
            &["cp {source_path} {destination_path}"],
            &["test -f {destination_path}"],
            &["rm -f {destination_path}"],
            &[],
        ),
        template(
            "download_file",
            NetworkOperations,
            "Download a file over HTTP",
            &["download", "fetch", "wget", "curl"],
            &["url", "output_file"],
            &["wget -O {output_file} {url}"],
            &["test -s {output_file}"],
            &["rm -f {output_file}"],
            &[],
        ),
        template(
            "check_connectivity",
            NetworkOperations,
            "Verify network reachability",
            &["connectivity", "reachable", "ping"],
            &["host"],
            &["ping -c 3 {host}"],
            &["ping -c 1 {host}"],
            &[],
            &[],
        ),
        template(
            "check_disk_space",
            SystemChecks,
            "Report disk usage",
            &["disk", "space", "storage"],
            &[],
            &["df -h"],
            &[],
            &[],
            &[],
        ),
        template(
            "check_memory",
            SystemChecks,
            "Report memory usage",
            &["memory", "ram"],
            &[],
            &["free -h"],
            &[],
            &[],
            &[],
        ),
    ]
}
