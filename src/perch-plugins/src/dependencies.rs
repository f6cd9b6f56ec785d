//! Plugin requirement provisioning.
//!
//! A plugin may ship a `requirements.txt`. On activation the installer diffs
//! the declared requirements against the packages already present in the
//! environment and asks the package manager to install exactly the missing
//! ones. A failed install triggers a best-effort uninstall of the same subset
//! and aborts the activation.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::config::PackageManagerConfig;
use crate::{PluginError, Result};

/// Name of the requirements file inside a plugin folder.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// One requirement line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Line as written in the requirements file
    pub raw: String,
    /// Normalized package name
    pub name: String,
}

impl Requirement {
    /// Parse a requirements line; comments, options and blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.split(" #").next().unwrap_or(line).trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            return None;
        }

        let end = line
            .find(|c: char| "[=<>!~;@".contains(c) || c.is_whitespace())
            .unwrap_or(line.len());
        let name = normalize_name(&line[..end]);
        if name.is_empty() || name.contains('/') || name.contains(':') {
            return None;
        }

        Some(Self {
            raw: line.to_string(),
            name,
        })
    }
}

/// Normalize a package name for comparison (case and separator insensitive).
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '.' { '-' } else { c })
        .collect()
}

/// Parse the content of a requirements file.
pub fn parse_requirements(content: &str) -> Vec<Requirement> {
    content.lines().filter_map(Requirement::parse).collect()
}

/// External package manager.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Normalized names of the installed packages.
    async fn installed_packages(&self) -> Result<HashSet<String>>;

    /// Install the given requirements in one batch.
    async fn install(&self, requirements: &[Requirement]) -> Result<()>;

    /// Uninstall the given requirements.
    async fn uninstall(&self, requirements: &[Requirement]) -> Result<()>;
}

/// Package manager driven by external commands (`uv pip` by default).
pub struct CommandPackageManager {
    config: PackageManagerConfig,
}

impl CommandPackageManager {
    pub fn new(config: PackageManagerConfig) -> Self {
        Self { config }
    }

    async fn run(&self, argv: &[String], extra_arg: Option<&Path>) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PluginError::ConfigError("empty package manager command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(arg) = extra_arg {
            cmd.arg(arg);
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PluginError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("failed to run {}: {}", program, e),
                )));
            }
            Err(_) => {
                return Err(PluginError::IoError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{} timed out after {:?}", program, timeout),
                )));
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(PluginError::IoError(std::io::Error::other(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))))
        }
    }

    async fn run_with_requirements(
        &self,
        argv: &[String],
        requirements: &[Requirement],
    ) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        for req in requirements {
            writeln!(tmp, "{}", req.raw)?;
        }
        tmp.flush()?;

        self.run(argv, Some(tmp.path())).await.map(|_| ())
    }
}

#[async_trait]
impl PackageManager for CommandPackageManager {
    async fn installed_packages(&self) -> Result<HashSet<String>> {
        let output = self.run(&self.config.list, None).await?;
        Ok(parse_freeze_output(&output))
    }

    async fn install(&self, requirements: &[Requirement]) -> Result<()> {
        self.run_with_requirements(&self.config.install, requirements)
            .await
    }

    async fn uninstall(&self, requirements: &[Requirement]) -> Result<()> {
        self.run_with_requirements(&self.config.uninstall, requirements)
            .await
    }
}

/// Parse `pip freeze` style output into normalized package names.
pub fn parse_freeze_output(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(Requirement::parse)
        .map(|r| r.name)
        .collect()
}

/// Outcome of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// Every requirement was already satisfied (or none were declared).
    NothingToDo,
    /// The listed packages were installed.
    Installed(Vec<String>),
}

/// Diffs plugin requirements against the environment and installs the delta.
#[derive(Clone)]
pub struct DependencyInstaller {
    manager: Arc<dyn PackageManager>,
}

impl DependencyInstaller {
    pub fn new(manager: Arc<dyn PackageManager>) -> Self {
        Self { manager }
    }

    /// Make sure the requirements of the plugin at `plugin_dir` are installed.
    pub async fn ensure(&self, plugin_id: &str, plugin_dir: &Path) -> Result<Provisioned> {
        let req_file = plugin_dir.join(REQUIREMENTS_FILE);
        let content = match tokio::fs::read_to_string(&req_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Provisioned::NothingToDo);
            }
            Err(e) => {
                return Err(PluginError::dependency_error(
                    plugin_id,
                    format!("cannot read {}: {}", REQUIREMENTS_FILE, e),
                ));
            }
        };

        let requirements = parse_requirements(&content);
        if requirements.is_empty() {
            return Ok(Provisioned::NothingToDo);
        }

        tracing::info!("Checking requirements for plugin {}", plugin_id);
        let installed = match self.manager.installed_packages().await {
            Ok(installed) => installed,
            Err(e) => {
                tracing::error!(
                    "Error during requirements checks for plugin {}: {}",
                    plugin_id,
                    e
                );
                HashSet::new()
            }
        };

        let missing: Vec<Requirement> = requirements
            .into_iter()
            .filter(|req| {
                let present = installed.contains(&req.name);
                if present {
                    tracing::debug!("\t{} is already installed", req.name);
                } else {
                    tracing::debug!("\tInstalling {}", req.name);
                }
                !present
            })
            .collect();

        if missing.is_empty() {
            return Ok(Provisioned::NothingToDo);
        }

        if let Err(e) = self.manager.install(&missing).await {
            tracing::error!("Error while installing plugin {} requirements: {}", plugin_id, e);

            tracing::info!("Uninstalling requirements for plugin {}", plugin_id);
            if let Err(rollback) = self.manager.uninstall(&missing).await {
                tracing::warn!(
                    "Rollback of plugin {} requirements failed: {}",
                    plugin_id,
                    rollback
                );
            }

            return Err(PluginError::dependency_error(plugin_id, e.to_string()));
        }

        Ok(Provisioned::Installed(
            missing.into_iter().map(|r| r.name).collect(),
        ))
    }
}
