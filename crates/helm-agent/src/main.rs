//! # helm-agent
//!
//! helm control plane binary: loads settings, wires the browser client,
//! safety gate, scheduler, and observer hub, and runs until Ctrl-C.

#![deny(unsafe_code)]

mod actions;
mod agent;
mod browser;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use helm_core::logging::{LogFormat, init_subscriber};
use helm_settings::HelmSettings;

use crate::agent::Agent;

/// helm agent runtime.
#[derive(Parser, Debug)]
#[command(name = "helm-agent", about = "Agent runtime control plane")]
struct Cli {
    /// Settings file (defaults to `~/.helm/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind the observer server to.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the observer server to (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Store path; `:memory:` for an ephemeral store.
    #[arg(long)]
    db_path: Option<String>,

    /// Simulate side-effecting actions instead of running them.
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    /// Command-line flags win over file and environment settings.
    fn apply(&self, settings: &mut HelmSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.db_path {
            settings.database.path.clone_from(path);
        }
        if self.dry_run {
            settings.safety.dry_run = true;
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(helm_settings::settings_path);
    let mut settings = helm_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    helm_settings::validate(&settings).context("invalid settings")?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);

    if settings.database.path != helm_store::MEMORY_PATH {
        ensure_parent_dir(Path::new(&settings.database.path))?;
    }

    let mut agent = Agent::build(settings)?;
    let addr = agent.start().await?;
    tracing::info!("helm agent listening on http://{addr} (ws at /ws)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    agent.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["helm-agent"]);
        let mut settings = HelmSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings, HelmSettings::default());
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "helm-agent",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
            "--db-path",
            ":memory:",
            "--dry-run",
        ]);
        let mut settings = HelmSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.database.path, ":memory:");
        assert!(settings.safety.dry_run);
    }

    #[test]
    fn cli_settings_path() {
        let cli = Cli::parse_from(["helm-agent", "--settings", "/tmp/helm.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/helm.json")));
    }

    #[test]
    fn ensure_parent_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("helm.db");
        ensure_parent_dir(&path).unwrap();
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn bare_filename_needs_no_directory() {
        ensure_parent_dir(Path::new("helm.db")).unwrap();
    }
}
