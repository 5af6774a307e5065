//! Conduit host - headless self-check for the IPC bridge and control surfaces
//!
//! Loads `conduit.toml`, compiles capabilities, then runs a session in which
//! every renderer lives on its own thread and talks to the main process
//! through the real transport:
//!
//! ```text
//! renderer thread ──send/invoke/sendSync──► main process (LocalSet)
//!        ▲                                        │
//!        └───── replies, executeJavaScript ◄──────┘
//! ```
//!
//! # Environment Variables
//!
//! - `CONDUIT_LOG` - Log level (default: "info")

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

mod capabilities;
mod session;

use capabilities::{create_capability_adapters, Capabilities, IpcPermissions, UiPermissions};
use session::SessionConfig;

/// Application manifest (conduit.toml)
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Manifest {
    #[serde(default)]
    pub app: App,
    pub ipc: Option<IpcPermissions>,
    pub ui: Option<UiPermissions>,
    pub session: Option<Session>,
}

/// Application metadata
#[derive(Debug, Deserialize, Clone)]
pub struct App {
    pub name: String,
    pub identifier: String,
    pub version: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            identifier: "dev.conduit.host".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Self-check session settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Session {
    /// Number of renderer threads (default: 2)
    pub renderers: Option<usize>,
    /// Channel allowlist for each renderer, replacing `[ipc] channels`
    pub renderer_channels: Option<Vec<String>>,
}

impl Manifest {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            renderers: self
                .session
                .as_ref()
                .and_then(|s| s.renderers)
                .unwrap_or(2),
            max_listeners: self
                .ipc
                .as_ref()
                .and_then(|i| i.max_listeners)
                .unwrap_or(conduit_ipc::DEFAULT_MAX_LISTENERS),
            renderer_channels: self
                .session
                .as_ref()
                .and_then(|s| s.renderer_channels.clone()),
        }
    }
}

fn load_manifest(path: &Path) -> Result<Option<Manifest>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest at {}", path.display()))?;
    let manifest = toml::from_str(&text).context("parsing manifest")?;
    Ok(Some(manifest))
}

const USAGE: &str = "Usage: conduit-host [--config <path>] [--dev]";

fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("CONDUIT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Parse args: --config <path> --dev
    let mut args = env::args().skip(1);
    let mut config_path = PathBuf::from("conduit.toml");
    let mut dev_mode = false;
    while let Some(a) = args.next() {
        match a.as_str() {
            "--config" => {
                let Some(path) = args.next() else {
                    anyhow::bail!("--config requires a path\n{USAGE}");
                };
                config_path = PathBuf::from(path);
            }
            "--dev" => {
                dev_mode = true;
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => {
                tracing::warn!("Ignoring unknown argument: {}", other);
            }
        }
    }

    let manifest = match load_manifest(&config_path)? {
        Some(manifest) => manifest,
        None => {
            tracing::warn!(
                "No manifest at {}, running a permissive session with defaults",
                config_path.display()
            );
            dev_mode = true;
            Manifest::default()
        }
    };

    tracing::info!(
        "Starting app: {} v{} ({})",
        manifest.app.name,
        manifest.app.version,
        manifest.app.identifier
    );
    if dev_mode {
        tracing::info!("Dev mode: all channels and UI capabilities allowed");
    }

    let capabilities = if dev_mode {
        Capabilities::dev()
    } else {
        Capabilities::from_permissions(manifest.ipc.as_ref(), manifest.ui.as_ref(), false)
            .context("compiling capabilities")?
    };
    let adapters = create_capability_adapters(capabilities);

    let report = session::run(manifest.session_config(), adapters)?;
    tracing::info!(
        report = %serde_json::to_string(&report).unwrap_or_default(),
        "Session finished"
    );
    Ok(())
}
