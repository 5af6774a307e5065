//! Capabilities for the host session
//!
//! In dev mode, all operations are allowed.
//! Otherwise channels and UI surfaces are checked against the manifest.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::sync::Arc;

/// `[ipc]` section of conduit.toml
#[derive(Debug, Deserialize, Clone, Default)]
pub struct IpcPermissions {
    /// Channel allowlist (glob patterns, `"*"` for all)
    pub channels: Option<Vec<String>>,
    /// Listener ceiling per channel (`0` = unbounded)
    pub max_listeners: Option<usize>,
}

/// `[ui]` section of conduit.toml
#[derive(Debug, Deserialize, Clone, Default)]
pub struct UiPermissions {
    pub menus: Option<bool>,
    pub dialogs: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Permission denied: {capability} for {resource}")]
    Denied {
        capability: String,
        resource: String,
    },

    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(String),
}

fn denied(capability: &str, resource: &str) -> CapabilityError {
    CapabilityError::Denied {
        capability: capability.to_string(),
        resource: resource.to_string(),
    }
}

/// Session capabilities checker
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub dev_mode: bool,
    channels: Option<GlobSet>,
    ui_menus: bool,
    ui_dialogs: bool,
}

impl Capabilities {
    pub fn from_permissions(
        ipc: Option<&IpcPermissions>,
        ui: Option<&UiPermissions>,
        dev_mode: bool,
    ) -> Result<Self, CapabilityError> {
        let ipc = ipc.cloned().unwrap_or_default();
        let ui = ui.cloned().unwrap_or_default();

        Ok(Self {
            dev_mode,
            channels: Self::compile_patterns(ipc.channels.as_deref())?,
            ui_menus: ui.menus.unwrap_or(true),
            ui_dialogs: ui.dialogs.unwrap_or(true),
        })
    }

    /// Everything allowed, as in `--dev`.
    pub fn dev() -> Self {
        Self {
            dev_mode: true,
            channels: None,
            ui_menus: true,
            ui_dialogs: true,
        }
    }

    /// Channel names carry no path separators, so `*` matches anything.
    fn compile_patterns(patterns: Option<&[String]>) -> Result<Option<GlobSet>, CapabilityError> {
        match patterns {
            None => Ok(None),
            Some([]) => Ok(None),
            Some(pats) => {
                let mut builder = GlobSetBuilder::new();
                for pat in pats {
                    let glob = GlobBuilder::new(pat)
                        .literal_separator(false)
                        .build()
                        .map_err(|e| CapabilityError::InvalidPattern(e.to_string()))?;
                    builder.add(glob);
                }
                Ok(Some(builder.build().map_err(|e| {
                    CapabilityError::InvalidPattern(e.to_string())
                })?))
            }
        }
    }

    /// Check a channel against the renderer's own allowlist when it has one,
    /// otherwise against the manifest. No list at all denies every channel.
    pub fn check_channel(
        &self,
        channel: &str,
        renderer_channels: Option<&[String]>,
    ) -> Result<(), CapabilityError> {
        if self.dev_mode {
            return Ok(());
        }

        if let Some(list) = renderer_channels {
            let allowed = list.iter().any(|c| {
                c == "*"
                    || c == channel
                    || GlobBuilder::new(c)
                        .literal_separator(false)
                        .build()
                        .is_ok_and(|g| g.compile_matcher().is_match(channel))
            });
            return if allowed {
                Ok(())
            } else {
                Err(denied("ipc.channel", channel))
            };
        }

        match &self.channels {
            Some(set) if set.is_match(channel) => Ok(()),
            _ => Err(denied("ipc.channel", channel)),
        }
    }

    pub fn check_ui_menus(&self) -> Result<(), CapabilityError> {
        if self.dev_mode || self.ui_menus {
            Ok(())
        } else {
            Err(denied("ui.menus", "menu"))
        }
    }

    pub fn check_ui_dialogs(&self) -> Result<(), CapabilityError> {
        if self.dev_mode || self.ui_dialogs {
            Ok(())
        } else {
            Err(denied("ui.dialogs", "dialog"))
        }
    }
}

// ============================================================================
// Adapters implementing the library capability checker traits
// ============================================================================

pub struct IpcCapabilityAdapter {
    capabilities: Arc<Capabilities>,
}

impl IpcCapabilityAdapter {
    pub fn new(capabilities: Arc<Capabilities>) -> Self {
        Self { capabilities }
    }
}

impl conduit_ipc::IpcCapabilityChecker for IpcCapabilityAdapter {
    fn check_channel(
        &self,
        channel: &str,
        renderer_channels: Option<&[String]>,
    ) -> Result<(), String> {
        self.capabilities
            .check_channel(channel, renderer_channels)
            .map_err(|e| e.to_string())
    }
}

pub struct WindowCapabilityAdapter {
    capabilities: Arc<Capabilities>,
}

impl WindowCapabilityAdapter {
    pub fn new(capabilities: Arc<Capabilities>) -> Self {
        Self { capabilities }
    }
}

impl conduit_window::WindowCapabilityChecker for WindowCapabilityAdapter {
    fn check_menus(&self) -> Result<(), String> {
        self.capabilities
            .check_ui_menus()
            .map_err(|e| e.to_string())
    }

    fn check_dialogs(&self) -> Result<(), String> {
        self.capabilities
            .check_ui_dialogs()
            .map_err(|e| e.to_string())
    }
}

/// Capability wrappers ready to hand to the bridge and the window layer
#[derive(Clone)]
pub struct CapabilityAdapters {
    pub ipc: conduit_ipc::IpcCapabilities,
    pub window: conduit_window::WindowCapabilities,
}

pub fn create_capability_adapters(capabilities: Capabilities) -> CapabilityAdapters {
    let caps = Arc::new(capabilities);
    CapabilityAdapters {
        ipc: conduit_ipc::IpcCapabilities::new(Arc::new(IpcCapabilityAdapter::new(caps.clone()))),
        window: conduit_window::WindowCapabilities::new(Arc::new(WindowCapabilityAdapter::new(
            caps,
        ))),
    }
}
