//! Control surfaces built on the IPC bridge: content wrappers, menus and
//! dialogs.
//!
//! Native primitives are reached through small traits ([`NativeView`],
//! [`NativeMenu`], [`NativeDialogs`]). The [`headless`] module implements
//! them in memory; the `native` feature adds `muda` and `rfd` backends.

use std::sync::Arc;

pub mod content;
pub mod dialog;
pub mod frame;
pub mod headless;
pub mod menu;
#[cfg(feature = "native")]
pub mod native;

pub use content::{ContentEvent, ContentHandle, ContentHost, NativeView, ScriptArg, ScriptReply, WebContents};
pub use dialog::{
    Dialog, DialogArg, DialogInvocation, DialogMode, DialogReply, FileFilter, MessageBoxOptions,
    MessageBoxReturn, NativeDialogs, OpenDialogOptions, OpenDialogReturn, SaveDialogOptions,
    SaveDialogReturn,
};
pub use frame::{ScriptEvaluator, WebFrame};
pub use menu::{
    Menu, MenuBuilder, MenuClick, MenuItem, MenuItemOptions, MenuItemType, NativeMenu,
    NativeMenuFactory, PopupOptions,
};

// ============================================================================
// Error Types (6000+ range)
// ============================================================================

/// Error codes for window operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WindowErrorCode {
    /// Generic window error
    Generic = 6000,
    /// Permission denied by capability system
    PermissionDenied = 6001,
    /// No content registered under the id
    ContentNotFound = 6002,
    /// Content already destroyed
    ContentDestroyed = 6003,
    /// Invalid dialog or menu options
    InvalidOptions = 6005,
    /// Menu error
    MenuError = 6007,
    /// Value of the wrong shape passed where a template or options object was expected
    TypeError = 6008,
    /// Channel send error
    ChannelSend = 6010,
    /// Channel receive error
    ChannelRecv = 6011,
    /// Native primitive failed
    Native = 6014,
}

/// Custom error type for window operations
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("[{code}] {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Permission denied: {message}")]
    PermissionDenied { code: u32, message: String },

    #[error("[{code}] Content not found: {content_id}")]
    ContentNotFound { code: u32, content_id: u32 },

    #[error("[{code}] Content already destroyed: {content_id}")]
    ContentDestroyed { code: u32, content_id: u32 },

    #[error("[{code}] Invalid options: {message}")]
    InvalidOptions { code: u32, message: String },

    #[error("[{code}] Menu error: {message}")]
    Menu { code: u32, message: String },

    #[error("[{code}] TypeError: {message}")]
    TypeError { code: u32, message: String },

    #[error("[{code}] Channel send error: {message}")]
    ChannelSend { code: u32, message: String },

    #[error("[{code}] Channel receive error: {message}")]
    ChannelRecv { code: u32, message: String },

    #[error("[{code}] Native error: {message}")]
    Native { code: u32, message: String },

    #[error(transparent)]
    Ipc(#[from] conduit_ipc::IpcError),
}

impl WindowError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: WindowErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            code: WindowErrorCode::PermissionDenied as u32,
            message: message.into(),
        }
    }

    pub fn content_not_found(content_id: u32) -> Self {
        Self::ContentNotFound {
            code: WindowErrorCode::ContentNotFound as u32,
            content_id,
        }
    }

    pub fn content_destroyed(content_id: u32) -> Self {
        Self::ContentDestroyed {
            code: WindowErrorCode::ContentDestroyed as u32,
            content_id,
        }
    }

    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            code: WindowErrorCode::InvalidOptions as u32,
            message: message.into(),
        }
    }

    pub fn menu(message: impl Into<String>) -> Self {
        Self::Menu {
            code: WindowErrorCode::MenuError as u32,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError {
            code: WindowErrorCode::TypeError as u32,
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            code: WindowErrorCode::ChannelSend as u32,
            message: message.into(),
        }
    }

    pub fn channel_recv(message: impl Into<String>) -> Self {
        Self::ChannelRecv {
            code: WindowErrorCode::ChannelRecv as u32,
            message: message.into(),
        }
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::Native {
            code: WindowErrorCode::Native as u32,
            message: message.into(),
        }
    }
}

// ============================================================================
// Capability Checker
// ============================================================================

/// Capability checker trait for menu and dialog operations
pub trait WindowCapabilityChecker: Send + Sync {
    fn check_menus(&self) -> Result<(), String>;
    fn check_dialogs(&self) -> Result<(), String>;
}

/// Default permissive checker (for dev mode)
pub struct PermissiveWindowChecker;

impl WindowCapabilityChecker for PermissiveWindowChecker {
    fn check_menus(&self) -> Result<(), String> {
        Ok(())
    }
    fn check_dialogs(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Wrapper holding the active capability checker
#[derive(Clone)]
pub struct WindowCapabilities {
    pub checker: Arc<dyn WindowCapabilityChecker>,
}

impl Default for WindowCapabilities {
    fn default() -> Self {
        Self {
            checker: Arc::new(PermissiveWindowChecker),
        }
    }
}

impl WindowCapabilities {
    pub fn new(checker: Arc<dyn WindowCapabilityChecker>) -> Self {
        Self { checker }
    }

    pub fn check_menus(&self) -> Result<(), WindowError> {
        self.checker
            .check_menus()
            .map_err(WindowError::permission_denied)
    }

    pub fn check_dialogs(&self) -> Result<(), WindowError> {
        self.checker
            .check_dialogs()
            .map_err(WindowError::permission_denied)
    }
}

// ============================================================================
// Tests
// ============================================================================
