//! Cross-process messaging bridge between the privileged main process and
//! sandboxed renderer processes.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────┐   Envelope (mpsc)   ┌──────────────────┐
//! │   IpcRenderer    │ ──────────────────► │     IpcMain      │
//! │ ChannelRegistry  │ ◄────────────────── │ ChannelRegistry  │
//! └──────────────────┘    RendererLink     └──────────────────┘
//! ```
//!
//! - [`registry`]: process-local publish/subscribe table (`on`, `once`, `emit`).
//! - [`transport`]: envelopes and the main/renderer ports that carry them.
//! - [`main_process`]: the main-side bridge (`on`, `handle`, `send_to`, `send_to_all`).
//! - [`renderer`]: the renderer-side bridge (`send`, `send_sync`, `invoke`).
//! - [`remote_error`]: serialized error tagging and local rehydration.
//!
//! Every process runs one cooperative event loop. Nothing in this crate is
//! `Sync`; the only values that cross threads are the transport ports.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

pub mod main_process;
pub mod registry;
pub mod remote_error;
pub mod renderer;
pub mod transport;

pub use main_process::{Handled, IpcInvokeEvent, IpcMain, IpcMainEvent, SenderRef};
pub use registry::{ChannelRegistry, ListenerId, DEFAULT_MAX_LISTENERS};
pub use remote_error::{InvokeOutcome, RemoteError, RemoteErrorKind, SERIALIZED_ERROR_TAG};
pub use renderer::{InvokeReply, IpcRenderer, IpcRendererEvent};
pub use transport::{Delivery, Envelope, MainLink, RendererLink, RendererPort, MAIN_PROCESS_ID};

// ============================================================================
// Wire Contract
// ============================================================================

/// Reserved channel carrying `[request_id, channel, ...args]` for `invoke`.
pub const INVOKE_DISPATCH_CHANNEL: &str = "CONDUIT_IPC_INVOKE";

/// Prefix of the per-request reply channel: `"<prefix>-<request_id>"`.
pub const INVOKE_REPLY_PREFIX: &str = "CONDUIT_IPC_INVOKE_REPLY";

/// Channels starting with this prefix carry protocol traffic, not user messages.
pub const INTERNAL_CHANNEL_PREFIX: &str = "CONDUIT_";

/// Build the reply channel name both sides agree on for `request_id`.
pub fn reply_channel(prefix: &str, request_id: u64) -> String {
    format!("{prefix}-{request_id}")
}

pub fn is_internal_channel(channel: &str) -> bool {
    channel.starts_with(INTERNAL_CHANNEL_PREFIX)
}

// ============================================================================
// Error Types (7000+ range - conduit_window uses 6000)
// ============================================================================

/// Error codes for IPC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpcErrorCode {
    /// Missing or empty channel, malformed protocol arguments
    InvalidArgument = 7000,
    /// Channel send error
    ChannelSend = 7001,
    /// Channel receive error
    ChannelRecv = 7002,
    /// Permission denied by capability system
    PermissionDenied = 7003,
    /// Payload could not be serialized or parsed
    Serialization = 7004,
    /// No renderer attached under the given id
    RendererNotFound = 7005,
}

/// Custom error type for IPC operations
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("[{code}] Invalid argument: {message}")]
    InvalidArgument { code: u32, message: String },

    #[error("[{code}] Channel send error: {message}")]
    ChannelSend { code: u32, message: String },

    #[error("[{code}] Channel receive error: {message}")]
    ChannelRecv { code: u32, message: String },

    #[error("[{code}] Permission denied: {message}")]
    PermissionDenied { code: u32, message: String },

    #[error("[{code}] Serialization error: {message}")]
    Serialization { code: u32, message: String },

    #[error("[{code}] Renderer not found: {renderer_id}")]
    RendererNotFound { code: u32, renderer_id: u32 },
}

impl IpcError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            code: IpcErrorCode::InvalidArgument as u32,
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            code: IpcErrorCode::ChannelSend as u32,
            message: message.into(),
        }
    }

    pub fn channel_recv(message: impl Into<String>) -> Self {
        Self::ChannelRecv {
            code: IpcErrorCode::ChannelRecv as u32,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            code: IpcErrorCode::PermissionDenied as u32,
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            code: IpcErrorCode::Serialization as u32,
            message: message.into(),
        }
    }

    pub fn renderer_not_found(renderer_id: u32) -> Self {
        Self::RendererNotFound {
            code: IpcErrorCode::RendererNotFound as u32,
            renderer_id,
        }
    }
}

/// Reject the empty channel name; every send path goes through this.
pub fn validate_channel(channel: &str) -> Result<(), IpcError> {
    if channel.is_empty() {
        return Err(IpcError::invalid_argument("channel must be a non-empty string"));
    }
    Ok(())
}

// ============================================================================
// Process Context
// ============================================================================

/// Process-scoped state shared by every bridge object living in one process.
///
/// Request ids are unique only for the lifetime of the context; they are
/// never persisted.
#[derive(Debug, Default)]
pub struct ProcessContext {
    next_request_id: Cell<u64>,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id. The first id is 1.
    pub fn next_request_id(&self) -> u64 {
        let id = self.next_request_id.get() + 1;
        self.next_request_id.set(id);
        id
    }
}

// ============================================================================
// Capability Checker
// ============================================================================

/// Capability checker trait for IPC operations
pub trait IpcCapabilityChecker: Send + Sync {
    /// Check if a channel is allowed for IPC communication
    fn check_channel(&self, channel: &str, renderer_channels: Option<&[String]>)
        -> Result<(), String>;
}

/// Default permissive checker (for dev mode)
pub struct PermissiveIpcChecker;

impl IpcCapabilityChecker for PermissiveIpcChecker {
    fn check_channel(
        &self,
        _channel: &str,
        _renderer_channels: Option<&[String]>,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Wrapper holding the active capability checker
#[derive(Clone)]
pub struct IpcCapabilities {
    pub checker: Arc<dyn IpcCapabilityChecker>,
}

impl Default for IpcCapabilities {
    fn default() -> Self {
        Self {
            checker: Arc::new(PermissiveIpcChecker),
        }
    }
}

impl fmt::Debug for IpcCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcCapabilities").finish_non_exhaustive()
    }
}

impl IpcCapabilities {
    pub fn new(checker: Arc<dyn IpcCapabilityChecker>) -> Self {
        Self { checker }
    }

    pub fn check(&self, channel: &str) -> Result<(), IpcError> {
        self.check_for(channel, None)
    }

    /// Check `channel` for a renderer that carries its own allowlist.
    pub fn check_for(&self, channel: &str, renderer_channels: Option<&[String]>) -> Result<(), IpcError> {
        self.checker
            .check_channel(channel, renderer_channels)
            .map_err(IpcError::permission_denied)
    }

    /// Like [`IpcCapabilities::check`], but protocol channels always pass.
    pub fn check_user_channel(&self, channel: &str) -> Result<(), IpcError> {
        self.check_user_channel_for(channel, None)
    }

    pub fn check_user_channel_for(
        &self,
        channel: &str,
        renderer_channels: Option<&[String]>,
    ) -> Result<(), IpcError> {
        if is_internal_channel(channel) {
            return Ok(());
        }
        self.check_for(channel, renderer_channels)
    }
}

// ============================================================================
// Tests
// ============================================================================
