//! Transport adapter between the main process and its renderers.
//!
//! Every renderer owns a [`RendererPort`]: its inbox plus a [`MainLink`]
//! into the main process. The main process owns one [`MainInbox`] shared by
//! all renderers and a [`RendererLink`] per renderer. Links are unbounded
//! tokio channels, so delivery is reliable and FIFO per sender.
//!
//! Synchronous round trips carry a crossbeam reply slot; the reply travels
//! as a JSON string and is parsed on arrival, so the caller always receives
//! its own copy of the value.

use crate::IpcError;
use serde_json::Value;
use std::cell::RefCell;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Sender id stamped on envelopes that originate in the main process.
pub const MAIN_PROCESS_ID: u32 = 0;

/// How the receiving side must treat an envelope.
#[derive(Debug)]
pub enum Delivery {
    /// Fire-and-forget.
    Async,
    /// The sender is blocked until a serialized reply is written here.
    Sync(crossbeam_channel::Sender<String>),
}

/// One message crossing the process boundary.
#[derive(Debug)]
pub struct Envelope {
    /// Renderer id of the sender, or [`MAIN_PROCESS_ID`].
    pub sender_id: u32,
    pub channel: String,
    pub args: Vec<Value>,
    pub delivery: Delivery,
}

impl Envelope {
    pub fn is_sync(&self) -> bool {
        matches!(self.delivery, Delivery::Sync(_))
    }
}

// ============================================================================
// Main Process Side
// ============================================================================

/// Inbox of the main process, fed by every attached renderer.
pub struct MainInbox {
    tx: RefCell<Option<mpsc::UnboundedSender<Envelope>>>,
    rx: RefCell<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl Default for MainInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MainInbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: RefCell::new(Some(tx)),
            rx: RefCell::new(Some(rx)),
        }
    }

    /// Create the link pair for a new renderer.
    pub fn connect(&self, renderer_id: u32) -> Result<(RendererLink, RendererPort), IpcError> {
        let to_main = self
            .tx
            .borrow()
            .clone()
            .ok_or_else(|| IpcError::channel_send("main inbox is sealed"))?;
        let (to_renderer_tx, to_renderer_rx) = mpsc::unbounded_channel();

        let link = RendererLink {
            renderer_id,
            tx: to_renderer_tx,
        };
        let port = RendererPort {
            main: MainLink {
                renderer_id,
                tx: to_main,
            },
            rx: RefCell::new(Some(to_renderer_rx)),
        };
        Ok((link, port))
    }

    /// Stop accepting new renderers. Once every existing port is dropped the
    /// inbox reports end-of-stream.
    pub fn seal(&self) {
        self.tx.borrow_mut().take();
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.borrow_mut().as_mut()?.try_recv().ok()
    }

    /// Wait for the next envelope. `None` once the inbox is sealed and every
    /// renderer port is gone.
    pub async fn recv(&self) -> Option<Envelope> {
        let mut rx = self.rx.borrow_mut().take()?;
        let result = rx.recv().await;

        // Put the receiver back
        *self.rx.borrow_mut() = Some(rx);
        result
    }

    /// Poll for the next envelope. Ready with `None` once the inbox has ended
    /// or another `recv` currently holds the receiver.
    pub fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        match self.rx.borrow_mut().as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }

    /// Blocking variant of [`MainInbox::recv`] for a dedicated main thread.
    /// Must not be called from inside an async runtime.
    pub fn recv_blocking(&self) -> Option<Envelope> {
        let mut rx = self.rx.borrow_mut().take()?;
        let result = rx.blocking_recv();
        *self.rx.borrow_mut() = Some(rx);
        result
    }
}

/// Main-process handle used to deliver into one renderer.
#[derive(Debug, Clone)]
pub struct RendererLink {
    renderer_id: u32,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl RendererLink {
    pub fn renderer_id(&self) -> u32 {
        self.renderer_id
    }

    /// `true` once the renderer port has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn post(&self, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        self.tx
            .send(Envelope {
                sender_id: MAIN_PROCESS_ID,
                channel: channel.to_string(),
                args,
                delivery: Delivery::Async,
            })
            .map_err(|e| IpcError::channel_send(e.to_string()))
    }
}

// ============================================================================
// Renderer Side
// ============================================================================

/// Renderer handle used to deliver into the main process.
#[derive(Debug, Clone)]
pub struct MainLink {
    renderer_id: u32,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MainLink {
    pub fn renderer_id(&self) -> u32 {
        self.renderer_id
    }

    pub fn post(&self, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        self.tx
            .send(Envelope {
                sender_id: self.renderer_id,
                channel: channel.to_string(),
                args,
                delivery: Delivery::Async,
            })
            .map_err(|e| IpcError::channel_send(e.to_string()))
    }

    /// Send and block the calling thread until the main process replies.
    pub fn post_sync(&self, channel: &str, args: Vec<Value>) -> Result<Value, IpcError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(Envelope {
                sender_id: self.renderer_id,
                channel: channel.to_string(),
                args,
                delivery: Delivery::Sync(reply_tx),
            })
            .map_err(|e| IpcError::channel_send(e.to_string()))?;

        let raw = reply_rx
            .recv()
            .map_err(|e| IpcError::channel_recv(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| IpcError::serialization(e.to_string()))
    }
}

/// Everything a renderer process needs to talk to the main process.
///
/// `Send`, so it can be handed to the thread that hosts the renderer.
#[derive(Debug)]
pub struct RendererPort {
    main: MainLink,
    rx: RefCell<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl RendererPort {
    pub fn renderer_id(&self) -> u32 {
        self.main.renderer_id
    }

    pub fn main(&self) -> &MainLink {
        &self.main
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.borrow_mut().as_mut()?.try_recv().ok()
    }

    pub async fn recv(&self) -> Option<Envelope> {
        let mut rx = self.rx.borrow_mut().take()?;
        let result = rx.recv().await;
        *self.rx.borrow_mut() = Some(rx);
        result
    }
}

/// Write a synchronous reply. The value is serialized to a string here and
/// parsed again by the blocked sender.
pub fn reply_sync(slot: &crossbeam_channel::Sender<String>, value: &Value) -> Result<(), IpcError> {
    let raw = serde_json::to_string(value).map_err(|e| IpcError::serialization(e.to_string()))?;
    slot.send(raw)
        .map_err(|e| IpcError::channel_send(e.to_string()))
}
