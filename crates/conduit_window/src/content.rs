//! Content wrapper.
//!
//! A [`ContentHandle`] is the raw native content object: it raises native
//! events into its own registry and knows nothing about IPC. [`WebContents`]
//! wraps a handle the first time its API is touched, bridging native events
//! into the main-process [`IpcMain`] and exposing remote script execution.

use crate::WindowError;
use conduit_ipc::{
    reply_channel, ChannelRegistry, Envelope, InvokeOutcome, IpcMain, IpcMainEvent, ListenerId,
    RemoteError, RendererPort,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Main → renderer channel carrying `[request_id, method, ...args]`.
pub const WEB_FRAME_METHOD_CHANNEL: &str = "CONDUIT_WEB_FRAME_METHOD";

/// Prefix of the renderer → main reply channel for web frame methods.
pub const WEB_FRAME_RESPONSE_PREFIX: &str = "CONDUIT_WEB_FRAME_RESPONSE";

/// Native view primitives the wrapper relies on.
pub trait NativeView {
    fn load_url(&self, url: &str) -> Result<(), WindowError>;
    fn title(&self) -> String;
    fn is_destroyed(&self) -> bool;
}

// ============================================================================
// Native Events
// ============================================================================

/// Events raised by the native content object.
#[derive(Debug, Clone)]
pub enum ContentEvent {
    IpcMessage(IpcMainEvent),
    IpcMessageSync(IpcMainEvent),
    TitleUpdated { title: String, explicit_set: bool },
    DidFinishLoad,
    RenderProcessGone { reason: String },
    Destroyed,
}

impl ContentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IpcMessage(_) => "ipc-message",
            Self::IpcMessageSync(_) => "ipc-message-sync",
            Self::TitleUpdated { .. } => "page-title-updated",
            Self::DidFinishLoad => "did-finish-load",
            Self::RenderProcessGone { .. } => "render-process-gone",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Raw native content object.
///
/// Owned by whatever created the view; the wrapper only borrows its
/// lifetime. `wrapped` flips once, the first time a wrapper attaches.
pub struct ContentHandle {
    id: u32,
    view: Box<dyn NativeView>,
    native_events: ChannelRegistry<ContentEvent>,
    wrapped: Cell<bool>,
}

impl fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHandle")
            .field("id", &self.id)
            .field("wrapped", &self.wrapped.get())
            .finish_non_exhaustive()
    }
}

impl ContentHandle {
    pub fn new(id: u32, view: Box<dyn NativeView>) -> Rc<Self> {
        Rc::new(Self {
            id,
            view,
            native_events: ChannelRegistry::new(),
            wrapped: Cell::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn view(&self) -> &dyn NativeView {
        self.view.as_ref()
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped.get()
    }

    pub fn native_events(&self) -> &ChannelRegistry<ContentEvent> {
        &self.native_events
    }

    /// Raise a native event. Events raised before a wrapper attaches have no
    /// listeners and are dropped.
    pub fn raise(&self, event: ContentEvent) -> anyhow::Result<bool> {
        self.native_events.emit(event.name(), &event)
    }
}

// ============================================================================
// Script Execution
// ============================================================================

/// Optional arguments accepted after the code string of
/// [`WebContents::execute_javascript`].
pub enum ScriptArg {
    UserGesture(bool),
    Callback(Box<dyn FnOnce(&Value)>),
}

impl fmt::Debug for ScriptArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserGesture(flag) => f.debug_tuple("UserGesture").field(flag).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Pending result of a remote script evaluation.
#[derive(Debug)]
pub struct ScriptReply {
    request_id: u64,
    rx: oneshot::Receiver<Result<Value, RemoteError>>,
}

impl ScriptReply {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for ScriptReply {
    type Output = Result<Value, RemoteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RemoteError::Disconnected)))
    }
}

/// Split the optional arguments: the gesture flag only counts in first
/// position, the callback is the first callback anywhere.
fn split_script_args<I>(args: I) -> (bool, Option<Box<dyn FnOnce(&Value)>>)
where
    I: IntoIterator<Item = ScriptArg>,
{
    let mut gesture = false;
    let mut callback = None;
    for (index, arg) in args.into_iter().enumerate() {
        match arg {
            ScriptArg::UserGesture(flag) if index == 0 => gesture = flag,
            ScriptArg::UserGesture(_) => {}
            ScriptArg::Callback(cb) => {
                if callback.is_none() {
                    callback = Some(cb);
                }
            }
        }
    }
    (gesture, callback)
}

// ============================================================================
// WebContents
// ============================================================================

/// Wrapper-facing API over a [`ContentHandle`].
pub struct WebContents {
    handle: Rc<ContentHandle>,
    ipc: Rc<IpcMain>,
    events: ChannelRegistry<ContentEvent>,
    deferred: RefCell<VecDeque<ContentEvent>>,
    scripts: RefCell<Vec<(String, ListenerId)>>,
    this: Weak<WebContents>,
}

impl fmt::Debug for WebContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebContents")
            .field("handle", &self.handle)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl WebContents {
    /// Wrap `handle`. Nothing is attached until the API is first used.
    pub fn wrap(handle: Rc<ContentHandle>, ipc: Rc<IpcMain>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            handle,
            ipc,
            events: ChannelRegistry::new(),
            deferred: RefCell::new(VecDeque::new()),
            scripts: RefCell::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn handle(&self) -> &Rc<ContentHandle> {
        &self.handle
    }

    /// Attach the native event bridges. Runs once per handle; later calls
    /// return immediately.
    pub fn init(&self) {
        if self.handle.wrapped.replace(true) {
            return;
        }
        debug!(content_id = self.id(), "Wrapping content handle");

        self.events.set_max_listeners(0);
        self.events.on("error", |_| Ok(()));

        let native = &self.handle.native_events;

        let this = self.this.clone();
        native.on("ipc-message", move |event| {
            let (Some(contents), ContentEvent::IpcMessage(message)) = (this.upgrade(), event) else {
                return Ok(());
            };
            let emitted = contents.events.emit("ipc-message", event);
            contents.ipc.dispatch_event(message)?;
            emitted.map(|_| ())
        });

        let this = self.this.clone();
        native.on("ipc-message-sync", move |event| {
            let (Some(contents), ContentEvent::IpcMessageSync(message)) = (this.upgrade(), event)
            else {
                return Ok(());
            };
            // Dispatch even when a wrapper listener fails so the sender is released
            let emitted = contents.events.emit("ipc-message-sync", event);
            contents.ipc.dispatch_event(message)?;
            emitted.map(|_| ())
        });

        let this = self.this.clone();
        native.on("page-title-updated", move |event| {
            if let Some(contents) = this.upgrade() {
                contents.deferred.borrow_mut().push_back(event.clone());
            }
            Ok(())
        });

        for name in ["did-finish-load", "render-process-gone"] {
            let this = self.this.clone();
            native.on(name, move |event| {
                if let Some(contents) = this.upgrade() {
                    contents.events.emit(event.name(), event)?;
                }
                Ok(())
            });
        }

        let this = self.this.clone();
        native.on("destroyed", move |event| {
            if let Some(contents) = this.upgrade() {
                contents.abandon_scripts();
                contents.ipc.detach_renderer(contents.id());
                contents.events.emit("destroyed", event)?;
            }
            Ok(())
        });
    }

    /// Drop the reply listeners of unanswered scripts. Their replies resolve
    /// to [`RemoteError::Disconnected`].
    fn abandon_scripts(&self) {
        let scripts = std::mem::take(&mut *self.scripts.borrow_mut());
        let abandoned = scripts
            .iter()
            .filter(|(channel, id)| self.ipc.remove_listener(channel, *id))
            .count();
        if abandoned > 0 {
            debug!(content_id = self.id(), abandoned, "Abandoned pending scripts");
        }
    }

    /// Redispatch events queued for the next tick. Returns how many ran.
    pub fn run_deferred(&self) -> anyhow::Result<usize> {
        let mut count = 0;
        loop {
            let next = self.deferred.borrow_mut().pop_front();
            let Some(event) = next else {
                break;
            };
            count += 1;
            self.events.emit(event.name(), &event)?;
        }
        Ok(count)
    }

    pub fn on<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&ContentEvent) -> anyhow::Result<()> + 'static,
    {
        self.init();
        self.events.on(channel, listener)
    }

    pub fn once<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&ContentEvent) -> anyhow::Result<()> + 'static,
    {
        self.init();
        self.events.once(channel, listener)
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.events.remove_listener(channel, id)
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.events.listener_count(channel)
    }

    /// Raise a native event on the wrapped handle.
    pub fn dispatch_native(&self, event: ContentEvent) -> anyhow::Result<bool> {
        self.init();
        self.handle.raise(event)
    }

    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<(), WindowError> {
        self.init();
        self.ensure_alive()?;
        self.ipc.send_to(self.id(), channel, args)?;
        Ok(())
    }

    pub fn send_to_all(&self, channel: &str, args: Vec<Value>) -> Result<usize, WindowError> {
        self.init();
        Ok(self.ipc.send_to_all(channel, args)?)
    }

    pub fn load_url(&self, url: &str) -> Result<(), WindowError> {
        self.init();
        self.ensure_alive()?;
        info!(content_id = self.id(), url = %url, "Loading URL");
        self.handle.view.load_url(url)
    }

    pub fn title(&self) -> String {
        self.handle.view.title()
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.view.is_destroyed()
    }

    fn ensure_alive(&self) -> Result<(), WindowError> {
        if self.is_destroyed() {
            return Err(WindowError::content_destroyed(self.id()));
        }
        Ok(())
    }

    /// Evaluate `code` in the renderer.
    ///
    /// `args` may hold a user-gesture flag in first position and a callback
    /// anywhere; the first callback found runs with the value on success.
    pub fn execute_javascript<I>(&self, code: &str, args: I) -> Result<ScriptReply, WindowError>
    where
        I: IntoIterator<Item = ScriptArg>,
    {
        self.init();
        self.ensure_alive()?;
        let (gesture, callback) = split_script_args(args);

        let request_id = self.ipc.context().next_request_id();
        let reply = reply_channel(WEB_FRAME_RESPONSE_PREFIX, request_id);
        let (tx, rx) = oneshot::channel();
        let slot = RefCell::new(Some((tx, callback)));

        let listener = self.ipc.once(reply.clone(), move |event| {
            let result = match InvokeOutcome::from_args(&event.args) {
                Ok(outcome) => outcome.into_result(),
                Err(_) => Err(RemoteError::Raw(Value::Array(event.args.clone()))),
            };
            if let Some((tx, callback)) = slot.borrow_mut().take() {
                if let (Ok(value), Some(callback)) = (&result, callback) {
                    callback(value);
                }
                let _ = tx.send(result);
            }
            Ok(())
        });

        let payload = vec![
            Value::from(request_id),
            Value::from("executeJavaScript"),
            Value::from(code),
            Value::from(gesture),
        ];
        if let Err(e) = self.ipc.send_to(self.id(), WEB_FRAME_METHOD_CHANNEL, payload) {
            self.ipc.remove_listener(&reply, listener);
            return Err(e.into());
        }
        debug!(content_id = self.id(), request_id, gesture, "executeJavaScript");
        let mut scripts = self.scripts.borrow_mut();
        scripts.retain(|(channel, _)| self.ipc.listener_count(channel) > 0);
        scripts.push((reply, listener));
        Ok(ScriptReply { request_id, rx })
    }
}

// ============================================================================
// ContentHost
// ============================================================================

/// Owns every live wrapper of one main process and routes incoming
/// envelopes to the wrapper of the sending renderer.
pub struct ContentHost {
    ipc: Rc<IpcMain>,
    contents: RefCell<BTreeMap<u32, Rc<WebContents>>>,
    next_id: Cell<u32>,
}

impl ContentHost {
    pub fn new(ipc: Rc<IpcMain>) -> Self {
        Self {
            ipc,
            contents: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        }
    }

    pub fn ipc(&self) -> &Rc<IpcMain> {
        &self.ipc
    }

    /// Create a content object for `view` and connect its renderer. The
    /// returned port belongs to the renderer side.
    pub fn create(
        &self,
        view: Box<dyn NativeView>,
    ) -> Result<(Rc<WebContents>, RendererPort), WindowError> {
        self.create_with_channels(view, None)
    }

    /// Like [`ContentHost::create`], with a channel allowlist of its own for
    /// the renderer.
    pub fn create_with_channels(
        &self,
        view: Box<dyn NativeView>,
        channels: Option<Vec<String>>,
    ) -> Result<(Rc<WebContents>, RendererPort), WindowError> {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);

        let port = self.ipc.attach_renderer_with_channels(id, channels)?;
        let handle = ContentHandle::new(id, view);
        let contents = WebContents::wrap(handle, self.ipc.clone());
        self.contents.borrow_mut().insert(id, contents.clone());
        info!(content_id = id, "Content created");
        Ok((contents, port))
    }

    pub fn from_id(&self, id: u32) -> Option<Rc<WebContents>> {
        self.contents.borrow().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Rc<WebContents>> {
        self.contents.borrow().values().cloned().collect()
    }

    /// Accept an envelope and hand it to the sender's wrapper as a native
    /// event. Envelopes from renderers without a wrapper go straight to the
    /// bridge.
    pub fn route(&self, envelope: Envelope) -> anyhow::Result<()> {
        let Some(message) = self.ipc.accept(envelope) else {
            return Ok(());
        };
        match self.from_id(message.sender.id()) {
            Some(contents) => {
                let event = if message.is_sync() {
                    ContentEvent::IpcMessageSync(message)
                } else {
                    ContentEvent::IpcMessage(message)
                };
                contents.dispatch_native(event)?;
            }
            None => self.ipc.dispatch_event(&message)?,
        }
        Ok(())
    }

    /// Drain deferred ticks of every wrapper.
    pub fn run_deferred(&self) -> usize {
        let mut count = 0;
        for contents in self.all() {
            match contents.run_deferred() {
                Ok(n) => count += n,
                Err(e) => error!(content_id = contents.id(), error = %e, "Deferred listener failed"),
            }
        }
        count
    }

    /// Route every queued envelope, then poll deferred invoke replies and run
    /// deferred ticks.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        while let Some(envelope) = self.ipc.try_recv() {
            count += 1;
            if let Err(e) = self.route(envelope) {
                error!(error = %e, "Listener failed while routing message");
            }
        }
        self.ipc.drive_replies();
        self.run_deferred();
        count
    }

    /// Route messages until the inbox closes.
    pub async fn run(&self) {
        while let Some(envelope) = self.ipc.recv().await {
            if let Err(e) = self.route(envelope) {
                error!(error = %e, "Listener failed while routing message");
            }
            self.run_deferred();
        }
        info!("Content host stopped");
    }

    /// Raise `destroyed` on the content and forget it.
    pub fn destroy(&self, id: u32) -> Result<(), WindowError> {
        let contents = self
            .contents
            .borrow_mut()
            .remove(&id)
            .ok_or_else(|| WindowError::content_not_found(id))?;
        if let Err(e) = contents.dispatch_native(ContentEvent::Destroyed) {
            warn!(content_id = id, error = %e, "Destroyed listener failed");
        }
        Ok(())
    }
}
