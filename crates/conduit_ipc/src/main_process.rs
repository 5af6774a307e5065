//! Main-process side of the bridge.
//!
//! [`IpcMain`] owns the process inbox, one [`RendererLink`] per attached
//! renderer, the registry user code subscribes to with `on`/`once`, and a
//! second registry for `invoke` handlers.

use crate::registry::{ChannelRegistry, ListenerId};
use crate::remote_error::{InvokeOutcome, RemoteError, RemoteErrorKind};
use crate::transport::{reply_sync, Delivery, Envelope, MainInbox, RendererLink, RendererPort};
use crate::{
    reply_channel, validate_channel, IpcCapabilities, IpcError, ProcessContext,
    INVOKE_DISPATCH_CHANNEL, INVOKE_REPLY_PREFIX,
};
use futures_util::future::LocalBoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::task::noop_waker_ref;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{debug, error, info, warn};

// ============================================================================
// Events
// ============================================================================

/// The renderer a message came from. Replies go straight back to it.
#[derive(Debug, Clone)]
pub struct SenderRef {
    link: RendererLink,
    channels: Option<Rc<[String]>>,
    capabilities: IpcCapabilities,
}

impl SenderRef {
    pub fn id(&self) -> u32 {
        self.link.renderer_id()
    }

    pub fn is_destroyed(&self) -> bool {
        self.link.is_closed()
    }

    /// The renderer's own channel allowlist, when it was attached with one.
    pub fn channels(&self) -> Option<&[String]> {
        self.channels.as_deref()
    }

    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        validate_channel(channel)?;
        self.capabilities
            .check_user_channel_for(channel, self.channels())?;
        self.link.post(channel, args)
    }
}

/// A connected renderer as the main process sees it.
#[derive(Debug, Clone)]
struct Attached {
    link: RendererLink,
    channels: Option<Rc<[String]>>,
}

/// Return slot of a synchronous message. The blocked renderer is released
/// exactly once, when the slot is finished.
struct SyncSlot {
    value: RefCell<Option<Value>>,
    reply: crossbeam_channel::Sender<String>,
    finished: Cell<bool>,
}

impl SyncSlot {
    fn finish(&self, channel: &str) {
        if self.finished.replace(true) {
            return;
        }
        let value = self.value.borrow_mut().take().unwrap_or_else(|| {
            warn!(channel = %channel, "Synchronous message left without a return value, replying null");
            Value::Null
        });
        if let Err(e) = reply_sync(&self.reply, &value) {
            warn!(channel = %channel, error = %e, "Synchronous reply could not be delivered");
        }
    }
}

/// A message delivered to main-process listeners.
#[derive(Clone)]
pub struct IpcMainEvent {
    pub sender: SenderRef,
    pub channel: String,
    pub args: Vec<Value>,
    sync: Option<Rc<SyncSlot>>,
}

impl fmt::Debug for IpcMainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcMainEvent")
            .field("sender", &self.sender.id())
            .field("channel", &self.channel)
            .field("args", &self.args)
            .field("sync", &self.sync.is_some())
            .finish()
    }
}

impl IpcMainEvent {
    pub fn is_sync(&self) -> bool {
        self.sync.is_some()
    }

    /// Set the value a `send_sync` caller receives.
    pub fn set_return_value(&self, value: Value) -> Result<(), IpcError> {
        let slot = self.sync.as_ref().ok_or_else(|| {
            IpcError::invalid_argument("return value can only be set for synchronous messages")
        })?;
        *slot.value.borrow_mut() = Some(value);
        Ok(())
    }

    pub fn return_value(&self) -> Option<Value> {
        self.sync.as_ref()?.value.borrow().clone()
    }

    /// Send a message back to the renderer this event came from.
    pub fn reply(&self, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        self.sender.send(channel, args)
    }

    fn finish_sync(&self) {
        if let Some(slot) = &self.sync {
            slot.finish(&self.channel);
        }
    }
}

/// A correlated request delivered to `handle` listeners.
#[derive(Debug, Clone)]
pub struct IpcInvokeEvent {
    pub request_id: u64,
    pub sender: SenderRef,
    pub channel: String,
    pub args: Vec<Value>,
}

/// What an `invoke` handler produced.
///
/// Only a deferred result is forwarded to the caller. A plain value is
/// dropped, so an `invoke` answered that way stays pending.
pub enum Handled {
    Returned(Value),
    Deferred(LocalBoxFuture<'static, Result<Value, RemoteError>>),
}

impl Handled {
    pub fn defer<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, RemoteError>> + 'static,
    {
        Self::Deferred(Box::pin(future))
    }

    pub fn resolve(value: Value) -> Self {
        Self::defer(async move { Ok(value) })
    }

    pub fn reject(err: RemoteError) -> Self {
        Self::defer(async move { Err(err) })
    }
}

impl fmt::Debug for Handled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned(value) => f.debug_tuple("Returned").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

fn post_outcome(sender: &SenderRef, request_id: u64, result: Result<Value, RemoteError>) {
    let channel = reply_channel(INVOKE_REPLY_PREFIX, request_id);
    let sent = InvokeOutcome::from_result(result)
        .to_value()
        .and_then(|payload| sender.send(&channel, vec![payload]));
    if let Err(e) = sent {
        warn!(
            request_id,
            sender_id = sender.id(),
            error = %e,
            "Invoke reply could not be delivered"
        );
    }
}

/// Deferred `invoke` replies, polled by whoever drives the main inbox.
#[derive(Clone, Default)]
struct PendingReplies(Rc<RefCell<FuturesUnordered<LocalBoxFuture<'static, ()>>>>);

impl PendingReplies {
    fn push(&self, reply: LocalBoxFuture<'static, ()>) {
        self.0.borrow_mut().push(reply);
    }

    fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Poll every queued reply once and return how many finished. The set is
    /// moved out while polling, so a reply may queue further replies.
    fn poll(&self, cx: &mut Context<'_>) -> usize {
        let mut finished = 0;
        loop {
            let mut active = std::mem::take(&mut *self.0.borrow_mut());
            while let Poll::Ready(Some(())) = active.poll_next_unpin(cx) {
                finished += 1;
            }
            let mut slot = self.0.borrow_mut();
            let added = std::mem::replace(&mut *slot, active);
            if added.is_empty() {
                break;
            }
            for reply in added {
                slot.push(reply);
            }
        }
        finished
    }
}

/// Adapt a `handle` callback into a registry listener. Deferred results are
/// queued and forwarded to the caller once they complete.
fn wrap_handler<F>(
    handler: F,
    pending: PendingReplies,
) -> impl Fn(&IpcInvokeEvent) -> anyhow::Result<()> + 'static
where
    F: Fn(&IpcInvokeEvent) -> Handled + 'static,
{
    move |event| {
        match handler(event) {
            Handled::Deferred(future) => {
                let sender = event.sender.clone();
                let request_id = event.request_id;
                pending.push(Box::pin(async move {
                    let result = future.await;
                    post_outcome(&sender, request_id, result);
                }));
            }
            Handled::Returned(_) => {
                warn!(
                    channel = %event.channel,
                    request_id = event.request_id,
                    "Invoke handler returned a plain value; no reply is sent"
                );
            }
        }
        Ok(())
    }
}

// ============================================================================
// IpcMain
// ============================================================================

/// Main-process bridge.
pub struct IpcMain {
    events: ChannelRegistry<IpcMainEvent>,
    handlers: ChannelRegistry<IpcInvokeEvent>,
    inbox: MainInbox,
    renderers: RefCell<BTreeMap<u32, Attached>>,
    pending: PendingReplies,
    capabilities: IpcCapabilities,
    context: Rc<ProcessContext>,
}

impl IpcMain {
    pub fn new(context: Rc<ProcessContext>) -> Self {
        Self::with_capabilities(context, IpcCapabilities::default())
    }

    pub fn with_capabilities(context: Rc<ProcessContext>, capabilities: IpcCapabilities) -> Self {
        Self {
            events: ChannelRegistry::new(),
            handlers: ChannelRegistry::new(),
            inbox: MainInbox::new(),
            renderers: RefCell::new(BTreeMap::new()),
            pending: PendingReplies::default(),
            capabilities,
            context,
        }
    }

    pub fn context(&self) -> &Rc<ProcessContext> {
        &self.context
    }

    pub fn capabilities(&self) -> &IpcCapabilities {
        &self.capabilities
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn on<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&IpcMainEvent) -> anyhow::Result<()> + 'static,
    {
        self.events.on(channel, listener)
    }

    pub fn once<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&IpcMainEvent) -> anyhow::Result<()> + 'static,
    {
        self.events.once(channel, listener)
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.events.remove_listener(channel, id)
    }

    pub fn remove_all_listeners(&self, channel: Option<&str>) {
        self.events.remove_all_listeners(channel)
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.events.listener_count(channel)
    }

    pub fn set_max_listeners(&self, max: usize) {
        self.events.set_max_listeners(max);
        self.handlers.set_max_listeners(max);
    }

    /// Emit straight into the main-process registry, bypassing the transport.
    pub fn emit(&self, channel: &str, event: &IpcMainEvent) -> anyhow::Result<bool> {
        self.events.emit(channel, event)
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Answer `invoke` calls on `channel`. Several handlers may share a
    /// channel; each one fires and each deferred result is forwarded.
    pub fn handle<F>(&self, channel: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&IpcInvokeEvent) -> Handled + 'static,
    {
        self.handlers.on(channel, wrap_handler(handler, self.pending.clone()))
    }

    pub fn handle_once<F>(&self, channel: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&IpcInvokeEvent) -> Handled + 'static,
    {
        self.handlers.once(channel, wrap_handler(handler, self.pending.clone()))
    }

    pub fn remove_handler(&self, channel: &str) {
        self.handlers.remove_all_listeners(Some(channel));
    }

    // ------------------------------------------------------------------
    // Renderers
    // ------------------------------------------------------------------

    /// Connect a new renderer and return the port it will own.
    pub fn attach_renderer(&self, renderer_id: u32) -> Result<RendererPort, IpcError> {
        self.attach_renderer_with_channels(renderer_id, None)
    }

    /// Connect a renderer whose channel allowlist replaces the process-wide
    /// one for everything it sends and receives.
    pub fn attach_renderer_with_channels(
        &self,
        renderer_id: u32,
        channels: Option<Vec<String>>,
    ) -> Result<RendererPort, IpcError> {
        let (link, port) = self.inbox.connect(renderer_id)?;
        let attached = Attached {
            link,
            channels: channels.map(Rc::from),
        };
        let restricted = attached.channels.is_some();
        if self
            .renderers
            .borrow_mut()
            .insert(renderer_id, attached)
            .is_some()
        {
            warn!(renderer_id, "Renderer re-attached; previous link replaced");
        }
        info!(renderer_id, restricted, "Renderer attached");
        Ok(port)
    }

    pub fn detach_renderer(&self, renderer_id: u32) -> bool {
        let removed = self.renderers.borrow_mut().remove(&renderer_id).is_some();
        if removed {
            info!(renderer_id, "Renderer detached");
        }
        removed
    }

    pub fn renderer_ids(&self) -> Vec<u32> {
        self.renderers.borrow().keys().copied().collect()
    }

    pub fn sender(&self, renderer_id: u32) -> Result<SenderRef, IpcError> {
        let Attached { link, channels } = self
            .renderers
            .borrow()
            .get(&renderer_id)
            .cloned()
            .ok_or_else(|| IpcError::renderer_not_found(renderer_id))?;
        Ok(SenderRef {
            link,
            channels,
            capabilities: self.capabilities.clone(),
        })
    }

    /// Refuse further renderers so the inbox can end once every port is gone.
    pub fn seal(&self) {
        self.inbox.seal();
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    pub fn send_to(&self, renderer_id: u32, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        validate_channel(channel)?;
        let sender = self.sender(renderer_id)?;
        debug!(renderer_id, channel = %channel, "send_to");
        sender.send(channel, args)
    }

    /// Broadcast to every live renderer. Renderers whose port is gone are
    /// pruned; renderers whose allowlist excludes the channel are skipped.
    /// Returns the number of renderers reached, or the permission error when
    /// every live renderer refused the channel.
    pub fn send_to_all(&self, channel: &str, args: Vec<Value>) -> Result<usize, IpcError> {
        validate_channel(channel)?;

        let mut delivered = 0;
        let mut denied = None;
        self.renderers.borrow_mut().retain(|renderer_id, attached| {
            let link = &attached.link;
            if link.is_closed() {
                info!(renderer_id = *renderer_id, "Pruning closed renderer");
                return false;
            }
            if let Err(e) = self
                .capabilities
                .check_user_channel_for(channel, attached.channels.as_deref())
            {
                debug!(renderer_id = *renderer_id, channel = %channel, "Broadcast skipped renderer");
                denied = Some(e);
                return true;
            }
            match link.post(channel, args.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    warn!(renderer_id = *renderer_id, error = %e, "Broadcast failed, pruning renderer");
                    false
                }
            }
        });
        debug!(channel = %channel, delivered, "send_to_all");
        match denied {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(delivered),
        }
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    pub fn try_recv(&self) -> Option<Envelope> {
        self.inbox.try_recv()
    }

    /// Wait for the next envelope, polling deferred replies meanwhile.
    pub async fn recv(&self) -> Option<Envelope> {
        std::future::poll_fn(|cx| {
            self.pending.poll(cx);
            self.inbox.poll_recv(cx)
        })
        .await
    }

    /// Poll deferred `invoke` replies once without waiting. Returns how many
    /// were sent.
    pub fn drive_replies(&self) -> usize {
        let mut cx = Context::from_waker(noop_waker_ref());
        self.pending.poll(&mut cx)
    }

    /// Deferred `invoke` replies that have not completed yet.
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    fn drop_pending_replies(&self) {
        let left = self.pending.len();
        if left > 0 {
            warn!(pending = left, "Main inbox closed with unfinished invoke replies");
            self.pending.0.borrow_mut().clear();
        }
    }

    /// Turn a raw envelope into an event. Messages from unknown renderers or
    /// on blocked channels are dropped with a warning.
    pub fn accept(&self, envelope: Envelope) -> Option<IpcMainEvent> {
        let Envelope {
            sender_id,
            channel,
            args,
            delivery,
        } = envelope;

        let sender = match self.sender(sender_id) {
            Ok(sender) => sender,
            Err(_) => {
                warn!(sender_id, channel = %channel, "Message from unknown renderer dropped");
                return None;
            }
        };

        let effective = if channel == INVOKE_DISPATCH_CHANNEL {
            args.get(1).and_then(Value::as_str).unwrap_or_default()
        } else {
            channel.as_str()
        };
        if let Err(e) = self
            .capabilities
            .check_user_channel_for(effective, sender.channels())
        {
            warn!(sender_id, channel = %effective, error = %e, "Blocked incoming message");
            return None;
        }

        let sync = match delivery {
            Delivery::Async => None,
            Delivery::Sync(reply) => Some(Rc::new(SyncSlot {
                value: RefCell::new(None),
                reply,
                finished: Cell::new(false),
            })),
        };

        Some(IpcMainEvent {
            sender,
            channel,
            args,
            sync,
        })
    }

    /// Deliver an accepted event to main-process listeners.
    ///
    /// Messages on the invoke dispatch channel are routed to handlers. A
    /// synchronous message releases its sender once every listener has run,
    /// even when a listener fails.
    pub fn dispatch_event(&self, event: &IpcMainEvent) -> anyhow::Result<()> {
        if event.channel == INVOKE_DISPATCH_CHANNEL {
            return self.dispatch_invoke(event);
        }

        debug!(sender_id = event.sender.id(), channel = %event.channel, sync = event.is_sync(), "dispatch");
        let result = self.events.emit(&event.channel, event);
        event.finish_sync();
        result.map(|_| ())
    }

    fn dispatch_invoke(&self, event: &IpcMainEvent) -> anyhow::Result<()> {
        let request_id = event
            .args
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| IpcError::invalid_argument("invoke without a request id"))?;
        let channel = event
            .args
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| IpcError::invalid_argument("invoke without a channel"))?
            .to_string();

        let invoke = IpcInvokeEvent {
            request_id,
            sender: event.sender.clone(),
            args: event.args.iter().skip(2).cloned().collect(),
            channel,
        };
        debug!(request_id, channel = %invoke.channel, "invoke");

        if !self.handlers.emit(&invoke.channel, &invoke)? {
            warn!(request_id, channel = %invoke.channel, "No handler registered");
            post_outcome(
                &invoke.sender,
                request_id,
                Err(RemoteError::new(
                    RemoteErrorKind::Error,
                    format!("No handler registered for '{}'", invoke.channel),
                )),
            );
        }
        Ok(())
    }

    /// Accept and dispatch one envelope.
    pub fn process(&self, envelope: Envelope) -> anyhow::Result<()> {
        match self.accept(envelope) {
            Some(event) => self.dispatch_event(&event),
            None => Ok(()),
        }
    }

    /// Process every envelope already queued, then poll deferred replies.
    /// Returns how many envelopes were taken.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        while let Some(envelope) = self.try_recv() {
            count += 1;
            if let Err(e) = self.process(envelope) {
                error!(error = %e, "Listener failed while processing message");
            }
        }
        self.drive_replies();
        count
    }

    /// Process messages until the inbox is sealed and every renderer is gone.
    pub async fn run(&self) {
        while let Some(envelope) = self.recv().await {
            if let Err(e) = self.process(envelope) {
                error!(error = %e, "Listener failed while processing message");
            }
        }
        self.drop_pending_replies();
        info!("Main inbox closed");
    }

    /// Blocking loop for a main process hosted on a plain thread. Deferred
    /// replies are polled after every message; one that waits on something
    /// other than the inbox only completes when a later message arrives.
    pub fn serve_blocking(&self) {
        while let Some(envelope) = self.inbox.recv_blocking() {
            if let Err(e) = self.process(envelope) {
                error!(error = %e, "Listener failed while processing message");
            }
            self.drive_replies();
        }
        self.drop_pending_replies();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;
    use std::thread;
    use tokio::task::LocalSet;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn main_with_renderer(id: u32) -> (IpcMain, RendererPort) {
        let ipc = IpcMain::new(Rc::new(ProcessContext::new()));
        let port = ipc.attach_renderer(id).unwrap();
        (ipc, port)
    }

    struct OnlyPublic;

    impl crate::IpcCapabilityChecker for OnlyPublic {
        fn check_channel(&self, channel: &str, _: Option<&[String]>) -> Result<(), String> {
            if channel.starts_with("public:") {
                Ok(())
            } else {
                Err(format!("channel '{channel}' not allowed"))
            }
        }
    }

    #[test]
    fn test_listener_sees_sender_and_can_reply() {
        let (ipc, port) = main_with_renderer(3);
        ipc.on("ping", |event| {
            assert_eq!(event.sender.id(), 3);
            event.reply("pong", event.args.clone())?;
            Ok(())
        });

        port.main().post("ping", vec![json!("hi")]).unwrap();
        assert_eq!(ipc.pump(), 1);

        let env = port.try_recv().unwrap();
        assert_eq!(env.channel, "pong");
        assert_eq!(env.args, vec![json!("hi")]);
    }

    #[test]
    fn test_send_rejects_empty_channel() {
        let (ipc, port) = main_with_renderer(1);
        assert!(matches!(
            ipc.send_to(1, "", vec![]),
            Err(IpcError::InvalidArgument { .. })
        ));
        assert!(matches!(
            ipc.send_to_all("", vec![]),
            Err(IpcError::InvalidArgument { .. })
        ));
        assert!(port.try_recv().is_none());
    }

    #[test]
    fn test_send_to_unknown_renderer() {
        let (ipc, _port) = main_with_renderer(1);
        assert!(matches!(
            ipc.send_to(9, "x", vec![]),
            Err(IpcError::RendererNotFound { renderer_id: 9, .. })
        ));
    }

    #[test]
    fn test_send_to_all_prunes_dead_renderers() {
        let ipc = IpcMain::new(Rc::new(ProcessContext::new()));
        let alive = ipc.attach_renderer(1).unwrap();
        let dead = ipc.attach_renderer(2).unwrap();
        drop(dead);

        assert_eq!(ipc.send_to_all("news", vec![json!(1)]).unwrap(), 1);
        assert_eq!(ipc.renderer_ids(), vec![1]);
        assert_eq!(alive.try_recv().unwrap().channel, "news");
    }

    #[test]
    fn test_return_value_only_for_sync_messages() {
        let (ipc, port) = main_with_renderer(1);
        let seen = Rc::new(Cell::new(false));
        let seen_in = seen.clone();
        ipc.on("async", move |event| {
            assert!(event.set_return_value(json!(1)).is_err());
            seen_in.set(true);
            Ok(())
        });
        port.main().post("async", vec![]).unwrap();
        ipc.pump();
        assert!(seen.get());
    }

    #[test]
    fn test_sync_message_round_trip_on_main_thread() {
        let (port_tx, port_rx) = std_mpsc::channel();
        let main = thread::spawn(move || {
            let ipc = IpcMain::new(Rc::new(ProcessContext::new()));
            ipc.on("sum", |event| {
                let total: i64 = event.args.iter().filter_map(Value::as_i64).sum();
                event.set_return_value(json!({ "total": total }))?;
                Ok(())
            });
            ipc.on("silent", |_| Ok(()));
            port_tx.send(ipc.attach_renderer(1).unwrap()).unwrap();
            ipc.seal();
            ipc.serve_blocking();
        });

        let port = port_rx.recv().unwrap();
        let reply = port
            .main()
            .post_sync("sum", vec![json!(1), json!(2), json!(3)])
            .unwrap();
        assert_eq!(reply, json!({"total": 6}));

        let reply = port.main().post_sync("silent", vec![]).unwrap();
        assert_eq!(reply, Value::Null);

        drop(port);
        main.join().unwrap();
    }

    #[test]
    fn test_sync_message_released_when_listener_fails() {
        let (port_tx, port_rx) = std_mpsc::channel();
        let main = thread::spawn(move || {
            let ipc = IpcMain::new(Rc::new(ProcessContext::new()));
            ipc.on("fail", |event| {
                event.set_return_value(json!("partial"))?;
                anyhow::bail!("listener exploded")
            });
            port_tx.send(ipc.attach_renderer(1).unwrap()).unwrap();
            ipc.seal();
            ipc.serve_blocking();
        });

        let port = port_rx.recv().unwrap();
        let reply = port.main().post_sync("fail", vec![]).unwrap();
        assert_eq!(reply, json!("partial"));
        drop(port);
        main.join().unwrap();
    }

    #[tokio::test]
    async fn test_deferred_handler_replies_on_request_channel() {
        LocalSet::new()
            .run_until(async {
                let (ipc, port) = main_with_renderer(1);
                ipc.handle("add", |event| {
                    let sum: i64 = event.args.iter().filter_map(Value::as_i64).sum();
                    Handled::resolve(json!(sum))
                });

                port.main()
                    .post(INVOKE_DISPATCH_CHANNEL, vec![json!(7), json!("add"), json!(2), json!(3)])
                    .unwrap();
                ipc.pump();
                settle().await;

                let env = port.try_recv().unwrap();
                assert_eq!(env.channel, "CONDUIT_IPC_INVOKE_REPLY-7");
                assert_eq!(env.args, vec![json!({"result": 5})]);
            })
            .await;
    }

    #[test]
    fn test_pump_drives_replies_without_a_runtime() {
        let (ipc, port) = main_with_renderer(1);
        ipc.handle("add", |event| {
            let sum: i64 = event.args.iter().filter_map(Value::as_i64).sum();
            Handled::resolve(json!(sum))
        });
        ipc.handle("strict", |_| {
            Handled::reject(RemoteError::new(RemoteErrorKind::RangeError, "too big"))
        });

        port.main()
            .post(INVOKE_DISPATCH_CHANNEL, vec![json!(1), json!("add"), json!(1), json!(2)])
            .unwrap();
        port.main()
            .post(INVOKE_DISPATCH_CHANNEL, vec![json!(2), json!("strict")])
            .unwrap();
        assert_eq!(ipc.pump(), 2);
        assert_eq!(ipc.pending_replies(), 0);

        let mut replies = BTreeMap::new();
        while let Some(env) = port.try_recv() {
            replies.insert(env.channel, InvokeOutcome::from_args(&env.args).unwrap());
        }
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies["CONDUIT_IPC_INVOKE_REPLY-1"],
            InvokeOutcome::Result(json!(3))
        );
        assert!(matches!(
            replies["CONDUIT_IPC_INVOKE_REPLY-2"],
            InvokeOutcome::Error(_)
        ));
    }

    #[test]
    fn test_unfinished_reply_waits_for_later_pump() {
        let (ipc, port) = main_with_renderer(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<Value>();
        let rx = RefCell::new(Some(rx));
        ipc.handle_once("later", move |_| match rx.borrow_mut().take() {
            Some(rx) => Handled::defer(async move {
                rx.await.map_err(|_| RemoteError::Disconnected)
            }),
            None => Handled::reject(RemoteError::Disconnected),
        });

        port.main()
            .post(INVOKE_DISPATCH_CHANNEL, vec![json!(9), json!("later")])
            .unwrap();
        ipc.pump();
        assert_eq!(ipc.pending_replies(), 1);
        assert!(port.try_recv().is_none());

        tx.send(json!("done")).unwrap();
        assert_eq!(ipc.drive_replies(), 1);
        let env = port.try_recv().unwrap();
        assert_eq!(env.args, vec![json!({"result": "done"})]);
    }

    #[tokio::test]
    async fn test_plain_return_is_not_replied() {
        LocalSet::new()
            .run_until(async {
                let (ipc, port) = main_with_renderer(1);
                ipc.handle("plain", |_| Handled::Returned(json!("ignored")));

                port.main()
                    .post(INVOKE_DISPATCH_CHANNEL, vec![json!(1), json!("plain")])
                    .unwrap();
                ipc.pump();
                settle().await;
                assert!(port.try_recv().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_rejected_handler_sends_tagged_error() {
        LocalSet::new()
            .run_until(async {
                let (ipc, port) = main_with_renderer(1);
                ipc.handle("strict", |_| {
                    Handled::reject(RemoteError::new(RemoteErrorKind::TypeError, "bad arg"))
                });

                port.main()
                    .post(INVOKE_DISPATCH_CHANNEL, vec![json!(2), json!("strict")])
                    .unwrap();
                ipc.pump();
                settle().await;

                let env = port.try_recv().unwrap();
                let outcome = InvokeOutcome::from_args(&env.args).unwrap();
                let err = outcome.into_result().unwrap_err();
                assert_eq!(err.kind(), Some(RemoteErrorKind::TypeError));
                assert_eq!(err.to_string(), "TypeError: bad arg");
            })
            .await;
    }

    #[tokio::test]
    async fn test_handle_once_then_missing_handler() {
        LocalSet::new()
            .run_until(async {
                let (ipc, port) = main_with_renderer(1);
                ipc.handle_once("one", |_| Handled::resolve(json!("first")));

                for id in [1, 2] {
                    port.main()
                        .post(INVOKE_DISPATCH_CHANNEL, vec![json!(id), json!("one")])
                        .unwrap();
                }
                ipc.pump();
                settle().await;

                let mut replies = BTreeMap::new();
                while let Some(env) = port.try_recv() {
                    replies.insert(env.channel, InvokeOutcome::from_args(&env.args).unwrap());
                }
                assert_eq!(
                    replies["CONDUIT_IPC_INVOKE_REPLY-1"],
                    InvokeOutcome::Result(json!("first"))
                );
                assert!(matches!(
                    replies["CONDUIT_IPC_INVOKE_REPLY-2"],
                    InvokeOutcome::Error(_)
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn test_every_handler_on_a_channel_fires() {
        LocalSet::new()
            .run_until(async {
                let (ipc, port) = main_with_renderer(1);
                ipc.handle("multi", |_| Handled::resolve(json!("a")));
                ipc.handle("multi", |_| Handled::resolve(json!("b")));

                port.main()
                    .post(INVOKE_DISPATCH_CHANNEL, vec![json!(4), json!("multi")])
                    .unwrap();
                ipc.pump();
                settle().await;

                let mut count = 0;
                while port.try_recv().is_some() {
                    count += 1;
                }
                assert_eq!(count, 2);

                ipc.remove_handler("multi");
                port.main()
                    .post(INVOKE_DISPATCH_CHANNEL, vec![json!(5), json!("multi")])
                    .unwrap();
                ipc.pump();
                let env = port.try_recv().unwrap();
                assert!(matches!(
                    InvokeOutcome::from_args(&env.args).unwrap(),
                    InvokeOutcome::Error(_)
                ));
            })
            .await;
    }

    #[test]
    fn test_capabilities_filter_both_directions() {
        let ipc = IpcMain::with_capabilities(
            Rc::new(ProcessContext::new()),
            IpcCapabilities::new(std::sync::Arc::new(OnlyPublic)),
        );
        let port = ipc.attach_renderer(1).unwrap();
        let hits = Rc::new(Cell::new(0));
        for channel in ["public:a", "private:b"] {
            let hits = hits.clone();
            ipc.on(channel, move |_| {
                hits.set(hits.get() + 1);
                Ok(())
            });
        }

        port.main().post("public:a", vec![]).unwrap();
        port.main().post("private:b", vec![]).unwrap();
        ipc.pump();
        assert_eq!(hits.get(), 1);

        assert!(matches!(
            ipc.send_to(1, "private:b", vec![]),
            Err(IpcError::PermissionDenied { .. })
        ));
        assert!(ipc.send_to(1, "public:a", vec![]).is_ok());
    }

    struct ListOrPublic;

    impl crate::IpcCapabilityChecker for ListOrPublic {
        fn check_channel(&self, channel: &str, renderer: Option<&[String]>) -> Result<(), String> {
            let allowed = match renderer {
                Some(list) => list.iter().any(|c| c == channel),
                None => channel.starts_with("public:"),
            };
            if allowed {
                Ok(())
            } else {
                Err(format!("channel '{channel}' not allowed"))
            }
        }
    }

    #[test]
    fn test_renderer_allowlist_replaces_process_list() {
        let ipc = IpcMain::with_capabilities(
            Rc::new(ProcessContext::new()),
            IpcCapabilities::new(std::sync::Arc::new(ListOrPublic)),
        );
        let open = ipc.attach_renderer(1).unwrap();
        let narrow = ipc
            .attach_renderer_with_channels(2, Some(vec!["private:b".to_string()]))
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for channel in ["public:a", "private:b"] {
            let seen = seen.clone();
            ipc.on(channel, move |event| {
                seen.borrow_mut().push((event.sender.id(), event.channel.clone()));
                Ok(())
            });
        }

        for port in [&open, &narrow] {
            port.main().post("public:a", vec![]).unwrap();
            port.main().post("private:b", vec![]).unwrap();
        }
        ipc.pump();
        assert_eq!(
            *seen.borrow(),
            vec![(1, "public:a".to_string()), (2, "private:b".to_string())]
        );

        assert_eq!(ipc.sender(2).unwrap().channels(), Some(&["private:b".to_string()][..]));
        assert!(ipc.send_to(2, "private:b", vec![]).is_ok());
        assert!(matches!(
            ipc.send_to(2, "public:a", vec![]),
            Err(IpcError::PermissionDenied { .. })
        ));

        assert_eq!(ipc.send_to_all("public:a", vec![]).unwrap(), 1);
        assert!(open.try_recv().is_some());
        assert!(matches!(
            ipc.send_to_all("secret:c", vec![]),
            Err(IpcError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_messages_after_detach_are_dropped() {
        let (ipc, port) = main_with_renderer(1);
        let hits = Rc::new(Cell::new(0));
        let hits_in = hits.clone();
        ipc.on("late", move |_| {
            hits_in.set(hits_in.get() + 1);
            Ok(())
        });

        assert!(ipc.detach_renderer(1));
        port.main().post("late", vec![]).unwrap();
        ipc.pump();
        assert_eq!(hits.get(), 0);
    }
}
