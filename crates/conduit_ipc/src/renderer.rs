//! Renderer side of the bridge.

use crate::registry::{ChannelRegistry, ListenerId};
use crate::remote_error::{InvokeOutcome, RemoteError};
use crate::transport::{Envelope, MainLink, RendererPort};
use crate::{
    reply_channel, validate_channel, IpcError, ProcessContext, INVOKE_DISPATCH_CHANNEL,
    INVOKE_REPLY_PREFIX,
};
use serde_json::Value;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// A message delivered to renderer listeners.
#[derive(Debug, Clone)]
pub struct IpcRendererEvent {
    /// Id of the sending process, normally [`crate::MAIN_PROCESS_ID`].
    pub sender_id: u32,
    pub channel: String,
    pub args: Vec<Value>,
    main: MainLink,
}

impl IpcRendererEvent {
    /// Send a message to the main process.
    pub fn reply(&self, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        validate_channel(channel)?;
        self.main.post(channel, args)
    }
}

/// Pending result of [`IpcRenderer::invoke`].
///
/// Resolves with the handler's value or its rehydrated error. Nothing times
/// out; a call that is never answered stays pending.
#[derive(Debug)]
pub struct InvokeReply {
    request_id: u64,
    rx: oneshot::Receiver<Result<Value, RemoteError>>,
}

impl InvokeReply {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for InvokeReply {
    type Output = Result<Value, RemoteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RemoteError::Disconnected)))
    }
}

/// Renderer-process bridge.
pub struct IpcRenderer {
    port: RendererPort,
    events: ChannelRegistry<IpcRendererEvent>,
    context: Rc<ProcessContext>,
}

impl IpcRenderer {
    pub fn new(port: RendererPort, context: Rc<ProcessContext>) -> Self {
        Self {
            port,
            events: ChannelRegistry::new(),
            context,
        }
    }

    pub fn id(&self) -> u32 {
        self.port.renderer_id()
    }

    pub fn context(&self) -> &Rc<ProcessContext> {
        &self.context
    }

    pub fn on<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&IpcRendererEvent) -> anyhow::Result<()> + 'static,
    {
        self.events.on(channel, listener)
    }

    pub fn once<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&IpcRendererEvent) -> anyhow::Result<()> + 'static,
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
        self.events.set_max_listeners(max)
    }

    /// Fire-and-forget message to the main process.
    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        validate_channel(channel)?;
        debug!(renderer_id = self.id(), channel = %channel, "send");
        self.port.main().post(channel, args)
    }

    /// Send and block this thread until the main process answers. The
    /// returned value is a fresh copy parsed from the serialized reply.
    pub fn send_sync(&self, channel: &str, args: Vec<Value>) -> Result<Value, IpcError> {
        validate_channel(channel)?;
        debug!(renderer_id = self.id(), channel = %channel, "send_sync");
        self.port.main().post_sync(channel, args)
    }

    /// Correlated request to a `handle` listener in the main process.
    pub fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<InvokeReply, IpcError> {
        validate_channel(channel)?;
        let request_id = self.context.next_request_id();
        let reply = reply_channel(INVOKE_REPLY_PREFIX, request_id);

        let (tx, rx) = oneshot::channel();
        let slot = RefCell::new(Some(tx));
        let listener = self.events.once(reply.clone(), move |event| {
            let result = match InvokeOutcome::from_args(&event.args) {
                Ok(outcome) => outcome.into_result(),
                Err(_) => Err(RemoteError::Raw(Value::Array(event.args.clone()))),
            };
            if let Some(tx) = slot.borrow_mut().take() {
                let _ = tx.send(result);
            }
            Ok(())
        });

        let mut payload = Vec::with_capacity(args.len() + 2);
        payload.push(Value::from(request_id));
        payload.push(Value::from(channel));
        payload.extend(args);

        if let Err(e) = self.port.main().post(INVOKE_DISPATCH_CHANNEL, payload) {
            self.events.remove_listener(&reply, listener);
            return Err(e);
        }
        debug!(request_id, channel = %channel, "invoke");
        Ok(InvokeReply { request_id, rx })
    }

    /// Deliver one envelope from the main process to local listeners.
    pub fn dispatch(&self, envelope: Envelope) -> anyhow::Result<()> {
        let event = IpcRendererEvent {
            sender_id: envelope.sender_id,
            channel: envelope.channel,
            args: envelope.args,
            main: self.port.main().clone(),
        };
        self.events.emit(&event.channel, &event)?;
        Ok(())
    }

    /// Dispatch everything already queued. Returns how many were taken.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        while let Some(envelope) = self.port.try_recv() {
            count += 1;
            if let Err(e) = self.dispatch(envelope) {
                error!(renderer_id = self.id(), error = %e, "Renderer listener failed");
            }
        }
        count
    }

    /// Dispatch messages until the main process drops this renderer.
    pub async fn run(&self) {
        while let Some(envelope) = self.port.recv().await {
            if let Err(e) = self.dispatch(envelope) {
                error!(renderer_id = self.id(), error = %e, "Renderer listener failed");
            }
        }
        debug!(renderer_id = self.id(), "Renderer inbox closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_error::RemoteErrorKind;
    use crate::{Handled, IpcMain, MAIN_PROCESS_ID};
    use serde_json::json;
    use std::cell::Cell;
    use std::sync::mpsc as std_mpsc;
    use std::thread;
    use tokio::task::LocalSet;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn pair() -> (IpcMain, IpcRenderer) {
        let main = IpcMain::new(Rc::new(ProcessContext::new()));
        let port = main.attach_renderer(1).unwrap();
        let renderer = IpcRenderer::new(port, Rc::new(ProcessContext::new()));
        (main, renderer)
    }

    #[test]
    fn test_send_reaches_main_in_order() {
        let (main, renderer) = pair();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        main.on("log", move |event| {
            seen_in.borrow_mut().push(event.args[0].clone());
            Ok(())
        });

        for i in 0..4 {
            renderer.send("log", vec![json!(i)]).unwrap();
        }
        main.pump();
        assert_eq!(*seen.borrow(), vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_empty_channel_rejected_before_sending() {
        let (main, renderer) = pair();
        assert!(matches!(
            renderer.send("", vec![]),
            Err(IpcError::InvalidArgument { .. })
        ));
        assert!(matches!(
            renderer.invoke("", vec![]),
            Err(IpcError::InvalidArgument { .. })
        ));
        assert_eq!(main.pump(), 0);
    }

    #[test]
    fn test_main_messages_carry_main_sender() {
        let (main, renderer) = pair();
        let hits = Rc::new(Cell::new(0));
        let hits_in = hits.clone();
        renderer.on("notice", move |event| {
            assert_eq!(event.sender_id, MAIN_PROCESS_ID);
            hits_in.set(hits_in.get() + 1);
            Ok(())
        });

        main.send_to(1, "notice", vec![]).unwrap();
        main.send_to_all("notice", vec![]).unwrap();
        assert_eq!(renderer.pump(), 2);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_send_sync_returns_deep_copy() {
        let (port_tx, port_rx) = std_mpsc::channel();
        let host = thread::spawn(move || {
            let main = IpcMain::new(Rc::new(ProcessContext::new()));
            main.on("echo", |event| {
                event.set_return_value(Value::Array(event.args.clone()))?;
                Ok(())
            });
            port_tx.send(main.attach_renderer(5).unwrap()).unwrap();
            main.seal();
            main.serve_blocking();
        });

        let renderer = IpcRenderer::new(port_rx.recv().unwrap(), Rc::new(ProcessContext::new()));
        let payload = json!({"nested": {"list": [1, "two", null]}});
        let reply = renderer.send_sync("echo", vec![payload.clone()]).unwrap();
        assert_eq!(reply, json!([payload]));

        drop(renderer);
        host.join().unwrap();
    }

    #[tokio::test]
    async fn test_invoke_resolves_with_handler_value() {
        LocalSet::new()
            .run_until(async {
                let (main, renderer) = pair();
                main.handle("double", |event| {
                    let n = event.args[0].as_i64().unwrap_or_default();
                    Handled::defer(async move { Ok(json!(n * 2)) })
                });

                let reply = renderer.invoke("double", vec![json!(21)]).unwrap();
                assert_eq!(reply.request_id(), 1);
                main.pump();
                settle().await;
                renderer.pump();

                assert_eq!(reply.await.unwrap(), json!(42));
                assert_eq!(renderer.listener_count("CONDUIT_IPC_INVOKE_REPLY-1"), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_invokes_resolve_to_their_own_replies() {
        LocalSet::new()
            .run_until(async {
                let (main, renderer) = pair();
                let gates: Rc<RefCell<Vec<oneshot::Sender<Value>>>> = Rc::default();
                let gates_in = gates.clone();
                main.handle("slow", move |event| {
                    let (tx, rx) = oneshot::channel();
                    gates_in.borrow_mut().push(tx);
                    let tag = event.args[0].clone();
                    Handled::defer(async move {
                        let value = rx.await.map_err(|_| RemoteError::Disconnected)?;
                        Ok(json!([tag, value]))
                    })
                });

                let first = renderer.invoke("slow", vec![json!("a")]).unwrap();
                let second = renderer.invoke("slow", vec![json!("b")]).unwrap();
                main.pump();
                settle().await;
                assert_eq!(gates.borrow().len(), 2);

                // Answer the second call first
                let second_gate = gates.borrow_mut().pop().unwrap();
                second_gate.send(json!(2)).unwrap();
                settle().await;
                renderer.pump();

                let first_gate = gates.borrow_mut().pop().unwrap();
                first_gate.send(json!(1)).unwrap();
                settle().await;
                renderer.pump();

                assert_eq!(first.await.unwrap(), json!(["a", 1]));
                assert_eq!(second.await.unwrap(), json!(["b", 2]));
            })
            .await;
    }

    #[tokio::test]
    async fn test_remote_type_error_is_rehydrated() {
        LocalSet::new()
            .run_until(async {
                let (main, renderer) = pair();
                main.handle("validate", |_| {
                    Handled::reject(RemoteError::new(RemoteErrorKind::TypeError, "bad arg"))
                });

                let reply = renderer.invoke("validate", vec![]).unwrap();
                main.pump();
                settle().await;
                renderer.pump();

                match reply.await.unwrap_err() {
                    RemoteError::Known { kind, message, .. } => {
                        assert_eq!(kind, RemoteErrorKind::TypeError);
                        assert_eq!(message, "bad arg");
                    }
                    other => panic!("unexpected {other:?}"),
                }
            })
            .await;
    }

    #[tokio::test]
    async fn test_dropped_renderer_abandons_pending_invoke() {
        let (main, renderer) = pair();
        let reply = renderer.invoke("nobody-answers", vec![]).unwrap();
        drop(renderer);
        drop(main);
        assert_eq!(reply.await, Err(RemoteError::Disconnected));
    }
}
