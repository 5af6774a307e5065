//! Renderer-side responder for web frame methods sent by [`WebContents`].
//!
//! [`WebContents`]: crate::WebContents

use crate::content::{WEB_FRAME_METHOD_CHANNEL, WEB_FRAME_RESPONSE_PREFIX};
use conduit_ipc::{
    reply_channel, InvokeOutcome, IpcRenderer, ListenerId, RemoteError, RemoteErrorKind,
};
use serde_json::Value;
use std::rc::Rc;
use tracing::debug;

/// Evaluates script source inside the renderer. Script engines are external
/// to this crate.
pub trait ScriptEvaluator {
    fn evaluate(&self, code: &str, user_gesture: bool) -> Result<Value, RemoteError>;
}

pub struct WebFrame;

impl WebFrame {
    /// Answer web frame method calls arriving at `renderer`.
    pub fn install(renderer: &IpcRenderer, evaluator: Rc<dyn ScriptEvaluator>) -> ListenerId {
        renderer.on(WEB_FRAME_METHOD_CHANNEL, move |event| {
            let request_id = event
                .args
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow::anyhow!("web frame call without a request id"))?;
            let method = event.args.get(1).and_then(Value::as_str).unwrap_or_default();
            debug!(request_id, method = %method, "web frame method");

            let result = match method {
                "executeJavaScript" => {
                    let code = event.args.get(2).and_then(Value::as_str).unwrap_or_default();
                    let gesture = event.args.get(3).and_then(Value::as_bool).unwrap_or(false);
                    evaluator.evaluate(code, gesture)
                }
                other => Err(RemoteError::new(
                    RemoteErrorKind::TypeError,
                    format!("Unknown web frame method '{other}'"),
                )),
            };

            let payload = InvokeOutcome::from_result(result).to_value()?;
            event.reply(
                &reply_channel(WEB_FRAME_RESPONSE_PREFIX, request_id),
                vec![payload],
            )?;
            Ok(())
        })
    }
}
