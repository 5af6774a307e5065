//! Headless self-check session.
//!
//! The main process runs on the calling thread inside a `LocalSet`; each
//! renderer gets its own thread and current-thread runtime, so `send_sync`
//! really blocks a different thread than the one answering it.

use crate::capabilities::CapabilityAdapters;
use anyhow::{Context, Result};
use conduit_ipc::{
    Handled, IpcMain, IpcRenderer, ProcessContext, RemoteError, RemoteErrorKind, RendererPort,
};
use conduit_window::headless::{HeadlessDialogs, HeadlessMenuFactory, HeadlessView};
use conduit_window::{
    ContentEvent, ContentHost, Dialog, DialogArg, MenuBuilder, ScriptArg, ScriptEvaluator,
    WebContents, WebFrame,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub renderers: usize,
    pub max_listeners: usize,
    /// Allowlist given to every renderer in place of the manifest's.
    pub renderer_channels: Option<Vec<String>>,
}

/// Counters collected by the main process during a session.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub renderers: usize,
    pub messages: usize,
    pub invokes: usize,
    pub sync_replies: usize,
    pub scripts: usize,
    pub titles: usize,
    pub menu_clicks: usize,
    pub dialogs: usize,
    pub telemetry: usize,
}

#[derive(Default)]
struct Counters {
    messages: Cell<usize>,
    invokes: Cell<usize>,
    sync_replies: Cell<usize>,
    finished: Cell<usize>,
    titles: Cell<usize>,
    menu_clicks: Cell<usize>,
    telemetry: Cell<usize>,
}

fn bump(cell: &Cell<usize>) {
    cell.set(cell.get() + 1);
}

/// Run a full session and block until every renderer has exited.
pub fn run(config: SessionConfig, adapters: CapabilityAdapters) -> Result<SessionReport> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building main process runtime")?;

    let (report, renderers) = LocalSet::new().block_on(&rt, main_process(config, adapters))?;

    for handle in renderers {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("renderer thread panicked"))??;
    }
    Ok(report)
}

type RendererThread = thread::JoinHandle<Result<()>>;

async fn main_process(
    config: SessionConfig,
    adapters: CapabilityAdapters,
) -> Result<(SessionReport, Vec<RendererThread>)> {
    let ipc = Rc::new(IpcMain::with_capabilities(
        Rc::new(ProcessContext::new()),
        adapters.ipc.clone(),
    ));
    ipc.set_max_listeners(config.max_listeners);

    let counters = Rc::new(Counters::default());
    let all_finished = Rc::new(Notify::new());
    register_main_handlers(&ipc, &counters, &all_finished, config.renderers);

    let host = Rc::new(ContentHost::new(ipc.clone()));
    let mut contents = Vec::with_capacity(config.renderers);
    let mut views = Vec::with_capacity(config.renderers);
    let mut threads = Vec::with_capacity(config.renderers);
    for _ in 0..config.renderers {
        let view = HeadlessView::default();
        let (content, port) =
            host.create_with_channels(Box::new(view.clone()), config.renderer_channels.clone())?;
        watch_content(&content, &counters);
        content.load_url("app://index.html")?;
        threads.push(spawn_renderer(port)?);
        contents.push(content);
        views.push(view);
    }

    let router = {
        let host = host.clone();
        tokio::task::spawn_local(async move { host.run().await })
    };

    let mut report = SessionReport {
        renderers: config.renderers,
        ..Default::default()
    };

    for content in &contents {
        let agent = content
            .execute_javascript("navigator.userAgent", vec![ScriptArg::UserGesture(true)])?
            .await?;
        info!(content_id = content.id(), agent = %agent, "executeJavaScript answered");
        report.scripts += 1;
    }

    if config.renderers > 0 {
        all_finished.notified().await;
    }

    for (content, view) in contents.iter().zip(&views) {
        let title = format!("Renderer {}", content.id());
        view.set_title(&title);
        content.dispatch_native(ContentEvent::TitleUpdated {
            title,
            explicit_set: true,
        })?;
    }
    host.run_deferred();

    report.menu_clicks = exercise_menus(&adapters, &counters)?;
    report.dialogs = exercise_dialogs(&adapters).await?;

    for content in &contents {
        host.destroy(content.id())?;
    }
    ipc.seal();
    router.await.context("content router task")?;

    report.messages = counters.messages.get();
    report.invokes = counters.invokes.get();
    report.sync_replies = counters.sync_replies.get();
    report.titles = counters.titles.get();
    report.telemetry = counters.telemetry.get();
    Ok((report, threads))
}

fn register_main_handlers(
    ipc: &Rc<IpcMain>,
    counters: &Rc<Counters>,
    all_finished: &Rc<Notify>,
    expected: usize,
) {
    let c = counters.clone();
    ipc.on("app:hello", move |event| {
        bump(&c.messages);
        event.reply(
            "app:welcome",
            vec![json!(format!("hello renderer {}", event.sender.id()))],
        )?;
        Ok(())
    });

    let c = counters.clone();
    ipc.on("app:ping-sync", move |event| {
        bump(&c.sync_replies);
        event.set_return_value(json!("pong"))?;
        Ok(())
    });

    let c = counters.clone();
    ipc.on("private:telemetry", move |_| {
        bump(&c.telemetry);
        Ok(())
    });

    let c = counters.clone();
    ipc.handle("app:add", move |event| {
        bump(&c.invokes);
        let values: Option<Vec<i64>> = event.args.iter().map(Value::as_i64).collect();
        match values {
            Some(values) => Handled::resolve(json!(values.iter().sum::<i64>())),
            None => Handled::reject(RemoteError::new(
                RemoteErrorKind::TypeError,
                "app:add expects integers",
            )),
        }
    });

    let c = counters.clone();
    ipc.handle("app:echo-later", move |event| {
        bump(&c.invokes);
        let args = event.args.clone();
        Handled::defer(async move {
            tokio::task::yield_now().await;
            Ok(Value::Array(args))
        })
    });

    let c = counters.clone();
    let done = all_finished.clone();
    ipc.on("app:renderer-done", move |event| {
        bump(&c.finished);
        debug!(sender_id = event.sender.id(), "Renderer finished its script");
        if c.finished.get() == expected {
            done.notify_one();
        }
        Ok(())
    });
}

fn watch_content(content: &Rc<WebContents>, counters: &Rc<Counters>) {
    let id = content.id();
    let c = counters.clone();
    content.on("page-title-updated", move |event| {
        if let ContentEvent::TitleUpdated { title, .. } = event {
            bump(&c.titles);
            info!(content_id = id, title = %title, "Title updated");
        }
        Ok(())
    });
    content.on("destroyed", move |_| {
        info!(content_id = id, "Content destroyed");
        Ok(())
    });
}

fn exercise_menus(adapters: &CapabilityAdapters, counters: &Rc<Counters>) -> Result<usize> {
    let factory = HeadlessMenuFactory::default();
    let builder = MenuBuilder::with_capabilities(Rc::new(factory.clone()), adapters.window.clone());

    let menu = builder.build_from_value(&json!([
        {"label": "File", "submenu": [
            {"id": "open", "label": "Open", "accelerator": "CmdOrCtrl+O"},
            {"type": "separator"},
            {"label": "Quit", "role": "quit"}
        ]},
        {"label": "View", "submenu": [
            {"id": "sidebar", "label": "Show Sidebar", "type": "checkbox", "checked": true},
            {"id": "light", "label": "Light", "type": "radio", "checked": true},
            {"id": "dark", "label": "Dark", "type": "radio"},
            {"id": "reload", "label": "Reload", "position": "after=sidebar"}
        ]}
    ]))?;
    builder.set_application_menu(Some(menu.clone()))?;

    let c = counters.clone();
    menu.on("click", move |click| {
        bump(&c.menu_clicks);
        info!(
            label = %click.item.label,
            checked = click.item.checked(),
            window_id = ?click.window_id,
            "Menu click"
        );
        Ok(())
    });

    for id in ["open", "sidebar", "dark"] {
        let item = menu
            .get_menu_item_by_id(id)
            .with_context(|| format!("menu item '{id}' missing"))?;
        menu.execute_command(item.command_id, Some(1))?;
    }
    debug!(native_calls = factory.calls().len(), "Menu exercise done");
    Ok(counters.menu_clicks.get())
}

async fn exercise_dialogs(adapters: &CapabilityAdapters) -> Result<usize> {
    let native = HeadlessDialogs::default();
    native.answer_open(Some(vec!["/tmp/notes.md".into()]));
    native.answer_message(1, false);
    let dialog = Dialog::with_capabilities(Rc::new(native.clone()), adapters.window.clone());

    let mut shown = 0;
    if let Some(reply) = dialog.show_open_dialog(vec![
        DialogArg::from(json!({"id": 1})),
        DialogArg::from(json!({"title": "Open notes", "properties": ["openFile"]})),
    ])? {
        let result = reply.await?;
        info!(canceled = result.canceled, files = ?result.file_paths, "Open dialog answered");
        shown += 1;
    }
    if let Some(response) = dialog.show_message_box_sync(vec![DialogArg::from(json!({
        "message": "Discard changes?",
        "buttons": ["Keep", "Discard"]
    }))])? {
        info!(response, "Message box answered");
        shown += 1;
    }
    if dialog.show_save_dialog(Vec::new())?.is_some() {
        warn!("Save dialog without arguments should be ignored");
    }
    Ok(shown)
}

// ============================================================================
// Renderer side
// ============================================================================

struct HeadlessEvaluator {
    renderer_id: u32,
}

impl ScriptEvaluator for HeadlessEvaluator {
    fn evaluate(&self, code: &str, user_gesture: bool) -> Result<Value, RemoteError> {
        debug!(renderer_id = self.renderer_id, user_gesture, "evaluate");
        match code {
            "navigator.userAgent" => Ok(json!(format!("conduit-headless/{}", self.renderer_id))),
            _ => Err(RemoteError::new(
                RemoteErrorKind::ReferenceError,
                format!("{code} is not defined"),
            )),
        }
    }
}

fn spawn_renderer(port: RendererPort) -> Result<RendererThread> {
    let name = format!("renderer-{}", port.renderer_id());
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("building renderer runtime")?;
            LocalSet::new().block_on(&rt, renderer_process(port))
        })
        .context("spawning renderer thread")
}

async fn renderer_process(port: RendererPort) -> Result<()> {
    let id = port.renderer_id();
    let renderer = Rc::new(IpcRenderer::new(port, Rc::new(ProcessContext::new())));
    WebFrame::install(&renderer, Rc::new(HeadlessEvaluator { renderer_id: id }));
    renderer.on("app:welcome", move |event| {
        info!(renderer_id = id, greeting = ?event.args.first(), "Welcome received");
        Ok(())
    });

    let inbox = {
        let renderer = renderer.clone();
        tokio::task::spawn_local(async move { renderer.run().await })
    };

    renderer.send("app:hello", vec![json!(id)])?;

    let sum = renderer
        .invoke("app:add", vec![json!(id), json!(40)])?
        .await?;
    info!(renderer_id = id, sum = %sum, "invoke app:add");

    let echoed = renderer
        .invoke("app:echo-later", vec![json!("later")])?
        .await?;
    debug!(renderer_id = id, echoed = %echoed, "invoke app:echo-later");

    match renderer.invoke("app:missing", Vec::new())?.await {
        Err(e) => debug!(renderer_id = id, error = %e, "invoke without handler rejected"),
        Ok(value) => warn!(renderer_id = id, value = %value, "invoke without handler resolved"),
    }

    let pong = renderer.send_sync("app:ping-sync", vec![json!(id)])?;
    info!(renderer_id = id, reply = %pong, "send_sync app:ping-sync");

    // Dropped by the main process unless the channel allowlist covers it.
    renderer.send("private:telemetry", vec![json!(id)])?;

    renderer.send("app:renderer-done", vec![json!(id)])?;
    inbox.await.context("renderer inbox task")?;
    Ok(())
}
