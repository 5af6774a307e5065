//! Dialog adapter.
//!
//! Every public method accepts `(options)`, `(window_or_options, options)`
//! or `(window, options, callback)`. The arguments are normalized into a
//! [`DialogInvocation`] before any native call; unsupported arities are a
//! silent no-op that returns `None`.

use crate::{WindowCapabilities, WindowError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

// ============================================================================
// Options and Results
// ============================================================================

/// File filter for dialogs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileFilter {
    pub name: String,
    pub extensions: Vec<String>,
}

/// Options for the open dialog
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenDialogOptions {
    pub title: Option<String>,
    pub default_path: Option<String>,
    pub button_label: Option<String>,
    pub filters: Vec<FileFilter>,
    /// `openFile`, `openDirectory`, `multiSelections`, `showHiddenFiles`
    pub properties: Vec<String>,
    pub message: Option<String>,
}

impl OpenDialogOptions {
    pub fn has_property(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }

    pub fn directory(&self) -> bool {
        self.has_property("openDirectory")
    }

    pub fn multiple(&self) -> bool {
        self.has_property("multiSelections")
    }
}

/// Options for the save dialog
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveDialogOptions {
    pub title: Option<String>,
    pub default_path: Option<String>,
    pub button_label: Option<String>,
    pub filters: Vec<FileFilter>,
    pub name_field_label: Option<String>,
    pub message: Option<String>,
}

/// Options for message boxes
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBoxOptions {
    pub message: String,
    /// `none`, `info`, `error`, `question` or `warning`
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub buttons: Vec<String>,
    pub default_id: Option<usize>,
    pub cancel_id: Option<usize>,
    pub title: Option<String>,
    pub detail: Option<String>,
    pub checkbox_label: Option<String>,
    #[serde(default)]
    pub checkbox_checked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDialogReturn {
    pub canceled: bool,
    pub file_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDialogReturn {
    pub canceled: bool,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBoxReturn {
    pub response: usize,
    pub checkbox_checked: bool,
}

// ============================================================================
// Native Seam
// ============================================================================

pub type DialogCallback<T> = Box<dyn FnOnce(T)>;

/// Native dialog primitives. Callback-style methods answer on the process
/// thread; `*_sync` methods block until the user answers.
pub trait NativeDialogs {
    fn show_open_dialog(
        &self,
        owner: Option<u32>,
        options: &OpenDialogOptions,
        done: DialogCallback<Option<Vec<String>>>,
    );
    /// `done` receives the chosen files; empty when canceled.
    fn show_save_dialog(
        &self,
        owner: Option<u32>,
        options: &SaveDialogOptions,
        done: DialogCallback<Vec<String>>,
    );
    fn show_message_box(
        &self,
        owner: Option<u32>,
        options: &MessageBoxOptions,
        done: DialogCallback<(usize, bool)>,
    );
    fn show_open_dialog_sync(&self, owner: Option<u32>, options: &OpenDialogOptions) -> Option<Vec<String>>;
    fn show_save_dialog_sync(&self, owner: Option<u32>, options: &SaveDialogOptions) -> Option<String>;
    fn show_message_box_sync(&self, owner: Option<u32>, options: &MessageBoxOptions) -> usize;
    fn show_error_box(&self, title: &str, content: &str);
}

// ============================================================================
// Normalization
// ============================================================================

/// One positional argument of a dialog call.
pub enum DialogArg {
    Value(Value),
    Callback(Box<dyn FnOnce(Value)>),
}

impl fmt::Debug for DialogArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<Value> for DialogArg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl DialogArg {
    fn window_id(&self) -> Option<Option<u32>> {
        match self {
            Self::Value(Value::Object(map)) => map
                .get("id")
                .map(|id| id.as_u64().and_then(|id| u32::try_from(id).ok())),
            _ => None,
        }
    }

    fn into_options(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Callback(_) => Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogMode {
    Sync,
    Async,
}

/// A dialog call after argument normalization. Never outlives the call.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogInvocation {
    pub owner_window_id: Option<u32>,
    pub options: Value,
    pub mode: DialogMode,
}

impl DialogInvocation {
    /// Normalize a variadic argument list. Returns `None` for zero or more
    /// than three arguments.
    pub fn normalize(args: Vec<DialogArg>, mode: DialogMode) -> Option<Self> {
        let mut args = args.into_iter();
        let (owner_window_id, options) = match args.len() {
            1 => (None, args.next()?.into_options()),
            2 => {
                let first = args.next()?;
                let second = args.next()?;
                match first.window_id() {
                    Some(owner) => (owner, second.into_options()),
                    None => (None, first.into_options()),
                }
            }
            3 => {
                let first = args.next()?;
                let second = args.next()?;
                (first.window_id().flatten(), second.into_options())
            }
            _ => return None,
        };
        Some(Self {
            owner_window_id,
            options,
            mode,
        })
    }

    fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, WindowError> {
        if !self.options.is_object() {
            return Err(WindowError::type_error("Options must be an object"));
        }
        serde_json::from_value(self.options.clone())
            .map_err(|e| WindowError::invalid_options(e.to_string()))
    }
}

// ============================================================================
// Futures
// ============================================================================

/// Pending answer of an asynchronous dialog.
#[derive(Debug)]
pub struct DialogReply<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> DialogReply<T> {
    fn channel() -> (DialogCallback<T>, Self)
    where
        T: 'static,
    {
        let (tx, rx) = oneshot::channel();
        let done: DialogCallback<T> = Box::new(move |value| {
            let _ = tx.send(value);
        });
        (done, Self { rx })
    }
}

impl<T> Future for DialogReply<T> {
    type Output = Result<T, WindowError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.map_err(|e| WindowError::channel_recv(e.to_string())))
    }
}

// ============================================================================
// Dialog
// ============================================================================

pub struct Dialog {
    native: Rc<dyn NativeDialogs>,
    capabilities: WindowCapabilities,
}

impl Dialog {
    pub fn new(native: Rc<dyn NativeDialogs>) -> Self {
        Self::with_capabilities(native, WindowCapabilities::default())
    }

    pub fn with_capabilities(native: Rc<dyn NativeDialogs>, capabilities: WindowCapabilities) -> Self {
        Self {
            native,
            capabilities,
        }
    }

    fn prepare<T: serde::de::DeserializeOwned>(
        &self,
        args: Vec<DialogArg>,
        mode: DialogMode,
    ) -> Result<Option<(Option<u32>, T)>, WindowError> {
        let Some(invocation) = DialogInvocation::normalize(args, mode) else {
            debug!("Dialog called with an unsupported argument count, ignoring");
            return Ok(None);
        };
        self.capabilities.check_dialogs()?;
        let options = invocation.parse()?;
        Ok(Some((invocation.owner_window_id, options)))
    }

    pub fn show_open_dialog(
        &self,
        args: Vec<DialogArg>,
    ) -> Result<Option<DialogReply<OpenDialogReturn>>, WindowError> {
        let Some((owner, options)) = self.prepare::<OpenDialogOptions>(args, DialogMode::Async)? else {
            return Ok(None);
        };
        let (done, reply) = DialogReply::channel();
        self.native.show_open_dialog(
            owner,
            &options,
            Box::new(move |paths: Option<Vec<String>>| {
                let file_paths = paths.unwrap_or_default();
                done(OpenDialogReturn {
                    canceled: file_paths.is_empty(),
                    file_paths,
                })
            }),
        );
        Ok(Some(reply))
    }

    pub fn show_save_dialog(
        &self,
        args: Vec<DialogArg>,
    ) -> Result<Option<DialogReply<SaveDialogReturn>>, WindowError> {
        let Some((owner, options)) = self.prepare::<SaveDialogOptions>(args, DialogMode::Async)? else {
            return Ok(None);
        };
        let (done, reply) = DialogReply::channel();
        self.native.show_save_dialog(
            owner,
            &options,
            Box::new(move |files: Vec<String>| {
                let file_path = files.into_iter().next().unwrap_or_default();
                done(SaveDialogReturn {
                    canceled: file_path.is_empty(),
                    file_path,
                })
            }),
        );
        Ok(Some(reply))
    }

    pub fn show_message_box(
        &self,
        args: Vec<DialogArg>,
    ) -> Result<Option<DialogReply<MessageBoxReturn>>, WindowError> {
        let Some((owner, options)) = self.prepare::<MessageBoxOptions>(args, DialogMode::Async)? else {
            return Ok(None);
        };
        let (done, reply) = DialogReply::channel();
        self.native.show_message_box(
            owner,
            &options,
            Box::new(move |(response, checkbox_checked): (usize, bool)| {
                done(MessageBoxReturn {
                    response,
                    checkbox_checked,
                })
            }),
        );
        Ok(Some(reply))
    }

    pub fn show_open_dialog_sync(
        &self,
        args: Vec<DialogArg>,
    ) -> Result<Option<Option<Vec<String>>>, WindowError> {
        Ok(self
            .prepare::<OpenDialogOptions>(args, DialogMode::Sync)?
            .map(|(owner, options)| self.native.show_open_dialog_sync(owner, &options)))
    }

    pub fn show_save_dialog_sync(
        &self,
        args: Vec<DialogArg>,
    ) -> Result<Option<Option<String>>, WindowError> {
        Ok(self
            .prepare::<SaveDialogOptions>(args, DialogMode::Sync)?
            .map(|(owner, options)| self.native.show_save_dialog_sync(owner, &options)))
    }

    pub fn show_message_box_sync(&self, args: Vec<DialogArg>) -> Result<Option<usize>, WindowError> {
        Ok(self
            .prepare::<MessageBoxOptions>(args, DialogMode::Sync)?
            .map(|(owner, options)| self.native.show_message_box_sync(owner, &options)))
    }

    pub fn show_error_box(&self, title: &str, content: &str) -> Result<(), WindowError> {
        self.capabilities.check_dialogs()?;
        self.native.show_error_box(title, content);
        Ok(())
    }
}
