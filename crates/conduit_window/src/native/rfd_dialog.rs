use crate::dialog::{
    DialogCallback, MessageBoxOptions, NativeDialogs, OpenDialogOptions,
    SaveDialogOptions,
};
use rfd::{
    AsyncFileDialog, AsyncMessageDialog, FileDialog, MessageButtons, MessageDialog,
    MessageDialogResult, MessageLevel,
};
use tracing::{debug, warn};

/// Dialogs backed by `rfd`. Callback-style calls run on the current
/// `LocalSet`; owner windows are not forwarded to the platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct RfdDialogs;

macro_rules! configure_file_dialog {
    ($dialog:expr, $title:expr, $filters:expr) => {{
        let mut dialog = $dialog;
        if let Some(title) = $title {
            dialog = dialog.set_title(title);
        }
        for filter in $filters {
            let exts: Vec<&str> = filter.extensions.iter().map(|s| s.as_str()).collect();
            dialog = dialog.add_filter(&filter.name, &exts);
        }
        dialog
    }};
}

fn open_dialog(options: &OpenDialogOptions) -> FileDialog {
    let dialog = configure_file_dialog!(FileDialog::new(), options.title.as_deref(), &options.filters);
    match &options.default_path {
        Some(path) => dialog.set_directory(path),
        None => dialog,
    }
}

fn save_dialog(options: &SaveDialogOptions) -> FileDialog {
    let dialog = configure_file_dialog!(FileDialog::new(), options.title.as_deref(), &options.filters);
    match &options.default_path {
        Some(path) => dialog.set_file_name(path),
        None => dialog,
    }
}

fn level(kind: Option<&str>) -> MessageLevel {
    match kind {
        Some("warning") => MessageLevel::Warning,
        Some("error") => MessageLevel::Error,
        _ => MessageLevel::Info,
    }
}

fn buttons(labels: &[String]) -> MessageButtons {
    match labels {
        [] => MessageButtons::Ok,
        [ok] => MessageButtons::OkCustom(ok.clone()),
        [ok, cancel] => MessageButtons::OkCancelCustom(ok.clone(), cancel.clone()),
        [yes, no, rest @ ..] => {
            if rest.len() > 1 {
                warn!(
                    "Message dialog supports at most 3 buttons, got {}. Extra buttons will be ignored.",
                    labels.len()
                );
            }
            MessageButtons::YesNoCancelCustom(
                yes.clone(),
                no.clone(),
                rest.first().cloned().unwrap_or_else(|| "Cancel".to_string()),
            )
        }
    }
}

/// Index of the pressed button within `labels`.
fn response_index(result: MessageDialogResult, labels: &[String]) -> usize {
    match result {
        MessageDialogResult::Ok | MessageDialogResult::Yes => 0,
        MessageDialogResult::Cancel | MessageDialogResult::No => 1,
        MessageDialogResult::Custom(label) => labels.iter().position(|l| *l == label).unwrap_or(0),
    }
}

fn paths<I, P>(files: I) -> Vec<String>
where
    I: IntoIterator<Item = P>,
    P: AsRef<std::path::Path>,
{
    files
        .into_iter()
        .map(|p| p.as_ref().to_string_lossy().to_string())
        .collect()
}

fn message_dialog(options: &MessageBoxOptions) -> MessageDialog {
    let description = match &options.detail {
        Some(detail) => format!("{}\n\n{detail}", options.message),
        None => options.message.clone(),
    };
    MessageDialog::new()
        .set_level(level(options.kind.as_deref()))
        .set_title(options.title.as_deref().unwrap_or(""))
        .set_description(description)
        .set_buttons(buttons(&options.buttons))
}

impl NativeDialogs for RfdDialogs {
    fn show_open_dialog(
        &self,
        owner: Option<u32>,
        options: &OpenDialogOptions,
        done: DialogCallback<Option<Vec<String>>>,
    ) {
        debug!(?owner, "open dialog");
        let mut dialog = configure_file_dialog!(
            AsyncFileDialog::new(),
            options.title.as_deref(),
            &options.filters
        );
        if let Some(path) = &options.default_path {
            dialog = dialog.set_directory(path);
        }
        let directory = options.directory();
        let multiple = options.multiple();
        tokio::task::spawn_local(async move {
            let picked = match (directory, multiple) {
                (true, _) => dialog.pick_folder().await.map(|h| vec![h.path().to_path_buf()]),
                (false, true) => dialog
                    .pick_files()
                    .await
                    .map(|hs| hs.iter().map(|h| h.path().to_path_buf()).collect()),
                (false, false) => dialog.pick_file().await.map(|h| vec![h.path().to_path_buf()]),
            };
            done(picked.map(paths));
        });
    }

    fn show_save_dialog(
        &self,
        owner: Option<u32>,
        options: &SaveDialogOptions,
        done: DialogCallback<Vec<String>>,
    ) {
        debug!(?owner, "save dialog");
        let mut dialog = configure_file_dialog!(
            AsyncFileDialog::new(),
            options.title.as_deref(),
            &options.filters
        );
        if let Some(path) = &options.default_path {
            dialog = dialog.set_file_name(path);
        }
        tokio::task::spawn_local(async move {
            let chosen = dialog.save_file().await.map(|h| h.path().to_path_buf());
            done(paths(chosen));
        });
    }

    fn show_message_box(
        &self,
        owner: Option<u32>,
        options: &MessageBoxOptions,
        done: DialogCallback<(usize, bool)>,
    ) {
        debug!(?owner, "message box");
        let description = match &options.detail {
            Some(detail) => format!("{}\n\n{detail}", options.message),
            None => options.message.clone(),
        };
        let dialog = AsyncMessageDialog::new()
            .set_level(level(options.kind.as_deref()))
            .set_title(options.title.as_deref().unwrap_or(""))
            .set_description(description)
            .set_buttons(buttons(&options.buttons));
        let labels = options.buttons.clone();
        // rfd has no checkbox; the initial state is reported back.
        let checkbox_checked = options.checkbox_checked;
        tokio::task::spawn_local(async move {
            let result = dialog.show().await;
            done((response_index(result, &labels), checkbox_checked));
        });
    }

    fn show_open_dialog_sync(&self, owner: Option<u32>, options: &OpenDialogOptions) -> Option<Vec<String>> {
        debug!(?owner, "open dialog (sync)");
        let dialog = open_dialog(options);
        if options.directory() {
            dialog.pick_folder().map(|p| paths([p]))
        } else if options.multiple() {
            dialog.pick_files().map(paths)
        } else {
            dialog.pick_file().map(|p| paths([p]))
        }
    }

    fn show_save_dialog_sync(&self, owner: Option<u32>, options: &SaveDialogOptions) -> Option<String> {
        debug!(?owner, "save dialog (sync)");
        save_dialog(options)
            .save_file()
            .map(|p| p.to_string_lossy().to_string())
    }

    fn show_message_box_sync(&self, owner: Option<u32>, options: &MessageBoxOptions) -> usize {
        debug!(?owner, "message box (sync)");
        response_index(message_dialog(options).show(), &options.buttons)
    }

    fn show_error_box(&self, title: &str, content: &str) {
        let _ = MessageDialog::new()
            .set_level(MessageLevel::Error)
            .set_title(title)
            .set_description(content)
            .set_buttons(MessageButtons::Ok)
            .show();
    }
}
