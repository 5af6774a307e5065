//! In-memory implementations of the native seams.
//!
//! Used by the host's self-check session and by tests. Every handle is a
//! cheap clone over shared state, so a test can keep one copy while the
//! wrapper owns another.

use crate::content::NativeView;
use crate::dialog::{
    DialogCallback, MessageBoxOptions, NativeDialogs, OpenDialogOptions, SaveDialogOptions,
};
use crate::menu::{MenuItem, NativeMenu, NativeMenuFactory};
use crate::WindowError;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

// ============================================================================
// View
// ============================================================================

#[derive(Debug, Default)]
struct ViewState {
    title: RefCell<String>,
    url: RefCell<Option<String>>,
    destroyed: Cell<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct HeadlessView {
    state: Rc<ViewState>,
}

impl HeadlessView {
    pub fn set_title(&self, title: &str) {
        *self.state.title.borrow_mut() = title.to_string();
    }

    pub fn mark_destroyed(&self) {
        self.state.destroyed.set(true);
    }

    pub fn loaded_url(&self) -> Option<String> {
        self.state.url.borrow().clone()
    }
}

impl NativeView for HeadlessView {
    fn load_url(&self, url: &str) -> Result<(), WindowError> {
        if self.state.destroyed.get() {
            return Err(WindowError::native("view is destroyed"));
        }
        debug!(url = %url, "headless view load");
        *self.state.url.borrow_mut() = Some(url.to_string());
        Ok(())
    }

    fn title(&self) -> String {
        self.state.title.borrow().clone()
    }

    fn is_destroyed(&self) -> bool {
        self.state.destroyed.get()
    }
}

// ============================================================================
// Menus
// ============================================================================

/// A native menu call, tagged with the menu it hit (creation order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuCall {
    Insert {
        menu: usize,
        position: usize,
        command_id: u32,
        label: String,
    },
    SetChecked {
        menu: usize,
        command_id: u32,
        checked: bool,
    },
    Clear {
        menu: usize,
    },
    Popup {
        menu: usize,
        window_id: Option<u32>,
    },
    PopupAt {
        menu: usize,
        window_id: Option<u32>,
        x: i32,
        y: i32,
    },
    ClosePopup {
        menu: usize,
        window_id: Option<u32>,
    },
    SetApplicationMenu {
        menu: usize,
    },
    ClearApplicationMenu,
}

#[derive(Debug, Default)]
struct MenuLog {
    calls: RefCell<Vec<MenuCall>>,
    next_menu: Cell<usize>,
    fail_inserts: Cell<bool>,
}

impl MenuLog {
    fn record(&self, call: MenuCall) {
        self.calls.borrow_mut().push(call);
    }
}

#[derive(Debug)]
pub struct HeadlessMenu {
    index: usize,
    log: Rc<MenuLog>,
}

impl HeadlessMenu {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl NativeMenu for HeadlessMenu {
    fn insert_item(&self, position: usize, item: &MenuItem) -> Result<(), WindowError> {
        if self.log.fail_inserts.get() {
            return Err(WindowError::native("insert rejected"));
        }
        self.log.record(MenuCall::Insert {
            menu: self.index,
            position,
            command_id: item.command_id,
            label: item.label.clone(),
        });
        Ok(())
    }

    fn set_item_checked(&self, command_id: u32, checked: bool) -> Result<(), WindowError> {
        self.log.record(MenuCall::SetChecked {
            menu: self.index,
            command_id,
            checked,
        });
        Ok(())
    }

    fn clear(&self) -> Result<(), WindowError> {
        self.log.record(MenuCall::Clear { menu: self.index });
        Ok(())
    }

    fn popup(&self, window_id: Option<u32>) -> Result<(), WindowError> {
        self.log.record(MenuCall::Popup {
            menu: self.index,
            window_id,
        });
        Ok(())
    }

    fn popup_at(&self, window_id: Option<u32>, x: i32, y: i32) -> Result<(), WindowError> {
        self.log.record(MenuCall::PopupAt {
            menu: self.index,
            window_id,
            x,
            y,
        });
        Ok(())
    }

    fn close_popup(&self, window_id: Option<u32>) -> Result<(), WindowError> {
        self.log.record(MenuCall::ClosePopup {
            menu: self.index,
            window_id,
        });
        Ok(())
    }

    fn set_as_application_menu(&self) -> Result<(), WindowError> {
        self.log
            .record(MenuCall::SetApplicationMenu { menu: self.index });
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeadlessMenuFactory {
    log: Rc<MenuLog>,
}

impl HeadlessMenuFactory {
    pub fn calls(&self) -> Vec<MenuCall> {
        self.log.calls.borrow().clone()
    }

    /// Make every subsequent native insert fail.
    pub fn fail_inserts(&self, fail: bool) {
        self.log.fail_inserts.set(fail);
    }
}

impl NativeMenuFactory for HeadlessMenuFactory {
    fn create_menu(&self) -> Result<Box<dyn NativeMenu>, WindowError> {
        let index = self.log.next_menu.get();
        self.log.next_menu.set(index + 1);
        Ok(Box::new(HeadlessMenu {
            index,
            log: self.log.clone(),
        }))
    }

    fn clear_application_menu(&self) -> Result<(), WindowError> {
        self.log.record(MenuCall::ClearApplicationMenu);
        Ok(())
    }
}

// ============================================================================
// Dialogs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogCall {
    Open { owner: Option<u32>, multiple: bool },
    Save { owner: Option<u32> },
    MessageBox { owner: Option<u32>, message: String },
    ErrorBox { title: String, content: String },
}

#[derive(Debug, Default)]
struct DialogScript {
    open: RefCell<Option<Vec<String>>>,
    save: RefCell<Vec<String>>,
    message: Cell<(usize, bool)>,
    calls: RefCell<Vec<DialogCall>>,
}

/// Dialogs that answer immediately with scripted values. Unscripted
/// dialogs answer as if canceled.
#[derive(Debug, Clone, Default)]
pub struct HeadlessDialogs {
    script: Rc<DialogScript>,
}

impl HeadlessDialogs {
    pub fn answer_open(&self, paths: Option<Vec<String>>) {
        *self.script.open.borrow_mut() = paths;
    }

    pub fn answer_save(&self, files: Vec<String>) {
        *self.script.save.borrow_mut() = files;
    }

    pub fn answer_message(&self, response: usize, checkbox_checked: bool) {
        self.script.message.set((response, checkbox_checked));
    }

    pub fn calls(&self) -> Vec<DialogCall> {
        self.script.calls.borrow().clone()
    }

    fn record(&self, call: DialogCall) {
        self.script.calls.borrow_mut().push(call);
    }
}

impl NativeDialogs for HeadlessDialogs {
    fn show_open_dialog(
        &self,
        owner: Option<u32>,
        options: &OpenDialogOptions,
        done: DialogCallback<Option<Vec<String>>>,
    ) {
        done(self.show_open_dialog_sync(owner, options));
    }

    fn show_save_dialog(
        &self,
        owner: Option<u32>,
        _options: &SaveDialogOptions,
        done: DialogCallback<Vec<String>>,
    ) {
        self.record(DialogCall::Save { owner });
        done(self.script.save.borrow().clone());
    }

    fn show_message_box(
        &self,
        owner: Option<u32>,
        options: &MessageBoxOptions,
        done: DialogCallback<(usize, bool)>,
    ) {
        let response = self.show_message_box_sync(owner, options);
        done((response, self.script.message.get().1));
    }

    fn show_open_dialog_sync(&self, owner: Option<u32>, options: &OpenDialogOptions) -> Option<Vec<String>> {
        self.record(DialogCall::Open {
            owner,
            multiple: options.multiple(),
        });
        self.script.open.borrow().clone()
    }

    fn show_save_dialog_sync(&self, owner: Option<u32>, _options: &SaveDialogOptions) -> Option<String> {
        self.record(DialogCall::Save { owner });
        self.script.save.borrow().first().cloned()
    }

    fn show_message_box_sync(&self, owner: Option<u32>, options: &MessageBoxOptions) -> usize {
        self.record(DialogCall::MessageBox {
            owner,
            message: options.message.clone(),
        });
        self.script.message.get().0
    }

    fn show_error_box(&self, title: &str, content: &str) {
        self.record(DialogCall::ErrorBox {
            title: title.to_string(),
            content: content.to_string(),
        });
    }
}
