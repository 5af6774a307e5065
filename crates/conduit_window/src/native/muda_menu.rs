use crate::menu::{Menu, MenuItem, MenuItemType, NativeMenu, NativeMenuFactory};
use crate::WindowError;
use muda::{CheckMenuItem, IsMenuItem, MenuEvent, MenuId, PredefinedMenuItem, Submenu};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Maps a window id to its platform handle (`HWND` on Windows, `NSView`
/// pointer on macOS). Supplied by whoever owns the windows.
pub trait WindowHandleResolver {
    fn native_handle(&self, window_id: Option<u32>) -> Option<isize>;
    fn top_level_handles(&self) -> Vec<isize>;
}

#[derive(Default)]
struct Shared {
    app_menu: RefCell<Option<muda::Menu>>,
}

/// A `muda` menu. Every insert lands both in a menu bar and in a submenu
/// handle, so the same menu can be installed as the application menu or
/// nested under a parent item.
pub struct MudaMenu {
    menu: muda::Menu,
    submenu: Submenu,
    checks: RefCell<HashMap<u32, CheckMenuItem>>,
    resolver: Rc<dyn WindowHandleResolver>,
    shared: Rc<Shared>,
}

fn native_err(err: muda::Error) -> WindowError {
    WindowError::native(err.to_string())
}

fn predefined(role: &str) -> Option<PredefinedMenuItem> {
    let item = match role.to_ascii_lowercase().as_str() {
        "copy" => PredefinedMenuItem::copy(None),
        "cut" => PredefinedMenuItem::cut(None),
        "paste" => PredefinedMenuItem::paste(None),
        "selectall" => PredefinedMenuItem::select_all(None),
        "undo" => PredefinedMenuItem::undo(None),
        "redo" => PredefinedMenuItem::redo(None),
        "minimize" => PredefinedMenuItem::minimize(None),
        "close" => PredefinedMenuItem::close_window(None),
        "hide" => PredefinedMenuItem::hide(None),
        "quit" => PredefinedMenuItem::quit(None),
        _ => return None,
    };
    Some(item)
}

impl MudaMenu {
    pub fn menu(&self) -> &muda::Menu {
        &self.menu
    }

    fn insert_both(&self, item: &dyn IsMenuItem, position: usize) -> Result<(), WindowError> {
        self.menu.insert(item, position).map_err(native_err)?;
        self.submenu.insert(item, position).map_err(native_err)
    }
}

impl NativeMenu for MudaMenu {
    fn insert_item(&self, position: usize, item: &MenuItem) -> Result<(), WindowError> {
        let id = MenuId::new(item.command_id.to_string());
        let accelerator = item.accelerator.as_ref().and_then(|a| a.parse().ok());

        if let Some(submenu) = &item.submenu {
            let Some(child) = submenu.native().as_any().downcast_ref::<MudaMenu>() else {
                return Err(WindowError::native("submenu was not created by muda"));
            };
            child.submenu.set_text(&item.label);
            child.submenu.set_enabled(item.enabled());
            return self.insert_both(&child.submenu, position);
        }

        match item.item_type {
            MenuItemType::Separator => self.insert_both(&PredefinedMenuItem::separator(), position),
            MenuItemType::Checkbox | MenuItemType::Radio => {
                let check = CheckMenuItem::with_id(
                    id,
                    &item.label,
                    item.enabled(),
                    item.checked(),
                    accelerator,
                );
                self.insert_both(&check, position)?;
                self.checks.borrow_mut().insert(item.command_id, check);
                Ok(())
            }
            _ => {
                if let Some(native) = item.role.as_deref().and_then(predefined) {
                    return self.insert_both(&native, position);
                }
                let entry = muda::MenuItem::with_id(id, &item.label, item.enabled(), accelerator);
                self.insert_both(&entry, position)
            }
        }
    }

    fn set_item_checked(&self, command_id: u32, checked: bool) -> Result<(), WindowError> {
        match self.checks.borrow().get(&command_id) {
            Some(check) => check.set_checked(checked),
            None => debug!(command_id, "no native check item to update"),
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), WindowError> {
        while self.menu.remove_at(0).is_some() {}
        while self.submenu.remove_at(0).is_some() {}
        self.checks.borrow_mut().clear();
        Ok(())
    }

    fn popup(&self, window_id: Option<u32>) -> Result<(), WindowError> {
        self.show_context_menu(window_id, None)
    }

    fn popup_at(&self, window_id: Option<u32>, x: i32, y: i32) -> Result<(), WindowError> {
        let position = muda::dpi::Position::Logical(muda::dpi::LogicalPosition::new(x as f64, y as f64));
        self.show_context_menu(window_id, Some(position))
    }

    fn close_popup(&self, window_id: Option<u32>) -> Result<(), WindowError> {
        // Context menus close themselves once a choice is made.
        debug!(?window_id, "close popup requested");
        Ok(())
    }

    fn set_as_application_menu(&self) -> Result<(), WindowError> {
        #[cfg(target_os = "macos")]
        {
            self.menu.init_for_nsapp();
        }

        #[cfg(target_os = "windows")]
        {
            for hwnd in self.resolver.top_level_handles() {
                unsafe { self.menu.init_for_hwnd(hwnd) }.map_err(native_err)?;
            }
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            return Err(WindowError::native(
                "application menus need a GTK window on this platform",
            ));
        }

        #[allow(unreachable_code)]
        {
            if self.shared.app_menu.replace(Some(self.menu.clone())).is_some() {
                debug!("Replacing existing app menu");
            }
            Ok(())
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MudaMenu {
    #[allow(unused_variables)]
    fn show_context_menu(
        &self,
        window_id: Option<u32>,
        position: Option<muda::dpi::Position>,
    ) -> Result<(), WindowError> {
        let Some(handle) = self.resolver.native_handle(window_id) else {
            warn!(?window_id, "No window found to show context menu");
            return Err(WindowError::native("no window to anchor the menu"));
        };

        #[cfg(target_os = "macos")]
        {
            use muda::ContextMenu;
            unsafe {
                let _ = self.menu.show_context_menu_for_nsview(handle as _, position);
            }
            return Ok(());
        }

        #[cfg(target_os = "windows")]
        {
            use muda::ContextMenu;
            unsafe {
                let _ = self.menu.show_context_menu_for_hwnd(handle, position);
            }
            return Ok(());
        }

        #[allow(unreachable_code)]
        Err(WindowError::native(
            "context menus need a GTK window on this platform",
        ))
    }
}

/// Creates [`MudaMenu`]s sharing one application menu slot.
pub struct MudaMenuFactory {
    resolver: Rc<dyn WindowHandleResolver>,
    shared: Rc<Shared>,
}

impl MudaMenuFactory {
    pub fn new(resolver: Rc<dyn WindowHandleResolver>) -> Self {
        Self {
            resolver,
            shared: Rc::new(Shared::default()),
        }
    }
}

impl NativeMenuFactory for MudaMenuFactory {
    fn create_menu(&self) -> Result<Box<dyn NativeMenu>, WindowError> {
        Ok(Box::new(MudaMenu {
            menu: muda::Menu::new(),
            submenu: Submenu::new("", true),
            checks: RefCell::new(HashMap::new()),
            resolver: self.resolver.clone(),
            shared: self.shared.clone(),
        }))
    }

    fn clear_application_menu(&self) -> Result<(), WindowError> {
        let Some(menu) = self.shared.app_menu.borrow_mut().take() else {
            return Ok(());
        };

        #[cfg(target_os = "macos")]
        {
            menu.remove_for_nsapp();
        }

        #[cfg(target_os = "windows")]
        {
            for hwnd in self.resolver.top_level_handles() {
                unsafe { menu.remove_for_hwnd(hwnd) }.map_err(native_err)?;
            }
        }

        drop(menu);
        Ok(())
    }
}

/// Forward pending `muda` activations to `menu`. Returns how many events
/// were handled.
pub fn drain_menu_events(menu: &Menu, window_id: Option<u32>) -> anyhow::Result<usize> {
    let mut handled = 0;
    while let Ok(event) = MenuEvent::receiver().try_recv() {
        let Ok(command_id) = event.id.0.parse::<u32>() else {
            debug!(id = %event.id.0, "Ignoring menu event without a command id");
            continue;
        };
        if menu.execute_command(command_id, window_id)? {
            handled += 1;
        }
    }
    Ok(handled)
}
