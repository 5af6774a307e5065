//! Menu builder.
//!
//! Templates are resolved in two phases: [`resolve_positions`] orders the
//! descriptors according to their `position` directives, then
//! [`MenuBuilder`] materializes native items in that order. A [`Menu`]
//! keeps its item list and its native handle in lockstep.

use crate::{WindowCapabilities, WindowError};
use conduit_ipc::{ChannelRegistry, ListenerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

// ============================================================================
// Template Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MenuItemType {
    Normal,
    Separator,
    Submenu,
    Checkbox,
    Radio,
}

/// Click callback of an item: receives the item and the focused window id.
pub type ClickHandler = Rc<dyn Fn(&MenuItem, Option<u32>) -> anyhow::Result<()>>;

/// One template entry.
///
/// Fields this struct does not know are kept in `extra` and copied onto the
/// resulting [`MenuItem`].
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItemOptions {
    pub id: Option<String>,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<MenuItemType>,
    pub role: Option<String>,
    pub accelerator: Option<String>,
    pub enabled: Option<bool>,
    pub visible: Option<bool>,
    pub checked: Option<bool>,
    pub position: Option<String>,
    pub submenu: Option<Vec<MenuItemOptions>>,
    #[serde(skip)]
    pub click: Option<ClickHandler>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for MenuItemOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MenuItemOptions")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("item_type", &self.item_type)
            .field("position", &self.position)
            .field("submenu", &self.submenu)
            .field("click", &self.click.is_some())
            .field("extra", &self.extra)
            .finish()
    }
}

impl MenuItemOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn separator() -> Self {
        Self {
            item_type: Some(MenuItemType::Separator),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_type(mut self, item_type: MenuItemType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn with_submenu(mut self, submenu: Vec<MenuItemOptions>) -> Self {
        self.submenu = Some(submenu);
        self
    }

    pub fn on_click<F>(mut self, handler: F) -> Self
    where
        F: Fn(&MenuItem, Option<u32>) -> anyhow::Result<()> + 'static,
    {
        self.click = Some(Rc::new(handler));
        self
    }

    /// Declared type, or the type implied by the other fields.
    pub fn effective_type(&self) -> MenuItemType {
        match self.item_type {
            Some(item_type) => item_type,
            None if self.submenu.is_some() => MenuItemType::Submenu,
            None => MenuItemType::Normal,
        }
    }

    fn is_separator(&self) -> bool {
        self.effective_type() == MenuItemType::Separator
    }
}

// ============================================================================
// Position Directives
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement<'a> {
    After(&'a str),
    EndOf(&'a str),
}

fn parse_position(position: &str) -> Result<Placement<'_>, WindowError> {
    let (verb, id) = position
        .split_once('=')
        .ok_or_else(|| WindowError::invalid_options(format!("Malformed position '{position}'")))?;
    match verb {
        "after" => Ok(Placement::After(id)),
        "endof" => Ok(Placement::EndOf(id)),
        other => Err(WindowError::invalid_options(format!(
            "Unknown position verb '{other}' in '{position}'"
        ))),
    }
}

fn index_of_id(items: &[MenuItemOptions], id: &str) -> Option<usize> {
    items.iter().position(|item| item.id.as_deref() == Some(id))
}

/// Index at which an item carrying `placement` lands in `items`. May push a
/// new group separator for `endof` directives.
fn index_for_placement(items: &mut Vec<MenuItemOptions>, placement: Placement<'_>) -> usize {
    match placement {
        Placement::After(id) => match index_of_id(items, id) {
            Some(index) => index + 1,
            None => {
                warn!(id = %id, "Menu item with id not found, appending");
                items.len()
            }
        },
        Placement::EndOf(id) => {
            let start = match index_of_id(items, id) {
                Some(index) => index,
                None => {
                    items.push(MenuItemOptions::separator().with_id(id));
                    items.len() - 1
                }
            };
            let mut index = start + 1;
            while index < items.len() && !items[index].is_separator() {
                index += 1;
            }
            index
        }
    }
}

/// Order a template according to its `position` directives.
///
/// Items without a directive go right after the previously inserted item.
/// `after=<id>` with an unknown id appends with a warning; an unknown verb
/// is an error.
pub fn resolve_positions(template: Vec<MenuItemOptions>) -> Result<Vec<MenuItemOptions>, WindowError> {
    let mut positioned: Vec<MenuItemOptions> = Vec::with_capacity(template.len());
    let mut next_index = 0;

    for item in template {
        let index = match item.position.as_deref() {
            Some(position) => {
                let placement = parse_position(position)?;
                index_for_placement(&mut positioned, placement)
            }
            None => next_index,
        };
        let index = index.min(positioned.len());
        positioned.insert(index, item);
        next_index = index + 1;
    }
    Ok(positioned)
}

// ============================================================================
// Native Seam
// ============================================================================

/// Native menu handle. Calls mirror the visible item list one to one.
pub trait NativeMenu {
    fn insert_item(&self, position: usize, item: &MenuItem) -> Result<(), WindowError>;
    fn set_item_checked(&self, command_id: u32, checked: bool) -> Result<(), WindowError>;
    fn clear(&self) -> Result<(), WindowError>;
    fn popup(&self, window_id: Option<u32>) -> Result<(), WindowError>;
    fn popup_at(&self, window_id: Option<u32>, x: i32, y: i32) -> Result<(), WindowError>;
    fn close_popup(&self, window_id: Option<u32>) -> Result<(), WindowError>;
    fn set_as_application_menu(&self) -> Result<(), WindowError>;
    fn as_any(&self) -> &dyn Any;
}

/// Creates native menus and owns the process-wide menu bar slot.
pub trait NativeMenuFactory {
    fn create_menu(&self) -> Result<Box<dyn NativeMenu>, WindowError>;
    fn clear_application_menu(&self) -> Result<(), WindowError>;
}

// ============================================================================
// Menu Items
// ============================================================================

pub struct MenuItem {
    pub command_id: u32,
    pub id: Option<String>,
    pub label: String,
    pub item_type: MenuItemType,
    pub role: Option<String>,
    pub accelerator: Option<String>,
    pub submenu: Option<Rc<Menu>>,
    /// Template fields without a dedicated slot, copied verbatim.
    pub extra: Map<String, Value>,
    enabled: Cell<bool>,
    visible: Cell<bool>,
    checked: Cell<bool>,
    click: Option<ClickHandler>,
}

impl fmt::Debug for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MenuItem")
            .field("command_id", &self.command_id)
            .field("id", &self.id)
            .field("label", &self.label)
            .field("item_type", &self.item_type)
            .field("checked", &self.checked.get())
            .field("submenu", &self.submenu.as_ref().map(|m| m.len()))
            .finish_non_exhaustive()
    }
}

impl MenuItem {
    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled)
    }

    pub fn visible(&self) -> bool {
        self.visible.get()
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.set(visible)
    }

    pub fn checked(&self) -> bool {
        self.checked.get()
    }

    fn is_checkable(&self) -> bool {
        matches!(self.item_type, MenuItemType::Checkbox | MenuItemType::Radio)
    }
}

/// Payload of the `click` event on a menu.
#[derive(Debug, Clone)]
pub struct MenuClick {
    pub item: Rc<MenuItem>,
    pub window_id: Option<u32>,
}

/// Options for [`Menu::popup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupOptions {
    pub window_id: Option<u32>,
    pub x: Option<i32>,
    pub y: Option<i32>,
}

// ============================================================================
// Menu
// ============================================================================

pub struct Menu {
    items: RefCell<Vec<Rc<MenuItem>>>,
    native: Box<dyn NativeMenu>,
    events: ChannelRegistry<MenuClick>,
}

impl fmt::Debug for Menu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Menu")
            .field("items", &self.items.borrow())
            .finish_non_exhaustive()
    }
}

impl Menu {
    pub fn new(native: Box<dyn NativeMenu>) -> Self {
        Self {
            items: RefCell::new(Vec::new()),
            native,
            events: ChannelRegistry::new(),
        }
    }

    pub fn native(&self) -> &dyn NativeMenu {
        self.native.as_ref()
    }

    pub fn items(&self) -> Vec<Rc<MenuItem>> {
        self.items.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn append(&self, item: Rc<MenuItem>) -> Result<(), WindowError> {
        let position = self.len();
        self.insert(position, item)
    }

    /// Insert into the native handle, then into the visible list. A native
    /// failure leaves both untouched.
    pub fn insert(&self, position: usize, item: Rc<MenuItem>) -> Result<(), WindowError> {
        let len = self.len();
        if position > len {
            return Err(WindowError::menu(format!(
                "Insert position {position} out of range (len {len})"
            )));
        }
        self.native.insert_item(position, &item)?;
        self.items.borrow_mut().insert(position, item);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), WindowError> {
        self.native.clear()?;
        self.items.borrow_mut().clear();
        Ok(())
    }

    /// Show as a context menu. Positioned only when both `x` and `y` are set.
    pub fn popup(&self, options: PopupOptions) -> Result<(), WindowError> {
        match (options.x, options.y) {
            (Some(x), Some(y)) => self.native.popup_at(options.window_id, x, y),
            _ => self.native.popup(options.window_id),
        }
    }

    pub fn close_popup(&self, window_id: Option<u32>) -> Result<(), WindowError> {
        self.native.close_popup(window_id)
    }

    /// Find an item by template id, searching submenus depth first.
    pub fn get_menu_item_by_id(&self, id: &str) -> Option<Rc<MenuItem>> {
        for item in self.items() {
            if item.id.as_deref() == Some(id) {
                return Some(item);
            }
            if let Some(found) = item.submenu.as_ref().and_then(|s| s.get_menu_item_by_id(id)) {
                return Some(found);
            }
        }
        None
    }

    pub fn on<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&MenuClick) -> anyhow::Result<()> + 'static,
    {
        self.events.on(channel, listener)
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.events.remove_listener(channel, id)
    }

    /// Activate the item with `command_id`: toggle checkbox state, enforce
    /// radio exclusivity, run the item's click handler, then emit `click` on
    /// this menu. Returns `false` when no item carries the id.
    pub fn execute_command(&self, command_id: u32, window_id: Option<u32>) -> anyhow::Result<bool> {
        let Some(item) = self.activate(command_id)? else {
            return Ok(false);
        };
        debug!(command_id, label = %item.label, "Menu command");

        if let Some(click) = &item.click {
            click(&item, window_id)?;
        }
        self.events.emit(
            "click",
            &MenuClick {
                item: item.clone(),
                window_id,
            },
        )?;
        Ok(true)
    }

    /// Apply check-state changes for `command_id` inside the owning menu.
    fn activate(&self, command_id: u32) -> Result<Option<Rc<MenuItem>>, WindowError> {
        let items = self.items();
        let Some(index) = items.iter().position(|i| i.command_id == command_id) else {
            for item in &items {
                if let Some(submenu) = &item.submenu {
                    if let Some(found) = submenu.activate(command_id)? {
                        return Ok(Some(found));
                    }
                }
            }
            return Ok(None);
        };

        let item = items[index].clone();
        match item.item_type {
            MenuItemType::Checkbox => {
                let checked = !item.checked();
                self.native.set_item_checked(command_id, checked)?;
                item.checked.set(checked);
            }
            MenuItemType::Radio => {
                let start = items[..index]
                    .iter()
                    .rposition(|i| i.item_type != MenuItemType::Radio)
                    .map_or(0, |p| p + 1);
                let end = items[index..]
                    .iter()
                    .position(|i| i.item_type != MenuItemType::Radio)
                    .map_or(items.len(), |p| index + p);
                for sibling in &items[start..end] {
                    let checked = sibling.command_id == command_id;
                    if sibling.checked() != checked {
                        self.native.set_item_checked(sibling.command_id, checked)?;
                        sibling.checked.set(checked);
                    }
                }
            }
            _ => {}
        }
        Ok(Some(item))
    }
}

// ============================================================================
// MenuBuilder
// ============================================================================

/// Creates menus and owns the application menu slot.
pub struct MenuBuilder {
    factory: Rc<dyn NativeMenuFactory>,
    capabilities: WindowCapabilities,
    application_menu: RefCell<Option<Rc<Menu>>>,
    next_command_id: Cell<u32>,
}

impl MenuBuilder {
    pub fn new(factory: Rc<dyn NativeMenuFactory>) -> Self {
        Self::with_capabilities(factory, WindowCapabilities::default())
    }

    pub fn with_capabilities(
        factory: Rc<dyn NativeMenuFactory>,
        capabilities: WindowCapabilities,
    ) -> Self {
        Self {
            factory,
            capabilities,
            application_menu: RefCell::new(None),
            next_command_id: Cell::new(0),
        }
    }

    pub fn create_menu(&self) -> Result<Rc<Menu>, WindowError> {
        self.capabilities.check_menus()?;
        Ok(Rc::new(Menu::new(self.factory.create_menu()?)))
    }

    /// Materialize one descriptor. Submenu templates are built recursively.
    pub fn create_item(&self, options: MenuItemOptions) -> Result<Rc<MenuItem>, WindowError> {
        let item_type = options.effective_type();
        let submenu = match options.submenu {
            Some(template) => Some(self.build_from_template(template)?),
            None if item_type == MenuItemType::Submenu => Some(self.create_menu()?),
            None => None,
        };

        let command_id = self.next_command_id.get() + 1;
        self.next_command_id.set(command_id);

        let item = MenuItem {
            command_id,
            id: options.id,
            label: options.label.unwrap_or_default(),
            item_type,
            role: options.role,
            accelerator: options.accelerator,
            submenu,
            extra: options.extra,
            enabled: Cell::new(options.enabled.unwrap_or(true)),
            visible: Cell::new(options.visible.unwrap_or(true)),
            checked: Cell::new(options.checked.unwrap_or(false)),
            click: options.click,
        };
        if item.checked() && !item.is_checkable() {
            warn!(label = %item.label, "checked is ignored on non-checkable items");
            item.checked.set(false);
        }
        Ok(Rc::new(item))
    }

    pub fn build_from_template(&self, template: Vec<MenuItemOptions>) -> Result<Rc<Menu>, WindowError> {
        self.capabilities.check_menus()?;
        let positioned = resolve_positions(template)?;

        let menu = self.create_menu()?;
        for options in positioned {
            let item = self.create_item(options)?;
            menu.append(item)?;
        }
        debug!(items = menu.len(), "Built menu from template");
        Ok(menu)
    }

    /// Build from an untyped template, rejecting anything that is not an
    /// array of objects.
    pub fn build_from_value(&self, template: &Value) -> Result<Rc<Menu>, WindowError> {
        let entries = template
            .as_array()
            .ok_or_else(|| WindowError::type_error("Invalid template for Menu: expected an array"))?;

        let mut options = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            if !entry.is_object() {
                return Err(WindowError::type_error(format!(
                    "Invalid template for MenuItem at index {index}: expected an object"
                )));
            }
            let parsed: MenuItemOptions = serde_json::from_value(entry.clone()).map_err(|e| {
                WindowError::invalid_options(format!("MenuItem at index {index}: {e}"))
            })?;
            options.push(parsed);
        }
        self.build_from_template(options)
    }

    /// Install `menu` as the application menu, or remove the current one.
    pub fn set_application_menu(&self, menu: Option<Rc<Menu>>) -> Result<(), WindowError> {
        self.capabilities.check_menus()?;
        match &menu {
            Some(menu) => menu.native().set_as_application_menu()?,
            None => self.factory.clear_application_menu()?,
        }
        if self.application_menu.borrow().is_some() {
            debug!("Replacing existing application menu");
        }
        *self.application_menu.borrow_mut() = menu;
        Ok(())
    }

    pub fn get_application_menu(&self) -> Option<Rc<Menu>> {
        self.application_menu.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessMenuFactory, MenuCall};
    use serde_json::json;

    fn ids(items: &[MenuItemOptions]) -> Vec<String> {
        items
            .iter()
            .map(|i| i.id.clone().unwrap_or_else(|| "-".into()))
            .collect()
    }

    fn item(id: &str) -> MenuItemOptions {
        MenuItemOptions::new(id.to_uppercase()).with_id(id)
    }

    fn builder() -> (MenuBuilder, HeadlessMenuFactory) {
        let factory = HeadlessMenuFactory::default();
        (MenuBuilder::new(Rc::new(factory.clone())), factory)
    }

    #[test]
    fn test_endof_groups_before_separator() {
        let template = vec![
            item("a"),
            item("b").with_position("after=a"),
            MenuItemOptions::separator().with_id("sep"),
            item("c").with_position("endof=a"),
        ];
        let positioned = resolve_positions(template).unwrap();
        assert_eq!(ids(&positioned), vec!["a", "b", "c", "sep"]);
    }

    #[test]
    fn test_after_missing_id_appends() {
        let template = vec![item("a"), item("b"), item("x").with_position("after=zzz")];
        let positioned = resolve_positions(template).unwrap();
        assert_eq!(ids(&positioned), vec!["a", "b", "x"]);
    }

    #[test]
    fn test_endof_missing_id_opens_group() {
        let template = vec![
            item("a"),
            item("b").with_position("endof=tools"),
            item("c").with_position("endof=tools"),
        ];
        let positioned = resolve_positions(template).unwrap();
        assert_eq!(ids(&positioned), vec!["a", "tools", "b", "c"]);
        assert!(positioned[1].is_separator());
    }

    #[test]
    fn test_undirected_items_follow_previous_insert() {
        let template = vec![
            item("a"),
            item("b"),
            item("first").with_position("after=a"),
            item("second"),
        ];
        let positioned = resolve_positions(template).unwrap();
        assert_eq!(ids(&positioned), vec!["a", "first", "second", "b"]);
    }

    #[test]
    fn test_unknown_verb_is_rejected() {
        let template = vec![item("a"), item("b").with_position("before=a")];
        assert!(matches!(
            resolve_positions(template),
            Err(WindowError::InvalidOptions { .. })
        ));
        assert!(resolve_positions(vec![item("a").with_position("after")]).is_err());
    }

    #[test]
    fn test_build_keeps_native_in_lockstep() {
        let (builder, factory) = builder();
        let menu = builder
            .build_from_template(vec![item("a"), MenuItemOptions::separator(), item("b")])
            .unwrap();
        assert_eq!(menu.len(), 3);

        let inserts: Vec<usize> = factory
            .calls()
            .iter()
            .filter_map(|c| match c {
                MenuCall::Insert { position, .. } => Some(*position),
                _ => None,
            })
            .collect();
        assert_eq!(inserts, vec![0, 1, 2]);

        menu.insert(1, builder.create_item(item("mid")).unwrap()).unwrap();
        let labels: Vec<String> = menu.items().iter().map(|i| i.label.clone()).collect();
        assert_eq!(labels, vec!["A", "MID", "", "B"]);
        assert!(matches!(factory.calls().last(), Some(MenuCall::Insert { position: 1, .. })));

        menu.clear().unwrap();
        assert!(menu.is_empty());
        assert!(matches!(factory.calls().last(), Some(MenuCall::Clear { .. })));
    }

    #[test]
    fn test_insert_out_of_range_touches_nothing() {
        let (builder, factory) = builder();
        let menu = builder.create_menu().unwrap();
        let before = factory.calls().len();
        let err = menu.insert(3, builder.create_item(item("a")).unwrap()).unwrap_err();
        assert!(matches!(err, WindowError::Menu { .. }));
        assert_eq!(factory.calls().len(), before);
        assert!(menu.is_empty());
    }

    #[test]
    fn test_failed_native_insert_keeps_list_unchanged() {
        let (builder, factory) = builder();
        let menu = builder.create_menu().unwrap();
        factory.fail_inserts(true);
        assert!(menu.append(builder.create_item(item("a")).unwrap()).is_err());
        assert!(menu.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_copied() {
        let (builder, _factory) = builder();
        let menu = builder
            .build_from_value(&json!([
                { "id": "save", "label": "Save", "accelerator": "CmdOrCtrl+S", "sublabel": "to disk", "toolTip": "Save file" }
            ]))
            .unwrap();
        let save = menu.get_menu_item_by_id("save").unwrap();
        assert_eq!(save.accelerator.as_deref(), Some("CmdOrCtrl+S"));
        assert_eq!(save.extra.get("sublabel"), Some(&json!("to disk")));
        assert_eq!(save.extra.get("toolTip"), Some(&json!("Save file")));
    }

    #[test]
    fn test_build_from_value_type_errors() {
        let (builder, factory) = builder();
        assert!(matches!(
            builder.build_from_value(&json!({"label": "File"})),
            Err(WindowError::TypeError { .. })
        ));
        assert!(matches!(
            builder.build_from_value(&json!([{"label": "File"}, "oops"])),
            Err(WindowError::TypeError { .. })
        ));
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn test_nested_submenus_are_built() {
        let (builder, _factory) = builder();
        let menu = builder
            .build_from_value(&json!([
                { "label": "File", "submenu": [
                    { "id": "open", "label": "Open" },
                    { "label": "Recent", "submenu": [ { "id": "recent-1", "label": "notes.md" } ] }
                ] }
            ]))
            .unwrap();
        let file = &menu.items()[0];
        assert_eq!(file.item_type, MenuItemType::Submenu);
        assert_eq!(file.submenu.as_ref().unwrap().len(), 2);
        assert!(menu.get_menu_item_by_id("recent-1").is_some());
        assert!(menu.get_menu_item_by_id("missing").is_none());
    }

    #[test]
    fn test_popup_variants() {
        let (builder, factory) = builder();
        let menu = builder.build_from_template(vec![item("a")]).unwrap();

        menu.popup(PopupOptions {
            window_id: Some(1),
            x: Some(10),
            y: Some(20),
        })
        .unwrap();
        assert!(matches!(
            factory.calls().last(),
            Some(MenuCall::PopupAt { window_id: Some(1), x: 10, y: 20, .. })
        ));

        menu.popup(PopupOptions {
            window_id: Some(1),
            x: Some(10),
            y: None,
        })
        .unwrap();
        assert!(matches!(
            factory.calls().last(),
            Some(MenuCall::Popup { window_id: Some(1), .. })
        ));

        menu.close_popup(Some(1)).unwrap();
        assert!(matches!(factory.calls().last(), Some(MenuCall::ClosePopup { .. })));
    }

    #[test]
    fn test_application_menu_slot() {
        let (builder, factory) = builder();
        assert!(builder.get_application_menu().is_none());

        let first = builder.build_from_template(vec![item("a")]).unwrap();
        let second = builder.build_from_template(vec![item("b")]).unwrap();
        builder.set_application_menu(Some(first.clone())).unwrap();
        builder.set_application_menu(Some(second.clone())).unwrap();
        assert!(Rc::ptr_eq(&builder.get_application_menu().unwrap(), &second));

        builder.set_application_menu(None).unwrap();
        assert!(builder.get_application_menu().is_none());
        assert!(matches!(factory.calls().last(), Some(MenuCall::ClearApplicationMenu)));
    }

    #[test]
    fn test_execute_command_checkbox_and_click() {
        let (builder, factory) = builder();
        let clicks = Rc::new(Cell::new(0));
        let clicks_in = clicks.clone();
        let menu = builder
            .build_from_template(vec![item("wrap")
                .with_type(MenuItemType::Checkbox)
                .on_click(move |item, window| {
                    assert_eq!(window, Some(2));
                    assert!(item.checked());
                    clicks_in.set(clicks_in.get() + 1);
                    Ok(())
                })])
            .unwrap();

        let events = Rc::new(Cell::new(0));
        let events_in = events.clone();
        menu.on("click", move |click| {
            assert_eq!(click.item.id.as_deref(), Some("wrap"));
            events_in.set(events_in.get() + 1);
            Ok(())
        });

        let wrap = menu.get_menu_item_by_id("wrap").unwrap();
        assert!(menu.execute_command(wrap.command_id, Some(2)).unwrap());
        assert!(wrap.checked());
        assert_eq!(clicks.get(), 1);
        assert_eq!(events.get(), 1);
        assert!(matches!(
            factory.calls().last(),
            Some(MenuCall::SetChecked { checked: true, .. })
        ));

        assert!(!menu.execute_command(9999, None).unwrap());
    }

    #[test]
    fn test_radio_groups_are_exclusive() {
        let (builder, _factory) = builder();
        let radio = |id: &str| item(id).with_type(MenuItemType::Radio);
        let menu = builder
            .build_from_template(vec![
                radio("small"),
                radio("large"),
                MenuItemOptions::separator(),
                radio("light"),
                radio("dark"),
            ])
            .unwrap();

        let get = |id: &str| menu.get_menu_item_by_id(id).unwrap();
        menu.execute_command(get("small").command_id, None).unwrap();
        menu.execute_command(get("dark").command_id, None).unwrap();
        menu.execute_command(get("large").command_id, None).unwrap();

        assert!(!get("small").checked());
        assert!(get("large").checked());
        assert!(!get("light").checked());
        assert!(get("dark").checked());
    }

    #[test]
    fn test_commands_reach_submenu_items() {
        let (builder, _factory) = builder();
        let menu = builder
            .build_from_template(vec![MenuItemOptions::new("View").with_submenu(vec![
                item("zoom").with_type(MenuItemType::Checkbox),
            ])])
            .unwrap();
        let zoom = menu.get_menu_item_by_id("zoom").unwrap();
        let seen = Rc::new(Cell::new(false));
        let seen_in = seen.clone();
        menu.on("click", move |_| {
            seen_in.set(true);
            Ok(())
        });

        assert!(menu.execute_command(zoom.command_id, None).unwrap());
        assert!(zoom.checked());
        assert!(seen.get());
    }
}
