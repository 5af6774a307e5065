//! Desktop backends for the native seams, enabled by the `native` feature.
//!
//! Menus go through `muda` and dialogs through `rfd`. Neither backend owns
//! an event loop; the embedder drives its own and forwards menu activations
//! with [`drain_menu_events`].

mod muda_menu;
mod rfd_dialog;

pub use muda_menu::{drain_menu_events, MudaMenu, MudaMenuFactory, WindowHandleResolver};
pub use rfd_dialog::RfdDialogs;
