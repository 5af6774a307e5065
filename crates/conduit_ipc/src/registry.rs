//! Process-local channel registry.
//!
//! Maps channel names to ordered listener lists. Delivery is synchronous and
//! follows registration order. Listener failures are returned from
//! [`ChannelRegistry::emit`] untouched; the registry never swallows them.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Listener ceiling applied to a fresh registry. `0` means unbounded.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Handle returned by `on`/`once`, used to remove that registration later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Persistent,
    Once,
}

type Callback<E> = Rc<dyn Fn(&E) -> anyhow::Result<()>>;

struct Entry<E> {
    id: ListenerId,
    mode: Mode,
    callback: Callback<E>,
}

/// Publish/subscribe table keyed by channel name.
///
/// `E` is the event value handed to every listener of an emission.
pub struct ChannelRegistry<E> {
    channels: RefCell<BTreeMap<String, Vec<Entry<E>>>>,
    next_id: Cell<u64>,
    max_listeners: Cell<usize>,
}

impl<E> Default for ChannelRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ChannelRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.borrow();
        let counts: BTreeMap<&str, usize> = channels
            .iter()
            .map(|(name, entries)| (name.as_str(), entries.len()))
            .collect();
        f.debug_struct("ChannelRegistry")
            .field("channels", &counts)
            .field("max_listeners", &self.max_listeners.get())
            .finish()
    }
}

impl<E> ChannelRegistry<E> {
    pub fn new() -> Self {
        Self {
            channels: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
            max_listeners: Cell::new(DEFAULT_MAX_LISTENERS),
        }
    }

    /// Register a persistent listener. Registering the same closure twice
    /// delivers twice.
    pub fn on<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&E) -> anyhow::Result<()> + 'static,
    {
        self.add(channel.into(), Mode::Persistent, Rc::new(listener))
    }

    /// Register a listener that fires at most once.
    pub fn once<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&E) -> anyhow::Result<()> + 'static,
    {
        self.add(channel.into(), Mode::Once, Rc::new(listener))
    }

    fn add(&self, channel: String, mode: Mode, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.next_id.get() + 1);
        self.next_id.set(id.0);

        let mut channels = self.channels.borrow_mut();
        let entries = channels.entry(channel.clone()).or_default();
        entries.push(Entry { id, mode, callback });

        let max = self.max_listeners.get();
        if max > 0 && entries.len() == max + 1 {
            tracing::warn!(
                channel = %channel,
                count = entries.len(),
                max,
                "Possible listener leak: listener ceiling exceeded"
            );
        }
        id
    }

    /// Remove one registration. Unknown ids are a no-op.
    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        let mut channels = self.channels.borrow_mut();
        let Some(entries) = channels.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Remove every listener of `channel`, or of every channel when `None`.
    pub fn remove_all_listeners(&self, channel: Option<&str>) {
        let mut channels = self.channels.borrow_mut();
        match channel {
            Some(name) => {
                channels.remove(name);
            }
            None => channels.clear(),
        }
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .borrow()
            .get(channel)
            .map_or(0, |entries| entries.len())
    }

    /// Channels that currently have at least one listener.
    pub fn event_names(&self) -> Vec<String> {
        self.channels.borrow().keys().cloned().collect()
    }

    /// Set the leak-warning ceiling. `0` disables the warning.
    pub fn set_max_listeners(&self, max: usize) {
        self.max_listeners.set(max);
    }

    pub fn max_listeners(&self) -> usize {
        self.max_listeners.get()
    }

    /// Deliver `event` to every listener of `channel` in registration order.
    ///
    /// Returns `Ok(false)` when the channel has no listeners. Each
    /// once-listener is deregistered right before it runs, and skipped if a
    /// nested emission or an explicit removal got to it first. The first
    /// listener failure stops delivery and is returned to the caller; once-
    /// listeners after it stay registered.
    pub fn emit(&self, channel: &str, event: &E) -> anyhow::Result<bool> {
        let snapshot: Vec<(ListenerId, Mode, Callback<E>)> = match self.channels.borrow().get(channel) {
            Some(entries) => entries
                .iter()
                .map(|e| (e.id, e.mode, e.callback.clone()))
                .collect(),
            None => return Ok(false),
        };

        for (id, mode, callback) in snapshot {
            if mode == Mode::Once && !self.remove_listener(channel, id) {
                continue;
            }
            callback(event)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Weak;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&'static str) -> Callback<u32>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_for = log.clone();
        let make = move |tag: &'static str| -> Callback<u32> {
            let log = log_for.clone();
            Rc::new(move |value: &u32| {
                log.borrow_mut().push(format!("{tag}:{value}"));
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_delivery_follows_registration_order() {
        let registry = ChannelRegistry::<u32>::new();
        let (log, make) = recorder();
        let a = make("a");
        let b = make("b");
        registry.on("tick", move |v| a(v));
        registry.on("tick", move |v| b(v));

        assert!(registry.emit("tick", &1).unwrap());
        assert_eq!(*log.borrow(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_duplicate_registration_delivers_twice() {
        let registry = ChannelRegistry::<u32>::new();
        let hits = Rc::new(Cell::new(0));
        for _ in 0..2 {
            let hits = hits.clone();
            registry.on("dup", move |_| {
                hits.set(hits.get() + 1);
                Ok(())
            });
        }
        registry.emit("dup", &0).unwrap();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_emit_without_listeners_is_silent() {
        let registry = ChannelRegistry::<u32>::new();
        assert!(!registry.emit("error", &0).unwrap());
        assert!(!registry.emit("nobody", &7).unwrap());
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let registry = ChannelRegistry::<u32>::new();
        let hits = Rc::new(Cell::new(0));
        let hits_in = hits.clone();
        registry.once("ready", move |_| {
            hits_in.set(hits_in.get() + 1);
            Ok(())
        });

        for i in 0..5 {
            registry.emit("ready", &i).unwrap();
        }
        assert_eq!(hits.get(), 1);
        assert_eq!(registry.listener_count("ready"), 0);
    }

    #[test]
    fn test_once_survives_reentrant_emission() {
        let registry = Rc::new(ChannelRegistry::<u32>::new());
        let hits = Rc::new(Cell::new(0));

        let weak: Weak<ChannelRegistry<u32>> = Rc::downgrade(&registry);
        let hits_in = hits.clone();
        registry.once("loop", move |depth| {
            hits_in.set(hits_in.get() + 1);
            if let Some(registry) = weak.upgrade() {
                if *depth < 3 {
                    registry.emit("loop", &(depth + 1))?;
                }
            }
            Ok(())
        });

        registry.emit("loop", &0).unwrap();
        registry.emit("loop", &0).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_listener_added_during_emit_waits_for_next_emit() {
        let registry = Rc::new(ChannelRegistry::<u32>::new());
        let late_hits = Rc::new(Cell::new(0));

        let weak = Rc::downgrade(&registry);
        let late = late_hits.clone();
        registry.once("grow", move |_| {
            let late = late.clone();
            if let Some(registry) = weak.upgrade() {
                registry.on("grow", move |_| {
                    late.set(late.get() + 1);
                    Ok(())
                });
            }
            Ok(())
        });

        registry.emit("grow", &0).unwrap();
        assert_eq!(late_hits.get(), 0);
        registry.emit("grow", &0).unwrap();
        assert_eq!(late_hits.get(), 1);
    }

    #[test]
    fn test_remove_listener_is_idempotent() {
        let registry = ChannelRegistry::<u32>::new();
        let id = registry.on("x", |_| Ok(()));
        assert!(registry.remove_listener("x", id));
        assert!(!registry.remove_listener("x", id));
        assert!(!registry.remove_listener("never", id));
        assert!(registry.event_names().is_empty());
    }

    #[test]
    fn test_remove_only_targets_one_registration() {
        let registry = ChannelRegistry::<u32>::new();
        let (log, make) = recorder();
        let a = make("a");
        let b = make("b");
        let first = registry.on("x", move |v| a(v));
        registry.on("x", move |v| b(v));

        registry.remove_listener("x", first);
        registry.emit("x", &2).unwrap();
        assert_eq!(*log.borrow(), vec!["b:2"]);
    }

    #[test]
    fn test_listener_failure_propagates_and_stops_delivery() {
        let registry = ChannelRegistry::<u32>::new();
        let reached = Rc::new(Cell::new(false));
        registry.on("boom", |_| Err(anyhow::anyhow!("listener failed")));
        let reached_in = reached.clone();
        registry.on("boom", move |_| {
            reached_in.set(true);
            Ok(())
        });

        let err = registry.emit("boom", &0).unwrap_err();
        assert_eq!(err.to_string(), "listener failed");
        assert!(!reached.get());
    }

    #[test]
    fn test_once_after_failing_listener_stays_registered() {
        let registry = ChannelRegistry::<u32>::new();
        let hits = Rc::new(Cell::new(0));
        let failing = registry.on("c", |_| Err(anyhow::anyhow!("listener failed")));
        let hits_in = hits.clone();
        registry.once("c", move |_| {
            hits_in.set(hits_in.get() + 1);
            Ok(())
        });

        assert!(registry.emit("c", &0).is_err());
        assert_eq!(hits.get(), 0);
        assert_eq!(registry.listener_count("c"), 2);

        registry.remove_listener("c", failing);
        for i in 0..3 {
            registry.emit("c", &i).unwrap();
        }
        assert_eq!(hits.get(), 1);
        assert_eq!(registry.listener_count("c"), 0);
    }

    #[test]
    fn test_once_fires_once_when_earlier_listener_reemits() {
        let registry = Rc::new(ChannelRegistry::<u32>::new());
        let hits = Rc::new(Cell::new(0));

        let weak = Rc::downgrade(&registry);
        registry.on("echo", move |depth| {
            if let Some(registry) = weak.upgrade() {
                if *depth == 0 {
                    registry.emit("echo", &1)?;
                }
            }
            Ok(())
        });
        let hits_in = hits.clone();
        registry.once("echo", move |_| {
            hits_in.set(hits_in.get() + 1);
            Ok(())
        });

        registry.emit("echo", &0).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_remove_all_listeners() {
        let registry = ChannelRegistry::<u32>::new();
        registry.on("a", |_| Ok(()));
        registry.on("b", |_| Ok(()));
        registry.remove_all_listeners(Some("a"));
        assert_eq!(registry.event_names(), vec!["b".to_string()]);
        registry.remove_all_listeners(None);
        assert!(registry.event_names().is_empty());
    }

    #[test]
    fn test_max_listeners_does_not_limit_registration() {
        let registry = ChannelRegistry::<u32>::new();
        assert_eq!(registry.max_listeners(), DEFAULT_MAX_LISTENERS);
        for _ in 0..(DEFAULT_MAX_LISTENERS + 5) {
            registry.on("crowded", |_| Ok(()));
        }
        assert_eq!(registry.listener_count("crowded"), DEFAULT_MAX_LISTENERS + 5);

        registry.set_max_listeners(0);
        assert_eq!(registry.max_listeners(), 0);
    }
}
