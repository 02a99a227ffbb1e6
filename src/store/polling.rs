//! Watch registry and polling rounds shared by store implementations.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{ListenerAction, PollDecision, StoreListener, same_listener};
use crate::debug;

struct Watch {
    listener: Arc<dyn StoreListener>,
    /// Last timestamp seen per path (`None` if it couldn't be read).
    stamps: FxHashMap<String, Option<u64>>,
}

/// Listeners and the timestamps they were registered with.
#[derive(Default)]
pub(crate) struct Watches {
    entries: Mutex<Vec<Watch>>,
}

impl Watches {
    pub fn add(&self, path: &str, listener: Arc<dyn StoreListener>, stamp: Option<u64>) {
        let mut entries = self.entries.lock();
        match entries
            .iter_mut()
            .find(|w| same_listener(&w.listener, &listener))
        {
            Some(watch) => {
                watch.stamps.entry(path.to_string()).or_insert(stamp);
            }
            None => {
                let mut stamps = FxHashMap::default();
                stamps.insert(path.to_string(), stamp);
                entries.push(Watch { listener, stamps });
            }
        }
    }

    pub fn remove(&self, listener: &Arc<dyn StoreListener>) {
        self.entries
            .lock()
            .retain(|w| !same_listener(&w.listener, listener));
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// One polling round.
    ///
    /// Every listener whose paths changed is notified before this returns.
    /// Listeners are called without holding the registry lock so they may
    /// unwatch or free the store.
    pub fn poll(&self, store: &str, last_modified: impl Fn(&str) -> Option<u64>) {
        let snapshot: Vec<(Arc<dyn StoreListener>, Vec<(String, Option<u64>)>)> = self
            .entries
            .lock()
            .iter()
            .map(|w| {
                let mut paths: Vec<_> = w.stamps.iter().map(|(p, s)| (p.clone(), *s)).collect();
                paths.sort();
                (Arc::clone(&w.listener), paths)
            })
            .collect();

        let mut disposed = Vec::new();
        let mut updates: Vec<(Arc<dyn StoreListener>, String, Option<u64>)> = Vec::new();

        for (listener, paths) in snapshot {
            let names: Vec<String> = paths.iter().map(|(p, _)| p.clone()).collect();
            if listener.polling(&names) == PollDecision::Skip {
                continue;
            }

            let changed = paths.into_iter().find_map(|(path, seen)| {
                let now = last_modified(&path);
                (now != seen).then_some((path, now))
            });

            if let Some((path, now)) = changed {
                debug!("poll"; "{} changed in store {}", path, store);
                match listener.nut_updated(&path) {
                    ListenerAction::Keep => updates.push((listener, path, now)),
                    ListenerAction::Dispose => disposed.push(listener),
                }
            }
        }

        let mut entries = self.entries.lock();
        for (listener, path, now) in updates {
            if let Some(watch) = entries
                .iter_mut()
                .find(|w| same_listener(&w.listener, &listener))
            {
                watch.stamps.insert(path, now);
            }
        }
        entries.retain(|w| !disposed.iter().any(|d| same_listener(d, &w.listener)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct Counting {
        hits: AtomicUsize,
        action: ListenerAction,
        decision: PollDecision,
    }

    impl Counting {
        fn new(action: ListenerAction, decision: PollDecision) -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
                action,
                decision,
            })
        }
    }

    impl StoreListener for Counting {
        fn polling(&self, _paths: &[String]) -> PollDecision {
            self.decision
        }

        fn nut_updated(&self, _path: &str) -> ListenerAction {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.action
        }
    }

    #[test]
    fn test_no_change_is_noop() {
        let watches = Watches::default();
        let l = Counting::new(ListenerAction::Keep, PollDecision::Poll);
        watches.add("a.js", l.clone(), Some(1));
        watches.poll("mem", |_| Some(1));
        assert_eq!(l.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_change_notified_once_per_stamp() {
        let stamp = AtomicU64::new(1);
        let watches = Watches::default();
        let l = Counting::new(ListenerAction::Keep, PollDecision::Poll);
        watches.add("a.js", l.clone(), Some(1));

        stamp.store(2, Ordering::SeqCst);
        watches.poll("mem", |_| Some(stamp.load(Ordering::SeqCst)));
        watches.poll("mem", |_| Some(stamp.load(Ordering::SeqCst)));
        assert_eq!(l.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposable_listener_removed() {
        let watches = Watches::default();
        let l = Counting::new(ListenerAction::Dispose, PollDecision::Poll);
        watches.add("a.js", l.clone(), Some(1));
        watches.poll("mem", |_| Some(2));
        assert!(watches.is_empty());
        watches.poll("mem", |_| Some(3));
        assert_eq!(l.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_skipped_listener_stays_registered() {
        let watches = Watches::default();
        let l = Counting::new(ListenerAction::Keep, PollDecision::Skip);
        watches.add("a.js", l.clone(), Some(1));
        watches.poll("mem", |_| Some(2));
        assert_eq!(l.hits.load(Ordering::SeqCst), 0);
        assert!(!watches.is_empty());
    }

    #[test]
    fn test_remove() {
        let watches = Watches::default();
        let l: Arc<dyn StoreListener> = Counting::new(ListenerAction::Keep, PollDecision::Poll);
        watches.add("a.js", Arc::clone(&l), Some(1));
        watches.add("b.js", Arc::clone(&l), Some(1));
        watches.remove(&l);
        assert!(watches.is_empty());
    }
}
