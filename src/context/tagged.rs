//! Settings keyed by configuration tag, and the reference graph between tags.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::setting::{ContextSetting, RegistrationKind};
use crate::error::{Error, Result};

/// Ordered `tag -> setting` map.
///
/// Ids are unique per registration kind across all tags.
#[derive(Debug, Clone, Default)]
pub struct TaggedSettings {
    tags: Vec<(String, Arc<ContextSetting>)>,
}

impl TaggedSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the setting of `tag`.
    ///
    /// Fails with [`Error::ConfigurationConflict`] when another tag already
    /// registers one of its ids; nothing is changed in that case.
    pub fn put(&mut self, tag: &str, setting: ContextSetting) -> Result<()> {
        let mut seen = FxHashSet::default();
        for (kind, id) in setting.ids() {
            if !seen.insert((kind, id)) {
                return Err(Error::ConfigurationConflict(format!(
                    "{} `{}` registered twice in tag `{}`",
                    kind.name(),
                    id,
                    tag
                )));
            }
            if let Some(owner) = self.owner(kind, id)
                && owner != tag
            {
                return Err(Error::ConfigurationConflict(format!(
                    "{} `{}` of tag `{}` is already registered by tag `{}`",
                    kind.name(),
                    id,
                    tag,
                    owner
                )));
            }
        }

        let setting = Arc::new(setting);
        match self.tags.iter_mut().find(|(t, _)| t == tag) {
            Some((_, slot)) => *slot = setting,
            None => self.tags.push((tag.to_string(), setting)),
        }
        Ok(())
    }

    pub fn remove(&mut self, tag: &str) -> Option<Arc<ContextSetting>> {
        let index = self.tags.iter().position(|(t, _)| t == tag)?;
        Some(self.tags.remove(index).1)
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<ContextSetting>> {
        self.tags.iter().find(|(t, _)| t == tag).map(|(_, s)| s)
    }

    /// Tags in registration order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|(t, _)| t.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<ContextSetting>)> {
        self.tags.iter().map(|(t, s)| (t.as_str(), s))
    }

    /// Tag registering `id` as `kind`.
    pub fn owner(&self, kind: RegistrationKind, id: &str) -> Option<&str> {
        self.iter()
            .find(|(_, s)| s.has(kind, id))
            .map(|(t, _)| t)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Tags that transitively reference `tag`, breadth first.
    ///
    /// Each tag is visited once, so reference cycles end the walk.
    pub fn dependents(&self, tag: &str) -> Vec<String> {
        self.dependents_of(tag, None)
    }

    /// Same walk, starting from a setting that may no longer be registered.
    pub(crate) fn dependents_of(&self, tag: &str, removed: Option<&ContextSetting>) -> Vec<String> {
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        visited.insert(tag);
        let mut queue: VecDeque<&ContextSetting> = VecDeque::new();
        match removed {
            Some(setting) => queue.push_back(setting),
            None => queue.extend(self.get(tag).map(Arc::as_ref)),
        }

        let mut out = Vec::new();
        while let Some(changed) = queue.pop_front() {
            for (other, setting) in self.iter() {
                if visited.contains(other) || !setting.references(changed) {
                    continue;
                }
                visited.insert(other);
                out.push(other.to_string());
                queue.push_back(setting);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HeapRegistration, StoreRegistration, WorkflowRegistration};
    use crate::store::MemoryStore;

    fn store() -> StoreRegistration {
        StoreRegistration::new(Arc::new(MemoryStore::in_memory("mem")))
    }

    fn chain() -> TaggedSettings {
        let mut settings = TaggedSettings::new();
        settings.put("x", ContextSetting::new().store("s", store())).unwrap();
        settings
            .put("y", ContextSetting::new().heap("g", HeapRegistration::new("s", ["a.js"])))
            .unwrap();
        settings
            .put("z", ContextSetting::new().workflow("w", WorkflowRegistration::new("w-", "g")))
            .unwrap();
        settings
    }

    #[test]
    fn test_duplicate_id_across_tags_rejected() {
        let mut settings = chain();
        let err = settings
            .put("other", ContextSetting::new().store("s", store()))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));
        assert!(settings.get("other").is_none());
    }

    #[test]
    fn test_same_tag_replaces() {
        let mut settings = chain();
        settings.put("x", ContextSetting::new().store("s", store())).unwrap();
        assert_eq!(settings.tags().collect::<Vec<_>>(), vec!["x", "y", "z"]);

        // ids of the replaced setting are free again
        settings.put("x", ContextSetting::new()).unwrap();
        settings.put("w", ContextSetting::new().store("s", store())).unwrap();
    }

    #[test]
    fn test_same_id_different_kind_allowed() {
        let mut settings = chain();
        settings
            .put("other", ContextSetting::new().heap("s", HeapRegistration::new("s", ["b.js"])))
            .unwrap();
    }

    #[test]
    fn test_dependents_transitive() {
        let settings = chain();
        assert_eq!(settings.dependents("x"), vec!["y", "z"]);
        assert_eq!(settings.dependents("y"), vec!["z"]);
        assert!(settings.dependents("z").is_empty());
    }

    #[test]
    fn test_dependents_cycle_terminates() {
        let mut settings = TaggedSettings::new();
        settings
            .put(
                "a",
                ContextSetting::new().heap("ha", HeapRegistration::composite(["hb"])),
            )
            .unwrap();
        settings
            .put(
                "b",
                ContextSetting::new().heap("hb", HeapRegistration::composite(["ha"])),
            )
            .unwrap();
        assert_eq!(settings.dependents("a"), vec!["b"]);
        assert_eq!(settings.dependents("b"), vec!["a"]);
    }

    #[test]
    fn test_dependents_of_removed_setting() {
        let mut settings = chain();
        let removed = settings.remove("x").unwrap();
        assert_eq!(settings.dependents_of("x", Some(&removed)), vec!["y", "z"]);
    }
}
