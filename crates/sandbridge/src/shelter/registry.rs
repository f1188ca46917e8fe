use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use crate::{
    error::{Error, Result},
    protocol::Handle,
};

/// Identifies a shelter. Ids grow monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShelterId(u64);

impl ShelterId {
    /// The session-wide shelter that exists for the session's lifetime.
    pub const DEFAULT: Self = Self(0);

    #[must_use]
    pub const fn is_default(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ShelterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("default")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One membership of a handle in a shelter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ProxyId(u64);

#[derive(Debug, Default)]
struct Entry {
    /// Ordered by creation.
    members: BTreeMap<ProxyId, Handle>,
    parent: Option<ShelterId>,
    children: Vec<ShelterId>,
}

/// Host-side membership bookkeeping.
///
/// A handle stays protected while its total membership across shelters is
/// positive. Operations that drop a count to zero return the handle so the
/// caller can tell the sandbox; the registry itself never frees anything.
#[derive(Debug)]
pub(crate) struct Registry {
    next_shelter: u64,
    next_proxy: u64,
    shelters: HashMap<ShelterId, Entry>,
    counts: HashMap<Handle, usize>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        let mut shelters = HashMap::new();
        shelters.insert(ShelterId::DEFAULT, Entry::default());
        Self {
            next_shelter: 1,
            next_proxy: 1,
            shelters,
            counts: HashMap::new(),
        }
    }

    pub(crate) fn contains_shelter(&self, shelter: ShelterId) -> bool {
        self.shelters.contains_key(&shelter)
    }

    pub(crate) fn create_shelter(&mut self, parent: Option<ShelterId>) -> Result<ShelterId> {
        if let Some(parent) = parent {
            if !self.contains_shelter(parent) {
                return Err(Error::UnknownShelter(parent));
            }
        }
        let id = ShelterId(self.next_shelter);
        self.next_shelter += 1;
        self.shelters.insert(
            id,
            Entry {
                parent,
                ..Entry::default()
            },
        );
        if let Some(entry) = parent.and_then(|p| self.shelters.get_mut(&p)) {
            entry.children.push(id);
        }
        Ok(id)
    }

    pub(crate) fn create_proxy(&mut self, handle: Handle, shelter: ShelterId) -> Result<ProxyId> {
        let entry = self
            .shelters
            .get_mut(&shelter)
            .ok_or(Error::UnknownShelter(shelter))?;
        let id = ProxyId(self.next_proxy);
        self.next_proxy += 1;
        entry.members.insert(id, handle);
        *self.counts.entry(handle).or_default() += 1;
        Ok(id)
    }

    /// Drop every membership held by `shelter` and its descendants.
    ///
    /// The shelters stay usable. Returns the handles whose membership
    /// reached zero, in membership order.
    pub(crate) fn purge(&mut self, shelter: ShelterId) -> Result<Vec<Handle>> {
        if !self.contains_shelter(shelter) {
            return Err(Error::UnknownShelter(shelter));
        }
        let mut released = Vec::new();
        self.purge_into(shelter, &mut released);
        Ok(released)
    }

    fn purge_into(&mut self, shelter: ShelterId, released: &mut Vec<Handle>) {
        let Some(entry) = self.shelters.get_mut(&shelter) else {
            return;
        };
        let children = entry.children.clone();
        let members = std::mem::take(&mut entry.members);
        for child in children {
            self.purge_into(child, released);
        }
        for handle in members.into_values() {
            if self.decrement(handle) {
                released.push(handle);
            }
        }
    }

    /// Purge `shelter` and forget it along with its descendants.
    ///
    /// The default shelter is purged but never removed.
    pub(crate) fn remove_shelter(&mut self, shelter: ShelterId) -> Vec<Handle> {
        let mut released = Vec::new();
        self.purge_into(shelter, &mut released);
        if !shelter.is_default() {
            self.forget(shelter);
        }
        released
    }

    fn forget(&mut self, shelter: ShelterId) {
        let Some(entry) = self.shelters.remove(&shelter) else {
            return;
        };
        for child in entry.children {
            self.forget(child);
        }
        if let Some(parent) = entry.parent.and_then(|p| self.shelters.get_mut(&p)) {
            parent.children.retain(|c| *c != shelter);
        }
    }

    /// Drop one membership. Returns the handle if that was its last.
    pub(crate) fn destroy(&mut self, proxy: ProxyId, shelter: ShelterId) -> Option<Handle> {
        let handle = self.shelters.get_mut(&shelter)?.members.remove(&proxy)?;
        self.decrement(handle).then_some(handle)
    }

    fn decrement(&mut self, handle: Handle) -> bool {
        match self.counts.get_mut(&handle) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&handle);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_live(&self, proxy: ProxyId, shelter: ShelterId) -> bool {
        self.shelters
            .get(&shelter)
            .is_some_and(|entry| entry.members.contains_key(&proxy))
    }

    /// Total memberships of `handle` across all shelters.
    pub(crate) fn membership(&self, handle: Handle) -> usize {
        self.counts.get(&handle).copied().unwrap_or(0)
    }

    pub(crate) fn len(&self, shelter: ShelterId) -> Option<usize> {
        self.shelters.get(&shelter).map(|entry| entry.members.len())
    }

    pub(crate) fn handles(&self, shelter: ShelterId) -> Vec<Handle> {
        self.shelters
            .get(&shelter)
            .map(|entry| entry.members.values().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u64) -> Handle {
        Handle::new(raw)
    }

    #[test]
    fn purge_twice_equals_purge_once() {
        let mut registry = Registry::new();
        let shelter = registry.create_shelter(None).unwrap();
        registry.create_proxy(h(1), shelter).unwrap();
        registry.create_proxy(h(2), shelter).unwrap();

        assert_eq!(registry.purge(shelter).unwrap(), vec![h(1), h(2)]);
        assert_eq!(registry.membership(h(1)), 0);
        assert!(registry.purge(shelter).unwrap().is_empty());
        assert_eq!(registry.len(shelter), Some(0));
    }

    #[test]
    fn handle_shared_by_two_shelters_survives_one_purge() {
        let mut registry = Registry::new();
        let a = registry.create_shelter(None).unwrap();
        let b = registry.create_shelter(None).unwrap();
        let in_a = registry.create_proxy(h(7), a).unwrap();
        let in_b = registry.create_proxy(h(7), b).unwrap();
        assert_eq!(registry.membership(h(7)), 2);

        assert!(registry.purge(a).unwrap().is_empty());
        assert!(!registry.is_live(in_a, a));
        assert!(registry.is_live(in_b, b));
        assert_eq!(registry.membership(h(7)), 1);

        assert_eq!(registry.destroy(in_b, b), Some(h(7)));
        assert_eq!(registry.destroy(in_b, b), None);
    }

    #[test]
    fn purging_parent_purges_children_but_keeps_them() {
        let mut registry = Registry::new();
        let parent = registry.create_shelter(None).unwrap();
        let child = registry.create_shelter(Some(parent)).unwrap();
        registry.create_proxy(h(1), parent).unwrap();
        registry.create_proxy(h(2), child).unwrap();

        let released = registry.purge(parent).unwrap();
        assert_eq!(released, vec![h(2), h(1)]);
        assert!(registry.contains_shelter(child));
        registry.create_proxy(h(3), child).unwrap();
        assert_eq!(registry.len(child), Some(1));
    }

    #[test]
    fn removing_a_shelter_forgets_descendants() {
        let mut registry = Registry::new();
        let parent = registry.create_shelter(None).unwrap();
        let child = registry.create_shelter(Some(parent)).unwrap();
        registry.create_proxy(h(4), child).unwrap();

        assert_eq!(registry.remove_shelter(parent), vec![h(4)]);
        assert!(!registry.contains_shelter(parent));
        assert!(!registry.contains_shelter(child));
        assert!(matches!(
            registry.create_proxy(h(5), child),
            Err(Error::UnknownShelter(id)) if id == child
        ));
        assert!(registry.remove_shelter(child).is_empty());
    }

    #[test]
    fn default_shelter_is_purged_but_never_removed() {
        let mut registry = Registry::new();
        registry.create_proxy(h(9), ShelterId::DEFAULT).unwrap();
        assert_eq!(registry.remove_shelter(ShelterId::DEFAULT), vec![h(9)]);
        assert!(registry.contains_shelter(ShelterId::DEFAULT));
    }

    #[test]
    fn shelter_ids_are_monotonic() {
        let mut registry = Registry::new();
        let a = registry.create_shelter(None).unwrap();
        registry.remove_shelter(a);
        let b = registry.create_shelter(None).unwrap();
        assert!(b > a);
        assert!(registry.create_shelter(Some(a)).is_err());
    }
}
