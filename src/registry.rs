use dashmap::DashMap;

use crate::wheel::Timeout;

/// Concurrent map from task id to its live timeout handle.
///
/// One handle per id: installing under an existing id hands the displaced
/// handle back so the caller can cancel it.
#[derive(Default)]
pub struct HandleRegistry {
    handles: DashMap<String, Timeout>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        HandleRegistry::default()
    }

    /// Install `handle` under `id`, returning whatever it displaced.
    pub fn put(&self, id: &str, handle: Timeout) -> Option<Timeout> {
        self.handles.insert(id.to_string(), handle)
    }

    pub fn get(&self, id: &str) -> Option<Timeout> {
        self.handles.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Timeout> {
        self.handles.remove(id).map(|(_, handle)| handle)
    }

    /// Swap in `next` only while `id` still maps to `expected`. Returns
    /// `false` and leaves the map untouched when the entry is gone or was
    /// replaced concurrently.
    pub fn replace_if(&self, id: &str, expected: &Timeout, next: Timeout) -> bool {
        match self.handles.get_mut(id) {
            Some(mut entry) if entry.same_handle(expected) => {
                *entry = next;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Empty the registry, yielding every entry. Used at shutdown.
    pub fn drain(&self) -> Vec<(String, Timeout)> {
        let ids: Vec<String> = self.handles.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.handles.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wheel::{HashedWheelTimer, Timeout as WheelTimeout};
    use std::sync::Arc;
    use std::time::Duration;

    fn handle(timer: &HashedWheelTimer) -> WheelTimeout {
        timer
            .submit(Arc::new(|_: &WheelTimeout| {}), Duration::from_secs(60))
            .unwrap()
    }

    #[test]
    fn put_displaces_previous_handle() {
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 16);
        let registry = HandleRegistry::new();

        let first = handle(&timer);
        assert!(registry.put("job", first.clone()).is_none());
        let displaced = registry.put("job", handle(&timer)).unwrap();
        assert!(displaced.same_handle(&first));
        assert_eq!(registry.len(), 1);
        timer.shutdown();
    }

    #[test]
    fn replace_if_requires_identity() {
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 16);
        let registry = HandleRegistry::new();

        let installed = handle(&timer);
        registry.put("job", installed.clone());

        let stranger = handle(&timer);
        assert!(!registry.replace_if("job", &stranger, handle(&timer)));
        assert!(registry.get("job").unwrap().same_handle(&installed));

        let next = handle(&timer);
        assert!(registry.replace_if("job", &installed, next.clone()));
        assert!(registry.get("job").unwrap().same_handle(&next));

        registry.remove("job");
        assert!(!registry.replace_if("job", &next, handle(&timer)));
        assert!(registry.is_empty());
        timer.shutdown();
    }
}
