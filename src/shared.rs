use bevy::utils::HashMap;
use std::{
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Locks the shared state.
///
/// A poisoned lock is recovered, the state of the terrain data stays consistent between
/// the operations guarded by it.
pub fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out shared state by key, creating it on first use.
///
/// Everyone asking for the same key receives the same instance.
pub struct SharedStates<K, T> {
    states: HashMap<K, Arc<Mutex<T>>>,
}

impl<K, T> Default for SharedStates<K, T> {
    fn default() -> Self {
        Self {
            states: HashMap::default(),
        }
    }
}

impl<K: Eq + Hash, T> SharedStates<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<Arc<Mutex<T>>> {
        self.states.get(key).cloned()
    }

    /// Returns the state of the key, creating it first if necessary.
    ///
    /// Nothing is inserted if the creation fails.
    pub fn try_get_or_insert_with<E>(
        &mut self,
        key: K,
        create: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<Mutex<T>>, E> {
        if let Some(state) = self.states.get(&key) {
            return Ok(state.clone());
        }

        let state = Arc::new(Mutex::new(create()?));
        self.states.insert(key, state.clone());

        Ok(state)
    }

    /// Drops the states nobody but this collection holds on to.
    ///
    /// Returns the number of removed states.
    pub fn remove_unused(&mut self) -> usize {
        let count = self.states.len();
        self.states.retain(|_, state| Arc::strong_count(state) > 1);
        count - self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert<K: Eq + Hash, T>(states: &mut SharedStates<K, T>, key: K, value: T) -> Arc<Mutex<T>> {
        states.try_get_or_insert_with(key, || Ok::<_, ()>(value)).unwrap()
    }

    #[test]
    fn states_are_shared_by_key() {
        let mut states = SharedStates::<String, Vec<u32>>::new();

        let first = insert(&mut states, "dem".into(), Vec::new());
        lock(&first).push(1);

        let second = insert(&mut states, "dem".into(), vec![7]);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*lock(&second), vec![1]);

        let other = insert(&mut states, "ortho".into(), vec![7]);
        assert_eq!(*lock(&other), vec![7]);
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn failed_creation_inserts_nothing() {
        let mut states = SharedStates::<u32, u32>::new();

        assert_eq!(states.try_get_or_insert_with(0, || Err("missing")).err(), Some("missing"));
        assert!(states.is_empty());

        let state = states.try_get_or_insert_with(0, || Ok::<_, ()>(3)).unwrap();
        assert_eq!(*lock(&state), 3);
    }

    #[test]
    fn unused_states_are_removed() {
        let mut states = SharedStates::<u32, u32>::new();

        let kept = insert(&mut states, 0, 0);
        insert(&mut states, 1, 1);

        assert_eq!(states.remove_unused(), 1);
        assert!(states.get(&0).is_some());
        assert!(states.get(&1).is_none());

        drop(kept);
        assert_eq!(states.remove_unused(), 1);
    }

    #[test]
    fn poisoned_states_stay_accessible() {
        let state = Arc::new(Mutex::new(5));
        let poisoned = state.clone();

        let _ = std::thread::spawn(move || {
            let _guard = poisoned.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(state.is_poisoned());
        assert_eq!(*lock(&state), 5);
    }
}
