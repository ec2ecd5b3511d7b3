use std::{
    ops::{Deref, DerefMut},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, warn};
use serde::{Serialize, de::DeserializeOwned};

use crate::{StoreError, read_json, write_json};

/// A single value behind its own mutex, serialized to its file as-is.
#[derive(Debug, Default)]
pub struct PersistentValue<T> {
    inner: Mutex<T>,
}

impl<T> PersistentValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn acquire(&self) -> ValueGuard<'_, T> {
        ValueGuard {
            value: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn with_exclusive<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire();
        f(&mut guard)
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.acquire().clone()
    }
}

impl<T> PersistentValue<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Loads `path`, falling back to `T::default()` on any failure.
    pub fn open(path: &Path) -> Self {
        debug!("Loading {}", path.display());
        let value = match read_json::<T>(path) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(err) => {
                warn!("Failed to load {}, using defaults: {}", path.display(), err);
                T::default()
            }
        };
        Self::new(value)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        self.acquire().save(path)
    }
}

pub struct ValueGuard<'a, T> {
    value: MutexGuard<'a, T>,
}

impl<T> ValueGuard<'_, T> {
    pub fn save(&self, path: &Path) -> Result<(), StoreError>
    where
        T: Serialize,
    {
        debug!("Saving {}", path.display());
        write_json(path, &*self.value)
    }
}

impl<T> Deref for ValueGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for ValueGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
