use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{StoreError, read_json, write_json};

/// On-disk shape: `{ "Data": <global>, "ServerData": { "<server id>": <per server> } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "G: Serialize, S: Serialize",
    deserialize = "G: Deserialize<'de> + Default, S: Deserialize<'de>"
))]
pub struct StoreData<G, S> {
    #[serde(rename = "Data", default)]
    pub data: G,

    #[serde(rename = "ServerData", default)]
    pub server_data: BTreeMap<String, S>,
}

impl<G: Default, S> Default for StoreData<G, S> {
    fn default() -> Self {
        Self {
            data: G::default(),
            server_data: BTreeMap::new(),
        }
    }
}

/// One global value and a server-id keyed map behind a single mutex.
///
/// Reads and writes share the same exclusive section: callers read-modify-write
/// entries, so there is no reader/writer split.
#[derive(Debug)]
pub struct PersistentKeyedStore<G, S> {
    inner: Mutex<StoreData<G, S>>,
}

impl<G: Default, S> Default for PersistentKeyedStore<G, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Default, S> PersistentKeyedStore<G, S> {
    pub fn new() -> Self {
        Self::from_data(StoreData::default())
    }

    pub fn from_data(data: StoreData<G, S>) -> Self {
        Self {
            inner: Mutex::new(data),
        }
    }

    /// Enters the exclusive section. Dropping the guard leaves it.
    pub fn acquire(&self) -> StoreGuard<'_, G, S> {
        StoreGuard {
            data: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Runs `f` inside the exclusive section.
    pub fn with_exclusive<R>(&self, f: impl FnOnce(&mut StoreGuard<'_, G, S>) -> R) -> R {
        let mut guard = self.acquire();
        f(&mut guard)
    }

    pub fn snapshot(&self) -> StoreData<G, S>
    where
        G: Clone,
        S: Clone,
    {
        self.acquire().data.clone()
    }
}

impl<G, S> PersistentKeyedStore<G, S>
where
    G: Serialize + DeserializeOwned + Default,
    S: Serialize + DeserializeOwned,
{
    /// Builds a store from `path`, zero-initialised when the file is missing or
    /// unreadable. Never fails.
    pub fn open(path: &Path) -> Self {
        let store = Self::new();
        if let Err(err) = store.load(path) {
            warn!("Failed to load {}, starting empty: {}", path.display(), err);
        }
        store
    }

    /// Replaces the whole content with the file's. A missing file resets to the
    /// zero value; a malformed one also resets and reports the error.
    pub fn load(&self, path: &Path) -> Result<(), StoreError> {
        debug!("Loading store from {}", path.display());

        let loaded = read_json::<StoreData<G, S>>(path);
        let mut guard = self.acquire();
        match loaded {
            Ok(Some(data)) => {
                *guard.data = data;
                Ok(())
            }
            Ok(None) => {
                *guard.data = StoreData::default();
                Ok(())
            }
            Err(err) => {
                *guard.data = StoreData::default();
                Err(err)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        self.acquire().save(path)
    }
}

/// Exclusive access to a [`PersistentKeyedStore`].
pub struct StoreGuard<'a, G, S> {
    data: MutexGuard<'a, StoreData<G, S>>,
}

impl<G, S> StoreGuard<'_, G, S> {
    pub fn global(&self) -> &G {
        &self.data.data
    }

    pub fn global_mut(&mut self) -> &mut G {
        &mut self.data.data
    }

    pub fn get(&self, id: &str) -> Option<&S> {
        self.data.server_data.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut S> {
        self.data.server_data.get_mut(id)
    }

    pub fn get_or_default(&self, id: &str) -> S
    where
        S: Clone + Default,
    {
        self.get(id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.server_data.contains_key(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, value: S) -> Option<S> {
        self.data.server_data.insert(id.into(), value)
    }

    /// Returns the entry for `id`, inserting `S::default()` first if absent.
    pub fn ensure(&mut self, id: &str) -> &mut S
    where
        S: Default,
    {
        self.data.server_data.entry(id.to_string()).or_default()
    }

    pub fn remove(&mut self, id: &str) -> Option<S> {
        self.data.server_data.remove(id)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &mut S) -> bool) {
        self.data.server_data.retain(|id, value| keep(id, value));
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.server_data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.server_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.server_data.is_empty()
    }

    /// Writes the guarded content to `path` without leaving the section.
    pub fn save(&self, path: &Path) -> Result<(), StoreError>
    where
        G: Serialize,
        S: Serialize,
    {
        debug!("Saving store to {}", path.display());
        write_json(path, &*self.data)
    }
}
