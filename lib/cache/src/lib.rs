use std::{
  collections::{HashMap, HashSet},
  hash::Hash,
  sync::Arc,
};

use tokio::sync::RwLock;

/// Clone-on-read map behind an async RwLock.
/// Readers get an owned copy of the value,
/// so no lock is held while the caller works with it.
#[derive(Debug)]
pub struct CloneCache<K: PartialEq + Eq + Hash, T: Clone>(
  RwLock<HashMap<K, T>>,
);

impl<K: PartialEq + Eq + Hash, T: Clone> Default
  for CloneCache<K, T>
{
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone> CloneCache<K, T> {
  pub async fn get(&self, key: &K) -> Option<T> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn get_keys(&self) -> Vec<K> {
    let cache = self.0.read().await;
    cache.keys().cloned().collect()
  }

  pub async fn get_entries(&self) -> Vec<(K, T)> {
    let cache = self.0.read().await;
    cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
  }

  pub async fn insert<Key>(&self, key: Key, val: T) -> Option<T>
  where
    Key: Into<K>,
  {
    self.0.write().await.insert(key.into(), val)
  }

  pub async fn remove(&self, key: &K) -> Option<T> {
    self.0.write().await.remove(key)
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone + Default>
  CloneCache<K, T>
{
  pub async fn get_or_insert_default(&self, key: &K) -> T {
    let mut lock = self.0.write().await;
    match lock.get(key).cloned() {
      Some(item) => item,
      None => {
        let item: T = Default::default();
        lock.insert(key.clone(), item.clone());
        item
      }
    }
  }
}

/// Shared set guarded by an async RwLock, for cross-task
/// membership tracking (eg. services marked for forced
/// recreation, ids pending restart).
#[derive(Debug, Default)]
pub struct SharedSet<T: PartialEq + Eq + Hash + Clone>(
  RwLock<HashSet<T>>,
);

impl<T: PartialEq + Eq + Hash + Clone> SharedSet<T> {
  pub async fn insert(&self, val: T) -> bool {
    self.0.write().await.insert(val)
  }

  pub async fn remove(&self, val: &T) -> bool {
    self.0.write().await.remove(val)
  }

  pub async fn contains(&self, val: &T) -> bool {
    self.0.read().await.contains(val)
  }

  pub async fn to_vec(&self) -> Vec<T> {
    self.0.read().await.iter().cloned().collect()
  }
}

pub type ArcCache<K, T> = Arc<CloneCache<K, T>>;
