//! Partition-keyed registry of per-partition components.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use recon_core::PartitionId;

/// Explicit home for per-partition instances (pipelines, caches,
/// schedulers).
///
/// Instances are created when a partition comes up and dropped when it
/// is torn down; nothing is process-global.
pub struct PartitionRegistry<T> {
    entries: DashMap<PartitionId, Arc<T>>,
}

impl<T> PartitionRegistry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// The instance for `partition`, creating it with `create` if absent.
    ///
    /// `create` runs without any registry lock held, so it may itself
    /// use the registry. Two threads racing on a new partition may both
    /// run `create`; the first to register wins and every caller gets
    /// that instance.
    pub fn get_or_create(&self, partition: PartitionId, create: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.get(partition) {
            return existing;
        }
        let built = Arc::new(create());
        self.register(partition, built)
    }

    /// Like [`get_or_create`](Self::get_or_create) for fallible constructors.
    /// An error leaves the partition unregistered.
    pub fn try_get_or_create<E>(
        &self,
        partition: PartitionId,
        create: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        if let Some(existing) = self.get(partition) {
            return Ok(existing);
        }
        let built = Arc::new(create()?);
        Ok(self.register(partition, built))
    }

    /// Insert `built` unless another instance got there first; return
    /// whichever is registered.
    fn register(&self, partition: PartitionId, built: Arc<T>) -> Arc<T> {
        let entry = self.entries.entry(partition).or_insert(built);
        Arc::clone(entry.value())
    }

    /// The instance for `partition`, if registered.
    pub fn get(&self, partition: PartitionId) -> Option<Arc<T>> {
        self.entries.get(&partition).map(|e| Arc::clone(e.value()))
    }

    /// Unregister `partition`, returning its instance.
    pub fn remove(&self, partition: PartitionId) -> Option<Arc<T>> {
        self.entries.remove(&partition).map(|(_, v)| v)
    }

    /// Unregister every partition.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of registered partitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered partitions, sorted.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl<T> Default for PartitionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PartitionRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRegistry")
            .field("partitions", &self.partitions())
            .finish()
    }
}
