//! Explicit communicator handle and key-sharded storage.
//!
//! A many-body state distributes its one-body members over a pool of
//! shared-nothing workers. All collective operations go through a
//! [`Communicator`] value threaded explicitly through constructors; there is
//! no process-global communication state. The handle shipped here is the
//! single-process one, but every call site is written against the
//! rank/size/reduce surface so a multi-process backend can slot in behind
//! the same type.

use indexmap::IndexMap;
use ndarray as nd;
use crate::error::EnsembleError;

/// Handle onto a pool of workers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Communicator {
    rank: usize,
    size: usize,
}

impl Default for Communicator {
    fn default() -> Self { Self::local() }
}

impl Communicator {
    /// A pool of one: the calling process owns everything.
    pub fn local() -> Self { Self { rank: 0, size: 1 } }

    /// Rank of the calling process within the pool.
    pub fn rank(&self) -> usize { self.rank }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize { self.size }

    pub fn is_root(&self) -> bool { self.rank == 0 }

    /// Rank owning the value stored under an integer key.
    ///
    /// Keys are dealt round-robin so that consecutive keys land on
    /// different workers.
    pub fn owner_of(&self, key: usize) -> usize { key % self.size }

    pub fn owns(&self, key: usize) -> bool {
        self.owner_of(key) == self.rank
    }

    /// Element-wise sum over all ranks, delivered to `root` only; every
    /// other rank gets `None`.
    pub fn reduce(&self, data: nd::Array2<f64>, root: usize)
        -> Option<nd::Array2<f64>>
    {
        (self.rank == root).then_some(data)
    }

    /// Element-wise sum over all ranks, delivered everywhere.
    pub fn allreduce(&self, data: nd::Array2<f64>) -> nd::Array2<f64> {
        data
    }
}

/// Key-sharded value store.
///
/// The key set is replicated on every rank; the values themselves live only
/// on the rank [`Communicator::owner_of`] assigns them to. Iteration order
/// over keys is insertion order on every rank, which keeps collective loops
/// deterministic.
#[derive(Clone, Debug)]
pub struct DistributedMap<V> {
    comm: Communicator,
    keys: Vec<usize>,
    local: IndexMap<usize, V>,
}

impl<V> DistributedMap<V> {
    pub fn new(comm: Communicator) -> Self {
        Self { comm, keys: Vec::new(), local: IndexMap::new() }
    }

    pub fn comm(&self) -> Communicator { self.comm }

    /// Register `key` everywhere and materialize its value on the owning
    /// rank only. `make` is not called on non-owning ranks.
    pub fn add<F>(&mut self, key: usize, make: F) -> Result<(), EnsembleError>
    where F: FnOnce() -> V
    {
        if self.keys.contains(&key) {
            return Err(EnsembleError::DuplicateKey(key));
        }
        self.keys.push(key);
        if self.comm.owns(key) {
            self.local.insert(key, make());
        }
        Ok(())
    }

    pub fn delete(&mut self, key: usize) -> Result<(), EnsembleError> {
        let pos = self.keys.iter().position(|k| *k == key)
            .ok_or(EnsembleError::UnknownKey(key))?;
        self.keys.remove(pos);
        self.local.shift_remove(&key);
        Ok(())
    }

    pub fn contains(&self, key: usize) -> bool { self.keys.contains(&key) }

    /// All keys, on every rank.
    pub fn keys(&self) -> &[usize] { &self.keys }

    /// Keys whose values live on the calling rank.
    pub fn local_keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.local.keys().copied()
    }

    pub fn get(&self, key: usize) -> Option<&V> { self.local.get(&key) }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut V> {
        self.local.get_mut(&key)
    }

    pub fn local_iter(&self) -> impl Iterator<Item = (usize, &V)> + '_ {
        self.local.iter().map(|(k, v)| (*k, v))
    }

    pub fn local_iter_mut(&mut self)
        -> impl Iterator<Item = (usize, &mut V)> + '_
    {
        self.local.iter_mut().map(|(k, v)| (*k, v))
    }

    /// Total number of registered keys (not the local count).
    pub fn len(&self) -> usize { self.keys.len() }

    pub fn is_empty(&self) -> bool { self.keys.is_empty() }

    /// The smallest integer key strictly above every registered key.
    pub fn next_free_key(&self) -> usize {
        self.keys.iter().map(|k| k + 1).max().unwrap_or(0)
    }

    pub fn keys_are_unique(&self) -> bool {
        self.keys.iter()
            .enumerate()
            .all(|(i, k)| !self.keys[..i].contains(k))
    }

    /// Every local value must sit under a registered key the calling rank
    /// owns.
    pub fn check_consistency(&self) -> Result<(), EnsembleError> {
        if !self.keys_are_unique() {
            return Err(EnsembleError::Inconsistent("duplicate keys"));
        }
        let expected: usize =
            self.keys.iter().filter(|k| self.comm.owns(**k)).count();
        if expected != self.local.len() {
            return Err(EnsembleError::Inconsistent(
                "local value count does not match owned key count"));
        }
        for key in self.local.keys() {
            if !self.keys.contains(key) {
                return Err(EnsembleError::Inconsistent(
                    "local value under an unregistered key"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_delete_cycle() {
        let mut store: DistributedMap<f64>
            = DistributedMap::new(Communicator::local());
        store.add(0, || 1.0).unwrap();
        store.add(5, || 2.0).unwrap();
        assert!(store.add(5, || 3.0).is_err());
        assert_eq!(store.len(), 2);
        assert_eq!(store.next_free_key(), 6);
        store.delete(0).unwrap();
        assert!(store.delete(0).is_err());
        assert_eq!(store.keys(), &[5]);
        store.check_consistency().unwrap();
    }

    #[test]
    fn local_pool_owns_everything() {
        let comm = Communicator::local();
        assert!(comm.is_root());
        assert!((0..100).all(|k| comm.owns(k)));
        let data = nd::Array2::from_elem((2, 3), 1.5);
        assert_eq!(comm.reduce(data.clone(), 0), Some(data.clone()));
        assert_eq!(comm.allreduce(data.clone()), data);
    }
}
