//! Lock-striped hash table from metric paths to records.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::hash::path_hash;
use crate::record::{MetricKind, Record};

/// Number of locks guarding chain modifications.
const STRIPES: usize = 32;

struct Node {
    record: Arc<Record>,
    next: Option<Arc<Node>>,
}

/// Hands out record ids from a single counter.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: Mutex<u64>,
}

impl IdAllocator {
    /// Creates an allocator starting at `1`.
    pub fn new() -> Self {
        Self {
            next: Mutex::new(1),
        }
    }

    /// Returns the next unused id.
    pub fn allocate(&self) -> u64 {
        let mut next = self.next.lock();
        let id = *next;
        *next += 1;
        id
    }
}

/// Maps paths to the records of one aggregation type.
///
/// Each bucket is a singly linked chain of immutable nodes behind an atomic pointer, so lookups
/// walk chains without taking any lock. Inserting and unlinking replace the head of a chain under
/// one of a fixed set of stripe locks. Records are reference counted, so a handle obtained from a
/// lookup stays usable after its node has been unlinked.
pub struct PathTable {
    kind: MetricKind,
    buckets: Box<[ArcSwapOption<Node>]>,
    stripes: Box<[Mutex<()>]>,
    len: AtomicUsize,
}

impl PathTable {
    /// Creates a table with `size` buckets for records of `kind`.
    pub fn new(kind: MetricKind, size: usize) -> Self {
        let size = size.max(1);
        Self {
            kind,
            buckets: (0..size).map(|_| ArcSwapOption::empty()).collect(),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// The aggregation type of all records in this table.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of linked records, including invalid ones not yet collected.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if no records are linked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    fn stripe(&self, index: usize) -> &Mutex<()> {
        &self.stripes[index % STRIPES]
    }

    fn find(&self, index: usize, hash: u64, path: &str) -> Option<Arc<Record>> {
        let head = self.buckets[index].load();
        let mut node = head.as_deref();

        while let Some(current) = node {
            let record = &current.record;
            if record.hash() == hash
                && record.path().len() == path.len()
                && record.is_valid()
                && record.path() == path
            {
                return Some(Arc::clone(record));
            }
            node = current.next.as_deref();
        }

        None
    }

    /// Finds the valid record for `path` without creating it.
    pub fn locate(&self, path: &str) -> Option<Arc<Record>> {
        let hash = path_hash(path.as_bytes());
        self.find(self.bucket_index(hash), hash, path)
    }

    /// Returns the record for `path`, creating it with `make` if there is none.
    ///
    /// `make` receives the path hash and runs under the stripe lock after a second lookup, so it
    /// runs at most once per created record. The returned flag is `true` if this call created the
    /// record.
    pub fn get_or_insert_with<F>(&self, path: &str, make: F) -> (Arc<Record>, bool)
    where
        F: FnOnce(u64) -> Record,
    {
        let hash = path_hash(path.as_bytes());
        let index = self.bucket_index(hash);

        if let Some(record) = self.find(index, hash, path) {
            return (record, false);
        }

        let _guard = self.stripe(index).lock();
        if let Some(record) = self.find(index, hash, path) {
            return (record, false);
        }

        let record = Arc::new(make(hash));
        let next = self.buckets[index].load_full();
        self.buckets[index].store(Some(Arc::new(Node {
            record: Arc::clone(&record),
            next,
        })));
        self.len.fetch_add(1, Ordering::Relaxed);

        (record, true)
    }

    /// Marks the record for `path` invalid and returns it.
    ///
    /// The node stays linked until the next [`collect`](Self::collect).
    pub fn remove(&self, path: &str) -> Option<Arc<Record>> {
        let record = self.locate(path)?;
        record.invalidate();
        Some(record)
    }

    /// Calls `f` for every valid record in the buckets owned by shard `shard` of `shards`.
    ///
    /// A bucket belongs to shard `index % shards`, so every record is visited by exactly one
    /// shard.
    pub fn for_each_in_shard<F>(&self, shard: usize, shards: usize, mut f: F)
    where
        F: FnMut(&Arc<Record>),
    {
        let shards = shards.max(1);
        for bucket in self.buckets.iter().skip(shard).step_by(shards) {
            let head = bucket.load();
            let mut node = head.as_deref();
            while let Some(current) = node {
                if current.record.is_valid() {
                    f(&current.record);
                }
                node = current.next.as_deref();
            }
        }
    }

    /// Calls `f` for every valid record.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&Arc<Record>),
    {
        self.for_each_in_shard(0, 1, f);
    }

    /// Invalidates records selected by `expired` and unlinks all invalid records.
    ///
    /// Returns the records that were unlinked.
    pub fn collect<F>(&self, mut expired: F) -> Vec<Arc<Record>>
    where
        F: FnMut(&Record) -> bool,
    {
        let mut removed = Vec::new();

        for (index, bucket) in self.buckets.iter().enumerate() {
            let dirty = {
                let head = bucket.load();
                let mut node = head.as_deref();
                let mut dirty = false;
                while let Some(current) = node {
                    if !current.record.is_valid() || expired(&current.record) {
                        current.record.invalidate();
                        dirty = true;
                    }
                    node = current.next.as_deref();
                }
                dirty
            };

            if !dirty {
                continue;
            }

            let _guard = self.stripe(index).lock();
            let mut keep = Vec::new();
            let mut node = bucket.load_full();
            while let Some(current) = node {
                if current.record.is_valid() {
                    keep.push(Arc::clone(&current.record));
                } else {
                    removed.push(Arc::clone(&current.record));
                }
                node = current.next.clone();
            }

            let chain = keep
                .into_iter()
                .rev()
                .fold(None, |next, record| Some(Arc::new(Node { record, next })));
            bucket.store(chain);
        }

        self.len.fetch_sub(removed.len(), Ordering::Relaxed);
        removed
    }
}

impl fmt::Debug for PathTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathTable")
            .field("kind", &self.kind)
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .finish()
    }
}
