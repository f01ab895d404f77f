//! Encoder-side dynamic table (RFC 9204 Section 3.2).
//!
//! An append-only ring of field lines with capacity-based eviction. Absolute
//! indices are 1-based and monotonically increasing over the connection, so
//! an entry's index doubles as the insert count required to decode a
//! reference to it. Entries referenced by in-flight field sections carry a
//! reference count and are never evicted.

use std::collections::VecDeque;

use tracing::trace;

use crate::error::{QpackError, Result};
use crate::field::HeaderField;
use crate::static_table;

/// Safety margin, as a fraction of capacity, kept evictable ahead of
/// inserts. Oldest entries inside the margin are never referenced, so a full
/// table can always shed roughly 1/8 of its bytes.
const DRAIN_FRACTION: usize = 8;

/// One dynamic table entry.
#[derive(Debug)]
pub struct Entry {
    field: HeaderField,
    index: u64,
    ref_count: usize,
}

impl Entry {
    pub fn field(&self) -> &HeaderField {
        &self.field
    }

    /// Absolute 1-based insertion index.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_referenced(&self) -> bool {
        self.ref_count > 0
    }
}

/// A table lookup result: either a static table index or a dynamic absolute
/// index. Static entries win ties so references to them never block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEntry {
    Static(u64),
    Dynamic(u64),
}

#[derive(Debug, Default)]
pub struct DynamicTable {
    entries: VecDeque<Entry>,
    capacity: usize,
    size: usize,
    insert_count: u64,
}

impl DynamicTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total insertions since connection start. Never decreases.
    pub fn insert_count(&self) -> u64 {
        self.insert_count
    }

    /// Maximum entry count the peer derives from the capacity, used by the
    /// field section prefix encoding (RFC 9204 Section 4.5.1.1).
    pub fn max_entries(&self) -> u64 {
        (self.capacity / 32) as u64
    }

    /// Change the table capacity, evicting oldest entries as needed.
    ///
    /// Fails without mutating anything if an entry that would have to go is
    /// still referenced by an unacknowledged section.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        let mut reclaimed = 0;
        for entry in &self.entries {
            if self.size - reclaimed <= capacity {
                break;
            }
            if entry.is_referenced() {
                return Err(QpackError::DynamicTable(format!(
                    "cannot shrink to {}: entry {} still referenced",
                    capacity, entry.index
                )));
            }
            reclaimed += entry.field.size();
        }

        self.capacity = capacity;
        while self.size > self.capacity {
            self.evict_front();
        }
        trace!(capacity, size = self.size, "dynamic table capacity set");
        Ok(())
    }

    /// Whether `field` could be added after evicting only unreferenced
    /// entries (RFC 9204 Section 2.1.1).
    pub fn can_insert(&self, field: &HeaderField) -> bool {
        let needed = field.size();
        if needed > self.capacity {
            return false;
        }
        let mut reclaimable = 0;
        for entry in &self.entries {
            if self.size - reclaimable + needed <= self.capacity {
                break;
            }
            if entry.is_referenced() {
                return false;
            }
            reclaimable += entry.field.size();
        }
        self.size - reclaimable + needed <= self.capacity
    }

    /// Append a field, evicting unreferenced entries from the front to make
    /// room. Callers must check [`can_insert`](Self::can_insert) first.
    pub fn add(&mut self, field: HeaderField) -> Result<u64> {
        let needed = field.size();
        if needed > self.capacity {
            return Err(QpackError::DynamicTable(format!(
                "entry size {} exceeds table capacity {}",
                needed, self.capacity
            )));
        }

        while self.size + needed > self.capacity {
            match self.entries.front() {
                Some(entry) if entry.is_referenced() => {
                    return Err(QpackError::DynamicTable(format!(
                        "cannot evict referenced entry {}",
                        entry.index
                    )));
                }
                Some(_) => self.evict_front(),
                None => break,
            }
        }

        self.insert_count += 1;
        let index = self.insert_count;
        trace!(index, size = needed, field = ?field, "dynamic table insert");
        self.size += needed;
        self.entries.push_back(Entry {
            field,
            index,
            ref_count: 0,
        });
        Ok(index)
    }

    /// Exact lookup across the static and dynamic tables, static first.
    /// Dynamic matches prefer the newest entry.
    pub fn find_exact(&self, name: &str, value: &str) -> Option<TableEntry> {
        if let Some(index) = static_table::find_exact(name, value) {
            return Some(TableEntry::Static(index));
        }
        self.entries
            .iter()
            .rev()
            .find(|e| e.field.matches(name, value))
            .map(|e| TableEntry::Dynamic(e.index))
    }

    /// Name-only lookup across the static and dynamic tables, static first.
    pub fn find_name(&self, name: &str) -> Option<TableEntry> {
        if let Some(index) = static_table::find_name(name) {
            return Some(TableEntry::Static(index));
        }
        self.entries
            .iter()
            .rev()
            .find(|e| e.field.name().eq_ignore_ascii_case(name))
            .map(|e| TableEntry::Dynamic(e.index))
    }

    /// Whether the entry is outside the draining zone and safe to reference.
    ///
    /// Referencing an entry that is about to be evicted risks pinning it
    /// forever and deadlocking insertion, so the encoder refuses.
    pub fn can_reference(&self, index: u64) -> bool {
        if self.get(index).is_none() {
            return false;
        }
        index > self.draining_index()
    }

    /// Highest absolute index still inside the draining zone (0 when the
    /// zone is empty).
    ///
    /// The zone only exists under eviction pressure: once fewer than
    /// `capacity / DRAIN_FRACTION` bytes remain free, the oldest entries
    /// overlapping the shortfall are drained.
    fn draining_index(&self) -> u64 {
        let margin = self.capacity / DRAIN_FRACTION;
        let drain_bytes = (self.size + margin).saturating_sub(self.capacity);
        if drain_bytes == 0 {
            return 0;
        }
        let mut offset = 0;
        let mut index = 0;
        for entry in &self.entries {
            if offset >= drain_bytes {
                break;
            }
            index = entry.index;
            offset += entry.field.size();
        }
        index
    }

    pub fn get(&self, index: u64) -> Option<&Entry> {
        let front = self.entries.front()?.index;
        if index < front || index > self.insert_count {
            return None;
        }
        self.entries.get((index - front) as usize)
    }

    /// Record a field-section reference to the entry at `index`.
    pub fn reference(&mut self, index: u64) {
        if let Some(entry) = self.get_mut(index) {
            entry.ref_count += 1;
        }
    }

    /// Drop one reference to the entry at `index`. Entries already evicted
    /// after acknowledgement are silently ignored.
    pub fn release(&mut self, index: u64) {
        if let Some(entry) = self.get_mut(index) {
            debug_assert!(entry.ref_count > 0, "release without reference");
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    fn get_mut(&mut self, index: u64) -> Option<&mut Entry> {
        let front = self.entries.front()?.index;
        if index < front || index > self.insert_count {
            return None;
        }
        self.entries.get_mut((index - front) as usize)
    }

    fn evict_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            trace!(index = entry.index, "dynamic table evict");
            self.size -= entry.field.size();
        }
    }
}
