use crate::heap::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            hash: 0,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !matches!(self.value, Value::Nil)
    }
}

/// Open-addressed hash map with linear probing and tombstone deletion.
/// Used both for the globals table (key = interned name `ObjRef`) and for
/// the string-intern table (key = interned string `ObjRef`, value unused
/// beyond marking the slot live). Keys are compared by `ObjRef` identity,
/// which is sound only because every key here is an interned string.
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.find_entry(key, hash);
        let entry = &self.entries[idx];
        if entry.key.is_some() {
            Some(entry.value)
        } else {
            None
        }
    }

    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            let capacity = grow_capacity(self.entries.len());
            self.adjust_capacity(capacity);
        }
        let idx = self.find_entry(key, hash);
        let entry = &mut self.entries[idx];
        let is_new_key = entry.key.is_none();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = self.find_entry(key, hash);
        let entry = &mut self.entries[idx];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Interning lookup performed before a `String` object exists: probes
    /// by hash, handing each same-hash candidate to `matches` for the
    /// final content comparison.
    pub fn find_interned(&self, hash: u32, mut matches: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) if entry.hash == hash && matches(key) => return Some(key),
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Drops every key for which `keep` returns false, turning its slot
    /// into a tombstone. Used by the GC sweep to evict strings that were
    /// not marked.
    pub fn retain(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !keep(key) {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    fn find_entry(&self, key: ObjRef, hash: u32) -> usize {
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(k) if k == key => return index,
                None if entry.is_tombstone() => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                None => return first_tombstone.unwrap_or(index),
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut new_entries = vec![Entry::empty(); capacity];
        let mut new_count = 0;
        for entry in self.entries.iter() {
            let Some(key) = entry.key else { continue };
            let mut index = (entry.hash as usize) % capacity;
            loop {
                if new_entries[index].key.is_none() {
                    break;
                }
                index = (index + 1) % capacity;
            }
            new_entries[index] = Entry {
                key: Some(key),
                hash: entry.hash,
                value: entry.value,
            };
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }
}

fn grow_capacity(current: usize) -> usize {
    if current < 8 {
        8
    } else {
        current * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_then_get_round_trips() {
        let mut heap = Heap::new();
        let key = heap.intern_string(b"answer");
        let mut table = Table::new();
        assert!(table.set(key, heap.string_hash(key), Value::Number(42.0)));
        assert_eq!(table.get(key, heap.string_hash(key)), Some(Value::Number(42.0)));
    }

    #[test]
    fn delete_then_get_returns_none_but_probe_chain_survives() {
        let mut heap = Heap::new();
        let a = heap.intern_string(b"a");
        let b = heap.intern_string(b"b");
        let mut table = Table::new();
        table.set(a, heap.string_hash(a), Value::Bool(true));
        table.set(b, heap.string_hash(b), Value::Bool(false));
        table.delete(a, heap.string_hash(a));
        assert_eq!(table.get(a, heap.string_hash(a)), None);
        assert_eq!(table.get(b, heap.string_hash(b)), Some(Value::Bool(false)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..20 {
            let name = format!("name{i}");
            let key = heap.intern_string(name.as_bytes());
            table.set(key, heap.string_hash(key), Value::Number(i as f64));
        }
        assert_eq!(table.len(), 20);
        for i in 0..20 {
            let name = format!("name{i}");
            let key = heap.intern_string(name.as_bytes());
            assert_eq!(table.get(key, heap.string_hash(key)), Some(Value::Number(i as f64)));
        }
    }
}
