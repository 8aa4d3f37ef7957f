//! Open-addressed hash table keyed by interned strings, used for globals,
//! class method tables, instance field tables, and (inside [`crate::heap`])
//! the string-interning pool itself.
//!
//! Because every live string is interned (`Heap::intern` guarantees at most
//! one [`ObjRef`] per distinct byte content), two keys naming the same
//! identifier are always the *same* `ObjRef`. Lookup therefore only needs
//! hash + `ObjRef` equality, never a dereference into the heap — content
//! comparison is only needed once, at intern time, which is what
//! `Heap::find_interned` is for.

use crate::object::ObjRef;
use crate::value::Value;

#[derive(Clone, Debug)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: Value },
}

/// A linear-probed hash table with tombstone deletion, growing (doubling,
/// from an initial capacity of 8) whenever `count + 1` would exceed 75% of
/// capacity.
#[derive(Clone, Debug)]
pub struct Table {
    entries: Vec<Slot>,
    /// Occupied entries *and* tombstones — matches the spec's load-factor
    /// accounting, so a delete-heavy table still triggers growth (which
    /// also drops its tombstones).
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.probe(key, hash)?;
        match &self.entries[idx] {
            Slot::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Inserts or overwrites `key`. Returns `true` if `key` was not
    /// already present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.count + 1 > self.entries.len() * 3 / 4 {
            self.grow();
        }
        let idx = self.find_slot(key, hash);
        let is_new = !matches!(self.entries[idx], Slot::Occupied { .. });
        if is_new && !matches!(self.entries[idx], Slot::Tombstone) {
            self.count += 1;
        }
        self.entries[idx] = Slot::Occupied { key, hash, value };
        is_new
    }

    /// Leaves a tombstone so later probes don't stop short of entries
    /// placed past this one in the same cluster.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        let Some(idx) = self.probe(key, hash) else { return false };
        if matches!(self.entries[idx], Slot::Occupied { .. }) {
            self.entries[idx] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    /// Copies every occupied entry of `self` into `dst` (used by `import`
    /// semantics in the original; here, by the GC to rebuild the string
    /// pool without its tombstones — iterate rather than blind-copy).
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, u32, Value)> + '_ {
        self.entries.iter().filter_map(|s| match s {
            Slot::Occupied { key, hash, value } => Some((*key, *hash, *value)),
            _ => None,
        })
    }

    /// Removes every entry whose key is not found in `marked`. Used by the
    /// collector to drop interned strings that are otherwise unreachable
    /// before sweep frees their backing object (`tableRemoveWhite`).
    pub fn retain_marked(&mut self, marked: impl Fn(ObjRef) -> bool) {
        for slot in &mut self.entries {
            if let Slot::Occupied { key, .. } = slot {
                if !marked(*key) {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }

    /// Scans the table for an occupied entry with the given `hash` whose
    /// key satisfies `matches`. Used for content-based interning lookups,
    /// where no `ObjRef` exists yet to probe by identity.
    pub fn find_by(&self, hash: u32, matches: impl Fn(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = (hash as usize) & mask;
        let start = idx;
        loop {
            match &self.entries[idx] {
                Slot::Empty => return None,
                Slot::Occupied { key, hash: h, .. } if *h == hash && matches(*key) => {
                    return Some(*key)
                }
                _ => {
                    idx = (idx + 1) & mask;
                    if idx == start {
                        return None;
                    }
                }
            }
        }
    }

    fn probe(&self, key: ObjRef, hash: u32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &self.entries[idx] {
                Slot::Empty => return None,
                Slot::Occupied { key: k, .. } if *k == key => return Some(idx),
                _ => idx = (idx + 1) & mask,
            }
        }
    }

    /// Finds the slot for `key`: an existing occupied slot, or the first
    /// tombstone/empty slot in its probe sequence.
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut idx = (hash as usize) & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.entries[idx] {
                Slot::Empty => return first_tombstone.unwrap_or(idx),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return idx,
                Slot::Occupied { .. } => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![Slot::Empty; new_cap]);
        self.count = 0;
        for slot in old {
            if let Slot::Occupied { key, hash, value } = slot {
                let idx = self.find_slot(key, hash);
                self.entries[idx] = Slot::Occupied { key, hash, value };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(i: u32) -> ObjRef {
        ObjRef(i)
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut t = Table::new();
        assert!(t.set(key(1), 100, Value::Number(1.0)));
        assert_eq!(t.get(key(1), 100), Some(Value::Number(1.0)));
    }

    #[test]
    fn set_existing_key_overwrites_and_reports_not_new() {
        let mut t = Table::new();
        t.set(key(1), 100, Value::Number(1.0));
        assert!(!t.set(key(1), 100, Value::Number(2.0)));
        assert_eq!(t.get(key(1), 100), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_get_misses_but_growth_survives_tombstones() {
        let mut t = Table::new();
        for i in 0..20 {
            t.set(key(i), i, Value::Number(f64::from(i)));
        }
        for i in 0..10 {
            assert!(t.delete(key(i), i));
        }
        for i in 10..20 {
            assert_eq!(t.get(key(i), i), Some(Value::Number(f64::from(i))));
        }
        for i in 0..10 {
            assert_eq!(t.get(key(i), i), None);
        }
    }
}
