//! Bidirectional symbol directory for one upstream session.
//!
//! Subscriptions are requested by name but the provider speaks numeric ids,
//! and spot pushes arrive by id. The directory maintains both maps for O(1)
//! lookups in either direction. It is rebuilt after every authentication and
//! cleared on disconnect, since ids may be reassigned on reconnect.

use ahash::AHashMap;
use spot_core::types::Symbol;

use crate::SymbolScale;

/// Name ↔ id symbol directory.
#[derive(Debug, Clone, Default)]
pub struct SymbolDirectory {
    /// Symbol name → full entry.
    by_name: AHashMap<String, Symbol>,
    /// Provider id → symbol name.
    name_by_id: AHashMap<u64, String>,
}

impl SymbolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the directory contents.
    ///
    /// A later entry with a duplicate name replaces the earlier one.
    pub fn load(&mut self, symbols: Vec<Symbol>) {
        self.clear();
        for sym in symbols {
            if let Some(old) = self.by_name.remove(&sym.name) {
                self.name_by_id.remove(&old.id);
            }
            self.name_by_id.insert(sym.id, sym.name.clone());
            self.by_name.insert(sym.name.clone(), sym);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name)
    }

    pub fn by_id(&self, id: u64) -> Option<&Symbol> {
        self.name_by_id
            .get(&id)
            .and_then(|name| self.by_name.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Record loaded price scales. Unknown ids are ignored.
    ///
    /// Returns how many entries were updated.
    pub fn apply_scales(&mut self, scales: &[SymbolScale]) -> usize {
        let mut updated = 0;
        for s in scales {
            let Some(name) = self.name_by_id.get(&s.id) else {
                continue;
            };
            if let Some(sym) = self.by_name.get_mut(name) {
                sym.price_scale = Some(s.price_scale);
                updated += 1;
            }
        }
        updated
    }

    /// Ids whose price scale has not been loaded yet.
    pub fn missing_scales(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .by_name
            .values()
            .filter(|s| s.price_scale.is_none())
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// All symbol names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.name_by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
