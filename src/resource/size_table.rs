//! src/resource/size_table.rs
//! `ResourceSizeTableManager`: a
//! pre-built, path-hash-keyed table of upper-bound memory footprints, with
//! fallback tables searched in registration order on miss.

use crate::file_device::hash_path;
use crate::resource::unit::PathHash;

/// Sentinel returned on a miss across every registered table .
pub const INVALID_SIZE: u32 = u32::MAX;

/// One binary size table: `{u32 size | cInvalidSize}` per path hash (spec
/// §6).
#[derive(Default)]
pub struct SizeTable {
    entries: std::collections::HashMap<PathHash, u32>,
}

impl SizeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, size: u32) {
        self.entries.insert(hash_path(path), size);
    }

    pub fn insert_hashed(&mut self, path_hash: PathHash, size: u32) {
        self.entries.insert(path_hash, size);
    }

    fn get(&self, path_hash: PathHash) -> Option<u32> {
        self.entries.get(&path_hash).copied()
    }
}

/// Holds the primary table plus any registered fallbacks, searched in list
/// order .
pub struct ResourceSizeTableManager {
    tables: Vec<SizeTable>,
}

impl Default for ResourceSizeTableManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSizeTableManager {
    pub fn new() -> Self {
        Self { tables: vec![SizeTable::new()] }
    }

    pub fn primary_mut(&mut self) -> &mut SizeTable {
        &mut self.tables[0]
    }

    pub fn register_fallback(&mut self, table: SizeTable) {
        self.tables.push(table);
    }

    /// Callers allocate conservatively on a miss .
    pub fn lookup(&self, path: &str) -> u32 {
        self.lookup_hashed(hash_path(path))
    }

    pub fn lookup_hashed(&self, path_hash: PathHash) -> u32 {
        for table in &self.tables {
            if let Some(size) = table.get(path_hash) {
                return size;
            }
        }
        INVALID_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_across_all_tables_returns_invalid_size() {
        let mgr = ResourceSizeTableManager::new();
        assert_eq!(mgr.lookup("nowhere.tex"), INVALID_SIZE);
    }

    #[test]
    fn fallback_tables_are_searched_in_registration_order() {
        let mut mgr = ResourceSizeTableManager::new();
        let mut fallback = SizeTable::new();
        fallback.insert("shared.tex", 4096);
        mgr.register_fallback(fallback);
        assert_eq!(mgr.lookup("shared.tex"), 4096);

        mgr.primary_mut().insert("shared.tex", 1024);
        assert_eq!(mgr.lookup("shared.tex"), 1024, "primary table must win over a fallback");
    }
}
