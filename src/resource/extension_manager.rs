//! src/resource/extension_manager.rs
//! `ExtensionManager`: binary-searches a
//! sorted `(extension, compression-type)` table to route a path to its
//! per-extension `ResourceUnitManager` (here: [`ResourceMemoryManager`]),
//! falling back to a default at index 0 for unregistered extensions.

use std::sync::Arc;

use crate::file_device::archive::BeaCompression;
use crate::resource::unit::ResourceMemoryManager;

pub struct ExtensionEntry {
    pub extension: String,
    pub compression: BeaCompression,
    pub manager: Arc<ResourceMemoryManager>,
}

/// Index 0 is always the default fallback manager ; entries after it
/// are kept sorted by extension so lookup is a binary search.
pub struct ExtensionManager {
    entries: Vec<ExtensionEntry>,
}

impl ExtensionManager {
    /// `default_manager` becomes index 0. `registered` need not be
    /// pre-sorted — construction sorts it once.
    pub fn new(default_manager: Arc<ResourceMemoryManager>, mut registered: Vec<ExtensionEntry>) -> Self {
        registered.sort_by(|a, b| a.extension.cmp(&b.extension));
        let mut entries = Vec::with_capacity(registered.len() + 1);
        entries.push(ExtensionEntry {
            extension: String::new(),
            compression: BeaCompression::None,
            manager: default_manager,
        });
        entries.extend(registered);
        Self { entries }
    }

    fn extension_of(path: &str) -> &str {
        path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }

    /// `GetCompressionExtension`: binary-searches the
    /// registered extensions (skipping the index-0 default) by extension
    /// string.
    pub fn get_compression_extension(&self, path: &str) -> BeaCompression {
        let ext = Self::extension_of(path);
        self.entries[1..]
            .binary_search_by(|e| e.extension.as_str().cmp(ext))
            .ok()
            .map(|idx| self.entries[idx + 1].compression)
            .unwrap_or(BeaCompression::None)
    }

    /// `GetResourceUnitManager`: returns the extension's
    /// manager, or the index-0 default for anything unregistered.
    pub fn get_resource_unit_manager(&self, path: &str) -> Arc<ResourceMemoryManager> {
        let ext = Self::extension_of(path);
        self.entries[1..]
            .binary_search_by(|e| e.extension.as_str().cmp(ext))
            .ok()
            .map(|idx| self.entries[idx + 1].manager.clone())
            .unwrap_or_else(|| self.entries[0].manager.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{AllocationMode, HeapKind, HeapManager};

    fn manager() -> Arc<ResourceMemoryManager> {
        let heaps = Arc::new(HeapManager::new(64));
        let root = heaps.create_root("ext-root", 1 << 16, HeapKind::Exp, AllocationMode::FirstFit).unwrap();
        Arc::new(ResourceMemoryManager::new(heaps, root, 4))
    }

    #[test]
    fn unregistered_extension_falls_back_to_index_zero() {
        let ext_mgr = ExtensionManager::new(manager(), vec![]);
        let m = ext_mgr.get_resource_unit_manager("foo.unknown_ext");
        assert!(Arc::ptr_eq(&m, &ext_mgr.entries[0].manager));
    }

    #[test]
    fn registered_extension_resolves_to_its_own_manager() {
        let default = manager();
        let tex_manager = manager();
        let ext_mgr = ExtensionManager::new(
            default,
            vec![ExtensionEntry { extension: "tex".into(), compression: BeaCompression::Zstandard, manager: tex_manager.clone() }],
        );
        assert!(Arc::ptr_eq(&ext_mgr.get_resource_unit_manager("a/b.tex"), &tex_manager));
        assert_eq!(ext_mgr.get_compression_extension("a/b.tex"), BeaCompression::Zstandard);
    }
}
