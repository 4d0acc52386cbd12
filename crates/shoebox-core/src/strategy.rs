//! Per-format selection of the byte ranges that feed the content digest.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::path::Path;

use tracing::{debug, warn};

use crate::boxes;
use crate::error::Result;
use crate::extent::{resolve_primary_extents, Extent};

/// Extensions handled by the ISOBMFF strategy. QuickTime `.mov` is absent
/// on purpose: it lacks the item metadata the resolver needs.
const ISOBMFF_EXTENSIONS: &[&str] = &["mp4", "m4v", "m4a", "m4p", "3gp", "heic", "heif", "avif"];

/// How the content digest's byte ranges are chosen for a file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStrategy {
    /// Parse the box tree and hash the primary item's payload extents.
    Isobmff,
    /// The whole file is the content; content digest equals full digest.
    WholeFile,
}

impl HashStrategy {
    /// Resolve the content extents, or `None` for "hash the whole file".
    ///
    /// Box-tree damage (`MalformedBox`, `UnsupportedFeature`) degrades to
    /// whole-file hashing with a warning rather than failing the file;
    /// true absence of item metadata degrades silently. I/O errors
    /// propagate.
    pub fn resolve_extents<R: Read + Seek>(
        &self,
        path: &Path,
        reader: &mut R,
        file_len: u64,
    ) -> Result<Option<Vec<Extent>>> {
        match self {
            HashStrategy::WholeFile => Ok(None),
            HashStrategy::Isobmff => {
                let resolved = boxes::parse_file(reader, file_len)
                    .and_then(|tree| resolve_primary_extents(&tree));
                match resolved {
                    Ok(Some(extents)) => Ok(Some(extents)),
                    Ok(None) => {
                        debug!(path = %path.display(), "no item metadata, hashing whole file");
                        Ok(None)
                    }
                    Err(err) if err.allows_whole_file_fallback() => {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "container parse failed, falling back to whole-file hash"
                        );
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}

/// Extension -> strategy table, built once at startup.
#[derive(Debug)]
pub struct StrategyRegistry {
    by_extension: HashMap<&'static str, HashStrategy>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        let mut by_extension = HashMap::new();
        for ext in ISOBMFF_EXTENSIONS {
            by_extension.insert(*ext, HashStrategy::Isobmff);
        }
        Self { by_extension }
    }

    /// Strategy for a path, by lowercased extension. Unknown and missing
    /// extensions get the whole-file strategy.
    pub fn strategy_for(&self, path: &Path) -> HashStrategy {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return HashStrategy::WholeFile;
        };
        self.by_extension
            .get(ext.to_ascii_lowercase().as_str())
            .copied()
            .unwrap_or(HashStrategy::WholeFile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_registry_dispatch() {
        let registry = StrategyRegistry::new();
        assert_eq!(registry.strategy_for(Path::new("a.HEIC")), HashStrategy::Isobmff);
        assert_eq!(registry.strategy_for(Path::new("b.mp4")), HashStrategy::Isobmff);
        assert_eq!(registry.strategy_for(Path::new("c.mov")), HashStrategy::WholeFile);
        assert_eq!(registry.strategy_for(Path::new("d.jpg")), HashStrategy::WholeFile);
        assert_eq!(registry.strategy_for(Path::new("noext")), HashStrategy::WholeFile);
    }

    #[test]
    fn test_whole_file_strategy_resolves_none() {
        let mut cursor = Cursor::new(vec![0u8; 16]);
        let extents = HashStrategy::WholeFile
            .resolve_extents(Path::new("x.jpg"), &mut cursor, 16)
            .unwrap();
        assert_eq!(extents, None);
    }

    #[test]
    fn test_isobmff_garbage_falls_back_to_whole_file() {
        // Not a box tree at all; must degrade, not error.
        let data = b"definitely not isobmff content".to_vec();
        let len = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let extents = HashStrategy::Isobmff
            .resolve_extents(Path::new("x.heic"), &mut cursor, len)
            .unwrap();
        assert_eq!(extents, None);
    }
}
