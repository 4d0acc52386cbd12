//! Content hash engine: one pass for the full-file digest, a second over
//! the format-resolved extents for the content digest.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use md5::{Digest, Md5};
use tracing::warn;

use crate::error::Result;
use crate::extent::Extent;
use crate::strategy::{HashStrategy, StrategyRegistry};

/// Version of the extent-selection rules. Bumped whenever the rules change
/// in a way that alters output. Version 0 is the legacy era where only a
/// full-file digest was stored; version 1 was an earlier extent-selection
/// revision superseded by the current rules.
pub const ALGORITHM_VERSION: u32 = 2;

const READ_BUF: usize = 64 * 1024;

/// Digests computed for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashOutcome {
    /// Digest over the entire file.
    pub full_md5: String,
    /// Digest over the stable content extents; equals `full_md5` when no
    /// format-specific extents apply.
    pub md5: String,
    pub version: u32,
}

/// Stateless orchestrator around the strategy registry. Reads files, never
/// mutates any persisted state.
#[derive(Debug, Default)]
pub struct ContentHashEngine {
    registry: StrategyRegistry,
}

impl ContentHashEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute full and content digests for `path`.
    pub fn calculate_hash(&self, path: &Path) -> Result<HashOutcome> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(READ_BUF, file);

        let mut full = Md5::new();
        hash_range(&mut reader, 0, file_len, &mut full)?;
        let full_md5 = hex::encode(full.finalize());

        let strategy = self.registry.strategy_for(path);
        let extents = strategy.resolve_extents(path, &mut reader, file_len)?;

        let md5 = match extents {
            Some(extents) if extents_cover_whole_file(&extents, file_len) => full_md5.clone(),
            Some(extents) => {
                if let Some(bad) = extents.iter().find(|e| e.end() > file_len) {
                    // An extent pointing past EOF means the container lied;
                    // degrade the same way parse failures do.
                    warn!(
                        path = %path.display(),
                        pos = bad.pos,
                        len = bad.len,
                        "content extent overruns file end, falling back to whole-file hash"
                    );
                    full_md5.clone()
                } else {
                    let mut content = Md5::new();
                    for extent in &extents {
                        hash_range(&mut reader, extent.pos, extent.len, &mut content)?;
                    }
                    hex::encode(content.finalize())
                }
            }
            None => full_md5.clone(),
        };

        Ok(HashOutcome { full_md5, md5, version: ALGORITHM_VERSION })
    }

    /// Whether a stored algorithm version is still valid for this file's
    /// current strategy. A strategy whose extent rules never applied to a
    /// file type keeps older versions valid; extent-based strategies
    /// require the current version.
    pub fn is_hash_version_current(&self, path: &Path, version: u32) -> bool {
        match self.registry.strategy_for(path) {
            HashStrategy::Isobmff => version == ALGORITHM_VERSION,
            // Whole-file output has been identical since version 1; only
            // the legacy full-hash-only era (0) predates the content digest.
            HashStrategy::WholeFile => (1..=ALGORITHM_VERSION).contains(&version),
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }
}

fn extents_cover_whole_file(extents: &[Extent], file_len: u64) -> bool {
    matches!(extents, [only] if only.pos == 0 && only.len == file_len)
}

fn hash_range<R: Read + Seek>(reader: &mut R, pos: u64, len: u64, digest: &mut Md5) -> Result<()> {
    reader.seek(SeekFrom::Start(pos))?;
    let mut remaining = len;
    let mut buf = vec![0u8; READ_BUF];
    while remaining > 0 {
        let want = remaining.min(READ_BUF as u64) as usize;
        reader.read_exact(&mut buf[..want])?;
        digest.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(())
}
