//! Hash record model and the on-disk depot file format.
//!
//! Each directory owns at most one depot file mapping lowercase filename to
//! a record. Two formats are read: the current JSON object (sniffed by a
//! leading `{`) and a legacy `name: hexdigest` line format whose entries
//! become version-0 records with both digests equal to the stored value.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved name of the per-directory depot file. Anything carrying this
/// name (matched case-insensitively) is infrastructure, never media.
pub const DEPOT_FILENAME: &str = ".shoebox";

/// Whether a file name is the reserved depot name.
pub fn is_reserved_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(DEPOT_FILENAME)
}

/// Stored hashes and stat signature for one media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    /// Base name with original case; compared case-insensitively.
    pub filename: String,
    /// Byte length at the time of hashing.
    pub size: u64,
    /// Modification time (unix seconds) at the time of hashing.
    pub mtime: i64,
    /// Extent-selection rules version that produced the digests. 0 marks a
    /// legacy record that stored only a full-file digest.
    pub version: u32,
    /// Digest over the entire file.
    pub full_md5: String,
    /// Digest over the stable content bytes. Keyed `md5` for compatibility
    /// with existing depots; equals `full_md5` when no content-specific
    /// strategy applies.
    pub md5: String,
}

impl HashRecord {
    /// Key within the owning set.
    pub fn key(&self) -> String {
        self.filename.to_lowercase()
    }

    pub fn matches_filename(&self, name: &str) -> bool {
        self.filename.to_lowercase() == name.to_lowercase()
    }
}

/// All records of one directory, keyed by lowercase filename. The map is
/// ordered, so persisted output is canonically key-sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashRecordSet {
    records: BTreeMap<String, HashRecord>,
}

impl HashRecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&HashRecord> {
        self.records.get(key)
    }

    /// Insert under the record's own key, returning any replaced record.
    pub fn insert(&mut self, record: HashRecord) -> Option<HashRecord> {
        self.records.insert(record.key(), record)
    }

    pub fn remove(&mut self, key: &str) -> Option<HashRecord> {
        self.records.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HashRecord)> {
        self.records.iter()
    }

    /// Load a depot file. `Ok(None)` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut text = String::new();
        BufReader::new(file).read_to_string(&mut text)?;
        Self::parse(&text, path).map(Some)
    }

    fn parse(text: &str, path: &Path) -> Result<Self> {
        if text.trim_start().starts_with('{') {
            let records: BTreeMap<String, HashRecord> =
                serde_json::from_str(text).map_err(|err| Error::DepotFormat {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
            Ok(Self { records })
        } else {
            Self::parse_legacy(text, path)
        }
    }

    /// Legacy plain-text depot: one `name: hexdigest` per line. Size and
    /// mtime were never stored, so entries always fail the staleness check
    /// and get recomputed on first touch.
    fn parse_legacy(text: &str, path: &Path) -> Result<Self> {
        let mut set = Self::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let Some((name, digest)) = line.rsplit_once(':') else {
                return Err(Error::DepotFormat {
                    path: path.to_path_buf(),
                    reason: format!("legacy line without separator: {line:?}"),
                });
            };
            let name = name.trim();
            let digest = digest.trim();
            if name.is_empty() || digest.is_empty() {
                return Err(Error::DepotFormat {
                    path: path.to_path_buf(),
                    reason: format!("legacy line with empty field: {line:?}"),
                });
            }
            set.insert(HashRecord {
                filename: name.to_string(),
                size: 0,
                mtime: 0,
                version: 0,
                full_md5: digest.to_string(),
                md5: digest.to_string(),
            });
        }
        Ok(set)
    }

    /// Write the set atomically (temp file + rename in the same directory).
    /// An empty set is invalid on disk; the caller deletes instead.
    pub fn save(&self, path: &Path) -> Result<()> {
        debug_assert!(!self.is_empty(), "empty depot sets are deleted, not saved");
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &self.records)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
