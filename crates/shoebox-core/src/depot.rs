//! Per-directory depot cache: tiered record lookup, staleness detection,
//! conflict resolution and atomic persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::engine::ContentHashEngine;
use crate::error::{Error, Result};
use crate::record::{HashRecord, HashRecordSet, DEPOT_FILENAME};

/// Outcome of a genuine hash conflict between a stored record and a fresh
/// computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepOld,
    KeepNew,
    /// Resolve to nothing; no record is persisted.
    Skip,
    /// Stop the whole run.
    Abort,
}

/// Decides what to do when stored and freshly computed hashes disagree.
/// The CLI plugs in an interactive prompt; tests plug in scripted answers.
pub trait ConflictResolver {
    fn resolve(&mut self, path: &Path, old: &HashRecord, new: &HashRecord) -> Resolution;
}

/// Record field that failed the staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleField {
    Version,
    Filename,
    Size,
    Mtime,
}

struct DirSlot {
    dir: PathBuf,
    set: HashRecordSet,
}

/// Per-directory authoritative store of hash records.
///
/// Holds a single-slot memory cache of the last-touched directory's record
/// set; a traversal grouped by directory makes adjacent lookups hit that
/// slot, and touching any other directory evicts it wholesale.
pub struct Depot {
    engine: ContentHashEngine,
    slot: Option<DirSlot>,
}

impl Default for Depot {
    fn default() -> Self {
        Self::new()
    }
}

impl Depot {
    pub fn new() -> Self {
        Self { engine: ContentHashEngine::new(), slot: None }
    }

    pub fn engine(&self) -> &ContentHashEngine {
        &self.engine
    }

    /// Resolve the record for `path`, hashing only on cache miss.
    ///
    /// Tiers, in order: the caller-supplied `candidate`, the memory slot,
    /// the on-disk depot. Each hit is validated by the staleness check
    /// (skipped entirely when `add_only` accepts any existing record).
    /// `force_recalc` bypasses all tiers. A fresh computation is compared
    /// against the stale on-disk record; a real mismatch goes to the
    /// conflict resolver. `Ok(None)` means the conflict was skipped.
    pub fn resolve(
        &mut self,
        path: &Path,
        add_only: bool,
        force_recalc: bool,
        candidate: Option<&HashRecord>,
        resolver: &mut dyn ConflictResolver,
    ) -> Result<Option<HashRecord>> {
        let dir = parent_dir(path);
        let key = file_key(path)?;
        let fresh_stat = stat_signature(path)?;

        if !force_recalc {
            if let Some(c) = candidate {
                if self.check_cached(path, add_only, c, fresh_stat) {
                    let record = c.clone();
                    self.persist(&dir, &key, Some(record.clone()))?;
                    return Ok(Some(record));
                }
            }
            if let Some(slot) = self.slot.as_ref().filter(|s| s.dir == dir) {
                if let Some(c) = slot.set.get(&key) {
                    if self.check_cached(path, add_only, c, fresh_stat) {
                        return Ok(Some(c.clone()));
                    }
                }
            }
            // Disk tier (loads the slot as a side effect).
            let disk_candidate = self.slot_set(&dir)?.get(&key).cloned();
            if let Some(c) = disk_candidate {
                if self.check_cached(path, add_only, &c, fresh_stat) {
                    return Ok(Some(c));
                }
            }
        }

        let old = self.slot_set(&dir)?.get(&key).cloned();
        let outcome = self.engine.calculate_hash(path)?;
        let new = HashRecord {
            filename: file_name(path)?,
            size: fresh_stat.0,
            mtime: fresh_stat.1,
            version: outcome.version,
            full_md5: outcome.full_md5,
            md5: outcome.md5,
        };

        let resolved = match &old {
            None => new,
            Some(old) if old.full_md5 == new.full_md5 => {
                // Verified unchanged content; adopt the new record so the
                // size/mtime/version bookkeeping serves future fast paths.
                new
            }
            Some(old) if old.md5 == new.md5 => {
                if self.engine.is_hash_version_current(path, old.version) {
                    // Same extent rules must yield the same full digest.
                    return Err(Error::Inconsistent {
                        path: path.to_path_buf(),
                        version: old.version,
                    });
                }
                // Expected algorithm upgrade: content survived, full digest
                // moved because the stored one predates the current rules.
                debug!(path = %path.display(), from = old.version, to = new.version,
                    "algorithm upgrade verified by content digest");
                new
            }
            Some(old) => {
                warn!(path = %path.display(), "stored and computed hashes disagree");
                match resolver.resolve(path, old, &new) {
                    Resolution::KeepOld => old.clone(),
                    Resolution::KeepNew => new,
                    Resolution::Skip => return Ok(None),
                    Resolution::Abort => return Err(Error::Aborted),
                }
            }
        };

        self.persist(&dir, &key, Some(resolved.clone()))?;
        Ok(Some(resolved))
    }

    /// Validate a cached record against the file's fresh stat signature.
    /// With `add_only`, any existing record is accepted as-is.
    fn check_cached(
        &self,
        path: &Path,
        add_only: bool,
        candidate: &HashRecord,
        fresh_stat: (u64, i64),
    ) -> bool {
        if add_only {
            return true;
        }
        let mut stale = Vec::new();
        if !self.engine.is_hash_version_current(path, candidate.version) {
            stale.push(StaleField::Version);
        }
        match file_name(path) {
            Ok(name) if candidate.matches_filename(&name) => {}
            _ => stale.push(StaleField::Filename),
        }
        if candidate.size != fresh_stat.0 {
            stale.push(StaleField::Size);
        }
        if candidate.mtime != fresh_stat.1 {
            stale.push(StaleField::Mtime);
        }
        if stale.is_empty() {
            true
        } else {
            debug!(path = %path.display(), ?stale, "cached record is stale");
            false
        }
    }

    /// Iterate the records of the given depot files, invoking `callback`
    /// for every entry whose media file still passes `is_file_wanted`.
    /// Traversal (finding the depot files) belongs to the caller.
    pub fn find(
        &mut self,
        depot_paths: impl IntoIterator<Item = PathBuf>,
        is_file_wanted: &dyn Fn(&Path) -> bool,
        callback: &mut dyn FnMut(&Path, &HashRecord),
    ) -> Result<()> {
        for depot_path in depot_paths {
            let dir = parent_dir(&depot_path);
            let set = self.slot_set(&dir)?.clone();
            for (_, record) in set.iter() {
                let file_path = dir.join(&record.filename);
                if is_file_wanted(&file_path) {
                    callback(&file_path, record);
                }
            }
        }
        Ok(())
    }

    /// Unconditionally store (or with `None`, delete) the record for `path`.
    pub fn write(&mut self, path: &Path, record: Option<HashRecord>) -> Result<()> {
        let dir = parent_dir(path);
        let key = file_key(path)?;
        self.persist(&dir, &key, record)
    }

    /// Move a record's entry to another directory's depot (and key), or
    /// delete it when `target` is `None`.
    pub fn relocate(&mut self, source: &Path, target: Option<&Path>) -> Result<()> {
        let source_dir = parent_dir(source);
        let source_key = file_key(source)?;

        let Some(mut record) = self.slot_set(&source_dir)?.get(&source_key).cloned() else {
            return Ok(());
        };
        self.persist(&source_dir, &source_key, None)?;

        if let Some(target) = target {
            record.filename = file_name(target)?;
            let target_dir = parent_dir(target);
            let target_key = record.key();
            // persist() already skips the write when the target depot holds
            // an identical record.
            self.persist(&target_dir, &target_key, Some(record))?;
        }
        Ok(())
    }

    /// Merge entries from the source depot files into the target depot,
    /// used when directories are merged on move. Identical duplicate keys
    /// dedup silently; differing ones fail with `KeyCollision` before the
    /// target file is touched.
    pub fn append(&mut self, target_depot: &Path, source_depots: &[PathBuf]) -> Result<()> {
        let mut merged = HashRecordSet::load(target_depot)?.unwrap_or_default();
        let before = merged.clone();

        for source in source_depots {
            let Some(set) = HashRecordSet::load(source)? else { continue };
            for (key, record) in set.iter() {
                match merged.get(key) {
                    Some(existing) if existing == record => {}
                    Some(_) => {
                        return Err(Error::KeyCollision {
                            key: key.clone(),
                            target: target_depot.to_path_buf(),
                        });
                    }
                    None => {
                        merged.insert(record.clone());
                    }
                }
            }
        }

        if merged != before {
            if merged.is_empty() {
                remove_if_exists(target_depot)?;
            } else {
                merged.save(target_depot)?;
            }
        }
        // The merge bypassed the slot; drop it rather than risk serving a
        // superseded set.
        self.slot = None;
        Ok(())
    }

    /// Memory-slot accessor: loads the directory's depot into the slot when
    /// a different directory (or nothing) is cached.
    fn slot_set(&mut self, dir: &Path) -> Result<&HashRecordSet> {
        if self.slot.as_ref().map_or(true, |s| s.dir != dir) {
            let set = HashRecordSet::load(&dir.join(DEPOT_FILENAME))?.unwrap_or_default();
            self.slot = Some(DirSlot { dir: dir.to_path_buf(), set });
        }
        Ok(&self.slot.as_ref().expect("slot just filled").set)
    }

    /// Shared persist logic: structural-equality no-op, whole-file atomic
    /// rewrite otherwise, depot file deleted when its set becomes empty.
    fn persist(&mut self, dir: &Path, key: &str, record: Option<HashRecord>) -> Result<()> {
        self.slot_set(dir)?;
        let slot = self.slot.as_mut().expect("slot just filled");
        let depot_path = dir.join(DEPOT_FILENAME);

        match record {
            Some(record) => {
                debug_assert_eq!(record.key(), key);
                if slot.set.get(key) == Some(&record) {
                    return Ok(());
                }
                slot.set.insert(record);
                slot.set.save(&depot_path)
            }
            None => {
                if slot.set.remove(key).is_none() {
                    return Ok(());
                }
                if slot.set.is_empty() {
                    remove_if_exists(&depot_path)
                } else {
                    slot.set.save(&depot_path)
                }
            }
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().unwrap_or_else(|| Path::new("")).to_path_buf()
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path has no usable file name: {}", path.display()),
            ))
        })
}

fn file_key(path: &Path) -> Result<String> {
    Ok(file_name(path)?.to_lowercase())
}

/// Size and mtime (unix seconds) of the file right now.
fn stat_signature(path: &Path) -> Result<(u64, i64)> {
    let meta = fs::metadata(path)?;
    let mtime = match meta.modified()?.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    Ok((meta.len(), mtime))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Resolver that answers every conflict the same way. Useful for
/// non-interactive runs and tests.
pub struct FixedResolver {
    pub answer: Resolution,
    pub conflicts: usize,
}

impl FixedResolver {
    pub fn new(answer: Resolution) -> Self {
        Self { answer, conflicts: 0 }
    }
}

impl ConflictResolver for FixedResolver {
    fn resolve(&mut self, _path: &Path, _old: &HashRecord, _new: &HashRecord) -> Resolution {
        self.conflicts += 1;
        self.answer
    }
}
