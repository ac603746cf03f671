//! Persistent, lazily loaded cache tables.
//!
//! Every table lives in memory after its first access and is written back only
//! by [`PersistentStore::save`]. Mutation goes through [`Table::write`], whose
//! guard marks the table dirty; `save` clones a dirty table and clears the flag
//! under the same lock, so updates made while the write is in flight are kept
//! for the next save.
//!
//! Layout of the cache directory:
//!
//! ```text
//! <cache_dir>/version                  tool version that wrote the cache
//! <cache_dir>/cache_id_map.json        source path -> cache id
//! <cache_dir>/dependents_data.json     dependency -> dependents
//! <cache_dir>/files/<id>.json          cache record
//! <cache_dir>/files/<id>[.js][.map]    artifact and source map
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::artifact::ArtifactStore;
use crate::error::CacheError;
use crate::record::{CacheId, CacheRecord};

/// Name of the version marker file.
pub const VERSION_FILE: &str = "version";

/// Name of the path -> id table file.
pub const CACHE_IDS_FILE: &str = "cache_id_map.json";

/// Name of the reverse dependency table file.
pub const DEPENDENTS_FILE: &str = "dependents_data.json";

/// Subdirectory holding per-id records and artifacts.
pub const FILES_DIR: &str = "files";

/// Source path -> opaque cache id.
pub type IdTable = BTreeMap<PathBuf, CacheId>;

/// Dependency path -> files recorded as importing it. Never holds empty sets.
pub type DependentsMap = BTreeMap<PathBuf, BTreeSet<PathBuf>>;

/// A whole-file JSON table, loaded on first access.
pub struct Table<T> {
    path: PathBuf,
    pretty: bool,
    value: OnceLock<RwLock<T>>,
    dirty: AtomicBool,
}

impl<T> Table<T>
where
    T: Default + Clone + Serialize + DeserializeOwned,
{
    /// Creates a table backed by `path`. Nothing is read until first access.
    pub fn new(path: PathBuf, pretty: bool) -> Self {
        Self {
            path,
            pretty,
            value: OnceLock::new(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locks the table for reading, loading it on first access.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell().read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the table for writing. Mutating through the guard marks the
    /// table dirty.
    pub fn write(&self) -> TableGuard<'_, T> {
        TableGuard {
            guard: self.cell().write().unwrap_or_else(PoisonError::into_inner),
            dirty: &self.dirty,
            touched: false,
        }
    }

    /// Returns `true` if the table has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Writes the table if dirty. Returns whether anything was written.
    pub fn save(&self) -> Result<bool, CacheError> {
        let Some(snapshot) = self.take_dirty_snapshot() else {
            return Ok(false);
        };
        if let Err(err) = write_json(&self.path, &snapshot, self.pretty) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }
        Ok(true)
    }

    fn take_dirty_snapshot(&self) -> Option<T> {
        // An unloaded table cannot have been mutated.
        let cell = self.value.get()?;
        let guard = cell.read().unwrap_or_else(PoisonError::into_inner);
        if self.dirty.swap(false, Ordering::SeqCst) {
            Some(guard.clone())
        } else {
            None
        }
    }

    fn cell(&self) -> &RwLock<T> {
        self.value
            .get_or_init(|| RwLock::new(load_json(&self.path).unwrap_or_default()))
    }
}

/// Write access to a [`Table`]. Marks the table dirty on drop if it was
/// mutably dereferenced.
pub struct TableGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    dirty: &'a AtomicBool,
    touched: bool,
}

impl<T> Deref for TableGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TableGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.touched = true;
        &mut self.guard
    }
}

impl<T> Drop for TableGuard<'_, T> {
    fn drop(&mut self) {
        // Still holding the lock here, so a concurrent save sees the flag
        // together with the data it covers.
        if self.touched {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct RecordArena {
    /// Records read from disk or written this session. `None` means known
    /// absent.
    loaded: HashMap<CacheId, Option<CacheRecord>>,
    /// Records changed since the last save.
    unsaved: BTreeMap<CacheId, CacheRecord>,
}

/// Per-id cache records, each stored in its own file and loaded on demand.
pub struct RecordTable {
    files_dir: PathBuf,
    pretty: bool,
    arena: RwLock<RecordArena>,
}

impl RecordTable {
    fn new(files_dir: PathBuf, pretty: bool) -> Self {
        Self {
            files_dir,
            pretty,
            arena: RwLock::new(RecordArena::default()),
        }
    }

    /// Returns the path of the record file for `id`.
    pub fn record_path(&self, id: &CacheId) -> PathBuf {
        self.files_dir.join(format!("{id}.json"))
    }

    /// Returns the record for `id`, loading it from disk on first access.
    pub fn get(&self, id: &CacheId) -> Option<CacheRecord> {
        {
            let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = arena.loaded.get(id) {
                return entry.clone();
            }
        }
        self.write().get(id).cloned()
    }

    /// Locks the record arena for a multi-step update.
    pub fn write(&self) -> RecordGuard<'_> {
        RecordGuard {
            table: self,
            arena: self.arena.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Returns the number of records changed since the last save.
    pub fn unsaved_len(&self) -> usize {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unsaved
            .len()
    }

    /// Writes every unsaved record. Returns the number written.
    ///
    /// Records removed or replaced since the save started are skipped.
    /// Records that fail to write stay queued for the next save unless they
    /// were replaced or removed in the meantime.
    pub fn save(&self) -> Result<usize, CacheError> {
        let pending = self.take_unsaved();
        self.write_pending(pending)
    }

    fn take_unsaved(&self) -> BTreeMap<CacheId, CacheRecord> {
        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut arena.unsaved)
    }

    fn write_pending(&self, pending: BTreeMap<CacheId, CacheRecord>) -> Result<usize, CacheError> {
        let mut written = 0;
        let mut pending = pending.into_iter();
        while let Some((id, record)) = pending.next() {
            // Held across the write so a concurrent remove cannot delete the
            // file first and have this write bring it back.
            let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
            if !matches!(arena.loaded.get(&id), Some(Some(_))) || arena.unsaved.contains_key(&id) {
                // Removed, or replaced by a newer record queued for the next save.
                continue;
            }
            let result = write_json(&self.record_path(&id), &record, self.pretty);
            drop(arena);
            if let Err(err) = result {
                let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
                for (id, record) in std::iter::once((id, record)).chain(pending) {
                    if matches!(arena.loaded.get(&id), Some(Some(_))) {
                        arena.unsaved.entry(id).or_insert(record);
                    }
                }
                return Err(err);
            }
            written += 1;
        }
        Ok(written)
    }

    fn load(&self, id: &CacheId) -> Option<CacheRecord> {
        load_json(&self.record_path(id))
    }

    fn delete_file(&self, id: &CacheId) {
        remove_file_best_effort(&self.record_path(id));
    }
}

/// Write access to the record arena, used to keep a record change and the
/// matching dependents update in one critical section.
pub struct RecordGuard<'a> {
    table: &'a RecordTable,
    arena: RwLockWriteGuard<'a, RecordArena>,
}

impl RecordGuard<'_> {
    /// Returns the record for `id`, loading it from disk if needed.
    pub fn get(&mut self, id: &CacheId) -> Option<&CacheRecord> {
        if !self.arena.loaded.contains_key(id) {
            let record = self.table.load(id);
            self.arena.loaded.insert(id.clone(), record);
        }
        self.arena.loaded.get(id).and_then(Option::as_ref)
    }

    /// Stores `record` under `id` and queues it for the next save.
    pub fn insert(&mut self, id: CacheId, record: CacheRecord) {
        self.arena.unsaved.insert(id.clone(), record.clone());
        self.arena.loaded.insert(id, Some(record));
    }

    /// Removes the record for `id` from memory and disk, returning it.
    pub fn remove(&mut self, id: &CacheId) -> Option<CacheRecord> {
        let previous = self.get(id).cloned();
        self.arena.unsaved.remove(id);
        self.arena.loaded.insert(id.clone(), None);
        self.table.delete_file(id);
        previous
    }
}

/// Owner of every persisted cache table.
///
/// Opening the store reads only the version marker; all other tables are
/// loaded on first access. Nothing is written to the tables' files until
/// [`save`](Self::save).
pub struct PersistentStore {
    cache_dir: PathBuf,
    version: String,
    version_dirty: AtomicBool,
    ids: Table<IdTable>,
    dependents: Table<DependentsMap>,
    records: RecordTable,
    artifacts: ArtifactStore,
}

impl PersistentStore {
    /// Opens the store rooted at `cache_dir` for the given tool version.
    ///
    /// If the directory holds a cache written by a different version, every
    /// file of the cache layout is removed and the store starts empty. Other
    /// files in the directory are left alone. `debug` selects
    /// pretty-printed tables and `.js`-suffixed artifacts.
    pub fn open(cache_dir: &Path, version: &str, debug: bool) -> Result<Self, CacheError> {
        let marker_path = cache_dir.join(VERSION_FILE);
        let version_dirty = match std::fs::read_to_string(&marker_path) {
            Ok(stored) if stored.trim() == version => false,
            Ok(stored) => {
                tracing::info!(
                    target = "kiln.cache",
                    cache_dir = %cache_dir.display(),
                    stored = stored.trim(),
                    current = version,
                    "cache was written by another version; discarding it"
                );
                clear_layout(cache_dir)?;
                true
            }
            Err(_) => true,
        };

        let files_dir = cache_dir.join(FILES_DIR);
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            version: version.to_string(),
            version_dirty: AtomicBool::new(version_dirty),
            ids: Table::new(cache_dir.join(CACHE_IDS_FILE), debug),
            dependents: Table::new(cache_dir.join(DEPENDENTS_FILE), debug),
            records: RecordTable::new(files_dir.clone(), debug),
            artifacts: ArtifactStore::new(files_dir, debug),
        })
    }

    /// Returns the cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the tool version this store was opened with.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Source path -> cache id table.
    pub fn ids(&self) -> &Table<IdTable> {
        &self.ids
    }

    /// Reverse dependency table.
    pub fn dependents(&self) -> &Table<DependentsMap> {
        &self.dependents
    }

    /// Per-id cache records.
    pub fn records(&self) -> &RecordTable {
        &self.records
    }

    /// Compiled artifacts and source maps.
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Returns `true` if any table has changes not yet saved.
    pub fn is_dirty(&self) -> bool {
        self.version_dirty.load(Ordering::SeqCst)
            || self.ids.is_dirty()
            || self.dependents.is_dirty()
            || self.records.unsaved_len() > 0
    }

    /// Writes every dirty table and record to disk.
    ///
    /// All tables are attempted even if one fails; the first error is
    /// returned and the failed tables stay dirty.
    pub fn save(&self) -> Result<(), CacheError> {
        let mut first_err = None;

        if self.version_dirty.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.write_version() {
                self.version_dirty.store(true, Ordering::SeqCst);
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.ids.save() {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.dependents.save() {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.records.save() {
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write_version(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| CacheError::io(&self.cache_dir, e))?;
        let path = self.cache_dir.join(VERSION_FILE);
        std::fs::write(&path, &self.version).map_err(|e| CacheError::io(path, e))
    }
}

/// Reads a JSON file, treating a missing or corrupt file as absent.
fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read cache table"
                );
            }
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            let err = CacheError::CorruptRecord {
                path: path.to_path_buf(),
                reason: err.to_string(),
            };
            tracing::debug!(target = "kiln.cache", error = %err, "discarding corrupt cache table");
            None
        }
    }
}

/// Serializes `value` and rewrites `path` with it.
fn write_json<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })?;
    atomic_write(path, json.as_bytes())
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` with `bytes` by writing a sibling temp file and renaming it
/// into place, so readers see either the old or the new content in full.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);

    let result = written.and_then(|()| std::fs::rename(&tmp_path, path));
    if let Err(err) = result {
        remove_file_best_effort(&tmp_path);
        return Err(CacheError::io(path, err));
    }
    Ok(())
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> Result<(PathBuf, File), CacheError> {
    let file_name = dest.file_name().unwrap_or(dest.as_os_str());
    let pid = std::process::id();
    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match File::options().write(true).create_new(true).open(&tmp_path) {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(CacheError::io(tmp_path, err)),
        }
    }
}

/// Deletes every entry of the cache layout under `cache_dir`.
fn clear_layout(cache_dir: &Path) -> Result<(), CacheError> {
    for name in [VERSION_FILE, CACHE_IDS_FILE, DEPENDENTS_FILE] {
        let path = cache_dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::io(path, err)),
        }
    }
    let files_dir = cache_dir.join(FILES_DIR);
    match std::fs::remove_dir_all(&files_dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CacheError::io(files_dir, err)),
    }
}

/// Deletes a cache file, logging anything other than "already gone".
pub(crate) fn remove_file_best_effort(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(
                target = "kiln.cache",
                path = %path.display(),
                error = %err,
                "failed to remove cache file"
            );
        }
    }
}
