use std::cell::{Cell, RefCell};
use std::collections::{hash_map, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use fs4::fs_std::FileExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keydir::{Keydir, KeydirEntry};
use crate::record::{self, Record};
use crate::recovery;
use crate::segment::{self, ActiveSegment, FileKind, SegmentIter};

/// `Cask` stores byte key/value pairs durably on disk in the Bitcask
/// append-only log format, following the
/// [Bitcask paper](https://riak.com/assets/bitcask-intro.pdf).
///
/// All writes go to a single active segment file; once it reaches the
/// configured threshold it is sealed and a new one is started. An in-memory
/// keydir maps every live key to the exact position of its value on disk, so
/// a read costs one seek and one read. [`Cask::merge`] rewrites sealed
/// segments to contain only live records, reclaiming the space left behind
/// by overwrites and deletes.
///
/// `Cask` is thread-safe and can be cloned and shared between threads; all
/// clones observe the same store.
///
/// Example:
///
/// ```rust
/// let dir = tempfile::tempdir().unwrap();
/// let store = caskdb::Cask::open(dir.path()).unwrap();
/// store.put(b"key", b"value").unwrap();
/// assert_eq!(store.get(b"key").unwrap(), b"value");
/// store.delete(b"key").unwrap();
/// assert!(matches!(store.get(b"key"), Err(caskdb::Error::KeyNotFound)));
/// ```
#[derive(Clone)]
pub struct Cask {
    ctx: Arc<Context>,
    writer: Arc<Mutex<Writer>>,
    reader: Reader,
}

/// State shared by every clone of the store handle.
struct Context {
    config: Config,
    path: PathBuf,
    keydir: Keydir,
    closed: AtomicBool,
    /// Bumped after every completed merge; readers drop their cached file
    /// descriptors when they notice a new epoch, so unlinked segments are
    /// actually reclaimed.
    merge_epoch: AtomicU64,
    /// Serializes whole merges; the write lock is only held for the short
    /// snapshot and commit steps.
    merge_lock: Mutex<()>,
    /// Holds the advisory lock on the store directory for as long as the
    /// store is open.
    lock_file: Mutex<Option<File>>,
}

/// The single writer: owns the active segment and the monotonic write clock.
/// `active` is `None` right after a merge seals it (and in read-only mode);
/// the next append materializes a fresh segment at `next_id`.
struct Writer {
    ctx: Arc<Context>,
    active: Option<ActiveSegment>,
    /// The id the next created segment will use; always greater than every
    /// existing or reserved segment id.
    next_id: u64,
    last_timestamp: u64,
}

/// Per-clone read side with a lazily populated cache of segment file
/// descriptors. Sealed segments are immutable, so cached descriptors stay
/// valid until a merge unlinks their files.
struct Reader {
    ctx: Arc<Context>,
    epoch: Cell<u64>,
    readers: RefCell<HashMap<u64, BufReader<File>>>,
}

/// Point-in-time usage numbers for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of live keys.
    pub keys: u64,
    /// Number of segment files on disk.
    pub segments: u64,
    /// Total bytes across all segment files.
    pub total_disk_bytes: u64,
    /// Bytes occupied by the records the keydir references.
    pub live_disk_bytes: u64,
    /// Bytes reclaimable by a merge.
    pub garbage_disk_bytes: u64,
}

impl Cask {
    /// Open a store at the given directory with default options, creating
    /// the directory if it does not exist.
    pub fn open<P>(path: P) -> Result<Cask>
    where
        P: AsRef<Path>,
    {
        Config::default().open(path)
    }

    pub(crate) fn open_with(path: &Path, config: Config) -> Result<Cask> {
        let path = path.to_path_buf();
        if !config.read_only {
            fs::create_dir_all(&path)?;
        }

        let lock_file = if config.read_only {
            match recovery::open_lock_file(&path)? {
                Some(file) => {
                    file.try_lock_shared()
                        .map_err(|e| map_lock_error(e.into()))?;
                    Some(file)
                }
                None => None,
            }
        } else {
            let file = recovery::create_lock_file(&path)?;
            file.try_lock_exclusive()
                .map_err(|e| map_lock_error(e.into()))?;
            Some(file)
        };

        if !config.read_only {
            recovery::sweep_tmp_files(&path)?;
        }

        info!(path = %path.display(), read_only = config.read_only, "opening store");
        let recovered = recovery::recover(&path, &config)?;
        info!(keys = recovered.keydir.len(), "recovery complete");

        let (active, next_id) = if config.read_only {
            (None, recovered.next_id)
        } else {
            match recovered.active {
                Some(candidate) => {
                    let data_path = segment::data_path(&path, candidate.id);
                    match ActiveSegment::reopen(&data_path, candidate.id, candidate.size) {
                        Ok(active) => (Some(active), candidate.id + 1),
                        Err(e) => {
                            warn!(
                                segment = candidate.id,
                                error = %e,
                                "cannot append to highest segment, starting a new one"
                            );
                            (Some(new_segment(&path, recovered.next_id)?), recovered.next_id + 1)
                        }
                    }
                }
                None => (Some(new_segment(&path, recovered.next_id)?), recovered.next_id + 1),
            }
        };

        let ctx = Arc::new(Context {
            config,
            path,
            keydir: recovered.keydir,
            closed: AtomicBool::new(false),
            merge_epoch: AtomicU64::new(0),
            merge_lock: Mutex::new(()),
            lock_file: Mutex::new(lock_file),
        });

        Ok(Cask {
            writer: Arc::new(Mutex::new(Writer {
                ctx: ctx.clone(),
                active,
                next_id,
                last_timestamp: recovered.max_timestamp,
            })),
            reader: Reader::new(ctx.clone()),
            ctx,
        })
    }

    /// Get the value stored for `key`.
    ///
    /// Fails with [`Error::KeyNotFound`] if the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let mut entry = self.ctx.keydir.get(key).ok_or(Error::KeyNotFound)?;
        loop {
            match self.reader.read_value(&entry) {
                Ok(value) => return Ok(value),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    // The segment was merged away between the lookup and the
                    // read; the keydir names the record's new home.
                    match self.ctx.keydir.get(key) {
                        Some(next) if next != entry => entry = next,
                        Some(_) => return Err(Error::Io(e)),
                        None => return Err(Error::KeyNotFound),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Store `value` under `key`, overwriting any existing value.
    ///
    /// The write is on disk but not necessarily durable until [`Cask::sync`]
    /// is called, unless the store was opened with `sync_on_put`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        validate_key(key)?;
        if value.len() > record::MAX_VALUE_LEN {
            return Err(Error::ValueTooLarge(value.len()));
        }

        let mut writer = self.writer.lock().unwrap();
        let timestamp = writer.next_timestamp()?;
        let bytes = record::encode(key, Some(value), timestamp)?;
        let (segment_id, offset) = writer.append(&bytes)?;
        self.ctx.keydir.insert(
            key.to_vec(),
            KeydirEntry {
                segment_id,
                value_offset: offset + record::HEADER_LEN + key.len() as u64,
                value_size: value.len() as u32,
                timestamp,
            },
        );
        Ok(())
    }

    /// Remove `key` from the store.
    ///
    /// Deleting an absent key is a no-op. For a present key a tombstone
    /// record is appended and the key is dropped from the keydir.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        validate_key(key)?;

        let mut writer = self.writer.lock().unwrap();
        if self.ctx.keydir.get(key).is_none() {
            return Ok(());
        }
        let timestamp = writer.next_timestamp()?;
        let bytes = record::encode(key, None, timestamp)?;
        writer.append(&bytes)?;
        self.ctx.keydir.remove(key);
        Ok(())
    }

    /// List all live keys.
    pub fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.ctx.keydir.keys())
    }

    /// Fold over all key/value pairs in arbitrary order.
    ///
    /// The set of keys visited is the set present when the fold starts;
    /// writes made while the fold runs are not observed. Each value is read
    /// fresh from disk.
    pub fn fold<B, F>(&self, seed: B, mut f: F) -> Result<B>
    where
        F: FnMut(B, &[u8], &[u8]) -> B,
    {
        self.ensure_open()?;
        let mut acc = seed;
        for (key, mut entry) in self.ctx.keydir.entries() {
            loop {
                match self.reader.read_value(&entry) {
                    Ok(value) => {
                        acc = f(acc, &key, &value);
                        break;
                    }
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        match self.ctx.keydir.get(&key) {
                            Some(next) if next != entry => entry = next,
                            Some(_) => return Err(Error::Io(e)),
                            // Deleted while folding and its segment already
                            // merged away; skip it and keep going.
                            None => break,
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(acc)
    }

    /// Flush the active segment and ask the OS to persist it to stable
    /// storage. Sealed segments were synced when they were sealed.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        let writer = self.writer.lock().unwrap();
        if let Some(active) = &writer.active {
            active.sync()?;
        }
        Ok(())
    }

    /// Point-in-time usage numbers for the store.
    pub fn stats(&self) -> Result<Stats> {
        self.ensure_open()?;
        let mut segments = 0u64;
        let mut total_disk_bytes = 0u64;
        for entry in fs::read_dir(&self.ctx.path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((_, FileKind::Data)) = segment::parse_file_name(name) {
                segments += 1;
                total_disk_bytes += fs::metadata(&path)?.len();
            }
        }

        let mut keys = 0u64;
        let mut live_disk_bytes = 0u64;
        for (key, entry) in self.ctx.keydir.entries() {
            keys += 1;
            live_disk_bytes += record::encoded_len(key.len(), entry.value_size as usize);
        }

        Ok(Stats {
            keys,
            segments,
            total_disk_bytes,
            live_disk_bytes,
            garbage_disk_bytes: total_disk_bytes.saturating_sub(live_disk_bytes),
        })
    }

    /// Compact the store: rewrite sealed segments so they contain only live
    /// records, write a hint file next to each output, and delete the old
    /// segments.
    ///
    /// The current active segment is sealed first and compacted with the
    /// rest, and writes proceed on a fresh active segment while the merge
    /// runs. A no-op if fewer than `merge_min_segments` candidate segments
    /// exist.
    pub fn merge(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let _merging = self.ctx.merge_lock.lock().unwrap();

        // Snapshot the victim set and move the writer past the reserved
        // output id range. Output ids stay below every segment written
        // concurrently with the merge, which keeps ascending-id recovery
        // replay correct if we crash mid-swap.
        let Some(plan) = self.merge_plan()? else {
            return Ok(());
        };
        info!(
            victims = plan.victims.len(),
            first_output = plan.first_output_id,
            "merging segments"
        );

        let mut outputs = Vec::<MergeOutput>::new();
        let mut remaps = Vec::<Remap>::new();
        let copied = self
            .merge_copy(&plan, &mut outputs, &mut remaps)
            .and_then(|()| outputs.iter_mut().try_for_each(MergeOutput::commit));
        if let Err(e) = copied {
            error!(error = %e, "merge abandoned");
            for output in outputs {
                output.discard();
            }
            return Err(e);
        }

        // Swing the keydir to the merged locations. A key overwritten or
        // deleted since the scan keeps its newer entry and the merged copy
        // becomes garbage for the next merge.
        {
            let _writer = self.writer.lock().unwrap();
            let mut swapped = 0usize;
            for remap in remaps {
                if self.ctx.keydir.compare_swap(remap.key, remap.old, remap.new) {
                    swapped += 1;
                }
            }
            debug!(swapped, "merge keydir update complete");
        }

        // Nothing references the old segments now; unlink them and their
        // hints, then let readers know their descriptor caches are stale.
        for victim in &plan.victims {
            segment::remove_if_exists(&victim.path)?;
            segment::remove_if_exists(&segment::hint_path(&self.ctx.path, victim.id))?;
        }
        self.ctx.merge_epoch.fetch_add(1, Ordering::Release);
        info!(outputs = outputs.len(), "merge complete");
        Ok(())
    }

    /// Sync the store and mark every clone of the handle closed. The
    /// directory lock is released immediately; file handles go away when
    /// the last clone is dropped.
    pub fn close(&self) -> Result<()> {
        if self.ctx.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().unwrap();
        if let Some(active) = writer.active.take() {
            active.sync()?;
        }
        *self.ctx.lock_file.lock().unwrap() = None;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ctx.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.ctx.config.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Seal the active segment, reserve output ids, and collect the victim
    /// set. Returns `None` when there is not enough to merge.
    fn merge_plan(&self) -> Result<Option<MergePlan>> {
        let mut writer = self.writer.lock().unwrap();
        let active_id = writer.active.as_ref().map(|a| a.id());
        let active_size = writer.active.as_ref().map_or(0, |a| a.size());

        let mut victims = Vec::<Victim>::new();
        for entry in fs::read_dir(&self.ctx.path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((id, FileKind::Data)) = segment::parse_file_name(name) {
                if Some(id) != active_id {
                    let size = fs::metadata(&path)?.len();
                    victims.push(Victim { id, path, size });
                }
            }
        }

        let candidates = victims.len() + usize::from(active_size > 0);
        if candidates < self.ctx.config.merge_min_segments {
            debug!(candidates, "not enough segments to merge");
            return Ok(None);
        }

        let threshold = self.ctx.config.segment_threshold_bytes;
        let total: u64 = victims.iter().map(|v| v.size).sum::<u64>() + active_size;
        // Next-fit packing seals an output only when the next record will
        // not fit, so any two consecutive sealed outputs together exceed
        // the threshold; this many ids cover the worst case.
        let reserved = 2 * (total / threshold) + 3;
        let first_output_id = writer.next_id;
        writer.next_id = first_output_id + reserved;

        // Seal the active segment and merge it too, so even a single-segment
        // store compacts fully. Writers continue past the reserved id range.
        if let Some((id, size)) = writer.seal_active()? {
            victims.push(Victim { id, path: segment::data_path(&self.ctx.path, id), size });
        }
        victims.sort_by_key(|v| v.id);

        Ok(Some(MergePlan {
            victims,
            first_output_id,
            output_id_limit: first_output_id + reserved,
        }))
    }

    /// Copy every live record in the victim set into scratch output
    /// segments, recording the keydir updates to apply at commit.
    fn merge_copy(
        &self,
        plan: &MergePlan,
        outputs: &mut Vec<MergeOutput>,
        remaps: &mut Vec<Remap>,
    ) -> Result<()> {
        let victim_ids: HashSet<u64> = plan.victims.iter().map(|v| v.id).collect();
        let mut next_id = plan.first_output_id;
        // Keys whose keydir entry claims a victim location the scan has not
        // matched. The scan runs in ascending id and offset order, so a
        // plain overwrite keeps the higher segment id, then higher offset.
        let mut orphans = HashMap::<Vec<u8>, Orphan>::new();

        for (victim_index, victim) in plan.victims.iter().enumerate() {
            let mut iter = SegmentIter::open(&victim.path)?;
            while let Some(at) = iter.next()? {
                // Tombstones are never live, and a record is live only if
                // the keydir still points exactly at it.
                let value_size = match &at.record.value {
                    Some(value) => value.len() as u32,
                    None => continue,
                };
                let Some(old) = self.ctx.keydir.get(&at.record.key) else {
                    continue;
                };
                if old.segment_id != victim.id || old.value_offset != at.value_offset {
                    // A keydir entry naming a victim location that never
                    // turns up in the scan would lose its key once the
                    // victims are unlinked; remember the newest duplicate
                    // as a stand-in.
                    if victim_ids.contains(&old.segment_id) {
                        orphans.insert(
                            at.record.key,
                            Orphan { victim_index, record_offset: at.offset, old },
                        );
                    }
                    continue;
                }

                orphans.remove(&at.record.key);
                let (segment_id, value_offset) =
                    self.merge_append(plan, outputs, &mut next_id, &at.record)?;
                remaps.push(Remap {
                    key: at.record.key,
                    old,
                    new: KeydirEntry {
                        segment_id,
                        value_offset,
                        value_size,
                        timestamp: at.record.timestamp,
                    },
                });
            }
        }

        // Copy the remembered duplicates for keys whose exact location never
        // appeared. Their remaps run after the exact matches, so a key that
        // also matched keeps the matched copy.
        for (key, orphan) in orphans {
            let victim = &plan.victims[orphan.victim_index];
            let record = read_record_at(&victim.path, orphan.record_offset)?;
            warn!(
                segment = victim.id,
                offset = orphan.record_offset,
                "keeping a duplicate record its key's index entry did not match"
            );
            let value_size = record.value.as_ref().map_or(0, Vec::len) as u32;
            let (segment_id, value_offset) =
                self.merge_append(plan, outputs, &mut next_id, &record)?;
            remaps.push(Remap {
                key,
                old: orphan.old,
                new: KeydirEntry {
                    segment_id,
                    value_offset,
                    value_size,
                    timestamp: record.timestamp,
                },
            });
        }
        Ok(())
    }

    /// Append one record to the current merge output, starting a new output
    /// segment when the record does not fit. Returns the output segment id
    /// and the offset of the value bytes. Output ids must stay inside the
    /// range reserved by `merge_plan`; past it they would collide with
    /// segments the writer hands out concurrently.
    fn merge_append(
        &self,
        plan: &MergePlan,
        outputs: &mut Vec<MergeOutput>,
        next_id: &mut u64,
        record: &Record,
    ) -> Result<(u64, u64)> {
        let threshold = self.ctx.config.segment_threshold_bytes;
        let needs_new = match outputs.last() {
            None => true,
            Some(out) => {
                out.data.size() > 0 && out.data.size() + record.encoded_len() > threshold
            }
        };
        if needs_new {
            if *next_id >= plan.output_id_limit {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "merge ran out of reserved output segment ids",
                )));
            }
            outputs.push(MergeOutput::create(&self.ctx.path, *next_id)?);
            *next_id += 1;
        }
        let output = outputs.last_mut().expect("output segment exists");
        let value_offset = output.append(record)?;
        Ok((output.id, value_offset))
    }
}

impl std::fmt::Debug for Cask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cask").field("path", &self.ctx.path).finish_non_exhaustive()
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    if key.len() > record::MAX_KEY_LEN {
        return Err(Error::KeyTooLarge(key.len()));
    }
    Ok(())
}

fn map_lock_error(e: std::io::Error) -> Error {
    if e.raw_os_error() == fs4::lock_contended_error().raw_os_error() {
        Error::AlreadyOpen
    } else {
        Error::Io(e)
    }
}

fn new_segment(dir: &Path, id: u64) -> Result<ActiveSegment> {
    debug!(segment = id, "creating active segment");
    ActiveSegment::create(&segment::data_path(dir, id), id)
}

/// Decode the single record starting at `offset` in a segment file.
fn read_record_at(path: &Path, offset: u64) -> Result<Record> {
    let file = OpenOptions::new().read(true).open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;
    let (record, _) = record::read_from(&mut reader, len.saturating_sub(offset))?;
    Ok(record)
}

impl Writer {
    /// Next write timestamp: wall-clock milliseconds, bumped past the last
    /// assigned value so same-millisecond writes stay ordered.
    fn next_timestamp(&mut self) -> Result<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64;
        self.last_timestamp = now.max(self.last_timestamp + 1);
        Ok(self.last_timestamp)
    }

    /// Append an encoded record to the active segment, sealing it first if
    /// the record would push it past the threshold and materializing a fresh
    /// segment when none is open. Returns the segment id and the offset the
    /// record was written at.
    fn append(&mut self, bytes: &[u8]) -> Result<(u64, u64)> {
        let threshold = self.ctx.config.segment_threshold_bytes;
        if let Some(active) = &self.active {
            if active.size() > 0 && active.size() + bytes.len() as u64 > threshold {
                self.seal_active()?;
            }
        }
        if self.active.is_none() {
            let id = self.next_id;
            self.next_id += 1;
            self.active = Some(new_segment(&self.ctx.path, id)?);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(Error::Closed);
        };
        let offset = active.append(bytes)?;
        if self.ctx.config.sync_on_put {
            active.sync()?;
        }
        Ok((active.id(), offset))
    }

    /// Seal the active segment; the next append starts a fresh one. Returns
    /// the sealed segment's id and size. Sealed segments are synced once,
    /// here.
    fn seal_active(&mut self) -> Result<Option<(u64, u64)>> {
        if let Some(active) = &self.active {
            active.sync()?;
        }
        let old = self.active.take();
        if let Some(old) = &old {
            debug!(sealed = old.id(), "sealed active segment");
        }
        Ok(old.map(|o| (o.id(), o.size())))
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            if let Err(e) = active.sync() {
                error!(error = %e, "failed to sync active segment on drop");
            }
        }
    }
}

impl Reader {
    fn new(ctx: Arc<Context>) -> Self {
        Reader {
            epoch: Cell::new(ctx.merge_epoch.load(Ordering::Acquire)),
            ctx,
            readers: RefCell::new(HashMap::new()),
        }
    }

    fn read_value(&self, entry: &KeydirEntry) -> Result<Vec<u8>> {
        // After a merge, cached descriptors may point at unlinked segments;
        // drop the cache so the files are actually reclaimed.
        let epoch = self.ctx.merge_epoch.load(Ordering::Acquire);
        if self.epoch.get() != epoch {
            self.readers.borrow_mut().clear();
            self.epoch.set(epoch);
        }

        let mut readers = self.readers.borrow_mut();
        let reader = match readers.entry(entry.segment_id) {
            hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            hash_map::Entry::Vacant(vacant) => {
                let path = segment::data_path(&self.ctx.path, entry.segment_id);
                let file = OpenOptions::new().read(true).open(path)?;
                vacant.insert(BufReader::new(file))
            }
        };
        reader.seek(SeekFrom::Start(entry.value_offset))?;
        let mut value = vec![0; entry.value_size as usize];
        reader.read_exact(&mut value)?;
        Ok(value)
    }
}

impl Clone for Reader {
    fn clone(&self) -> Self {
        Reader::new(self.ctx.clone())
    }
}

struct Victim {
    id: u64,
    path: PathBuf,
    size: u64,
}

struct MergePlan {
    victims: Vec<Victim>,
    first_output_id: u64,
    /// One past the last reserved output id.
    output_id_limit: u64,
}

/// Coordinates of the newest duplicate record kept as a stand-in for a key
/// whose keydir entry points at a victim location the scan never found.
struct Orphan {
    victim_index: usize,
    record_offset: u64,
    old: KeydirEntry,
}

/// A keydir update produced by the merge scan, applied at commit if the
/// entry still points at the old location.
struct Remap {
    key: Vec<u8>,
    old: KeydirEntry,
    new: KeydirEntry,
}

/// One merge output: a data segment and its hint file, written under
/// scratch names and renamed into place at commit.
struct MergeOutput {
    id: u64,
    data: ActiveSegment,
    hint: File,
    data_tmp: PathBuf,
    data_final: PathBuf,
    hint_tmp: PathBuf,
    hint_final: PathBuf,
    committed: bool,
}

impl MergeOutput {
    fn create(dir: &Path, id: u64) -> Result<Self> {
        let data_final = segment::data_path(dir, id);
        let hint_final = segment::hint_path(dir, id);
        let data_tmp = segment::tmp_path(&data_final);
        let hint_tmp = segment::tmp_path(&hint_final);
        debug!(segment = id, "creating merge output segment");
        let data = ActiveSegment::create(&data_tmp, id)?;
        let hint = OpenOptions::new().create_new(true).append(true).open(&hint_tmp)?;
        Ok(MergeOutput { id, data, hint, data_tmp, data_final, hint_tmp, hint_final, committed: false })
    }

    /// Append a live record and its hint entry, returning the offset of the
    /// value bytes in this output segment.
    fn append(&mut self, record: &Record) -> Result<u64> {
        let offset = self.data.append(&record.encode()?)?;
        let value_offset = offset + record::HEADER_LEN + record.key.len() as u64;
        let hint = record::HintEntry {
            timestamp: record.timestamp,
            value_size: record.value.as_ref().map_or(0, Vec::len) as u32,
            value_offset,
            key: record.key.clone(),
        };
        let mut buf = Vec::with_capacity(hint.encoded_len() as usize);
        hint.write_to(&mut buf)?;
        self.hint.write_all(&buf)?;
        Ok(value_offset)
    }

    /// Persist both files and rename them to their final names.
    fn commit(&mut self) -> Result<()> {
        self.data.sync()?;
        self.hint.sync_all()?;
        fs::rename(&self.data_tmp, &self.data_final)?;
        fs::rename(&self.hint_tmp, &self.hint_final)?;
        self.committed = true;
        Ok(())
    }

    /// Drop an uncommitted output, removing its scratch files.
    fn discard(self) {
        if !self.committed {
            let _ = fs::remove_file(&self.data_tmp);
            let _ = fs::remove_file(&self.hint_tmp);
        }
    }
}
