use std::{
    collections::{BTreeMap, HashSet},
    fs::{read_dir, OpenOptions},
    io::SeekFrom,
    path::PathBuf,
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::anyhow;
use anyhow::bail;
use log::{debug, info, warn};
use tokio::sync::{RwLock, Semaphore};

use crate::{
    errors::{err_file, LogError},
    key_registry::KeyRegistry,
    kv::{Entry, ValuePointer},
    lsm::LsmStore,
    options::{FileLoadingMode, Options},
    util::{closer::Closer, log_file::LogFile, sys::sync_dir, LogFileId, VlogId, WalId},
};

use self::{cleaner::WalCleaner, discard::DiscardStats};

pub(crate) mod cleaner;
pub(crate) mod discard;
pub(crate) mod gc;
pub mod header;
pub(crate) mod read;
pub(crate) mod replay;
pub mod write;

pub use self::read::ValueRead;

// size of log segment header.
// +----------------+------------------+
// | keyID(8 bytes) |  baseIV(12 bytes)|
// +----------------+------------------+
pub(crate) const VLOG_HEADER_SIZE: usize = 20;

// A value pointer's offset is a u32, so a segment can never grow past this.
pub(crate) const MAX_VLOG_FILE_SIZE: usize = u32::MAX as usize;

/// One type of log segment (WAL or value log): the live `fid -> file`
/// mapping, the writable tail position and the deferred-deletion queue.
#[derive(Debug)]
pub(crate) struct LogSet<F: LogFileId> {
    pub(crate) files: RwLock<LogFiles<F>>,
    pub(crate) writable_offset: AtomicU32,
    pub(crate) entries_written: AtomicU32,
    // A refcount of iterators; when it drops to zero the to-be-deleted
    // files can actually go away.
    pub(crate) active_iterators: AtomicI32,
}

#[derive(Debug)]
pub(crate) struct LogFiles<F: LogFileId> {
    pub(crate) map: BTreeMap<u32, Arc<RwLock<LogFile<F>>>>,
    pub(crate) max_fid: u32,
    pub(crate) to_be_deleted: Vec<u32>,
}

impl<F: LogFileId> Default for LogSet<F> {
    fn default() -> Self {
        Self {
            files: RwLock::new(LogFiles {
                map: BTreeMap::new(),
                max_fid: 0,
                to_be_deleted: Vec::new(),
            }),
            writable_offset: AtomicU32::new(0),
            entries_written: AtomicU32::new(0),
            active_iterators: AtomicI32::new(0),
        }
    }
}

impl<F: LogFileId> LogSet<F> {
    /// Offset at which new data will be written.
    #[inline]
    pub(crate) fn offset(&self) -> u32 {
        self.writable_offset.load(Ordering::SeqCst)
    }

    pub(crate) async fn get(&self, fid: u32) -> Option<Arc<RwLock<LogFile<F>>>> {
        let files_r = self.files.read().await;
        files_r.map.get(&fid).cloned()
    }

    pub(crate) async fn current_file(&self) -> Option<Arc<RwLock<LogFile<F>>>> {
        let files_r = self.files.read().await;
        files_r.map.get(&files_r.max_fid).cloned()
    }

    /// File ids not pending deletion, sorted ascending.
    pub(crate) async fn sorted_fids(&self) -> Vec<u32> {
        let files_r = self.files.read().await;
        let to_be_deleted = files_r
            .to_be_deleted
            .iter()
            .copied()
            .collect::<HashSet<_>>();
        files_r
            .map
            .keys()
            .filter(|fid| !to_be_deleted.contains(fid))
            .copied()
            .collect()
    }
}

/// The durable, append-only core: a WAL recording every mutation for crash
/// recovery and a value log holding values the LSM only points at.
pub struct ValueLog<L: LsmStore> {
    dir_path: PathBuf,
    pub(crate) vlog: LogSet<VlogId>,
    pub(crate) wal: LogSet<WalId>,
    pub(crate) lsm: Arc<L>,
    pub(crate) key_registry: KeyRegistry,
    pub(crate) opt: Arc<Options>,
    // Size-1 gate: only one GC at a time, and none after close.
    pub(crate) garbage_sem: Arc<Semaphore>,
    pub(crate) discard_stats: DiscardStats,
    pub(crate) wal_cleaner: WalCleaner,
    flush_closer: Closer,
    cleaner_closer: Closer,
    // Bumped on WAL rotation only; the LSM watches it to schedule memtable
    // flushes that advance the durable head.
    log_rotates: AtomicI32,
}

impl<L: LsmStore> ValueLog<L> {
    /// Opens the subsystem: scans the directory, replays committed WAL
    /// transactions past `vhead` through `replay_fn`, prepares the writable
    /// tails and starts the background discard-stats flusher and WAL
    /// cleaner.
    pub async fn open<R>(
        opt: Arc<Options>,
        lsm: Arc<L>,
        key_registry: KeyRegistry,
        vhead: ValuePointer,
        mut replay_fn: R,
    ) -> anyhow::Result<Arc<ValueLog<L>>>
    where
        R: FnMut(Entry, ValuePointer) -> anyhow::Result<()>,
    {
        let (discard_stats, stats_receiver) = DiscardStats::new();
        let (wal_cleaner, del_receiver) = WalCleaner::new();
        let flush_closer = Closer::new(1);
        let cleaner_closer = Closer::new(1);

        let value_log = Arc::new(Self {
            dir_path: opt.get_dir().clone(),
            vlog: LogSet::default(),
            wal: LogSet::default(),
            lsm,
            key_registry,
            opt,
            garbage_sem: Arc::new(Semaphore::new(1)),
            discard_stats,
            wal_cleaner,
            flush_closer: flush_closer.clone(),
            cleaner_closer: cleaner_closer.clone(),
            log_rotates: AtomicI32::new(0),
        });

        value_log.populate_files_map().await?;

        // Create WAL file 0 if the directory holds none.
        if value_log.wal.files.read().await.map.is_empty() {
            if !value_log.opt.get_read_only() {
                value_log
                    .create_log_file(&value_log.wal)
                    .await
                    .map_err(|e| anyhow!("Error while creating wal file 0 for {}", e))?;
            }
        }

        // Map the value log segments; they are never replayed.
        for fid in value_log.vlog.sorted_fids().await {
            if let Some(lf) = value_log.vlog.get(fid).await {
                lf.write().await.init(None)?;
            }
        }
        if !value_log.vlog.files.read().await.map.is_empty() {
            value_log.init_last_file(&value_log.vlog).await?;
        }

        // Replay WAL files in fid order, starting at the durable head.
        for fid in value_log.wal.sorted_fids().await {
            let lf = match value_log.wal.get(fid).await {
                Some(lf) => lf,
                None => continue,
            };
            if fid < vhead.fid() {
                // Already represented in the LSM; the cleaner removes it.
                continue;
            }
            let mut offset = 0;
            if fid == vhead.fid() {
                offset = vhead.offset() + vhead.len();
            }
            info!("Replaying wal id: {} at offset: {}", fid, offset);
            let start = Instant::now();
            if let Err(e) = value_log.replay_log(lf.clone(), offset, &mut replay_fn).await {
                if e.downcast_ref::<LogError>() == Some(&LogError::DeleteVlogFile) {
                    let removed = {
                        let mut files_w = value_log.wal.files.write().await;
                        files_w.map.remove(&fid)
                    };
                    if let Some(lf) = removed {
                        value_log.delete_log_file(lf).await?;
                    }
                    continue;
                }
                return Err(e);
            }
            info!("Replay took: {:?}", start.elapsed());
        }

        value_log.init_last_file(&value_log.wal).await?;

        tokio::spawn(discard::flush_discard_stats(
            value_log.lsm.clone(),
            value_log.discard_stats.clone(),
            stats_receiver,
            flush_closer,
        ));
        tokio::spawn(cleaner::run_wal_cleaner(
            value_log.clone(),
            del_receiver,
            cleaner_closer,
        ));

        if let Err(e) = value_log.populate_discard_stats().await {
            // Stats are advisory; open proceeds without them.
            warn!("Failed to populate discard stats: {}", e);
        }
        Ok(value_log)
    }

    async fn populate_files_map(&self) -> anyhow::Result<()> {
        let dir = &self.dir_path;
        let read_only = self.opt.get_read_only();
        let mut fp_open_opt = OpenOptions::new();
        fp_open_opt.read(true).write(!read_only);

        let mut wal_found = HashSet::new();
        let mut vlog_found = HashSet::new();
        for ele in read_dir(dir).map_err(|e| err_file(e, dir, "Unable to open log dir."))? {
            let entry = ele.map_err(|e| err_file(e, dir, "Unable to read dir entry"))?;
            let path = entry.path();
            if let Some(fid) = VlogId::parse(&path) {
                if !vlog_found.insert(fid) {
                    bail!("Duplicate vlog file found. Please delete one.");
                }
                self.insert_existing(&self.vlog, fid, &path, fp_open_opt.clone())
                    .await?;
            } else if let Some(fid) = WalId::parse(&path) {
                if !wal_found.insert(fid) {
                    bail!("Duplicate wal file found. Please delete one.");
                }
                self.insert_existing(&self.wal, fid, &path, fp_open_opt.clone())
                    .await?;
            }
        }
        Ok(())
    }

    async fn insert_existing<F: LogFileId>(
        &self,
        set: &LogSet<F>,
        fid: F,
        path: &PathBuf,
        fp_open_opt: OpenOptions,
    ) -> anyhow::Result<()> {
        let (log_file, _) = LogFile::open(
            fid,
            path,
            fp_open_opt,
            self.opt.get_loading_mode(),
            self.key_registry.clone(),
        )
        .await
        .map_err(|e| anyhow!("Open existing file: {:?} for {}", path, e))?;
        let fid: u32 = fid.into();
        let mut files_w = set.files.write().await;
        files_w.map.insert(fid, Arc::new(RwLock::new(log_file)));
        files_w.max_fid = files_w.max_fid.max(fid);
        Ok(())
    }

    /// Creates the next segment of a set and makes it the writable file.
    pub(crate) async fn create_log_file<F: LogFileId>(
        &self,
        set: &LogSet<F>,
    ) -> anyhow::Result<Arc<RwLock<LogFile<F>>>> {
        let fid_u32 = {
            let files_r = set.files.read().await;
            if files_r.map.is_empty() {
                0
            } else {
                files_r.max_fid + 1
            }
        };
        let fid: F = fid_u32.into();
        let file_path = fid.join_dir(&self.dir_path);
        let mut fp_open_opt = OpenOptions::new();
        fp_open_opt.read(true).write(true).create_new(true);
        let (mut log_file, _) = LogFile::open(
            fid,
            &file_path,
            fp_open_opt,
            self.opt.get_loading_mode(),
            self.key_registry.clone(),
        )
        .await?;

        // The directory entry must be durable before the file is advertised.
        sync_dir(&self.dir_path)?;

        if F::MMAP_ALLOWED && self.opt.get_loading_mode() == FileLoadingMode::MemoryMap {
            // Map ahead of the rotation threshold so appends never remap.
            log_file.init(Some(2 * self.opt.get_segment_file_size()))?;
        }

        let log_file = Arc::new(RwLock::new(log_file));
        let mut files_w = set.files.write().await;
        files_w.map.insert(fid_u32, log_file.clone());
        debug_assert!(fid_u32 == 0 || files_w.max_fid < fid_u32);
        files_w.max_fid = fid_u32;
        set.writable_offset
            .store(VLOG_HEADER_SIZE as u32, Ordering::SeqCst);
        set.entries_written.store(0, Ordering::SeqCst);
        drop(files_w);

        self.purge_old_files().await;
        Ok(log_file)
    }

    /// Seeks the writable tail of a set to its end, or starts a fresh file
    /// when the tail's encryption state no longer matches the database's. A
    /// single segment can't mix encrypted and plaintext records.
    pub(crate) async fn init_last_file<F: LogFileId>(&self, set: &LogSet<F>) -> anyhow::Result<()> {
        let last = {
            let files_r = set.files.read().await;
            files_r.map.get(&files_r.max_fid).cloned()
        };
        let last = match last {
            Some(l) => l,
            None => return Ok(()),
        };

        let should_create =
            { last.read().await.encryption_enabled() != self.should_encrypt().await? };
        if should_create {
            self.create_log_file(set).await?;
            return Ok(());
        }

        let mut lf_w = last.write().await;
        let last_offset = lf_w.seek(SeekFrom::End(0))?;
        set.writable_offset
            .store(last_offset as u32, Ordering::SeqCst);
        if F::MMAP_ALLOWED && self.opt.get_loading_mode() == FileLoadingMode::MemoryMap {
            lf_w.init(Some(2 * self.opt.get_segment_file_size()))?;
        }
        Ok(())
    }

    async fn should_encrypt(&self) -> anyhow::Result<bool> {
        Ok(self.key_registry.latest_datakey().await?.is_some())
    }

    /// Finalizes the writable file of a set and opens its successor.
    pub(crate) async fn rotate_file<F: LogFileId>(
        &self,
        set: &LogSet<F>,
        cur: Arc<RwLock<LogFile<F>>>,
    ) -> anyhow::Result<Arc<RwLock<LogFile<F>>>> {
        let offset = set.offset();
        let max_fid = set.files.read().await.max_fid;
        debug_assert!(offset != 0);
        {
            let mut lf_w = cur.write().await;
            debug_assert_eq!(Into::<u32>::into(lf_w.fid()), max_fid);
            lf_w.done_writing(offset)?;
        }
        self.create_log_file(set).await
    }

    #[inline]
    pub(crate) fn incr_log_rotates(&self) {
        self.log_rotates.fetch_add(1, Ordering::SeqCst);
    }

    /// Rotation counter consumed by the LSM to decide memtable flushes.
    pub fn log_rotates(&self) -> i32 {
        self.log_rotates.load(Ordering::SeqCst)
    }

    /// Durability watermark usable as the LSM's `vhead` after open.
    pub async fn wal_head(&self) -> ValuePointer {
        let files_r = self.wal.files.read().await;
        ValuePointer::new(files_r.max_fid, 0, self.wal.offset())
    }

    /// Syncs the current WAL tail. Files below `fid` were already synced at
    /// rotation; `u32::MAX` syncs unconditionally.
    pub async fn sync(&self, fid: u32) -> anyhow::Result<()> {
        if self.opt.get_sync_writes() {
            return Ok(());
        }
        let cur = {
            let files_r = self.wal.files.read().await;
            if fid < files_r.max_fid || files_r.map.is_empty() {
                return Ok(());
            }
            files_r.map.get(&files_r.max_fid).cloned()
        };
        // Creation of the advertised max fid may still be in flight.
        if let Some(lf) = cur {
            let lf_r = lf.read().await;
            lf_r.sync()?;
        }
        Ok(())
    }

    /// Iterators must bracket their lifetime with these two calls so file
    /// deletion is deferred while they might still read.
    pub fn incr_iterator_count(&self) {
        self.vlog.active_iterators.fetch_add(1, Ordering::SeqCst);
    }

    pub fn iterator_count(&self) -> i32 {
        self.vlog.active_iterators.load(Ordering::SeqCst)
    }

    /// The decrement that reaches zero removes every file queued for
    /// deletion while iterators were active.
    pub async fn decr_iterator_count(&self) -> anyhow::Result<()> {
        let num = self.vlog.active_iterators.fetch_sub(1, Ordering::SeqCst) - 1;
        if num != 0 {
            return Ok(());
        }
        let mut to_delete = Vec::new();
        {
            let mut files_w = self.vlog.files.write().await;
            let fids = std::mem::take(&mut files_w.to_be_deleted);
            for fid in fids {
                if let Some(lf) = files_w.map.remove(&fid) {
                    to_delete.push(lf);
                }
            }
        }
        for lf in to_delete {
            self.delete_log_file(lf).await?;
        }
        Ok(())
    }

    pub(crate) async fn delete_log_file<F: LogFileId>(
        &self,
        lf: Arc<RwLock<LogFile<F>>>,
    ) -> anyhow::Result<()> {
        let mut lf_w = lf.write().await;
        info!("Deleting log file {:?}", lf_w.path());
        lf_w.delete()?;
        Ok(())
    }

    /// Deletes every WAL and value log file without waiting for iterators,
    /// then recreates WAL file 0. Used by the upstream drop-everything path;
    /// writes are stopped while this runs.
    pub async fn drop_all(&self) -> anyhow::Result<usize> {
        let mut count = 0;
        count += self.drop_set(&self.vlog).await?;
        count += self.drop_set(&self.wal).await?;

        info!("Value logs deleted. Creating wal file: 0");
        self.create_log_file(&self.wal).await?;
        self.vlog.writable_offset.store(0, Ordering::SeqCst);
        self.vlog.entries_written.store(0, Ordering::SeqCst);
        Ok(count)
    }

    async fn drop_set<F: LogFileId>(&self, set: &LogSet<F>) -> anyhow::Result<usize> {
        let files = {
            let mut files_w = set.files.write().await;
            files_w.max_fid = 0;
            files_w.to_be_deleted.clear();
            std::mem::take(&mut files_w.map)
        };
        let count = files.len();
        for (_, lf) in files {
            self.delete_log_file(lf).await?;
        }
        Ok(count)
    }

    /// Feeds the WAL cleaner the durable head so it can drop WAL files the
    /// LSM no longer needs for recovery.
    pub(crate) async fn purge_old_files(&self) {
        match self.lsm.persisted_head().await {
            Ok(head) => self.wal_cleaner.purge_before(head.fid()).await,
            Err(e) => warn!("Unable to fetch persisted head: {}", e),
        }
    }

    /// Stops the background tasks, blocks any further GC and finalizes the
    /// writable tails.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.flush_closer.signal_and_wait().await;
        self.cleaner_closer.signal_and_wait().await;

        debug!("Stopping garbage collection of values.");
        let permit = self.garbage_sem.clone().acquire_owned().await?;
        permit.forget();

        self.close_set(&self.vlog).await?;
        self.close_set(&self.wal).await?;
        Ok(())
    }

    async fn close_set<F: LogFileId>(&self, set: &LogSet<F>) -> anyhow::Result<()> {
        let (files, max_fid) = {
            let files_r = set.files.read().await;
            (
                files_r
                    .map
                    .iter()
                    .map(|(fid, lf)| (*fid, lf.clone()))
                    .collect::<Vec<_>>(),
                files_r.max_fid,
            )
        };
        for (fid, lf) in files {
            let mut lf_w = lf.write().await;
            lf_w.munmap();
            if !self.opt.get_read_only() && fid == max_fid {
                // Truncate the writable file to its true size.
                lf_w.truncate(set.offset())?;
            }
        }
        Ok(())
    }
}
