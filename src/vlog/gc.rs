use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use anyhow::{anyhow, bail, ensure};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::RwLock;

use crate::{
    default::MOVE_KEY_PREFIX,
    errors::LogError,
    kv::{key_with_ts, Entry, KeyTs, Meta, ValuePointer, ValueStruct},
    lsm::LsmStore,
    util::{log_file::LogFile, VlogId},
    vlog::{read::LogFileIter, ValueLog, VLOG_HEADER_SIZE},
};

const MIB: f64 = (1 << 20) as f64;

// Sampling keeps going until it has seen 10% of the file, 1% of the
// per-segment entry budget, or ten seconds have passed.
const GC_SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

fn is_deleted_or_expired(meta: Meta, expires_at: u64) -> bool {
    if meta.contains(Meta::DELETE) {
        return true;
    }
    if expires_at == 0 {
        return false;
    }
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    expires_at <= now
}

impl<L: LsmStore> ValueLog<L> {
    /// Runs one round of value log garbage collection. At most one GC runs
    /// at a time; a second call while one is in flight returns `REJECTED`.
    /// `NO_REWRITE` means no candidate produced enough discardable data.
    pub async fn run_gc(&self, discard_ratio: f64) -> anyhow::Result<()> {
        let _permit = match self.garbage_sem.try_acquire() {
            Ok(permit) => permit,
            Err(_) => bail!(LogError::Rejected),
        };

        let files = self.pick_log().await;
        if files.is_empty() {
            bail!(LogError::NoRewrite);
        }
        let mut tried = HashSet::new();
        let mut last_err = None;
        for lf in files {
            let fid: u32 = { lf.read().await.fid().into() };
            if !tried.insert(fid) {
                continue;
            }
            match self.do_run_gc(lf, discard_ratio).await {
                Ok(()) => return self.delete_move_keys_for(fid).await,
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| LogError::NoRewrite.into()))
    }

    /// Picks up to two candidates: the file with the most recorded discard,
    /// and a random one biased toward smaller fids. The writable file is
    /// never picked.
    async fn pick_log(&self) -> Vec<Arc<RwLock<LogFile<VlogId>>>> {
        let files_r = self.vlog.files.read().await;
        let to_be_deleted = files_r
            .to_be_deleted
            .iter()
            .copied()
            .collect::<HashSet<_>>();
        let fids = files_r
            .map
            .keys()
            .filter(|&&fid| fid < files_r.max_fid && !to_be_deleted.contains(&fid))
            .copied()
            .collect::<Vec<_>>();
        if fids.is_empty() {
            return Vec::new();
        }

        let mut files = Vec::with_capacity(2);
        if let Some((fid, discard)) = self.discard_stats.max_discard(&fids).await {
            debug!("Found candidate via discard stats: {} {}", fid, discard);
            if let Some(lf) = files_r.map.get(&fid) {
                files.push(lf.clone());
            }
        } else {
            debug!("Could not find candidate via discard stats. Randomly picking one.");
        }

        // Fallback to a random pick; a second draw favors smaller fids.
        let mut rng = rand::thread_rng();
        let mut idx = rng.gen_range(0..fids.len());
        if idx > 0 {
            idx = rng.gen_range(0..=idx);
        }
        debug!("Randomly chose fid: {}", fids[idx]);
        if let Some(lf) = files_r.map.get(&fids[idx]) {
            files.push(lf.clone());
        }
        files
    }

    /// Decides whether a record still needs its spot in the value log.
    /// `vs` is the LSM's latest version for the record's key.
    pub(crate) async fn discard_entry(&self, e: &Entry, vs: &ValueStruct) -> anyhow::Result<bool> {
        if vs.version != e.version() {
            // A newer version exists.
            return Ok(true);
        }
        if is_deleted_or_expired(vs.meta, vs.expires_at) {
            return Ok(true);
        }
        if !vs.meta.contains(Meta::VALUE_POINTER) {
            // The key now stores its value in the LSM.
            return Ok(true);
        }
        if vs.meta.contains(Meta::FIN_TXN) {
            // Just a txn finish entry.
            return Ok(true);
        }
        if e.is_move_key() {
            // A move key whose underlying key has no live version would
            // otherwise keep hopping from vlog to vlog during rewrites.
            let stripped = &e.key()[MOVE_KEY_PREFIX.len()..];
            let key = key_with_ts(stripped, e.version());
            return match self.lsm.get(&key).await {
                Ok(avs) => Ok(avs.version == 0),
                Err(_) => Ok(false),
            };
        }
        Ok(false)
    }

    /// Samples a window of the candidate and rewrites it when the
    /// discardable share clears the threshold.
    async fn do_run_gc(
        &self,
        lf: Arc<RwLock<LogFile<VlogId>>>,
        discard_ratio: f64,
    ) -> anyhow::Result<()> {
        let fid: u32;
        let mut total = 0_f64;
        let mut discard = 0_f64;
        let mut count = 0_usize;
        let (size_window_m, count_window) = {
            let lf_r = lf.read().await;
            fid = lf_r.fid().into();
            let file_size = lf_r.file_size()?;

            let size_window = file_size as f64 * 0.1;
            let size_window_m = size_window / MIB;
            let count_window = (self.opt.get_segment_max_entries() as f64 * 0.01) as usize;

            // Random start, pulled back by a window to avoid hitting EOF.
            let skip_first_m =
                (rand::thread_rng().gen_range(0..file_size.max(1)) as f64 - size_window) / MIB;
            debug!(
                "Size window: {:.2}. Count window: {}. Skip first: {:.2} MB of fid: {}",
                size_window, count_window, skip_first_m, fid
            );
            let mut skipped = 0_f64;

            let start = Instant::now();
            let mut iter = LogFileIter::new(&*lf_r, VLOG_HEADER_SIZE as u32)?;
            loop {
                let (entry, vp) = match iter.next_entry()? {
                    Some(next) => next,
                    None => break,
                };
                let esz = vp.len() as f64 / MIB;
                if skipped < skip_first_m {
                    skipped += esz;
                    continue;
                }
                if count > count_window {
                    break;
                }
                if total > size_window_m {
                    break;
                }
                if start.elapsed() > GC_SAMPLE_TIMEOUT {
                    break;
                }
                total += esz;
                count += 1;

                let vs = self.lsm.get(&key_with_ts(entry.key(), u64::MAX)).await?;
                if self.discard_entry(&entry, &vs).await? {
                    discard += esz;
                    continue;
                }

                // The value is still in the value log somewhere.
                ensure!(!vs.value.is_empty(), "Empty value: {:?}", vs);
                let vp_lsm = ValuePointer::decode(&vs.value);
                if vp_lsm.fid() > fid {
                    // Present in a later log.
                    discard += esz;
                    continue;
                }
                if vp_lsm.offset() > entry.offset() {
                    // Present at a later offset in this log.
                    discard += esz;
                    continue;
                }
                if vp_lsm.fid() == fid && vp_lsm.offset() == entry.offset() {
                    // Still the authoritative copy; a rewrite must move it.
                    continue;
                }
                bail!(
                    "This shouldn't happen. Latest pointer: {:?}. Meta: {:?}.",
                    vp_lsm,
                    vs.meta
                );
            }
            (size_window_m, count_window)
        };

        debug!(
            "Fid: {}. Sampled: {:.2} MB, {} entries, {:.2} MB discardable",
            fid, total, count, discard
        );

        // Without enough samples, or with too little garbage, skip.
        if (count < count_window && total < size_window_m * 0.75)
            || discard < discard_ratio * total
        {
            debug!("Skipping GC on fid: {}", fid);
            bail!(LogError::NoRewrite);
        }

        self.rewrite(lf).await?;
        self.discard_stats.remove(fid).await;
        debug!("Done rewriting fid: {}", fid);
        Ok(())
    }

    /// Re-submits every live record of `f` through the LSM under the move
    /// prefix, then removes the file (or defers removal until the active
    /// iterators are gone).
    async fn rewrite(&self, lf: Arc<RwLock<LogFile<VlogId>>>) -> anyhow::Result<()> {
        let fid: u32 = { lf.read().await.fid().into() };
        let max_fid = self.vlog.files.read().await.max_fid;
        ensure!(
            fid < max_fid,
            "fid to move: {}. Current max fid: {}",
            fid,
            max_fid
        );
        info!("Rewriting fid: {}", fid);

        let mut write_batch: Vec<Entry> = Vec::with_capacity(1000);
        let mut batch_bytes: u64 = 0;
        let mut count = 0_usize;
        let mut moved = 0_usize;
        {
            let lf_r = lf.read().await;
            let mut iter = LogFileIter::new(&*lf_r, VLOG_HEADER_SIZE as u32)?;
            while let Some((entry, _)) = iter.next_entry()? {
                count += 1;
                if count % 100_000 == 0 {
                    debug!("Processing entry {}", count);
                }

                let vs = self.lsm.get(&entry.key_ts().get_bytes()).await?;
                if self.discard_entry(&entry, &vs).await? {
                    continue;
                }
                ensure!(!vs.value.is_empty(), "Empty value: {:?}", vs);
                let vp = ValuePointer::decode(&vs.value);

                if vp.fid() > fid {
                    // The LSM already points at a newer vlog file.
                    continue;
                }
                if vp.offset() > entry.offset() {
                    // Later offset in the same file.
                    continue;
                }
                if vp.fid() == fid && vp.offset() == entry.offset() {
                    moved += 1;
                    // Rewriting under the original key would put a stale
                    // version on top of the LSM, so the copy moves into the
                    // parallel move keyspace instead. The txn bits don't
                    // come along.
                    let key = if entry.is_move_key() {
                        entry.key().to_vec()
                    } else {
                        let mut key =
                            Vec::with_capacity(MOVE_KEY_PREFIX.len() + entry.key().len());
                        key.extend_from_slice(MOVE_KEY_PREFIX);
                        key.extend_from_slice(entry.key());
                        key
                    };
                    let mut ne = Entry::from_key_ts(
                        KeyTs::new(&key, entry.version()),
                        entry.value().to_vec(),
                    );
                    ne.set_user_meta(entry.user_meta());
                    ne.set_expires_at(entry.expires_at());

                    // Count the value size too, or rewrites of large values
                    // balloon memory before the batch limit trips.
                    let mut es = ne.estimate_size(self.opt.get_value_threshold()) as u64;
                    es += entry.value().len() as u64;

                    if (write_batch.len() + 1) as u64 >= self.opt.get_max_batch_count()
                        || batch_bytes + es >= self.opt.get_max_batch_size()
                    {
                        self.lsm
                            .batch_set(std::mem::take(&mut write_batch))
                            .await?;
                        batch_bytes = 0;
                    }
                    write_batch.push(ne);
                    batch_bytes += es;
                } else {
                    // The LSM may legitimately point at an *older* vlog file
                    // for this key: stale move keys on lower levels survive
                    // until compaction drops them. Nothing to do here.
                }
            }
        }

        self.batch_set_all(&write_batch, 1024).await?;
        debug!("Total entries: {}. Moved: {}", count, moved);
        info!("Removing fid: {}", fid);

        let mut delete_file_now = false;
        {
            let mut files_w = self.vlog.files.write().await;
            ensure!(files_w.map.contains_key(&fid), "Unable to find fid: {}", fid);
            if self.iterator_count() == 0 {
                files_w.map.remove(&fid);
                delete_file_now = true;
            } else {
                files_w.to_be_deleted.push(fid);
            }
        }
        if delete_file_now {
            self.delete_log_file(lf).await?;
        }
        Ok(())
    }

    /// Submits entries in slices, halving the slice on `TXN_TOO_BIG`.
    async fn batch_set_all(&self, entries: &[Entry], initial_batch: usize) -> anyhow::Result<()> {
        let mut batch_size = initial_batch;
        let mut i = 0;
        while i < entries.len() {
            if batch_size == 0 {
                warn!("We shouldn't reach batch size of zero.");
                bail!(LogError::NoRewrite);
            }
            let end = (i + batch_size).min(entries.len());
            match self.lsm.batch_set(entries[i..end].to_vec()).await {
                Ok(()) => i = end,
                Err(e) => {
                    if e.downcast_ref::<LogError>() == Some(&LogError::TxnTooBig) {
                        batch_size /= 2;
                        debug!("Dropped batch size to {}", batch_size);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Tombstones every move key still pointing into `fid`.
    async fn delete_move_keys_for(&self, fid: u32) -> anyhow::Result<()> {
        debug!("Iterating over move keys to find invalids for fid: {}", fid);
        let items = self
            .lsm
            .scan_prefix(MOVE_KEY_PREFIX)
            .await
            .map_err(|e| anyhow!("Got error while iterating move keys: {}", e))?;

        let mut invalid = Vec::new();
        let mut pointers = 0_u64;
        for (key, vs) in &items {
            if !vs.meta.contains(Meta::VALUE_POINTER) {
                continue;
            }
            pointers += 1;
            let vp = ValuePointer::decode(&vs.value);
            if vp.fid() == fid {
                let mut e = Entry::from_key_ts(KeyTs::new(key, vs.version), Vec::new());
                e.set_meta(Meta::DELETE);
                invalid.push(e);
            }
        }
        debug!(
            "Num total move keys: {}. Num pointers: {}. Num invalid: {}",
            items.len(),
            pointers,
            invalid.len()
        );
        self.batch_set_all(&invalid, 10240).await?;
        debug!("Move keys deletion done.");
        Ok(())
    }
}
