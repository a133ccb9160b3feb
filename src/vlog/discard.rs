use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use log::{debug, error, warn};
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError, Receiver},
        RwLock,
    },
};

use crate::{
    default::{
        DISCARD_STATS_CHANNEL_CAPACITY, DISCARD_STATS_FLUSH_THRESHOLD, DISCARD_STATS_KEY,
        MOVE_KEY_PREFIX,
    },
    errors::LogError,
    kv::{key_with_ts, Entry, KeyTs, Meta, ValuePointer},
    lsm::LsmStore,
    util::closer::Closer,
    vlog::ValueLog,
};

/// Tracks how much dead data each vlog file carries. The LSM reports
/// per-fid deltas during compactions; GC consults the totals when picking a
/// candidate. The stats are advisory: updates may be dropped under
/// pressure, and correctness never depends on them.
#[derive(Debug, Clone)]
pub(crate) struct DiscardStats(Arc<DiscardStatsInner>);

#[derive(Debug)]
struct DiscardStatsInner {
    stats: RwLock<StatsMap>,
    sender: mpsc::Sender<HashMap<u32, i64>>,
}

#[derive(Debug, Default)]
struct StatsMap {
    m: HashMap<u32, i64>,
    updates_since_flush: usize,
}

impl DiscardStats {
    pub(crate) fn new() -> (Self, Receiver<HashMap<u32, i64>>) {
        let (sender, receiver) = mpsc::channel(DISCARD_STATS_CHANNEL_CAPACITY);
        (
            Self(Arc::new(DiscardStatsInner {
                stats: RwLock::new(StatsMap::default()),
                sender,
            })),
            receiver,
        )
    }

    /// Queues a delta for the background flusher; dropped with a warning
    /// when the channel is full.
    pub(crate) fn update(&self, stats: HashMap<u32, i64>) {
        match self.0.sender.try_send(stats) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {
                warn!("discard stats flush channel full, returning without pushing update");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) async fn send(&self, stats: HashMap<u32, i64>) -> anyhow::Result<()> {
        self.0
            .sender
            .send(stats)
            .await
            .map_err(|e| anyhow!("discard stats channel closed: {}", e))
    }

    /// The fid among `fids` with the largest positive dead-byte total.
    pub(crate) async fn max_discard(&self, fids: &[u32]) -> Option<(u32, i64)> {
        let stats_r = self.0.stats.read().await;
        let mut best: Option<(u32, i64)> = None;
        for &fid in fids {
            if let Some(&discard) = stats_r.m.get(&fid) {
                if discard > 0 && best.map_or(true, |(_, b)| discard > b) {
                    best = Some((fid, discard));
                }
            }
        }
        best
    }

    pub(crate) async fn remove(&self, fid: u32) {
        let mut stats_w = self.0.stats.write().await;
        stats_w.m.remove(&fid);
    }
}

/// Merges queued deltas into the map and, every
/// `DISCARD_STATS_FLUSH_THRESHOLD` updates, persists the whole map as a
/// JSON entry through the normal write path.
pub(crate) async fn flush_discard_stats<L: LsmStore>(
    lsm: Arc<L>,
    discard_stats: DiscardStats,
    mut receiver: Receiver<HashMap<u32, i64>>,
    closer: Closer,
) {
    loop {
        select! {
            _ = closer.captured() => {
                // Updates still queued are dropped; stats are advisory.
                closer.done();
                return;
            }
            stats = receiver.recv() => {
                let stats = match stats {
                    Some(stats) => stats,
                    None => {
                        closer.done();
                        return;
                    }
                };
                if let Err(e) = process_stats(&lsm, &discard_stats, stats).await {
                    error!("unable to process discardstats with error: {}", e);
                }
            }
        }
    }
}

async fn process_stats<L: LsmStore>(
    lsm: &Arc<L>,
    discard_stats: &DiscardStats,
    stats: HashMap<u32, i64>,
) -> anyhow::Result<()> {
    let encoded = {
        let mut stats_w = discard_stats.0.stats.write().await;
        for (fid, count) in stats {
            *stats_w.m.entry(fid).or_default() += count;
            stats_w.updates_since_flush += 1;
        }
        if stats_w.updates_since_flush > DISCARD_STATS_FLUSH_THRESHOLD {
            stats_w.updates_since_flush = 0;
            Some(serde_json::to_vec(&stats_w.m)?)
        } else {
            None
        }
    };

    if let Some(encoded) = encoded {
        let entry = Entry::from_key_ts(KeyTs::new(DISCARD_STATS_KEY, 1), encoded);
        lsm.batch_set(vec![entry])
            .await
            .map_err(|e| anyhow!("failed to push discard stats to write channel: {}", e))?;
    }
    Ok(())
}

impl<L: LsmStore> ValueLog<L> {
    /// Forwards compaction-reported dead-byte deltas to the tracker.
    pub fn update_discard_stats(&self, stats: HashMap<u32, i64>) {
        self.discard_stats.update(stats);
    }

    /// Re-seeds the tracker from the persisted entry, following one level
    /// of move-prefix indirection in case GC relocated it.
    pub(crate) async fn populate_discard_stats(&self) -> anyhow::Result<()> {
        let mut key = key_with_ts(DISCARD_STATS_KEY, u64::MAX);
        let mut val: Vec<u8>;
        loop {
            let vs = self.lsm.get(&key).await?;
            if vs.meta.is_empty() && vs.value.is_empty() {
                debug!("Value log discard stats empty");
                return Ok(());
            }
            if !vs.meta.contains(Meta::VALUE_POINTER) {
                // Stored inline in the LSM.
                val = vs.value;
                break;
            }
            let vp = ValuePointer::decode(&vs.value);
            match self.read(vp).await {
                Ok(result) => {
                    val = result.value().to_vec();
                    break;
                }
                Err(e) => {
                    if e.downcast_ref::<LogError>() != Some(&LogError::Retry) {
                        return Err(e);
                    }
                    if key.starts_with(MOVE_KEY_PREFIX) {
                        // Both the original key and the moved one missed.
                        val = Vec::new();
                        break;
                    }
                    // The stats entry was moved by the GC; look it up under
                    // the move prefix.
                    let mut moved = MOVE_KEY_PREFIX.to_vec();
                    moved.extend_from_slice(&key);
                    key = moved;
                }
            }
        }

        if val.is_empty() {
            return Ok(());
        }
        let stats_map: HashMap<u32, i64> = serde_json::from_slice(&val)
            .map_err(|e| anyhow!("failed to unmarshal discard stats: {}", e))?;
        debug!("Value log discard stats: {:?}", stats_map);
        self.discard_stats.send(stats_map).await
    }
}
