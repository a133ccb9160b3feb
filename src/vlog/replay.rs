use std::sync::Arc;

use anyhow::{bail, Context};
use log::{info, warn};
use tokio::sync::RwLock;

use crate::{
    errors::{err_file, LogError},
    kv::{Entry, Meta, ValuePointer},
    lsm::LsmStore,
    util::{log_file::LogFile, LogFileId, WalId},
    vlog::{read::LogFileIter, ValueLog, VLOG_HEADER_SIZE},
};

/// Walks a log file applying transactional framing. Entries of an open
/// transaction are buffered and surfaced through `entry_fn` only once the
/// commit marker validates, so a torn tail never reaches the caller.
/// Returns the offset just past the last committed record.
pub(crate) fn iterate<F: LogFileId>(
    log_file: &LogFile<F>,
    read_only: bool,
    mut offset: u32,
    entry_fn: &mut dyn FnMut(Entry, ValuePointer) -> anyhow::Result<()>,
) -> anyhow::Result<u32> {
    let file_size = log_file.file_size()?;
    if offset == 0 {
        // Advance past the key-id/IV header.
        offset = VLOG_HEADER_SIZE as u32;
    }
    if offset as u64 == file_size {
        return Ok(offset);
    }
    if read_only {
        // Not at the end of the file: replay would have to truncate.
        bail!(LogError::ReplayNeeded);
    }

    let mut iter = LogFileIter::new(log_file, offset)?;
    // 0 means "outside a transaction".
    let mut last_commit: u64 = 0;
    let mut valid_end_offset = offset;
    let mut pending: Vec<(Entry, ValuePointer)> = Vec::new();

    loop {
        let (entry, vp) = match iter.next_entry()? {
            Some(next) => next,
            None => break,
        };
        let meta = entry.meta();

        if meta.contains(Meta::TXN) {
            let txn_ts = entry.version();
            if last_commit == 0 {
                last_commit = txn_ts;
            }
            if last_commit != txn_ts {
                // Torn transaction.
                break;
            }
            pending.push((entry, vp));
        } else if meta.contains(Meta::FIN_TXN) {
            let txn_ts = match std::str::from_utf8(entry.value())
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(ts) => ts,
                None => break,
            };
            if last_commit != txn_ts {
                break;
            }
            // Got the end of the txn; its entries can be surfaced now.
            last_commit = 0;
            valid_end_offset = iter.record_offset();
            for (e, vp) in pending.drain(..) {
                entry_fn(e, vp).context("Iteration function")?;
            }
        } else {
            if last_commit != 0 {
                // Most likely a GC-moved entry; it can't appear in the
                // middle of a transaction.
                break;
            }
            valid_end_offset = iter.record_offset();
            entry_fn(entry, vp).context("Iteration function")?;
        }
    }
    Ok(valid_end_offset)
}

impl<L: LsmStore> ValueLog<L> {
    /// Replays one WAL file from `offset` and reconciles its tail: torn or
    /// corrupt data past the last committed transaction is truncated when
    /// the options allow it, an effectively-empty non-tail file is reported
    /// for deletion, and an effectively-empty tail file is re-bootstrapped.
    pub(crate) async fn replay_log(
        &self,
        lf: Arc<RwLock<LogFile<WalId>>>,
        offset: u32,
        replay_fn: &mut (dyn FnMut(Entry, ValuePointer) -> anyhow::Result<()>),
    ) -> anyhow::Result<()> {
        let wal_max_fid = self.wal.files.read().await.max_fid;

        let mut lf_w = lf.write().await;
        let file_size = lf_w.file_size()?;
        let end_offset = iterate(&*lf_w, self.opt.get_read_only(), offset, replay_fn)
            .map_err(|e| e.context(format!("Unable to replay wal file {:?}", lf_w.path())))?;
        if end_offset as u64 == file_size {
            return Ok(());
        }

        // End offset differs from the file size; the tail has to go.
        if !self.opt.get_truncate() {
            warn!(
                "Truncate Needed. File {:?} size: {} Endoffset: {}",
                lf_w.path(),
                file_size,
                end_offset
            );
            bail!(LogError::TruncateNeeded);
        }

        if end_offset as usize <= VLOG_HEADER_SIZE {
            if Into::<u32>::into(lf_w.fid()) != wal_max_fid {
                // Nothing but the header survived and the file is not the
                // writable tail: drop it entirely.
                bail!(LogError::DeleteVlogFile);
            }
            return lf_w.bootstrap().await;
        }

        info!(
            "Truncating wal file {:?} to offset: {}",
            lf_w.path(),
            end_offset
        );
        lf_w.truncate(end_offset).map_err(|e| {
            err_file(
                e,
                lf_w.path(),
                &format!(
                    "Truncation needed at offset {}. Can be done manually as well.",
                    end_offset
                ),
            )
        })?;
        Ok(())
    }
}
