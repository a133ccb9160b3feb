use std::sync::Arc;

use log::{error, info};
use tokio::{
    select,
    sync::mpsc::{self, Receiver},
};

use crate::{
    default::WAL_CLEANER_CHANNEL_CAPACITY, lsm::LsmStore, util::closer::Closer, vlog::ValueLog,
};

/// Feeds "purge everything below this fid" advice to the background WAL
/// cleaner. WAL files strictly below the durable head are fully represented
/// in the LSM and only waste recovery time.
#[derive(Debug)]
pub(crate) struct WalCleaner {
    sender: mpsc::Sender<u32>,
}

impl WalCleaner {
    pub(crate) fn new() -> (Self, Receiver<u32>) {
        let (sender, receiver) = mpsc::channel(WAL_CLEANER_CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    /// After shutdown the channel is closed and this becomes a no-op.
    pub(crate) async fn purge_before(&self, fid: u32) {
        let _ = self.sender.send(fid).await;
    }
}

pub(crate) async fn run_wal_cleaner<L: LsmStore>(
    value_log: Arc<ValueLog<L>>,
    mut receiver: Receiver<u32>,
    closer: Closer,
) {
    loop {
        select! {
            _ = closer.captured() => {
                receiver.close();
                closer.done();
                return;
            }
            head_fid = receiver.recv() => {
                let head_fid = match head_fid {
                    Some(fid) => fid,
                    None => {
                        closer.done();
                        return;
                    }
                };
                drop_before(&value_log, head_fid).await;
            }
        }
    }
}

async fn drop_before<L: LsmStore>(value_log: &Arc<ValueLog<L>>, head_fid: u32) {
    let fids = value_log.wal.sorted_fids().await;
    for fid in fids {
        // Never drop the file the head pointer lies on.
        if fid >= head_fid {
            break;
        }
        let removed = {
            let mut files_w = value_log.wal.files.write().await;
            files_w.map.remove(&fid)
        };
        if let Some(lf) = removed {
            info!("Deleting wal {:06}", fid);
            if let Err(e) = value_log.delete_log_file(lf).await {
                error!("Failed to delete wal {:06}, err: {}", fid, e);
            }
        }
    }
}
