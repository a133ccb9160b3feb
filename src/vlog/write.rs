use std::{mem, sync::atomic::Ordering, sync::Arc};

use anyhow::anyhow;
use anyhow::bail;
use bytes::BufMut;
use tokio::sync::RwLock;

use crate::{
    default::DEFAULT_PAGE_SIZE,
    errors::{err_file, LogError},
    kv::{Entry, Meta, ValuePointer},
    lsm::LsmStore,
    util::{log_file::LogFile, LogFileId},
    vlog::{header::EntryHeader, LogSet, ValueLog, MAX_VLOG_FILE_SIZE},
};

use super::header::MAX_HEADER_SIZE;

/// One transaction handed to the writer: its entries land in a single WAL
/// file atomically with respect to other requests. `ptrs` and `head` are
/// filled in by the writer.
#[derive(Debug, Default)]
pub struct Request {
    pub entries: Vec<Entry>,
    /// One pointer per entry; zero when the value stayed out of the vlog.
    pub ptrs: Vec<ValuePointer>,
    /// WAL position of the first written entry, usable as the durability
    /// watermark once this request commits.
    pub head: ValuePointer,
}

impl Request {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            ptrs: Vec::with_capacity(entries.len()),
            entries,
            head: ValuePointer::default(),
        }
    }
}

/// Accumulates record bytes while folding them into a CRC-32C.
pub(crate) struct HashWriter<'a> {
    writer: &'a mut Vec<u8>,
    crc: u32,
}

impl<'a> HashWriter<'a> {
    pub(crate) fn new(writer: &'a mut Vec<u8>) -> Self {
        Self { writer, crc: 0 }
    }

    pub(crate) fn append(&mut self, buf: &[u8]) -> usize {
        self.writer.put_slice(buf);
        self.crc = crc32c::crc32c_append(self.crc, buf);
        buf.len()
    }

    pub(crate) fn finalize(self) -> (&'a mut Vec<u8>, u32) {
        (self.writer, self.crc)
    }
}

impl<F: LogFileId> LogFile<F> {
    // layout of entry
    // +--------+-----+-------+-------+
    // | header | key | value | crc32 |
    // +--------+-----+-------+-------+
    //
    // The checksum covers the on-disk form: when encryption is on, it is
    // computed over the ciphertext.
    pub(crate) fn encode_entry(&self, buf: &mut Vec<u8>, entry: &Entry, offset: u32) -> usize {
        let header = EntryHeader::new(entry);
        let mut hash_writer = HashWriter::new(buf);
        let header_len = hash_writer.append(&header.encode());

        let mut kv_buf = entry.key_ts().get_bytes();
        kv_buf.extend_from_slice(entry.value());
        if let Some(e) = self.try_encrypt(&kv_buf, offset) {
            kv_buf = e;
        }
        let kv_len = hash_writer.append(&kv_buf);

        let (buf, crc) = hash_writer.finalize();
        buf.put_u32(crc);
        header_len + kv_len + mem::size_of::<u32>()
    }
}

/// Checks a batch against the running segment offset: a request may never
/// push a segment past the 4 GiB pointer limit; reaching the rotation
/// threshold resets the running offset.
pub(crate) fn validate_offsets(
    start_offset: u64,
    segment_file_size: u64,
    req_sizes: impl Iterator<Item = u64>,
) -> anyhow::Result<()> {
    let mut offset = start_offset;
    for size in req_sizes {
        let estimate = offset + size;
        if estimate > MAX_VLOG_FILE_SIZE as u64 {
            bail!(LogError::SizeExceeded {
                estimate,
                max: MAX_VLOG_FILE_SIZE as u64,
            });
        }
        if estimate >= segment_file_size {
            offset = 0;
            continue;
        }
        offset = estimate;
    }
    Ok(())
}

fn estimate_request_size(req: &Request) -> u64 {
    req.entries
        .iter()
        .map(|e| {
            (MAX_HEADER_SIZE + e.key_ts().len() + e.value().len() + mem::size_of::<u32>()) as u64
        })
        .sum()
}

impl<L: LsmStore> ValueLog<L> {
    /// Writes a batch of transactional requests. Single-threaded by
    /// contract: the upstream scheduler never calls this concurrently with
    /// itself. Pointers are recorded into each request, and every flushed
    /// record is fsynced before this returns.
    pub async fn write(&self, reqs: &mut [Request]) -> anyhow::Result<()> {
        self.validate_writes(reqs)?;

        let mut cur_wal = self
            .wal
            .current_file()
            .await
            .ok_or_else(|| anyhow!("No writable wal file"))?;
        let mut cur_vlog = self.vlog.current_file().await;

        let mut wbuf: Vec<u8> = Vec::with_capacity(*DEFAULT_PAGE_SIZE);
        let mut vbuf: Vec<u8> = Vec::with_capacity(*DEFAULT_PAGE_SIZE);
        let segment_file_size = self.opt.get_segment_file_size();

        for req in reqs.iter_mut() {
            let Request {
                entries,
                ptrs,
                head,
            } = req;
            ptrs.clear();
            *head = ValuePointer::default();
            let mut wal_written = 0_u32;
            let mut vlog_written = 0_u32;

            for entry in entries.iter_mut() {
                if entry.skip_vlog() {
                    ptrs.push(ValuePointer::default());
                    continue;
                }

                // The WAL records every entry.
                let w_offset = self.wal.offset() + wbuf.len() as u32;
                let (len, wal_fid) = {
                    let wal_r = cur_wal.read().await;
                    (
                        wal_r.encode_entry(&mut wbuf, entry, w_offset),
                        wal_r.fid().into(),
                    )
                };
                if head.is_empty() {
                    *head = ValuePointer::new(wal_fid, len, w_offset);
                }
                wal_written += 1;
                // A transaction full of large values can outgrow the
                // segment size before it completes; flush mid-request
                // rather than buffering it all.
                if wbuf.len() > segment_file_size {
                    self.flush_buf_to_file(&self.wal, &cur_wal, &mut wbuf)
                        .await?;
                }

                if entry.value().len() < self.opt.get_value_threshold() {
                    // Value stays inline in the LSM.
                    ptrs.push(ValuePointer::default());
                    continue;
                }

                let vlog_f = match &cur_vlog {
                    Some(f) => f.clone(),
                    None => {
                        let f = self.create_log_file(&self.vlog).await.map_err(|e| {
                            anyhow!("Error while creating vlog file in write for {}", e)
                        })?;
                        cur_vlog = Some(f.clone());
                        f
                    }
                };

                // The txn bits have to be cleared for vlog GC to work, but
                // the LSM still needs them. Restore after encoding.
                let meta = entry.meta();
                entry.set_meta(meta - (Meta::TXN | Meta::FIN_TXN));
                let p_offset = self.vlog.offset() + vbuf.len() as u32;
                let (plen, vlog_fid) = {
                    let vlog_r = vlog_f.read().await;
                    (
                        vlog_r.encode_entry(&mut vbuf, entry, p_offset),
                        vlog_r.fid().into(),
                    )
                };
                entry.set_meta(meta);
                ptrs.push(ValuePointer::new(vlog_fid, plen, p_offset));
                vlog_written += 1;

                if vbuf.len() > segment_file_size {
                    self.flush_buf_to_file(&self.vlog, &vlog_f, &mut vbuf)
                        .await?;
                }
            } // Transaction completed.

            self.wal
                .entries_written
                .fetch_add(wal_written, Ordering::SeqCst);
            self.vlog
                .entries_written
                .fetch_add(vlog_written, Ordering::SeqCst);

            // Land all entries of this request in the same WAL file before
            // any rotation can happen.
            let write_now = self.threshold_crossed(&self.wal, wbuf.len())
                || self.threshold_crossed(&self.vlog, vbuf.len());
            if write_now {
                self.to_disk(&mut cur_wal, &mut cur_vlog, &mut wbuf, &mut vbuf)
                    .await?;
            }
        } // All requests processed.

        self.to_disk(&mut cur_wal, &mut cur_vlog, &mut wbuf, &mut vbuf)
            .await
    }

    fn validate_writes(&self, reqs: &[Request]) -> anyhow::Result<()> {
        validate_offsets(
            self.wal.offset() as u64,
            self.opt.get_segment_file_size() as u64,
            reqs.iter().map(estimate_request_size),
        )
    }

    fn threshold_crossed<F: LogFileId>(&self, set: &LogSet<F>, buffered: usize) -> bool {
        set.offset() as usize + buffered > self.opt.get_segment_file_size()
            || set.entries_written.load(Ordering::SeqCst) > self.opt.get_segment_max_entries()
    }

    async fn flush_buf_to_file<F: LogFileId>(
        &self,
        set: &LogSet<F>,
        lf: &Arc<RwLock<LogFile<F>>>,
        buf: &mut Vec<u8>,
    ) -> anyhow::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let lf_r = lf.read().await;
        lf_r.append(buf)
            .map_err(|e| err_file(e, lf_r.path(), "Unable to write to log file"))?;
        // Pointers handed to the LSM must reference fsynced records.
        lf_r.sync()
            .map_err(|e| err_file(e, lf_r.path(), "Unable to sync log file"))?;
        let n = buf.len() as u32;
        buf.clear();
        let new_offset = set.writable_offset.fetch_add(n, Ordering::SeqCst) + n;
        lf_r.set_size(new_offset);
        Ok(())
    }

    async fn to_disk(
        &self,
        cur_wal: &mut Arc<RwLock<LogFile<crate::util::WalId>>>,
        cur_vlog: &mut Option<Arc<RwLock<LogFile<crate::util::VlogId>>>>,
        wbuf: &mut Vec<u8>,
        vbuf: &mut Vec<u8>,
    ) -> anyhow::Result<()> {
        self.flush_buf_to_file(&self.wal, cur_wal, wbuf).await?;
        if let Some(vlog_f) = cur_vlog.as_ref() {
            self.flush_buf_to_file(&self.vlog, vlog_f, vbuf).await?;
        }

        // WAL and vlog rotate independently, each on its own thresholds.
        if self.threshold_crossed(&self.vlog, 0) {
            if let Some(vlog_f) = cur_vlog.clone() {
                *cur_vlog = Some(self.rotate_file(&self.vlog, vlog_f).await?);
            }
        }
        if self.threshold_crossed(&self.wal, 0) {
            *cur_wal = self.rotate_file(&self.wal, cur_wal.clone()).await?;
            // Only WAL rotations count: the LSM watches this to move vhead.
            self.incr_log_rotates();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::LogError;
    use crate::vlog::MAX_VLOG_FILE_SIZE;

    use super::validate_offsets;

    #[test]
    fn test_validate_rejects_overflowing_request() {
        let err = validate_offsets(
            MAX_VLOG_FILE_SIZE as u64 - 10,
            1 << 30,
            std::iter::once(100_u64),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LogError>(),
            Some(LogError::SizeExceeded { .. })
        ));
    }

    #[test]
    fn test_validate_resets_offset_on_rotation() {
        // Each request crosses the rotation threshold, so the running
        // offset starts over and never reaches the hard cap.
        let sizes = vec![600_u64, 600, 600];
        validate_offsets(20, 512, sizes.into_iter()).unwrap();
    }

    #[test]
    fn test_validate_accumulates_within_segment() {
        validate_offsets(20, 1 << 20, vec![100_u64, 200, 300].into_iter()).unwrap();
    }
}
