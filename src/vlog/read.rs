use std::{
    io::{self, BufRead, Read},
    slice,
};

use anyhow::bail;
use tokio::sync::OwnedRwLockReadGuard;

use crate::{
    errors::LogError,
    kv::{Entry, KeyTs, ValuePointer},
    lsm::LsmStore,
    util::{log_file::LogBytes, log_file::LogFile, LogFileId, VlogId},
    vlog::{header::EntryHeader, ValueLog},
};

/// Counts and checksums the bytes it reads so the CRC is available once the
/// record has been consumed.
pub(crate) struct HashReader<'a, R: Read> {
    reader: &'a mut R,
    crc: u32,
    len: usize,
}

impl<'a, R: Read> HashReader<'a, R> {
    pub(crate) fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            crc: 0,
            len: 0,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.len
    }

    pub(crate) fn sum32(&self) -> u32 {
        self.crc
    }
}

impl<R: Read> Read for HashReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.reader.read(buf)?;
        self.len += size;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..size]);
        Ok(size)
    }
}

/// Sequential record decoder with a reusable scratch buffer.
pub(crate) struct SafeRead<'a, F: LogFileId> {
    kv_buf: Vec<u8>,
    record_offset: u32,
    log_file: &'a LogFile<F>,
}

impl<F: LogFileId> SafeRead<'_, F> {
    /// Parses one record. CRC verification runs against the on-disk bytes
    /// before any decryption. Short reads, oversized keys and checksum
    /// mismatches all surface as `UnexpectedEof`: end of valid data.
    pub(crate) fn read_entry<R: BufRead>(&mut self, reader: &mut R) -> io::Result<(Entry, u32)> {
        let (entry_header, header_len, crc_computed) = {
            let mut hash_reader = HashReader::new(reader);
            let entry_header = EntryHeader::decode_from(&mut hash_reader)?;
            if entry_header.key_len() > 1 << 16 {
                // Key length must be below u16.
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "key length must be below u16",
                ));
            }
            let header_len = hash_reader.count();
            let kv_len = (entry_header.key_len() + entry_header.value_len()) as usize;
            self.kv_buf.resize(kv_len, 0);
            hash_reader.read_exact(&mut self.kv_buf)?;
            (entry_header, header_len, hash_reader.sum32())
        };

        // The trailing checksum is read outside the hashing wrapper.
        let mut crc_buf = [0_u8; 4];
        reader.read_exact(&mut crc_buf)?;
        if crc_computed != u32::from_be_bytes(crc_buf) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to verify crc32c checksum",
            ));
        }

        let offset = self.record_offset;
        let decrypted;
        let kv: &[u8] = match self.log_file.try_decrypt(&self.kv_buf, offset) {
            Some(d) => {
                decrypted = d;
                &decrypted
            }
            None => &self.kv_buf,
        };

        let key_len = entry_header.key_len() as usize;
        let value_len = entry_header.value_len() as usize;
        let key_ts = KeyTs::from(&kv[..key_len]);
        let mut entry = Entry::from_key_ts(key_ts, kv[key_len..].to_vec());
        entry.set_meta(entry_header.meta());
        entry.set_user_meta(entry_header.user_meta());
        entry.set_expires_at(entry_header.expires_at());
        entry.set_offset(offset);
        entry.set_header_len(header_len);

        let size = header_len + key_len + value_len + crc_buf.len();
        Ok((entry, size as u32))
    }
}

/// Streams the records of one segment, starting at a given offset. The
/// caller holds the segment's shared lock for the iterator's lifetime.
pub(crate) struct LogFileIter<'a, F: LogFileId> {
    safe_read: SafeRead<'a, F>,
    reader: Box<dyn BufRead + Send + 'a>,
}

impl<'a, F: LogFileId> LogFileIter<'a, F> {
    pub(crate) fn new(log_file: &'a LogFile<F>, offset: u32) -> anyhow::Result<Self> {
        let reader = log_file.open_reader(offset as usize)?;
        Ok(Self {
            safe_read: SafeRead {
                kv_buf: Vec::with_capacity(10),
                record_offset: offset,
                log_file,
            },
            reader,
        })
    }

    /// The next record and its pointer, or `None` at end of valid data.
    pub(crate) fn next_entry(&mut self) -> anyhow::Result<Option<(Entry, ValuePointer)>> {
        match self.safe_read.read_entry(&mut self.reader) {
            Ok((entry, len)) => {
                let vp = ValuePointer::new(
                    self.safe_read.log_file.fid().into(),
                    len as usize,
                    entry.offset(),
                );
                self.safe_read.record_offset += len;
                Ok(Some((entry, vp)))
            }
            Err(e) => match e.kind() {
                io::ErrorKind::UnexpectedEof => Ok(None),
                _ => bail!(e),
            },
        }
    }

    /// Offset just past the last successfully parsed record.
    pub(crate) fn record_offset(&self) -> u32 {
        self.safe_read.record_offset
    }
}

enum ValueData {
    /// Borrowed window of the segment's memory map.
    Mapped { ptr: *const u8, len: usize },
    /// Private copy (FILE_IO mode, or a decrypted record).
    Owned {
        buf: Vec<u8>,
        start: usize,
        end: usize,
    },
}

/// Value bytes resolved from a pointer. While the `Mapped` variant is
/// alive, the guard keeps the segment's shared lock held, so rotation,
/// truncation and unmapping (all of which need the exclusive lock) cannot
/// pull the memory out from under the caller. Dropping this releases the
/// lock.
pub struct ValueRead {
    guard: Option<OwnedRwLockReadGuard<LogFile<VlogId>>>,
    data: ValueData,
}

// The raw pointer only ever targets the guarded map, which outlives the
// guard held alongside it.
unsafe impl Send for ValueRead {}
unsafe impl Sync for ValueRead {}

impl std::fmt::Debug for ValueRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueRead")
            .field("value", &self.value())
            .finish()
    }
}

impl ValueRead {
    pub fn value(&self) -> &[u8] {
        match &self.data {
            ValueData::Mapped { ptr, len } => unsafe { slice::from_raw_parts(*ptr, *len) },
            ValueData::Owned { buf, start, end } => &buf[*start..*end],
        }
    }

    /// Whether this read still pins the segment's shared lock.
    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

impl<L: LsmStore> ValueLog<L> {
    /// Looks up the pointed-to file and acquires its shared lock. A missing
    /// fid means GC removed the file; the caller retries the LSM lookup,
    /// which then sees the post-GC pointer.
    async fn file_for_read(
        &self,
        vp: &ValuePointer,
    ) -> anyhow::Result<OwnedRwLockReadGuard<LogFile<VlogId>>> {
        let files_r = self.vlog.files.read().await;
        let lf = match files_r.map.get(&vp.fid()) {
            Some(lf) => lf.clone(),
            None => bail!(LogError::Retry),
        };

        // Reads from the writable file must stay below the flushed tail.
        if vp.fid() == files_r.max_fid {
            let current_offset = self.vlog.offset();
            if vp.offset() >= current_offset {
                bail!(
                    "Invalid value pointer offset: {} greater than current offset: {}",
                    vp.offset(),
                    current_offset
                );
            }
        }
        Ok(lf.read_owned().await)
    }

    /// Resolves a value pointer into the value bytes.
    pub async fn read(&self, vp: ValuePointer) -> anyhow::Result<ValueRead> {
        let guard = self.file_for_read(&vp).await?;
        let buf = guard.read(&vp)?;

        if self.opt.get_verify_value_checksum() {
            if buf.len() < 4 {
                bail!(LogError::ChecksumMismatch);
            }
            let (record, checksum) = buf.split_at(buf.len() - 4);
            if crc32c::crc32c(record) != u32::from_be_bytes(checksum.try_into()?) {
                return Err(anyhow::Error::from(LogError::ChecksumMismatch)
                    .context(format!("value corrupted for vp: {:?}", vp)));
            }
        }

        let (header, header_len) = EntryHeader::decode(&buf)?;
        let key_len = header.key_len() as usize;
        let value_len = header.value_len() as usize;
        let kv_start = header_len;
        if buf.len() < kv_start + key_len + value_len {
            bail!(
                "Invalid read: len: {} read at: [{}:{}]",
                buf.len() - kv_start,
                key_len,
                key_len + value_len
            );
        }

        if guard.encryption_enabled() {
            // Decryption copies, so the lock is no longer needed.
            let kv = &buf[kv_start..kv_start + key_len + value_len];
            let plain = match guard.try_decrypt(kv, vp.offset()) {
                Some(p) => p,
                None => bail!("Cipher disappeared for encrypted file"),
            };
            return Ok(ValueRead {
                guard: None,
                data: ValueData::Owned {
                    buf: plain,
                    start: key_len,
                    end: key_len + value_len,
                },
            });
        }

        match buf {
            LogBytes::Mapped(mapped) => {
                let value = &mapped[kv_start + key_len..kv_start + key_len + value_len];
                let (ptr, len) = (value.as_ptr(), value.len());
                Ok(ValueRead {
                    guard: Some(guard),
                    data: ValueData::Mapped { ptr, len },
                })
            }
            LogBytes::Copied(copied) => Ok(ValueRead {
                guard: None,
                data: ValueData::Owned {
                    buf: copied,
                    start: kv_start + key_len,
                    end: kv_start + key_len + value_len,
                },
            }),
        }
    }
}
