use std::{
    fs::{remove_file, OpenOptions},
    io::{self, BufRead, BufReader, SeekFrom},
    ops::Deref,
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::{
    errors::{err_file, LogError},
    key_registry::{AesCipher, KeyRegistry, BASE_IV_SIZE},
    kv::ValuePointer,
    options::FileLoadingMode,
    util::{mmap::MmapFile, LogFileId},
    vlog::VLOG_HEADER_SIZE,
};

/// One on-disk log segment. The owning lock's shared hold guards the
/// descriptor and the mapped slice during reads and appends; the exclusive
/// hold (surfacing here as `&mut self`) is required to map, unmap, truncate
/// or delete.
#[derive(Debug)]
pub(crate) struct LogFile<F: LogFileId> {
    fid: F,
    mmap: MmapFile,
    size: AtomicU32,
    loading_mode: FileLoadingMode,
    key_registry: KeyRegistry,
    cipher: Option<AesCipher>,
    base_iv: [u8; BASE_IV_SIZE],
}

/// Record bytes handed back by [`LogFile::read`]: a borrowed window of the
/// map, or a private copy when the segment is not mapped.
pub(crate) enum LogBytes<'a> {
    Mapped(&'a [u8]),
    Copied(Vec<u8>),
}

impl Deref for LogBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            LogBytes::Mapped(s) => s,
            LogBytes::Copied(v) => v,
        }
    }
}

impl<F: LogFileId> LogFile<F> {
    pub(crate) async fn open(
        fid: F,
        file_path: &PathBuf,
        fp_open_opt: OpenOptions,
        loading_mode: FileLoadingMode,
        key_registry: KeyRegistry,
    ) -> anyhow::Result<(LogFile<F>, bool)> {
        let (mmap, is_new) = MmapFile::open(file_path, fp_open_opt)
            .map_err(|e| err_file(e, file_path, "Unable to open log file"))?;

        let mut log_file = Self {
            fid,
            mmap,
            size: AtomicU32::new(0),
            loading_mode,
            key_registry,
            cipher: None,
            base_iv: [0; BASE_IV_SIZE],
        };

        if is_new {
            if let Err(e) = log_file.bootstrap().await {
                match remove_file(log_file.path()) {
                    Ok(_) => {
                        bail!("Cannot bootstrap logfile {:?} for {}", log_file.path(), e);
                    }
                    Err(error) => {
                        bail!(
                            "Cannot bootstrap logfile {:?} for {} and failed to remove it for {}",
                            log_file.path(),
                            e,
                            error
                        )
                    }
                };
            }
            return Ok((log_file, true));
        }

        let file_size = log_file.mmap.file_size()?;
        if file_size > u32::MAX as u64 {
            bail!(
                "file size: {} greater than {}. Path={:?}",
                file_size,
                u32::MAX,
                log_file.path()
            );
        }
        log_file.set_size(file_size as u32);

        if log_file.get_size() < VLOG_HEADER_SIZE as u32 {
            // Shorter than a segment header: left over from a crash during
            // creation. The replayer will re-bootstrap or delete it.
            return Ok((log_file, false));
        }

        let mut buf = [0_u8; VLOG_HEADER_SIZE];
        log_file.mmap.read_exact_at(&mut buf, 0)?;
        let mut buf_ref: &[u8] = buf.as_ref();
        let cipher_key_id = buf_ref.get_u64();
        log_file.cipher = log_file.key_registry.get_cipher(cipher_key_id).await?;
        log_file.base_iv.copy_from_slice(buf_ref);

        Ok((log_file, false))
    }

    // bootstrap initializes the log file with the key id and base IV,
    // truncating whatever was there before.
    // +----------------+------------------+------------------+
    // | keyID(8 bytes) |  baseIV(12 bytes)|      entry...    |
    // +----------------+------------------+------------------+
    pub(crate) async fn bootstrap(&mut self) -> anyhow::Result<()> {
        self.mmap.set_len(0)?;
        self.mmap.seek(SeekFrom::Start(0))?;

        self.cipher = self.key_registry.latest_cipher().await?;
        self.base_iv = AesCipher::generate_iv();

        let mut buf = Vec::with_capacity(VLOG_HEADER_SIZE);
        buf.put_u64(self.key_id());
        buf.put_slice(&self.base_iv);
        debug_assert_eq!(buf.len(), VLOG_HEADER_SIZE);

        self.mmap.append(&buf)?;
        self.set_size(VLOG_HEADER_SIZE as u32);
        Ok(())
    }

    /// Re-reads the on-disk size and maps the segment when the loading mode
    /// and file type allow it. `map_len` overrides the mapped length for the
    /// writable file, which maps ahead of its current size.
    pub(crate) fn init(&mut self, map_len: Option<usize>) -> anyhow::Result<()> {
        let sz = self
            .mmap
            .file_size()
            .map_err(|e| err_file(e, self.path(), "Unable to read file size"))?;
        if sz == 0 {
            return Ok(());
        }
        if sz > u32::MAX as u64 {
            bail!("file size: {} greater than {}", sz, u32::MAX);
        }
        self.set_size(sz as u32);
        if F::MMAP_ALLOWED && self.loading_mode == FileLoadingMode::MemoryMap {
            self.mmap
                .mmap(map_len.unwrap_or(sz as usize))
                .map_err(|e| err_file(e, self.path(), "Unable to map log file"))?;
        }
        Ok(())
    }

    /// Finalizes a segment that will no longer be appended to: sync, unmap,
    /// truncate to the true size, remap.
    pub(crate) fn done_writing(&mut self, offset: u32) -> anyhow::Result<()> {
        self.mmap
            .sync()
            .map_err(|e| err_file(e, self.path(), "Unable to sync log file"))?;
        // Unmap before truncating, then remap at the final size.
        self.mmap.munmap();
        self.truncate(offset)
            .map_err(|e| err_file(e, self.path(), "Unable to truncate log file"))?;
        self.init(None)?;
        Ok(())
    }

    pub(crate) fn truncate(&mut self, end_offset: u32) -> io::Result<()> {
        if self.mmap.file_size()? == end_offset as u64 {
            return Ok(());
        }
        self.set_size(end_offset);
        self.mmap.set_len(end_offset as u64)
    }

    pub(crate) fn delete(&mut self) -> io::Result<()> {
        self.mmap.delete()
    }

    #[inline]
    pub(crate) fn munmap(&mut self) {
        self.mmap.munmap()
    }

    #[inline]
    pub(crate) fn sync(&self) -> io::Result<()> {
        self.mmap.sync()
    }

    #[inline]
    pub(crate) fn append(&self, data: &[u8]) -> io::Result<()> {
        self.mmap.append(data)
    }

    #[inline]
    pub(crate) fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        self.mmap.seek(pos)
    }

    #[inline]
    pub(crate) fn file_size(&self) -> io::Result<u64> {
        self.mmap.file_size()
    }

    /// Reads the record addressed by `vp`. The caller holds the segment's
    /// shared lock; the tracked size bounds the read so it can never observe
    /// the region the writer is still appending to.
    pub(crate) fn read(&self, vp: &ValuePointer) -> anyhow::Result<LogBytes<'_>> {
        let offset = vp.offset() as usize;
        let valsz = vp.len() as usize;
        if self.mmap.is_mapped() {
            let mapped = self.mmap.mapped_len();
            let lfsz = self.get_size() as usize;
            if offset >= mapped || offset + valsz > mapped || offset + valsz > lfsz {
                bail!(LogError::Eof)
            }
            Ok(LogBytes::Mapped(self.mmap.read_slice_ref(offset, valsz)?))
        } else {
            let mut buf = vec![0_u8; valsz];
            self.mmap.read_exact_at(&mut buf, offset as u64).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    anyhow::Error::from(LogError::Eof)
                } else {
                    err_file(e, self.path(), "Unable to read log file")
                }
            })?;
            Ok(LogBytes::Copied(buf))
        }
    }

    /// Sequential reader over the records starting at `offset`, through the
    /// map when present and the descriptor otherwise.
    pub(crate) fn open_reader(&self, offset: usize) -> anyhow::Result<Box<dyn BufRead + Send + '_>> {
        if let Some(slice) = self.mmap.as_slice() {
            let end = (self.get_size() as usize).min(slice.len());
            if offset > end {
                bail!(LogError::Eof)
            }
            Ok(Box::new(BufReader::new(&slice[offset..end])))
        } else {
            self.mmap.seek(SeekFrom::Start(offset as u64))?;
            Ok(Box::new(BufReader::new(self.mmap.fd())))
        }
    }

    #[inline]
    pub(crate) fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    #[inline]
    pub(crate) fn key_id(&self) -> u64 {
        self.cipher.as_ref().map(|c| c.key_id()).unwrap_or(0)
    }

    #[inline]
    pub(crate) fn try_encrypt(&self, plaintext: &[u8], offset: u32) -> Option<Vec<u8>> {
        self.cipher.as_ref().map(|c| {
            let mut out = plaintext.to_vec();
            c.xor_block(&AesCipher::block_iv(&self.base_iv, offset), &mut out);
            out
        })
    }

    // CTR is an XOR stream, so decryption is the same keystream again.
    #[inline]
    pub(crate) fn try_decrypt(&self, ciphertext: &[u8], offset: u32) -> Option<Vec<u8>> {
        self.try_encrypt(ciphertext, offset)
    }

    #[inline]
    pub(crate) fn get_size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::SeqCst)
    }

    pub(crate) fn fid(&self) -> F {
        self.fid
    }

    pub(crate) fn path(&self) -> &PathBuf {
        self.mmap.path()
    }
}
