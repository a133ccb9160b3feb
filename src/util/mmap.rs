use std::{
    fs::{remove_file, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    slice,
};

use memmap2::{MmapOptions, MmapRaw};

/// A log segment's file descriptor plus an optional raw memory map.
///
/// Appends always go through the descriptor; the map, when present, is a
/// read-only window that observes them because it is shared. Mapping and
/// unmapping require `&mut self`, which the owning lock turns into the
/// exclusive-hold requirement of the segment lifecycle.
#[derive(Debug)]
pub(crate) struct MmapFile {
    raw: Option<MmapRaw>,
    fd: File,
    path: PathBuf,
}

impl MmapFile {
    pub(crate) fn open<P: AsRef<Path>>(
        file_path: P,
        fp_open_opt: OpenOptions,
    ) -> io::Result<(Self, bool)> {
        let fd = fp_open_opt.open(file_path.as_ref())?;
        let is_new_file = fd.metadata()?.len() == 0;
        Ok((
            MmapFile {
                raw: None,
                fd,
                path: file_path.as_ref().to_owned(),
            },
            is_new_file,
        ))
    }

    /// Maps `len` bytes starting at the beginning of the file. Mapping past
    /// EOF is fine as long as reads stay below the tracked size.
    pub(crate) fn mmap(&mut self, len: usize) -> io::Result<()> {
        self.raw = Some(MmapOptions::new().len(len).map_raw(&self.fd)?);
        Ok(())
    }

    pub(crate) fn munmap(&mut self) {
        // Dropping the raw map unmaps it.
        self.raw = None;
    }

    #[inline]
    pub(crate) fn is_mapped(&self) -> bool {
        self.raw.is_some()
    }

    #[inline]
    pub(crate) fn mapped_len(&self) -> usize {
        self.raw.as_ref().map(|r| r.len()).unwrap_or(0)
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> Option<&[u8]> {
        self.raw
            .as_ref()
            .map(|raw| unsafe { slice::from_raw_parts(raw.as_ptr() as _, raw.len()) })
    }

    pub(crate) fn read_slice_ref(&self, offset: usize, len: usize) -> io::Result<&[u8]> {
        let p = self
            .as_slice()
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        if offset.checked_add(len).map_or(true, |end| end > p.len()) {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(&p[offset..offset + len])
    }

    #[inline]
    pub(crate) fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.fd.read_exact_at(buf, offset)
    }

    /// Sequential append through the descriptor's cursor.
    #[inline]
    pub(crate) fn append(&self, data: &[u8]) -> io::Result<()> {
        (&self.fd).write_all(data)
    }

    #[inline]
    pub(crate) fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        (&self.fd).seek(pos)
    }

    #[inline]
    pub(crate) fn sync(&self) -> io::Result<()> {
        self.fd.sync_all()
    }

    #[inline]
    pub(crate) fn set_len(&self, size: u64) -> io::Result<()> {
        self.fd.set_len(size)
    }

    #[inline]
    pub(crate) fn file_size(&self) -> io::Result<u64> {
        Ok(self.fd.metadata()?.len())
    }

    pub(crate) fn delete(&mut self) -> io::Result<()> {
        self.munmap();
        self.fd.set_len(0)?;
        remove_file(&self.path)?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn fd(&self) -> &File {
        &self.fd
    }
}
