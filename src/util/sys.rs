use std::{
    ffi::CString,
    fs::File,
    os::fd::FromRawFd,
    path::Path,
};

use anyhow::anyhow;
use anyhow::bail;

pub(crate) fn open_with_libc<P: AsRef<Path>>(dir: P, oflag: i32) -> anyhow::Result<File> {
    let dir = dir.as_ref();
    unsafe {
        if let Ok(path) = CString::new(dir.to_string_lossy().as_bytes()) {
            let fd = libc::open(path.as_ptr(), oflag);
            drop(path);
            if fd != -1 {
                return Ok(File::from_raw_fd(fd));
            }
        }
    }
    bail!("cannot open {:?}", dir);
}

pub(crate) fn sync_dir<P: AsRef<Path>>(dir: P) -> anyhow::Result<()> {
    let f = open_with_libc(dir.as_ref(), libc::O_RDONLY)?;
    f.sync_all()
        .map_err(|e| anyhow!("cannot sync dir {:?} : {}", dir.as_ref(), e))?;
    Ok(())
}
