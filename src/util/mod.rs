use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

pub(crate) mod closer;
pub(crate) mod log_file;
pub(crate) mod mmap;
pub(crate) mod sys;

use crate::default::{VALUELOG_FILE_EXT, WAL_FILE_EXT};

/// A typed file id. Segments are named `NNNNNN<suffix>` with a six-digit
/// zero-padded decimal fid.
pub(crate) trait LogFileId:
    From<u32> + Into<u32> + Debug + Copy + Send + Sync + 'static
{
    const SUFFIX: &'static str;
    /// WAL segments are write-only and never memory mapped.
    const MMAP_ALLOWED: bool;

    fn parse<P: AsRef<Path>>(path: P) -> Option<Self> {
        let name = path.as_ref().file_name()?.to_str()?;
        if !name.ends_with(Self::SUFFIX) {
            return None;
        }
        let id = name.trim_end_matches(Self::SUFFIX).parse::<u32>().ok()?;
        Some(id.into())
    }

    fn join_dir<P: AsRef<Path>>(self, parent_dir: P) -> PathBuf {
        let id: u32 = self.into();
        parent_dir
            .as_ref()
            .join(format!("{:06}{}", id, Self::SUFFIX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct WalId(u32);
impl From<u32> for WalId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
impl From<WalId> for u32 {
    fn from(value: WalId) -> u32 {
        value.0
    }
}
impl LogFileId for WalId {
    const SUFFIX: &'static str = WAL_FILE_EXT;
    const MMAP_ALLOWED: bool = false;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct VlogId(u32);
impl From<u32> for VlogId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
impl From<VlogId> for u32 {
    fn from(value: VlogId) -> u32 {
        value.0
    }
}
impl LogFileId for VlogId {
    const SUFFIX: &'static str = VALUELOG_FILE_EXT;
    const MMAP_ALLOWED: bool = true;
}

#[cfg(test)]
mod tests {
    use super::{LogFileId, VlogId, WalId};

    #[test]
    fn test_id_path_round_trip() {
        let path = VlogId::from(7).join_dir("/tmp/db");
        assert!(path.ends_with("000007.vlog"));
        assert_eq!(VlogId::parse(&path), Some(VlogId::from(7)));
        assert_eq!(WalId::parse(&path), None);

        let path = WalId::from(123456).join_dir("/tmp/db");
        assert!(path.ends_with("123456.wal"));
        assert_eq!(WalId::parse(&path), Some(WalId::from(123456)));
    }
}
