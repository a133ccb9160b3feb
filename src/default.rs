pub(crate) const WAL_FILE_EXT: &str = ".wal";
pub(crate) const VALUELOG_FILE_EXT: &str = ".vlog";

/// Keys in this subspace relocate values during value log GC. Rewriting a
/// live key under its original name would shadow newer versions in the LSM,
/// so moved copies live under this prefix and readers fall back to it.
pub const MOVE_KEY_PREFIX: &[u8] = b"!move";

/// The discard-stats map is persisted under this key through the normal
/// write path.
pub(crate) const DISCARD_STATS_KEY: &[u8] = b"!discard";

// The number of merged updates after which the discard map is flushed as a
// durable entry.
pub(crate) const DISCARD_STATS_FLUSH_THRESHOLD: usize = 100;
pub(crate) const DISCARD_STATS_CHANNEL_CAPACITY: usize = 16;
pub(crate) const WAL_CLEANER_CHANNEL_CAPACITY: usize = 10;

lazy_static! {
    pub(crate) static ref DEFAULT_PAGE_SIZE: usize =
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}
