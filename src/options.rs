use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLoadingMode {
    /// Read records through `pread`; the reader always gets a private copy.
    FileIo,
    /// Map value log segments and hand out borrowed slices guarded by the
    /// segment's shared lock.
    MemoryMap,
}

#[derive(Debug, Clone)]
pub struct Options {
    dir: PathBuf,
    sync_writes: bool,
    read_only: bool,
    // Whether replay may truncate a WAL file that ends in a torn transaction.
    truncate: bool,
    loading_mode: FileLoadingMode,

    segment_file_size: usize,
    segment_max_entries: u32,
    value_threshold: usize,
    verify_value_checksum: bool,

    max_batch_count: u64,
    max_batch_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        let max_batch_size: u64 = (15 * (64 << 20)) / 100;
        Self {
            dir: PathBuf::from("./tmp/valog"),
            sync_writes: false,
            read_only: false,
            truncate: false,
            loading_mode: FileLoadingMode::MemoryMap,
            segment_file_size: (1 << 30) - 1,
            segment_max_entries: 1_000_000,
            value_threshold: 32,
            verify_value_checksum: false,
            max_batch_count: max_batch_size / 64,
            max_batch_size,
        }
    }
}

impl Options {
    pub fn dir(mut self, dir: PathBuf) -> Self {
        self.dir = dir;
        self
    }
    pub fn sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
    pub fn loading_mode(mut self, loading_mode: FileLoadingMode) -> Self {
        self.loading_mode = loading_mode;
        self
    }
    pub fn segment_file_size(mut self, segment_file_size: usize) -> Self {
        self.segment_file_size = segment_file_size;
        self
    }
    pub fn segment_max_entries(mut self, segment_max_entries: u32) -> Self {
        self.segment_max_entries = segment_max_entries;
        self
    }
    pub fn value_threshold(mut self, value_threshold: usize) -> Self {
        self.value_threshold = value_threshold;
        self
    }
    pub fn verify_value_checksum(mut self, verify_value_checksum: bool) -> Self {
        self.verify_value_checksum = verify_value_checksum;
        self
    }
    pub fn max_batch_count(mut self, max_batch_count: u64) -> Self {
        self.max_batch_count = max_batch_count;
        self
    }
    pub fn max_batch_size(mut self, max_batch_size: u64) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    #[inline]
    pub(crate) fn get_dir(&self) -> &PathBuf {
        &self.dir
    }
    #[inline]
    pub(crate) fn get_sync_writes(&self) -> bool {
        self.sync_writes
    }
    #[inline]
    pub(crate) fn get_read_only(&self) -> bool {
        self.read_only
    }
    #[inline]
    pub(crate) fn get_truncate(&self) -> bool {
        self.truncate
    }
    #[inline]
    pub(crate) fn get_loading_mode(&self) -> FileLoadingMode {
        self.loading_mode
    }
    #[inline]
    pub(crate) fn get_segment_file_size(&self) -> usize {
        self.segment_file_size
    }
    #[inline]
    pub(crate) fn get_segment_max_entries(&self) -> u32 {
        self.segment_max_entries
    }
    #[inline]
    pub(crate) fn get_value_threshold(&self) -> usize {
        self.value_threshold
    }
    #[inline]
    pub(crate) fn get_verify_value_checksum(&self) -> bool {
        self.verify_value_checksum
    }
    #[inline]
    pub(crate) fn get_max_batch_count(&self) -> u64 {
        self.max_batch_count
    }
    #[inline]
    pub(crate) fn get_max_batch_size(&self) -> u64 {
        self.max_batch_size
    }
}
