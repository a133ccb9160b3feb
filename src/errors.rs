use std::{io::Error, path::Path};

use anyhow::anyhow;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("End of mapped region reached")]
    Eof,
    #[error("Log truncate required to run DB. This might result in data loss")]
    TruncateNeeded,
    #[error("Replay of WAL required in read-only mode")]
    ReplayNeeded,
    #[error("Delete log file with no valid data")]
    DeleteVlogFile,
    #[error("Value log GC attempt didn't result in any cleanup")]
    NoRewrite,
    #[error("Value log GC request rejected")]
    Rejected,
    #[error("Retry the read: log file has been garbage collected")]
    Retry,
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Txn is too big to fit into one request")]
    TxnTooBig,
    #[error("Request size offset {estimate} is bigger than maximum offset {max}")]
    SizeExceeded { estimate: u64, max: u64 },
}

pub(crate) fn err_file<P: AsRef<Path>>(err: Error, path: P, msg: &str) -> anyhow::Error {
    anyhow!("{}. Path={:?}. Error={}", msg, path.as_ref(), err)
}
