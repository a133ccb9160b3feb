use std::mem;

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::default::MOVE_KEY_PREFIX;

bitflags! {
    /// Per-record flag bits carried in the header's first byte.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Meta: u8 {
        /// Tombstone.
        const DELETE = 1 << 0;
        /// The value is a pointer into the value log, not inline.
        const VALUE_POINTER = 1 << 1;
        const DISCARD_EARLIER_VERSIONS = 1 << 2;
        /// Never discarded by compactions (merge operator).
        const MERGE_ENTRY = 1 << 3;
        /// Entry belongs to an open transaction.
        const TXN = 1 << 6;
        /// Commit marker; the value is the ASCII decimal commit timestamp.
        const FIN_TXN = 1 << 7;
    }
}

/// A user key with its 8-byte big-endian commit timestamp. The timestamp is
/// a commit sequence number stamped by the external transaction manager.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct KeyTs {
    key: Vec<u8>,
    txn_ts: u64,
}

impl PartialOrd for KeyTs {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for KeyTs {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.key.cmp(&other.key) {
            core::cmp::Ordering::Equal => {}
            ord => return ord,
        }
        // Latest version sorts first.
        other.txn_ts.cmp(&self.txn_ts)
    }
}

impl From<&[u8]> for KeyTs {
    fn from(value: &[u8]) -> Self {
        let len = value.len();
        if len <= 8 {
            Self {
                key: value.to_vec(),
                txn_ts: 0,
            }
        } else {
            let mut p = &value[len - 8..];
            Self {
                key: value[..len - 8].to_vec(),
                txn_ts: p.get_u64(),
            }
        }
    }
}

impl KeyTs {
    pub fn new(key: &[u8], ts: u64) -> Self {
        Self {
            key: key.to_vec(),
            txn_ts: ts,
        }
    }

    pub fn get_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.key.len() + 8);
        v.put_slice(&self.key);
        v.put_u64(self.txn_ts);
        v
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
    pub fn txn_ts(&self) -> u64 {
        self.txn_ts
    }
    pub fn set_key(&mut self, key: Vec<u8>) {
        self.key = key;
    }
    pub fn set_txn_ts(&mut self, txn_ts: u64) {
        self.txn_ts = txn_ts;
    }
    pub fn len(&self) -> usize {
        self.key.len() + mem::size_of::<u64>()
    }
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

#[inline(always)]
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() < 8 {
        return 0;
    }
    let mut p = &key[key.len() - 8..];
    p.get_u64()
}

#[inline(always)]
pub fn parse_key(key: &[u8]) -> &[u8] {
    if key.len() < 8 {
        return key;
    }
    &key[..key.len() - 8]
}

#[inline(always)]
pub fn key_with_ts(key: &[u8], ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.put_slice(key);
    out.put_u64(ts);
    out
}

/// The logical write unit handed to the writer and replayed on open.
#[derive(Debug, Default, Clone)]
pub struct Entry {
    key_ts: KeyTs,
    value: Vec<u8>,
    expires_at: u64,
    offset: u32,
    header_len: usize,
    user_meta: u8,
    meta: Meta,
    // Set upstream when the value must not touch the logs at all.
    skip_vlog: bool,
}

impl Entry {
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key_ts: KeyTs::new(key, 0),
            value: value.to_vec(),
            ..Default::default()
        }
    }

    pub(crate) fn from_key_ts(key_ts: KeyTs, value: Vec<u8>) -> Self {
        Self {
            key_ts,
            value,
            ..Default::default()
        }
    }

    pub fn key(&self) -> &[u8] {
        self.key_ts.key()
    }
    pub fn key_ts(&self) -> &KeyTs {
        &self.key_ts
    }
    pub fn set_key(&mut self, key: Vec<u8>) {
        self.key_ts.set_key(key);
    }
    pub fn value(&self) -> &[u8] {
        &self.value
    }
    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }
    pub fn version(&self) -> u64 {
        self.key_ts.txn_ts()
    }
    pub fn set_version(&mut self, version: u64) {
        self.key_ts.set_txn_ts(version);
    }
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }
    pub fn set_expires_at(&mut self, expires_at: u64) {
        self.expires_at = expires_at;
    }
    pub fn offset(&self) -> u32 {
        self.offset
    }
    pub(crate) fn set_offset(&mut self, offset: u32) {
        self.offset = offset;
    }
    pub fn header_len(&self) -> usize {
        self.header_len
    }
    pub(crate) fn set_header_len(&mut self, header_len: usize) {
        self.header_len = header_len;
    }
    pub fn user_meta(&self) -> u8 {
        self.user_meta
    }
    pub fn set_user_meta(&mut self, user_meta: u8) {
        self.user_meta = user_meta;
    }
    pub fn meta(&self) -> Meta {
        self.meta
    }
    pub fn set_meta(&mut self, meta: Meta) {
        self.meta = meta;
    }
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
    pub fn skip_vlog(&self) -> bool {
        self.skip_vlog
    }
    pub fn set_skip_vlog(&mut self, skip_vlog: bool) {
        self.skip_vlog = skip_vlog;
    }

    pub fn is_move_key(&self) -> bool {
        self.key().starts_with(MOVE_KEY_PREFIX)
    }

    /// Approximate cost of this entry in the LSM, used to size GC rewrite
    /// batches against the upstream transaction limits.
    pub(crate) fn estimate_size(&self, threshold: usize) -> usize {
        if self.value.len() < threshold {
            // key + value + meta + user_meta
            self.key_ts.len() + self.value.len() + 2
        } else {
            self.key_ts.len() + ValuePointer::SIZE + 2
        }
    }
}

/// Locates one record inside a value log segment. `len` covers the whole
/// record including the trailing checksum.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValuePointer {
    fid: u32,
    len: u32,
    offset: u32,
}

impl ValuePointer {
    pub(crate) const SIZE: usize = mem::size_of::<ValuePointer>();

    pub fn new(fid: u32, len: usize, offset: u32) -> Self {
        Self {
            fid,
            len: len as u32,
            offset,
        }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }
    pub fn len(&self) -> u32 {
        self.len
    }
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        *self == ValuePointer::default()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::SIZE);
        res.put_u32(self.fid);
        res.put_u32(self.len);
        res.put_u32(self.offset);
        res
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut p: &[u8] = bytes.as_ref();
        Self {
            fid: p.get_u32(),
            len: p.get_u32(),
            offset: p.get_u32(),
        }
    }
}

/// What the LSM returns for a key: the latest version at or below the
/// timestamp embedded in the lookup key. An absent key yields the default
/// value (version 0, empty value).
#[derive(Debug, Default, Clone)]
pub struct ValueStruct {
    pub meta: Meta,
    pub user_meta: u8,
    pub expires_at: u64,
    pub value: Vec<u8>,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{key_with_ts, parse_key, parse_ts, KeyTs, ValuePointer};

    #[test]
    fn test_key_ts_bytes() {
        let key_ts = KeyTs::new(b"a", 1);
        let bytes = key_ts.get_bytes();
        assert_eq!(KeyTs::from(bytes.as_ref()), key_ts);
        assert_eq!(parse_key(&bytes), b"a");
        assert_eq!(parse_ts(&bytes), 1);
    }

    #[test]
    fn test_key_ts_ord() {
        let a = KeyTs::new(b"a", 1);
        let b = KeyTs::new(b"b", 0);
        let c = KeyTs::new(b"a", 2);
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(a.cmp(&c), Ordering::Greater);
    }

    #[test]
    fn test_value_pointer_codec() {
        let vp = ValuePointer::new(3, 77, 20);
        assert_eq!(ValuePointer::decode(&vp.encode()), vp);
        assert!(!vp.is_empty());
        assert!(ValuePointer::default().is_empty());
    }

    #[test]
    fn test_key_with_ts() {
        let key = key_with_ts(b"foo", 42);
        assert_eq!(parse_key(&key), b"foo");
        assert_eq!(parse_ts(&key), 42);
    }
}
