use std::io::{self, Read};

use bytes::{Buf, BufMut};
use integer_encoding::{VarInt, VarIntReader};

use crate::kv::{Entry, Meta};

/// Worst-case encoded header size: meta byte, user-meta byte, two u32
/// varints and one u64 varint. Exported so callers can size record buffers.
pub const MAX_HEADER_SIZE: usize = 22;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EntryHeader {
    key_len: u32,
    value_len: u32,
    expires_at: u64,
    meta: Meta,
    user_meta: u8,
}

impl EntryHeader {
    pub(crate) fn new(e: &Entry) -> Self {
        Self {
            key_len: e.key_ts().len() as u32,
            value_len: e.value().len() as u32,
            expires_at: e.expires_at(),
            meta: e.meta(),
            user_meta: e.user_meta(),
        }
    }

    // +------+----------+------------+--------------+-----------+
    // | Meta | UserMeta | Key Length | Value Length | ExpiresAt |
    // +------+----------+------------+--------------+-----------+
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_HEADER_SIZE);
        out.put_u8(self.meta.bits());
        out.put_u8(self.user_meta);
        out.put_slice(self.key_len.encode_var_vec().as_ref());
        out.put_slice(self.value_len.encode_var_vec().as_ref());
        out.put_slice(self.expires_at.encode_var_vec().as_ref());
        out
    }

    pub(crate) fn decode(mut buf: &[u8]) -> io::Result<(EntryHeader, usize)> {
        if buf.len() < 2 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        let meta = Meta::from_bits_retain(buf.get_u8());
        let user_meta = buf.get_u8();
        let mut index = 2;

        let (key_len, count) =
            u32::decode_var(buf).ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        index += count;
        buf.advance(count);

        let (value_len, count) =
            u32::decode_var(buf).ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        index += count;
        buf.advance(count);

        let (expires_at, count) =
            u64::decode_var(buf).ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        index += count;

        let h = Self {
            key_len,
            value_len,
            expires_at,
            meta,
            user_meta,
        };
        Ok((h, index))
    }

    pub(crate) fn decode_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut b = [0_u8; 1];
        reader.read_exact(&mut b)?;
        let meta = Meta::from_bits_retain(b[0]);
        reader.read_exact(&mut b)?;
        let user_meta = b[0];

        let key_len = reader.read_varint::<u32>()?;
        let value_len = reader.read_varint::<u32>()?;
        let expires_at = reader.read_varint::<u64>()?;

        Ok(Self {
            key_len,
            value_len,
            expires_at,
            meta,
            user_meta,
        })
    }

    pub(crate) fn key_len(&self) -> u32 {
        self.key_len
    }
    pub(crate) fn value_len(&self) -> u32 {
        self.value_len
    }
    pub(crate) fn meta(&self) -> Meta {
        self.meta
    }
    pub(crate) fn user_meta(&self) -> u8 {
        self.user_meta
    }
    pub(crate) fn expires_at(&self) -> u64 {
        self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use crate::kv::{Entry, Meta};

    use super::{EntryHeader, MAX_HEADER_SIZE};

    #[test]
    fn test_header_round_trip() {
        let mut e = Entry::new(b"key", b"value");
        e.set_expires_at(u64::MAX - 1);
        e.set_user_meta(3);
        e.set_meta(Meta::TXN | Meta::VALUE_POINTER);

        let header = EntryHeader::new(&e);
        let enc = header.encode();
        assert!(enc.len() <= MAX_HEADER_SIZE);

        let (dec, len) = EntryHeader::decode(&enc).unwrap();
        assert_eq!(len, enc.len());
        // Key length counts the appended 8-byte timestamp.
        assert_eq!(dec.key_len(), 3 + 8);
        assert_eq!(dec.value_len(), 5);
        assert_eq!(dec.expires_at(), u64::MAX - 1);
        assert_eq!(dec.user_meta(), 3);
        assert_eq!(dec.meta(), Meta::TXN | Meta::VALUE_POINTER);
    }

    #[test]
    fn test_header_decode_from_reader() {
        let e = Entry::new(b"k", b"v");
        let enc = EntryHeader::new(&e).encode();
        let mut reader: &[u8] = enc.as_ref();
        let dec = EntryHeader::decode_from(&mut reader).unwrap();
        assert_eq!(dec.key_len(), 1 + 8);
        assert_eq!(dec.value_len(), 1);
    }

    #[test]
    fn test_header_decode_short_buffer() {
        assert!(EntryHeader::decode(&[0x01]).is_err());
    }
}
