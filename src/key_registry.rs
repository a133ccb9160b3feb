use std::{collections::HashMap, fmt::Debug, sync::Arc, time::SystemTime};

use aes::cipher::{KeyIvInit, StreamCipher};
use anyhow::bail;
use bytes::BufMut;
use rand::{rngs::OsRng, RngCore};
use tokio::sync::RwLock;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub(crate) const BASE_IV_SIZE: usize = 12;

/// One AES data key. `key_id == 0` is reserved and means plaintext.
#[derive(Debug, Clone)]
pub struct DataKey {
    pub key_id: u64,
    pub data: Vec<u8>,
    pub created_at: u64,
}

/// Vends AES data keys to log segments: the latest key for new files and a
/// lookup by id for files read back from disk. Key persistence and rotation
/// scheduling belong to the embedding database; this registry only has to
/// answer `latest` and `get` consistently for the life of the process.
#[derive(Debug, Default, Clone)]
pub struct KeyRegistry(Arc<RwLock<KeyRegistryInner>>);

#[derive(Debug, Default)]
struct KeyRegistryInner {
    data_keys: HashMap<u64, DataKey>,
    next_key_id: u64,
    encryption_key: Vec<u8>,
}

impl KeyRegistry {
    pub fn new(encryption_key: &[u8]) -> anyhow::Result<Self> {
        if !encryption_key.is_empty() && ![16, 32].contains(&encryption_key.len()) {
            bail!(
                "Invalid encryption key length {}, must be 16 or 32 bytes",
                encryption_key.len()
            );
        }
        Ok(Self(Arc::new(RwLock::new(KeyRegistryInner {
            data_keys: HashMap::new(),
            next_key_id: 0,
            encryption_key: encryption_key.to_vec(),
        }))))
    }

    /// Installs a data key read back from elsewhere (tests, imports).
    pub async fn insert(&self, data_key: DataKey) {
        let mut inner = self.0.write().await;
        inner.next_key_id = inner.next_key_id.max(data_key.key_id);
        inner.data_keys.insert(data_key.key_id, data_key);
    }

    pub(crate) async fn latest_datakey(&self) -> anyhow::Result<Option<DataKey>> {
        let mut inner = self.0.write().await;
        if inner.encryption_key.is_empty() {
            return Ok(None);
        }
        if inner.next_key_id != 0 {
            return Ok(inner.data_keys.get(&inner.next_key_id).cloned());
        }
        let key_len = inner.encryption_key.len();
        let mut data = vec![0_u8; key_len];
        OsRng.fill_bytes(&mut data);
        inner.next_key_id += 1;
        let data_key = DataKey {
            key_id: inner.next_key_id,
            data,
            created_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)?
                .as_secs(),
        };
        inner.data_keys.insert(data_key.key_id, data_key.clone());
        Ok(Some(data_key))
    }

    pub(crate) async fn datakey(&self, key_id: u64) -> anyhow::Result<Option<DataKey>> {
        if key_id == 0 {
            return Ok(None);
        }
        let inner = self.0.read().await;
        match inner.data_keys.get(&key_id) {
            Some(d) => Ok(Some(d.clone())),
            None => bail!("Invalid data key id {}", key_id),
        }
    }

    pub(crate) async fn latest_cipher(&self) -> anyhow::Result<Option<AesCipher>> {
        match self.latest_datakey().await? {
            Some(dk) => Ok(Some(AesCipher::new(&dk.data, dk.key_id)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn get_cipher(&self, key_id: u64) -> anyhow::Result<Option<AesCipher>> {
        match self.datakey(key_id).await? {
            Some(dk) => Ok(Some(AesCipher::new(&dk.data, dk.key_id)?)),
            None => Ok(None),
        }
    }
}

/// AES-CTR keystream bound to one data key. The 16-byte IV is the segment's
/// random 12-byte base IV with the record's file offset appended big-endian,
/// so every record in a file gets a distinct keystream.
pub(crate) enum AesCipher {
    Aes128 { key: [u8; 16], key_id: u64 },
    Aes256 { key: [u8; 32], key_id: u64 },
}

impl Debug for AesCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aes128 { key_id, .. } => f.debug_tuple("Aes128").field(key_id).finish(),
            Self::Aes256 { key_id, .. } => f.debug_tuple("Aes256").field(key_id).finish(),
        }
    }
}

impl AesCipher {
    pub(crate) fn new(key: &[u8], key_id: u64) -> anyhow::Result<Self> {
        match key.len() {
            16 => {
                let mut k = [0_u8; 16];
                k.copy_from_slice(key);
                Ok(Self::Aes128 { key: k, key_id })
            }
            32 => {
                let mut k = [0_u8; 32];
                k.copy_from_slice(key);
                Ok(Self::Aes256 { key: k, key_id })
            }
            n => bail!("Invalid encryption key length {} during create cipher", n),
        }
    }

    #[inline]
    pub(crate) fn key_id(&self) -> u64 {
        match self {
            Self::Aes128 { key_id, .. } => *key_id,
            Self::Aes256 { key_id, .. } => *key_id,
        }
    }

    /// CTR mode is an XOR stream, so this both encrypts and decrypts.
    pub(crate) fn xor_block(&self, iv: &[u8; 16], data: &mut [u8]) {
        match self {
            Self::Aes128 { key, .. } => {
                let mut cipher = Aes128Ctr::new(key.into(), iv.into());
                cipher.apply_keystream(data);
            }
            Self::Aes256 { key, .. } => {
                let mut cipher = Aes256Ctr::new(key.into(), iv.into());
                cipher.apply_keystream(data);
            }
        }
    }

    #[inline]
    pub(crate) fn generate_iv() -> [u8; BASE_IV_SIZE] {
        let mut iv = [0_u8; BASE_IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        iv
    }

    /// IV for the record that starts at `offset`: `base_iv ‖ be_u32(offset)`.
    #[inline]
    pub(crate) fn block_iv(base_iv: &[u8; BASE_IV_SIZE], offset: u32) -> [u8; 16] {
        let mut iv = [0_u8; 16];
        iv[..BASE_IV_SIZE].copy_from_slice(base_iv);
        let mut tail = &mut iv[BASE_IV_SIZE..];
        tail.put_u32(offset);
        iv
    }
}

#[cfg(test)]
mod tests {
    use super::{AesCipher, KeyRegistry};

    #[test]
    fn test_xor_block_round_trip() {
        let cipher = AesCipher::new(&[7_u8; 16], 1).unwrap();
        let base_iv = AesCipher::generate_iv();
        let plain = b"the quick brown fox".to_vec();

        let mut buf = plain.clone();
        cipher.xor_block(&AesCipher::block_iv(&base_iv, 20), &mut buf);
        assert_ne!(buf, plain);
        cipher.xor_block(&AesCipher::block_iv(&base_iv, 20), &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_distinct_keystream_per_offset() {
        let cipher = AesCipher::new(&[7_u8; 32], 1).unwrap();
        let base_iv = AesCipher::generate_iv();
        let mut a = vec![0_u8; 16];
        let mut b = vec![0_u8; 16];
        cipher.xor_block(&AesCipher::block_iv(&base_iv, 20), &mut a);
        cipher.xor_block(&AesCipher::block_iv(&base_iv, 84), &mut b);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_registry_plaintext() {
        let registry = KeyRegistry::new(b"").unwrap();
        assert!(registry.latest_datakey().await.unwrap().is_none());
        assert!(registry.datakey(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registry_vends_stable_latest() {
        let registry = KeyRegistry::new(&[1_u8; 32]).unwrap();
        let a = registry.latest_datakey().await.unwrap().unwrap();
        let b = registry.latest_datakey().await.unwrap().unwrap();
        assert_eq!(a.key_id, b.key_id);
        assert_eq!(a.data, b.data);
        let fetched = registry.datakey(a.key_id).await.unwrap().unwrap();
        assert_eq!(fetched.data, a.data);
    }
}
