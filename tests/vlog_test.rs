use std::{
    collections::BTreeMap,
    fs,
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex as StdMutex, OnceLock},
    time::Duration,
};

use tokio::sync::Mutex;

use valog::{
    errors::LogError,
    key_registry::KeyRegistry,
    kv::{parse_key, parse_ts, Meta},
    lsm::LsmStore,
    options::FileLoadingMode,
    Entry, Options, Request, ValueLog, ValuePointer, ValueStruct,
};

use valog::MOVE_KEY_PREFIX;

/// Stand-in for the LSM tree: keeps the latest version per user key and
/// routes `batch_set` through the value log's write path, the way the real
/// write scheduler does.
#[derive(Default)]
struct MockLsm {
    map: Mutex<BTreeMap<Vec<u8>, ValueStruct>>,
    vlog: OnceLock<StdMutex<Arc<ValueLog<MockLsm>>>>,
    head: StdMutex<ValuePointer>,
}

impl MockLsm {
    fn wire(&self, vlog: Arc<ValueLog<MockLsm>>) {
        match self.vlog.get() {
            Some(slot) => *slot.lock().unwrap() = vlog,
            None => {
                let _ = self.vlog.set(StdMutex::new(vlog));
            }
        }
    }

    fn wired(&self) -> Arc<ValueLog<MockLsm>> {
        self.vlog.get().expect("vlog not wired").lock().unwrap().clone()
    }

    fn set_head(&self, head: ValuePointer) {
        *self.head.lock().unwrap() = head;
    }

    async fn latest(&self, user_key: &[u8]) -> Option<ValueStruct> {
        self.map.lock().await.get(user_key).cloned()
    }
}

impl LsmStore for MockLsm {
    async fn get(&self, key: &[u8]) -> anyhow::Result<ValueStruct> {
        let user_key = parse_key(key);
        let ts = parse_ts(key);
        let map = self.map.lock().await;
        match map.get(user_key) {
            Some(vs) if vs.version <= ts => Ok(vs.clone()),
            _ => Ok(ValueStruct::default()),
        }
    }

    async fn batch_set(&self, entries: Vec<Entry>) -> anyhow::Result<()> {
        let vlog = self.wired();
        let mut reqs = vec![Request::new(entries)];
        vlog.write(&mut reqs).await?;
        let req = reqs.pop().expect("request vanished");
        let mut map = self.map.lock().await;
        for (e, vp) in req.entries.iter().zip(req.ptrs.iter()) {
            let mut vs = ValueStruct {
                meta: e.meta(),
                user_meta: e.user_meta(),
                expires_at: e.expires_at(),
                value: Vec::new(),
                version: e.version(),
            };
            if vp.is_empty() {
                vs.meta.remove(Meta::VALUE_POINTER);
                vs.value = e.value().to_vec();
            } else {
                vs.meta.insert(Meta::VALUE_POINTER);
                vs.value = vp.encode();
            }
            map.insert(e.key().to_vec(), vs);
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, ValueStruct)>> {
        let map = self.map.lock().await;
        Ok(map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn persisted_head(&self) -> anyhow::Result<ValuePointer> {
        Ok(*self.head.lock().unwrap())
    }
}

async fn open_vlog(
    opt: Options,
    registry: KeyRegistry,
) -> anyhow::Result<(Arc<MockLsm>, Arc<ValueLog<MockLsm>>)> {
    let lsm = Arc::new(MockLsm::default());
    let vlog = ValueLog::open(
        Arc::new(opt),
        lsm.clone(),
        registry,
        ValuePointer::default(),
        |_, _| Ok(()),
    )
    .await?;
    lsm.wire(vlog.clone());
    Ok((lsm, vlog))
}

fn entry_with_ts(key: &[u8], value: &[u8], ts: u64) -> Entry {
    let mut e = Entry::new(key, value);
    e.set_version(ts);
    e
}

fn list_files(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(suffix))
        .collect();
    names.sort();
    names
}

fn count_files(dir: &Path, suffix: &str) -> usize {
    list_files(dir, suffix).len()
}

/// Files present in `before` but gone from the directory now.
fn removed_files(dir: &Path, suffix: &str, before: &[String]) -> Vec<String> {
    let after = list_files(dir, suffix);
    before
        .iter()
        .filter(|name| !after.contains(name))
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_write_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let opt = Options::default()
        .dir(dir.path().to_path_buf())
        .value_threshold(0);
    let (_lsm, vlog) = open_vlog(opt, KeyRegistry::new(b"").unwrap()).await.unwrap();

    let mut reqs = vec![Request::new(vec![entry_with_ts(b"k", b"hello", 5)])];
    vlog.write(&mut reqs).await.unwrap();

    let vp = reqs[0].ptrs[0];
    assert_eq!(vp.fid(), 0);
    assert_eq!(vp.offset(), 20);
    // header (5) + key with ts (9) + value (5) + crc (4)
    assert_eq!(vp.len(), 23);

    let head = reqs[0].head;
    assert_eq!(head.fid(), 0);
    assert_eq!(head.offset(), 20);

    let read = vlog.read(vp).await.unwrap();
    assert_eq!(read.value(), b"hello");
    assert!(read.is_guarded());
    drop(read);

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_small_value_stays_inline() {
    let dir = tempfile::tempdir().unwrap();
    let opt = Options::default()
        .dir(dir.path().to_path_buf())
        .value_threshold(1024);
    let (_lsm, vlog) = open_vlog(opt, KeyRegistry::new(b"").unwrap()).await.unwrap();

    let mut reqs = vec![Request::new(vec![entry_with_ts(b"k", b"small", 1)])];
    vlog.write(&mut reqs).await.unwrap();
    assert!(reqs[0].ptrs[0].is_empty());
    // The WAL still recorded it.
    assert!(!reqs[0].head.is_empty());
    // No value log file was needed.
    assert_eq!(count_files(dir.path(), ".vlog"), 0);

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_read_file_io_mode_copies() {
    let dir = tempfile::tempdir().unwrap();
    let opt = Options::default()
        .dir(dir.path().to_path_buf())
        .value_threshold(0)
        .loading_mode(FileLoadingMode::FileIo);
    let (_lsm, vlog) = open_vlog(opt, KeyRegistry::new(b"").unwrap()).await.unwrap();

    let mut reqs = vec![Request::new(vec![entry_with_ts(b"k", b"copied", 1)])];
    vlog.write(&mut reqs).await.unwrap();
    let read = vlog.read(reqs[0].ptrs[0]).await.unwrap();
    assert_eq!(read.value(), b"copied");
    assert!(!read.is_guarded());

    vlog.close().await.unwrap();
}

fn txn_entry(key: &[u8], value: &[u8], ts: u64) -> Entry {
    let mut e = entry_with_ts(key, value, ts);
    e.set_meta(Meta::TXN);
    e
}

fn commit_entry(ts: u64) -> Entry {
    let mut e = Entry::new(b"txn", ts.to_string().as_bytes());
    e.set_version(ts);
    e.set_meta(Meta::FIN_TXN);
    e
}

#[tokio::test]
async fn test_transactional_replay_truncates_torn_txn() {
    let dir = tempfile::tempdir().unwrap();
    let opt = Options::default()
        .dir(dir.path().to_path_buf())
        .truncate(true);

    let committed_end;
    {
        let (_lsm, vlog) = open_vlog(opt.clone(), KeyRegistry::new(b"").unwrap())
            .await
            .unwrap();
        let mut reqs = vec![Request::new(vec![
            txn_entry(b"k1", b"v1", 10),
            txn_entry(b"k2", b"v2", 10),
            commit_entry(10),
        ])];
        vlog.write(&mut reqs).await.unwrap();
        committed_end = vlog.wal_head().await.offset();

        // A fourth record lands without its commit marker: a torn txn.
        let mut torn = vec![Request::new(vec![txn_entry(b"k3", b"v3", 20)])];
        vlog.write(&mut torn).await.unwrap();
        vlog.close().await.unwrap();
    }

    let lsm = Arc::new(MockLsm::default());
    let replayed: Arc<StdMutex<Vec<(Vec<u8>, u64)>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = replayed.clone();
    let vlog = ValueLog::open(
        Arc::new(opt),
        lsm.clone(),
        KeyRegistry::new(b"").unwrap(),
        ValuePointer::default(),
        move |e, _vp| {
            sink.lock().unwrap().push((e.key().to_vec(), e.version()));
            Ok(())
        },
    )
    .await
    .unwrap();
    lsm.wire(vlog.clone());

    let got = replayed.lock().unwrap().clone();
    assert_eq!(got, vec![(b"k1".to_vec(), 10), (b"k2".to_vec(), 10)]);

    // The torn tail is gone from disk.
    let wal_path = dir.path().join("000000.wal");
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), committed_end as u64);

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_replay_stops_at_crc_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let opt = Options::default()
        .dir(dir.path().to_path_buf())
        .truncate(true);

    let first_end;
    {
        let (_lsm, vlog) = open_vlog(opt.clone(), KeyRegistry::new(b"").unwrap())
            .await
            .unwrap();
        let mut reqs = vec![Request::new(vec![entry_with_ts(b"a", b"val1", 1)])];
        vlog.write(&mut reqs).await.unwrap();
        first_end = vlog.wal_head().await.offset();
        let mut reqs = vec![Request::new(vec![entry_with_ts(b"b", b"val2", 2)])];
        vlog.write(&mut reqs).await.unwrap();
        vlog.close().await.unwrap();
    }

    // Flip one byte in the second record's value region.
    let wal_path = dir.path().join("000000.wal");
    {
        let mut f = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&wal_path)
            .unwrap();
        // header (5) + key with ts (9) puts us at the value bytes.
        f.seek(SeekFrom::Start(first_end as u64 + 5 + 9)).unwrap();
        f.write_all(&[0xff]).unwrap();
    }

    let lsm = Arc::new(MockLsm::default());
    let replayed: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = replayed.clone();
    let vlog = ValueLog::open(
        Arc::new(opt),
        lsm.clone(),
        KeyRegistry::new(b"").unwrap(),
        ValuePointer::default(),
        move |e, _vp| {
            sink.lock().unwrap().push(e.key().to_vec());
            Ok(())
        },
    )
    .await
    .unwrap();
    lsm.wire(vlog.clone());

    assert_eq!(replayed.lock().unwrap().clone(), vec![b"a".to_vec()]);
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), first_end as u64);

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_encryption_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let opt = Options::default()
        .dir(dir.path().to_path_buf())
        .value_threshold(0);
    let registry = KeyRegistry::new(&[7_u8; 16]).unwrap();
    let (_lsm, vlog) = open_vlog(opt.clone(), registry).await.unwrap();

    let mut reqs = vec![Request::new(vec![entry_with_ts(b"foo", b"bar", 1)])];
    vlog.write(&mut reqs).await.unwrap();
    let vp = reqs[0].ptrs[0];
    assert_eq!(vp.offset(), 20);

    let read = vlog.read(vp).await.unwrap();
    assert_eq!(read.value(), b"bar");
    // Decryption copies, so no lock is pinned.
    assert!(!read.is_guarded());
    drop(read);
    vlog.close().await.unwrap();

    // The stored bytes are ciphertext: key id set, value region scrambled.
    let raw = fs::read(dir.path().join("000000.vlog")).unwrap();
    let key_id = u64::from_be_bytes(raw[..8].try_into().unwrap());
    assert_ne!(key_id, 0);
    // header (5) + key with ts (11) puts us at the value bytes.
    let value_on_disk = &raw[20 + 5 + 11..20 + 5 + 11 + 3];
    assert_ne!(value_on_disk, b"bar");

    // Without the data key the segment cannot be opened.
    let lsm = Arc::new(MockLsm::default());
    let result = ValueLog::open(
        Arc::new(opt),
        lsm,
        KeyRegistry::new(b"").unwrap(),
        ValuePointer::default(),
        |_, _| Ok(()),
    )
    .await;
    assert!(result.is_err());
}

async fn fill_entries(lsm: &Arc<MockLsm>, n: usize) {
    for i in 0..n {
        let key = format!("key-{:03}", i).into_bytes();
        let value = vec![i as u8; 100];
        lsm.batch_set(vec![entry_with_ts(&key, &value, (i + 1) as u64)])
            .await
            .unwrap();
    }
}

fn gc_options(dir: &Path) -> Options {
    Options::default()
        .dir(dir.to_path_buf())
        .value_threshold(0)
        .segment_file_size(4096)
        .segment_max_entries(100)
        .truncate(true)
}

#[tokio::test]
async fn test_gc_rewrites_live_entries_under_move_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let (lsm, vlog) = open_vlog(gc_options(dir.path()), KeyRegistry::new(b"").unwrap())
        .await
        .unwrap();

    fill_entries(&lsm, 100).await;
    let vlog_files_before = list_files(dir.path(), ".vlog");
    assert!(vlog_files_before.len() > 1);

    vlog.run_gc(0.0).await.unwrap();

    // Exactly one of the old files went away; its live entries moved into
    // the move keyspace.
    assert_eq!(removed_files(dir.path(), ".vlog", &vlog_files_before).len(), 1);
    let moved = lsm.scan_prefix(MOVE_KEY_PREFIX).await.unwrap();
    let live_moved: Vec<_> = moved
        .iter()
        .filter(|(_, vs)| !vs.meta.contains(Meta::DELETE))
        .collect();
    assert!(!live_moved.is_empty());

    // Every move pointer resolves to the original value.
    for (key, vs) in live_moved {
        assert!(vs.meta.contains(Meta::VALUE_POINTER));
        let vp = ValuePointer::decode(&vs.value);
        let read = vlog.read(vp).await.unwrap();
        let idx: usize = std::str::from_utf8(&key[MOVE_KEY_PREFIX.len() + 4..])
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(read.value(), vec![idx as u8; 100].as_slice());
        drop(read);
    }

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_gc_defers_deletion_while_iterator_active() {
    let dir = tempfile::tempdir().unwrap();
    let (lsm, vlog) = open_vlog(gc_options(dir.path()), KeyRegistry::new(b"").unwrap())
        .await
        .unwrap();

    fill_entries(&lsm, 100).await;
    let vlog_files_before = list_files(dir.path(), ".vlog");
    assert!(vlog_files_before.len() > 1);

    vlog.incr_iterator_count();
    vlog.run_gc(0.0).await.unwrap();
    // Rewritten, but the file lingers until the iterator departs.
    assert!(removed_files(dir.path(), ".vlog", &vlog_files_before).is_empty());

    vlog.decr_iterator_count().await.unwrap();
    assert_eq!(removed_files(dir.path(), ".vlog", &vlog_files_before).len(), 1);

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_gc_no_candidates_and_rejected_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let (_lsm, vlog) = open_vlog(gc_options(dir.path()), KeyRegistry::new(b"").unwrap())
        .await
        .unwrap();

    // With a single (writable) file there is nothing to pick.
    let err = vlog.run_gc(0.5).await.unwrap_err();
    assert_eq!(err.downcast_ref::<LogError>(), Some(&LogError::NoRewrite));

    // After close, GC is rejected outright.
    vlog.close().await.unwrap();
    let err = vlog.run_gc(0.5).await.unwrap_err();
    assert_eq!(err.downcast_ref::<LogError>(), Some(&LogError::Rejected));
}

#[tokio::test]
async fn test_wal_cleaner_drops_files_below_head() {
    let dir = tempfile::tempdir().unwrap();
    let (lsm, vlog) = open_vlog(gc_options(dir.path()), KeyRegistry::new(b"").unwrap())
        .await
        .unwrap();

    fill_entries(&lsm, 60).await;
    assert!(count_files(dir.path(), ".wal") > 1);

    // Everything below the current tail is recoverable from the LSM now.
    let head = vlog.wal_head().await;
    lsm.set_head(ValuePointer::new(head.fid(), 0, 0));

    // The next rotation passes the head to the cleaner.
    fill_entries(&lsm, 60).await;

    let earliest = dir.path().join("000000.wal");
    for _ in 0..100 {
        if !earliest.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!earliest.exists());

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_drop_all_resets_to_empty_wal() {
    let dir = tempfile::tempdir().unwrap();
    let (lsm, vlog) = open_vlog(gc_options(dir.path()), KeyRegistry::new(b"").unwrap())
        .await
        .unwrap();

    fill_entries(&lsm, 40).await;
    let old_vp = {
        let vs = lsm.latest(b"key-000").await.unwrap();
        ValuePointer::decode(&vs.value)
    };

    vlog.drop_all().await.unwrap();
    assert_eq!(count_files(dir.path(), ".vlog"), 0);
    assert_eq!(count_files(dir.path(), ".wal"), 1);

    // Old pointers now miss and ask the caller to retry.
    let err = vlog.read(old_vp).await.unwrap_err();
    assert_eq!(err.downcast_ref::<LogError>(), Some(&LogError::Retry));

    vlog.close().await.unwrap();
}

#[tokio::test]
async fn test_reopen_continues_after_committed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let opt = Options::default()
        .dir(dir.path().to_path_buf())
        .value_threshold(0)
        .truncate(true);

    {
        let (_lsm, vlog) = open_vlog(opt.clone(), KeyRegistry::new(b"").unwrap())
            .await
            .unwrap();
        let mut reqs = vec![Request::new(vec![entry_with_ts(b"k", b"first", 1)])];
        vlog.write(&mut reqs).await.unwrap();
        vlog.close().await.unwrap();
    }

    let lsm = Arc::new(MockLsm::default());
    let vlog = ValueLog::open(
        Arc::new(opt),
        lsm.clone(),
        KeyRegistry::new(b"").unwrap(),
        ValuePointer::default(),
        |_, _| Ok(()),
    )
    .await
    .unwrap();
    lsm.wire(vlog.clone());

    // Appends continue past the replayed tail of both logs.
    let mut reqs = vec![Request::new(vec![entry_with_ts(b"k", b"second", 2)])];
    vlog.write(&mut reqs).await.unwrap();
    let vp = reqs[0].ptrs[0];
    assert!(vp.offset() > 20);
    let read = vlog.read(vp).await.unwrap();
    assert_eq!(read.value(), b"second");
    drop(read);

    vlog.close().await.unwrap();
}
