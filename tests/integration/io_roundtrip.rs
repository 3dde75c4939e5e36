#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use sotano::{
    FileIo, IoRequest, PageId, Result, RetentionClass, StdFileIo, Store, StoreOptions,
};
use tempfile::tempdir;

fn small_options() -> StoreOptions {
    StoreOptions {
        page_size: 1024,
        page_count: 4,
        wbuf_size: 256,
        wbuf_count: 4,
        io_threads: 2,
        io_depth: 2,
        ..Default::default()
    }
}

fn wait_for(mut probe: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if probe() {
            return;
        }
        if Instant::now() > deadline {
            panic!("{what} did not happen in time");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn staged_write_flushes_and_reads_back() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("store.dat"), small_options()).unwrap();

    let first: Vec<u8> = (0u8..100).collect();
    let second: Vec<u8> = (100u8..200).collect();
    let loc_a = store.write(RetentionClass::Low, &first).unwrap();
    let loc_b = store.write(RetentionClass::Low, &second).unwrap();
    assert_eq!((loc_a.offset, loc_b.offset), (0, 100));

    assert!(store.flush(RetentionClass::Low).unwrap());
    let metrics = store.metrics();
    wait_for(|| metrics.bytes_flushed() >= 200, "buffer flush");
    let snap = store.page_snapshot(loc_a.page).unwrap();
    assert_eq!(snap.written, 200);

    for (loc, expected) in [(loc_a, first), (loc_b, second)] {
        let (tx, rx) = mpsc::channel();
        store
            .read(
                IoRequest::read(loc.page, loc.offset, expected.len(), move |req, result| {
                    tx.send((req.buf, result.map_err(|e| e.to_string()))).unwrap();
                }),
            )
            .unwrap();
        let (buf, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Ok(expected.len()));
        assert_eq!(buf, expected);
    }
    // Completions release the reader references they held.
    wait_for(
        || store.page_snapshot(loc_a.page).unwrap().refcount == 0,
        "reader release",
    );
}

#[test]
fn raw_write_descriptor_reads_back() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("store.dat"), small_options()).unwrap();

    let payload = b"raw descriptor bytes".to_vec();
    let (wtx, wrx) = mpsc::channel();
    store
        .read(IoRequest::write(PageId(1), 512, payload.clone(), move |_, result| {
            wtx.send(result.map_err(|e| e.to_string())).unwrap();
        }))
        .unwrap();
    assert_eq!(
        wrx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ok(payload.len())
    );

    let (rtx, rrx) = mpsc::channel();
    store
        .read(IoRequest::read(PageId(1), 512, payload.len(), move |req, result| {
            rtx.send((req.buf, result.is_ok())).unwrap();
        }))
        .unwrap();
    let (buf, ok) = rrx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ok);
    assert_eq!(buf, payload);
}

#[test]
fn batch_submission_completes_in_order_per_worker() {
    let dir = tempdir().unwrap();
    let store = Store::open(
        dir.path().join("store.dat"),
        StoreOptions {
            io_threads: 1,
            ..small_options()
        },
    )
    .unwrap();

    let data: Vec<u8> = (0u8..=255).collect();
    let loc = store.write(RetentionClass::Low, &data[..200]).unwrap();
    store.flush(RetentionClass::Low).unwrap();
    let metrics = store.metrics();
    wait_for(|| metrics.bytes_flushed() >= 200, "buffer flush");

    let (tx, rx) = mpsc::channel();
    let batch: Vec<IoRequest> = (0u32..8)
        .map(|i| {
            let tx = tx.clone();
            IoRequest::read(loc.page, loc.offset + i * 16, 16, move |req, result| {
                tx.send((i, req.buf, result.is_ok())).unwrap();
            })
        })
        .collect();
    store.submit(batch).unwrap();

    for want in 0u32..8 {
        let (i, buf, ok) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(i, want, "single-worker batch completed out of order");
        assert!(ok);
        assert_eq!(buf, data[(want * 16) as usize..((want + 1) * 16) as usize]);
    }
    assert_eq!(store.metrics_snapshot().ios_submitted, 8);
}

/// Delegating backend that can be switched to fail positioned writes.
struct FaultyIo {
    inner: StdFileIo,
    fail_writes: Arc<AtomicBool>,
}

impl FileIo for FaultyIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected write fault").into());
        }
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

#[test]
fn flush_failure_is_counted_and_engine_survives() {
    let dir = tempdir().unwrap();
    let fail_writes = Arc::new(AtomicBool::new(false));
    let io = FaultyIo {
        inner: StdFileIo::create(dir.path().join("store.dat")).unwrap(),
        fail_writes: Arc::clone(&fail_writes),
    };
    let store = Store::open_with_io(Arc::new(io), small_options()).unwrap();

    store.write(RetentionClass::Low, &[1u8; 100]).unwrap();
    fail_writes.store(true, Ordering::Relaxed);
    assert!(store.flush(RetentionClass::Low).unwrap());
    let metrics = store.metrics();
    wait_for(|| metrics.io_errors() >= 1, "flush failure accounting");
    // Durability progress must not advance past a failed flush.
    assert_eq!(store.page_snapshot(PageId(0)).unwrap().written, 0);

    // The engine keeps accepting work afterwards.
    fail_writes.store(false, Ordering::Relaxed);
    let loc = store.write(RetentionClass::Low, &[2u8; 100]).unwrap();
    assert_eq!(loc.offset, 256);
    store.flush(RetentionClass::Low).unwrap();
    wait_for(|| metrics.bytes_flushed() >= 100, "recovered flush");
}

#[test]
fn descriptor_failure_reaches_the_completion() {
    let dir = tempdir().unwrap();
    let fail_writes = Arc::new(AtomicBool::new(false));
    let io = FaultyIo {
        inner: StdFileIo::create(dir.path().join("store.dat")).unwrap(),
        fail_writes: Arc::clone(&fail_writes),
    };
    let store = Store::open_with_io(Arc::new(io), small_options()).unwrap();

    fail_writes.store(true, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel();
    store
        .read(IoRequest::write(PageId(0), 0, vec![3u8; 32], move |_, result| {
            tx.send(result.map_err(|e| e.to_string())).unwrap();
        }))
        .unwrap();
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.unwrap_err().contains("injected write fault"));
    assert!(store.metrics_snapshot().io_errors >= 1);
}
