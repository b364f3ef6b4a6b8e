//! Tests for StorageWorker
//!
//! These tests verify:
//! - Load/store round trips, in memory and across reopen
//! - Read-your-writes for staged payloads
//! - Coalescing of repeated stores to one chunk
//! - Synchronize and close semantics
//! - Streaming scans through visitors
//! - Concurrent callers

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel;
use regionkv::region::{RegionFile, RegionFileOptions};
use regionkv::{
    ChunkPos, Compression, PrefixProbe, RecordVisitor, StorageConfig, StorageError, StorageWorker,
    Ticket,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_worker(dir: &Path) -> StorageWorker {
    StorageWorker::open_path(dir).unwrap()
}

fn open_uncompressed(dir: &Path) -> StorageWorker {
    let config = StorageConfig::builder()
        .dir(dir)
        .compression(Compression::None)
        .build();
    StorageWorker::open(config).unwrap()
}

fn payload(text: &str) -> Option<Bytes> {
    Some(Bytes::from(text.to_string()))
}

fn patterned(len: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed))
            .collect::<Vec<_>>(),
    )
}

/// Visitor that holds the worker thread until released
struct Gate {
    release: channel::Receiver<()>,
}

impl RecordVisitor for Gate {
    fn visit(&mut self, _payload: &mut dyn Read) -> io::Result<()> {
        let _ = self.release.recv();
        Ok(())
    }
}

/// Park the worker thread inside a scan until the returned sender is used
///
/// `gate_key` must already be stored. Requests submitted while the worker
/// is parked queue up behind the scan.
fn park_worker(worker: &StorageWorker, gate_key: ChunkPos) -> (channel::Sender<()>, Ticket<Option<Gate>>) {
    let (release_tx, release_rx) = channel::bounded(0);
    let ticket = worker.scan(gate_key, Gate { release: release_rx });
    (release_tx, ticket)
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_load_absent_chunk() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());

    assert_eq!(worker.load(ChunkPos::new(9, 9)).wait().unwrap(), None);
    assert!(!worker.exists(ChunkPos::new(9, 9)).wait().unwrap());

    worker.close().unwrap();
    // A read never creates region files
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn test_store_then_load() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let pos = ChunkPos::new(-5, 12);

    worker.store(pos, payload("hello region")).wait().unwrap();

    assert_eq!(worker.load(pos).wait().unwrap(), payload("hello region"));
    worker.close().unwrap();
}

#[test]
fn test_store_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let pos = ChunkPos::new(33, -64);
    {
        let worker = open_worker(temp.path());
        worker.store(pos, Some(patterned(50_000, 3))).wait().unwrap();
        worker.close().unwrap();
    }

    let worker = open_worker(temp.path());
    assert_eq!(worker.load(pos).wait().unwrap(), Some(patterned(50_000, 3)));
    assert!(temp.path().join("r.1.-2.mca").is_file());
}

#[test]
fn test_read_your_writes_before_disk() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let pos = ChunkPos::new(1, 1);

    // Neither ticket is waited on before the load
    let first = worker.store(pos, payload("staged"));
    let loaded = worker.load(pos);
    assert_eq!(loaded.wait().unwrap(), payload("staged"));

    let deleted = worker.store(pos, None);
    assert_eq!(worker.load(pos).wait().unwrap(), None);

    first.wait().unwrap();
    deleted.wait().unwrap();
    worker.close().unwrap();
}

#[test]
fn test_last_write_wins_per_chunk() {
    let temp = TempDir::new().unwrap();
    let pos = ChunkPos::new(7, 7);
    {
        let worker = open_worker(temp.path());
        let tickets: Vec<_> = (0..100)
            .map(|i| worker.store(pos, payload(&format!("version {i}"))))
            .collect();

        assert_eq!(worker.load(pos).wait().unwrap(), payload("version 99"));
        for ticket in tickets {
            ticket.wait().unwrap();
        }
        worker.close().unwrap();
    }

    let worker = open_worker(temp.path());
    assert_eq!(worker.load(pos).wait().unwrap(), payload("version 99"));
}

// =============================================================================
// Coalescing Tests
// =============================================================================

#[test]
fn test_repeated_stores_coalesce_into_one_write() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let gate_key = ChunkPos::new(100, 100);
    let key = ChunkPos::new(0, 0);

    worker.store(gate_key, payload("gate")).wait().unwrap();

    let (release, parked) = park_worker(&worker, gate_key);
    let first = worker.store(key, payload("first"));
    let second = worker.store(key, payload("second"));
    let loaded = worker.load(key);
    release.send(()).unwrap();

    assert!(parked.wait().unwrap().is_some());
    assert_eq!(loaded.wait().unwrap(), payload("second"));
    first.wait().unwrap();
    second.wait().unwrap();

    worker.synchronize(true).wait().unwrap();
    worker.close().unwrap();

    // A second write would have landed past sector 2
    let file = RegionFile::open(&temp.path().join("r.0.0.mca"), RegionFileOptions::default())
        .unwrap();
    let entries = file.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sector, 2);
}

#[test]
fn test_coalesced_delete_wins_over_staged_write() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let gate_key = ChunkPos::new(-100, 0);
    let key = ChunkPos::new(3, 4);

    worker.store(key, payload("on disk")).wait().unwrap();
    worker.store(gate_key, payload("gate")).wait().unwrap();

    let (release, parked) = park_worker(&worker, gate_key);
    let write = worker.store(key, payload("staged"));
    let delete = worker.store(key, None);
    let exists = worker.exists(key);
    release.send(()).unwrap();

    parked.wait().unwrap();
    assert!(!exists.wait().unwrap());
    write.wait().unwrap();
    delete.wait().unwrap();
    assert_eq!(worker.load(key).wait().unwrap(), None);
    worker.close().unwrap();
}

// =============================================================================
// External Record Tests
// =============================================================================

#[test]
fn test_delete_removes_external_file() {
    let temp = TempDir::new().unwrap();
    let worker = open_uncompressed(temp.path());
    let pos = ChunkPos::new(2, 3);
    let external = temp.path().join("c.2.3.mcc");

    worker.store(pos, Some(patterned(2 * 1024 * 1024, 1))).wait().unwrap();
    assert!(external.is_file());
    assert_eq!(worker.load(pos).wait().unwrap(), Some(patterned(2 * 1024 * 1024, 1)));

    worker.store(pos, None).wait().unwrap();

    assert!(!external.exists());
    assert_eq!(worker.load(pos).wait().unwrap(), None);
    worker.close().unwrap();
}

// =============================================================================
// Synchronize Tests
// =============================================================================

#[test]
fn test_synchronize_waits_for_earlier_stores() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());

    let tickets: Vec<_> = (0..50)
        .map(|i| worker.store(ChunkPos::new(i, -i), Some(patterned(3000, i as u8))))
        .collect();
    worker.synchronize(true).wait().unwrap();

    for ticket in &tickets {
        assert!(matches!(ticket.try_take(), Some(Ok(()))));
    }
    worker.close().unwrap();
}

#[test]
fn test_synchronize_with_nothing_pending() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());

    worker.synchronize(false).wait().unwrap();
    worker.synchronize(true).wait().unwrap();
    worker.close().unwrap();
}

#[test]
fn test_synchronize_does_not_wait_for_later_stores() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let gate_key = ChunkPos::new(64, 64);
    worker.store(gate_key, payload("gate")).wait().unwrap();

    let (release, parked) = park_worker(&worker, gate_key);
    let early = worker.store(ChunkPos::new(0, 0), payload("early"));
    let barrier = worker.synchronize(false);
    let late = worker.store(ChunkPos::new(1, 0), payload("late"));
    release.send(()).unwrap();
    parked.wait().unwrap();

    barrier.wait().unwrap();
    assert!(matches!(early.try_take(), Some(Ok(()))));
    late.wait().unwrap();
    worker.close().unwrap();
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_scan_on_disk_record() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let pos = ChunkPos::new(10, 20);

    worker.store(pos, payload("DataVersion=3465;rest")).wait().unwrap();
    worker.synchronize(false).wait().unwrap();

    let prefix = worker.scan(pos, PrefixProbe::new(15)).wait().unwrap().unwrap();
    assert_eq!(prefix.bytes(), b"DataVersion=346");
    worker.close().unwrap();
}

#[test]
fn test_scan_sees_staged_payload() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let pos = ChunkPos::new(10, 20);

    let stored = worker.store(pos, payload("staged bytes"));
    let prefix = worker.scan(pos, PrefixProbe::new(6)).wait().unwrap().unwrap();

    assert_eq!(prefix.into_bytes(), b"staged".to_vec());
    stored.wait().unwrap();
    worker.close().unwrap();
}

#[test]
fn test_scan_absent_chunk_skips_visitor() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());

    let result = worker
        .scan(ChunkPos::new(0, 0), |_payload: &mut dyn Read| -> io::Result<()> {
            panic!("visitor must not run for an absent chunk")
        })
        .wait()
        .unwrap();

    assert!(result.is_none());
    worker.close().unwrap();
}

#[test]
fn test_scan_visitor_error_is_reported() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let pos = ChunkPos::new(5, 5);
    worker.store(pos, payload("anything")).wait().unwrap();

    let result = worker
        .scan(pos, |_payload: &mut dyn Read| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected tag"))
        })
        .wait();

    match result {
        Err(StorageError::Scan { pos: failed, reason }) => {
            assert_eq!(failed, pos);
            assert!(reason.contains("unexpected tag"));
        }
        Err(other) => panic!("expected scan error, got {other:?}"),
        Ok(_) => panic!("expected scan error, got a visitor back"),
    }

    // The worker is unaffected
    assert_eq!(worker.load(pos).wait().unwrap(), payload("anything"));
    worker.close().unwrap();
}

#[test]
fn test_panicking_visitor_keeps_worker_alive() {
    let temp = TempDir::new().unwrap();
    let pos = ChunkPos::new(5, 5);
    {
        let worker = open_worker(temp.path());
        let staged = worker.store(pos, payload("staged"));

        let result = worker
            .scan(pos, |_payload: &mut dyn Read| -> io::Result<()> {
                panic!("visitor blew up")
            })
            .wait();
        match result {
            Err(StorageError::Scan { pos: failed, reason }) => {
                assert_eq!(failed, pos);
                assert!(reason.contains("panicked"));
            }
            Err(other) => panic!("expected scan error, got {other:?}"),
            Ok(_) => panic!("expected scan error, got a visitor back"),
        }

        staged.wait().unwrap();
        assert_eq!(worker.load(pos).wait().unwrap(), payload("staged"));
        worker.close().unwrap();
    }

    let worker = open_worker(temp.path());
    assert_eq!(worker.load(pos).wait().unwrap(), payload("staged"));
}

// =============================================================================
// Exists Tests
// =============================================================================

#[test]
fn test_exists_tracks_staged_and_stored() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    let pos = ChunkPos::new(-1, -1);

    assert!(!worker.exists(pos).wait().unwrap());

    let stored = worker.store(pos, payload("x"));
    assert!(worker.exists(pos).wait().unwrap());
    stored.wait().unwrap();
    assert!(worker.exists(pos).wait().unwrap());

    worker.store(pos, None).wait().unwrap();
    assert!(!worker.exists(pos).wait().unwrap());
    worker.close().unwrap();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_requests_after_close_are_refused() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());
    worker.close().unwrap();

    let pos = ChunkPos::new(0, 0);
    assert!(matches!(worker.load(pos).wait(), Err(StorageError::Closed)));
    assert!(matches!(worker.store(pos, payload("late")).wait(), Err(StorageError::Closed)));
    assert!(matches!(worker.synchronize(true).wait(), Err(StorageError::Closed)));
}

#[test]
fn test_close_twice_is_noop() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());

    worker.close().unwrap();
    worker.close().unwrap();
}

#[test]
fn test_close_applies_staged_writes() {
    let temp = TempDir::new().unwrap();
    {
        let worker = open_worker(temp.path());
        for i in 0..200 {
            drop(worker.store(ChunkPos::new(i, 0), Some(patterned(1000, i as u8))));
        }
        worker.close().unwrap();
    }

    let worker = open_worker(temp.path());
    for i in 0..200 {
        let loaded = worker.load(ChunkPos::new(i, 0)).wait().unwrap();
        assert_eq!(loaded, Some(patterned(1000, i as u8)));
    }
}

#[test]
fn test_drop_closes_worker() {
    let temp = TempDir::new().unwrap();
    {
        let worker = open_worker(temp.path());
        drop(worker.store(ChunkPos::new(4, 4), payload("dropped")));
    }

    let worker = open_worker(temp.path());
    assert_eq!(worker.load(ChunkPos::new(4, 4)).wait().unwrap(), payload("dropped"));
}

#[test]
fn test_wait_timeout_returns_result() {
    let temp = TempDir::new().unwrap();
    let worker = open_worker(temp.path());

    let ticket = worker.load(ChunkPos::new(0, 0));
    let result = ticket.wait_timeout(Duration::from_secs(10));

    assert!(matches!(result, Some(Ok(None))));
    worker.close().unwrap();
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_io_failure_reported_and_worker_continues() {
    let temp = TempDir::new().unwrap();
    let blocker = temp.path().join("not-a-dir");
    fs::write(&blocker, b"file in the way").unwrap();
    let worker = open_worker(&blocker);
    let pos = ChunkPos::new(0, 0);

    let result = worker.store(pos, payload("nowhere to go")).wait();
    assert!(matches!(result, Err(StorageError::Io(_))));

    // The failed write is gone and the worker keeps serving requests
    assert_eq!(worker.load(pos).wait().unwrap(), None);
    worker.synchronize(false).wait().unwrap();
    worker.close().unwrap();
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_callers() {
    let temp = TempDir::new().unwrap();
    let worker = Arc::new(open_worker(temp.path()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let worker = Arc::clone(&worker);
            thread::spawn(move || {
                for i in 0..64 {
                    let pos = ChunkPos::new(i, t * 40);
                    worker
                        .store(pos, payload(&format!("thread {t} chunk {i}")))
                        .wait()
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..64 {
            let loaded = worker.load(ChunkPos::new(i, t * 40)).wait().unwrap();
            assert_eq!(loaded, payload(&format!("thread {t} chunk {i}")));
        }
    }
    worker.close().unwrap();
}
