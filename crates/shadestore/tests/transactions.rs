mod common;

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use shadestore::{Error, ErrorCode, Options, ShadeStore};
use tempfile::TempDir;

use common::{db_path, open_db, reopen, scan};

/// Overwrite part of the meta slot written by the commit of `generation`.
fn tear_meta(dir: &TempDir, generation: u64, page_size: u64) {
    let mut file = OpenOptions::new().write(true).open(db_path(dir)).unwrap();
    let slot = generation % 2;
    file.seek(SeekFrom::Start(slot * page_size + 20)).unwrap();
    file.write_all(&[0xAB; 8]).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn test_reopen_keeps_committed_data() {
    let (dir, db) = open_db();
    db.update(|tx| {
        for i in 0..500u32 {
            tx.put(format!("k{i:03}").as_bytes(), format!("v{i}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    db.delete(b"k100").unwrap();
    let generation = db.stats().generation;
    db.close().unwrap();

    let db = reopen(&dir);
    assert_eq!(db.stats().generation, generation);
    assert_eq!(db.get(b"k499").unwrap(), Some(b"v499".to_vec()));
    assert_eq!(db.get(b"k100").unwrap(), None);
    assert_eq!(scan(&db).len(), 499);
    db.begin_tx().verify().unwrap();
}

#[test]
fn test_torn_meta_falls_back_to_previous_generation() {
    let (dir, db) = open_db();
    db.put(b"stable", b"old").unwrap();
    db.update(|tx| {
        tx.put(b"stable", b"new")?;
        tx.put(b"extra", b"1")?;
        Ok(())
    })
    .unwrap();
    let stats = db.stats();
    drop(db);

    // The last commit's data pages are on disk but its meta write is torn.
    tear_meta(&dir, stats.generation, stats.page_size as u64);

    let db = reopen(&dir);
    assert_eq!(db.stats().generation, stats.generation - 1);
    assert_eq!(db.get(b"stable").unwrap(), Some(b"old".to_vec()));
    assert_eq!(db.get(b"extra").unwrap(), None);
    db.begin_tx().verify().unwrap();

    // Writing on top of the recovered generation works normally.
    db.put(b"after", b"crash").unwrap();
    drop(db);
    let db = reopen(&dir);
    assert_eq!(db.get(b"after").unwrap(), Some(b"crash".to_vec()));
    assert_eq!(db.get(b"stable").unwrap(), Some(b"old".to_vec()));
}

#[test]
fn test_both_meta_slots_torn() {
    let (dir, db) = open_db();
    db.put(b"a", b"1").unwrap();
    let stats = db.stats();
    drop(db);

    tear_meta(&dir, 0, stats.page_size as u64);
    tear_meta(&dir, 1, stats.page_size as u64);

    let err = ShadeStore::open(db_path(&dir)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileUnexpected);
}

#[test]
fn test_rejects_foreign_file() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    std::fs::write(db_path(&dir), b"this is not a database file").unwrap();

    let err = ShadeStore::open(db_path(&dir)).unwrap_err();
    assert!(matches!(err, Error::FileUnexpected(_)));
}

#[test]
fn test_rollback_on_drop() {
    let (_dir, db) = open_db();
    db.put(b"keep", b"1").unwrap();
    let before = db.stats();

    {
        let mut tx = db.begin_tx_mut();
        tx.put(b"keep", b"2").unwrap();
        tx.put(b"temp", b"x").unwrap();
        assert_eq!(tx.get(b"temp").unwrap(), Some(b"x".to_vec()));
        assert!(tx.contains(b"temp").unwrap());
    }

    let mut tx = db.begin_tx_mut();
    tx.put(b"temp", b"y").unwrap();
    tx.rollback();

    assert_eq!(db.get(b"keep").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"temp").unwrap(), None);

    let after = db.stats();
    assert_eq!(after.generation, before.generation);
    assert_eq!(after.page_count, before.page_count);
    assert_eq!(after.rollbacks, before.rollbacks + 2);
}

#[test]
fn test_update_error_rolls_back() {
    let (_dir, db) = open_db();

    let result: shadestore::Result<()> = db.update(|tx| {
        tx.put(b"a", b"1")?;
        tx.put(&[0u8; 300], b"too long")?;
        Ok(())
    });
    assert!(matches!(result, Err(Error::KeyTooLarge(300))));
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(db.stats().generation, 0);
}

#[test]
fn test_reader_isolated_from_later_commit() {
    let (_dir, db) = open_db();
    db.put(b"counter", b"0").unwrap();

    let read_started = Barrier::new(2);
    let write_done = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let tx = db.begin_tx();
            read_started.wait();
            write_done.wait();
            // The commit happened after this snapshot was taken.
            assert_eq!(tx.get(b"counter").unwrap(), Some(b"0".to_vec()));
            assert!(!tx.contains(b"new").unwrap());

            let mut cursor = tx.first_cursor().unwrap();
            assert_eq!(cursor.key(), Some(&b"counter"[..]));
            assert!(!cursor.next().unwrap());
        });

        read_started.wait();
        db.update(|tx| {
            tx.put(b"counter", b"1")?;
            tx.put(b"new", b"value")
        })
        .unwrap();
        write_done.wait();
    });

    assert_eq!(db.get(b"counter").unwrap(), Some(b"1".to_vec()));
    assert!(db.contains(b"new").unwrap());
}

#[test]
fn test_uncommitted_changes_invisible() {
    let (_dir, db) = open_db();
    db.put(b"k", b"committed").unwrap();

    let mut tx = db.begin_tx_mut();
    tx.put(b"k", b"staged").unwrap();

    // Readers started during the write see the last commit.
    let reader = db.begin_tx();
    assert_eq!(reader.get(b"k").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(db.get(b"k").unwrap(), Some(b"committed".to_vec()));

    tx.commit().unwrap();
    assert_eq!(reader.get(b"k").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(db.get(b"k").unwrap(), Some(b"staged".to_vec()));
}

#[test]
fn test_single_writer() {
    let (_dir, db) = open_db();

    let tx = db.begin_tx_mut();
    assert!(db.try_begin_tx_mut().is_none());

    let acquired = AtomicBool::new(false);
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let mut tx = db.begin_tx_mut();
            acquired.store(true, Ordering::SeqCst);
            tx.put(b"second", b"writer").unwrap();
            tx.commit().unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(tx);
        waiter.join().unwrap();
    });

    assert!(acquired.load(Ordering::SeqCst));
    assert!(db.try_begin_tx_mut().is_some());
    assert_eq!(db.get(b"second").unwrap(), Some(b"writer".to_vec()));
}

#[test]
fn test_concurrent_writers_and_readers() {
    let (_dir, db) = open_db();
    let db = Arc::new(db);

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..100u32 {
                    let key = format!("t{t}-{i:03}");
                    db.put(key.as_bytes(), &i.to_le_bytes()).unwrap();
                    // Every snapshot a reader takes is a consistent tree.
                    if i % 25 == 0 {
                        db.begin_tx().verify().unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(scan(&db).len(), 400);
    assert_eq!(db.get(b"t3-099").unwrap(), Some(99u32.to_le_bytes().to_vec()));
    assert_eq!(db.stats().commits, 400);
}

#[test]
fn test_view_and_stats() {
    let (_dir, db) = open_db();
    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();

    let count = db
        .view(|tx| {
            let mut cursor = tx.first_cursor()?;
            let mut count = 0;
            while cursor.key().is_some() {
                count += 1;
                cursor.next()?;
            }
            Ok(count)
        })
        .unwrap();
    assert_eq!(count, 2);

    let stats = db.stats();
    assert_eq!(stats.generation, 2);
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.active_readers, 0);
    assert!(stats.pages_written >= 4);
    assert!(stats.pool_hits + stats.pool_misses > 0);

    let json = serde_json::to_value(stats).unwrap();
    assert_eq!(json["generation"], 2);
}

#[test]
fn test_force_sync_commits() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let db = Options::new()
        .page_size(4096)
        .force_sync(true)
        .mempool_capacity(0)
        .open(db_path(&dir))
        .unwrap();

    db.put(b"durable", b"yes").unwrap();
    assert!(db.options().force_sync);
    assert_eq!(db.stats().pool_hits, 0);
    drop(db);

    assert_eq!(reopen(&dir).get(b"durable").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn test_options_from_json() {
    let options: Options = serde_json::from_str(r#"{ "force_sync": true }"#).unwrap();
    assert!(options.force_sync);
    assert_eq!(options.page_size, None);
    assert_eq!(options.mempool_capacity, shadestore::DEFAULT_MEMPOOL_CAPACITY);

    let json = serde_json::to_string(&Options::new().page_size(8192)).unwrap();
    let back: Options = serde_json::from_str(&json).unwrap();
    assert_eq!(back.page_size, Some(8192));

    let dir = TempDir::new().unwrap();
    for page_size in [5000, 1 << 17] {
        let err = Options::new()
            .page_size(page_size)
            .open(db_path(&dir))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InputInvalid);
    }
    // Rejected options leave no file behind.
    assert!(!db_path(&dir).exists());
}

#[test]
fn test_existing_file_ignores_page_size_option() {
    let (dir, db) = open_db();
    db.put(b"k", b"v").unwrap();
    db.close().unwrap();

    // Not a valid size for a new file, but the file already has one.
    let db = Options::new().page_size(5000).open(db_path(&dir)).unwrap();
    assert_eq!(db.page_size(), 4096);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_force_sync_with_concurrent_readers() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let db = Options::new()
        .page_size(4096)
        .force_sync(true)
        .open(db_path(&dir))
        .unwrap();
    db.put(b"seed", b"0").unwrap();

    let writing = AtomicBool::new(true);
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut reads = 0u32;
            while writing.load(Ordering::SeqCst) || reads == 0 {
                let tx = db.begin_tx();
                assert_eq!(tx.get(b"seed").unwrap(), Some(b"0".to_vec()));
                tx.verify().unwrap();
                reads += 1;
            }
            reads
        });

        for i in 0..30u32 {
            db.put(&i.to_be_bytes(), &[1u8; 64]).unwrap();
        }
        writing.store(false, Ordering::SeqCst);
        assert!(reader.join().unwrap() > 0);
    });

    drop(db);
    let db = reopen(&dir);
    assert_eq!(db.begin_tx().verify().unwrap().entries, 31);
}
