use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shadestore::{Options, ShadeStore};
use tempfile::TempDir;

fn open(dir: &TempDir) -> ShadeStore {
    Options::new()
        .page_size(4096)
        .open(dir.path().join("bench.shade"))
        .unwrap()
}

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_100b", |b| {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let data = vec![b'x'; 100];

        let mut counter = 0u64;
        b.iter(|| {
            db.put(&key(counter), black_box(&data)).unwrap();
            counter += 1;
        });
    });

    group.bench_function("put_batch_100", |b| {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let data = vec![b'x'; 100];

        let mut counter = 0u64;
        b.iter(|| {
            db.update(|tx| {
                for _ in 0..100 {
                    tx.put(&key(counter), &data)?;
                    counter += 1;
                }
                Ok(())
            })
            .unwrap();
        });
    });
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_100b", |b| {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let data = vec![b'x'; 100];

        // Pre-populate with 10k keys
        db.update(|tx| {
            for i in 0..10_000 {
                tx.put(&key(i), &data)?;
            }
            Ok(())
        })
        .unwrap();

        let mut counter = 0u64;
        b.iter(|| {
            black_box(db.get(&key(counter % 10_000)).unwrap());
            counter += 7;
        });
    });

    group.bench_function("scan_10k", |b| {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.update(|tx| {
            for i in 0..10_000 {
                tx.put(&key(i), b"v")?;
            }
            Ok(())
        })
        .unwrap();

        b.iter(|| {
            let mut cursor = db.first_cursor().unwrap();
            let mut count = 0;
            while cursor.key().is_some() {
                count += 1;
                cursor.next().unwrap();
            }
            black_box(count)
        });
    });
    group.finish();
}

fn bench_mixed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("50_read_50_write", |b| {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let data = vec![b'x'; 100];

        // Pre-populate with 1000 keys
        db.update(|tx| {
            for i in 0..1000 {
                tx.put(&key(i), &data)?;
            }
            Ok(())
        })
        .unwrap();

        let mut counter = 0u64;
        b.iter(|| {
            if counter % 2 == 0 {
                black_box(db.get(&key(counter % 1000)).ok());
            } else {
                black_box(db.put(&key(counter % 1000), &data).ok());
            }
            counter += 1;
        });
    });
    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_mixed_workload);
criterion_main!(benches);
