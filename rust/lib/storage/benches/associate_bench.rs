use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use domobj_core::{ObjectId, Timestamp};
use domobj_storage::{
    InMemoryStorageProvider, MultiIdAssociateCommand, MultipleObjectLoadCommand, RedbStorageProvider,
    StorageProvider, StorageProviderCommand, StorageRecord,
};

fn ids(n: i64) -> Vec<ObjectId> {
    (0..n).map(|i| ObjectId::int("Order", i)).collect()
}

fn seed(store: &dyn Fn(StorageRecord), n: i64) {
    for id in ids(n) {
        store(StorageRecord::new(id, Timestamp::INITIAL).with_value("OrderNumber", 42i64));
    }
}

fn bench_memory_associate(c: &mut Criterion) {
    let store = InMemoryStorageProvider::new();
    seed(&|r| store.insert(r).unwrap(), 1000);

    // Every other id is missing, plus a repeated tail.
    let mut requested: Vec<_> = (0..2000).step_by(2).map(|i| ObjectId::int("Order", i)).collect();
    requested.extend(ids(100));

    c.bench_function("memory_multi_associate_1100", |b| {
        b.iter(|| {
            let command = MultiIdAssociateCommand::new(
                requested.clone(),
                MultipleObjectLoadCommand::new(&requested),
            );
            let results = command.execute(black_box(&store)).unwrap();
            assert_eq!(results.len(), 1100);
        });
    });
}

fn bench_redb_load(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let store = RedbStorageProvider::open(&tmp.path().join("bench.redb")).unwrap();
    seed(&|r| store.insert(&r).unwrap(), 1000);
    let requested = ids(1000);

    c.bench_function("redb_load_1000", |b| {
        b.iter(|| {
            let records = store.load(black_box(&requested)).unwrap();
            assert_eq!(records.len(), 1000);
        });
    });
}

criterion_group!(benches, bench_memory_associate, bench_redb_load);
criterion_main!(benches);
