use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::hint::black_box;
use std::time::Duration;
use tabsync::{Broadcaster, CacheManager, GetOptions, Origin, StoredRecord};
use tokio::runtime::Runtime;

fn seeded_manager(rt: &Runtime) -> CacheManager {
    rt.block_on(async {
        let origin = Origin::in_memory();
        let tab = origin.attach();
        let broadcaster = Broadcaster::new(&tab);
        let manager = CacheManager::new(tab, broadcaster);
        manager
            .get::<Value, _, _>(
                "hot",
                || async { Ok(json!({"rows": [1, 2, 3, 4, 5]})) },
                Duration::from_secs(3600),
                GetOptions::default(),
            )
            .await
            .expect("seed entry");
        manager
    })
}

fn bench_cache_hit(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let manager = seeded_manager(&rt);

    c.bench_function("cache/get_hit", |b| {
        b.to_async(&rt).iter(|| {
            let manager = manager.clone();
            async move {
                let fetched = manager
                    .get::<Value, _, _>(
                        "hot",
                        || async { Ok(json!(null)) },
                        Duration::from_secs(3600),
                        GetOptions::default(),
                    )
                    .await
                    .expect("cache hit");
                black_box(fetched.version);
            }
        });
    });
}

fn bench_refresh_write(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let manager = seeded_manager(&rt);

    c.bench_function("cache/refresh_write", |b| {
        b.to_async(&rt).iter(|| {
            let manager = manager.clone();
            async move {
                let fetched = manager
                    .refresh::<Value, _, _>(
                        "hot",
                        || async { Ok(json!({"rows": [1, 2, 3, 4, 5]})) },
                        Duration::from_secs(3600),
                    )
                    .await
                    .expect("refresh");
                black_box(fetched.version);
            }
        });
    });
}

fn bench_record_parse(c: &mut Criterion) {
    let raw = StoredRecord {
        data: json!({"monday": ["ada", "grace"], "tuesday": ["linus"]}),
        timestamp: 1_700_000_000_000,
        expires_at: 1_700_000_600_000,
        version: 3,
    }
    .to_json()
    .expect("serialize record");

    c.bench_function("cache/record_parse", |b| {
        b.iter(|| {
            let record = StoredRecord::parse(black_box(&raw)).expect("parse record");
            black_box(record.version);
        });
    });
}

criterion_group!(benches, bench_cache_hit, bench_refresh_write, bench_record_parse);
criterion_main!(benches);
